//! Run configuration: the JSON send document, network profiles and the
//! per-run context threaded through the engine.

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use rust_decimal::Decimal;
use serde::Deserialize;

use crate::error::ConfigError;
use crate::model::SendIntent;

pub const DEFAULT_PARALLELISM: usize = 40;
pub const ALGOD_URL_ENV: &str = "ALGO_ALGOD_URL";
pub const ALGOD_TOKEN_ENV: &str = "ALGO_ALGOD_TOKEN";
pub const NFD_URL_ENV: &str = "ALGO_NFD_URL";

/// The `send.json` document.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct BatchSendConfig {
    pub send: SendChoice,
    #[serde(default)]
    pub destination: DestinationChoice,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct SendChoice {
    pub asset: AssetChoice,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct AssetChoice {
    #[serde(alias = "id")]
    pub asa: u64,
    /// Whole units, ie: 1.5 rather than 1500000 for a 6 decimal asset.
    pub amount: Decimal,
    #[serde(rename = "isPerRecip", alias = "isPerRecipient", default)]
    pub is_per_recip: bool,
    #[serde(default)]
    pub note: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DestinationChoice {
    #[serde(rename = "csvfile", alias = "csvFile", default)]
    pub csv_file: String,
    #[serde(default)]
    pub segments_of_root: String,
    #[serde(rename = "randomNFDs", default)]
    pub random_nfds: RandomChoice,
    #[serde(default)]
    pub random_count: Option<usize>,
    #[serde(default)]
    pub only_roots: bool,
    #[serde(default)]
    pub send_to_vaults: bool,
    #[serde(default)]
    pub verified_requirements: Vec<String>,
    #[serde(default)]
    pub allow_duplicate_accounts: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct RandomChoice {
    #[serde(default)]
    pub count: usize,
}

impl DestinationChoice {
    pub fn csv_file(&self) -> Option<&Path> {
        (!self.csv_file.is_empty()).then(|| Path::new(self.csv_file.as_str()))
    }

    pub fn segments_of_root(&self) -> Option<&str> {
        (!self.segments_of_root.is_empty()).then_some(self.segments_of_root.as_str())
    }

    /// Maximum recipients to pick at random. `None` means everyone eligible.
    pub fn max_recipients(&self) -> Option<usize> {
        self.random_count
            .or(Some(self.random_nfds.count))
            .filter(|count| *count > 0)
    }
}

impl fmt::Display for DestinationChoice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut parts = Vec::new();
        if let Some(csv) = self.csv_file() {
            parts.push(format!("csvfile={}", csv.display()));
        }
        if self.send_to_vaults {
            parts.push("sending TO vaults".to_string());
        }
        if let Some(root) = self.segments_of_root() {
            parts.push(format!("segments of root: {}", root));
        }
        if self.only_roots {
            parts.push("roots only".to_string());
        }
        if let Some(count) = self.max_recipients() {
            parts.push(format!("limited to a maximum of {} recipients", count));
        }
        if !self.verified_requirements.is_empty() {
            parts.push(format!(
                "verified requirements: {}",
                self.verified_requirements.join(",")
            ));
        }
        if parts.is_empty() {
            return f.write_str("all owned NFDs");
        }
        f.write_str(&parts.join(", "))
    }
}

impl BatchSendConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config: Self = serde_json::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let asset = &self.send.asset;
        if asset.asa == 0 {
            return Err(ConfigError::Invalid("send.asset.asa must be set".into()));
        }
        if asset.amount <= Decimal::ZERO {
            return Err(ConfigError::Invalid(format!(
                "send.asset.amount must be positive, got {}",
                asset.amount
            )));
        }
        if self.destination.segments_of_root().is_some() && self.destination.only_roots {
            return Err(ConfigError::Invalid(
                "segmentsOfRoot cannot be combined with onlyRoots".into(),
            ));
        }
        Ok(())
    }

    pub fn to_intent(&self, source_is_vault: bool) -> SendIntent {
        let asset = &self.send.asset;
        SendIntent {
            asset_id: asset.asa,
            amount: asset.amount,
            is_per_recipient: asset.is_per_recip,
            note: asset.note.clone(),
            source_is_vault,
            destination_is_vault: self.destination.send_to_vaults,
        }
    }
}

/// Endpoints for one network.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkConfig {
    pub name: String,
    pub algod_url: String,
    pub algod_token: String,
    pub nfd_api_url: String,
}

impl NetworkConfig {
    /// Public endpoints for `mainnet`, `testnet` or `betanet`.
    pub fn for_network(name: &str) -> Result<Self, ConfigError> {
        let (algod, nfd) = match name {
            "mainnet" => (
                "https://mainnet-api.algonode.cloud",
                "https://api.nf.domains",
            ),
            "testnet" => (
                "https://testnet-api.algonode.cloud",
                "https://api.testnet.nf.domains",
            ),
            "betanet" => (
                "https://betanet-api.algonode.cloud",
                "https://api.betanet.nf.domains",
            ),
            other => return Err(ConfigError::UnknownNetwork(other.to_string())),
        };
        Ok(Self {
            name: name.to_string(),
            algod_url: algod.to_string(),
            algod_token: String::new(),
            nfd_api_url: nfd.to_string(),
        })
    }

    /// Apply `ALGO_ALGOD_URL`, `ALGO_ALGOD_TOKEN` and `ALGO_NFD_URL` overrides.
    pub fn with_overrides<F>(mut self, lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let non_empty = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        if let Some(url) = non_empty(ALGOD_URL_ENV) {
            self.algod_url = url;
        }
        if let Some(token) = non_empty(ALGOD_TOKEN_ENV) {
            self.algod_token = token;
        }
        if let Some(url) = non_empty(NFD_URL_ENV) {
            self.nfd_api_url = url;
        }
        self
    }

    pub fn from_env(name: &str) -> Result<Self, ConfigError> {
        Ok(Self::for_network(name)?.with_overrides(|key| std::env::var(key).ok()))
    }
}

/// Per-run settings handed to the engine's constructors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunContext {
    pub parallelism: usize,
    pub dry_run: bool,
    pub output_dir: PathBuf,
}

impl Default for RunContext {
    fn default() -> Self {
        Self {
            parallelism: DEFAULT_PARALLELISM,
            dry_run: false,
            output_dir: PathBuf::from("."),
        }
    }
}
