//! NFD directory port.
//!
//! [`DirectoryClient`] is what the resolver and the vault send path consume.
//! [`NfdApiClient`] implements it over the public NFD REST API. Eligibility
//! rules that are evaluated off-chain against fetched records live in
//! [`eligibility`].

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde::Serialize;

use crate::error::DirectoryError;
use crate::model::CandidateRecord;

pub mod eligibility;
mod http;

pub use http::NfdApiClient;

pub type DirectoryResult<T> = Result<T, DirectoryError>;

/// How much of each record the API should return.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum View {
    #[default]
    Brief,
    /// Includes verified properties.
    Full,
}

impl View {
    pub fn as_str(&self) -> &'static str {
        match self {
            View::Brief => "brief",
            View::Full => "full",
        }
    }
}

/// One page of an owned-record search.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SearchQuery {
    /// Restrict to segments of this root app.
    pub parent_app_id: Option<u64>,
    /// Only records carrying the `pristine` (root) trait.
    pub only_roots: bool,
    pub view: View,
    pub limit: u32,
    pub offset: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SendFromVaultRequest {
    pub amount: u64,
    pub assets: Vec<u64>,
    pub receiver: String,
    /// `"account"` or `"nfdVault"`.
    pub receiver_type: String,
    /// Owner of the vault.
    pub sender: String,
    pub note: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SendToVaultRequest {
    pub amount: u64,
    pub assets: Vec<u64>,
    pub sender: String,
    pub note: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnvelopeKind {
    Unsigned,
    /// Already signed by the API (ie: a logic-sig transaction). Passed through untouched.
    Presigned,
}

/// One transaction of a group returned by the vault send endpoints.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxnEnvelope {
    pub kind: EnvelopeKind,
    pub bytes: Vec<u8>,
}

/// Parse the `[["u"|"s", "<base64>"], ...]` list returned by the vault
/// endpoints. The list may itself arrive JSON-encoded inside a string.
pub fn parse_envelopes(body: &str) -> DirectoryResult<Vec<TxnEnvelope>> {
    let pairs: Vec<(String, String)> = match serde_json::from_str(body) {
        Ok(pairs) => pairs,
        Err(_) => {
            let inner: String = serde_json::from_str(body)
                .map_err(|e| DirectoryError::Other(format!("unexpected transaction list: {}", e)))?;
            serde_json::from_str(&inner)
                .map_err(|e| DirectoryError::Other(format!("unexpected transaction list: {}", e)))?
        }
    };
    pairs
        .into_iter()
        .map(|(kind, encoded)| {
            let bytes = STANDARD
                .decode(encoded.as_bytes())
                .map_err(|e| DirectoryError::Other(format!("bad transaction encoding: {}", e)))?;
            let kind = if kind == "s" {
                EnvelopeKind::Presigned
            } else {
                EnvelopeKind::Unsigned
            };
            Ok(TxnEnvelope { kind, bytes })
        })
        .collect()
}

/// Directory service operations. Safe for concurrent use.
#[async_trait]
pub trait DirectoryClient: Send + Sync {
    async fn get_record(&self, name: &str, view: View) -> DirectoryResult<CandidateRecord>;

    /// One page of owned records. An empty page means the end.
    async fn search(&self, query: &SearchQuery) -> DirectoryResult<Vec<CandidateRecord>>;

    async fn send_from_vault(
        &self,
        vault: &str,
        request: &SendFromVaultRequest,
    ) -> DirectoryResult<Vec<TxnEnvelope>>;

    async fn send_to_vault(
        &self,
        name: &str,
        request: &SendToVaultRequest,
    ) -> DirectoryResult<Vec<TxnEnvelope>>;
}
