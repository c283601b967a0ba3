//! Shared value types flowing through resolution and the transfer pipeline.
//!
//! Everything here is immutable once built. Values that workers read
//! concurrently ([`Recipient`], [`AssetDescriptor`], [`SourceContext`]) are
//! handed around behind `Arc`.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::ledger::SuggestedParams;

/// Asset metadata plus what the source account already holds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssetDescriptor {
    pub asset_id: u64,
    pub decimals: u32,
    pub unit_name: String,
    pub existing_source_balance: u64,
}

/// What the operator asked to send.
#[derive(Debug, Clone, PartialEq)]
pub struct SendIntent {
    pub asset_id: u64,
    /// Whole (user-facing) units, total or per recipient.
    pub amount: Decimal,
    pub is_per_recipient: bool,
    pub note: String,
    pub source_is_vault: bool,
    pub destination_is_vault: bool,
}

/// `properties` block of a directory record.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordProperties {
    #[serde(default)]
    pub internal: HashMap<String, String>,
    #[serde(default)]
    pub verified: HashMap<String, String>,
}

/// A directory (NFD) record as returned by the search and fetch endpoints.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CandidateRecord {
    pub name: String,
    #[serde(rename = "appID", default)]
    pub app_id: u64,
    #[serde(default)]
    pub owner: String,
    #[serde(default)]
    pub deposit_account: String,
    /// The record's vault account.
    #[serde(default)]
    pub nfd_account: String,
    #[serde(default)]
    pub properties: RecordProperties,
}

impl CandidateRecord {
    /// Contract version, ie: `"2.11"`.
    pub fn protocol_version(&self) -> Option<&str> {
        self.properties.internal.get("ver").map(String::as_str)
    }

    pub fn vault_opt_in_lock(&self) -> Option<&str> {
        self.properties
            .internal
            .get("vaultOptInLocked")
            .map(String::as_str)
    }

    pub fn has_verified(&self, key: &str) -> bool {
        self.properties.verified.contains_key(key)
    }
}

/// A resolved destination. `destination_account` is never empty.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct Recipient {
    pub display_name: String,
    pub owner_account: String,
    pub destination_account: String,
    pub destination_is_vault: bool,
}

/// Who signs, and which vault (if any) the asset leaves from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceContext {
    /// Signing account. Pays all fees.
    pub sender: String,
    /// Account the asset is debited from (the vault account when sending from a vault).
    pub source_account: String,
    pub vault_name: Option<String>,
}

impl SourceContext {
    pub fn is_vault(&self) -> bool {
        self.vault_name.is_some()
    }
}

/// One (asset, recipient) send. Owned by exactly one worker.
#[derive(Debug, Clone)]
pub struct TransferUnit {
    pub recipient: Arc<Recipient>,
    pub asset: Arc<AssetDescriptor>,
    pub base_units: u64,
    pub note: Arc<str>,
    pub params: SuggestedParams,
    pub source: Arc<SourceContext>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferStatus {
    Confirmed { round: u64, txid: String },
    /// Dry run: what would have been sent.
    Simulated,
    Failed(String),
}

/// Result of one [`TransferUnit`]. Self-contained so it can be written in
/// completion order.
#[derive(Debug, Clone)]
pub struct TransferOutcome {
    pub recipient: Arc<Recipient>,
    pub asset: Arc<AssetDescriptor>,
    pub base_units: u64,
    pub status: TransferStatus,
}

impl TransferOutcome {
    pub fn is_success(&self) -> bool {
        !matches!(self.status, TransferStatus::Failed(_))
    }
}

impl fmt::Display for TransferOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.recipient.destination_is_vault {
            write!(f, "Recipient: {} VAULT, ", self.recipient.display_name)?;
        } else {
            write!(f, "Recipient: {} (DEPOSIT), ", self.recipient.display_name)?;
        }
        write!(
            f,
            "Account: {}, Asset ID: {}, Amount: {} {}, ",
            self.recipient.destination_account,
            self.asset.asset_id,
            self.asset.format_amount(self.base_units),
            self.asset.unit_name,
        )?;
        match &self.status {
            TransferStatus::Confirmed { round, txid } => {
                write!(f, "Success: Round {}, TxID {}", round, txid)
            }
            TransferStatus::Simulated => write!(f, "DryRun: not submitted"),
            // log lines must stay single-line
            TransferStatus::Failed(err) => write!(f, "Error: {}", err.replace(['\n', '\r'], " ")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn outcome(status: TransferStatus) -> TransferOutcome {
        TransferOutcome {
            recipient: Arc::new(Recipient {
                display_name: "alice.algo".into(),
                owner_account: "OWNER".into(),
                destination_account: "DEST".into(),
                destination_is_vault: false,
            }),
            asset: Arc::new(AssetDescriptor {
                asset_id: 42,
                decimals: 2,
                unit_name: "TKN".into(),
                existing_source_balance: 0,
            }),
            base_units: 150,
            status,
        }
    }

    #[test]
    fn test_record_deserializes_api_shape() {
        let json = r#"{
            "name": "bob.algo",
            "appID": 7,
            "owner": "OWN",
            "depositAccount": "DEP",
            "nfdAccount": "VAULT",
            "properties": {
                "internal": {"ver": "2.11", "vaultOptInLocked": "0"},
                "verified": {"twitter": "bob"},
                "userDefined": {"website": "https://bob.example"}
            }
        }"#;
        let record: CandidateRecord = serde_json::from_str(json).unwrap();
        assert_eq!(record.app_id, 7);
        assert_eq!(record.nfd_account, "VAULT");
        assert_eq!(record.protocol_version(), Some("2.11"));
        assert_eq!(record.vault_opt_in_lock(), Some("0"));
        assert!(record.has_verified("twitter"));
        assert!(!record.has_verified("discord"));
    }

    #[test]
    fn test_record_tolerates_brief_view() {
        let record: CandidateRecord =
            serde_json::from_str(r#"{"name": "x.algo", "owner": "O"}"#).unwrap();
        assert!(record.deposit_account.is_empty());
        assert_eq!(record.protocol_version(), None);
    }

    #[test]
    fn test_outcome_line_is_single_line() {
        let line = outcome(TransferStatus::Failed("boom\nsecond line".into())).to_string();
        assert!(!line.contains('\n'));
        assert!(line.contains("Error: boom second line"));
        assert!(line.starts_with("Recipient: alice.algo (DEPOSIT)"));
    }

    #[test]
    fn test_outcome_success_line() {
        let line = outcome(TransferStatus::Confirmed {
            round: 1000,
            txid: "TXID".into(),
        })
        .to_string();
        assert!(line.contains("Amount: 1.50 TKN"));
        assert!(line.ends_with("Success: Round 1000, TxID TXID"));
    }
}
