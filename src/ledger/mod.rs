//! Ledger (algod) port and the types it trades in.
//!
//! [`LedgerClient`] is implemented over HTTP by [`AlgodClient`]; tests use an
//! in-memory fake. Transaction encoding lives in [`txn`].

use async_trait::async_trait;

use crate::error::LedgerError;
use crate::retry::{retry_until_ok, RetryPolicy};

mod algod;
pub mod txn;

pub use algod::AlgodClient;

pub type LedgerResult<T> = Result<T, LedgerError>;

/// Validity window given to every transaction.
pub const DEFAULT_VALID_ROUND_RANGE: u64 = 100;

/// Network parameters needed to build a transaction. Handed to workers by value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SuggestedParams {
    /// Flat fee per transaction, microAlgo.
    pub fee: u64,
    pub min_fee: u64,
    pub first_valid: u64,
    pub last_valid: u64,
    pub genesis_id: String,
    pub genesis_hash: [u8; 32],
}

impl SuggestedParams {
    /// Build from what the node reports. First-valid is moved back one round so a
    /// node slightly behind still accepts the transaction, the fee is the flat
    /// minimum fee.
    pub fn from_node(last_round: u64, min_fee: u64, genesis_id: String, genesis_hash: [u8; 32]) -> Self {
        let first_valid = last_round.saturating_sub(1);
        Self {
            fee: min_fee,
            min_fee,
            first_valid,
            last_valid: first_valid + DEFAULT_VALID_ROUND_RANGE,
            genesis_id,
            genesis_hash,
        }
    }

    /// Rounds to wait for confirmation before giving up.
    pub fn validity_window(&self) -> u64 {
        self.last_valid.saturating_sub(self.first_valid)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssetParams {
    pub decimals: u32,
    pub unit_name: String,
}

/// Algo balance of an account and the minimum it must keep.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AccountBalance {
    pub amount: u64,
    pub min_balance: u64,
}

impl AccountBalance {
    pub fn spendable(&self) -> u64 {
        self.amount.saturating_sub(self.min_balance)
    }
}

/// Blockchain node operations the dropper consumes. Safe for concurrent use.
#[async_trait]
pub trait LedgerClient: Send + Sync {
    async fn asset_params(&self, asset_id: u64) -> LedgerResult<AssetParams>;

    /// Base-unit holding of `asset_id` in `account`.
    async fn asset_holding(&self, account: &str, asset_id: u64) -> LedgerResult<u64>;

    async fn account_balance(&self, account: &str) -> LedgerResult<AccountBalance>;

    async fn suggested_params(&self) -> LedgerResult<SuggestedParams>;

    /// Submit signed (possibly grouped) transaction bytes, returning the first txid.
    async fn send_raw(&self, signed: &[u8]) -> LedgerResult<String>;

    /// Wait up to `rounds` rounds for `txid`, returning the confirmed round.
    async fn wait_for_confirmation(&self, txid: &str, rounds: u64) -> LedgerResult<u64>;
}

/// Suggested params, retried until the node answers.
pub async fn fresh_params<L>(ledger: &L, policy: &RetryPolicy) -> SuggestedParams
where
    L: LedgerClient + ?Sized,
{
    retry_until_ok(policy, "suggested params", || ledger.suggested_params()).await
}
