//! Error types for each seam of the dropper.
//!
//! - [`DirectoryError`] - NFD directory API failures, tagged so the retry
//!   layer can tell rate limits from permanent API errors
//! - [`LedgerError`] - algod failures, with [`LedgerError::is_transient`]
//! - [`SignerError`] - key lookup and encoding failures
//! - [`TransferError`] - terminal failure of a single transfer unit
//! - [`ConfigError`], [`ResolveError`], [`BalanceError`], [`SinkError`]
//! - [`DropError`] - what can abort the balance check or a running batch

use std::path::PathBuf;

use thiserror::Error;

/// Failures returned by a [`crate::directory::DirectoryClient`].
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DirectoryError {
    /// Server asked us to back off for `secs_remaining` seconds.
    #[error("rate limited, {secs_remaining}s remaining")]
    RateLimited { secs_remaining: u64 },

    /// Well-formed error payload. Not retried.
    #[error("directory api error: {message}")]
    Api { message: String },

    /// Connection resets, 5xx, timeouts.
    #[error("transient directory failure: {0}")]
    Transient(String),

    #[error("directory failure: {0}")]
    Other(String),
}

/// Failures returned by a [`crate::ledger::LedgerClient`].
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum LedgerError {
    #[error("node rate limited the request (429)")]
    RateLimited,

    #[error("node unavailable (status {status})")]
    Unavailable { status: u16 },

    #[error("node rejected request (status {status}): {message}")]
    Rejected { status: u16, message: String },

    #[error("transaction rejected from pool: {0}")]
    PoolError(String),

    #[error("transaction {txid} not confirmed within {rounds} rounds")]
    ConfirmationTimeout { txid: String, rounds: u64 },

    #[error("transport error: {0}")]
    Transport(String),

    #[error("unexpected response: {0}")]
    Decode(String),
}

impl LedgerError {
    /// Whether the call is worth retrying with backoff.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            LedgerError::RateLimited | LedgerError::Unavailable { .. } | LedgerError::Transport(_)
        )
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SignerError {
    #[error("no key material available for account {0}")]
    UnknownAccount(String),

    #[error("invalid mnemonic: {0}")]
    InvalidMnemonic(String),

    #[error("invalid address: {0}")]
    InvalidAddress(String),

    #[error("encoding error: {0}")]
    Encoding(String),
}

/// Why one transfer unit ended up in the failure log.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransferError {
    #[error("directory: {0}")]
    Directory(#[from] DirectoryError),

    #[error("ledger: {0}")]
    Ledger(#[from] LedgerError),

    #[error("signer: {0}")]
    Signer(#[from] SignerError),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("invalid configuration: {0}")]
    Invalid(String),

    #[error("unknown network: {0}")]
    UnknownNetwork(String),
}

#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("directory lookup for {what} failed: {source}")]
    Directory {
        what: String,
        #[source]
        source: DirectoryError,
    },

    #[error("csv file {path}: {message}")]
    Csv { path: PathBuf, message: String },
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum BalanceError {
    #[error(
        "insufficient balance of asset {asset_id}: have {have} base units, need {need} base units"
    )]
    InsufficientAsset { asset_id: u64, have: u64, need: u64 },

    #[error(
        "insufficient spendable balance for fees in {account}: spendable {spendable} microAlgo, need {need} microAlgo"
    )]
    InsufficientFeeReserve {
        account: String,
        spendable: u64,
        need: u64,
    },

    #[error("amount overflow computing required total for asset {0}")]
    Overflow(u64),
}

#[derive(Debug, Error)]
pub enum SinkError {
    #[error("failed to open outcome log {path}: {source}")]
    Open {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to append to outcome log {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Everything that can abort the balance check or the batch itself.
#[derive(Debug, Error)]
pub enum DropError {
    #[error(transparent)]
    Balance(#[from] BalanceError),

    #[error(transparent)]
    Sink(#[from] SinkError),

    #[error("ledger: {0}")]
    Ledger(#[from] LedgerError),

    #[error("pipeline task failed: {0}")]
    Task(String),
}
