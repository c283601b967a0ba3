//! Batch sender for Algorand assets to NFD holders.
//!
//! Recipients are resolved from the NFD directory ([`recipients`]), balances
//! are checked up front ([`balance`]), and transfers run through a bounded
//! worker pool ([`pipeline`]) that records every outcome in durable logs
//! ([`sink`]).

pub mod assets;
pub mod balance;
pub mod config;
pub mod directory;
pub mod error;
pub mod ledger;
pub mod model;
pub mod pipeline;
pub mod recipients;
pub mod retry;
pub mod signer;
pub mod sink;

#[cfg(test)]
pub(crate) mod testing;
