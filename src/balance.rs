//! Pre-flight checks: the source must hold enough of the asset, and the
//! sender enough spendable algo to cover fees, before anything is queued.

use tracing::info;

use crate::error::{BalanceError, DropError};
use crate::ledger::LedgerClient;
use crate::model::{AssetDescriptor, SendIntent};
use crate::retry::{retry_ledger_call, RetryPolicy};

/// Minimum balance the sender funds when a vault has to opt in to the asset.
pub const VAULT_OPT_IN_MBR: u64 = 100_000;
/// Worst case transactions (outer plus inner) per send into a vault.
pub const VAULT_SEND_FEE_MULTIPLIER: u64 = 4;
/// App call plus the inner transfer out of a vault.
pub const VAULT_SOURCE_FEE_MULTIPLIER: u64 = 2;

/// Base units the batch needs in total.
///
/// Per-recipient amounts are multiplied out. A total amount is needed as-is,
/// even though the even split may leave a remainder unsent.
pub fn required_base_units(
    asset: &AssetDescriptor,
    intent: &SendIntent,
    per_recipient: u64,
    recipient_count: usize,
) -> Result<u64, BalanceError> {
    if intent.is_per_recipient {
        per_recipient
            .checked_mul(recipient_count as u64)
            .ok_or(BalanceError::Overflow(asset.asset_id))
    } else {
        asset
            .to_base_units(intent.amount)
            .ok_or(BalanceError::Overflow(asset.asset_id))
    }
}

/// Worst-case fee, in microAlgo, for a single recipient.
pub fn per_recipient_fee_bound(intent: &SendIntent, min_fee: u64) -> u64 {
    if intent.destination_is_vault {
        VAULT_SEND_FEE_MULTIPLIER * min_fee + VAULT_OPT_IN_MBR
    } else if intent.source_is_vault {
        VAULT_SOURCE_FEE_MULTIPLIER * min_fee
    } else {
        min_fee
    }
}

pub struct BalanceGuard<'a> {
    asset: &'a AssetDescriptor,
    intent: &'a SendIntent,
    min_fee: u64,
}

impl<'a> BalanceGuard<'a> {
    pub fn new(asset: &'a AssetDescriptor, intent: &'a SendIntent, min_fee: u64) -> Self {
        Self {
            asset,
            intent,
            min_fee,
        }
    }

    pub fn check_asset(&self, per_recipient: u64, recipient_count: usize) -> Result<u64, BalanceError> {
        let need = required_base_units(self.asset, self.intent, per_recipient, recipient_count)?;
        let have = self.asset.existing_source_balance;
        if have < need {
            return Err(BalanceError::InsufficientAsset {
                asset_id: self.asset.asset_id,
                have,
                need,
            });
        }
        Ok(need)
    }

    pub fn check_fee_reserve(
        &self,
        fee_payer: &str,
        spendable: u64,
        recipient_count: usize,
    ) -> Result<u64, BalanceError> {
        let need = per_recipient_fee_bound(self.intent, self.min_fee)
            .checked_mul(recipient_count as u64)
            .ok_or(BalanceError::Overflow(self.asset.asset_id))?;
        if spendable < need {
            return Err(BalanceError::InsufficientFeeReserve {
                account: fee_payer.to_string(),
                spendable,
                need,
            });
        }
        Ok(need)
    }

    /// Run both checks, fetching the fee payer's spendable balance from the ledger.
    pub async fn verify<L>(
        &self,
        ledger: &L,
        fee_payer: &str,
        per_recipient: u64,
        recipient_count: usize,
        policy: &RetryPolicy,
    ) -> Result<(), DropError>
    where
        L: LedgerClient + ?Sized,
    {
        let asset_need = self.check_asset(per_recipient, recipient_count)?;
        let balance = retry_ledger_call(policy, || ledger.account_balance(fee_payer)).await?;
        let fee_need = self.check_fee_reserve(fee_payer, balance.spendable(), recipient_count)?;
        info!(
            asset_id = self.asset.asset_id,
            need = %self.asset.format_amount(asset_need),
            have = %self.asset.format_amount(self.asset.existing_source_balance),
            fee_reserve = fee_need,
            spendable = balance.spendable(),
            "Balances sufficient"
        );
        Ok(())
    }
}
