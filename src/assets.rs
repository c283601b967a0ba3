//! Asset metadata lookup and whole-unit/base-unit math.

use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use tracing::info;

use crate::error::LedgerError;
use crate::ledger::LedgerClient;
use crate::model::{AssetDescriptor, SendIntent};
use crate::retry::{retry_ledger_call, RetryPolicy};

impl AssetDescriptor {
    /// Base units rendered with the asset's decimals, ie: 1500000 @ 6 -> "1.500000".
    pub fn format_amount(&self, base_units: u64) -> String {
        match Decimal::try_from_i128_with_scale(base_units as i128, self.decimals) {
            Ok(value) => value.to_string(),
            Err(_) => base_units.to_string(),
        }
    }

    /// Whole units to base units, truncating anything below one base unit.
    /// `None` for negative amounts or overflow.
    pub fn to_base_units(&self, amount: Decimal) -> Option<u64> {
        if amount.is_sign_negative() {
            return None;
        }
        let scale = Decimal::from(10u64.checked_pow(self.decimals)?);
        amount.checked_mul(scale)?.trunc().to_u64()
    }
}

/// Amount each recipient gets, in base units. A total is split evenly
/// across `recipient_count` before conversion.
pub fn per_recipient_base_units(
    asset: &AssetDescriptor,
    intent: &SendIntent,
    recipient_count: usize,
) -> Option<u64> {
    let whole = if intent.is_per_recipient {
        intent.amount
    } else {
        if recipient_count == 0 {
            return None;
        }
        intent.amount.checked_div(Decimal::from(recipient_count as u64))?
    };
    asset.to_base_units(whole)
}

/// Fetch the asset's params and the source account's holding of it.
pub async fn fetch_asset<L>(
    ledger: &L,
    asset_id: u64,
    source_account: &str,
    policy: &RetryPolicy,
) -> Result<AssetDescriptor, LedgerError>
where
    L: LedgerClient + ?Sized,
{
    let params = retry_ledger_call(policy, || ledger.asset_params(asset_id)).await?;
    let holding =
        retry_ledger_call(policy, || ledger.asset_holding(source_account, asset_id)).await?;

    let asset = AssetDescriptor {
        asset_id,
        decimals: params.decimals,
        unit_name: params.unit_name,
        existing_source_balance: holding,
    };
    info!(
        asset_id,
        unit = %asset.unit_name,
        decimals = asset.decimals,
        balance = %asset.format_amount(holding),
        source = source_account,
        "Fetched asset"
    );
    Ok(asset)
}
