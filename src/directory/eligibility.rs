//! Off-chain checks mirroring what the NFD contract enforces, so records
//! that would reject a vault send are skipped up front.

use std::sync::LazyLock;

use regex::Regex;

use crate::model::CandidateRecord;

/// Minimum contract version that accepts vault auto opt-in sends.
pub const MIN_VAULT_VERSION: (u32, u32) = (2, 11);

static MAJOR_MINOR: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(?P<major>\d+)\.(?P<minor>\d+)").expect("static regex")
});

/// True if `version` (ie: "2.11", "1.13a") is at least `major.minor`.
///
/// The comparison is `v.major > major || (v.major >= major && v.minor >= minor)`.
/// Unparseable versions are never at least anything.
pub fn is_contract_version_at_least(version: &str, major: u32, minor: u32) -> bool {
    let Some(caps) = MAJOR_MINOR.captures(version) else {
        return false;
    };
    let (Ok(v_major), Ok(v_minor)) = (caps["major"].parse::<u32>(), caps["minor"].parse::<u32>())
    else {
        return false;
    };
    v_major > major || (v_major >= major && v_minor >= minor)
}

/// Whether `sender` is blocked from sending into the record's vault at unix time `now`.
///
/// `vaultOptInLocked`: missing or `"0"` is unlocked, `"1"` is locked, anything
/// larger is a unix timestamp before which the vault stays locked. The owner
/// is never locked out.
pub fn is_vault_opt_in_locked_for(record: &CandidateRecord, sender: &str, now: i64) -> bool {
    if sender == record.owner {
        return false;
    }
    let Some(lock) = record.vault_opt_in_lock() else {
        return false;
    };
    match lock.parse::<u64>() {
        Ok(0) => false,
        Ok(1) => true,
        Ok(until) => now < i64::try_from(until).unwrap_or(i64::MAX),
        // unreadable lock values are treated as locked
        Err(_) => true,
    }
}
