use chrono::{Duration, NaiveDate};
use tracing::info;

use usage_common::profile_store::{ProfileStore, StoreError};

use crate::metrics_consts::PROFILES_DELETED;

/// First day still retained when sweeping on `today`.
pub fn retention_cutoff(today: NaiveDate, retention_days: u32) -> NaiveDate {
    today - Duration::days(i64::from(retention_days))
}

/// Drops profiles aggregated before the retention window. Dispatch only
/// looks back a couple of days, anything older is dead weight.
pub async fn clean_profiles(
    store: &ProfileStore,
    today: NaiveDate,
    retention_days: u32,
) -> Result<u64, StoreError> {
    let cutoff = retention_cutoff(today, retention_days);
    let deleted = store.delete_profiles_before(cutoff).await?;
    metrics::counter!(PROFILES_DELETED).increment(deleted);
    info!(cutoff = %cutoff, deleted, "profile retention sweep complete");
    Ok(deleted)
}
