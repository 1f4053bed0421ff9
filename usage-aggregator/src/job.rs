use std::time::Instant;

use chrono::NaiveDate;
use tracing::info;
use usage_common::profile_store::{ProfileStore, ProfileWriteMode, StoreError};

use crate::aggregate::{aggregate_profiles, AggregationWindow};
use crate::events::EventSource;
use crate::metrics_consts::{EVENTS_READ, MEMBERS_ELIGIBLE, PROFILES_WRITTEN, RUN_TIME};

#[derive(Debug, Clone, Copy)]
pub struct AggregationParams {
    pub run_date: NaiveDate,
    pub window_days: u32,
    pub usage_count_threshold: u64,
    pub write_chunk_size: usize,
    pub write_mode: ProfileWriteMode,
}

#[derive(Debug, Default, PartialEq, Eq)]
pub struct AggregationSummary {
    pub events_read: usize,
    pub members_eligible: usize,
    pub profiles_written: u64,
}

/// One aggregation run: fetch the window, rank, write profiles in chunks.
/// Any storage error aborts the run with nothing partially committed beyond
/// already-written chunks; re-running the same date in upsert mode converges.
pub async fn run_aggregation(
    source: &EventSource,
    store: &ProfileStore,
    params: &AggregationParams,
) -> Result<AggregationSummary, StoreError> {
    let started = Instant::now();
    let window = AggregationWindow::for_run_date(params.run_date, params.window_days);
    info!(
        run_date = %params.run_date,
        from = %window.from,
        to = %window.to,
        threshold = params.usage_count_threshold,
        "starting usage aggregation"
    );

    let events = source.fetch_events(&window).await?;
    metrics::counter!(EVENTS_READ).increment(events.len() as u64);

    let profiles = aggregate_profiles(&events, params.usage_count_threshold, params.run_date);
    metrics::counter!(MEMBERS_ELIGIBLE).increment(profiles.len() as u64);

    let mut profiles_written = 0;
    for chunk in profiles.chunks(params.write_chunk_size.max(1)) {
        profiles_written += store.write_profiles(chunk, params.write_mode).await?;
    }
    metrics::counter!(PROFILES_WRITTEN).increment(profiles_written);

    let elapsed = started.elapsed();
    metrics::histogram!(RUN_TIME).record(elapsed.as_millis() as f64);
    let summary = AggregationSummary {
        events_read: events.len(),
        members_eligible: profiles.len(),
        profiles_written,
    };
    info!(
        events_read = summary.events_read,
        members_eligible = summary.members_eligible,
        profiles_written = summary.profiles_written,
        elapsed_ms = elapsed.as_millis() as u64,
        "usage aggregation finished"
    );

    Ok(summary)
}
