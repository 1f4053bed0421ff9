use std::collections::{HashMap, HashSet};
use std::time::Instant;

use async_trait::async_trait;
use chrono::{Duration, NaiveDate, NaiveDateTime, NaiveTime};
use tracing::{info, warn};

use usage_common::profile_store::{ProfileStore, StoreError};
use usage_common::retry::{with_retries, RetryPolicy};
use usage_common::types::{UsageNotification, UsageProfile};

use crate::config::HourOfDay;
use crate::coupon_events::ActiveEventSource;
use crate::enrichment::{StoreRegistry, TokenRegistry};
use crate::error::{DispatchError, EnrichmentError};
use crate::metrics_consts::{
    CHUNKS_PROCESSED, ITEMS_FAILED, ITEMS_SKIPPED, MEMBERS_DISPATCHED, MESSAGES_SENT,
    PROFILES_READ, RUN_TIME,
};
use crate::publisher::MessagePublisher;

/// Window and hour one dispatch run reads profiles for.
#[derive(Debug, Clone, Copy)]
pub struct ProfileQuery {
    pub from: NaiveDate,
    pub to: NaiveDate,
    pub target_hour: i16,
}

/// Pages through each member's newest matching profile in ascending member
/// order. A page picks up strictly after `after_member`, so a retried read
/// can never replay or drop a member.
#[async_trait]
pub trait ProfileSource: Send + Sync {
    async fn next_page(
        &self,
        query: &ProfileQuery,
        after_member: Option<i64>,
        limit: i64,
    ) -> Result<Vec<UsageProfile>, StoreError>;
}

#[async_trait]
impl ProfileSource for ProfileStore {
    async fn next_page(
        &self,
        query: &ProfileQuery,
        after_member: Option<i64>,
        limit: i64,
    ) -> Result<Vec<UsageProfile>, StoreError> {
        self.latest_profiles_page(query.from, query.to, query.target_hour, after_member, limit)
            .await
    }
}

#[derive(Debug, Clone)]
pub struct DispatchParams {
    pub reference_date: NaiveDate,
    pub reference_hour: HourOfDay,
    pub lookback_days: u32,
    pub chunk_size: usize,
    pub skip_limit: usize,
    pub retry_policy: RetryPolicy,
}

impl DispatchParams {
    pub fn profile_query(&self) -> ProfileQuery {
        ProfileQuery {
            from: self.reference_date - Duration::days(i64::from(self.lookback_days)),
            to: self.reference_date,
            target_hour: self.reference_hour.0,
        }
    }

    /// The instant active coupon events are checked against.
    pub fn reference_instant(&self) -> NaiveDateTime {
        self.reference_date.and_time(NaiveTime::MIN)
            + Duration::hours(i64::from(self.reference_hour.0))
    }
}

/// Business reasons an item legitimately produces nothing. These are
/// expected outcomes and never count toward the failure cap.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    NoTokens,
    NoStores,
    NoActiveEvents,
}

impl SkipReason {
    fn as_str(&self) -> &'static str {
        match self {
            SkipReason::NoTokens => "no_tokens",
            SkipReason::NoStores => "no_stores",
            SkipReason::NoActiveEvents => "no_active_events",
        }
    }
}

/// Terminal state of one chunk item.
#[derive(Debug)]
enum ItemOutcome {
    Dispatched { messages: usize },
    Skipped(SkipReason),
    Failed(EnrichmentError),
}

/// Counters for one dispatch run.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct DispatchSummary {
    pub profiles_read: usize,
    pub chunks_processed: usize,
    pub members_dispatched: usize,
    pub messages_sent: usize,
    pub skipped_no_tokens: usize,
    pub skipped_no_stores: usize,
    pub skipped_no_active_events: usize,
    pub failed_items: usize,
}

impl DispatchSummary {
    fn record_skip(&mut self, reason: SkipReason) {
        match reason {
            SkipReason::NoTokens => self.skipped_no_tokens += 1,
            SkipReason::NoStores => self.skipped_no_stores += 1,
            SkipReason::NoActiveEvents => self.skipped_no_active_events += 1,
        }
    }
}

pub struct DispatchPipeline<'a> {
    profiles: &'a dyn ProfileSource,
    tokens: &'a dyn TokenRegistry,
    stores: &'a dyn StoreRegistry,
    events: &'a dyn ActiveEventSource,
    publisher: &'a dyn MessagePublisher,
}

impl<'a> DispatchPipeline<'a> {
    pub fn new(
        profiles: &'a dyn ProfileSource,
        tokens: &'a dyn TokenRegistry,
        stores: &'a dyn StoreRegistry,
        events: &'a dyn ActiveEventSource,
        publisher: &'a dyn MessagePublisher,
    ) -> Self {
        Self {
            profiles,
            tokens,
            stores,
            events,
            publisher,
        }
    }

    /// Drives one dispatch run to completion. Item-level trouble is
    /// absorbed up to the failure cap, a publish error or an exhausted
    /// profile read ends the run immediately.
    pub async fn run(&self, params: &DispatchParams) -> Result<DispatchSummary, DispatchError> {
        let start = Instant::now();
        let query = params.profile_query();
        let reference_instant = params.reference_instant();
        let chunk_size = params.chunk_size.max(1);

        info!(
            reference_date = %params.reference_date,
            reference_hour = params.reference_hour.0,
            window_start = %query.from,
            "starting dispatch run"
        );

        let mut summary = DispatchSummary::default();
        let mut after_member: Option<i64> = None;

        loop {
            let page = with_retries(
                &params.retry_policy,
                "profile page read",
                StoreError::is_transient,
                || self.profiles.next_page(&query, after_member, chunk_size as i64),
            )
            .await?;

            if page.is_empty() {
                break;
            }
            summary.profiles_read += page.len();
            metrics::counter!(PROFILES_READ).increment(page.len() as u64);

            self.process_chunk(&page, reference_instant, params, &mut summary)
                .await?;
            summary.chunks_processed += 1;
            metrics::counter!(CHUNKS_PROCESSED).increment(1);

            if summary.failed_items > params.skip_limit {
                return Err(DispatchError::SkipLimitExceeded {
                    skipped: summary.failed_items,
                    limit: params.skip_limit,
                });
            }

            after_member = page.last().map(|p| p.member_id);
            if page.len() < chunk_size {
                break;
            }
        }

        metrics::histogram!(RUN_TIME).record(start.elapsed().as_millis() as f64);
        info!(
            profiles_read = summary.profiles_read,
            chunks_processed = summary.chunks_processed,
            members_dispatched = summary.members_dispatched,
            messages_sent = summary.messages_sent,
            skipped_no_tokens = summary.skipped_no_tokens,
            skipped_no_stores = summary.skipped_no_stores,
            skipped_no_active_events = summary.skipped_no_active_events,
            failed_items = summary.failed_items,
            "dispatch run finished"
        );
        Ok(summary)
    }

    async fn process_chunk(
        &self,
        chunk: &[UsageProfile],
        reference_instant: NaiveDateTime,
        params: &DispatchParams,
        summary: &mut DispatchSummary,
    ) -> Result<(), DispatchError> {
        let member_ids: Vec<i64> = chunk.iter().map(|p| p.member_id).collect();
        let mut locations: Vec<String> =
            chunk.iter().map(|p| p.top_location.clone()).collect();
        locations.sort();
        locations.dedup();

        // One batched call per registry per chunk, whatever the chunk size.
        let token_lookup = match with_retries(
            &params.retry_policy,
            "token registry lookup",
            EnrichmentError::is_retryable,
            || self.tokens.tokens_by_member(&member_ids),
        )
        .await
        {
            Ok(lookup) => lookup,
            Err(error) => {
                warn!(
                    members = chunk.len(),
                    "token lookup failed for the whole chunk: {error}"
                );
                summary.failed_items += chunk.len();
                metrics::counter!(ITEMS_FAILED).increment(chunk.len() as u64);
                return Ok(());
            }
        };

        let store_lookup = match with_retries(
            &params.retry_policy,
            "store registry lookup",
            EnrichmentError::is_retryable,
            || self.stores.stores_by_location(&locations),
        )
        .await
        {
            Ok(lookup) => lookup,
            Err(error) => {
                warn!(
                    members = chunk.len(),
                    "store lookup failed for the whole chunk: {error}"
                );
                summary.failed_items += chunk.len();
                metrics::counter!(ITEMS_FAILED).increment(chunk.len() as u64);
                return Ok(());
            }
        };

        for profile in chunk {
            let outcome = self
                .process_item(
                    profile,
                    &token_lookup,
                    &store_lookup,
                    reference_instant,
                    params,
                )
                .await?;
            match outcome {
                ItemOutcome::Dispatched { messages } => {
                    summary.members_dispatched += 1;
                    summary.messages_sent += messages;
                    metrics::counter!(MEMBERS_DISPATCHED).increment(1);
                    metrics::counter!(MESSAGES_SENT).increment(messages as u64);
                }
                ItemOutcome::Skipped(reason) => {
                    info!(
                        member_id = profile.member_id,
                        reason = reason.as_str(),
                        "skipping member"
                    );
                    summary.record_skip(reason);
                    metrics::counter!(ITEMS_SKIPPED, "reason" => reason.as_str()).increment(1);
                }
                ItemOutcome::Failed(error) => {
                    warn!(
                        member_id = profile.member_id,
                        "item failed after retries: {error}"
                    );
                    summary.failed_items += 1;
                    metrics::counter!(ITEMS_FAILED).increment(1);
                }
            }
        }
        Ok(())
    }

    async fn process_item(
        &self,
        profile: &UsageProfile,
        token_lookup: &HashMap<i64, Vec<String>>,
        store_lookup: &HashMap<String, Vec<i64>>,
        reference_instant: NaiveDateTime,
        params: &DispatchParams,
    ) -> Result<ItemOutcome, DispatchError> {
        let Some(tokens) = token_lookup
            .get(&profile.member_id)
            .filter(|tokens| !tokens.is_empty())
        else {
            return Ok(ItemOutcome::Skipped(SkipReason::NoTokens));
        };

        let Some(store_ids) = store_lookup
            .get(&profile.top_location)
            .filter(|stores| !stores.is_empty())
        else {
            return Ok(ItemOutcome::Skipped(SkipReason::NoStores));
        };

        let active_event_count = match with_retries(
            &params.retry_policy,
            "active event count",
            EnrichmentError::is_retryable,
            || self.events.active_event_count(store_ids, reference_instant),
        )
        .await
        {
            Ok(count) => count,
            Err(error) => return Ok(ItemOutcome::Failed(error)),
        };

        if active_event_count <= 0 {
            return Ok(ItemOutcome::Skipped(SkipReason::NoActiveEvents));
        }

        // One message per distinct token, registry order preserved.
        let mut seen: HashSet<&str> = HashSet::with_capacity(tokens.len());
        let mut messages = 0;
        for token in tokens {
            if !seen.insert(token.as_str()) {
                continue;
            }
            let notification = UsageNotification::new(profile, token.clone(), active_event_count);
            self.publisher.publish(&notification).await?;
            messages += 1;
        }

        Ok(ItemOutcome::Dispatched { messages })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::time::Duration as StdDuration;

    use common_kafka::kafka_producer::KafkaProduceError;

    use crate::error::PublishError;

    fn profile(member_id: i64, location: &str, hour: i16) -> UsageProfile {
        UsageProfile {
            member_id,
            top_location: location.to_string(),
            top_hour: hour,
            aggregated_at: NaiveDate::from_ymd_opt(2025, 10, 26).unwrap(),
        }
    }

    fn transient_error() -> StoreError {
        StoreError::Query {
            command: "test",
            error: sqlx::Error::PoolTimedOut,
        }
    }

    fn fast_policy() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 3,
            initial_interval: StdDuration::from_millis(1),
            multiplier: 2.0,
            maximum_interval: StdDuration::from_millis(2),
        }
    }

    fn params(chunk_size: usize, skip_limit: usize) -> DispatchParams {
        DispatchParams {
            reference_date: NaiveDate::from_ymd_opt(2025, 10, 26).unwrap(),
            reference_hour: HourOfDay(11),
            lookback_days: 2,
            chunk_size,
            skip_limit,
            retry_policy: fast_policy(),
        }
    }

    struct FakeProfiles {
        profiles: Vec<UsageProfile>,
        calls: AtomicUsize,
        failures: AtomicUsize,
    }

    impl FakeProfiles {
        fn new(profiles: Vec<UsageProfile>) -> Self {
            Self {
                profiles,
                calls: AtomicUsize::new(0),
                failures: AtomicUsize::new(0),
            }
        }

        fn failing_first(self, failures: usize) -> Self {
            self.failures.store(failures, Ordering::SeqCst);
            self
        }
    }

    #[async_trait]
    impl ProfileSource for FakeProfiles {
        async fn next_page(
            &self,
            query: &ProfileQuery,
            after_member: Option<i64>,
            limit: i64,
        ) -> Result<Vec<UsageProfile>, StoreError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let remaining = self.failures.load(Ordering::SeqCst);
            if remaining > 0 {
                self.failures.store(remaining - 1, Ordering::SeqCst);
                return Err(transient_error());
            }
            Ok(self
                .profiles
                .iter()
                .filter(|p| p.top_hour == query.target_hour)
                .filter(|p| after_member.map_or(true, |after| p.member_id > after))
                .take(limit as usize)
                .cloned()
                .collect())
        }
    }

    struct FakeTokens {
        tokens: HashMap<i64, Vec<String>>,
        calls: AtomicUsize,
        failures: AtomicUsize,
    }

    impl FakeTokens {
        fn new(entries: Vec<(i64, Vec<&str>)>) -> Self {
            let tokens = entries
                .into_iter()
                .map(|(id, tokens)| (id, tokens.into_iter().map(String::from).collect()))
                .collect();
            Self {
                tokens,
                calls: AtomicUsize::new(0),
                failures: AtomicUsize::new(0),
            }
        }

        fn failing_first(self, failures: usize) -> Self {
            self.failures.store(failures, Ordering::SeqCst);
            self
        }
    }

    #[async_trait]
    impl TokenRegistry for FakeTokens {
        async fn tokens_by_member(
            &self,
            member_ids: &[i64],
        ) -> Result<HashMap<i64, Vec<String>>, EnrichmentError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let remaining = self.failures.load(Ordering::SeqCst);
            if remaining > 0 {
                self.failures.store(remaining - 1, Ordering::SeqCst);
                return Err(EnrichmentError::Store(transient_error()));
            }
            Ok(member_ids
                .iter()
                .filter_map(|id| self.tokens.get(id).map(|tokens| (*id, tokens.clone())))
                .collect())
        }
    }

    struct FakeStores {
        stores: HashMap<String, Vec<i64>>,
        calls: AtomicUsize,
        failures: AtomicUsize,
    }

    impl FakeStores {
        fn new(entries: Vec<(&str, Vec<i64>)>) -> Self {
            let stores = entries
                .into_iter()
                .map(|(location, ids)| (location.to_string(), ids))
                .collect();
            Self {
                stores,
                calls: AtomicUsize::new(0),
                failures: AtomicUsize::new(0),
            }
        }

        fn failing_first(self, failures: usize) -> Self {
            self.failures.store(failures, Ordering::SeqCst);
            self
        }
    }

    #[async_trait]
    impl StoreRegistry for FakeStores {
        async fn stores_by_location(
            &self,
            locations: &[String],
        ) -> Result<HashMap<String, Vec<i64>>, EnrichmentError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let remaining = self.failures.load(Ordering::SeqCst);
            if remaining > 0 {
                self.failures.store(remaining - 1, Ordering::SeqCst);
                return Err(EnrichmentError::Store(transient_error()));
            }
            Ok(locations
                .iter()
                .filter_map(|location| {
                    self.stores
                        .get(location)
                        .map(|ids| (location.clone(), ids.clone()))
                })
                .collect())
        }
    }

    struct FakeEvents {
        per_store: HashMap<i64, i64>,
        calls: AtomicUsize,
        failures: AtomicUsize,
    }

    impl FakeEvents {
        fn new(entries: Vec<(i64, i64)>) -> Self {
            Self {
                per_store: entries.into_iter().collect(),
                calls: AtomicUsize::new(0),
                failures: AtomicUsize::new(0),
            }
        }

        fn failing_first(self, failures: usize) -> Self {
            self.failures.store(failures, Ordering::SeqCst);
            self
        }
    }

    #[async_trait]
    impl ActiveEventSource for FakeEvents {
        async fn active_event_count(
            &self,
            store_ids: &[i64],
            _at: NaiveDateTime,
        ) -> Result<i64, EnrichmentError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let remaining = self.failures.load(Ordering::SeqCst);
            if remaining > 0 {
                self.failures.store(remaining - 1, Ordering::SeqCst);
                return Err(EnrichmentError::Store(transient_error()));
            }
            Ok(store_ids
                .iter()
                .map(|id| self.per_store.get(id).copied().unwrap_or(0))
                .sum())
        }
    }

    #[derive(Default)]
    struct FakePublisher {
        sent: Mutex<Vec<UsageNotification>>,
        failures: AtomicUsize,
    }

    impl FakePublisher {
        fn failing_first(self, failures: usize) -> Self {
            self.failures.store(failures, Ordering::SeqCst);
            self
        }

        fn sent(&self) -> Vec<UsageNotification> {
            self.sent.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl MessagePublisher for FakePublisher {
        async fn publish(&self, notification: &UsageNotification) -> Result<(), PublishError> {
            let remaining = self.failures.load(Ordering::SeqCst);
            if remaining > 0 {
                self.failures.store(remaining - 1, Ordering::SeqCst);
                return Err(PublishError::Kafka(KafkaProduceError::KafkaProduceCanceled));
            }
            self.sent.lock().unwrap().push(notification.clone());
            Ok(())
        }
    }

    fn pipeline<'a>(
        profiles: &'a FakeProfiles,
        tokens: &'a FakeTokens,
        stores: &'a FakeStores,
        events: &'a FakeEvents,
        publisher: &'a FakePublisher,
    ) -> DispatchPipeline<'a> {
        DispatchPipeline::new(profiles, tokens, stores, events, publisher)
    }

    #[tokio::test]
    async fn dispatches_one_message_per_token() {
        let profiles = FakeProfiles::new(vec![profile(101, "Noryangjin", 10)]);
        let tokens = FakeTokens::new(vec![(101, vec!["tok-a", "tok-b"])]);
        let stores = FakeStores::new(vec![("Noryangjin", vec![1])]);
        let events = FakeEvents::new(vec![(1, 1)]);
        let publisher = FakePublisher::default();

        let mut run_params = params(1000, 1000);
        run_params.reference_hour = HourOfDay(10);

        let summary = pipeline(&profiles, &tokens, &stores, &events, &publisher)
            .run(&run_params)
            .await
            .unwrap();

        assert_eq!(summary.members_dispatched, 1);
        assert_eq!(summary.messages_sent, 2);
        let sent = publisher.sent();
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[0].token, "tok-a");
        assert_eq!(sent[1].token, "tok-b");
        assert_eq!(sent[0].member_id, 101);
        assert_eq!(sent[0].top_location, "Noryangjin");
        assert_eq!(sent[0].top_hour, 10);
        assert_eq!(sent[0].active_event_count, 1);
        assert_ne!(sent[0].trace_id, sent[1].trace_id);
    }

    #[tokio::test]
    async fn members_without_active_events_are_filtered() {
        let profiles = FakeProfiles::new(vec![profile(101, "Seogyo-dong", 11)]);
        let tokens = FakeTokens::new(vec![(101, vec!["tok-a"])]);
        let stores = FakeStores::new(vec![("Seogyo-dong", vec![1, 2])]);
        // Both stores exist but neither has a live event.
        let events = FakeEvents::new(vec![(1, 0), (2, 0)]);
        let publisher = FakePublisher::default();

        let summary = pipeline(&profiles, &tokens, &stores, &events, &publisher)
            .run(&params(1000, 1000))
            .await
            .unwrap();

        assert_eq!(summary.messages_sent, 0);
        assert_eq!(summary.skipped_no_active_events, 1);
        assert_eq!(summary.failed_items, 0);
        assert!(publisher.sent().is_empty());
    }

    #[tokio::test]
    async fn unresolvable_locations_skip_only_their_member() {
        let profiles = FakeProfiles::new(vec![
            profile(101, "Vanished-dong", 11),
            profile(102, "Seogyo-dong", 11),
        ]);
        let tokens = FakeTokens::new(vec![(101, vec!["tok-a"]), (102, vec!["tok-b"])]);
        // The first location resolves to an empty store list.
        let stores = FakeStores::new(vec![("Vanished-dong", vec![]), ("Seogyo-dong", vec![7])]);
        let events = FakeEvents::new(vec![(7, 2)]);
        let publisher = FakePublisher::default();

        let summary = pipeline(&profiles, &tokens, &stores, &events, &publisher)
            .run(&params(1000, 1000))
            .await
            .unwrap();

        assert_eq!(summary.skipped_no_stores, 1);
        assert_eq!(summary.members_dispatched, 1);
        let sent = publisher.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].member_id, 102);
        assert_eq!(sent[0].active_event_count, 2);
    }

    #[tokio::test]
    async fn members_missing_from_token_registry_are_skipped() {
        let profiles = FakeProfiles::new(vec![
            profile(101, "Seogyo-dong", 11),
            profile(102, "Seogyo-dong", 11),
        ]);
        let tokens = FakeTokens::new(vec![(102, vec!["tok-b"])]);
        let stores = FakeStores::new(vec![("Seogyo-dong", vec![1])]);
        let events = FakeEvents::new(vec![(1, 1)]);
        let publisher = FakePublisher::default();

        let summary = pipeline(&profiles, &tokens, &stores, &events, &publisher)
            .run(&params(1000, 1000))
            .await
            .unwrap();

        assert_eq!(summary.skipped_no_tokens, 1);
        assert_eq!(summary.members_dispatched, 1);
        assert_eq!(publisher.sent()[0].member_id, 102);
    }

    #[tokio::test]
    async fn one_registry_call_per_chunk() {
        let profiles = FakeProfiles::new(vec![
            profile(1, "A-dong", 11),
            profile(2, "B-dong", 11),
            profile(3, "A-dong", 11),
            profile(4, "C-dong", 11),
            profile(5, "B-dong", 11),
        ]);
        let tokens = FakeTokens::new(vec![
            (1, vec!["t1"]),
            (2, vec!["t2"]),
            (3, vec!["t3"]),
            (4, vec!["t4"]),
            (5, vec!["t5"]),
        ]);
        let stores = FakeStores::new(vec![
            ("A-dong", vec![10]),
            ("B-dong", vec![20]),
            ("C-dong", vec![30]),
        ]);
        let events = FakeEvents::new(vec![(10, 1), (20, 1), (30, 1)]);
        let publisher = FakePublisher::default();

        let summary = pipeline(&profiles, &tokens, &stores, &events, &publisher)
            .run(&params(1000, 1000))
            .await
            .unwrap();

        assert_eq!(summary.chunks_processed, 1);
        assert_eq!(tokens.calls.load(Ordering::SeqCst), 1);
        assert_eq!(stores.calls.load(Ordering::SeqCst), 1);
        // The event count stays per item.
        assert_eq!(events.calls.load(Ordering::SeqCst), 5);
        assert_eq!(summary.messages_sent, 5);
    }

    #[tokio::test]
    async fn chunked_runs_page_through_members_in_order() {
        let profiles = FakeProfiles::new(vec![
            profile(1, "A-dong", 11),
            profile(2, "A-dong", 11),
            profile(3, "A-dong", 11),
            profile(4, "A-dong", 11),
            profile(5, "A-dong", 11),
        ]);
        let tokens = FakeTokens::new(vec![
            (1, vec!["t1"]),
            (2, vec!["t2"]),
            (3, vec!["t3"]),
            (4, vec!["t4"]),
            (5, vec!["t5"]),
        ]);
        let stores = FakeStores::new(vec![("A-dong", vec![10])]);
        let events = FakeEvents::new(vec![(10, 1)]);
        let publisher = FakePublisher::default();

        let summary = pipeline(&profiles, &tokens, &stores, &events, &publisher)
            .run(&params(2, 1000))
            .await
            .unwrap();

        assert_eq!(summary.profiles_read, 5);
        assert_eq!(summary.chunks_processed, 3);
        assert_eq!(profiles.calls.load(Ordering::SeqCst), 3);
        assert_eq!(tokens.calls.load(Ordering::SeqCst), 3);
        let members: Vec<i64> = publisher.sent().iter().map(|n| n.member_id).collect();
        assert_eq!(members, vec![1, 2, 3, 4, 5]);
    }

    #[tokio::test]
    async fn duplicate_tokens_collapse_to_one_message() {
        let profiles = FakeProfiles::new(vec![profile(101, "Seogyo-dong", 11)]);
        let tokens = FakeTokens::new(vec![(101, vec!["tok-a", "tok-a", "tok-b"])]);
        let stores = FakeStores::new(vec![("Seogyo-dong", vec![1])]);
        let events = FakeEvents::new(vec![(1, 1)]);
        let publisher = FakePublisher::default();

        let summary = pipeline(&profiles, &tokens, &stores, &events, &publisher)
            .run(&params(1000, 1000))
            .await
            .unwrap();

        assert_eq!(summary.messages_sent, 2);
        let sent_tokens: Vec<String> = publisher.sent().iter().map(|n| n.token.clone()).collect();
        assert_eq!(sent_tokens, vec!["tok-a", "tok-b"]);
    }

    #[tokio::test]
    async fn transient_token_lookup_errors_are_retried() {
        let profiles = FakeProfiles::new(vec![profile(101, "Seogyo-dong", 11)]);
        let tokens = FakeTokens::new(vec![(101, vec!["tok-a"])]).failing_first(1);
        let stores = FakeStores::new(vec![("Seogyo-dong", vec![1])]);
        let events = FakeEvents::new(vec![(1, 1)]);
        let publisher = FakePublisher::default();

        let summary = pipeline(&profiles, &tokens, &stores, &events, &publisher)
            .run(&params(1000, 1000))
            .await
            .unwrap();

        assert_eq!(tokens.calls.load(Ordering::SeqCst), 2);
        assert_eq!(summary.messages_sent, 1);
        assert_eq!(summary.failed_items, 0);
    }

    #[tokio::test]
    async fn exhausted_token_lookup_fails_the_whole_chunk() {
        let profiles = FakeProfiles::new(vec![
            profile(101, "Seogyo-dong", 11),
            profile(102, "Seogyo-dong", 11),
        ]);
        let tokens = FakeTokens::new(vec![(101, vec!["tok-a"])]).failing_first(10);
        let stores = FakeStores::new(vec![("Seogyo-dong", vec![1])]);
        let events = FakeEvents::new(vec![(1, 1)]);
        let publisher = FakePublisher::default();

        let summary = pipeline(&profiles, &tokens, &stores, &events, &publisher)
            .run(&params(1000, 1000))
            .await
            .unwrap();

        assert_eq!(tokens.calls.load(Ordering::SeqCst), 3);
        assert_eq!(summary.failed_items, 2);
        assert_eq!(summary.messages_sent, 0);
        // Items never got far enough to count events.
        assert_eq!(events.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn exhausted_store_lookup_fails_the_whole_chunk() {
        let profiles = FakeProfiles::new(vec![profile(101, "Seogyo-dong", 11)]);
        let tokens = FakeTokens::new(vec![(101, vec!["tok-a"])]);
        let stores = FakeStores::new(vec![("Seogyo-dong", vec![1])]).failing_first(10);
        let events = FakeEvents::new(vec![(1, 1)]);
        let publisher = FakePublisher::default();

        let summary = pipeline(&profiles, &tokens, &stores, &events, &publisher)
            .run(&params(1000, 1000))
            .await
            .unwrap();

        assert_eq!(summary.failed_items, 1);
        assert!(publisher.sent().is_empty());
    }

    #[tokio::test]
    async fn run_aborts_once_failures_pass_the_cap() {
        let profiles = FakeProfiles::new(vec![
            profile(101, "Seogyo-dong", 11),
            profile(102, "Seogyo-dong", 11),
        ]);
        let tokens = FakeTokens::new(vec![]).failing_first(10);
        let stores = FakeStores::new(vec![("Seogyo-dong", vec![1])]);
        let events = FakeEvents::new(vec![(1, 1)]);
        let publisher = FakePublisher::default();

        let error = pipeline(&profiles, &tokens, &stores, &events, &publisher)
            .run(&params(1000, 1))
            .await
            .unwrap_err();

        assert!(matches!(
            error,
            DispatchError::SkipLimitExceeded {
                skipped: 2,
                limit: 1
            }
        ));
    }

    #[tokio::test]
    async fn event_count_failure_fails_only_that_item() {
        let profiles = FakeProfiles::new(vec![
            profile(101, "Seogyo-dong", 11),
            profile(102, "Yeonnam-dong", 11),
        ]);
        let tokens = FakeTokens::new(vec![(101, vec!["tok-a"]), (102, vec!["tok-b"])]);
        let stores = FakeStores::new(vec![("Seogyo-dong", vec![1]), ("Yeonnam-dong", vec![2])]);
        // The first item burns all three attempts, the second succeeds.
        let events = FakeEvents::new(vec![(1, 1), (2, 1)]).failing_first(3);
        let publisher = FakePublisher::default();

        let summary = pipeline(&profiles, &tokens, &stores, &events, &publisher)
            .run(&params(1000, 1000))
            .await
            .unwrap();

        assert_eq!(events.calls.load(Ordering::SeqCst), 4);
        assert_eq!(summary.failed_items, 1);
        assert_eq!(summary.members_dispatched, 1);
        assert_eq!(publisher.sent()[0].member_id, 102);
    }

    #[tokio::test]
    async fn business_skips_do_not_count_toward_the_cap() {
        let profiles = FakeProfiles::new(vec![
            profile(101, "Seogyo-dong", 11),
            profile(102, "Seogyo-dong", 11),
        ]);
        // Nobody has a token, and the cap tolerates zero failures.
        let tokens = FakeTokens::new(vec![]);
        let stores = FakeStores::new(vec![("Seogyo-dong", vec![1])]);
        let events = FakeEvents::new(vec![(1, 1)]);
        let publisher = FakePublisher::default();

        let summary = pipeline(&profiles, &tokens, &stores, &events, &publisher)
            .run(&params(1000, 0))
            .await
            .unwrap();

        assert_eq!(summary.skipped_no_tokens, 2);
        assert_eq!(summary.failed_items, 0);
    }

    #[tokio::test]
    async fn publish_failure_fails_the_run() {
        let profiles = FakeProfiles::new(vec![profile(101, "Seogyo-dong", 11)]);
        let tokens = FakeTokens::new(vec![(101, vec!["tok-a", "tok-b"])]);
        let stores = FakeStores::new(vec![("Seogyo-dong", vec![1])]);
        let events = FakeEvents::new(vec![(1, 1)]);
        let publisher = FakePublisher::default().failing_first(1);

        let error = pipeline(&profiles, &tokens, &stores, &events, &publisher)
            .run(&params(1000, 1000))
            .await
            .unwrap_err();

        assert!(matches!(error, DispatchError::Publish(_)));
        assert!(publisher.sent().is_empty());
    }

    #[tokio::test]
    async fn transient_profile_read_errors_are_retried() {
        let profiles =
            FakeProfiles::new(vec![profile(101, "Seogyo-dong", 11)]).failing_first(1);
        let tokens = FakeTokens::new(vec![(101, vec!["tok-a"])]);
        let stores = FakeStores::new(vec![("Seogyo-dong", vec![1])]);
        let events = FakeEvents::new(vec![(1, 1)]);
        let publisher = FakePublisher::default();

        let summary = pipeline(&profiles, &tokens, &stores, &events, &publisher)
            .run(&params(1000, 1000))
            .await
            .unwrap();

        assert_eq!(profiles.calls.load(Ordering::SeqCst), 2);
        assert_eq!(summary.messages_sent, 1);
    }

    #[tokio::test]
    async fn exhausted_profile_read_fails_the_run() {
        let profiles =
            FakeProfiles::new(vec![profile(101, "Seogyo-dong", 11)]).failing_first(10);
        let tokens = FakeTokens::new(vec![(101, vec!["tok-a"])]);
        let stores = FakeStores::new(vec![("Seogyo-dong", vec![1])]);
        let events = FakeEvents::new(vec![(1, 1)]);
        let publisher = FakePublisher::default();

        let error = pipeline(&profiles, &tokens, &stores, &events, &publisher)
            .run(&params(1000, 1000))
            .await
            .unwrap_err();

        assert_eq!(profiles.calls.load(Ordering::SeqCst), 3);
        assert!(matches!(error, DispatchError::ProfileRead(_)));
    }

    #[tokio::test]
    async fn repeated_runs_emit_identical_messages() {
        let run = || async {
            let profiles = FakeProfiles::new(vec![
                profile(101, "Seogyo-dong", 11),
                profile(102, "Yeonnam-dong", 11),
            ]);
            let tokens =
                FakeTokens::new(vec![(101, vec!["tok-a", "tok-b"]), (102, vec!["tok-c"])]);
            let stores =
                FakeStores::new(vec![("Seogyo-dong", vec![1]), ("Yeonnam-dong", vec![2])]);
            let events = FakeEvents::new(vec![(1, 3), (2, 1)]);
            let publisher = FakePublisher::default();
            pipeline(&profiles, &tokens, &stores, &events, &publisher)
                .run(&params(1000, 1000))
                .await
                .unwrap();
            publisher.sent()
        };

        let first = run().await;
        let second = run().await;
        assert_eq!(first, second);
        // Trace ids are derived from the payload, not generated per run.
        assert_eq!(first[0].trace_id, second[0].trace_id);
    }

    #[tokio::test]
    async fn empty_profile_window_is_a_clean_noop() {
        let profiles = FakeProfiles::new(vec![]);
        let tokens = FakeTokens::new(vec![]);
        let stores = FakeStores::new(vec![]);
        let events = FakeEvents::new(vec![]);
        let publisher = FakePublisher::default();

        let summary = pipeline(&profiles, &tokens, &stores, &events, &publisher)
            .run(&params(1000, 1000))
            .await
            .unwrap();

        assert_eq!(summary, DispatchSummary::default());
        assert_eq!(tokens.calls.load(Ordering::SeqCst), 0);
    }
}
