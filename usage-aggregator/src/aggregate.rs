use std::collections::BTreeMap;

use chrono::{Duration, NaiveDate, NaiveDateTime, NaiveTime, Timelike};
use usage_common::types::{UsageEvent, UsageProfile};

/// Inclusive event-time window covered by one aggregation run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AggregationWindow {
    pub from: NaiveDateTime,
    pub to: NaiveDateTime,
}

impl AggregationWindow {
    /// `window_days` full days back from the run date, through the last
    /// second of the run date itself.
    pub fn for_run_date(run_date: NaiveDate, window_days: u32) -> Self {
        let from = (run_date - Duration::days(i64::from(window_days))).and_time(NaiveTime::MIN);
        let to = run_date.and_time(NaiveTime::MIN) + Duration::days(1) - Duration::seconds(1);
        AggregationWindow { from, to }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct BucketStats {
    count: u64,
    most_recent: NaiveDateTime,
}

impl BucketStats {
    fn observe(&mut self, at: NaiveDateTime) {
        self.count += 1;
        if at > self.most_recent {
            self.most_recent = at;
        }
    }

    fn beats(&self, other: &BucketStats) -> bool {
        (self.count, self.most_recent) > (other.count, other.most_recent)
    }
}

/// Pick the winning bucket key: highest count, then latest observation,
/// then smallest key. Iteration is in ascending key order and a tie never
/// displaces the current winner, which is what makes the final tie-break
/// deterministic.
fn top_bucket<K: Ord>(observations: impl IntoIterator<Item = (K, NaiveDateTime)>) -> Option<K> {
    let mut buckets: BTreeMap<K, BucketStats> = BTreeMap::new();
    for (key, at) in observations {
        buckets
            .entry(key)
            .and_modify(|stats| stats.observe(at))
            .or_insert(BucketStats {
                count: 1,
                most_recent: at,
            });
    }

    let mut best: Option<(K, BucketStats)> = None;
    for (key, stats) in buckets {
        let replace = match &best {
            None => true,
            Some((_, best_stats)) => stats.beats(best_stats),
        };
        if replace {
            best = Some((key, stats));
        }
    }
    best.map(|(key, _)| key)
}

/// Compute one profile per member with at least `threshold` events: the
/// member's busiest location, and the busiest hour within that location.
///
/// Output is sorted by member id. Pure over its inputs; identical events
/// always produce identical profiles regardless of input order.
pub fn aggregate_profiles(
    events: &[UsageEvent],
    threshold: u64,
    run_date: NaiveDate,
) -> Vec<UsageProfile> {
    let mut per_member: BTreeMap<i64, Vec<&UsageEvent>> = BTreeMap::new();
    for event in events {
        per_member.entry(event.member_id).or_default().push(event);
    }

    let mut profiles = Vec::new();
    for (member_id, member_events) in per_member {
        if (member_events.len() as u64) < threshold {
            continue;
        }

        let Some(top_location) = top_bucket(
            member_events
                .iter()
                .map(|e| (e.location.as_str(), e.occurred_at)),
        ) else {
            continue;
        };

        let Some(top_hour) = top_bucket(
            member_events
                .iter()
                .filter(|e| e.location == top_location)
                .map(|e| (e.occurred_at.hour(), e.occurred_at)),
        ) else {
            continue;
        };

        profiles.push(UsageProfile {
            member_id,
            top_location: top_location.to_string(),
            top_hour: top_hour as i16,
            aggregated_at: run_date,
        });
    }

    profiles
}
