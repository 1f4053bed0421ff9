use chrono::{NaiveDate, NaiveDateTime};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Namespace for deterministic notification trace ids.
pub const TRACE_ID_NAMESPACE: Uuid = Uuid::from_u128(0x8c34_55e1_70d2_4a9f_b1c6_02e7_9d41_66aa);

/// One recorded coupon-usage action, read from the upstream transactional store.
#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow)]
pub struct UsageEvent {
    pub member_id: i64,
    pub location: String,
    pub occurred_at: NaiveDateTime,
}

/// One aggregation result per member per run: the member's favorite
/// neighborhood and favorite hour over the lookback window.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct UsageProfile {
    pub member_id: i64,
    pub top_location: String,
    pub top_hour: i16,
    pub aggregated_at: NaiveDate,
}

/// Message sent to the notifications topic, one per (member, device token).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UsageNotification {
    pub trace_id: Uuid,
    pub member_id: i64,
    pub token: String,
    pub top_location: String,
    pub top_hour: i16,
    pub active_event_count: i64,
}

impl UsageNotification {
    pub fn new(profile: &UsageProfile, token: String, active_event_count: i64) -> Self {
        let trace_id = notification_trace_id(
            profile.aggregated_at,
            profile.member_id,
            &token,
            &profile.top_location,
            profile.top_hour,
        );
        UsageNotification {
            trace_id,
            member_id: profile.member_id,
            token,
            top_location: profile.top_location.clone(),
            top_hour: profile.top_hour,
            active_event_count,
        }
    }
}

/// Deterministic id for one (profile, token) send. Identical inputs always
/// produce the identical id, so a duplicate delivery is recognizable
/// downstream by its trace id.
pub fn notification_trace_id(
    aggregated_at: NaiveDate,
    member_id: i64,
    token: &str,
    top_location: &str,
    top_hour: i16,
) -> Uuid {
    // Newline-joined; none of the fields can contain one.
    let name = format!("{aggregated_at}\n{member_id}\n{token}\n{top_location}\n{top_hour}");
    Uuid::new_v5(&TRACE_ID_NAMESPACE, name.as_bytes())
}
