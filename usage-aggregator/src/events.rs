use sqlx::postgres::PgPool;
use usage_common::{profile_store::StoreError, types::UsageEvent};

use crate::aggregate::AggregationWindow;

/// Read side of the upstream usage-event table. Rows are written by the
/// transactional system; this crate only ever selects from it.
pub struct EventSource {
    pool: PgPool,
}

impl EventSource {
    pub fn new(pool: PgPool) -> Self {
        EventSource { pool }
    }

    /// All events in the window, one shot. The window is bounded and the
    /// aggregation is all-or-nothing, so a single fetch keeps the failure
    /// semantics simple: any error here aborts the run.
    pub async fn fetch_events(
        &self,
        window: &AggregationWindow,
    ) -> Result<Vec<UsageEvent>, StoreError> {
        sqlx::query_as::<_, UsageEvent>(
            "SELECT member_id, location, occurred_at
    FROM coupon_usage_events
    WHERE occurred_at BETWEEN $1 AND $2
    ORDER BY member_id, occurred_at",
        )
        .bind(window.from)
        .bind(window.to)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| StoreError::Query {
            command: "fetch_events",
            error: e,
        })
    }
}
