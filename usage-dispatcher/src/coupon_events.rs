use async_trait::async_trait;
use chrono::NaiveDateTime;
use sqlx::postgres::PgPool;

use usage_common::profile_store::StoreError;

use crate::error::EnrichmentError;

/// Counts coupon events that are live at a given instant across a set of
/// stores.
#[async_trait]
pub trait ActiveEventSource: Send + Sync {
    async fn active_event_count(
        &self,
        store_ids: &[i64],
        at: NaiveDateTime,
    ) -> Result<i64, EnrichmentError>;
}

pub struct CouponEventStore {
    pool: PgPool,
}

impl CouponEventStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ActiveEventSource for CouponEventStore {
    /// An event counts while the instant falls inside [start_at, end_at)
    /// and it still has coupons left to issue.
    async fn active_event_count(
        &self,
        store_ids: &[i64],
        at: NaiveDateTime,
    ) -> Result<i64, EnrichmentError> {
        let (count,): (i64,) = sqlx::query_as(
            r#"
SELECT COUNT(*)
FROM coupon_events
WHERE store_id = ANY($1)
    AND start_at <= $2
    AND $2 < end_at
    AND issued_count < total_count
            "#,
        )
        .bind(store_ids)
        .bind(at)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| StoreError::Query {
            command: "active_event_count",
            error: e,
        })?;

        Ok(count)
    }
}
