use std::str::FromStr;

use chrono::NaiveDate;
use sqlx::postgres::PgPool;
use thiserror::Error;
use tracing::debug;

use crate::types::UsageProfile;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("{command} query failed: {error}")]
    Query {
        command: &'static str,
        error: sqlx::Error,
    },
}

impl StoreError {
    pub fn is_transient(&self) -> bool {
        match self {
            StoreError::Query { error, .. } => common_database::is_transient_error(error),
        }
    }
}

/// How aggregation output lands in the profile table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProfileWriteMode {
    /// One new row per (member, run date); history retained.
    Append,
    /// Overwrite top_location/top_hour when the same (member, run date)
    /// is aggregated again, so re-runs are idempotent.
    Upsert,
}

impl FromStr for ProfileWriteMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "append" => Ok(ProfileWriteMode::Append),
            "upsert" => Ok(ProfileWriteMode::Upsert),
            _ => Err(format!("unknown profile write mode: {s}")),
        }
    }
}

fn write_statement(mode: ProfileWriteMode) -> String {
    let insert = "INSERT INTO coupon_usage_profiles (member_id, top_location, top_hour, aggregated_at)
    SELECT * FROM UNNEST($1::bigint[], $2::text[], $3::smallint[], $4::date[])";
    match mode {
        ProfileWriteMode::Append => insert.to_string(),
        ProfileWriteMode::Upsert => format!(
            "{insert}
    ON CONFLICT (member_id, aggregated_at)
    DO UPDATE SET top_location = EXCLUDED.top_location, top_hour = EXCLUDED.top_hour"
        ),
    }
}

/// Access to the aggregated profile table. The aggregator writes it, the
/// dispatcher reads it, the janitor expires it; nothing else touches it.
#[derive(Clone)]
pub struct ProfileStore {
    pool: PgPool,
}

impl ProfileStore {
    pub fn new(pool: PgPool) -> Self {
        ProfileStore { pool }
    }

    /// Write one batch of profiles in a single statement.
    pub async fn write_profiles(
        &self,
        profiles: &[UsageProfile],
        mode: ProfileWriteMode,
    ) -> Result<u64, StoreError> {
        if profiles.is_empty() {
            return Ok(0);
        }

        let mut member_ids = Vec::with_capacity(profiles.len());
        let mut top_locations = Vec::with_capacity(profiles.len());
        let mut top_hours = Vec::with_capacity(profiles.len());
        let mut aggregated_ats = Vec::with_capacity(profiles.len());
        for profile in profiles {
            member_ids.push(profile.member_id);
            top_locations.push(profile.top_location.clone());
            top_hours.push(profile.top_hour);
            aggregated_ats.push(profile.aggregated_at);
        }

        let result = sqlx::query(&write_statement(mode))
            .bind(&member_ids)
            .bind(&top_locations)
            .bind(&top_hours)
            .bind(&aggregated_ats)
            .execute(&self.pool)
            .await
            .map_err(|e| StoreError::Query {
                command: "write_profiles",
                error: e,
            })?;

        debug!(rows = result.rows_affected(), "wrote profile batch");
        Ok(result.rows_affected())
    }

    /// One page of "the most recent profile per member whose top hour is
    /// `target_hour`, aggregated within `[from, to]`", ordered by member id.
    ///
    /// The latest-per-member resolution happens server-side; the table may
    /// hold many historical rows per member. `after_member` is the keyset
    /// cursor: pass the last member id of the previous page, or `None` to
    /// start from the beginning.
    pub async fn latest_profiles_page(
        &self,
        from: NaiveDate,
        to: NaiveDate,
        target_hour: i16,
        after_member: Option<i64>,
        limit: i64,
    ) -> Result<Vec<UsageProfile>, StoreError> {
        let profiles = sqlx::query_as::<_, UsageProfile>(
            "SELECT p.member_id, p.top_location, p.top_hour, p.aggregated_at
    FROM coupon_usage_profiles p
    INNER JOIN (
        SELECT member_id, MAX(aggregated_at) AS aggregated_at
        FROM coupon_usage_profiles
        WHERE top_hour = $1
          AND aggregated_at BETWEEN $2 AND $3
        GROUP BY member_id
    ) latest ON latest.member_id = p.member_id
            AND latest.aggregated_at = p.aggregated_at
    WHERE p.top_hour = $1
      AND ($4::bigint IS NULL OR p.member_id > $4)
    ORDER BY p.member_id
    LIMIT $5",
        )
        .bind(target_hour)
        .bind(from)
        .bind(to)
        .bind(after_member)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| StoreError::Query {
            command: "latest_profiles_page",
            error: e,
        })?;

        Ok(profiles)
    }

    /// Delete profiles aggregated before `cutoff`. Returns rows deleted.
    pub async fn delete_profiles_before(&self, cutoff: NaiveDate) -> Result<u64, StoreError> {
        let result = sqlx::query("DELETE FROM coupon_usage_profiles WHERE aggregated_at < $1")
            .bind(cutoff)
            .execute(&self.pool)
            .await
            .map_err(|e| StoreError::Query {
                command: "delete_profiles_before",
                error: e,
            })?;

        Ok(result.rows_affected())
    }
}
