pub const EVENTS_READ: &str = "usage_agg_events_read";
pub const MEMBERS_ELIGIBLE: &str = "usage_agg_members_eligible";
pub const PROFILES_WRITTEN: &str = "usage_agg_profiles_written";
pub const RUN_TIME: &str = "usage_agg_run_time_ms";
