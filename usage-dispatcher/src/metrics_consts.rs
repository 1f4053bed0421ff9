pub const PROFILES_READ: &str = "usage_dispatch_profiles_read";
pub const CHUNKS_PROCESSED: &str = "usage_dispatch_chunks_processed";
pub const MEMBERS_DISPATCHED: &str = "usage_dispatch_members_dispatched";
pub const MESSAGES_SENT: &str = "usage_dispatch_messages_sent";
pub const ITEMS_SKIPPED: &str = "usage_dispatch_items_skipped";
pub const ITEMS_FAILED: &str = "usage_dispatch_items_failed";
pub const RUN_TIME: &str = "usage_dispatch_run_time_ms";
