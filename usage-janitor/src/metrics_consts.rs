pub const PROFILES_DELETED: &str = "usage_janitor_profiles_deleted";
