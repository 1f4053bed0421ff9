pub mod config;
pub mod kafka_producer;

pub const USAGE_NOTIFICATIONS_TOPIC: &str = "coupon_usage_notifications";
