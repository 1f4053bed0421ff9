pub mod config;
pub mod coupon_events;
pub mod enrichment;
pub mod error;
pub mod metrics_consts;
pub mod pipeline;
pub mod publisher;
