pub mod aggregate;
pub mod config;
pub mod events;
pub mod job;
pub mod metrics_consts;
