pub mod cleanup;
pub mod config;
pub mod metrics_consts;
