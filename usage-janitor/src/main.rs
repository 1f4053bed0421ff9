use anyhow::Context;
use envconfig::Envconfig;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

use usage_common::profile_store::ProfileStore;
use usage_janitor::cleanup::clean_profiles;
use usage_janitor::config::Config;

fn setup_tracing() {
    let log_layer: tracing_subscriber::filter::Filtered<
        tracing_subscriber::fmt::Layer<tracing_subscriber::Registry>,
        EnvFilter,
        tracing_subscriber::Registry,
    > = tracing_subscriber::fmt::layer().with_filter(EnvFilter::from_default_env());
    tracing_subscriber::registry().with(log_layer).init();
}

#[tokio::main]
async fn main() -> Result<(), anyhow::Error> {
    setup_tracing();
    info!("Starting up...");

    let config = Config::init_from_env().context("loading configuration")?;
    let pool = common_database::get_pool(&config.database_url, config.max_pg_connections)
        .await
        .context("connecting to postgres")?;

    let store = ProfileStore::new(pool);
    let deleted = clean_profiles(&store, config.resolved_sweep_date(), config.retention_days)
        .await
        .context("retention sweep failed")?;

    info!(deleted, "janitor run complete");
    Ok(())
}
