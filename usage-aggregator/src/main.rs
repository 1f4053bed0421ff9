use anyhow::Context;
use envconfig::Envconfig;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

use usage_aggregator::config::Config;
use usage_aggregator::events::EventSource;
use usage_aggregator::job::{run_aggregation, AggregationParams};
use usage_common::profile_store::ProfileStore;

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
    let run_date = config.resolved_run_date();

    let pool = common_database::get_pool(&config.database_url, config.max_pg_connections)
        .await
        .context("connecting to postgres")?;

    let params = AggregationParams {
        run_date,
        window_days: config.aggregation_window_days,
        usage_count_threshold: config.usage_count_threshold,
        write_chunk_size: config.write_chunk_size,
        write_mode: config.write_mode,
    };

    let source = EventSource::new(pool.clone());
    let store = ProfileStore::new(pool);
    let summary = run_aggregation(&source, &store, &params)
        .await
        .context("aggregation run failed")?;

    info!(
        profiles_written = summary.profiles_written,
        "aggregation run complete"
    );
    Ok(())
}
