use std::time::Duration;

use anyhow::Context;
use envconfig::Envconfig;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

use common_kafka::kafka_producer::create_kafka_producer;
use usage_common::profile_store::ProfileStore;
use usage_dispatcher::config::Config;
use usage_dispatcher::coupon_events::CouponEventStore;
use usage_dispatcher::enrichment::{HttpStoreRegistry, HttpTokenRegistry};
use usage_dispatcher::pipeline::{DispatchParams, DispatchPipeline};
use usage_dispatcher::publisher::KafkaPublisher;

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
    let (reference_date, reference_hour) = config.resolved_reference();

    let pool = common_database::get_pool(&config.database_url, config.max_pg_connections)
        .await
        .context("connecting to postgres")?;

    let kafka_producer = create_kafka_producer(&config.kafka)
        .await
        .context("connecting to kafka")?;

    let http_client = reqwest::Client::builder()
        .timeout(Duration::from_millis(config.registry_timeout_ms))
        .build()
        .context("building http client")?;

    let profiles = ProfileStore::new(pool.clone());
    let tokens = HttpTokenRegistry::new(
        http_client.clone(),
        &config.token_registry_url,
        config.registry_page_size,
    );
    let stores = HttpStoreRegistry::new(
        http_client,
        &config.store_registry_url,
        config.registry_page_size,
    );
    let events = CouponEventStore::new(pool);
    let publisher = KafkaPublisher::new(kafka_producer, config.kafka_topic.clone());

    let params = DispatchParams {
        reference_date,
        reference_hour,
        lookback_days: config.lookback_days,
        chunk_size: config.chunk_size,
        skip_limit: config.effective_skip_limit(),
        retry_policy: config.retry.policy(),
    };

    let pipeline = DispatchPipeline::new(&profiles, &tokens, &stores, &events, &publisher);
    let summary = pipeline.run(&params).await.context("dispatch run failed")?;

    info!(
        members_dispatched = summary.members_dispatched,
        messages_sent = summary.messages_sent,
        "dispatch run complete"
    );
    Ok(())
}
