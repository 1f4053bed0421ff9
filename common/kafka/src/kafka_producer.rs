use rdkafka::error::KafkaError;
use rdkafka::producer::{FutureProducer, FutureRecord, Producer};
use rdkafka::ClientConfig;
use serde::Serialize;
use serde_json::error::Error as SerdeError;
use thiserror::Error;
use tracing::{debug, error, info};

use crate::config::KafkaConfig;

#[derive(Default)]
pub struct KafkaContext;

impl rdkafka::ClientContext for KafkaContext {
    fn stats(&self, stats: rdkafka::Statistics) {
        debug!(
            msg_cnt = stats.msg_cnt,
            tx = stats.tx,
            "rdkafka producer statistics"
        );
    }
}

pub async fn create_kafka_producer(
    config: &KafkaConfig,
) -> Result<FutureProducer<KafkaContext>, KafkaError> {
    let mut client_config = ClientConfig::new();
    client_config
        .set("bootstrap.servers", &config.kafka_hosts)
        .set("statistics.interval.ms", "10000")
        .set("linger.ms", config.kafka_producer_linger_ms.to_string())
        .set(
            "message.timeout.ms",
            config.kafka_message_timeout_ms.to_string(),
        )
        .set(
            "compression.codec",
            config.kafka_compression_codec.to_owned(),
        )
        .set(
            "queue.buffering.max.kbytes",
            (config.kafka_producer_queue_mib * 1024).to_string(),
        )
        .set(
            "queue.buffering.max.messages",
            config.kafka_producer_queue_messages.to_string(),
        );

    if config.kafka_tls {
        client_config
            .set("security.protocol", "ssl")
            .set("enable.ssl.certificate.verification", "false");
    };

    debug!("rdkafka configuration: {:?}", client_config);
    let producer: FutureProducer<KafkaContext> = client_config.create_with_context(KafkaContext)?;

    // "Ping" the brokers by requesting metadata before the first real send
    match producer
        .client()
        .fetch_metadata(None, std::time::Duration::from_secs(15))
    {
        Ok(metadata) => {
            info!(
                "Connected to Kafka brokers. Found {} topics.",
                metadata.topics().len()
            );
        }
        Err(e) => {
            error!("Failed to fetch metadata from Kafka brokers: {:?}", e);
            return Err(e);
        }
    }

    Ok(producer)
}

#[derive(Error, Debug)]
pub enum KafkaProduceError {
    #[error("failed to serialize: {error}")]
    SerializationError { error: SerdeError },
    #[error("failed to produce to kafka: {error}")]
    KafkaProduceError { error: KafkaError },
    #[error("failed to produce to kafka (timeout)")]
    KafkaProduceCanceled,
}

/// Send one JSON-serialized payload and wait for broker acknowledgement.
pub async fn send_keyed_to_kafka<T>(
    kafka_producer: &FutureProducer<KafkaContext>,
    topic: &str,
    key: &str,
    payload: &T,
) -> Result<(), KafkaProduceError>
where
    T: Serialize,
{
    let payload = serde_json::to_string(payload)
        .map_err(|e| KafkaProduceError::SerializationError { error: e })?;

    let record = FutureRecord {
        topic,
        key: Some(key),
        payload: Some(&payload),
        timestamp: None,
        partition: None,
        headers: None,
    };

    let handle = kafka_producer
        .send_result(record)
        .map_err(|(e, _)| KafkaProduceError::KafkaProduceError { error: e })?;

    match handle.await {
        Ok(Ok(_)) => Ok(()),
        Ok(Err((e, _))) => Err(KafkaProduceError::KafkaProduceError { error: e }),
        Err(_) => Err(KafkaProduceError::KafkaProduceCanceled),
    }
}
