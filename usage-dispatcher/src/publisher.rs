use async_trait::async_trait;
use rdkafka::producer::FutureProducer;

use common_kafka::kafka_producer::{send_keyed_to_kafka, KafkaContext};
use usage_common::types::UsageNotification;

use crate::error::PublishError;

/// Hands one notification to the durable topic. Sends are awaited, so the
/// broker has acknowledged a message before the next one goes out.
#[async_trait]
pub trait MessagePublisher: Send + Sync {
    async fn publish(&self, notification: &UsageNotification) -> Result<(), PublishError>;
}

pub struct KafkaPublisher {
    producer: FutureProducer<KafkaContext>,
    topic: String,
}

impl KafkaPublisher {
    pub fn new(producer: FutureProducer<KafkaContext>, topic: String) -> Self {
        Self { producer, topic }
    }
}

#[async_trait]
impl MessagePublisher for KafkaPublisher {
    async fn publish(&self, notification: &UsageNotification) -> Result<(), PublishError> {
        // Keyed by member so one member's notifications stay in order.
        let key = notification.member_id.to_string();
        send_keyed_to_kafka(&self.producer, &self.topic, &key, notification).await?;
        Ok(())
    }
}
