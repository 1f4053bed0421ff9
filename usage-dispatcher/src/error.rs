use thiserror::Error;

use common_kafka::kafka_producer::KafkaProduceError;
use usage_common::profile_store::StoreError;

/// Failures while enriching a chunk item, either from a registry call or
/// from the coupon event store.
#[derive(Error, Debug)]
pub enum EnrichmentError {
    #[error("retryable registry request error: {0}")]
    RetryableRequest(reqwest::Error),
    #[error("non-retryable registry request error: {0}")]
    NonRetryableRequest(reqwest::Error),
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl EnrichmentError {
    pub fn is_retryable(&self) -> bool {
        match self {
            EnrichmentError::RetryableRequest(_) => true,
            EnrichmentError::NonRetryableRequest(_) => false,
            EnrichmentError::Store(error) => error.is_transient(),
        }
    }
}

#[derive(Error, Debug)]
pub enum PublishError {
    #[error("failed to publish notification: {0}")]
    Kafka(#[from] KafkaProduceError),
}

/// Errors that end the whole dispatch run.
#[derive(Error, Debug)]
pub enum DispatchError {
    #[error("reading profiles failed: {0}")]
    ProfileRead(#[from] StoreError),
    #[error(transparent)]
    Publish(#[from] PublishError),
    #[error("{skipped} items failed, exceeding the cap of {limit}")]
    SkipLimitExceeded { skipped: usize, limit: usize },
}
