use std::collections::HashMap;

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::EnrichmentError;

/// Batched member-to-device-token lookup. The contract is collection-only
/// on purpose: there is no single-member variant, so a chunk is always one
/// call no matter how many members it holds.
#[async_trait]
pub trait TokenRegistry: Send + Sync {
    async fn tokens_by_member(
        &self,
        member_ids: &[i64],
    ) -> Result<HashMap<i64, Vec<String>>, EnrichmentError>;
}

/// Batched location-to-store resolution, collection-only for the same
/// reason as [`TokenRegistry`].
#[async_trait]
pub trait StoreRegistry: Send + Sync {
    async fn stores_by_location(
        &self,
        locations: &[String],
    ) -> Result<HashMap<String, Vec<i64>>, EnrichmentError>;
}

fn is_retryable_status(status: StatusCode) -> bool {
    status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error()
}

async fn post_search<R, Row>(
    client: &reqwest::Client,
    url: &str,
    request: &R,
) -> Result<Vec<Row>, EnrichmentError>
where
    R: Serialize,
    Row: DeserializeOwned,
{
    let response = client
        .post(url)
        .json(request)
        .send()
        .await
        .map_err(EnrichmentError::RetryableRequest)?;

    let response = match response.error_for_status() {
        Ok(response) => response,
        Err(error) => {
            return Err(match error.status() {
                Some(status) if is_retryable_status(status) => {
                    EnrichmentError::RetryableRequest(error)
                }
                _ => EnrichmentError::NonRetryableRequest(error),
            })
        }
    };

    response
        .json()
        .await
        .map_err(EnrichmentError::NonRetryableRequest)
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct TokenSearchRequest<'a> {
    member_ids: &'a [i64],
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct TokenSearchRow {
    member_id: i64,
    tokens: Vec<String>,
}

#[derive(Clone)]
pub struct HttpTokenRegistry {
    client: reqwest::Client,
    search_url: String,
    page_size: usize,
}

impl HttpTokenRegistry {
    pub fn new(client: reqwest::Client, base_url: &str, page_size: usize) -> Self {
        Self {
            client,
            search_url: format!(
                "{}/internal/v1/member-tokens/search",
                base_url.trim_end_matches('/')
            ),
            page_size: page_size.max(1),
        }
    }
}

#[async_trait]
impl TokenRegistry for HttpTokenRegistry {
    async fn tokens_by_member(
        &self,
        member_ids: &[i64],
    ) -> Result<HashMap<i64, Vec<String>>, EnrichmentError> {
        let mut tokens = HashMap::with_capacity(member_ids.len());
        // Pages are a transport bound only, callers still see one lookup.
        for page in member_ids.chunks(self.page_size) {
            let rows: Vec<TokenSearchRow> = post_search(
                &self.client,
                &self.search_url,
                &TokenSearchRequest { member_ids: page },
            )
            .await?;
            for row in rows {
                tokens.insert(row.member_id, row.tokens);
            }
        }
        Ok(tokens)
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct StoreSearchRequest<'a> {
    locations: &'a [String],
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct StoreSearchRow {
    location: String,
    store_ids: Vec<i64>,
}

#[derive(Clone)]
pub struct HttpStoreRegistry {
    client: reqwest::Client,
    search_url: String,
    page_size: usize,
}

impl HttpStoreRegistry {
    pub fn new(client: reqwest::Client, base_url: &str, page_size: usize) -> Self {
        Self {
            client,
            search_url: format!(
                "{}/internal/v1/stores/search",
                base_url.trim_end_matches('/')
            ),
            page_size: page_size.max(1),
        }
    }
}

#[async_trait]
impl StoreRegistry for HttpStoreRegistry {
    async fn stores_by_location(
        &self,
        locations: &[String],
    ) -> Result<HashMap<String, Vec<i64>>, EnrichmentError> {
        let mut stores = HashMap::with_capacity(locations.len());
        for page in locations.chunks(self.page_size) {
            let rows: Vec<StoreSearchRow> = post_search(
                &self.client,
                &self.search_url,
                &StoreSearchRequest { locations: page },
            )
            .await?;
            for row in rows {
                stores.insert(row.location, row.store_ids);
            }
        }
        Ok(stores)
    }
}
