use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::debug;

use super::{RecommendationRequest, RecommendationSource};
use crate::error::UpstreamError;

/// Recommendation source backed by a remote ranking service.
///
/// Posts `{user_id, count, query}` and expects `{product_ids: [...]}` back.
#[derive(Clone)]
pub struct HttpRecommender {
    client: reqwest::Client,
    url: String,
}

#[derive(Debug, Deserialize)]
struct RecommendationResponse {
    #[serde(default)]
    product_ids: Vec<String>,
}

impl HttpRecommender {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self, UpstreamError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }
}

#[async_trait]
impl RecommendationSource for HttpRecommender {
    async fn fetch(&self, request: &RecommendationRequest) -> Result<Vec<String>, UpstreamError> {
        let resp = self.client.post(&self.url).json(request).send().await?;
        let status = resp.status();
        if !status.is_success() {
            return Err(UpstreamError::Status(status.as_u16()));
        }
        let body: RecommendationResponse = resp.json().await?;
        let mut ids = body.product_ids;
        if ids.len() > request.count {
            debug!(
                user_id = %request.user_id,
                requested = request.count,
                returned = ids.len(),
                "truncating oversized recommendation batch"
            );
            ids.truncate(request.count);
        }
        Ok(ids)
    }
}
