//! Narrow interfaces to the collaborators the feed depends on, with Redis,
//! HTTP and in-memory implementations.

use std::sync::Arc;

use async_trait::async_trait;
use beach_feed_core::{ActionQuery, History, Product};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::UpstreamError;

pub mod memory;
pub mod recommender;
pub mod redis_store;

#[async_trait]
pub trait HistoryStore: Send + Sync {
    async fn get(&self, user_id: &str) -> Result<Option<History>, UpstreamError>;
    async fn put(&self, history: &History) -> Result<(), UpstreamError>;
}

#[async_trait]
pub trait ActionStore: Send + Sync {
    async fn record(&self, record: ActionRecord) -> Result<(), UpstreamError>;
}

/// Ranks and returns candidate product ids for a user. Duplicates across
/// calls are allowed.
#[async_trait]
pub trait RecommendationSource: Send + Sync {
    async fn fetch(&self, request: &RecommendationRequest) -> Result<Vec<String>, UpstreamError>;
}

/// Resolves product ids to full records, preserving input order and skipping
/// unknown ids.
#[async_trait]
pub trait ProductCatalog: Send + Sync {
    async fn load(&self, ids: &[String]) -> Result<Vec<Product>, UpstreamError>;
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RecommendationRequest {
    pub user_id: String,
    pub count: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub query: Option<ActionQuery>,
}

/// One swipe as persisted to the action store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionRecord {
    pub action_id: String,
    pub user_id: String,
    pub product_id: String,
    pub action_type: String,
    pub recorded_at: DateTime<Utc>,
}

impl ActionRecord {
    pub fn new(
        user_id: impl Into<String>,
        product_id: impl Into<String>,
        action_type: impl Into<String>,
    ) -> Self {
        Self {
            action_id: Uuid::new_v4().to_string(),
            user_id: user_id.into(),
            product_id: product_id.into(),
            action_type: action_type.into(),
            recorded_at: Utc::now(),
        }
    }
}

/// The full set of collaborators a feed session talks to.
#[derive(Clone)]
pub struct FeedStores {
    pub history: Arc<dyn HistoryStore>,
    pub actions: Arc<dyn ActionStore>,
    pub source: Arc<dyn RecommendationSource>,
    pub catalog: Arc<dyn ProductCatalog>,
}
