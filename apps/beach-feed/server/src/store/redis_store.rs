use async_trait::async_trait;
use beach_feed_core::{ActionQuery, History, Product};
use redis::{aio::ConnectionManager, AsyncCommands, Client};
use tracing::{debug, warn};

use super::{
    ActionRecord, ActionStore, HistoryStore, ProductCatalog, RecommendationRequest,
    RecommendationSource,
};
use crate::error::UpstreamError;

/// Redis-backed history, action log, product catalog and a sampling
/// recommendation source.
///
/// History and action keys expire `ttl_seconds` after their last write.
#[derive(Clone)]
pub struct RedisStore {
    redis: ConnectionManager,
    ttl_seconds: u64,
}

impl RedisStore {
    pub async fn connect(redis_url: &str, ttl_seconds: u64) -> Result<Self, UpstreamError> {
        let client = Client::open(redis_url)?;
        let redis = ConnectionManager::new(client).await?;
        Ok(Self { redis, ttl_seconds })
    }
}

#[async_trait]
impl HistoryStore for RedisStore {
    async fn get(&self, user_id: &str) -> Result<Option<History>, UpstreamError> {
        let mut conn = self.redis.clone();
        let value: Option<String> = conn.get(history_key(user_id)).await?;
        match value {
            Some(json) => Ok(Some(serde_json::from_str(&json)?)),
            None => Ok(None),
        }
    }

    async fn put(&self, history: &History) -> Result<(), UpstreamError> {
        let mut conn = self.redis.clone();
        let value = serde_json::to_string(history)?;
        conn.set_ex::<_, _, ()>(history_key(&history.user_id), value, self.ttl_seconds)
            .await?;
        Ok(())
    }
}

#[async_trait]
impl ActionStore for RedisStore {
    async fn record(&self, record: ActionRecord) -> Result<(), UpstreamError> {
        let mut conn = self.redis.clone();
        let key = actions_key(&record.user_id);
        let serialized = serde_json::to_string(&record)?;
        redis::pipe()
            .cmd("RPUSH")
            .arg(&key)
            .arg(&serialized)
            .ignore()
            .cmd("EXPIRE")
            .arg(&key)
            .arg(self.ttl_seconds)
            .ignore()
            .query_async::<()>(&mut conn)
            .await?;
        Ok(())
    }
}

#[async_trait]
impl ProductCatalog for RedisStore {
    async fn load(&self, ids: &[String]) -> Result<Vec<Product>, UpstreamError> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let mut conn = self.redis.clone();
        let keys: Vec<String> = ids.iter().map(|id| product_key(id)).collect();
        let values: Vec<Option<String>> = redis::cmd("MGET")
            .arg(keys)
            .query_async(&mut conn)
            .await?;

        let mut products = Vec::with_capacity(ids.len());
        for (id, value) in ids.iter().zip(values) {
            let Some(json) = value else {
                debug!(product_id = %id, "product missing from catalog");
                continue;
            };
            match serde_json::from_str::<Product>(&json) {
                Ok(product) => products.push(product),
                Err(err) => warn!(product_id = %id, error = %err, "skipping unreadable product"),
            }
        }
        Ok(products)
    }
}

#[async_trait]
impl RecommendationSource for RedisStore {
    async fn fetch(&self, request: &RecommendationRequest) -> Result<Vec<String>, UpstreamError> {
        if request.count == 0 {
            return Ok(Vec::new());
        }
        let sample = match request.query {
            Some(_) => request.count.saturating_mul(SCOPED_OVERSAMPLE),
            None => request.count,
        };
        let mut conn = self.redis.clone();
        let ids: Vec<String> = redis::cmd("SRANDMEMBER")
            .arg(PRODUCT_IDS_KEY)
            .arg(sample)
            .query_async(&mut conn)
            .await?;

        let Some(query) = &request.query else {
            return Ok(ids);
        };
        let products = self.load(&ids).await?;
        let scoped = in_scope(&products, query, request.count);
        debug!(
            user_id = %request.user_id,
            sampled = ids.len(),
            matched = scoped.len(),
            "sampled scoped candidates"
        );
        Ok(scoped)
    }
}

const PRODUCT_IDS_KEY: &str = "products:ids";
/// Scoped fetches sample this many ids per requested candidate before
/// filtering them against the catalog.
const SCOPED_OVERSAMPLE: usize = 4;

fn in_scope(products: &[Product], query: &ActionQuery, count: usize) -> Vec<String> {
    products
        .iter()
        .filter(|product| query.matches(product.fields()))
        .filter_map(|product| product.product_id().map(str::to_owned))
        .take(count)
        .collect()
}

fn history_key(user_id: &str) -> String {
    format!("feed:history:{}", user_id)
}

fn actions_key(user_id: &str) -> String {
    format!("feed:actions:{}", user_id)
}

fn product_key(product_id: &str) -> String {
    format!("product:{}", product_id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Map};

    #[test_timeout::timeout]
    fn keys_are_namespaced_per_user() {
        assert_eq!(history_key("u1"), "feed:history:u1");
        assert_eq!(actions_key("u1"), "feed:actions:u1");
        assert_eq!(product_key("p9"), "product:p9");
    }

    #[test_timeout::timeout]
    fn scoped_sample_keeps_matching_products_up_to_count() {
        let products: Vec<Product> = [
            ("p1", "Beach sandals"),
            ("p2", "Wool hat"),
            ("p3", "Leather sandals"),
            ("p4", "Sandals, kids"),
        ]
        .into_iter()
        .map(|(id, title)| {
            let mut fields = Map::new();
            fields.insert("product_id".into(), json!(id));
            fields.insert("title".into(), json!(title));
            Product::new(fields)
        })
        .collect();
        let query = ActionQuery {
            text: Some("SANDALS".into()),
            filter: None,
        };

        assert_eq!(in_scope(&products, &query, 2), ["p1", "p3"]);
        assert_eq!(in_scope(&products, &query, 10), ["p1", "p3", "p4"]);
    }
}
