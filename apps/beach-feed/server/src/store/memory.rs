//! Process-local stores used for development runs and tests.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use beach_feed_core::{ActionQuery, History, Product};
use dashmap::DashMap;
use parking_lot::Mutex;

use super::{
    ActionRecord, ActionStore, FeedStores, HistoryStore, ProductCatalog, RecommendationRequest,
    RecommendationSource,
};
use crate::error::UpstreamError;

#[derive(Default)]
pub struct MemoryHistoryStore {
    histories: DashMap<String, History>,
    failing: AtomicBool,
}

impl MemoryHistoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every subsequent call fail with [`UpstreamError::Unavailable`].
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn snapshot(&self, user_id: &str) -> Option<History> {
        self.histories.get(user_id).map(|entry| entry.value().clone())
    }

    fn check(&self) -> Result<(), UpstreamError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(UpstreamError::Unavailable("history store".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl HistoryStore for MemoryHistoryStore {
    async fn get(&self, user_id: &str) -> Result<Option<History>, UpstreamError> {
        self.check()?;
        Ok(self.snapshot(user_id))
    }

    async fn put(&self, history: &History) -> Result<(), UpstreamError> {
        self.check()?;
        self.histories
            .insert(history.user_id.clone(), history.clone());
        Ok(())
    }
}

#[derive(Default)]
pub struct MemoryActionStore {
    records: Mutex<Vec<ActionRecord>>,
    failing: AtomicBool,
}

impl MemoryActionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn records(&self) -> Vec<ActionRecord> {
        self.records.lock().clone()
    }
}

#[async_trait]
impl ActionStore for MemoryActionStore {
    async fn record(&self, record: ActionRecord) -> Result<(), UpstreamError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(UpstreamError::Unavailable("action store".into()));
        }
        self.records.lock().push(record);
        Ok(())
    }
}

/// Catalog that answers id-only records for products it was never told about.
#[derive(Default)]
pub struct MemoryCatalog {
    products: DashMap<String, Product>,
    failing: AtomicBool,
}

impl MemoryCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, product: Product) {
        if let Some(id) = product.product_id().map(str::to_owned) {
            self.products.insert(id, product);
        }
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }
}

#[async_trait]
impl ProductCatalog for MemoryCatalog {
    async fn load(&self, ids: &[String]) -> Result<Vec<Product>, UpstreamError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(UpstreamError::Unavailable("product catalog".into()));
        }
        Ok(ids
            .iter()
            .map(|id| {
                self.products
                    .get(id)
                    .map(|entry| entry.value().clone())
                    .unwrap_or_else(|| Product::from_id(id.clone()))
            })
            .collect())
    }
}

/// Walks a fixed pool of ids, each user from their own offset, wrapping
/// around once the pool is exhausted.
///
/// Scoped requests only walk the pool ids whose catalog record matches the
/// query, and return at most one pass over them, so a narrow scope comes back
/// short.
pub struct MemorySource {
    pool: Vec<String>,
    catalog: Option<Arc<MemoryCatalog>>,
    offsets: DashMap<String, usize>,
    calls: AtomicUsize,
    requests: Mutex<Vec<RecommendationRequest>>,
    failing: AtomicBool,
}

impl MemorySource {
    pub fn new(pool: Vec<String>) -> Self {
        Self {
            pool,
            catalog: None,
            offsets: DashMap::new(),
            calls: AtomicUsize::new(0),
            requests: Mutex::new(Vec::new()),
            failing: AtomicBool::new(false),
        }
    }

    /// Pool of `p1..=pN`.
    pub fn numbered(count: usize) -> Self {
        Self::new((1..=count).map(|i| format!("p{i}")).collect())
    }

    /// Resolves query scopes against `catalog`.
    pub fn with_catalog(mut self, catalog: Arc<MemoryCatalog>) -> Self {
        self.catalog = Some(catalog);
        self
    }

    fn in_scope(&self, query: &ActionQuery) -> Vec<String> {
        self.pool
            .iter()
            .filter(|id| {
                let product = self
                    .catalog
                    .as_ref()
                    .and_then(|catalog| catalog.products.get(id.as_str()))
                    .map(|entry| entry.value().clone())
                    .unwrap_or_else(|| Product::from_id(id.as_str()));
                query.matches(product.fields())
            })
            .cloned()
            .collect()
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn requests(&self) -> Vec<RecommendationRequest> {
        self.requests.lock().clone()
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }
}

#[async_trait]
impl RecommendationSource for MemorySource {
    async fn fetch(&self, request: &RecommendationRequest) -> Result<Vec<String>, UpstreamError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.requests.lock().push(request.clone());
        if self.failing.load(Ordering::SeqCst) {
            return Err(UpstreamError::Unavailable("recommendation source".into()));
        }

        let (candidates, count, key) = match &request.query {
            Some(query) => {
                let candidates = self.in_scope(query);
                let count = request.count.min(candidates.len());
                let key = format!("{}\n{}", request.user_id, serde_json::to_string(query)?);
                (candidates, count, key)
            }
            None => (self.pool.clone(), request.count, request.user_id.clone()),
        };
        if candidates.is_empty() {
            return Ok(Vec::new());
        }

        let mut offset = self.offsets.entry(key).or_insert(0);
        let ids = (0..count)
            .map(|step| candidates[(*offset + step) % candidates.len()].clone())
            .collect();
        *offset = (*offset + count) % candidates.len();
        Ok(ids)
    }
}

/// Concrete handles to an in-memory store set, kept so callers can inspect
/// or fail individual collaborators.
#[derive(Clone)]
pub struct MemoryStores {
    pub history: Arc<MemoryHistoryStore>,
    pub actions: Arc<MemoryActionStore>,
    pub source: Arc<MemorySource>,
    pub catalog: Arc<MemoryCatalog>,
}

impl MemoryStores {
    pub fn new(source: MemorySource) -> Self {
        let catalog = Arc::new(MemoryCatalog::new());
        Self {
            history: Arc::new(MemoryHistoryStore::new()),
            actions: Arc::new(MemoryActionStore::new()),
            source: Arc::new(source.with_catalog(Arc::clone(&catalog))),
            catalog,
        }
    }

    pub fn feed_stores(&self) -> FeedStores {
        FeedStores {
            history: self.history.clone(),
            actions: self.actions.clone(),
            source: self.source.clone(),
            catalog: self.catalog.clone(),
        }
    }
}
