use std::{future::Future, sync::Arc, time::Duration};

use async_trait::async_trait;
use beach_feed_core::{
    decode_action, Action, ActionKind, ActionQuery, FeedPolicy, History, OutboundMessage,
    StatusMessage,
};
use dashmap::DashMap;
use metrics::counter;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::{
    connection::Connection,
    error::{HandlerError, StateError, UpstreamError},
    event_loop::FrameHandler,
    registry::ConnectionRegistry,
    store::{ActionRecord, FeedStores, RecommendationRequest},
};

/// Most upstream calls one action can make: history read, action record,
/// a scoped fetch and its top-up, history write and catalog load.
pub const UPSTREAM_CALLS_PER_ACTION: u32 = 6;

/// A scoped fetch more than this many short is topped up with general
/// recommendations.
const SCOPED_SHORTFALL_TOLERANCE: usize = 2;

/// Per-user feed session state machine.
///
/// Every transition for a user runs inside that user's exclusive section, so
/// the read-modify-write of their stored history never interleaves with
/// another action from the same user. Different users proceed independently.
pub struct FeedService {
    stores: FeedStores,
    policy: FeedPolicy,
    upstream_timeout: Duration,
    user_locks: DashMap<String, Arc<Mutex<()>>>,
}

impl FeedService {
    pub fn new(stores: FeedStores, policy: FeedPolicy, upstream_timeout: Duration) -> Self {
        Self {
            stores,
            policy,
            upstream_timeout,
            user_locks: DashMap::new(),
        }
    }

    /// Applies one action for `user_id` and returns the messages to push, in
    /// order. Upstream and state failures come back as status messages.
    pub async fn apply(&self, user_id: &str, action: &Action) -> Vec<OutboundMessage> {
        let slot = UserSlot::acquire(&self.user_locks, user_id);
        let _guard = slot.lock.lock().await;
        self.transition(user_id, action).await
    }

    async fn transition(&self, user_id: &str, action: &Action) -> Vec<OutboundMessage> {
        let stored = match self
            .bounded("history_get", self.stores.history.get(user_id))
            .await
        {
            Ok(stored) => stored.map(History::normalize),
            Err(err) => {
                return vec![upstream_failure(
                    "history_get",
                    user_id,
                    err,
                    "Failed to load feed history",
                )]
            }
        };

        match (&action.kind, stored) {
            (ActionKind::Open | ActionKind::Query, _) if action.scoped_query().is_some() => {
                self.start(user_id, action.scoped_query().cloned()).await
            }
            (ActionKind::Open | ActionKind::Query, None) => self.start(user_id, None).await,
            (ActionKind::Open | ActionKind::Query, Some(history)) => {
                let mut pushes = Vec::new();
                self.advance(history, &mut pushes).await;
                pushes
            }
            (ActionKind::Undo, Some(history)) => self.undo(history).await,
            (_, Some(history)) => self.swipe(history, action).await,
            (kind, None) => {
                debug!(user_id, action = kind.as_str(), "rejecting action before open");
                vec![StatusMessage::from(StateError::OpenRequired).into()]
            }
        }
    }

    /// First open, or a query that restarts the feed: fetch a full batch and
    /// push all of it.
    async fn start(&self, user_id: &str, query: Option<ActionQuery>) -> Vec<OutboundMessage> {
        let ids = match self
            .fetch_candidates(user_id, self.policy.initial_batch, query.as_ref())
            .await
        {
            Ok(ids) => ids,
            Err(err) => {
                return vec![upstream_failure(
                    "recommend",
                    user_id,
                    err,
                    "Failed to fetch recommendations",
                )]
            }
        };

        let history = History::new(user_id, ids).scoped(query);
        if let Err(err) = self
            .bounded("history_put", self.stores.history.put(&history))
            .await
        {
            return vec![upstream_failure(
                "history_put",
                user_id,
                err,
                "Failed to save feed history",
            )];
        }
        info!(
            user_id,
            fetched = history.len(),
            scoped = history.query.is_some(),
            "feed started"
        );
        vec![self.load_batch(user_id, &history.products).await]
    }

    async fn swipe(&self, history: History, action: &Action) -> Vec<OutboundMessage> {
        let mut pushes = Vec::new();
        let product_id = action
            .product_id
            .clone()
            .or_else(|| history.current().map(str::to_owned));

        match product_id {
            Some(product_id) => {
                let record = ActionRecord::new(
                    history.user_id.clone(),
                    product_id,
                    action.kind.as_str(),
                );
                if let Err(err) = self
                    .bounded("action_record", self.stores.actions.record(record))
                    .await
                {
                    pushes.push(upstream_failure(
                        "action_record",
                        &history.user_id,
                        err,
                        "Failed to record action",
                    ));
                }
            }
            None => pushes.push(
                StatusMessage::bad_request("No product to apply the action to").into(),
            ),
        }

        self.advance(history, &mut pushes).await;
        pushes
    }

    /// Moves the cursor forward, tops up the buffer when the unseen tail is
    /// short, persists and pushes the window.
    async fn advance(&self, mut history: History, pushes: &mut Vec<OutboundMessage>) {
        history.advance();

        if history.needs_replenish(self.policy.replenish_threshold) {
            match self
                .fetch_candidates(
                    &history.user_id,
                    self.policy.replenish_batch,
                    history.query.as_ref(),
                )
                .await
            {
                Ok(ids) => {
                    counter!("beach_feed_replenishments_total", 1);
                    debug!(
                        user_id = %history.user_id,
                        cursor = history.cursor,
                        fetched = ids.len(),
                        "replenished feed"
                    );
                    history.extend(ids);
                }
                Err(err) => pushes.push(upstream_failure(
                    "recommend",
                    &history.user_id,
                    err,
                    "Failed to fetch recommendations",
                )),
            }
        }

        let dropped = history.compact(self.policy.max_history, self.policy.undo_depth);
        if dropped > 0 {
            debug!(user_id = %history.user_id, dropped, "compacted feed history");
        }

        self.persist_and_push(history, pushes).await;
    }

    /// Steps back one item and re-serves the buffered window. Never fetches.
    async fn undo(&self, mut history: History) -> Vec<OutboundMessage> {
        let mut pushes = Vec::new();
        if !history.retreat() {
            debug!(user_id = %history.user_id, "undo at start of feed");
        }
        self.persist_and_push(history, &mut pushes).await;
        pushes
    }

    async fn persist_and_push(&self, history: History, pushes: &mut Vec<OutboundMessage>) {
        if let Err(err) = self
            .bounded("history_put", self.stores.history.put(&history))
            .await
        {
            pushes.push(upstream_failure(
                "history_put",
                &history.user_id,
                err,
                "Failed to save feed history",
            ));
            return;
        }
        let window = history.window(self.policy.window);
        pushes.push(self.load_batch(&history.user_id, window).await);
    }

    async fn fetch_candidates(
        &self,
        user_id: &str,
        count: usize,
        query: Option<&ActionQuery>,
    ) -> Result<Vec<String>, UpstreamError> {
        let request = RecommendationRequest {
            user_id: user_id.to_string(),
            count,
            query: query.cloned(),
        };
        let mut ids = self
            .bounded("recommend", self.stores.source.fetch(&request))
            .await?;

        let shortfall = count.saturating_sub(ids.len());
        if request.query.is_some() && shortfall > SCOPED_SHORTFALL_TOLERANCE {
            let general = RecommendationRequest {
                user_id: request.user_id,
                count: shortfall,
                query: None,
            };
            let mut extra = self
                .bounded("recommend", self.stores.source.fetch(&general))
                .await?;
            extra.retain(|id| !ids.contains(id));
            debug!(
                user_id,
                scoped = ids.len(),
                general = extra.len(),
                "topped up scoped recommendations"
            );
            ids.extend(extra);
        }
        Ok(ids)
    }

    async fn load_batch(&self, user_id: &str, ids: &[String]) -> OutboundMessage {
        match self
            .bounded("catalog_load", self.stores.catalog.load(ids))
            .await
        {
            Ok(products) => OutboundMessage::Batch(products),
            Err(err) => upstream_failure("catalog_load", user_id, err, "Failed to load products"),
        }
    }

    async fn bounded<T, F>(&self, operation: &'static str, call: F) -> Result<T, UpstreamError>
    where
        F: Future<Output = Result<T, UpstreamError>>,
    {
        match tokio::time::timeout(self.upstream_timeout, call).await {
            Ok(result) => result,
            Err(_) => Err(UpstreamError::Timeout {
                operation,
                timeout: self.upstream_timeout,
            }),
        }
    }
}

/// A user's entry in the lock map. Dropping it, including when the action is
/// cancelled mid-flight, removes the entry once no other task holds it.
struct UserSlot<'a> {
    locks: &'a DashMap<String, Arc<Mutex<()>>>,
    user_id: &'a str,
    lock: Arc<Mutex<()>>,
}

impl<'a> UserSlot<'a> {
    fn acquire(locks: &'a DashMap<String, Arc<Mutex<()>>>, user_id: &'a str) -> Self {
        let lock = Arc::clone(
            locks
                .entry(user_id.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .value(),
        );
        Self {
            locks,
            user_id,
            lock,
        }
    }
}

impl Drop for UserSlot<'_> {
    fn drop(&mut self) {
        // The map and this slot are the only holders; the shard lock keeps
        // anyone from cloning it in between.
        self.locks.remove_if(self.user_id, |_, lock| {
            Arc::ptr_eq(lock, &self.lock) && Arc::strong_count(lock) == 2
        });
    }
}

fn upstream_failure(
    operation: &'static str,
    user_id: &str,
    err: UpstreamError,
    message: &str,
) -> OutboundMessage {
    counter!(
        "beach_feed_upstream_failures_total",
        1,
        "operation" => operation
    );
    warn!(user_id, operation, error = %err, "upstream call failed");
    StatusMessage::internal(message).into()
}

/// Event loop handler that decodes frames, runs them through the feed and
/// pushes the results back through the registry.
pub struct FeedHandler {
    feed: Arc<FeedService>,
    registry: ConnectionRegistry,
}

impl FeedHandler {
    pub fn new(feed: Arc<FeedService>, registry: ConnectionRegistry) -> Self {
        Self { feed, registry }
    }
}

#[async_trait]
impl FrameHandler for FeedHandler {
    async fn handle(&self, connection: Arc<Connection>, frame: Vec<u8>) -> Result<(), HandlerError> {
        let action = decode_action(&frame)?;
        let user_id = connection.user_id();
        debug!(
            user_id,
            connection_id = %connection.id(),
            action = action.kind.as_str(),
            "applying action"
        );

        for message in self.feed.apply(user_id, &action).await {
            match self.registry.send(user_id, &message.encode()).await {
                Ok(true) => {}
                Ok(false) => {
                    counter!("beach_feed_undeliverable_pushes_total", 1);
                    debug!(user_id, "no live connection; dropping push");
                }
                // Superseded or closed while the action was in flight.
                Err(err) if connection.is_retired() => {
                    counter!("beach_feed_undeliverable_pushes_total", 1);
                    debug!(user_id, error = %err, "connection retired; dropping push");
                }
                Err(err) => return Err(err.into()),
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory::{MemorySource, MemoryStores};

    fn policy(initial_batch: usize, replenish_batch: usize) -> FeedPolicy {
        FeedPolicy {
            initial_batch,
            replenish_batch,
            ..FeedPolicy::default()
        }
    }

    fn service(stores: &MemoryStores, policy: FeedPolicy) -> FeedService {
        FeedService::new(stores.feed_stores(), policy, Duration::from_secs(1))
    }

    fn batch_ids(message: &OutboundMessage) -> Vec<String> {
        message
            .as_batch()
            .expect("product batch")
            .iter()
            .filter_map(|product| product.product_id().map(str::to_owned))
            .collect()
    }

    fn open() -> Action {
        Action::new(ActionKind::Open)
    }

    #[test_timeout::tokio_timeout_test]
    async fn first_open_fetches_and_pushes_whole_batch() {
        let stores = MemoryStores::new(MemorySource::numbered(20));
        let feed = service(&stores, policy(3, 2));

        let pushes = feed.apply("u1", &open()).await;
        assert_eq!(pushes.len(), 1);
        assert_eq!(batch_ids(&pushes[0]), ["p1", "p2", "p3"]);

        let history = stores.history.snapshot("u1").unwrap();
        assert_eq!(history.products, ["p1", "p2", "p3"]);
        assert_eq!(history.cursor, 0);
        assert_eq!(stores.source.calls(), 1);
        assert_eq!(stores.source.requests()[0].count, 3);
    }

    #[test_timeout::tokio_timeout_test]
    async fn like_advances_and_replenishes() {
        let stores = MemoryStores::new(MemorySource::numbered(20));
        let feed = service(&stores, policy(3, 2));
        feed.apply("u1", &open()).await;

        let like = Action::new(ActionKind::Like).with_product("p1");
        let pushes = feed.apply("u1", &like).await;
        assert_eq!(pushes.len(), 1);
        assert_eq!(batch_ids(&pushes[0]), ["p2", "p3", "p4"]);

        let history = stores.history.snapshot("u1").unwrap();
        assert_eq!(history.products, ["p1", "p2", "p3", "p4", "p5"]);
        assert_eq!(history.cursor, 1);
        assert_eq!(stores.source.calls(), 2);

        let records = stores.actions.records();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].product_id, "p1");
        assert_eq!(records[0].action_type, "like");
    }

    #[test_timeout::tokio_timeout_test]
    async fn undo_serves_buffer_without_fetching() {
        let stores = MemoryStores::new(MemorySource::numbered(20));
        let feed = service(&stores, policy(3, 2));
        feed.apply("u1", &open()).await;
        feed.apply("u1", &Action::new(ActionKind::Like).with_product("p1"))
            .await;
        let calls = stores.source.calls();

        let pushes = feed.apply("u1", &Action::new(ActionKind::Undo)).await;
        assert_eq!(batch_ids(&pushes[0]), ["p1", "p2", "p3"]);
        assert_eq!(stores.history.snapshot("u1").unwrap().cursor, 0);
        assert_eq!(stores.source.calls(), calls);

        // Clamped at zero.
        let pushes = feed.apply("u1", &Action::new(ActionKind::Undo)).await;
        assert_eq!(batch_ids(&pushes[0]), ["p1", "p2", "p3"]);
        assert_eq!(stores.history.snapshot("u1").unwrap().cursor, 0);
    }

    #[test_timeout::tokio_timeout_test]
    async fn actions_before_open_are_rejected() {
        let stores = MemoryStores::new(MemorySource::numbered(20));
        let feed = service(&stores, FeedPolicy::default());

        for action in [
            Action::new(ActionKind::Like).with_product("p1"),
            Action::new(ActionKind::Undo),
            Action::new(ActionKind::Other("share".into())),
        ] {
            let pushes = feed.apply("u1", &action).await;
            assert_eq!(pushes.len(), 1);
            assert_eq!(
                pushes[0].as_status().map(|status| status.status),
                Some(StatusMessage::BAD_REQUEST)
            );
        }
        assert!(stores.history.snapshot("u1").is_none());
        assert_eq!(stores.source.calls(), 0);
        assert!(stores.actions.records().is_empty());
    }

    #[test_timeout::tokio_timeout_test]
    async fn replenishes_only_when_tail_is_short() {
        let stores = MemoryStores::new(MemorySource::numbered(50));
        let feed = service(&stores, policy(6, 4));
        feed.apply("u1", &open()).await;

        for _ in 0..12 {
            let before = stores.history.snapshot("u1").unwrap();
            let calls = stores.source.calls();
            // Remaining after this advance decides whether a fetch happens.
            let expect_fetch = before.remaining().saturating_sub(1) <= 2;

            feed.apply("u1", &Action::new(ActionKind::Dislike)).await;

            let after = stores.history.snapshot("u1").unwrap();
            assert_eq!(after.cursor, before.cursor + 1);
            assert_eq!(stores.source.calls() - calls, usize::from(expect_fetch));
            assert!(after.cursor <= after.len());
        }
    }

    #[test_timeout::tokio_timeout_test]
    async fn undo_then_repeat_reproduces_window() {
        let stores = MemoryStores::new(MemorySource::numbered(50));
        let feed = service(&stores, policy(10, 4));
        feed.apply("u1", &open()).await;

        let first = feed.apply("u1", &open()).await;
        let calls = stores.source.calls();
        feed.apply("u1", &Action::new(ActionKind::Undo)).await;
        let again = feed.apply("u1", &open()).await;

        assert_eq!(stores.source.calls(), calls);
        assert_eq!(batch_ids(&first[0]), batch_ids(&again[0]));
    }

    #[test_timeout::tokio_timeout_test]
    async fn concurrent_actions_for_one_user_are_serialized() {
        let stores = MemoryStores::new(MemorySource::numbered(500));
        let feed = Arc::new(service(&stores, policy(100, 4)));
        feed.apply("u1", &open()).await;

        let tasks: Vec<_> = (0..20)
            .map(|_| {
                let feed = Arc::clone(&feed);
                tokio::spawn(async move {
                    feed.apply("u1", &Action::new(ActionKind::Like)).await
                })
            })
            .collect();
        for task in tasks {
            task.await.unwrap();
        }

        let history = stores.history.snapshot("u1").unwrap();
        assert_eq!(history.cursor, 20);
        assert_eq!(stores.actions.records().len(), 20);
        assert!(feed.user_locks.is_empty());
    }

    #[test_timeout::tokio_timeout_test]
    async fn action_store_failure_still_advances() {
        let stores = MemoryStores::new(MemorySource::numbered(20));
        let feed = service(&stores, policy(10, 4));
        feed.apply("u1", &open()).await;
        stores.actions.set_failing(true);

        let pushes = feed
            .apply("u1", &Action::new(ActionKind::AddedToCart).with_product("p1"))
            .await;
        assert_eq!(pushes.len(), 2);
        assert_eq!(
            pushes[0].as_status().map(|status| status.status),
            Some(StatusMessage::INTERNAL_SERVER_ERROR)
        );
        assert_eq!(batch_ids(&pushes[1]), ["p2", "p3", "p4"]);
        assert_eq!(stores.history.snapshot("u1").unwrap().cursor, 1);
    }

    #[test_timeout::tokio_timeout_test]
    async fn history_store_failure_is_reported_not_fatal() {
        let stores = MemoryStores::new(MemorySource::numbered(20));
        let feed = service(&stores, FeedPolicy::default());
        stores.history.set_failing(true);

        let pushes = feed.apply("u1", &open()).await;
        assert_eq!(
            pushes[0].as_status().map(|status| status.status),
            Some(StatusMessage::INTERNAL_SERVER_ERROR)
        );

        stores.history.set_failing(false);
        let pushes = feed.apply("u1", &open()).await;
        assert_eq!(pushes[0].as_batch().map(<[_]>::len), Some(10));
    }

    fn titled(stores: &MemoryStores, id: &str, title: &str) {
        let mut fields = serde_json::Map::new();
        fields.insert("product_id".into(), id.into());
        fields.insert("title".into(), title.into());
        stores.catalog.insert(beach_feed_core::Product::new(fields));
    }

    fn sandals() -> ActionQuery {
        ActionQuery {
            text: Some("sandals".into()),
            filter: None,
        }
    }

    #[test_timeout::tokio_timeout_test]
    async fn query_restarts_a_scoped_feed() {
        let stores = MemoryStores::new(MemorySource::numbered(20));
        for id in ["p2", "p5", "p8", "p11", "p14"] {
            titled(&stores, id, "Beach sandals");
        }
        let feed = service(&stores, policy(3, 2));
        feed.apply("u1", &open()).await;
        feed.apply("u1", &open()).await;

        let query = sandals();
        let pushes = feed
            .apply("u1", &Action::new(ActionKind::Query).with_query(query.clone()))
            .await;
        assert_eq!(batch_ids(&pushes[0]), ["p2", "p5", "p8"]);

        let history = stores.history.snapshot("u1").unwrap();
        assert_eq!(history.cursor, 0);
        assert_eq!(history.query.as_ref(), Some(&query));

        // Replenishment keeps the scope.
        feed.apply("u1", &open()).await;
        let last = stores.source.requests().pop().unwrap();
        assert_eq!(last.query, Some(query));
        assert_eq!(
            stores.history.snapshot("u1").unwrap().products,
            ["p2", "p5", "p8", "p11", "p14"]
        );
    }

    #[test_timeout::tokio_timeout_test]
    async fn short_scoped_fetch_is_topped_up_with_general_candidates() {
        let stores = MemoryStores::new(MemorySource::numbered(20));
        titled(&stores, "p1", "Beach sandals");
        let feed = service(&stores, policy(6, 2));

        let pushes = feed
            .apply("u1", &Action::new(ActionKind::Query).with_query(sandals()))
            .await;
        assert_eq!(batch_ids(&pushes[0]), ["p1", "p2", "p3", "p4", "p5"]);

        let requests = stores.source.requests();
        assert_eq!(requests.len(), 2);
        assert_eq!(requests[0].count, 6);
        assert_eq!(requests[0].query, Some(sandals()));
        assert_eq!(requests[1].count, 5);
        assert_eq!(requests[1].query, None);
    }

    #[test_timeout::tokio_timeout_test]
    async fn scoped_fetch_within_tolerance_is_not_topped_up() {
        let stores = MemoryStores::new(MemorySource::numbered(20));
        titled(&stores, "p4", "Beach sandals");
        let feed = service(&stores, policy(3, 2));

        let pushes = feed
            .apply("u1", &Action::new(ActionKind::Query).with_query(sandals()))
            .await;
        assert_eq!(batch_ids(&pushes[0]), ["p4"]);
        assert_eq!(stores.source.calls(), 1);
    }

    #[test_timeout::tokio_timeout_test]
    async fn cancelled_action_releases_user_lock() {
        struct Stalled;

        #[async_trait]
        impl crate::store::HistoryStore for Stalled {
            async fn get(&self, _user_id: &str) -> Result<Option<History>, UpstreamError> {
                std::future::pending().await
            }

            async fn put(&self, _history: &History) -> Result<(), UpstreamError> {
                std::future::pending().await
            }
        }

        let stores = MemoryStores::new(MemorySource::numbered(1));
        let mut feed_stores = stores.feed_stores();
        feed_stores.history = Arc::new(Stalled);
        let feed = FeedService::new(feed_stores, FeedPolicy::default(), Duration::from_secs(10));

        for _ in 0..3 {
            let abandoned =
                tokio::time::timeout(Duration::from_millis(20), feed.apply("u1", &open())).await;
            assert!(abandoned.is_err());
            assert!(feed.user_locks.is_empty());
        }
    }

    #[test_timeout::tokio_timeout_test]
    async fn slow_upstream_times_out_as_status() {
        struct Stalled;

        #[async_trait]
        impl crate::store::RecommendationSource for Stalled {
            async fn fetch(
                &self,
                _request: &RecommendationRequest,
            ) -> Result<Vec<String>, UpstreamError> {
                std::future::pending().await
            }
        }

        let stores = MemoryStores::new(MemorySource::numbered(1));
        let mut feed_stores = stores.feed_stores();
        feed_stores.source = Arc::new(Stalled);
        let feed = FeedService::new(
            feed_stores,
            FeedPolicy::default(),
            Duration::from_millis(20),
        );

        let pushes = feed.apply("u1", &open()).await;
        assert_eq!(
            pushes[0].as_status().map(|status| status.status),
            Some(StatusMessage::INTERNAL_SERVER_ERROR)
        );
        assert!(stores.history.snapshot("u1").is_none());
    }
}
