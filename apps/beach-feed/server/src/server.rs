use std::sync::Arc;

use anyhow::{Context, Result};
use axum::Router;
use metrics_exporter_prometheus::PrometheusHandle;
use tokio::{net::TcpListener, signal, task::JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::{
    auth::{JwtVerifier, TokenVerifier},
    config::{ServerConfig, StoreBackend},
    event_loop::EventLoop,
    feed::{FeedHandler, FeedService},
    http::{self, AppState},
    registry::ConnectionRegistry,
    store::{
        memory::{MemorySource, MemoryStores},
        recommender::HttpRecommender,
        redis_store::RedisStore,
        FeedStores,
    },
};

/// Pool size for the in-memory source when no seed list is configured.
const DEFAULT_SEED_PRODUCTS: usize = 100;

/// A running feed: registry, event loop and the router that admits
/// connections into them.
pub struct FeedApp {
    state: AppState,
    shutdown: CancellationToken,
    event_loop: JoinHandle<()>,
}

impl FeedApp {
    /// Wires the feed together and spawns its event loop. Must be called from
    /// inside a Tokio runtime.
    pub fn start(
        config: &ServerConfig,
        stores: FeedStores,
        verifier: Arc<dyn TokenVerifier>,
        metrics: Option<PrometheusHandle>,
    ) -> Self {
        let (registry, watches) = ConnectionRegistry::new();
        let feed = Arc::new(FeedService::new(
            stores,
            config.policy,
            config.upstream_timeout,
        ));
        let handler = Arc::new(FeedHandler::new(feed, registry.clone()));
        let event_loop = EventLoop::new(
            registry.clone(),
            watches,
            handler,
            config.event_loop.clone(),
        );
        let shutdown = event_loop.shutdown_token();
        let event_loop = event_loop.spawn();

        Self {
            state: AppState {
                registry,
                verifier,
                metrics,
            },
            shutdown,
            event_loop,
        }
    }

    pub fn router(&self) -> Router {
        http::router(self.state.clone())
    }

    pub fn registry(&self) -> &ConnectionRegistry {
        &self.state.registry
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Stops the event loop and waits for it to close every connection.
    pub async fn shutdown(self) {
        self.shutdown.cancel();
        if let Err(err) = self.event_loop.await {
            warn!(error = %err, "event loop task failed");
        }
    }
}

pub async fn build_stores(config: &ServerConfig) -> Result<FeedStores> {
    let mut stores = match &config.backend {
        StoreBackend::Memory { seed_products } => {
            let source = if seed_products.is_empty() {
                MemorySource::numbered(DEFAULT_SEED_PRODUCTS)
            } else {
                MemorySource::new(seed_products.clone())
            };
            warn!("using in-memory stores; feed history is lost on restart");
            MemoryStores::new(source).feed_stores()
        }
        StoreBackend::Redis { url } => {
            let redis = Arc::new(
                RedisStore::connect(url, config.history_ttl.as_secs())
                    .await
                    .context("failed to connect to redis")?,
            );
            FeedStores {
                history: redis.clone(),
                actions: redis.clone(),
                source: redis.clone(),
                catalog: redis,
            }
        }
    };

    if let Some(url) = &config.recommender_url {
        let recommender = HttpRecommender::new(url.clone(), config.upstream_timeout)
            .context("failed to build recommender client")?;
        stores.source = Arc::new(recommender);
    }
    Ok(stores)
}

pub async fn run(config: ServerConfig, metrics: PrometheusHandle) -> Result<()> {
    let stores = build_stores(&config).await?;
    let verifier = Arc::new(JwtVerifier::new(config.jwt_key.as_bytes()));
    let app = FeedApp::start(&config, stores, verifier, Some(metrics));

    let listener = TcpListener::bind(config.listen_addr)
        .await
        .context("failed to bind listener")?;
    info!("beach-feed listening on {}", config.listen_addr);

    let loop_shutdown = app.shutdown_token();
    axum::serve(listener, app.router())
        .with_graceful_shutdown(async move {
            let _ = signal::ctrl_c().await;
            // Upgraded sockets are not tracked by axum; the loop closes them.
            loop_shutdown.cancel();
        })
        .await
        .context("server shutdown with error")?;

    info!(
        grace_seconds = config.shutdown_grace.as_secs(),
        "shutdown signal received; draining"
    );
    app.shutdown().await;
    tokio::time::sleep(config.shutdown_grace).await;
    info!("graceful shutdown complete");
    Ok(())
}
