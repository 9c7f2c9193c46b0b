use std::{net::SocketAddr, time::Duration};

use anyhow::{bail, Context, Result};
use beach_feed_core::FeedPolicy;
use clap::Parser;

use crate::{event_loop::EventLoopConfig, feed::UPSTREAM_CALLS_PER_ACTION};

const DEV_JWT_KEY: &str = "beach-feed-dev-secret";

#[derive(Debug, Parser)]
#[command(
    name = "beach-feed",
    author,
    version,
    about = "Real-time swipe product feed over WebSocket"
)]
pub struct Cli {
    /// Address to bind the HTTP/WebSocket listener to.
    #[arg(long, env = "BEACH_FEED_LISTEN_ADDR", default_value = "127.0.0.1:8090")]
    pub listen_addr: String,

    /// Redis connection URI for history, action log and product catalog.
    #[arg(
        long,
        env = "BEACH_FEED_REDIS_URL",
        default_value = "redis://127.0.0.1:6379"
    )]
    pub redis_url: String,

    /// Keep every store in process memory instead of Redis (development only).
    #[arg(long, env = "BEACH_FEED_IN_MEMORY", default_value_t = false)]
    pub in_memory: bool,

    /// HS256 secret shared with the token issuer.
    #[arg(long, env = "BEACH_FEED_JWT_KEY")]
    pub jwt_key: Option<String>,

    /// Ranking service endpoint. Without it candidates are sampled from the
    /// catalog's id set.
    #[arg(long, env = "BEACH_FEED_RECOMMENDER_URL")]
    pub recommender_url: Option<String>,

    /// Product ids the in-memory source cycles through.
    #[arg(long, env = "BEACH_FEED_SEED_PRODUCTS", value_delimiter = ',')]
    pub seed_products: Vec<String>,

    #[arg(long, env = "BEACH_FEED_INITIAL_BATCH", default_value_t = 10)]
    pub initial_batch: usize,

    #[arg(long, env = "BEACH_FEED_REPLENISH_BATCH", default_value_t = 4)]
    pub replenish_batch: usize,

    /// Items pushed per window.
    #[arg(long, env = "BEACH_FEED_WINDOW", default_value_t = 3)]
    pub window: usize,

    /// Fetch more candidates once this many or fewer unseen items remain.
    #[arg(long, env = "BEACH_FEED_REPLENISH_THRESHOLD", default_value_t = 2)]
    pub replenish_threshold: usize,

    #[arg(long, env = "BEACH_FEED_MAX_HISTORY", default_value_t = 500)]
    pub max_history: usize,

    /// Seen items kept for undo when history is compacted.
    #[arg(long, env = "BEACH_FEED_UNDO_DEPTH", default_value_t = 20)]
    pub undo_depth: usize,

    /// Timeout applied to every store and recommender call.
    #[arg(long, env = "BEACH_FEED_UPSTREAM_TIMEOUT_MS", default_value_t = 2000)]
    pub upstream_timeout_ms: u64,

    /// Upper bound on one inbound action. Must leave room for every upstream
    /// call an action can make, or a slow store closes the connection.
    #[arg(long, env = "BEACH_FEED_HANDLER_TIMEOUT_SECS", default_value_t = 15)]
    pub handler_timeout_secs: u64,

    /// Frame handlers allowed to run concurrently.
    #[arg(long, env = "BEACH_FEED_WORKER_LIMIT", default_value_t = 64)]
    pub worker_limit: usize,

    /// Stored history expires this long after the user's last action.
    #[arg(long, env = "BEACH_FEED_HISTORY_TTL_SECS", default_value_t = 30 * 24 * 60 * 60)]
    pub history_ttl_secs: u64,

    #[arg(long, env = "BEACH_FEED_SHUTDOWN_GRACE_SECS", default_value_t = 5)]
    pub shutdown_grace_secs: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreBackend {
    Memory { seed_products: Vec<String> },
    Redis { url: String },
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub listen_addr: SocketAddr,
    pub backend: StoreBackend,
    pub jwt_key: String,
    pub recommender_url: Option<String>,
    pub policy: FeedPolicy,
    pub upstream_timeout: Duration,
    pub event_loop: EventLoopConfig,
    pub history_ttl: Duration,
    pub shutdown_grace: Duration,
}

impl TryFrom<Cli> for ServerConfig {
    type Error = anyhow::Error;

    fn try_from(cli: Cli) -> Result<Self, Self::Error> {
        let listen_addr: SocketAddr = cli
            .listen_addr
            .parse()
            .with_context(|| format!("invalid listen address: {}", cli.listen_addr))?;

        let jwt_key = match (cli.jwt_key, cli.in_memory) {
            (Some(key), _) if !key.trim().is_empty() => key,
            (_, true) => DEV_JWT_KEY.to_string(),
            _ => bail!("BEACH_FEED_JWT_KEY is required unless running --in-memory"),
        };

        let policy = FeedPolicy {
            initial_batch: cli.initial_batch,
            replenish_batch: cli.replenish_batch,
            window: cli.window,
            replenish_threshold: cli.replenish_threshold,
            max_history: cli.max_history,
            undo_depth: cli.undo_depth,
        };
        validate_policy(&policy)?;

        if cli.worker_limit == 0 {
            bail!("worker limit must be at least 1");
        }
        if cli.upstream_timeout_ms == 0 {
            bail!("upstream timeout must be positive");
        }
        let upstream_timeout = Duration::from_millis(cli.upstream_timeout_ms);
        let handler_timeout = Duration::from_secs(cli.handler_timeout_secs);
        let upstream_budget = upstream_timeout * UPSTREAM_CALLS_PER_ACTION;
        if handler_timeout <= upstream_budget {
            bail!(
                "handler timeout ({:?}) must exceed {} upstream calls of {:?} each ({:?})",
                handler_timeout,
                UPSTREAM_CALLS_PER_ACTION,
                upstream_timeout,
                upstream_budget
            );
        }
        if cli.history_ttl_secs == 0 {
            bail!("history TTL must be positive");
        }

        let backend = if cli.in_memory {
            StoreBackend::Memory {
                seed_products: cli
                    .seed_products
                    .into_iter()
                    .map(|id| id.trim().to_string())
                    .filter(|id| !id.is_empty())
                    .collect(),
            }
        } else {
            StoreBackend::Redis { url: cli.redis_url }
        };

        Ok(ServerConfig {
            listen_addr,
            backend,
            jwt_key,
            recommender_url: cli.recommender_url.filter(|url| !url.trim().is_empty()),
            policy,
            upstream_timeout,
            event_loop: EventLoopConfig {
                worker_limit: cli.worker_limit,
                handler_timeout,
                ..EventLoopConfig::default()
            },
            history_ttl: Duration::from_secs(cli.history_ttl_secs),
            shutdown_grace: Duration::from_secs(cli.shutdown_grace_secs),
        })
    }
}

fn validate_policy(policy: &FeedPolicy) -> Result<()> {
    if policy.initial_batch == 0 {
        bail!("initial batch must be at least 1");
    }
    if policy.replenish_batch == 0 {
        bail!("replenish batch must be at least 1");
    }
    if policy.window == 0 {
        bail!("window must be at least 1");
    }
    if policy.max_history <= policy.undo_depth {
        bail!(
            "max history ({}) must exceed undo depth ({})",
            policy.max_history,
            policy.undo_depth
        );
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Result<ServerConfig> {
        let cli = Cli::try_parse_from(std::iter::once("beach-feed").chain(args.iter().copied()))?;
        ServerConfig::try_from(cli)
    }

    #[test_timeout::timeout]
    fn defaults_match_feed_policy() {
        let config = parse(&["--in-memory", "--jwt-key", "k"]).unwrap();
        assert_eq!(config.policy, FeedPolicy::default());
        assert_eq!(config.upstream_timeout, Duration::from_secs(2));
        assert_eq!(config.event_loop.worker_limit, 64);
        assert_eq!(config.history_ttl, Duration::from_secs(2_592_000));
        assert_eq!(
            config.backend,
            StoreBackend::Memory {
                seed_products: Vec::new()
            }
        );
    }

    #[test_timeout::timeout]
    fn seed_products_split_on_commas() {
        let config = parse(&["--in-memory", "--jwt-key", "k", "--seed-products", "a,b, c"]).unwrap();
        assert_eq!(
            config.backend,
            StoreBackend::Memory {
                seed_products: vec!["a".into(), "b".into(), "c".into()]
            }
        );
    }

    #[test_timeout::timeout]
    fn rejects_invalid_values() {
        assert!(parse(&["--jwt-key", "k", "--window", "0"]).is_err());
        assert!(parse(&["--jwt-key", "k", "--listen-addr", "nowhere"]).is_err());
        assert!(parse(&["--jwt-key", "k", "--max-history", "5", "--undo-depth", "5"]).is_err());
    }

    #[test_timeout::timeout]
    fn handler_timeout_must_cover_upstream_budget() {
        let config = parse(&["--in-memory"]).unwrap();
        assert!(
            config.event_loop.handler_timeout
                > config.upstream_timeout * UPSTREAM_CALLS_PER_ACTION
        );

        assert!(parse(&["--in-memory", "--handler-timeout-secs", "0"]).is_err());
        // 6 calls of 2s each is exactly 12s.
        assert!(parse(&["--in-memory", "--handler-timeout-secs", "12"]).is_err());
        assert!(parse(&[
            "--in-memory",
            "--handler-timeout-secs",
            "1",
            "--upstream-timeout-ms",
            "300",
        ])
        .is_err());
        assert!(parse(&[
            "--in-memory",
            "--handler-timeout-secs",
            "2",
            "--upstream-timeout-ms",
            "300",
        ])
        .is_ok());
    }

    #[test_timeout::timeout]
    fn in_memory_mode_falls_back_to_dev_key() {
        let config = parse(&["--in-memory"]).unwrap();
        assert_eq!(config.jwt_key, DEV_JWT_KEY);
    }
}
