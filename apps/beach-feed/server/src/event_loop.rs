use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use async_trait::async_trait;
use futures_util::{future::BoxFuture, stream::FuturesUnordered, FutureExt, StreamExt};
use metrics::{counter, histogram};
use tokio::{
    sync::{mpsc, Semaphore},
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    connection::{Connection, FrameStream, InboundFrame},
    error::{ConnectionError, HandlerError},
    registry::{ConnectionRegistry, Watch, WatchQueue},
};

/// Receives every inbound frame the loop reads.
///
/// An `Err` is fatal for the connection the frame arrived on.
#[async_trait]
pub trait FrameHandler: Send + Sync + 'static {
    async fn handle(&self, connection: Arc<Connection>, frame: Vec<u8>)
        -> Result<(), HandlerError>;
}

#[derive(Debug, Clone)]
pub struct EventLoopConfig {
    /// Handlers allowed to run at once.
    pub worker_limit: usize,
    /// Upper bound on a single handler invocation.
    pub handler_timeout: Duration,
    /// Consecutive interrupted reads tolerated before giving up on a connection.
    pub max_interrupted_reads: u32,
}

impl Default for EventLoopConfig {
    fn default() -> Self {
        Self {
            worker_limit: 64,
            handler_timeout: Duration::from_secs(15),
            max_interrupted_reads: 8,
        }
    }
}

enum Readiness {
    Frame { watch: Watch, frame: Vec<u8> },
    Failed {
        connection: Arc<Connection>,
        error: ConnectionError,
    },
    Retired(Arc<Connection>),
}

enum LoopEvent {
    Shutdown,
    Watch(Option<Watch>),
    Rearm(Watch),
    Ready(Readiness),
}

/// Single control loop multiplexing reads over every registered connection.
///
/// Each watched connection has at most one pending read. When a frame arrives
/// the handler runs on the worker pool and the connection is re-armed only
/// after it finishes, so frames from one connection are handled in arrival
/// order while slow handlers never block reads for other users.
pub struct EventLoop<H> {
    registry: ConnectionRegistry,
    watches: WatchQueue,
    handler: Arc<H>,
    config: EventLoopConfig,
    shutdown: CancellationToken,
}

impl<H: FrameHandler> EventLoop<H> {
    pub fn new(
        registry: ConnectionRegistry,
        watches: WatchQueue,
        handler: Arc<H>,
        config: EventLoopConfig,
    ) -> Self {
        Self {
            registry,
            watches,
            handler,
            config,
            shutdown: CancellationToken::new(),
        }
    }

    /// Cancelling this token stops the loop and closes every connection.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    pub async fn run(mut self) {
        let workers = Arc::new(Semaphore::new(self.config.worker_limit.max(1)));
        let (rearm_tx, mut rearm_rx) = mpsc::unbounded_channel::<Watch>();
        let mut pending: FuturesUnordered<BoxFuture<'static, Readiness>> = FuturesUnordered::new();
        let mut accepting = true;

        info!(
            worker_limit = self.config.worker_limit,
            "event loop started"
        );

        loop {
            let event = tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => LoopEvent::Shutdown,
                watch = self.watches.next(), if accepting => LoopEvent::Watch(watch),
                Some(watch) = rearm_rx.recv() => LoopEvent::Rearm(watch),
                Some(ready) = pending.next(), if !pending.is_empty() => LoopEvent::Ready(ready),
            };

            match event {
                LoopEvent::Shutdown => break,
                LoopEvent::Watch(Some(watch)) | LoopEvent::Rearm(watch) => {
                    pending.push(next_frame(watch, self.config.max_interrupted_reads));
                }
                LoopEvent::Watch(None) => {
                    debug!("registry dropped; no new connections will be watched");
                    accepting = false;
                }
                LoopEvent::Ready(ready) => self.dispatch(ready, &workers, &rearm_tx).await,
            }
        }

        drop(pending);
        let closed = self.registry.close_all().await;
        info!(closed, "event loop stopped");
    }

    async fn dispatch(
        &self,
        ready: Readiness,
        workers: &Arc<Semaphore>,
        rearm: &mpsc::UnboundedSender<Watch>,
    ) {
        match ready {
            Readiness::Retired(connection) => {
                debug!(
                    user_id = %connection.user_id(),
                    connection_id = %connection.id(),
                    "stopped watching retired connection"
                );
            }
            Readiness::Failed { connection, error } => {
                counter!("beach_feed_connection_errors_total", 1);
                match error {
                    ConnectionError::Closed => debug!(
                        user_id = %connection.user_id(),
                        connection_id = %connection.id(),
                        "peer closed connection"
                    ),
                    error => warn!(
                        user_id = %connection.user_id(),
                        connection_id = %connection.id(),
                        error = %error,
                        "read failed; dropping connection"
                    ),
                }
                self.registry.remove(&connection);
                connection.close().await;
            }
            Readiness::Frame { watch, .. } if watch.connection.is_retired() => {
                debug!(
                    user_id = %watch.connection.user_id(),
                    connection_id = %watch.connection.id(),
                    "discarding frame read from retired connection"
                );
            }
            Readiness::Frame { watch, frame } => {
                let Ok(permit) = Arc::clone(workers).acquire_owned().await else {
                    return;
                };
                counter!("beach_feed_frames_dispatched_total", 1);

                let handler = Arc::clone(&self.handler);
                let registry = self.registry.clone();
                let rearm = rearm.clone();
                let timeout = self.config.handler_timeout;
                tokio::spawn(async move {
                    let _permit = permit;
                    let connection = Arc::clone(&watch.connection);
                    let started = Instant::now();
                    let outcome =
                        match tokio::time::timeout(timeout, handler.handle(Arc::clone(&connection), frame))
                            .await
                        {
                            Ok(outcome) => outcome,
                            Err(_) => Err(HandlerError::TimedOut(timeout)),
                        };
                    histogram!(
                        "beach_feed_handler_duration_ms",
                        started.elapsed().as_secs_f64() * 1000.0
                    );

                    match outcome {
                        Ok(()) => {
                            // Loop gone means shutdown; the reader is dropped with it.
                            let _ = rearm.send(watch);
                        }
                        Err(err) => {
                            counter!(
                                "beach_feed_handler_failures_total",
                                1,
                                "reason" => err.metric_label()
                            );
                            warn!(
                                user_id = %connection.user_id(),
                                connection_id = %connection.id(),
                                error = %err,
                                "frame handler failed; closing connection"
                            );
                            registry.remove(&connection);
                            connection.close().await;
                        }
                    }
                });
            }
        }
    }
}

fn next_frame(watch: Watch, max_interrupted: u32) -> BoxFuture<'static, Readiness> {
    async move {
        let Watch {
            connection,
            mut reader,
        } = watch;
        // Retirement wins over frames already buffered on the reader.
        let outcome = tokio::select! {
            biased;
            _ = connection.retired() => None,
            result = read_frame(&mut reader, max_interrupted) => Some(result),
        };
        match outcome {
            None => Readiness::Retired(connection),
            Some(Ok(frame)) => Readiness::Frame {
                watch: Watch { connection, reader },
                frame,
            },
            Some(Err(error)) => Readiness::Failed { connection, error },
        }
    }
    .boxed()
}

/// Reads the next application frame, skipping control frames and retrying
/// benign interruptions.
///
/// More than `max_interrupted` consecutive interruptions count as exhausted
/// retries and fail the read, which closes the connection.
pub(crate) async fn read_frame(
    reader: &mut FrameStream,
    max_interrupted: u32,
) -> Result<Vec<u8>, ConnectionError> {
    let mut interrupted = 0u32;
    loop {
        match reader.next().await {
            Some(Ok(InboundFrame::Data(bytes))) => return Ok(bytes),
            Some(Ok(InboundFrame::Control)) => continue,
            Some(Ok(InboundFrame::Close)) | None => return Err(ConnectionError::Closed),
            Some(Err(err)) if err.is_interrupted() => {
                if interrupted >= max_interrupted {
                    warn!(
                        attempts = interrupted + 1,
                        "read retries exhausted after repeated interruptions"
                    );
                    return Err(err);
                }
                interrupted += 1;
            }
            Some(Err(err)) => return Err(err),
        }
    }
}
