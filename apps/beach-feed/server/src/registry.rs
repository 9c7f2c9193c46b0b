use std::sync::Arc;

use dashmap::{mapref::entry::Entry, DashMap};
use metrics::{counter, gauge};
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::{
    connection::{Connection, FrameStream},
    error::{ConnectionError, RegistrationError},
};

/// A connection whose read half the event loop should start polling.
pub struct Watch {
    pub connection: Arc<Connection>,
    pub reader: FrameStream,
}

/// Receiving end of the registry's watch requests, drained by the event loop.
pub struct WatchQueue {
    rx: mpsc::UnboundedReceiver<Watch>,
}

impl WatchQueue {
    pub async fn next(&mut self) -> Option<Watch> {
        self.rx.recv().await
    }
}

/// Maps user identity to the single live connection for that user.
///
/// Created once per process alongside its [`WatchQueue`]; every entry in the
/// map has a read half registered with the event loop and vice versa.
#[derive(Clone)]
pub struct ConnectionRegistry {
    inner: Arc<RegistryInner>,
}

struct RegistryInner {
    connections: DashMap<String, Arc<Connection>>,
    watcher: mpsc::UnboundedSender<Watch>,
}

impl ConnectionRegistry {
    pub fn new() -> (Self, WatchQueue) {
        let (watcher, rx) = mpsc::unbounded_channel();
        let registry = Self {
            inner: Arc::new(RegistryInner {
                connections: DashMap::new(),
                watcher,
            }),
        };
        (registry, WatchQueue { rx })
    }

    /// Registers `connection` for reading and records it under its user id.
    ///
    /// A prior connection for the same user is retired and closed. If the
    /// event loop is gone the connection is not retained.
    pub async fn add(
        &self,
        connection: Arc<Connection>,
        reader: FrameStream,
    ) -> Result<(), RegistrationError> {
        let user_id = connection.user_id().to_string();

        // The shard stays locked until the entry is written, so a frame read
        // right after the watch is queued always finds its recipient.
        let displaced = match self.inner.connections.entry(user_id) {
            Entry::Occupied(mut entry) => {
                self.watch(&connection, reader)?;
                Some(entry.insert(Arc::clone(&connection)))
            }
            Entry::Vacant(entry) => {
                self.watch(&connection, reader)?;
                entry.insert(Arc::clone(&connection));
                None
            }
        };

        counter!("beach_feed_connections_admitted_total", 1);
        gauge!(
            "beach_feed_connections_active",
            self.inner.connections.len() as f64
        );
        info!(
            user_id = %connection.user_id(),
            connection_id = %connection.id(),
            "connection admitted"
        );

        if let Some(prior) = displaced.filter(|prior| prior.id() != connection.id()) {
            counter!("beach_feed_connections_superseded_total", 1);
            info!(
                user_id = %prior.user_id(),
                connection_id = %prior.id(),
                replaced_by = %connection.id(),
                "closing superseded connection"
            );
            prior.close().await;
        }

        Ok(())
    }

    fn watch(
        &self,
        connection: &Arc<Connection>,
        reader: FrameStream,
    ) -> Result<(), RegistrationError> {
        self.inner
            .watcher
            .send(Watch {
                connection: Arc::clone(connection),
                reader,
            })
            .map_err(|_| RegistrationError::LoopStopped)
    }

    /// Stops watching `connection` and drops its entry if it is still the
    /// current one for its user. Safe to call any number of times.
    pub fn remove(&self, connection: &Connection) -> bool {
        connection.retire();
        let removed = self
            .inner
            .connections
            .remove_if(connection.user_id(), |_, current| {
                current.id() == connection.id()
            })
            .is_some();

        if removed {
            counter!("beach_feed_connections_removed_total", 1);
            gauge!(
                "beach_feed_connections_active",
                self.inner.connections.len() as f64
            );
            debug!(
                user_id = %connection.user_id(),
                connection_id = %connection.id(),
                "connection removed"
            );
        }
        removed
    }

    /// Pushes one frame to the user's live connection.
    ///
    /// `Ok(false)` means nobody is connected under `user_id`.
    pub async fn send(&self, user_id: &str, payload: &[u8]) -> Result<bool, ConnectionError> {
        // Clone out of the map so the shard is not held across the write.
        let connection = self
            .inner
            .connections
            .get(user_id)
            .map(|entry| Arc::clone(entry.value()));

        match connection {
            Some(connection) => {
                connection.write(payload).await?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    pub fn get(&self, user_id: &str) -> Option<Arc<Connection>> {
        self.inner
            .connections
            .get(user_id)
            .map(|entry| Arc::clone(entry.value()))
    }

    pub fn len(&self) -> usize {
        self.inner.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.connections.is_empty()
    }

    /// Removes and closes every registered connection.
    pub async fn close_all(&self) -> usize {
        let connections: Vec<Arc<Connection>> = self
            .inner
            .connections
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();

        let mut closed = 0usize;
        for connection in connections {
            if self.remove(&connection) {
                closed += 1;
            }
            connection.close().await;
        }
        closed
    }
}
