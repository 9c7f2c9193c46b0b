//! WebSocket swipe feed: a connection registry and readiness-driven event
//! loop in front of a per-user feed session backed by external stores.

pub mod auth;
pub mod config;
pub mod connection;
pub mod error;
pub mod event_loop;
pub mod feed;
pub mod http;
pub mod registry;
pub mod server;
pub mod store;
pub mod telemetry;
