//! Shared primitives for the Beach swipe feed.
//!
//! The server crate owns connections and external stores; everything here is
//! transport-agnostic: the inbound [`Action`] model, the outbound
//! [`OutboundMessage`] envelope with its codec, and the per-user [`History`]
//! cursor that the feed session paginates.

pub mod action;
pub mod codec;
pub mod history;

pub use action::{Action, ActionKind, ActionQuery};
pub use codec::{decode_action, MalformedFrameError, OutboundMessage, Product, StatusMessage};
pub use history::{FeedPolicy, History};
