use std::sync::Arc;

use axum::{
    extract::{ws::WebSocket, Query, State, WebSocketUpgrade},
    http::{header, StatusCode},
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use metrics::counter;
use metrics_exporter_prometheus::PrometheusHandle;
use serde::Deserialize;
use serde_json::json;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::warn;

use crate::{
    auth::TokenVerifier,
    connection::{split_websocket, Connection},
    error::AuthError,
    registry::ConnectionRegistry,
};

#[derive(Clone)]
pub struct AppState {
    pub registry: ConnectionRegistry,
    pub verifier: Arc<dyn TokenVerifier>,
    pub metrics: Option<PrometheusHandle>,
}

/// The token travels as a query parameter because browser WebSocket clients
/// cannot set headers on the upgrade request.
#[derive(Debug, Deserialize)]
struct TokenQuery {
    token: Option<String>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/feed", get(feed_handler))
        .route("/healthz", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    Json(json!({ "status": "ok", "connections": state.registry.len() }))
}

async fn metrics_handler(State(state): State<AppState>) -> impl IntoResponse {
    match &state.metrics {
        Some(handle) => (
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            handle.render(),
        )
            .into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

async fn feed_handler(
    State(state): State<AppState>,
    Query(query): Query<TokenQuery>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    let verified = query
        .token
        .as_deref()
        .ok_or(AuthError::Missing)
        .and_then(|token| state.verifier.verify(token));

    match verified {
        Ok(user_id) => ws
            .on_upgrade(move |socket| admit(socket, state.registry, user_id))
            .into_response(),
        Err(err) => {
            counter!(
                "beach_feed_handshake_rejected_total",
                1,
                "reason" => err.metric_label()
            );
            warn!(error = %err, "rejecting feed handshake");
            StatusCode::FORBIDDEN.into_response()
        }
    }
}

async fn admit(socket: WebSocket, registry: ConnectionRegistry, user_id: String) {
    let (writer, reader) = split_websocket(socket);
    let connection = Connection::new(user_id, writer);
    if let Err(err) = registry.add(Arc::clone(&connection), reader).await {
        warn!(
            user_id = %connection.user_id(),
            error = %err,
            "failed to register connection"
        );
        connection.close().await;
    }
}
