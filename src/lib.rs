//! Real-time collaborative document editing core.
//!
//! This crate implements the LSEQ text CRDT, the in-memory session and room
//! fabric, the two-tier hot-cache/durable-store persistence pipeline, and
//! the wire protocol that ties them to a socket. The HTTP/WS bring-up in
//! [`run`] is a thin shell around these modules; everything that matters is
//! independently testable against the in-memory fakes each module ships.

pub mod auth;
pub mod broadcast;
pub mod cache;
pub mod channel;
pub mod config;
pub mod dispatcher;
pub mod document;
pub mod error;
pub mod lifecycle;
pub mod lseq;
pub mod protocol;
pub mod registry;
pub mod state;
pub mod store;
pub mod ws;

use crate::auth::HmacTokenVerifier;
use crate::cache::RedisDocumentCache;
use crate::channel::PgChannelService;
use crate::config::Config;
use crate::error::{AppError, Result};
use crate::state::AppState;
use crate::store::PgDurableStore;
use axum::routing::get;
use axum::{Extension, Router};
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::info;

/// Assemble every backing service from `config` and wire them into
/// `AppState`. Split out from [`run`] so integration tests can build the
/// same state against in-memory fakes instead.
pub async fn build_state(config: Config) -> Result<AppState> {
    let store = PgDurableStore::connect(&config.durable_store_url, config.db_max_connections).await?;
    let cache = RedisDocumentCache::connect(&config.hot_tier_url)
        .await
        .map_err(|e| AppError::Fatal(format!("hot tier unreachable at startup: {e}")))?;
    let channels = PgChannelService::new(store.pool().clone());
    let verifier = HmacTokenVerifier::new(&config.token_secret);

    Ok(AppState::new(
        Arc::new(cache),
        Arc::new(store),
        Arc::new(channels),
        Arc::new(verifier),
        config,
    ))
}

/// Build the router: `/ws` for the collaborative session upgrade, CORS and
/// request tracing layered the way the rest of the corpus wires an Axum
/// server, state threaded through both the typed extractor and an
/// `Extension` for handlers that only need a narrower slice of it.
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/ws", get(ws::ws_handler))
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .layer(Extension(state.clone()))
        .with_state(state)
}

/// Run the server to completion: prefetch the hot tier, bind, serve, and on
/// graceful shutdown flush every document with a live viewer back to the
/// durable store.
pub async fn run(config: Config) -> Result<()> {
    let state = build_state(config.clone()).await?;
    state.lifecycle.startup().await?;

    let router = build_router(state.clone());
    let addr = format!("0.0.0.0:{}", config.listen_port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .map_err(|e| AppError::Fatal(format!("failed to bind {addr}: {e}")))?;
    info!(component = "server", %addr, "listening");

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .map_err(|e| AppError::Fatal(format!("server loop exited: {e}")))?;

    let live_doc_ids = state.registry.live_doc_ids();
    info!(component = "server", count = live_doc_ids.len(), "flushing live documents on shutdown");
    state.lifecycle.shutdown(&live_doc_ids).await;

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
