//! HTTP API Module
//!
//! Routes:
//! - `POST /management/api`, `PUT /management/api`: create and delete an app's queries
//! - `GET /query?id=&format=`: public read of a cached response
//! - `/admin/queries...`: list, inspect, change status, run now
//! - `/health`, `/live`, `/ready`, `/metrics`
//!
//! Management and admin routes require `Authorization: Bearer <token>` when
//! `http.management_tokens` is non-empty. The public routes never do, but a
//! valid token on `/query` marks the caller as the owner, which skips
//! response anonymization.

pub mod dto;
pub mod error;
pub mod handlers;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    body::Body,
    http::{HeaderMap, Request},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
    Extension, Router,
};
use tokio::sync::{mpsc, watch};
use tower_http::cors::{Any, CorsLayer};
use tower_http::limit::RequestBodyLimitLayer;

use crate::engine::Engine;
use crate::scheduler::Arm;

use self::error::RestError;
use self::handlers::{admin, management, query};

/// Who is calling, as decided by the auth middleware
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Caller {
    /// Presented a configured management token
    Owner,
    Public,
}

#[derive(Clone)]
struct ManagementTokens(Arc<Vec<String>>);

/// Routes readable without a token
fn is_public_path(path: &str) -> bool {
    matches!(path, "/health" | "/live" | "/ready" | "/query")
}

fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get("authorization")?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")
}

/// Middleware: bearer-token authentication.
/// Tags every request with a [`Caller`]; rejects public callers on protected
/// routes when tokens are configured.
async fn auth_middleware(
    Extension(tokens): Extension<ManagementTokens>,
    mut req: Request<Body>,
    next: Next,
) -> Response {
    let keys = &tokens.0;
    let caller = match bearer_token(req.headers()) {
        Some(token) if keys.iter().any(|k| k == token) => Caller::Owner,
        _ => Caller::Public,
    };
    req.extensions_mut().insert(caller);

    if caller == Caller::Owner || keys.is_empty() || is_public_path(req.uri().path()) {
        return next.run(req).await;
    }
    RestError::unauthorized("Invalid or missing management token").into_response()
}

/// Creates the Axum router
pub fn create_router(engine: Arc<Engine>) -> Router {
    let config = engine.config().http.clone();

    let cors = if !config.cors_origins.is_empty() {
        let origins: Vec<_> = config
            .cors_origins
            .iter()
            .filter_map(|s| {
                let parsed = s.parse();
                if parsed.is_err() {
                    tracing::warn!(origin = %s, "invalid_cors_origin_ignored");
                }
                parsed.ok()
            })
            .collect();
        Some(
            CorsLayer::new()
                .allow_origin(origins)
                .allow_methods(Any)
                .allow_headers(Any),
        )
    } else if config.cors_allow_all {
        Some(CorsLayer::permissive())
    } else {
        None
    };

    let tokens = ManagementTokens(Arc::new(config.management_tokens.clone()));

    // Extension layers must wrap the middleware that extracts them
    let mut app = Router::new()
        .route("/health", get(admin::health))
        .route("/live", get(admin::liveness))
        .route("/ready", get(admin::readiness))
        .route("/metrics", get(admin::stats))
        .route("/query", get(query::read_query))
        .route(
            "/management/api",
            post(management::create_queries).put(management::delete_queries),
        )
        .route("/admin/queries", get(admin::list_queries))
        .route("/admin/queries/:id", get(admin::get_query))
        .route("/admin/queries/:id/status", post(admin::set_status))
        .route("/admin/queries/:id/run", post(admin::run_query))
        .layer(Extension(engine))
        .layer(middleware::from_fn(auth_middleware))
        .layer(Extension(tokens))
        .layer(RequestBodyLimitLayer::new(config.max_body_bytes));

    if let Some(cors) = cors {
        app = app.layer(cors);
    }
    app
}

/// Starts the HTTP server and the engine's background loops.
///
/// Listens for SIGINT (ctrl-c) and SIGTERM to trigger graceful shutdown.
/// On shutdown: stops accepting connections, stops the dispatcher and
/// maintenance loops, and writes a final store snapshot.
pub async fn start_http_server(
    engine: Arc<Engine>,
    fired: mpsc::UnboundedReceiver<Arm>,
) -> anyhow::Result<()> {
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let report = engine.sweep();
    tracing::info!(armed = report.armed, "startup_sweep");
    let dispatcher = engine.spawn_dispatcher(fired, shutdown_rx.clone());
    let maintenance = engine.spawn_maintenance(shutdown_rx);

    let http = &engine.config().http;
    let addr: SocketAddr = format!("{}:{}", http.host, http.port).parse()?;
    let app = create_router(Arc::clone(&engine));

    let socket = tokio::net::TcpSocket::new_v4()?;
    socket.set_reuseaddr(true)?;
    socket.bind(addr)?;
    let listener = socket.listen(1024)?;
    tracing::info!(%addr, "http_listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // Signal background loops to stop
    let _ = shutdown_tx.send(true);
    let _ = dispatcher.await;
    let _ = maintenance.await;

    let persister = Arc::clone(&engine);
    match tokio::time::timeout(
        Duration::from_secs(10),
        tokio::task::spawn_blocking(move || persister.persist()),
    )
    .await
    {
        Ok(Ok(Ok(saved))) => tracing::info!(queries = saved, "final_snapshot_written"),
        Ok(Ok(Err(e))) => tracing::error!(error = %e, "final_snapshot_failed"),
        Ok(Err(e)) => tracing::error!(error = %e, "final_snapshot_panicked"),
        Err(_) => tracing::error!("final_snapshot_timed_out"),
    }

    Ok(())
}

/// Wait for a shutdown signal (SIGINT or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => tracing::info!("received SIGINT, shutting down"),
                    _ = sigterm.recv() => tracing::info!("received SIGTERM, shutting down"),
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "SIGTERM handler unavailable");
                let _ = ctrl_c.await;
                tracing::info!("received SIGINT, shutting down");
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = ctrl_c.await;
        tracing::info!("received SIGINT, shutting down");
    }
}
