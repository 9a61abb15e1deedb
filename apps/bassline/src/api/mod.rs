//! # Peer Server
//!
//! HTTP server that exposes a kernel to remote bridges, using axum.
//!
//! ## Endpoints
//!
//! - `GET /health` - Health check
//! - `GET /status` - Kernel status
//! - `POST /command` - Execute a command envelope
//! - `POST /subscriptions` - Start queuing a group's content changes
//! - `GET /subscriptions/{id}/changes` - Take queued changes
//! - `DELETE /subscriptions/{id}` - Stop a subscription
//! - `GET /groups/{id}/export` - Group template, JSON and base64 binary
//!
//! The served kernel is attached as a remote bridge, so commands a remote
//! transport cannot carry are refused by the kernel as well.
//!
//! ## Security Configuration (Environment Variables)
//!
//! - `BASSLINE_CORS_ORIGINS`: Comma-separated list of allowed origins, or "*" for all (default: localhost only)
//! - `BASSLINE_RATE_LIMIT`: Requests per second (default: 100, 0 to disable)
//! - `BASSLINE_API_KEY`: If set, requires Bearer token authentication

mod auth;
mod handlers;
mod middleware;
mod subscriptions;
mod types;

pub use auth::{API_KEY_ENV, get_api_key_from_env};
pub use handlers::status_for;
pub use middleware::{RATE_LIMIT_ENV, create_rate_limiter, get_rate_limit_from_env};
pub use subscriptions::{Drained, SubscriptionHub};
pub use types::{
    ChangesResponse, ErrorResponse, ExportResponse, HealthResponse, SubscribeRequest,
    SubscribeResponse,
};

use crate::error::AppError;
use axum::{
    Router,
    http::{HeaderValue, Method, header},
    middleware as axum_middleware,
    routing::{delete, get, post},
};
use bassline_core::{BridgeKind, ContactChange, Kernel};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

pub const CORS_ORIGINS_ENV: &str = "BASSLINE_CORS_ORIGINS";

/// Largest accepted request body (templates included).
const MAX_BODY_BYTES: usize = 16 * 1024 * 1024;

/// Tick period while the scheduler does not ask for ticks; bounds how late
/// a switch to a batching scheduler is noticed.
const IDLE_TICK: Duration = Duration::from_millis(250);

// =============================================================================
// SERVER STATE
// =============================================================================

#[derive(Clone)]
pub struct AppState {
    pub kernel: Arc<Mutex<Kernel>>,
    pub subscriptions: Arc<SubscriptionHub>,
}

impl AppState {
    /// Serve an initialized kernel; attaches it as a remote bridge and
    /// routes its content changes into the subscription hub.
    pub fn new(mut kernel: Kernel) -> Self {
        if let Err(e) = kernel.attach_bridge(BridgeKind::Remote) {
            tracing::warn!(error = %e, "kernel keeps its existing bridge");
        }
        let subscriptions = Arc::new(SubscriptionHub::new());
        let hub = Arc::clone(&subscriptions);
        kernel.subscribe(Box::new(move |change: &ContactChange| hub.publish(change)));
        Self {
            kernel: Arc::new(Mutex::new(kernel)),
            subscriptions,
        }
    }
}

// =============================================================================
// CORS CONFIGURATION
// =============================================================================

/// `BASSLINE_CORS_ORIGINS`: "*" allows every origin, a comma-separated
/// list allows those, unset means localhost only.
fn build_cors_layer() -> CorsLayer {
    match std::env::var(CORS_ORIGINS_ENV).ok().as_deref() {
        Some("*") => {
            tracing::warn!("CORS: allowing ALL origins ({}=*)", CORS_ORIGINS_ENV);
            CorsLayer::permissive()
        }
        Some(origins) => {
            let allowed: Vec<HeaderValue> = origins
                .split(',')
                .filter_map(|s| {
                    let trimmed = s.trim();
                    match trimmed.parse::<HeaderValue>() {
                        Ok(hv) => Some(hv),
                        Err(e) => {
                            tracing::warn!("CORS: invalid origin '{}': {}", trimmed, e);
                            None
                        }
                    }
                })
                .collect();
            if allowed.is_empty() {
                tracing::warn!("CORS: no valid origins, defaulting to localhost only");
                build_localhost_cors()
            } else {
                cors_for(allowed)
            }
        }
        None => build_localhost_cors(),
    }
}

fn build_localhost_cors() -> CorsLayer {
    let origins: Vec<HeaderValue> = [
        "http://localhost:3000",
        "http://localhost:8080",
        "http://127.0.0.1:3000",
        "http://127.0.0.1:8080",
    ]
    .iter()
    .filter_map(|o| o.parse::<HeaderValue>().ok())
    .collect();
    cors_for(origins)
}

fn cors_for(origins: Vec<HeaderValue>) -> CorsLayer {
    CorsLayer::new()
        .allow_origin(origins)
        .allow_methods([Method::GET, Method::POST, Method::DELETE, Method::OPTIONS])
        .allow_headers([header::CONTENT_TYPE, header::AUTHORIZATION])
}

// =============================================================================
// ROUTER CREATION
// =============================================================================

/// Build the router.
///
/// Middleware stack (outer to inner): CORS, tracing, body limit, rate
/// limiting (if enabled), authentication (if configured).
pub fn create_router(state: AppState) -> Router {
    let rate_limit = get_rate_limit_from_env();
    let rate_limiter = if rate_limit > 0 {
        tracing::info!("rate limiting enabled: {} requests/second", rate_limit);
        Some(create_rate_limiter(rate_limit))
    } else {
        tracing::info!("rate limiting disabled");
        None
    };

    let has_auth = get_api_key_from_env().is_some();
    if has_auth {
        tracing::info!("API key authentication enabled");
    } else {
        tracing::warn!(
            "API key authentication DISABLED; set {} to require a bearer token",
            API_KEY_ENV
        );
    }

    let mut router = Router::new()
        .route("/health", get(handlers::health_handler))
        .route("/status", get(handlers::status_handler))
        .route("/command", post(handlers::command_handler))
        .route("/subscriptions", post(handlers::subscribe_handler))
        .route(
            "/subscriptions/{id}/changes",
            get(handlers::changes_handler),
        )
        .route("/subscriptions/{id}", delete(handlers::unsubscribe_handler))
        .route("/groups/{id}/export", get(handlers::export_handler));

    if has_auth {
        router = router.layer(axum_middleware::from_fn(auth::api_key_auth_middleware));
    }
    if let Some(limiter) = rate_limiter {
        router = router.layer(axum_middleware::from_fn_with_state(
            limiter,
            middleware::rate_limit_middleware,
        ));
    }

    router
        .layer(axum::extract::DefaultBodyLimit::max(MAX_BODY_BYTES))
        .layer(build_cors_layer())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

// =============================================================================
// SERVER STARTUP
// =============================================================================

/// Tick the kernel for as long as the task lives.
pub fn spawn_ticker(state: &AppState) -> JoinHandle<()> {
    let kernel = Arc::clone(&state.kernel);
    tokio::spawn(async move {
        loop {
            let window = {
                let mut kernel = kernel.lock().await;
                match kernel.tick() {
                    Ok(0) => {}
                    Ok(applied) => tracing::debug!(applied, "tick"),
                    Err(e) => tracing::warn!(error = %e, "tick failed"),
                }
                kernel.tick_interval()
            };
            tokio::time::sleep(window.unwrap_or(IDLE_TICK)).await;
        }
    })
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::warn!(error = %e, "cannot listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    tracing::info!("shutdown signal received");
}

/// Serve `kernel` on `addr` until Ctrl+C.
pub async fn run_server(addr: &str, kernel: Kernel) -> Result<(), AppError> {
    let state = AppState::new(kernel);
    let ticker = spawn_ticker(&state);
    let router = create_router(state);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| AppError::Io(format!("Bind failed: {}", e)))?;
    tracing::info!("Bassline peer server listening on {}", addr);

    let served = axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .map_err(|e| AppError::Io(format!("Server error: {}", e)));
    ticker.abort();
    served
}
