//! # Monitoring HTTP API
//!
//! An axum server over one live network.
//!
//! ## Endpoints
//!
//! - `GET /health` - Health check (never authenticated)
//! - `GET /status` - Node counts and runtime counters
//! - `GET /rules` - Registered rules with their match counts
//! - `DELETE /rules/{id}` - Remove a rule
//! - `POST /program` - Ingest a program (types, removals, rules, facts)
//! - `POST /facts` - Submit facts
//! - `POST /facts/retract` - Retract a fact
//! - `GET /firings` - Recent action executions (`?rule=&limit=`)
//! - `GET /metrics` - Prometheus metrics
//! - `GET /ws` - WebSocket stream of firings and metrics snapshots
//!
//! Security settings come from [`ServerConfig`]: CORS origins, rate limit
//! and the optional API key.

mod auth;
mod handlers;
mod middleware;
mod stream;
mod types;

pub use auth::{ApiKey, keys_match};
pub use handlers::{ApiError, status_for};
pub use middleware::{GlobalRateLimiter, create_rate_limiter};
pub use stream::EVENT_BUFFER;
pub use types::{
    ErrorResponse, FactsRequest, FactsResponse, FiringsQuery, FiringsResponse, HealthResponse,
    MAX_FACTS_PER_REQUEST, RetractRequest, RetractResponse, RuleRemovedResponse, RuleSummary,
    RulesResponse, StatusResponse, StreamEvent,
};

use crate::config::ServerConfig;
use axum::{
    Router,
    http::{HeaderValue, Method, header},
    middleware as axum_middleware,
    routing::{delete, get, post},
};
use rete_core::{ExecutionRecord, Network, Orchestrator, ReteError};
use std::sync::Arc;
use tokio::sync::{RwLock, broadcast};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

/// Maximum request body (8 MB); programs can be large.
const MAX_BODY_BYTES: usize = 8 * 1024 * 1024;

// =============================================================================
// SERVER STATE
// =============================================================================

/// Shared server state.
#[derive(Clone)]
pub struct AppState {
    /// The network. One writer at a time.
    pub network: Arc<RwLock<Network>>,
    pub orchestrator: Orchestrator,
    /// Fan-out to `/ws` clients. Fed by the network's action executor.
    pub events: broadcast::Sender<StreamEvent>,
}

impl AppState {
    #[must_use]
    pub fn new(mut network: Network, orchestrator: Orchestrator) -> Self {
        let (events, _) = broadcast::channel(EVENT_BUFFER);
        let firings = events.clone();
        network
            .executor_mut()
            .subscribe(Arc::new(move |record: &ExecutionRecord| {
                // No subscriber is not an error.
                let _ = firings.send(StreamEvent::Firing(record.clone()));
            }));
        Self {
            network: Arc::new(RwLock::new(network)),
            orchestrator,
            events,
        }
    }

    /// Send a metrics snapshot to stream clients, if any are connected.
    pub fn publish_metrics(&self, network: &Network) {
        if self.events.receiver_count() > 0 {
            let _ = self
                .events
                .send(StreamEvent::Metrics(StatusResponse::of(network)));
        }
    }
}

// =============================================================================
// CORS CONFIGURATION
// =============================================================================

fn build_cors_layer(origins: Option<&str>) -> CorsLayer {
    match origins {
        Some("*") => {
            tracing::warn!("CORS: allowing ALL origins; do not use this in production");
            CorsLayer::permissive()
        }
        Some(origins) => {
            let allowed: Vec<HeaderValue> = origins
                .split(',')
                .filter_map(|s| {
                    let trimmed = s.trim();
                    match trimmed.parse::<HeaderValue>() {
                        Ok(hv) => {
                            tracing::info!("CORS: Allowing origin: {}", trimmed);
                            Some(hv)
                        }
                        Err(e) => {
                            tracing::warn!("CORS: Invalid origin '{}': {}", trimmed, e);
                            None
                        }
                    }
                })
                .collect();
            if allowed.is_empty() {
                tracing::warn!("CORS: no valid origins configured, defaulting to localhost only");
                build_localhost_cors()
            } else {
                restricted_cors(allowed)
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
    .filter_map(|o| o.parse().ok())
    .collect();
    restricted_cors(origins)
}

fn restricted_cors(origins: Vec<HeaderValue>) -> CorsLayer {
    CorsLayer::new()
        .allow_origin(origins)
        .allow_methods([Method::GET, Method::POST, Method::DELETE, Method::OPTIONS])
        .allow_headers([header::CONTENT_TYPE, header::AUTHORIZATION])
}

// =============================================================================
// ROUTER CREATION
// =============================================================================

/// Create the router with all endpoints and middleware.
///
/// Middleware stack (outer to inner):
/// 1. Tracing
/// 2. CORS
/// 3. Rate limiting (if enabled)
/// 4. Authentication (if configured)
pub fn create_router(state: AppState, config: &ServerConfig) -> Router {
    let mut router = Router::new()
        .route("/health", get(handlers::health_handler))
        .route("/status", get(handlers::status_handler))
        .route("/rules", get(handlers::rules_handler))
        .route("/rules/{id}", delete(handlers::remove_rule_handler))
        .route("/program", post(handlers::program_handler))
        .route("/facts", post(handlers::facts_handler))
        .route("/facts/retract", post(handlers::retract_handler))
        .route("/firings", get(handlers::firings_handler))
        .route("/metrics", get(handlers::metrics_handler))
        .route("/ws", get(stream::ws_handler));

    if let Some(key) = config.api_key.as_deref() {
        tracing::info!("API key authentication enabled");
        let key: ApiKey = Arc::from(key);
        router = router.layer(axum_middleware::from_fn_with_state(
            key,
            auth::api_key_auth_middleware,
        ));
    } else {
        tracing::warn!(
            "API key authentication DISABLED; set RETE_API_KEY to protect mutating endpoints"
        );
    }

    if config.rate_limit > 0 {
        tracing::info!("Rate limiting enabled: {} requests/second", config.rate_limit);
        router = router.layer(axum_middleware::from_fn_with_state(
            create_rate_limiter(config.rate_limit),
            middleware::rate_limit_middleware,
        ));
    } else {
        tracing::info!("Rate limiting disabled");
    }

    router
        .layer(axum::extract::DefaultBodyLimit::max(MAX_BODY_BYTES))
        .layer(build_cors_layer(config.cors_origins.as_deref()))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

// =============================================================================
// SERVER STARTUP
// =============================================================================

/// Serve `state` on `config.addr()` until Ctrl+C.
pub async fn run_server(state: AppState, config: &ServerConfig) -> Result<(), ReteError> {
    let addr = config.addr();
    let router = create_router(state, config);

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .map_err(|e| ReteError::IoError(format!("Bind failed: {}", e)))?;

    tracing::info!("Rete monitoring server listening on {}", addr);

    axum::serve(listener, router)
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!("Failed to listen for shutdown signal: {}", e);
            }
        })
        .await
        .map_err(|e| ReteError::IoError(format!("Server error: {}", e)))
}
