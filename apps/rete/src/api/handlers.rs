//! # API Endpoint Handlers
//!
//! Mutating endpoints take the network's write lock for the whole operation,
//! so requests are applied one at a time.

use super::{
    AppState,
    types::{
        ErrorResponse, FactsRequest, FactsResponse, FiringsQuery, FiringsResponse,
        HealthResponse, MAX_FIRINGS_PAGE, RetractRequest, RetractResponse, RuleRemovedResponse,
        RuleSummary, RulesResponse, StatusResponse,
    },
};
use axum::{
    Json,
    extract::{Path, Query, State},
    http::{StatusCode, header},
    response::{IntoResponse, Response},
};
use rete_core::{FactId, IngestionReport, Program, ReteError, RuleId};

/// Records returned by `/firings` when no limit is given.
const DEFAULT_FIRINGS_PAGE: usize = 100;

// =============================================================================
// ERROR MAPPING
// =============================================================================

/// A core error rendered as an HTTP response.
#[derive(Debug)]
pub struct ApiError(pub ReteError);

impl From<ReteError> for ApiError {
    fn from(e: ReteError) -> Self {
        Self(e)
    }
}

/// HTTP status for a core error, judged by its root cause.
#[must_use]
pub fn status_for(error: &ReteError) -> StatusCode {
    match error.root_cause() {
        ReteError::Validation { .. }
        | ReteError::InvalidRule { .. }
        | ReteError::UnknownType(_)
        | ReteError::Cycle(_)
        | ReteError::MissingDependency { .. }
        | ReteError::Evaluation(_)
        | ReteError::SerializationError(_) => StatusCode::BAD_REQUEST,
        ReteError::NotFound(_) | ReteError::RuleNotFound(_) => StatusCode::NOT_FOUND,
        ReteError::Duplicate(_) | ReteError::RegistryConflict { .. } | ReteError::InvalidState(_) => {
            StatusCode::CONFLICT
        }
        ReteError::SubmissionTimeout { .. } => StatusCode::GATEWAY_TIMEOUT,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = status_for(&self.0);
        if status.is_server_error() {
            tracing::error!(error = %self.0, "request failed");
        } else {
            tracing::debug!(error = %self.0, status = status.as_u16(), "request rejected");
        }
        (
            status,
            Json(ErrorResponse {
                error: self.0.to_string(),
            }),
        )
            .into_response()
    }
}

// =============================================================================
// HEALTH / STATUS
// =============================================================================

pub async fn health_handler() -> impl IntoResponse {
    Json(HealthResponse::default())
}

/// Node counts, fact count and runtime counters.
pub async fn status_handler(State(state): State<AppState>) -> Json<StatusResponse> {
    let network = state.network.read().await;
    Json(StatusResponse::of(&network))
}

// =============================================================================
// RULES
// =============================================================================

/// Registered rules with their shape and current match count.
pub async fn rules_handler(State(state): State<AppState>) -> Result<Json<RulesResponse>, ApiError> {
    let network = state.network.read().await;
    let mut rules = Vec::new();
    for id in network.rule_ids() {
        let Some(report) = network.build_report(&id) else {
            continue;
        };
        rules.push(RuleSummary::new(report, network.matches(&id)?.len()));
    }
    Ok(Json(RulesResponse { rules }))
}

pub async fn remove_rule_handler(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<RuleRemovedResponse>, ApiError> {
    let rule_id = RuleId::new(id);
    let mut network = state.network.write().await;
    network.remove_rule(&rule_id)?;
    state.publish_metrics(&network);
    Ok(Json(RuleRemovedResponse {
        rule_id,
        removed: true,
    }))
}

// =============================================================================
// INGESTION
// =============================================================================

/// Ingest a whole program atomically.
pub async fn program_handler(
    State(state): State<AppState>,
    Json(program): Json<Program>,
) -> Result<Json<IngestionReport>, ApiError> {
    let mut network = state.network.write().await;
    let report = state.orchestrator.ingest(&mut network, &program)?;
    state.publish_metrics(&network);
    Ok(Json(report))
}

/// Submit facts against the declared types. All or nothing.
pub async fn facts_handler(
    State(state): State<AppState>,
    Json(request): Json<FactsRequest>,
) -> Result<Json<FactsResponse>, ApiError> {
    request.validate()?;
    let program = Program {
        facts: request.facts,
        ..Program::default()
    };

    let mut network = state.network.write().await;
    let before = network.metrics().firings;
    let report = state.orchestrator.ingest(&mut network, &program)?;
    state.publish_metrics(&network);
    Ok(Json(FactsResponse {
        submitted: report.facts_submitted,
        firings: network.metrics().firings - before,
    }))
}

pub async fn retract_handler(
    State(state): State<AppState>,
    Json(request): Json<RetractRequest>,
) -> Result<Json<RetractResponse>, ApiError> {
    let id = FactId::new(request.fact_type, request.id);
    let mut network = state.network.write().await;
    network.retract_fact(&id)?;
    state.publish_metrics(&network);
    Ok(Json(RetractResponse {
        retracted: id.to_string(),
    }))
}

// =============================================================================
// FIRINGS
// =============================================================================

/// Most recent execution records, oldest first.
pub async fn firings_handler(
    State(state): State<AppState>,
    Query(query): Query<FiringsQuery>,
) -> Json<FiringsResponse> {
    let limit = query
        .limit
        .unwrap_or(DEFAULT_FIRINGS_PAGE)
        .min(MAX_FIRINGS_PAGE);
    let network = state.network.read().await;
    let executor = network.executor();
    let matching: Vec<_> = executor
        .history()
        .filter(|r| {
            query
                .rule
                .as_deref()
                .is_none_or(|rule| r.invocation.rule.as_str() == rule)
        })
        .collect();
    let skip = matching.len().saturating_sub(limit);
    Json(FiringsResponse {
        total: executor.total_executions(),
        records: matching.into_iter().skip(skip).cloned().collect(),
    })
}

// =============================================================================
// METRICS
// =============================================================================

/// Prometheus text exposition of the network counters.
pub async fn metrics_handler(State(state): State<AppState>) -> impl IntoResponse {
    let network = state.network.read().await;
    let metrics = network.metrics();
    let stats = network.stats();

    let mut body = String::new();
    let counters = [
        ("rete_facts_submitted_total", "Facts inserted", metrics.facts_submitted),
        ("rete_facts_retracted_total", "Facts retracted", metrics.facts_retracted),
        ("rete_activations_total", "Node activations", metrics.activations),
        ("rete_firings_total", "Terminal firings", metrics.firings),
        ("rete_evaluation_errors_total", "Conditions that failed to evaluate", metrics.evaluation_errors),
        ("rete_cache_hits_total", "Arithmetic cache hits", metrics.cache_hits),
        ("rete_cache_misses_total", "Arithmetic cache misses", metrics.cache_misses),
        ("rete_shared_reuses_total", "Nodes reused through sharing", metrics.shared_reuses),
        ("rete_rules_added_total", "Rules built", metrics.rules_added),
        ("rete_rules_removed_total", "Rules removed", metrics.rules_removed),
        ("rete_commits_total", "Committed transactions", metrics.commits),
        ("rete_rollbacks_total", "Rolled back transactions", metrics.rollbacks),
    ];
    for (name, help, value) in counters {
        body.push_str(&format!("# HELP {name} {help}\n# TYPE {name} counter\n{name} {value}\n"));
    }

    body.push_str("# HELP rete_nodes Live nodes by kind\n# TYPE rete_nodes gauge\n");
    for (kind, count) in &stats.nodes {
        body.push_str(&format!("rete_nodes{{kind=\"{kind}\"}} {count}\n"));
    }
    let gauges = [
        ("rete_facts", "Stored facts", stats.facts),
        ("rete_rules", "Registered rules", stats.rules),
        ("rete_matches", "Complete matches held by terminals", stats.matches),
    ];
    for (name, help, value) in gauges {
        body.push_str(&format!("# HELP {name} {help}\n# TYPE {name} gauge\n{name} {value}\n"));
    }

    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        body,
    )
}
