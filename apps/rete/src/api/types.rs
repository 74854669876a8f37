//! # API Request/Response Types
//!
//! This module defines the JSON structures for the HTTP API.

use rete_core::{
    BuildReport, ExecutionRecord, Network, NetworkMetrics, NetworkStats, ReteError, RuleId,
    RuleShape,
};
use serde::{Deserialize, Serialize};

/// Maximum number of facts accepted by one `POST /facts`.
pub const MAX_FACTS_PER_REQUEST: usize = 10_000;

/// Upper bound of the `limit` query parameter of `/firings`.
pub const MAX_FIRINGS_PAGE: usize = 1_000;

// =============================================================================
// HEALTH RESPONSE
// =============================================================================

/// Health check response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
}

impl Default for HealthResponse {
    fn default() -> Self {
        Self {
            status: "ok".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

// =============================================================================
// STATUS RESPONSE
// =============================================================================

/// Network status response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusResponse {
    pub stats: NetworkStats,
    pub metrics: NetworkMetrics,
    pub in_transaction: bool,
}

impl StatusResponse {
    #[must_use]
    pub fn of(network: &Network) -> Self {
        Self {
            stats: network.stats(),
            metrics: network.metrics().clone(),
            in_transaction: network.in_transaction(),
        }
    }
}

// =============================================================================
// RULES
// =============================================================================

/// One registered rule.
#[derive(Debug, Clone, Serialize)]
pub struct RuleSummary {
    pub rule_id: RuleId,
    pub shape: RuleShape,
    pub nodes_created: usize,
    pub nodes_shared: usize,
    pub matches: usize,
}

impl RuleSummary {
    #[must_use]
    pub fn new(report: &BuildReport, matches: usize) -> Self {
        Self {
            rule_id: report.rule.clone(),
            shape: report.shape,
            nodes_created: report.created.len(),
            nodes_shared: report.shared.len(),
            matches,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RulesResponse {
    pub rules: Vec<RuleSummary>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuleRemovedResponse {
    pub rule_id: RuleId,
    pub removed: bool,
}

// =============================================================================
// FACTS
// =============================================================================

/// Facts to submit, in any external shape the core accepts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FactsRequest {
    pub facts: Vec<serde_json::Value>,
}

impl FactsRequest {
    pub fn validate(&self) -> Result<(), ReteError> {
        if self.facts.is_empty() {
            return Err(ReteError::Validation {
                fact: "request".to_string(),
                reason: "no facts given".to_string(),
            });
        }
        if self.facts.len() > MAX_FACTS_PER_REQUEST {
            return Err(ReteError::Validation {
                fact: "request".to_string(),
                reason: format!(
                    "{} facts exceed the maximum of {}",
                    self.facts.len(),
                    MAX_FACTS_PER_REQUEST
                ),
            });
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FactsResponse {
    pub submitted: usize,
    pub firings: u64,
}

/// Fact to retract.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetractRequest {
    #[serde(rename = "type")]
    pub fact_type: String,
    pub id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetractResponse {
    pub retracted: String,
}

// =============================================================================
// FIRINGS
// =============================================================================

/// `/firings` query string.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct FiringsQuery {
    pub rule: Option<String>,
    pub limit: Option<usize>,
}

#[derive(Debug, Clone, Serialize)]
pub struct FiringsResponse {
    /// Calls made since start, including evicted records.
    pub total: u64,
    pub records: Vec<ExecutionRecord>,
}

// =============================================================================
// EVENT STREAM
// =============================================================================

/// One message on the `/ws` stream, tagged by `event`.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum StreamEvent {
    /// An action call, as recorded by the executor.
    Firing(ExecutionRecord),
    /// Counters after a mutation, and once on connect.
    Metrics(StatusResponse),
}

// =============================================================================
// ERRORS
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
}
