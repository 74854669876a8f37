//! # Orchestrator
//!
//! Ingestion of a parsed program into a network.
//!
//! 1. Declare new types (idempotent on name).
//! 2. Apply the program's rule removals.
//! 3. Build new rules; stored facts are replayed into their new edges.
//! 4. Submit the program's facts, waiting for each to become visible in the
//!    fact store.
//!
//! Everything runs inside one transaction, opened implicitly unless the
//! caller already has one active. A failure rolls the implicit transaction
//! back, so the network is left as it was.

use crate::fact::{Fact, FactId, TypeDefinition};
use crate::network::Network;
use crate::primitives::{
    DEFAULT_SUBMISSION_TIMEOUT, INITIAL_BACKOFF, MAX_BACKOFF, MIN_FACT_TIMEOUT,
};
use crate::rule::Program;
use crate::types::{ReteError, RuleId, TransactionId};
use serde::{Deserialize, Serialize};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

// =============================================================================
// CONFIGURATION
// =============================================================================

/// Persistence barrier settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SubmissionConfig {
    /// Budget for the whole fact batch.
    pub timeout_ms: u64,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    /// Floor of the per-fact share of the budget.
    pub min_fact_timeout_ms: u64,
}

impl Default for SubmissionConfig {
    fn default() -> Self {
        Self {
            timeout_ms: millis(DEFAULT_SUBMISSION_TIMEOUT),
            initial_backoff_ms: millis(INITIAL_BACKOFF),
            max_backoff_ms: millis(MAX_BACKOFF),
            min_fact_timeout_ms: millis(MIN_FACT_TIMEOUT),
        }
    }
}

impl SubmissionConfig {
    /// Per-fact deadline for a batch of `count` facts.
    #[must_use]
    pub fn fact_timeout(&self, count: usize) -> Duration {
        let share = self.timeout_ms / count.max(1) as u64;
        Duration::from_millis(share.max(self.min_fact_timeout_ms))
    }
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

// =============================================================================
// REPORT
// =============================================================================

/// Outcome of one ingestion.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct IngestionReport {
    pub types_added: Vec<String>,
    pub rules_added: Vec<RuleId>,
    pub rules_removed: Vec<RuleId>,
    pub facts_submitted: usize,
    /// Transaction opened for this ingestion, if any.
    pub transaction: Option<TransactionId>,
    pub elapsed_ms: u64,
}

// =============================================================================
// ORCHESTRATOR
// =============================================================================

/// Drives program ingestion.
#[derive(Debug, Clone, Copy, Default)]
pub struct Orchestrator {
    pub config: SubmissionConfig,
}

impl Orchestrator {
    #[must_use]
    pub fn new(config: SubmissionConfig) -> Self {
        Self { config }
    }

    /// Ingest `program` atomically.
    pub fn ingest(&self, network: &mut Network, program: &Program) -> Result<IngestionReport, ReteError> {
        let started = Instant::now();
        let implicit = if network.in_transaction() {
            None
        } else {
            Some(network.begin_transaction()?)
        };

        let mut report = IngestionReport {
            transaction: implicit,
            ..IngestionReport::default()
        };
        match self.apply(network, program, &mut report) {
            Ok(()) => {
                if let Some(tx) = implicit {
                    network.commit(tx)?;
                }
                report.elapsed_ms = millis(started.elapsed());
                info!(
                    types = report.types_added.len(),
                    rules = report.rules_added.len(),
                    removed = report.rules_removed.len(),
                    facts = report.facts_submitted,
                    elapsed_ms = report.elapsed_ms,
                    "program ingested"
                );
                Ok(report)
            }
            Err(e) => {
                if let Some(tx) = implicit
                    && let Err(rollback) = network.rollback(tx)
                {
                    warn!(error = %rollback, "rollback after failed ingestion failed");
                }
                Err(e)
            }
        }
    }

    fn apply(&self, network: &mut Network, program: &Program, report: &mut IngestionReport) -> Result<(), ReteError> {
        for definition in &program.types {
            if !network.has_type(&definition.name) {
                network.add_type(definition.clone())?;
                report.types_added.push(definition.name.clone());
            }
        }

        for removal in &program.rule_removals {
            if network.has_rule(&removal.rule_id) {
                network.remove_rule(&removal.rule_id)?;
                report.rules_removed.push(removal.rule_id.clone());
            } else {
                warn!(rule = %removal.rule_id, "rule to remove is not registered");
            }
        }

        for rule in &program.expressions {
            network.add_rule(rule.clone())?;
            report.rules_added.push(rule.rule_id.clone());
        }

        let timeout = self.config.fact_timeout(program.facts.len());
        for raw in &program.facts {
            let definition = declared_type(raw)
                .and_then(|name| program.type_definition(name).or_else(|| network.type_definition(name)))
                .cloned();
            let fact = Fact::from_json(raw, definition.as_ref())?;
            let id = fact.internal_id();
            network.submit_fact(fact)?;
            self.wait_for(network, &id, timeout)?;
            report.facts_submitted += 1;
        }
        Ok(())
    }

    /// Poll the store until `id` is visible, backing off exponentially.
    pub fn wait_for(&self, network: &Network, id: &FactId, timeout: Duration) -> Result<(), ReteError> {
        let started = Instant::now();
        let mut backoff = Duration::from_millis(self.config.initial_backoff_ms);
        let cap = Duration::from_millis(self.config.max_backoff_ms);
        loop {
            if network.store().contains(id) {
                return Ok(());
            }
            let elapsed = started.elapsed();
            if elapsed >= timeout {
                return Err(ReteError::SubmissionTimeout {
                    fact: id.clone(),
                    elapsed_ms: millis(elapsed),
                });
            }
            debug!(fact = %id, backoff_ms = millis(backoff), "fact not yet visible");
            thread::sleep(backoff.min(timeout - elapsed));
            backoff = (backoff * 2).min(cap);
        }
    }
}

/// Type name of a fact in external JSON form.
fn declared_type(raw: &serde_json::Value) -> Option<&str> {
    ["type", "reteType", "typeName"]
        .iter()
        .find_map(|key| raw.get(*key).and_then(|v| v.as_str()))
}

/// Types of `program` the network does not know yet.
#[must_use]
pub fn missing_types<'a>(network: &Network, program: &'a Program) -> Vec<&'a TypeDefinition> {
    program
        .types
        .iter()
        .filter(|t| !network.has_type(&t.name))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn program() -> Program {
        serde_json::from_value(json!({
            "types": [
                {"name": "Person", "fields": [
                    {"name": "name", "type": "string"},
                    {"name": "age", "type": "number"}
                ]}
            ],
            "expressions": [{
                "ruleId": "adults",
                "patterns": [{"variables": [{"name": "p", "dataType": "Person"}]}],
                "constraints": {
                    "type": "binaryOperation",
                    "left": {"type": "fieldAccess", "object": "p", "field": "age"},
                    "operator": ">",
                    "right": {"type": "numberLiteral", "value": 18}
                },
                "action": {"jobs": [{"name": "print", "args": []}]}
            }],
            "facts": [
                {"id": "P1", "type": "Person", "name": "Ann", "age": 30},
                {"id": "P2", "type": "Person", "name": "Bob", "age": 12}
            ]
        }))
        .expect("program")
    }

    #[test]
    fn default_config_matches_the_barrier_constants() {
        let config = SubmissionConfig::default();
        assert_eq!(config.timeout_ms, 30_000);
        assert_eq!(config.initial_backoff_ms, 10);
        assert_eq!(config.max_backoff_ms, 500);
        assert_eq!(config.fact_timeout(1_000_000), Duration::from_secs(1));
    }

    #[test]
    fn ingest_builds_and_fires() {
        let mut network = Network::new();
        let report = Orchestrator::default()
            .ingest(&mut network, &program())
            .expect("ingest");
        assert_eq!(report.types_added, vec!["Person".to_string()]);
        assert_eq!(report.facts_submitted, 2);
        assert!(!network.in_transaction());
        assert_eq!(network.matches(&RuleId::new("adults")).expect("matches").len(), 1);
        assert!(missing_types(&network, &program()).is_empty());
    }

    #[test]
    fn failed_ingestion_leaves_the_network_unchanged() {
        let mut network = Network::new();
        let mut bad = program();
        bad.facts.push(json!({"id": "P3", "type": "Person", "name": "Cy", "age": "old"}));
        assert!(Orchestrator::default().ingest(&mut network, &bad).is_err());
        assert_eq!(network.fact_count(), 0);
        assert!(network.rule_ids().is_empty());
        assert!(!network.has_type("Person"));
    }

    #[test]
    fn missing_facts_time_out() {
        let network = Network::new();
        let orchestrator = Orchestrator::new(SubmissionConfig {
            timeout_ms: 20,
            initial_backoff_ms: 1,
            max_backoff_ms: 4,
            min_fact_timeout_ms: 20,
        });
        let err = orchestrator
            .wait_for(&network, &FactId::new("Person", "P9"), Duration::from_millis(20))
            .expect_err("timeout");
        assert!(matches!(err, ReteError::SubmissionTimeout { .. }));
    }
}
