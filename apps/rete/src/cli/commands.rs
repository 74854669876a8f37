//! # CLI Command Implementations

use crate::api::{self, AppState};
use crate::config::Config;
use rete_core::{
    Expr, IngestionReport, Network, Orchestrator, Program, ReteError, canonical_string,
    condition_hash, expr::canonical::conjuncts, normalize, primitives::ALPHA_HASH_PREFIX,
};
use std::path::{Path, PathBuf};

// =============================================================================
// FILE SIZE LIMITS
// =============================================================================

/// Maximum size of a program file (100 MB).
const MAX_PROGRAM_FILE_SIZE: u64 = 100 * 1024 * 1024;

/// Validate file size before reading.
fn validate_file_size(path: &Path, max_size: u64) -> Result<(), ReteError> {
    let metadata = std::fs::metadata(path)
        .map_err(|e| ReteError::IoError(format!("Cannot read file metadata: {}", e)))?;

    if metadata.len() > max_size {
        return Err(ReteError::SerializationError(format!(
            "File size {} bytes exceeds maximum allowed {} bytes",
            metadata.len(),
            max_size
        )));
    }
    Ok(())
}

/// Resolve `path` to an existing regular file.
fn validate_file_path(path: &Path) -> Result<PathBuf, ReteError> {
    let canonical = path.canonicalize().map_err(|e| {
        ReteError::IoError(format!("Invalid file path '{}': {}", path.display(), e))
    })?;

    if !canonical.is_file() {
        return Err(ReteError::IoError(format!(
            "Path '{}' is not a regular file",
            path.display()
        )));
    }

    Ok(canonical)
}

/// Read and parse a program file.
pub fn load_program(path: &Path) -> Result<Program, ReteError> {
    let validated = validate_file_path(path)?;
    validate_file_size(&validated, MAX_PROGRAM_FILE_SIZE)?;
    let text = std::fs::read_to_string(&validated)
        .map_err(|e| ReteError::IoError(format!("Read program: {}", e)))?;
    Program::from_json_str(&text)
}

/// A fresh network configured from `config`.
#[must_use]
pub fn build_network(config: &Config) -> Network {
    let mut network = Network::new();
    network
        .executor_mut()
        .set_history_limit(config.actions.history_limit);
    network
}

fn print_json(value: &serde_json::Value) {
    println!("{}", serde_json::to_string_pretty(value).unwrap_or_default());
}

fn print_report(report: &IngestionReport) {
    println!("Types added:   {}", report.types_added.len());
    println!("Rules added:   {}", report.rules_added.len());
    println!("Rules removed: {}", report.rules_removed.len());
    println!("Facts:         {}", report.facts_submitted);
    println!("Elapsed:       {} ms", report.elapsed_ms);
}

// =============================================================================
// RUN COMMAND
// =============================================================================

/// Ingest a program and list every action execution.
pub fn cmd_run(config: &Config, json_mode: bool, file: &Path) -> Result<(), ReteError> {
    tracing::info!("Running program {:?}", file);
    let program = load_program(file)?;
    let mut network = build_network(config);
    let report = Orchestrator::new(config.submission).ingest(&mut network, &program)?;
    let records: Vec<_> = network.executor().history().collect();

    if json_mode {
        print_json(&serde_json::json!({
            "report": report,
            "firings": records,
            "metrics": network.metrics(),
        }));
        return Ok(());
    }

    println!("Rete Program Run");
    println!("================");
    print_report(&report);
    println!();
    println!("Firings: {}", network.metrics().firings);
    for record in records {
        let bindings: Vec<String> = record
            .invocation
            .bindings
            .iter()
            .map(|(var, id)| format!("{var}={id}"))
            .collect();
        println!(
            "  #{:<4} {} -> {}({}) [{}]",
            record.sequence,
            record.invocation.rule,
            record.invocation.action,
            record
                .invocation
                .args
                .iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>()
                .join(", "),
            bindings.join(" ")
        );
    }

    Ok(())
}

// =============================================================================
// CHECK COMMAND
// =============================================================================

/// Build types and rules only, then describe the network.
pub fn cmd_check(config: &Config, json_mode: bool, file: &Path) -> Result<(), ReteError> {
    let program = Program {
        facts: Vec::new(),
        ..load_program(file)?
    };
    let mut network = build_network(config);
    let report = Orchestrator::new(config.submission).ingest(&mut network, &program)?;
    let stats = network.stats();
    let rules: Vec<_> = network
        .rule_ids()
        .iter()
        .filter_map(|id| network.build_report(id).cloned())
        .collect();

    if json_mode {
        print_json(&serde_json::json!({
            "report": report,
            "stats": stats,
            "rules": rules,
        }));
        return Ok(());
    }

    println!("Rete Network Check");
    println!("==================");
    println!("Types: {}", stats.types);
    println!("Rules: {}", stats.rules);
    println!();
    println!("Nodes: {}", stats.total_nodes);
    for (kind, count) in &stats.nodes {
        println!("  {:<18} {}", kind.to_string(), count);
    }
    println!();
    println!("Shared reuses: {}", network.metrics().shared_reuses);
    for rule in &rules {
        println!(
            "  {:<24} {:?}: {} created, {} shared{}",
            rule.rule.to_string(),
            rule.shape,
            rule.created.len(),
            rule.shared.len(),
            if rule.router.is_some() { ", routed" } else { "" }
        );
    }

    Ok(())
}

// =============================================================================
// HASH COMMAND
// =============================================================================

/// Print the normalized form of a condition and the hash it shares under.
pub fn cmd_hash(json_mode: bool, condition: &str) -> Result<(), ReteError> {
    let expr: Expr = serde_json::from_str(condition)?;
    let canonical = canonical_string(&normalize(&expr));
    let hash = condition_hash(ALPHA_HASH_PREFIX, &canonical);
    let terms: Vec<String> = conjuncts(&expr).iter().map(canonical_string).collect();

    if json_mode {
        print_json(&serde_json::json!({
            "canonical": canonical,
            "hash": hash,
            "conjuncts": terms,
        }));
        return Ok(());
    }

    println!("Canonical: {}", canonical);
    println!("Hash:      {}", hash);
    println!("Conjuncts:");
    for term in terms {
        println!("  {}", term);
    }
    Ok(())
}

// =============================================================================
// SERVE COMMAND
// =============================================================================

/// Start the monitoring server, optionally preloaded with a program.
pub async fn cmd_serve(config: &Config, file: Option<&Path>) -> Result<(), ReteError> {
    let mut network = build_network(config);
    let orchestrator = Orchestrator::new(config.submission);
    if let Some(file) = file {
        let program = load_program(file)?;
        let report = orchestrator.ingest(&mut network, &program)?;
        tracing::info!(
            rules = report.rules_added.len(),
            facts = report.facts_submitted,
            "program preloaded"
        );
    }

    println!("Rete Monitoring Server Starting...");
    println!();
    println!("Configuration:");
    println!("  Address:    {}", config.server.addr());
    println!("  Rate limit: {} req/s", config.server.rate_limit);
    println!(
        "  Auth:       {}",
        if config.server.api_key.is_some() { "enabled" } else { "disabled" }
    );
    println!();
    println!("Endpoints:");
    println!("  GET    /health        - Health check");
    println!("  GET    /status        - Network status");
    println!("  GET    /rules         - Registered rules");
    println!("  DELETE /rules/{{id}}    - Remove a rule");
    println!("  POST   /program       - Ingest a program");
    println!("  POST   /facts         - Submit facts");
    println!("  POST   /facts/retract - Retract a fact");
    println!("  GET    /firings       - Recent action executions");
    println!("  GET    /metrics       - Prometheus metrics");
    println!("  GET    /ws            - Live firings and metrics (WebSocket)");
    println!();
    println!("Press Ctrl+C to stop");
    println!();

    api::run_server(AppState::new(network, orchestrator), &config.server).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_load_program_rejects_directories() {
        let dir = tempfile::tempdir().expect("tempdir");
        assert!(matches!(load_program(dir.path()), Err(ReteError::IoError(_))));
    }

    #[test]
    fn test_load_program_parses_file() {
        let mut file = tempfile::NamedTempFile::new().expect("temp file");
        write!(file, r#"{{"types": [{{"name": "Person", "fields": []}}]}}"#).expect("write");
        let program = load_program(file.path()).expect("program");
        assert_eq!(program.types.len(), 1);
    }

    #[test]
    fn test_hash_rejects_invalid_condition() {
        assert!(matches!(
            cmd_hash(true, "not json"),
            Err(ReteError::SerializationError(_))
        ));
    }
}
