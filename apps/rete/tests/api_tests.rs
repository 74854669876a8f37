//! Integration tests for the Rete monitoring API.
//!
//! Uses axum-test to exercise the router without binding a socket.

#![allow(clippy::unwrap_used, clippy::panic)]

use axum::http::{HeaderValue, StatusCode, header};
use axum_test::TestServer;
use rete::api::{
    AppState, ErrorResponse, FactsResponse, HealthResponse, RetractResponse, RuleRemovedResponse,
    StatusResponse, create_router, status_for,
};
use rete::config::ServerConfig;
use rete_core::{CommandPhase, FactId, Network, NodeType, Orchestrator, ReteError};
use serde_json::{Value, json};

// =============================================================================
// HELPER FUNCTIONS
// =============================================================================

fn test_config() -> ServerConfig {
    ServerConfig {
        rate_limit: 0,
        ..ServerConfig::default()
    }
}

fn create_test_server_with(config: &ServerConfig) -> TestServer {
    let state = AppState::new(Network::new(), Orchestrator::default());
    TestServer::new(create_router(state, config)).unwrap()
}

fn create_test_server() -> TestServer {
    create_test_server_with(&test_config())
}

fn program() -> Value {
    json!({
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
                "operator": ">=",
                "right": {"type": "numberLiteral", "value": 18}
            },
            "action": {"name": "log", "args": [{"type": "fieldAccess", "object": "p", "field": "name"}]}
        }],
        "facts": [
            {"id": "P1", "type": "Person", "name": "Ann", "age": 30},
            {"id": "P2", "type": "Person", "name": "Bob", "age": 12}
        ]
    })
}

async fn create_populated_test_server() -> TestServer {
    let server = create_test_server();
    server.post("/program").json(&program()).await.assert_status_ok();
    server
}

// =============================================================================
// HEALTH / STATUS
// =============================================================================

#[tokio::test]
async fn test_health_endpoint() {
    let server = create_test_server();

    let response = server.get("/health").await;

    response.assert_status_ok();
    let health: HealthResponse = response.json();
    assert_eq!(health.status, "ok");
    assert_eq!(health.version, env!("CARGO_PKG_VERSION"));
}

#[tokio::test]
async fn test_status_empty_network() {
    let server = create_test_server();

    let response = server.get("/status").await;

    response.assert_status_ok();
    let status: StatusResponse = response.json();
    assert_eq!(status.stats.total_nodes, 1);
    assert_eq!(status.stats.facts, 0);
    assert!(!status.in_transaction);
}

#[tokio::test]
async fn test_status_populated_network() {
    let server = create_populated_test_server().await;

    let status: StatusResponse = server.get("/status").await.json();
    assert_eq!(status.stats.facts, 2);
    assert_eq!(status.stats.rules, 1);
    assert_eq!(status.stats.count(NodeType::Terminal), 1);
    assert_eq!(status.metrics.firings, 1);
}

// =============================================================================
// PROGRAM / RULES
// =============================================================================

#[tokio::test]
async fn test_program_report() {
    let server = create_test_server();

    let response = server.post("/program").json(&program()).await;

    response.assert_status_ok();
    let report: Value = response.json();
    assert_eq!(report["types_added"], json!(["Person"]));
    assert_eq!(report["rules_added"], json!(["adults"]));
    assert_eq!(report["facts_submitted"], json!(2));
}

#[tokio::test]
async fn test_rules_lists_matches() {
    let server = create_populated_test_server().await;

    let rules: Value = server.get("/rules").await.json();
    let list = rules["rules"].as_array().unwrap();
    assert_eq!(list.len(), 1);
    assert_eq!(list[0]["rule_id"], "adults");
    assert_eq!(list[0]["shape"], "alpha");
    assert_eq!(list[0]["matches"], 1);
}

#[tokio::test]
async fn test_duplicate_rule_rejected_atomically() {
    let server = create_populated_test_server().await;
    let again = json!({
        "expressions": [{
            "ruleId": "adults",
            "patterns": [{"variables": [{"name": "p", "dataType": "Person"}]}]
        }],
        "facts": [{"id": "P9", "type": "Person", "name": "Cy", "age": 50}]
    });

    let response = server.post("/program").json(&again).await;

    response.assert_status(StatusCode::BAD_REQUEST);
    let status: StatusResponse = server.get("/status").await.json();
    assert_eq!(status.stats.facts, 2);
}

#[tokio::test]
async fn test_remove_rule() {
    let server = create_populated_test_server().await;

    let response = server.delete("/rules/adults").await;
    response.assert_status_ok();
    let removed: RuleRemovedResponse = response.json();
    assert!(removed.removed);

    let status: StatusResponse = server.get("/status").await.json();
    assert_eq!(status.stats.rules, 0);
    assert_eq!(status.stats.count(NodeType::Alpha), 0);

    server
        .delete("/rules/adults")
        .await
        .assert_status(StatusCode::NOT_FOUND);
}

// =============================================================================
// FACTS
// =============================================================================

#[tokio::test]
async fn test_submit_fact_fires() {
    let server = create_populated_test_server().await;

    let response = server
        .post("/facts")
        .json(&json!({"facts": [{"id": "P3", "type": "Person", "name": "Dee", "age": 41}]}))
        .await;

    response.assert_status_ok();
    let body: FactsResponse = response.json();
    assert_eq!(body.submitted, 1);
    assert_eq!(body.firings, 1);
}

#[tokio::test]
async fn test_submit_invalid_fact_rejected() {
    let server = create_populated_test_server().await;

    let response = server
        .post("/facts")
        .json(&json!({"facts": [
            {"id": "P3", "type": "Person", "name": "Dee", "age": 41},
            {"id": "P4", "type": "Person", "name": "Eve", "age": "old"}
        ]}))
        .await;

    response.assert_status(StatusCode::BAD_REQUEST);
    let error: ErrorResponse = response.json();
    assert!(!error.error.is_empty());
    let status: StatusResponse = server.get("/status").await.json();
    assert_eq!(status.stats.facts, 2);
}

#[tokio::test]
async fn test_submit_unknown_type_rejected() {
    let server = create_test_server();

    server
        .post("/facts")
        .json(&json!({"facts": [{"id": "X1", "type": "Robot"}]}))
        .await
        .assert_status(StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_submit_empty_batch_rejected() {
    let server = create_test_server();

    server
        .post("/facts")
        .json(&json!({"facts": []}))
        .await
        .assert_status(StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_retract_fact() {
    let server = create_populated_test_server().await;

    let response = server
        .post("/facts/retract")
        .json(&json!({"type": "Person", "id": "P1"}))
        .await;

    response.assert_status_ok();
    let body: RetractResponse = response.json();
    assert_eq!(body.retracted, "Person~P1");

    let rules: Value = server.get("/rules").await.json();
    assert_eq!(rules["rules"][0]["matches"], 0);

    server
        .post("/facts/retract")
        .json(&json!({"type": "Person", "id": "P1"}))
        .await
        .assert_status(StatusCode::NOT_FOUND);
}

// =============================================================================
// FIRINGS / METRICS
// =============================================================================

#[tokio::test]
async fn test_firings_history() {
    let server = create_populated_test_server().await;
    server
        .post("/facts")
        .json(&json!({"facts": [{"id": "P3", "type": "Person", "name": "Dee", "age": 41}]}))
        .await
        .assert_status_ok();

    let all: Value = server.get("/firings").await.json();
    assert_eq!(all["total"], 2);
    let records = all["records"].as_array().unwrap();
    assert_eq!(records.len(), 2);
    assert_eq!(records[0]["invocation"]["action"], "log");
    assert_eq!(records[0]["invocation"]["bindings"]["p"], "Person~P1");

    let last: Value = server.get("/firings?limit=1").await.json();
    let records = last["records"].as_array().unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0]["invocation"]["bindings"]["p"], "Person~P3");

    let other: Value = server.get("/firings?rule=nope").await.json();
    assert!(other["records"].as_array().unwrap().is_empty());
}

#[tokio::test]
async fn test_metrics_exposition() {
    let server = create_populated_test_server().await;

    let response = server.get("/metrics").await;

    response.assert_status_ok();
    let text = response.text();
    assert!(text.contains("# TYPE rete_firings_total counter"));
    assert!(text.contains("rete_firings_total 1\n"));
    assert!(text.contains("rete_facts 2\n"));
    assert!(text.contains("rete_nodes{kind=\"terminal\"} 1\n"));
}

// =============================================================================
// ERROR MAPPING
// =============================================================================

#[test]
fn test_status_mapping() {
    let timeout = ReteError::SubmissionTimeout {
        fact: FactId::new("Person", "P1"),
        elapsed_ms: 5,
    };
    assert_eq!(status_for(&timeout), StatusCode::GATEWAY_TIMEOUT);
    assert_eq!(
        status_for(&ReteError::Duplicate(FactId::new("Person", "P1"))),
        StatusCode::CONFLICT
    );
    let wrapped = ReteError::Command {
        command: "remove_fact".to_string(),
        phase: CommandPhase::Execute,
        position: 3,
        source: Box::new(ReteError::NotFound(FactId::new("Person", "P1"))),
    };
    assert_eq!(status_for(&wrapped), StatusCode::NOT_FOUND);
    assert_eq!(
        status_for(&ReteError::IoError("disk".to_string())),
        StatusCode::INTERNAL_SERVER_ERROR
    );
}

// =============================================================================
// AUTHENTICATION / RATE LIMITING
// =============================================================================

fn create_auth_test_server(api_key: &str) -> TestServer {
    create_test_server_with(&ServerConfig {
        api_key: Some(api_key.to_string()),
        ..test_config()
    })
}

#[tokio::test]
async fn test_auth_valid_bearer_token() {
    let api_key = "test-secret-key-12345";
    let server = create_auth_test_server(api_key);

    let response = server
        .get("/status")
        .add_header(
            header::AUTHORIZATION,
            format!("Bearer {}", api_key).parse::<HeaderValue>().unwrap(),
        )
        .await;

    response.assert_status_ok();
}

#[tokio::test]
async fn test_auth_raw_token() {
    let api_key = "test-raw-key-67890";
    let server = create_auth_test_server(api_key);

    server
        .get("/rules")
        .add_header(header::AUTHORIZATION, api_key.parse::<HeaderValue>().unwrap())
        .await
        .assert_status_ok();
}

#[tokio::test]
async fn test_auth_rejects_wrong_or_missing_key() {
    let server = create_auth_test_server("correct-key");

    server
        .get("/status")
        .add_header(
            header::AUTHORIZATION,
            "Bearer wrong-key".parse::<HeaderValue>().unwrap(),
        )
        .await
        .assert_status(StatusCode::UNAUTHORIZED);

    server
        .post("/program")
        .json(&program())
        .await
        .assert_status(StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_auth_health_is_public() {
    let server = create_auth_test_server("correct-key");

    server.get("/health").await.assert_status_ok();
}

#[tokio::test]
async fn test_rate_limit_exceeded() {
    let server = create_test_server_with(&ServerConfig {
        rate_limit: 1,
        ..ServerConfig::default()
    });

    server.get("/status").await.assert_status_ok();
    let response = server.get("/rules").await;
    response.assert_status(StatusCode::TOO_MANY_REQUESTS);
    let retry_after: u64 = response
        .header(header::RETRY_AFTER)
        .to_str()
        .unwrap()
        .parse()
        .unwrap();
    assert!(retry_after >= 1);
    let body: ErrorResponse = response.json();
    assert!(body.error.contains("1 requests/second"));

    // Liveness checks are never limited.
    server.get("/health").await.assert_status_ok();
    server.get("/health").await.assert_status_ok();
}

// =============================================================================
// EVENT STREAM
// =============================================================================

#[tokio::test]
async fn test_ws_streams_firings_and_metrics() {
    let state = AppState::new(Network::new(), Orchestrator::default());
    let server = TestServer::builder()
        .http_transport()
        .build(create_router(state, &test_config()))
        .unwrap();

    let mut websocket = server.get_websocket("/ws").await.into_websocket().await;

    let snapshot: Value = websocket.receive_json().await;
    assert_eq!(snapshot["event"], "metrics");
    assert_eq!(snapshot["stats"]["facts"], 0);

    server.post("/program").json(&program()).await.assert_status_ok();

    let firing: Value = websocket.receive_json().await;
    assert_eq!(firing["event"], "firing");
    assert_eq!(firing["invocation"]["rule"], "adults");
    assert_eq!(firing["invocation"]["args"], json!(["Ann"]));

    let metrics: Value = websocket.receive_json().await;
    assert_eq!(metrics["event"], "metrics");
    assert_eq!(metrics["stats"]["facts"], 2);
    assert_eq!(metrics["metrics"]["firings"], 1);

    server
        .post("/facts/retract")
        .json(&json!({"type": "Person", "id": "P1"}))
        .await
        .assert_status_ok();
    let metrics: Value = websocket.receive_json().await;
    assert_eq!(metrics["event"], "metrics");
    assert_eq!(metrics["stats"]["facts"], 1);

    websocket.close().await;
}
