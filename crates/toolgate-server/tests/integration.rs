//! End-to-end gateway scenarios.
//!
//! Downstream servers are sh-scripted stdio peers; the sandbox engine is
//! `sh` (it executes the submitted program from stdin). Where a scenario
//! needs to act as the sandbox side of the bridge, the program writes its
//! `TOOLGATE_BRIDGE_*` environment to a file and sleeps, and the test talks
//! to the bridge directly.

#![cfg(unix)]

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::Value;
use toolgate_config::GatewayConfig;
use toolgate_server::frontend::ExecuteRequest;
use toolgate_server::GatewayServer;

/// A downstream that lists `tool-A` (integer `x` required) and answers
/// calls with `{ok: true, v: 42}`.
const GOOD_SERVER: &str = r#"i=0; while read line; do i=$((i+1)); case "$line" in
  *listTools*) printf '{"id":%s,"result":{"tools":[{"name":"tool-A","inputSchema":{"type":"object","properties":{"x":{"type":"integer"}},"required":["x"]}}]}}\n' "$i" ;;
  *) printf '{"id":%s,"result":{"ok":true,"v":42}}\n' "$i" ;;
esac; done"#;

/// A downstream whose tool calls always error (discovery still works).
const FAILING_SERVER: &str = r#"i=0; while read line; do i=$((i+1)); case "$line" in
  *listTools*) printf '{"id":%s,"result":{"tools":[{"name":"tool-B","inputSchema":{"type":"object"}}]}}\n' "$i" ;;
  *) printf '{"id":%s,"error":{"message":"downstream exploded"}}\n' "$i" ;;
esac; done"#;

struct Harness {
    server: Arc<GatewayServer>,
    _state_dir: tempfile::TempDir,
    state_path: std::path::PathBuf,
}

fn harness(extra_config: &str) -> Harness {
    let state_dir = tempfile::tempdir().unwrap();
    let json = format!(
        r#"{{
            "servers": {{
                "srv-1": {{ "transport": "stdio", "command": "sh", "args": ["-c", {good}] }},
                "srv-2": {{
                    "transport": "stdio", "command": "sh", "args": ["-c", {bad}],
                    "failureThreshold": 3, "cooldownMs": 30000
                }}
            }},
            "sandbox": {{ "scriptEngine": {{ "command": "sh" }} }},
            "stateDir": {state}
            {extra_config}
        }}"#,
        good = serde_json::to_string(GOOD_SERVER).unwrap(),
        bad = serde_json::to_string(FAILING_SERVER).unwrap(),
        state = serde_json::to_string(&state_dir.path().to_string_lossy()).unwrap(),
    );
    let config = GatewayConfig::from_json(&json).unwrap();
    let server = Arc::new(GatewayServer::from_config(&config).unwrap());
    let state_path = state_dir.path().to_path_buf();
    Harness {
        server,
        _state_dir: state_dir,
        state_path,
    }
}

fn execute_request(code: &str, allowed: &[&str], timeout_ms: u64) -> ExecuteRequest {
    ExecuteRequest {
        language: "script".into(),
        code: code.into(),
        allowed_tools: allowed.iter().map(|s| s.to_string()).collect(),
        timeout_ms: Some(timeout_ms),
        client_id: Some("test-client".into()),
        permissions: None,
    }
}

/// Start an execution whose program publishes its bridge URL and token to
/// `creds_path` and then sleeps, keeping the bridge alive for the test.
fn spawn_bridge_execution(
    server: Arc<GatewayServer>,
    creds_path: &std::path::Path,
    allowed: &[&str],
) -> tokio::task::JoinHandle<toolgate_server::frontend::ExecuteResponse> {
    let code = format!(
        r#"printf '%s
%s
' "$TOOLGATE_BRIDGE_URL" "$TOOLGATE_BRIDGE_TOKEN" > {creds}; sleep 2"#,
        creds = creds_path.display()
    );
    let request = execute_request(&code, allowed, 10_000);
    tokio::spawn(async move { server.execute(request).await })
}

async fn wait_for_creds(path: &std::path::Path) -> (String, String) {
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        if let Ok(content) = std::fs::read_to_string(path) {
            let mut lines = content.lines();
            if let (Some(url), Some(token)) = (lines.next(), lines.next()) {
                if !url.is_empty() && !token.is_empty() {
                    return (url.to_string(), token.to_string());
                }
            }
        }
        assert!(
            Instant::now() < deadline,
            "sandbox never published bridge credentials"
        );
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
}

async fn bridge_tool_call(
    url: &str,
    token: &str,
    tool: &str,
    args: Value,
    request_id: &str,
) -> Value {
    let client = reqwest::Client::new();
    client
        .post(format!("{url}/tool-call"))
        .header("Authorization", format!("Bearer {token}"))
        .json(&serde_json::json!({
            "toolName": tool, "args": args, "requestId": request_id
        }))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap()
}

fn audit_contents(state_path: &std::path::Path) -> String {
    let dir = state_path.join("audit-logs");
    let mut all = String::new();
    if let Ok(entries) = std::fs::read_dir(dir) {
        for entry in entries.flatten() {
            if let Ok(content) = std::fs::read_to_string(entry.path()) {
                all.push_str(&content);
            }
        }
    }
    all
}

#[tokio::test]
async fn happy_path_tool_call_round_trip() {
    let h = harness("");
    h.server.start().await;
    let creds = h.state_path.join("creds.txt");

    let execution = spawn_bridge_execution(h.server.clone(), &creds, &["srv-1.*"]);
    let (url, token) = wait_for_creds(&creds).await;

    let body = bridge_tool_call(&url, &token, "srv-1.tool-A", serde_json::json!({"x": 1}), "r1")
        .await;
    assert_eq!(body["result"]["ok"], true, "body: {body}");
    assert_eq!(body["result"]["v"], 42);

    let response = execution.await.unwrap();
    assert_eq!(response.status, "succeeded");
    assert_eq!(response.tool_call_summary.total, 1);
    assert_eq!(response.tool_call_summary.per_tool["srv-1.tool-A"], 1);

    let audit = audit_contents(&h.state_path);
    assert!(audit.contains("\"kind\":\"tool-call\""), "audit: {audit}");
    assert!(audit.contains("\"outcome\":\"success\""), "audit: {audit}");
}

#[tokio::test]
async fn validation_failure_reports_path_and_constraint() {
    let h = harness("");
    h.server.start().await;
    let creds = h.state_path.join("creds.txt");

    let execution = spawn_bridge_execution(h.server.clone(), &creds, &["srv-1.*"]);
    let (url, token) = wait_for_creds(&creds).await;

    // Integer required, string supplied: rejected before any downstream call.
    let body = bridge_tool_call(
        &url,
        &token,
        "srv-1.tool-A",
        serde_json::json!({"x": "1"}),
        "r1",
    )
    .await;
    assert_eq!(body["error"]["code"], "validation-failed", "body: {body}");
    assert_eq!(body["error"]["path"], "/x");
    assert_eq!(body["error"]["constraint"], "integer");

    let response = execution.await.unwrap();
    assert_eq!(
        response.tool_call_summary.total, 0,
        "rejected call must not be counted"
    );
}

#[tokio::test]
async fn second_call_is_rate_limited_with_reset() {
    let h = harness(r#", "rateLimit": { "maxRequests": 1, "windowMs": 60000 }"#);
    h.server.start().await;
    let creds = h.state_path.join("creds.txt");

    let execution = spawn_bridge_execution(h.server.clone(), &creds, &["srv-1.*"]);
    let (url, token) = wait_for_creds(&creds).await;

    let first =
        bridge_tool_call(&url, &token, "srv-1.tool-A", serde_json::json!({"x": 1}), "r1").await;
    assert_eq!(first["result"]["v"], 42, "first: {first}");

    let second =
        bridge_tool_call(&url, &token, "srv-1.tool-A", serde_json::json!({"x": 1}), "r2").await;
    assert_eq!(second["error"]["code"], "rate-limited", "second: {second}");
    let reset = second["error"]["resetInMs"].as_u64().unwrap();
    assert!(reset > 0 && reset <= 60_000, "resetInMs: {reset}");

    let _ = execution.await.unwrap();
    let audit = audit_contents(&h.state_path);
    assert!(audit.contains("\"kind\":\"rate-limited\""), "audit: {audit}");
    assert!(audit.contains("\"outcome\":\"rejected\""), "audit: {audit}");
}

#[tokio::test]
async fn circuit_opens_after_threshold_and_fails_fast() {
    let h = harness("");
    h.server.start().await;
    let creds = h.state_path.join("creds.txt");

    let execution = spawn_bridge_execution(h.server.clone(), &creds, &["srv-2.*"]);
    let (url, token) = wait_for_creds(&creds).await;

    for i in 0..3 {
        let body = bridge_tool_call(
            &url,
            &token,
            "srv-2.tool-B",
            serde_json::json!({}),
            &format!("r{i}"),
        )
        .await;
        assert_eq!(
            body["error"]["code"], "downstream-failure",
            "call {i}: {body}"
        );
    }

    // The 4th is rejected by the open circuit without a downstream trip.
    let started = Instant::now();
    let body =
        bridge_tool_call(&url, &token, "srv-2.tool-B", serde_json::json!({}), "r4").await;
    assert_eq!(body["error"]["code"], "circuit-open", "body: {body}");
    assert!(
        started.elapsed() < Duration::from_millis(200),
        "open circuit must reject fast"
    );

    let _ = execution.await.unwrap();
    let audit = audit_contents(&h.state_path);
    assert!(audit.contains("\"kind\":\"circuit-open\""), "audit: {audit}");
}

#[tokio::test]
async fn sandbox_timeout_is_enforced() {
    let h = harness("");
    h.server.start().await;

    let started = Instant::now();
    let response = h
        .server
        .execute(execute_request("sleep 30", &[], 1_000))
        .await;

    assert_eq!(response.status, "timed-out");
    assert!(response.execution_time_ms >= 1_000);
    assert!(
        started.elapsed() < Duration::from_secs(4),
        "kill must land within the grace window"
    );
    assert_eq!(response.tool_call_summary.total, 0);
    assert_eq!(response.error.unwrap().kind, "sandbox-timeout");
}

#[tokio::test]
async fn wrong_bearer_token_is_401_and_audited() {
    let h = harness("");
    h.server.start().await;
    let creds = h.state_path.join("creds.txt");

    let execution = spawn_bridge_execution(h.server.clone(), &creds, &["srv-1.*"]);
    let (url, token) = wait_for_creds(&creds).await;

    let client = reqwest::Client::new();
    let resp = client
        .post(format!("{url}/tool-call"))
        .header("Authorization", "Bearer wrong")
        .json(&serde_json::json!({
            "toolName": "srv-1.tool-A", "args": {"x": 1}, "requestId": "r1"
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 401);
    assert!(resp.text().await.unwrap().is_empty());

    // The execution's own calls with the real token keep working.
    let body =
        bridge_tool_call(&url, &token, "srv-1.tool-A", serde_json::json!({"x": 1}), "r2").await;
    assert_eq!(body["result"]["v"], 42, "body: {body}");

    let _ = execution.await.unwrap();
    let audit = audit_contents(&h.state_path);
    assert!(audit.contains("\"kind\":\"auth-failure\""), "audit: {audit}");
}

#[tokio::test]
async fn duplicate_request_ids_share_one_downstream_dispatch() {
    let h = harness("");
    h.server.start().await;
    let creds = h.state_path.join("creds.txt");

    let execution = spawn_bridge_execution(h.server.clone(), &creds, &["srv-1.*"]);
    let (url, token) = wait_for_creds(&creds).await;

    let a = bridge_tool_call(&url, &token, "srv-1.tool-A", serde_json::json!({"x": 1}), "dup")
        .await;
    let b = bridge_tool_call(&url, &token, "srv-1.tool-A", serde_json::json!({"x": 1}), "dup")
        .await;
    assert_eq!(a["result"], b["result"]);

    let response = execution.await.unwrap();
    // Both bridge round-trips succeeded, so the session counted two, but
    // downstream saw a single dispatch (covered by dispatcher unit tests);
    // here we assert the duplicate got a real answer.
    assert_eq!(response.status, "succeeded");
}

#[tokio::test]
async fn tool_not_permitted_outside_allowlist() {
    let h = harness("");
    h.server.start().await;
    let creds = h.state_path.join("creds.txt");

    let execution = spawn_bridge_execution(h.server.clone(), &creds, &["srv-2.*"]);
    let (url, token) = wait_for_creds(&creds).await;

    let body =
        bridge_tool_call(&url, &token, "srv-1.tool-A", serde_json::json!({"x": 1}), "r1").await;
    assert_eq!(body["error"]["code"], "tool-not-permitted", "body: {body}");

    let _ = execution.await.unwrap();
}

#[tokio::test]
async fn http_front_end_serves_execute_and_metrics() {
    let h = harness("");
    h.server.start().await;

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let serve_server = h.server.clone();
    tokio::spawn(async move {
        let _ = toolgate_server::frontend::serve_http_listener(serve_server, listener).await;
    });

    let client = reqwest::Client::new();
    let response: Value = client
        .post(format!("http://{addr}/execute"))
        .json(&serde_json::json!({
            "language": "script",
            "code": "echo over-http",
            "allowedTools": [],
            "timeoutMs": 5000
        }))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(response["status"], "succeeded", "response: {response}");
    assert_eq!(response["stdout"], "over-http\n");

    let metrics = client
        .get(format!("http://{addr}/metrics"))
        .send()
        .await
        .unwrap()
        .text()
        .await
        .unwrap();
    assert!(metrics.contains("toolgate_executions_total"), "metrics: {metrics}");

    let health: Value = client
        .get(format!("http://{addr}/healthz"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(health["draining"], false);
    assert!(health["servers"].get("srv-1").is_some());
}

#[tokio::test]
async fn shutdown_drains_and_persists_schema_cache() {
    let h = harness("");
    h.server.start().await;

    // Prime the schema cache through one bridge call.
    let creds = h.state_path.join("creds.txt");
    let execution = spawn_bridge_execution(h.server.clone(), &creds, &["srv-1.*"]);
    let (url, token) = wait_for_creds(&creds).await;
    let _ =
        bridge_tool_call(&url, &token, "srv-1.tool-A", serde_json::json!({"x": 1}), "r1").await;
    let _ = execution.await.unwrap();

    let started = Instant::now();
    h.server.shutdown().await;
    assert!(
        started.elapsed() < Duration::from_secs(10),
        "shutdown must respect its ceiling"
    );

    assert!(
        h.state_path.join("schema-cache.json").exists(),
        "schema cache must be persisted on shutdown"
    );
    let audit = audit_contents(&h.state_path);
    assert!(audit.contains("\"kind\":\"shutdown\""), "audit: {audit}");

    // Intake is refused while drained.
    let response = h.server.execute(execute_request("echo hi", &[], 5_000)).await;
    assert_eq!(response.error.unwrap().kind, "shutdown");
}
