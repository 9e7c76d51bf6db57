//! Backends against real transports: a shell process and a mock HTTP server

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use wiremock::matchers::{body_partial_json, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use deep_research::config::{Dialect, HttpConfig, PromptDelivery, SubprocessConfig};
use deep_research::gateway::{AgentExecutor, HttpBackend, StreamMessage, SubprocessBackend};

// ============================================================================
// Subprocess
// ============================================================================

/// Runs `script` with `sh -c`; an argument-delivered prompt arrives as `$1`
fn shell(dialect: Dialect, script: &str, delivery: PromptDelivery) -> SubprocessConfig {
    SubprocessConfig {
        dialect,
        command: "sh".to_string(),
        args: vec!["-c".to_string(), script.to_string(), "sh".to_string()],
        env: HashMap::new(),
        prompt_delivery: delivery,
        model_flag: None,
        system_prompt_flag: None,
        prompt_separator: false,
        working_dir: None,
        models: HashMap::new(),
    }
}

fn executor(config: SubprocessConfig, timeout: Duration) -> AgentExecutor {
    AgentExecutor::new(Arc::new(SubprocessBackend::new("shell", config)), "", Some(timeout))
}

const CLAUDE_SCRIPT: &str = r#"
printf '%s\n' '{"type":"system","subtype":"init"}'
printf '%s\n' '{"type":"assistant","message":{"content":[{"type":"text","text":"Searching"},{"type":"tool_use","name":"WebSearch","input":{"query":"q"}}]}}'
echo 'this line is not json'
printf '{"type":"result","subtype":"success","result":"echo: %s"}\n' "$1"
"#;

#[tokio::test]
async fn test_subprocess_claude_stream() {
    let executor = executor(
        shell(Dialect::ClaudeCli, CLAUDE_SCRIPT, PromptDelivery::Argument),
        Duration::from_secs(10),
    );

    let result = executor.execute("ping", None, None).await;

    assert!(result.success, "{:?}", result.error);
    assert_eq!(result.content, "echo: ping");
    assert_eq!(result.malformed_records, 1);
    assert!(result
        .messages
        .iter()
        .any(|m| matches!(m, StreamMessage::ToolCall { name, .. } if name == "WebSearch")));
    assert!(matches!(&result.messages[0], StreamMessage::AssistantText { text } if text == "Searching"));
}

#[tokio::test]
async fn test_subprocess_system_prompt_merged_without_flag() {
    let script = r#"printf '{"type":"result","result":"%s"}\n' "$(printf '%s' "$1" | head -n 1)""#;
    let executor = executor(
        shell(Dialect::ClaudeCli, script, PromptDelivery::Argument),
        Duration::from_secs(10),
    );

    let result = executor.execute("question", Some("You are terse."), None).await;

    assert!(result.success, "{:?}", result.error);
    assert_eq!(result.content, "You are terse.");
}

#[tokio::test]
async fn test_subprocess_stdin_delivery() {
    let script = r#"read -r line; printf '{"type":"result","result":"got %s"}\n' "$line""#;
    let executor = executor(
        shell(Dialect::ClaudeCli, script, PromptDelivery::Stdin),
        Duration::from_secs(10),
    );

    let result = executor.execute("via-stdin", None, None).await;

    assert!(result.success, "{:?}", result.error);
    assert_eq!(result.content, "got via-stdin");
}

#[tokio::test]
async fn test_subprocess_codex_stream() {
    let script = r#"
printf '%s\n' '{"type":"item.started","item":{"type":"command_execution","command":"curl example.com"}}'
printf '%s\n' '{"type":"item.completed","item":{"type":"command_execution","command":"curl example.com","exit_code":0,"aggregated_output":"<html>"}}'
printf '%s\n' '{"type":"item.completed","item":{"type":"agent_message","text":"codex answer"}}'
"#;
    let executor = executor(
        shell(Dialect::CodexCli, script, PromptDelivery::Argument),
        Duration::from_secs(10),
    );

    let result = executor.execute("ping", None, None).await;

    assert!(result.success, "{:?}", result.error);
    assert!(result.content.contains("codex answer"));
    assert!(result
        .messages
        .iter()
        .any(|m| matches!(m, StreamMessage::ToolResult { is_error: false, .. })));
}

#[tokio::test]
async fn test_subprocess_nonzero_exit_fails() {
    let executor = executor(
        shell(Dialect::ClaudeCli, "echo 'rate limited' >&2; exit 3", PromptDelivery::Argument),
        Duration::from_secs(10),
    );

    let result = executor.execute("ping", None, None).await;

    assert!(!result.success);
    let error = result.error.unwrap();
    assert!(error.contains("rate limited"), "{}", error);
    assert!(error.contains('3'), "{}", error);
}

#[tokio::test]
async fn test_subprocess_timeout_discards_partial_output() {
    let script = r#"
printf '%s\n' '{"type":"assistant","message":{"content":[{"type":"text","text":"partial"}]}}'
sleep 5
"#;
    let executor = executor(
        shell(Dialect::ClaudeCli, script, PromptDelivery::Argument),
        Duration::from_millis(300),
    );

    let result = executor.execute("ping", None, None).await;

    assert!(!result.success);
    assert!(result.is_timeout());
    assert!(result.content.is_empty());
    assert!(result.duration < Duration::from_secs(5));
}

#[tokio::test]
async fn test_subprocess_missing_command_is_unavailable() {
    let mut config = shell(Dialect::ClaudeCli, "", PromptDelivery::Argument);
    config.command = "definitely-not-an-agent-cli".to_string();
    let executor = executor(config, Duration::from_secs(10));

    let result = executor.execute("ping", None, None).await;

    assert!(!result.success);
    assert!(result.error.unwrap().contains("not found"));
}

// ============================================================================
// HTTP
// ============================================================================

fn sse(events: &[serde_json::Value]) -> String {
    events
        .iter()
        .map(|event| format!("data: {}\n\n", event))
        .collect()
}

fn http_executor(server: &MockServer, model: &str) -> AgentExecutor {
    let backend = HttpBackend::new(
        "opencode",
        HttpConfig {
            base_url: server.uri(),
            default_provider_id: "opencode".to_string(),
            models: HashMap::new(),
        },
    );
    AgentExecutor::new(Arc::new(backend), model, Some(Duration::from_secs(10)))
}

async fn mount_session(server: &MockServer, events: &[serde_json::Value]) {
    Mock::given(method("POST"))
        .and(path("/session"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"id": "ses_1"})))
        .expect(1)
        .mount(server)
        .await;
    Mock::given(method("GET"))
        .and(path("/event"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("content-type", "text/event-stream")
                .set_body_string(sse(events)),
        )
        .mount(server)
        .await;
}

#[tokio::test]
async fn test_http_backend_streams_until_idle() {
    let server = MockServer::start().await;
    mount_session(
        &server,
        &[
            json!({"type": "server.connected", "properties": {}}),
            json!({"type": "message.part.updated", "properties": {
                "part": {"sessionID": "ses_1", "type": "tool", "tool": "webfetch", "state": {"input": {"url": "https://example.com"}}}
            }}),
            json!({"type": "message.part.updated", "properties": {
                "part": {"sessionID": "ses_other", "type": "text", "text": "someone else"}
            }}),
            json!({"type": "message.part.updated", "properties": {
                "part": {"sessionID": "ses_1", "type": "text", "text": "Hello"}, "delta": "Hello"
            }}),
            json!({"type": "message.updated", "properties": {
                "info": {"sessionID": "ses_1", "parts": [{"type": "text", "text": "Hello world"}]}
            }}),
            json!({"type": "session.idle", "properties": {"sessionID": "ses_1"}}),
        ],
    )
    .await;
    Mock::given(method("POST"))
        .and(path("/session/ses_1/prompt_async"))
        .and(body_partial_json(json!({
            "model": {"providerID": "anthropic", "modelID": "claude-sonnet"},
            "system": "Be brief.",
        })))
        .respond_with(ResponseTemplate::new(204))
        .expect(1)
        .mount(&server)
        .await;

    let executor = http_executor(&server, "anthropic/claude-sonnet");
    let result = executor.execute("hi", Some("Be brief."), None).await;

    assert!(result.success, "{:?}", result.error);
    assert_eq!(result.content, "Hello world");
    assert!(result
        .messages
        .iter()
        .any(|m| matches!(m, StreamMessage::ToolCall { name, .. } if name == "webfetch")));
    assert!(!result
        .messages
        .iter()
        .any(|m| matches!(m, StreamMessage::AssistantText { text } if text == "someone else")));
}

#[tokio::test]
async fn test_http_backend_reports_session_error() {
    let server = MockServer::start().await;
    mount_session(
        &server,
        &[json!({"type": "session.error", "properties": {
            "sessionID": "ses_1", "error": {"data": {"message": "model not found"}}
        }})],
    )
    .await;
    Mock::given(method("POST"))
        .and(path("/session/ses_1/prompt_async"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;

    let result = http_executor(&server, "claude-sonnet").execute("hi", None, None).await;

    assert!(!result.success);
    assert_eq!(result.error.as_deref(), Some("model not found"));
}

#[tokio::test]
async fn test_http_backend_stream_ending_early_fails() {
    let server = MockServer::start().await;
    mount_session(
        &server,
        &[json!({"type": "message.part.updated", "properties": {
            "part": {"sessionID": "ses_1", "type": "text", "text": "partial"}
        }})],
    )
    .await;
    Mock::given(method("POST"))
        .and(path("/session/ses_1/prompt_async"))
        .respond_with(ResponseTemplate::new(204))
        .mount(&server)
        .await;

    let result = http_executor(&server, "claude-sonnet").execute("hi", None, None).await;

    assert!(!result.success);
    assert!(result.error.unwrap().contains("idle"));
}

#[tokio::test]
async fn test_http_backend_rejected_prompt() {
    let server = MockServer::start().await;
    mount_session(&server, &[]).await;
    Mock::given(method("POST"))
        .and(path("/session/ses_1/prompt_async"))
        .respond_with(ResponseTemplate::new(400).set_body_string("unknown model"))
        .mount(&server)
        .await;

    let result = http_executor(&server, "claude-sonnet").execute("hi", None, None).await;

    assert!(!result.success);
    let error = result.error.unwrap();
    assert!(error.contains("400"), "{}", error);
    assert!(error.contains("unknown model"), "{}", error);
}

#[tokio::test]
async fn test_http_backend_unreachable_server() {
    let executor = AgentExecutor::new(
        Arc::new(HttpBackend::new(
            "opencode",
            HttpConfig {
                base_url: "http://127.0.0.1:1".to_string(),
                default_provider_id: "opencode".to_string(),
                models: HashMap::new(),
            },
        )),
        "claude-sonnet",
        Some(Duration::from_secs(10)),
    );

    let result = executor.execute("hi", None, None).await;

    assert!(!result.success);
    assert!(result.error.unwrap().contains("cannot reach"));
}

#[tokio::test]
async fn test_http_backend_refuses_calls_after_close() {
    let server = MockServer::start().await;
    mount_session(
        &server,
        &[
            json!({"type": "message.updated", "properties": {
                "info": {"sessionID": "ses_1", "parts": [{"type": "text", "text": "first"}]}
            }}),
            json!({"type": "session.idle", "properties": {"sessionID": "ses_1"}}),
        ],
    )
    .await;
    Mock::given(method("POST"))
        .and(path("/session/ses_1/prompt_async"))
        .respond_with(ResponseTemplate::new(204))
        .expect(1)
        .mount(&server)
        .await;

    let executor = http_executor(&server, "claude-sonnet");
    let result = executor.execute("hi", None, None).await;
    assert!(result.success, "{:?}", result.error);
    assert_eq!(result.content, "first");

    executor.close().await;
    executor.close().await;

    let result = executor.execute("again", None, None).await;
    assert!(!result.success);
    let error = result.error.unwrap();
    assert!(error.contains("closed"), "{}", error);
}
