//! Gateway message and result types

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::model::{duration_millis, truncate_chars};

// ============================================================================
// Stream Messages
// ============================================================================

/// A typed message produced by an agent backend, independent of its wire format
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum StreamMessage {
    /// Text written by the agent
    AssistantText { text: String },

    /// The agent invoked a tool
    ToolCall {
        name: String,
        input: serde_json::Value,
    },

    /// Output of a tool invocation
    ToolResult { content: String, is_error: bool },

    /// Reasoning content
    Thinking { text: String },

    /// The backend reported a failure
    Error { message: String },

    /// The final answer
    Result { text: String },
}

impl StreamMessage {
    pub fn assistant(text: impl Into<String>) -> Self {
        StreamMessage::AssistantText { text: text.into() }
    }

    pub fn error(message: impl Into<String>) -> Self {
        StreamMessage::Error {
            message: message.into(),
        }
    }

    pub fn result(text: impl Into<String>) -> Self {
        StreamMessage::Result { text: text.into() }
    }

    /// Short human-readable description suitable for progress displays.
    ///
    /// Returns `None` for messages that are not progress-worthy, including
    /// assistant text that looks like a JSON payload.
    pub fn describe(&self) -> Option<String> {
        match self {
            StreamMessage::ToolCall { name, input } => Some(describe_tool(name, input)),
            StreamMessage::AssistantText { text } => {
                let trimmed = text.trim();
                if trimmed.is_empty() || trimmed.starts_with('{') || trimmed.starts_with('[') {
                    None
                } else {
                    Some(truncate_chars(trimmed, 100))
                }
            }
            StreamMessage::Thinking { .. } => Some("Thinking...".to_string()),
            _ => None,
        }
    }

    /// Tool name for tool calls
    pub fn tool_name(&self) -> Option<&str> {
        match self {
            StreamMessage::ToolCall { name, .. } => Some(name),
            _ => None,
        }
    }
}

fn describe_tool(name: &str, input: &serde_json::Value) -> String {
    let field = |key: &str| input.get(key).and_then(|v| v.as_str()).unwrap_or("");
    let shorten = |text: &str| {
        if text.chars().count() > 50 {
            format!("{}...", truncate_chars(text, 50))
        } else {
            text.to_string()
        }
    };

    let lower = name.to_lowercase();
    if lower.contains("websearch") {
        format!("Searching: {}", shorten(field("query")))
    } else if lower.contains("webfetch") {
        format!("Fetching: {}", shorten(field("url")))
    } else if name == "command_execution" {
        format!("Running: {}", shorten(field("command")))
    } else {
        format!("Using {}...", name)
    }
}

// ============================================================================
// Calls and Results
// ============================================================================

/// One prompt submitted to a backend
#[derive(Debug, Clone)]
pub struct Call {
    pub prompt: String,
    pub system_prompt: Option<String>,
    /// Backend-specific model id
    pub model: String,
}

impl Call {
    /// System prompt and prompt merged, for backends without a separate channel
    pub fn merged_prompt(&self) -> String {
        match self.system_prompt.as_deref() {
            Some(system) if !system.trim().is_empty() => {
                format!("{}\n\n{}", system.trim(), self.prompt)
            }
            _ => self.prompt.clone(),
        }
    }
}

/// Aggregated outcome of a call
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub success: bool,
    pub content: String,
    pub messages: Vec<StreamMessage>,
    pub error: Option<String>,
    #[serde(with = "duration_millis")]
    pub duration: Duration,
    /// Records the backend could not decode
    #[serde(default)]
    pub malformed_records: u64,
}

impl ExecutionResult {
    pub fn is_timeout(&self) -> bool {
        self.error.as_deref() == Some(TIMEOUT)
    }

    pub fn is_cancelled(&self) -> bool {
        self.error.as_deref() == Some(CANCELLED)
    }
}

/// Error string of a call that exceeded its timeout
pub const TIMEOUT: &str = "timeout";

/// Error string of a cancelled call
pub const CANCELLED: &str = "cancelled";

// ============================================================================
// Errors
// ============================================================================

/// Normalized backend failures
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("timeout")]
    Timeout,

    #[error("cancelled")]
    Cancelled,

    #[error("Provider unavailable: {0}")]
    Unavailable(String),

    #[error("Process exited with code {code:?}: {stderr}")]
    Process { code: Option<i32>, stderr: String },

    #[error("HTTP {status}: {body}")]
    Http { status: u16, body: String },

    #[error("{0}")]
    Provider(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Request failed: {0}")]
    Request(#[from] reqwest::Error),
}

// ============================================================================
// Message Sink
// ============================================================================

/// Where a backend delivers decoded messages
#[derive(Clone)]
pub struct MessageSink {
    tx: mpsc::Sender<StreamMessage>,
    malformed: Arc<AtomicU64>,
}

impl MessageSink {
    pub fn new(tx: mpsc::Sender<StreamMessage>) -> Self {
        Self {
            tx,
            malformed: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Deliver a message; returns false once the consumer is gone
    pub async fn send(&self, message: StreamMessage) -> bool {
        self.tx.send(message).await.is_ok()
    }

    /// Count a record that could not be decoded
    pub fn record_malformed(&self) {
        self.malformed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn malformed_count(&self) -> u64 {
        self.malformed.load(Ordering::Relaxed)
    }

    pub(crate) fn malformed_counter(&self) -> Arc<AtomicU64> {
        self.malformed.clone()
    }
}
