//! Provider wire formats mapped onto [`StreamMessage`]
//!
//! Each function turns one decoded record into zero or more messages.
//! Record types a dialect does not know are ignored, not counted as
//! malformed.

use serde_json::Value;

use super::types::StreamMessage;
use crate::config::Dialect;

impl Dialect {
    /// Decode one JSON record from a subprocess backend
    pub fn decode(&self, record: &Value) -> Vec<StreamMessage> {
        match self {
            Dialect::ClaudeCli => decode_claude(record),
            Dialect::CodexCli => decode_codex(record),
        }
    }
}

fn str_field<'a>(value: &'a Value, key: &str) -> &'a str {
    value.get(key).and_then(Value::as_str).unwrap_or("")
}

/// Extract a message from `{"error": {"message": ...}}`, `{"error": "..."}`
/// or `{"message": ...}` shapes
fn error_message(value: &Value) -> String {
    match value.get("error") {
        Some(Value::Object(obj)) => obj
            .get("message")
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| Value::Object(obj.clone()).to_string()),
        Some(Value::String(message)) => message.clone(),
        _ => value
            .get("message")
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| value.to_string()),
    }
}

// ============================================================================
// Claude CLI (stream-json)
// ============================================================================

fn decode_claude(record: &Value) -> Vec<StreamMessage> {
    match str_field(record, "type") {
        "assistant" => content_blocks(record)
            .iter()
            .filter_map(|block| match str_field(block, "type") {
                "text" => Some(StreamMessage::assistant(str_field(block, "text"))),
                "thinking" => Some(StreamMessage::Thinking {
                    text: str_field(block, "thinking").to_string(),
                }),
                "tool_use" => Some(StreamMessage::ToolCall {
                    name: str_field(block, "name").to_string(),
                    input: block.get("input").cloned().unwrap_or(Value::Null),
                }),
                _ => None,
            })
            .collect(),

        "user" => content_blocks(record)
            .iter()
            .filter(|block| str_field(block, "type") == "tool_result")
            .map(|block| StreamMessage::ToolResult {
                content: tool_result_text(block.get("content")),
                is_error: block
                    .get("is_error")
                    .and_then(Value::as_bool)
                    .unwrap_or(false),
            })
            .collect(),

        "content_block_delta" => {
            let delta = record.get("delta").unwrap_or(&Value::Null);
            match str_field(delta, "type") {
                "text_delta" => vec![StreamMessage::assistant(str_field(delta, "text"))],
                "thinking_delta" => vec![StreamMessage::Thinking {
                    text: str_field(delta, "thinking").to_string(),
                }],
                _ => Vec::new(),
            }
        }

        "result" => {
            let text = match record.get("result") {
                Some(Value::String(text)) => text.clone(),
                Some(other) => other.to_string(),
                None => String::new(),
            };
            if record.get("is_error").and_then(Value::as_bool) == Some(true) {
                let message = if text.is_empty() {
                    format!("agent returned {}", str_field(record, "subtype"))
                } else {
                    text
                };
                vec![StreamMessage::error(message)]
            } else {
                vec![StreamMessage::result(text)]
            }
        }

        "error" => vec![StreamMessage::error(error_message(record))],

        _ => Vec::new(),
    }
}

fn content_blocks(record: &Value) -> &[Value] {
    record
        .get("message")
        .and_then(|m| m.get("content"))
        .and_then(Value::as_array)
        .map(Vec::as_slice)
        .unwrap_or(&[])
}

fn tool_result_text(content: Option<&Value>) -> String {
    match content {
        Some(Value::String(text)) => text.clone(),
        Some(Value::Array(parts)) => parts
            .iter()
            .filter_map(|part| part.get("text").and_then(Value::as_str))
            .collect::<Vec<_>>()
            .join("\n"),
        Some(other) => other.to_string(),
        None => String::new(),
    }
}

// ============================================================================
// Codex CLI (JSONL)
// ============================================================================

fn decode_codex(record: &Value) -> Vec<StreamMessage> {
    let event_type = str_field(record, "type");
    match event_type {
        "item.started" | "item.completed" => {
            let completed = event_type == "item.completed";
            let item = record.get("item").unwrap_or(&Value::Null);
            match str_field(item, "type") {
                "agent_message" if completed => {
                    vec![StreamMessage::assistant(str_field(item, "text"))]
                }
                "reasoning" if completed => vec![StreamMessage::Thinking {
                    text: str_field(item, "text").to_string(),
                }],
                "command_execution" if !completed => vec![StreamMessage::ToolCall {
                    name: "command_execution".to_string(),
                    input: serde_json::json!({ "command": str_field(item, "command") }),
                }],
                "command_execution" => {
                    let exit_code = item.get("exit_code").and_then(Value::as_i64);
                    vec![StreamMessage::ToolResult {
                        content: str_field(item, "aggregated_output").to_string(),
                        is_error: matches!(exit_code, Some(code) if code != 0),
                    }]
                }
                "error" => vec![StreamMessage::error(error_message(item))],
                _ => Vec::new(),
            }
        }
        "turn.failed" | "error" => vec![StreamMessage::error(error_message(record))],
        _ => Vec::new(),
    }
}

// ============================================================================
// OpenCode server events
// ============================================================================

/// What one server event means for the call in progress
#[derive(Debug, Clone, PartialEq)]
pub enum OpencodeSignal {
    /// Forward to the consumer
    Message(StreamMessage),
    /// A finalized text part of the answer
    FinalText(String),
    /// The remote session finished its turn
    Idle,
    /// The remote session failed
    Failed(String),
}

/// Decode one server event for `session_id`.
///
/// Payload fields are read from `properties` when present. Events that
/// name a different session are ignored.
pub fn decode_opencode(event: &Value, session_id: &str) -> Vec<OpencodeSignal> {
    let props = event.get("properties").unwrap_or(event);

    let event_session = props
        .get("sessionID")
        .or_else(|| props.get("info").and_then(|i| i.get("sessionID")))
        .or_else(|| props.get("part").and_then(|p| p.get("sessionID")))
        .and_then(Value::as_str);
    if matches!(event_session, Some(id) if id != session_id) {
        return Vec::new();
    }

    match str_field(event, "type") {
        "message.part.updated" => {
            let part = props.get("part").unwrap_or(&Value::Null);
            match str_field(part, "type") {
                "tool" | "tool-invocation" => vec![OpencodeSignal::Message(tool_call(part))],
                "reasoning" => vec![OpencodeSignal::Message(StreamMessage::Thinking {
                    text: str_field(part, "text").to_string(),
                })],
                _ => {
                    let delta = str_field(props, "delta");
                    let text = if delta.is_empty() {
                        part.get("text")
                            .or_else(|| part.get("content"))
                            .and_then(Value::as_str)
                            .unwrap_or("")
                    } else {
                        delta
                    };
                    if text.is_empty() {
                        Vec::new()
                    } else {
                        vec![OpencodeSignal::Message(StreamMessage::assistant(text))]
                    }
                }
            }
        }

        "message.updated" => props
            .get("info")
            .and_then(|info| info.get("parts"))
            .and_then(Value::as_array)
            .map(|parts| {
                parts
                    .iter()
                    .filter_map(|part| match str_field(part, "type") {
                        "text" => {
                            let text = str_field(part, "text");
                            (!text.is_empty()).then(|| OpencodeSignal::FinalText(text.to_string()))
                        }
                        "tool" | "tool-invocation" => Some(OpencodeSignal::Message(tool_call(part))),
                        _ => None,
                    })
                    .collect()
            })
            .unwrap_or_default(),

        "session.idle" => vec![OpencodeSignal::Idle],

        "session.status" => {
            let status = match props.get("status") {
                Some(Value::String(status)) => status.as_str(),
                Some(obj) => str_field(obj, "type"),
                None => "",
            };
            if matches!(status, "idle" | "completed") {
                vec![OpencodeSignal::Idle]
            } else {
                Vec::new()
            }
        }

        "session.error" => {
            let message = match props.get("error") {
                Some(Value::Object(obj)) => obj
                    .get("message")
                    .or_else(|| obj.get("data").and_then(|d| d.get("message")))
                    .and_then(Value::as_str)
                    .map(str::to_string)
                    .unwrap_or_else(|| Value::Object(obj.clone()).to_string()),
                Some(Value::String(message)) => message.clone(),
                _ => event.to_string(),
            };
            vec![OpencodeSignal::Failed(message)]
        }

        _ => Vec::new(),
    }
}

fn tool_call(part: &Value) -> StreamMessage {
    let name = ["tool", "tool_name", "name"]
        .iter()
        .find_map(|key| part.get(*key).and_then(Value::as_str))
        .unwrap_or("tool");
    let input = part
        .get("state")
        .and_then(|s| s.get("input"))
        .or_else(|| part.get("input"))
        .or_else(|| part.get("tool_input"))
        .cloned()
        .unwrap_or(Value::Null);
    StreamMessage::ToolCall {
        name: name.to_string(),
        input,
    }
}
