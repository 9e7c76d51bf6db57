//! Per-item outcomes and live progress

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A cited source
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Source {
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_title")]
    pub title: String,
    #[serde(default)]
    pub snippet: String,
    /// `high`, `medium` or `low`
    #[serde(default = "default_reliability")]
    pub reliability: String,
}

fn default_title() -> String {
    "Unknown".to_string()
}

fn default_reliability() -> String {
    "medium".to_string()
}

/// The findings for one completed plan item
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentResult {
    pub agent_id: String,
    pub plan_item_id: String,
    pub topic: String,
    pub findings: String,
    #[serde(default)]
    pub sources: Vec<Source>,
    /// Always within [0, 1]
    pub confidence: f64,
    #[serde(default)]
    pub raw_notes: String,
    #[serde(with = "duration_millis")]
    pub execution_time: Duration,
}

/// Status of a unit of work as seen by observers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    #[default]
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

/// Latest known progress of one unit of work.
///
/// Overwritten in place as progress arrives; only the latest value is kept.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentProgress {
    pub agent_id: String,
    pub plan_item_id: String,
    pub topic: String,
    pub status: AgentStatus,
    /// Human-readable description of what the agent is doing
    #[serde(default)]
    pub current_action: String,
    /// Last tool the agent invoked
    #[serde(default)]
    pub last_tool: Option<String>,
    #[serde(default)]
    pub progress_percent: f64,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
}

impl AgentProgress {
    /// Progress for a unit that has just started running
    pub fn running(plan_item_id: &str, topic: &str) -> Self {
        Self {
            agent_id: agent_id_for(plan_item_id),
            plan_item_id: plan_item_id.to_string(),
            topic: topic.to_string(),
            status: AgentStatus::Running,
            current_action: String::new(),
            last_tool: None,
            progress_percent: 0.0,
            started_at: Some(Utc::now()),
            completed_at: None,
            error: None,
        }
    }

    /// Record an intermediate action, nudging the estimate forward (capped at 90%)
    pub fn advance(&mut self, action: &str, tool: Option<&str>) {
        self.current_action = truncate_chars(action, 100);
        if let Some(tool) = tool {
            self.last_tool = Some(tool.to_string());
        }
        self.progress_percent = (self.progress_percent + 5.0).min(90.0);
    }

    /// Move to a terminal status
    pub fn finish(&mut self, status: AgentStatus, error: Option<String>) {
        self.status = status;
        self.error = error;
        self.completed_at = Some(Utc::now());
        if status == AgentStatus::Completed {
            self.progress_percent = 100.0;
        }
    }
}

/// The agent id used for a plan item's researcher
pub fn agent_id_for(plan_item_id: &str) -> String {
    format!("researcher-{}", plan_item_id)
}

pub(crate) fn truncate_chars(text: &str, max: usize) -> String {
    text.chars().take(max).collect()
}

/// Serialize Duration as milliseconds
pub(crate) mod duration_millis {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        (duration.as_millis() as u64).serialize(serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}
