//! Progress events for real-time observation
//!
//! Events are emitted by the orchestrator while a session runs and routed to
//! observers by the [`EventBus`]. They are never persisted.

mod bus;

pub use bus::{CallbackSubscription, EventBus, EventCallback, Filter, Subscription};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::model::{AgentProgress, AgentResult, Phase, Plan};

// ============================================================================
// Events
// ============================================================================

/// One observable occurrence within a session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub session_id: String,
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub payload: EventPayload,
}

/// Kind-specific event data
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event_type", rename_all = "snake_case")]
pub enum EventPayload {
    PhaseChange {
        old_phase: Option<Phase>,
        new_phase: Phase,
    },

    /// A plan is ready for review
    PlanDraft { plan: Plan },

    /// Review edits were applied
    PlanUpdated { plan: Plan },

    AgentStarted {
        agent_id: String,
        plan_item_id: String,
        topic: String,
    },

    AgentProgress { progress: AgentProgress },

    AgentCompleted { result: AgentResult },

    AgentFailed {
        agent_id: String,
        plan_item_id: String,
        /// `UNIT_TIMEOUT` or `UNIT_EXECUTION_ERROR`
        code: String,
        error: String,
    },

    SynthesisStarted { total_results: usize },

    SynthesisProgress {
        progress_percent: f64,
        current_action: String,
    },

    ReportReady {
        /// First 500 characters of the report
        report_preview: String,
    },

    CheckpointSaved {
        phase: Phase,
        completed_items: usize,
        pending_items: usize,
    },

    Error {
        error_code: String,
        error_message: String,
        recoverable: bool,
    },

    SessionCancelled { reason: String },
}

/// Discriminant of [`EventPayload`], used for subscription filters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    PhaseChange,
    PlanDraft,
    PlanUpdated,
    AgentStarted,
    AgentProgress,
    AgentCompleted,
    AgentFailed,
    SynthesisStarted,
    SynthesisProgress,
    ReportReady,
    CheckpointSaved,
    Error,
    SessionCancelled,
}

impl EventKind {
    pub fn as_str(self) -> &'static str {
        match self {
            EventKind::PhaseChange => "phase_change",
            EventKind::PlanDraft => "plan_draft",
            EventKind::PlanUpdated => "plan_updated",
            EventKind::AgentStarted => "agent_started",
            EventKind::AgentProgress => "agent_progress",
            EventKind::AgentCompleted => "agent_completed",
            EventKind::AgentFailed => "agent_failed",
            EventKind::SynthesisStarted => "synthesis_started",
            EventKind::SynthesisProgress => "synthesis_progress",
            EventKind::ReportReady => "report_ready",
            EventKind::CheckpointSaved => "checkpoint_saved",
            EventKind::Error => "error",
            EventKind::SessionCancelled => "session_cancelled",
        }
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl EventPayload {
    pub fn kind(&self) -> EventKind {
        match self {
            EventPayload::PhaseChange { .. } => EventKind::PhaseChange,
            EventPayload::PlanDraft { .. } => EventKind::PlanDraft,
            EventPayload::PlanUpdated { .. } => EventKind::PlanUpdated,
            EventPayload::AgentStarted { .. } => EventKind::AgentStarted,
            EventPayload::AgentProgress { .. } => EventKind::AgentProgress,
            EventPayload::AgentCompleted { .. } => EventKind::AgentCompleted,
            EventPayload::AgentFailed { .. } => EventKind::AgentFailed,
            EventPayload::SynthesisStarted { .. } => EventKind::SynthesisStarted,
            EventPayload::SynthesisProgress { .. } => EventKind::SynthesisProgress,
            EventPayload::ReportReady { .. } => EventKind::ReportReady,
            EventPayload::CheckpointSaved { .. } => EventKind::CheckpointSaved,
            EventPayload::Error { .. } => EventKind::Error,
            EventPayload::SessionCancelled { .. } => EventKind::SessionCancelled,
        }
    }
}

impl Event {
    /// Stamp a payload with the current time
    pub fn new(session_id: impl Into<String>, payload: EventPayload) -> Self {
        Self {
            session_id: session_id.into(),
            timestamp: Utc::now(),
            payload,
        }
    }

    pub fn kind(&self) -> EventKind {
        self.payload.kind()
    }

    /// Render as a server-sent event frame
    pub fn to_sse(&self) -> String {
        let data = serde_json::to_string(self).unwrap_or_else(|_| "{}".to_string());
        format!("event: {}\ndata: {}\n\n", self.kind(), data)
    }
}
