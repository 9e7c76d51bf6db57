//! Research sessions and the phase state machine

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::checkpoint::Checkpoint;
use super::plan::{Plan, PlanItemStatus};
use super::result::{AgentProgress, AgentResult};

// ============================================================================
// Phase
// ============================================================================

/// One stage of the session state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Planning,
    PlanReview,
    Researching,
    Synthesizing,
    Completed,
    Failed,
    Cancelled,
}

impl Phase {
    pub fn is_terminal(self) -> bool {
        matches!(self, Phase::Completed | Phase::Failed | Phase::Cancelled)
    }

    /// Position in the forward workflow; terminal phases share the last slot
    pub fn order(self) -> u8 {
        match self {
            Phase::Planning => 0,
            Phase::PlanReview => 1,
            Phase::Researching => 2,
            Phase::Synthesizing => 3,
            Phase::Completed | Phase::Failed | Phase::Cancelled => 4,
        }
    }

    /// Whether the state machine allows moving from `self` to `next`
    pub fn can_transition_to(self, next: Phase) -> bool {
        use Phase::*;
        match (self, next) {
            (Planning, PlanReview)
            | (PlanReview, Planning)
            | (PlanReview, Researching)
            | (Researching, Synthesizing)
            | (Synthesizing, Completed) => true,
            (from, Failed | Cancelled) => !from.is_terminal(),
            _ => false,
        }
    }
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Phase::Planning => write!(f, "planning"),
            Phase::PlanReview => write!(f, "plan_review"),
            Phase::Researching => write!(f, "researching"),
            Phase::Synthesizing => write!(f, "synthesizing"),
            Phase::Completed => write!(f, "completed"),
            Phase::Failed => write!(f, "failed"),
            Phase::Cancelled => write!(f, "cancelled"),
        }
    }
}

impl std::str::FromStr for Phase {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "planning" => Ok(Phase::Planning),
            "plan_review" => Ok(Phase::PlanReview),
            "researching" => Ok(Phase::Researching),
            "synthesizing" => Ok(Phase::Synthesizing),
            "completed" => Ok(Phase::Completed),
            "failed" => Ok(Phase::Failed),
            "cancelled" => Ok(Phase::Cancelled),
            other => Err(format!("Unknown phase: {}", other)),
        }
    }
}

// ============================================================================
// Session
// ============================================================================

/// The full state of one research request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    pub query: String,
    /// Language the reports should be written in (`en`, `zh`, ...)
    pub language: String,
    pub phase: Phase,
    pub plan: Option<Plan>,
    /// Latest progress per plan item id
    #[serde(default)]
    pub agent_progress: HashMap<String, AgentProgress>,
    /// One entry per completed plan item, in completion order
    #[serde(default)]
    pub results: Vec<AgentResult>,
    pub final_report: Option<String>,
    /// Reviewer feedback for a plan revision still waiting on the planner
    #[serde(default)]
    pub revision_feedback: Option<String>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Session {
    /// A new session in the planning phase
    pub fn new(query: impl Into<String>, language: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            query: query.into(),
            language: language.into(),
            phase: Phase::Planning,
            plan: None,
            agent_progress: HashMap::new(),
            results: Vec::new(),
            final_report: None,
            revision_feedback: None,
            error: None,
            created_at: now,
            updated_at: now,
            completed_at: None,
        }
    }

    /// Set the phase without checking the transition table
    pub fn set_phase(&mut self, phase: Phase) {
        self.phase = phase;
        self.touch();
        if phase.is_terminal() {
            self.completed_at = Some(self.updated_at);
        }
    }

    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }

    /// Append a completed result and mark its item completed
    pub fn add_result(&mut self, result: AgentResult) {
        if let Some(plan) = self.plan.as_mut() {
            plan.set_status(&result.plan_item_id, PlanItemStatus::Completed);
        }
        self.results.push(result);
        self.touch();
    }

    pub fn set_item_status(&mut self, item_id: &str, status: PlanItemStatus) {
        if let Some(plan) = self.plan.as_mut() {
            plan.set_status(item_id, status);
        }
        self.touch();
    }

    pub fn update_progress(&mut self, progress: AgentProgress) {
        self.agent_progress
            .insert(progress.plan_item_id.clone(), progress);
        self.touch();
    }

    /// Snapshot the resumable state
    pub fn to_checkpoint(&self) -> Checkpoint {
        let (completed_item_ids, pending_item_ids) = match &self.plan {
            Some(plan) => (plan.completed_ids(), plan.pending_ids()),
            None => (Vec::new(), Vec::new()),
        };

        Checkpoint {
            session_id: self.id.clone(),
            query: self.query.clone(),
            language: self.language.clone(),
            phase: self.phase,
            plan: self.plan.clone(),
            completed_item_ids,
            pending_item_ids,
            results: self.results.clone(),
            revision_feedback: self.revision_feedback.clone(),
            checkpoint_time: Utc::now(),
        }
    }

    /// Rebuild a session from a checkpoint.
    ///
    /// Items listed as pending go back to `pending` so they are scheduled
    /// again; completed items without a matching result are also re-queued.
    pub fn from_checkpoint(checkpoint: &Checkpoint) -> Self {
        let mut plan = checkpoint.plan.clone();
        if let Some(plan) = plan.as_mut() {
            for item in plan.items.iter_mut() {
                let has_result = checkpoint
                    .results
                    .iter()
                    .any(|r| r.plan_item_id == item.id);
                let keep = match item.status {
                    PlanItemStatus::Skipped => true,
                    PlanItemStatus::Completed => has_result,
                    _ => false,
                };
                if !keep {
                    item.status = PlanItemStatus::Pending;
                }
            }
        }

        let now = Utc::now();
        Self {
            id: checkpoint.session_id.clone(),
            query: checkpoint.query.clone(),
            language: checkpoint.language.clone(),
            phase: checkpoint.phase,
            plan,
            agent_progress: HashMap::new(),
            results: checkpoint.results.clone(),
            final_report: None,
            revision_feedback: checkpoint.revision_feedback.clone(),
            error: None,
            created_at: checkpoint.checkpoint_time,
            updated_at: now,
            completed_at: None,
        }
    }
}

/// Metadata-only view of a session, cheap to read for status polling
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionSummary {
    pub id: String,
    pub query: String,
    pub language: String,
    pub phase: Phase,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl From<&Session> for SessionSummary {
    fn from(session: &Session) -> Self {
        Self {
            id: session.id.clone(),
            query: session.query.clone(),
            language: session.language.clone(),
            phase: session.phase,
            error: session.error.clone(),
            created_at: session.created_at,
            updated_at: session.updated_at,
            completed_at: session.completed_at,
        }
    }
}
