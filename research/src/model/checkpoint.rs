//! Point-in-time snapshots used for crash recovery

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::plan::Plan;
use super::result::AgentResult;
use super::session::Phase;

/// A total, self-sufficient snapshot of a session's resumable state.
///
/// The field set is a stable contract: other processes may read stored
/// checkpoints for diagnostics.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub session_id: String,
    pub query: String,
    pub language: String,
    pub phase: Phase,
    pub plan: Option<Plan>,
    pub completed_item_ids: Vec<String>,
    /// Items that are neither completed nor skipped
    pub pending_item_ids: Vec<String>,
    pub results: Vec<AgentResult>,
    /// Set while a requested plan revision is in flight
    #[serde(default)]
    pub revision_feedback: Option<String>,
    pub checkpoint_time: DateTime<Utc>,
}
