//! Session data model
//!
//! Sessions own a plan, the results of its completed items and the latest
//! progress of each unit of work. Checkpoints are whole snapshots of the
//! resumable part of a session.

mod checkpoint;
mod plan;
mod result;
mod session;

pub use checkpoint::Checkpoint;
pub use plan::{Plan, PlanItem, PlanItemStatus};
pub(crate) use plan::{clamp_priority, unique_item_id};
pub use result::{agent_id_for, AgentProgress, AgentResult, AgentStatus, Source};
pub use session::{Phase, Session, SessionSummary};

pub(crate) use result::{duration_millis, truncate_chars};
