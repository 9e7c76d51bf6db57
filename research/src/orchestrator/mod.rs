//! Research workflow orchestrator
//!
//! Drives a session through the phase state machine:
//!
//! ```text
//! planning -> plan_review -> researching -> synthesizing -> completed
//!               |    ^
//!               v    |  (revise)
//!             planning
//! ```
//!
//! Any non-terminal phase can also move to `failed` or `cancelled`. The
//! orchestrator owns the session while a run is active, persists it at every
//! phase boundary, checkpoints it periodically during research and publishes
//! every state change on the event bus.

mod engine;
mod language;
mod parse;
mod prompts;
mod research;
mod synthesis;

pub use engine::{Orchestrator, OrchestratorConfig};
pub use language::detect_language;
pub use parse::{extract_json_object, parse_plan, planner_schema, researcher_result, PlannedItem, PlannerOutput};
