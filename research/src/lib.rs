//! Resumable deep-research orchestrator
//!
//! A query is planned into independent items, researched by parallel agent
//! calls and synthesized into one report. Sessions are persisted and
//! checkpointed so interrupted runs can resume, and every step is published
//! on an in-process event bus.

pub mod config;
pub mod error;
pub mod events;
pub mod gateway;
pub mod model;
pub mod orchestrator;
pub mod store;

pub use config::Settings;
pub use error::{ResearchError, Result};
pub use events::{Event, EventBus, EventKind, EventPayload};
pub use orchestrator::{Orchestrator, OrchestratorConfig};
pub use store::{Database, SessionStore};
