//! Orchestrator error taxonomy
//!
//! Every variant maps to a stable code carried by `error` events so that
//! observers can react without parsing messages.

use crate::config::ConfigError;
use crate::store::StoreError;

/// Errors surfaced by the workflow orchestrator
#[derive(Debug, thiserror::Error)]
pub enum ResearchError {
    #[error("Planning failed: {0}")]
    PlanningFailure(String),

    #[error("Research unit for '{item_id}' timed out")]
    UnitTimeout { item_id: String },

    #[error("Research unit for '{item_id}' failed: {message}")]
    UnitExecutionError { item_id: String, message: String },

    #[error("Synthesis failed: {0}")]
    SynthesisFailure(String),

    #[error("Checkpoint write failed: {0}")]
    CheckpointWriteFailure(String),

    #[error("No checkpoint found for session {0}")]
    NoCheckpointFound(String),

    #[error("Provider unavailable: {0}")]
    ProviderUnavailable(String),

    #[error("No research results to synthesize")]
    NoResults,

    #[error("Session not found: {0}")]
    SessionNotFound(String),

    #[error("Invalid phase for {operation}: session is {phase}")]
    InvalidPhase { operation: String, phase: String },

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
}

impl ResearchError {
    /// Stable machine-readable code
    pub fn code(&self) -> &'static str {
        match self {
            ResearchError::PlanningFailure(_) => "PLANNING_FAILED",
            ResearchError::UnitTimeout { .. } => "UNIT_TIMEOUT",
            ResearchError::UnitExecutionError { .. } => "UNIT_EXECUTION_ERROR",
            ResearchError::SynthesisFailure(_) => "SYNTHESIS_FAILED",
            ResearchError::CheckpointWriteFailure(_) => "CHECKPOINT_WRITE_FAILED",
            ResearchError::NoCheckpointFound(_) => "NO_CHECKPOINT_FOUND",
            ResearchError::ProviderUnavailable(_) => "PROVIDER_UNAVAILABLE",
            ResearchError::NoResults => "NO_RESULTS",
            ResearchError::SessionNotFound(_) => "SESSION_NOT_FOUND",
            ResearchError::InvalidPhase { .. } => "INVALID_PHASE",
            ResearchError::Store(_) => "STORE_ERROR",
            ResearchError::Config(_) => "CONFIG_ERROR",
        }
    }

    pub(crate) fn invalid_phase(operation: &str, phase: impl std::fmt::Display) -> Self {
        ResearchError::InvalidPhase {
            operation: operation.to_string(),
            phase: phase.to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, ResearchError>;
