//! Typed error hierarchy for the phase coordinator.
//!
//! Four enums cover the engine and its seams:
//! - `CoordinatorError`: everything a caller of the engine can observe
//! - `HandlerError`: a transition hook failed (never fatal)
//! - `BodyError`: an injected phase body failed
//! - `ServiceError`: state store, event bus or metrics recorder failed

use std::time::Duration;

use thiserror::Error;

/// Errors surfaced by the lifecycle manager, nested coordinator, checkpoint
/// manager and facade.
#[derive(Debug, Clone, Error)]
pub enum CoordinatorError {
    #[error("Phase {phase_id} not found")]
    NotFound { phase_id: String },

    #[error("Phase {phase_id} has unfulfilled dependencies: {}", blocking.join(", "))]
    DependencyUnmet {
        phase_id: String,
        blocking: Vec<String>,
    },

    #[error("Circuit breaker {breaker} is open, retry after {}s", retry_after.as_secs())]
    CircuitOpen {
        breaker: String,
        retry_after: Duration,
    },

    #[error("Execution {execution_id} of {child_id} failed: {message}")]
    ExecutionFailure {
        execution_id: String,
        child_id: String,
        message: String,
    },

    #[error("Execution {execution_id} orphaned: {message}")]
    OrphanedExecution {
        execution_id: String,
        message: String,
    },

    #[error("Invalid transition for phase {phase_id}: {from} -> {to}")]
    InvalidTransition {
        phase_id: String,
        from: String,
        to: String,
    },

    #[error("Phase {phase_id} already initialized")]
    DuplicatePhase { phase_id: String },

    #[error("Unknown phase type '{phase_type}'")]
    UnknownPhaseType { phase_type: String },

    #[error("Invalid phase type '{phase_type}': {reason}")]
    InvalidPhaseType { phase_type: String, reason: String },

    #[error("Phase {child_id} is not a child of {parent_id}")]
    NotAChild { parent_id: String, child_id: String },

    #[error("Invalid hierarchy for phase {phase_id}: {reason}")]
    InvalidHierarchy { phase_id: String, reason: String },

    #[error("Phase type {phase_type} is in use by phase {phase_id}")]
    TypeInUse { phase_type: String, phase_id: String },

    #[error("Checkpoint {checkpoint_id} not found")]
    CheckpointNotFound { checkpoint_id: String },

    #[error("Persistence error: {0}")]
    Persistence(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl CoordinatorError {
    /// Stable, machine-readable status token for this error.
    pub fn status_token(&self) -> &'static str {
        match self {
            CoordinatorError::NotFound { .. } => "not_found",
            CoordinatorError::DependencyUnmet { .. } => "dependency_error",
            CoordinatorError::CircuitOpen { .. } => "circuit_open",
            CoordinatorError::ExecutionFailure { .. } => "execution_failed",
            CoordinatorError::OrphanedExecution { .. } => "orphaned",
            CoordinatorError::InvalidTransition { .. } => "invalid_state",
            CoordinatorError::DuplicatePhase { .. } => "duplicate_phase",
            CoordinatorError::UnknownPhaseType { .. } => "unknown_phase_type",
            CoordinatorError::InvalidPhaseType { .. } => "invalid_phase_type",
            CoordinatorError::NotAChild { .. } => "not_a_child",
            CoordinatorError::InvalidHierarchy { .. } => "invalid_hierarchy",
            CoordinatorError::TypeInUse { .. } => "type_in_use",
            CoordinatorError::CheckpointNotFound { .. } => "checkpoint_not_found",
            CoordinatorError::Persistence(_) => "persistence_error",
            CoordinatorError::Config(_) => "config_error",
        }
    }

    pub(crate) fn not_found(phase_id: impl Into<String>) -> Self {
        CoordinatorError::NotFound {
            phase_id: phase_id.into(),
        }
    }
}

/// A transition hook failed. Logged into the progress log, never aborts a run.
#[derive(Debug, Clone, Error)]
#[error("{handler}: {message}")]
pub struct HandlerError {
    pub handler: String,
    pub message: String,
}

impl HandlerError {
    pub fn new(handler: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            handler: handler.into(),
            message: message.into(),
        }
    }
}

/// A phase body failed.
#[derive(Debug, Clone, Error)]
#[error("{kind}: {message}")]
pub struct BodyError {
    /// Short classification of the failure (e.g. "timeout", "validation")
    pub kind: String,
    pub message: String,
}

impl BodyError {
    pub fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            message: message.into(),
        }
    }
}

impl From<anyhow::Error> for BodyError {
    fn from(err: anyhow::Error) -> Self {
        BodyError::new("error", format!("{:#}", err))
    }
}

/// Errors from the external collaborators (state store, event bus, metrics).
#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("State store error: {0}")]
    Store(String),

    #[error("Event bus error: {0}")]
    Events(String),

    #[error("Metrics error: {0}")]
    Metrics(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}
