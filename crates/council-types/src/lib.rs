//! Shared types and errors for the Council pipeline engine.
//!
//! This crate provides the foundational types used across all other Council crates:
//! - `CouncilError`: unified error taxonomy
//! - `Run`, `PhaseState`, `ActionState`: the ephemeral state tree of one pipeline run
//! - `PhaseLifecycle`, `ActionLifecycle`, `RunStatus`: the state-machine positions

pub mod state;

pub use state::{
    ActionLifecycle, ActionState, ParticipantResponse, PhaseLifecycle, PhaseState, Run,
    RunStatus,
};

/// Unified error type for all Council subsystems.
#[derive(Debug, thiserror::Error)]
pub enum CouncilError {
    // === Definition Errors ===
    #[error("Pipeline validation failed: {0}")]
    ValidationError(String),

    #[error("Pipeline '{0}' is not registered")]
    PipelineNotFound(String),

    // === Run Errors ===
    #[error("A pipeline run is already active ({run_id})")]
    RunAlreadyActive { run_id: String },

    #[error("No pipeline run is active")]
    NoActiveRun,

    #[error("Pipeline execution aborted")]
    Aborted,

    #[error("Action '{action}' failed: {message}")]
    ActionFailed { action: String, message: String },

    #[error("Action '{action}' timed out after {timeout_ms}ms")]
    ActionTimeout { action: String, timeout_ms: u64 },

    #[error(
        "Action '{action}' timed out after {timeout_ms}ms waiting for '{target}' to reach '{state}'"
    )]
    TriggerTimeout {
        action: String,
        target: String,
        state: String,
        timeout_ms: u64,
    },

    // === Collaborator Errors ===
    #[error("{0} is not configured")]
    MissingCollaborator(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("{collaborator} error: {message}")]
    Collaborator {
        collaborator: String,
        message: String,
    },

    // === LLM Errors ===
    #[error("Provider {provider} returned HTTP {status}: {message}")]
    ProviderError {
        provider: String,
        status: u16,
        message: String,
        retryable: bool,
    },

    #[error("Authentication failed for provider {provider}")]
    AuthError { provider: String },

    #[error("Request to {provider} timed out after {timeout_ms}ms")]
    RequestTimeout { provider: String, timeout_ms: u64 },

    // === Gavel Errors ===
    #[error("Gavel '{key}' was not resolved within {timeout_ms}ms")]
    GavelTimeout { key: String, timeout_ms: u64 },

    #[error("No gavel is pending for '{0}'")]
    GavelNotPending(String),

    // === Generic ===
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("{0}")]
    Other(String),
}

impl CouncilError {
    /// Returns `true` if an action failing with this error may be attempted again.
    ///
    /// Everything retries except the abort sentinel and errors that stem from
    /// configuration rather than execution.
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            CouncilError::Aborted
                | CouncilError::MissingCollaborator(_)
                | CouncilError::Configuration(_)
                | CouncilError::ValidationError(_)
                | CouncilError::RunAlreadyActive { .. }
                | CouncilError::AuthError { .. }
                | CouncilError::GavelTimeout { .. }
        )
    }

    /// Returns `true` for the abort sentinel.
    pub fn is_abort(&self) -> bool {
        matches!(self, CouncilError::Aborted)
    }

    /// Shorthand for an [`CouncilError::ActionFailed`] error.
    pub fn action(action: impl Into<String>, message: impl Into<String>) -> Self {
        CouncilError::ActionFailed {
            action: action.into(),
            message: message.into(),
        }
    }

    /// Shorthand for a [`CouncilError::Collaborator`] error.
    pub fn collaborator(collaborator: impl Into<String>, message: impl ToString) -> Self {
        CouncilError::Collaborator {
            collaborator: collaborator.into(),
            message: message.to_string(),
        }
    }
}

/// A convenience alias for `Result<T, CouncilError>`.
pub type Result<T> = std::result::Result<T, CouncilError>;
