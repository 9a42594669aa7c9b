//! Typed error hierarchy for the planning pipeline.
//!
//! Every operation exposed over HTTP maps its failure into one of the
//! `PipelineError` variants; the axum layer (`pipeline::api`) converts each
//! variant into exactly one status class. Unexpected errors are wrapped as
//! `Database`/`Other` and never reach the wire unmapped.

use thiserror::Error;

use crate::pipeline::models::StageKind;

/// Errors from the planning pipeline subsystem.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("Invalid input: {0}")]
    Validation(String),

    #[error("Missing or unresolved user identity")]
    Unauthenticated,

    #[error("User {user_id} does not own plan {plan_id}")]
    Forbidden { user_id: String, plan_id: i64 },

    #[error("Plan {id} not found")]
    PlanNotFound { id: i64 },

    /// Covers missing candidates as well as ones that fail a selection
    /// precondition (wrong plan, non-completed status).
    #[error("Refinement {id} not found or not selectable")]
    RefinementNotFound { id: i64 },

    #[error("Discovery session {id} not found or not selectable")]
    SessionNotFound { id: i64 },

    #[error("Plan generation {id} not found or not selectable")]
    GenerationNotFound { id: i64 },

    #[error("Agent {agent_id} not found")]
    AgentNotFound { agent_id: String },

    #[error("{stage} stage failed: {message}")]
    StageExecution {
        stage: StageKind,
        message: String,
        /// A fresh attempt creates a new session; the failed row is never
        /// repaired in place.
        retryable: bool,
    },

    #[error("Database error: {0}")]
    Database(#[source] anyhow::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl PipelineError {
    /// Wrap a stage failure, always marked retryable: the caller may re-run
    /// the stage, which creates a fresh session record.
    pub fn stage(stage: StageKind, message: impl Into<String>) -> Self {
        Self::StageExecution {
            stage,
            message: message.into(),
            retryable: true,
        }
    }
}
