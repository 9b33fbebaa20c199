//! Errors surfaced by engine instantiation and execution.

use thiserror::Error;

use crate::ServerId;

#[derive(Debug, Error)]
pub enum EngineError {
    /// The query was killed, by a client or by a reboot tracker.
    #[error("query killed")]
    QueryKilled,

    /// A fullCount constraint was violated (maintainer check).
    #[error("fullCount constraint violated: {0}")]
    FullCountViolation(String),

    /// A DB-server refused or failed a snippet deployment.
    #[error("snippet deployment failed on {server}: {reason}")]
    DeploymentFailed { server: ServerId, reason: String },

    /// The plan graph is structurally unusable.
    #[error("malformed plan: {0}")]
    MalformedPlan(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}
