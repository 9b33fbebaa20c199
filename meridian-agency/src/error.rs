//! Error types surfaced by the agency.

use thiserror::Error;

use crate::AgentId;

/// A result whose error side is an [`AgencyError`].
pub type AgencyResult<T> = Result<T, AgencyError>;

/// Errors surfaced to agency callers.
#[derive(Debug, Error)]
pub enum AgencyError {
    /// The contacted agent is not the leader, or is a leader which has not
    /// yet commenced service. Carries a leader hint when one is known.
    #[error("not leader (hint: {leader:?})")]
    NotLeader { leader: Option<AgentId> },

    /// A transaction's precondition did not hold. Local failure, the store
    /// is untouched.
    #[error("precondition failed")]
    PreconditionFailed,

    /// A transaction could not be parsed or applied structurally.
    #[error("malformed transaction: {0}")]
    MalformedTransaction(String),

    /// The operation did not complete within its deadline.
    #[error("timeout")]
    Timeout,

    /// The leader resigned while the operation was in flight.
    #[error("leadership resigned")]
    Resigned,

    /// Gossiped pools disagree on an id/endpoint pairing. Fatal for the
    /// process observing it.
    #[error("pool mismatch: {0}")]
    PoolMismatch(String),

    /// A gossiping peer is not part of a completed pool.
    #[error("id reassignment denied")]
    IdReassignmentDenied,

    /// The agent task is shutting down or already gone.
    #[error("agent is shutting down")]
    Shutdown,

    /// A fatal storage failure. The agent shuts down on these.
    #[error("storage failure: {0}")]
    Storage(#[from] anyhow::Error),
}

impl AgencyError {
    /// Whether the error is fatal for the process.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::PoolMismatch(_) | Self::Storage(_))
    }
}
