//! Replicated coordination agency for the meridian cluster.
//!
//! The agency is a small Raft cluster holding the cluster's coordination
//! state: a hierarchical key/value store replicated through an append-only
//! log. On top of the replicated store sit the supervision loops which watch
//! `Plan`/`Current`/`Target` and repair the cluster by writing jobs back
//! into the store as preconditioned transactions.
//!
//! The main entry point is [`Agent`](agent::Agent): a cheaply cloneable
//! handle to a spawned agent task. Peers talk to each other through the
//! [`AgencyNetwork`](network::AgencyNetwork) trait; persistence goes through
//! the [`AgencyStorage`](storage::AgencyStorage) trait. Clients use
//! [`AsyncAgencyComm`](comm::AsyncAgencyComm), which handles leader
//! discovery, redirects and write inquiries.

pub mod agent;
pub mod comm;
pub mod config;
pub mod error;
pub mod metrics;
pub mod network;
pub mod state;
pub mod storage;
pub mod store;
pub mod supervision;

pub use anyhow;
pub use async_trait;

pub use crate::agent::Agent;
pub use crate::config::Config;
pub use crate::error::AgencyError;
pub use crate::error::AgencyResult;
pub use crate::metrics::AgentMetrics;
pub use crate::network::AgencyNetwork;
pub use crate::storage::AgencyStorage;

/// The id of a member of the agency pool.
pub type AgentId = String;

/// A log index. Indexes are dense and start at 1; 0 means "no entry".
pub type LogIndex = u64;

/// A Raft term.
pub type Term = u64;

/// The store path prefix under which all coordination state lives.
pub const ROOT_PATH: &str = "/meridian";

/// The role an agent currently plays in the constituent state machine.
#[derive(Clone, Copy, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum Role {
    /// Replicating the leader's log, voting in elections.
    Follower,
    /// Campaigning for leadership.
    Candidate,
    /// Driving replication and accepting writes.
    Leader,
    /// The agent is shutting down.
    Shutdown,
}

impl Role {
    pub fn is_follower(&self) -> bool {
        matches!(self, Self::Follower)
    }

    pub fn is_candidate(&self) -> bool {
        matches!(self, Self::Candidate)
    }

    pub fn is_leader(&self) -> bool {
        matches!(self, Self::Leader)
    }
}

/// A one-line summary of a message, used in tracing output instead of full
/// `Debug` dumps.
pub trait MessageSummary {
    fn summary(&self) -> String;
}

/// Compute the majority threshold for a group of `n` members.
pub(crate) fn majority_of(n: usize) -> usize {
    n / 2 + 1
}
