//! The persistence seam of the agency.
//!
//! The agent persists its vote, the retained log entries and the last
//! compaction snapshot through this trait before acting on them. Errors
//! returned from any method are fatal: the agent shuts down rather than
//! risk violating the log-matching guarantees with a half-persisted state.

use anyhow::Result;
use async_trait::async_trait;
use serde::Deserialize;
use serde::Serialize;

use crate::state::CompactedSnapshot;
use crate::state::LogEntry;
use crate::AgentId;
use crate::LogIndex;
use crate::Term;

/// The durable vote record: `(current_term, voted_for)` must hit stable
/// storage before a vote response leaves the agent.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistedVote {
    pub term: Term,
    pub voted_for: Option<AgentId>,
}

/// The state an agent recovers at boot.
#[derive(Debug, Default)]
pub struct RecoveredState {
    pub vote: PersistedVote,
    pub snapshot: Option<CompactedSnapshot>,
    /// Retained entries, oldest first.
    pub entries: Vec<LogEntry>,
}

/// A storage backend for one agent.
#[async_trait]
pub trait AgencyStorage: Send + Sync + 'static {
    /// Load everything persisted for this agent.
    async fn recover(&self) -> Result<RecoveredState>;

    /// Persist the vote record.
    async fn save_vote(&self, vote: &PersistedVote) -> Result<()>;

    /// Persist appended entries. Entries are contiguous and follow the
    /// currently persisted tail (or replace it from `entries[0].index` on).
    async fn append_entries(&self, entries: &[LogEntry]) -> Result<()>;

    /// Drop all persisted entries with `index >= from`.
    async fn truncate_from(&self, from: LogIndex) -> Result<()>;

    /// Persist a compaction snapshot and forget entries below its index.
    async fn save_snapshot(&self, snapshot: &CompactedSnapshot) -> Result<()>;
}
