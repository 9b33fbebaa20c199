//! The peer-to-peer RPC seam and its message types.

use std::collections::BTreeMap;

use anyhow::Result;
use async_trait::async_trait;
use serde::Deserialize;
use serde::Serialize;

use crate::state::CompactedSnapshot;
use crate::state::LogEntry;
use crate::AgentId;
use crate::LogIndex;
use crate::MessageSummary;
use crate::Term;

/// Peer-to-peer endpoint paths, for transports that route by path.
pub const PRIV_APPEND_ENTRIES: &str = "/_api/agency_priv/appendEntries";
pub const PRIV_REQUEST_VOTE: &str = "/_api/agency_priv/requestVote";
pub const PRIV_GOSSIP: &str = "/_api/agency_priv/gossip";

/// An append-entries package from the leader. Doubles as the heartbeat
/// when `entries` is empty, and as the catch-up vehicle when `snapshot`
/// is present: a follower behind the leader's first retained index gets
/// the committed store as of `snapshot.index`, followed by the entries
/// from that index on (the snapshot-point entry included, so the
/// follower's log never ends up empty).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AppendEntriesRequest {
    pub term: Term,
    pub leader_id: AgentId,
    pub prev_log_index: LogIndex,
    pub prev_log_term: Term,
    pub leader_commit: LogIndex,
    /// Leader send time, epoch milliseconds; echoed back for RTT checks.
    pub sender_time_stamp_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub snapshot: Option<CompactedSnapshot>,
    pub entries: Vec<LogEntry>,
}

impl MessageSummary for AppendEntriesRequest {
    fn summary(&self) -> String {
        format!(
            "term={}, leader={}, prev=({},{}), commit={}, snapshot={}, n={}",
            self.term,
            self.leader_id,
            self.prev_log_index,
            self.prev_log_term,
            self.leader_commit,
            self.snapshot.as_ref().map(|s| s.index).unwrap_or(0),
            self.entries.len(),
        )
    }
}

/// The follower's reply.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AppendEntriesResponse {
    pub term: Term,
    pub success: bool,
    /// Highest log index present on the follower after this package.
    pub highest: LogIndex,
    /// Echo of the request's send time.
    pub sender_time_stamp_ms: u64,
}

/// A vote request from a campaigning candidate.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct VoteRequest {
    pub term: Term,
    pub candidate_id: AgentId,
    pub last_log_index: LogIndex,
    pub last_log_term: Term,
}

impl MessageSummary for VoteRequest {
    fn summary(&self) -> String {
        format!(
            "term={}, candidate={}, last=({},{})",
            self.term, self.candidate_id, self.last_log_index, self.last_log_term
        )
    }
}

/// The reply to a vote request.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct VoteResponse {
    pub term: Term,
    pub vote_granted: bool,
}

/// A gossiped pool proposal, exchanged until the pool is complete.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GossipRequest {
    pub id: AgentId,
    pub endpoint: String,
    pub pool: BTreeMap<AgentId, String>,
    /// True when this message answers an earlier gossip of ours.
    pub is_callback: bool,
    pub version: u64,
}

impl MessageSummary for GossipRequest {
    fn summary(&self) -> String {
        format!(
            "id={}, endpoint={}, pool={}, callback={}, version={}",
            self.id,
            self.endpoint,
            self.pool.len(),
            self.is_callback,
            self.version
        )
    }
}

/// The reply to a gossip message.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GossipResponse {
    /// The receiver's merged pool.
    pub pool: BTreeMap<AgentId, String>,
    /// Set when the receiver wants the sender to talk to the leader.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub redirect: Option<String>,
    /// Set when the sender is a stranger to a completed pool. Fatal for
    /// the sender.
    #[serde(default)]
    pub refused: bool,
}

/// Transport used by agents to reach their peers.
#[async_trait]
pub trait AgencyNetwork: Send + Sync + 'static {
    /// Ship an append-entries package to the target peer.
    async fn append_entries(&self, target: &AgentId, rpc: AppendEntriesRequest) -> Result<AppendEntriesResponse>;

    /// Ask the target peer for its vote.
    async fn request_vote(&self, target: &AgentId, rpc: VoteRequest) -> Result<VoteResponse>;

    /// Exchange pool gossip with the target peer.
    async fn gossip(&self, target: &AgentId, rpc: GossipRequest) -> Result<GossipResponse>;
}
