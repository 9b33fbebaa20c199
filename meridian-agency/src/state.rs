//! The append-only replicated log and its compaction snapshots.
//!
//! Entries carry dense, strictly increasing indexes starting at 1. Entries
//! at or below the last compaction point are folded into a single store
//! snapshot; the entry whose payload produced the snapshot is always
//! retained so the log never becomes empty on a compacted member. Log and
//! snapshot together cover `[1, last_index()]` without gaps.

use std::collections::BTreeMap;
use std::collections::VecDeque;

use serde::Deserialize;
use serde::Serialize;
use serde_json::Value;

use crate::error::AgencyError;
use crate::store::Store;
use crate::LogIndex;
use crate::MessageSummary;
use crate::Term;

/// One replicated log entry. The payload (`query`) is an array of
/// operation objects, one per transaction folded into this entry.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    pub index: LogIndex,
    pub term: Term,
    /// Leader-side application time, epoch milliseconds. Replaying with
    /// this timestamp keeps TTL expiry deterministic across members.
    pub timestamp_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none", rename = "clientId")]
    pub client_id: Option<String>,
    pub query: Value,
}

impl MessageSummary for LogEntry {
    fn summary(&self) -> String {
        format!("{}:{}", self.index, self.term)
    }
}

impl MessageSummary for &[LogEntry] {
    fn summary(&self) -> String {
        self.iter().map(|e| e.summary()).collect::<Vec<_>>().join(",")
    }
}

/// A compaction snapshot: the store as of `index`, plus the term of the
/// entry that produced it.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CompactedSnapshot {
    pub index: LogIndex,
    pub term: Term,
    /// Serialized [`Store`] (see [`Store::to_snapshot`]).
    pub store: Value,
}

/// Outcome of a follower-side append.
#[derive(Debug, PartialEq, Eq)]
pub enum FollowerAppend {
    /// Entries accepted; the log now ends at this index.
    Appended(LogIndex),
    /// The entries do not attach to the local log contiguously.
    Rejected,
}

/// The in-memory image of the replicated log.
#[derive(Debug, Default)]
pub struct State {
    entries: VecDeque<LogEntry>,
    snapshot: Option<CompactedSnapshot>,
    last_compaction_at: LogIndex,
}

impl State {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild from persisted snapshot and entries at boot.
    pub fn from_parts(snapshot: Option<CompactedSnapshot>, mut entries: Vec<LogEntry>) -> Self {
        entries.sort_by_key(|e| e.index);
        let last_compaction_at = snapshot.as_ref().map(|s| s.index).unwrap_or(0);
        Self {
            entries: entries.into(),
            snapshot,
            last_compaction_at,
        }
    }

    /// Index of the oldest retained entry, 0 when the log is empty.
    pub fn first_index(&self) -> LogIndex {
        self.entries.front().map(|e| e.index).unwrap_or(0)
    }

    /// Index of the newest entry, 0 when the log is empty.
    pub fn last_index(&self) -> LogIndex {
        self.entries.back().map(|e| e.index).unwrap_or(self.last_compaction_at)
    }

    pub fn last_term(&self) -> Term {
        self.entries
            .back()
            .map(|e| e.term)
            .or_else(|| self.snapshot.as_ref().map(|s| s.term))
            .unwrap_or(0)
    }

    pub fn last_compaction_at(&self) -> LogIndex {
        self.last_compaction_at
    }

    pub fn term_of(&self, index: LogIndex) -> Option<Term> {
        if index == 0 {
            return Some(0);
        }
        if let Some(snap) = &self.snapshot {
            if index == snap.index && self.entry_at(index).is_none() {
                return Some(snap.term);
            }
        }
        self.entry_at(index).map(|e| e.term)
    }

    fn entry_at(&self, index: LogIndex) -> Option<&LogEntry> {
        let first = self.first_index();
        if first == 0 || index < first || index > self.last_index() {
            return None;
        }
        self.entries.get((index - first) as usize)
    }

    /// Append a single transaction payload under leader discipline.
    pub fn log_leader_single(
        &mut self,
        ops: Value,
        term: Term,
        timestamp_ms: u64,
        client_id: Option<String>,
    ) -> LogIndex {
        let index = self.last_index() + 1;
        self.entries.push_back(LogEntry {
            index,
            term,
            timestamp_ms,
            client_id,
            query: Value::Array(vec![ops]),
        });
        index
    }

    /// Append several transaction payloads; `applied` marks which of the
    /// submitted transactions passed their preconditions. Failed ones are
    /// reported with index 0 and are not logged.
    pub fn log_leader_multi(
        &mut self,
        trxs: &[(Value, Option<String>)],
        applied: &[bool],
        term: Term,
        timestamp_ms: u64,
    ) -> Vec<LogIndex> {
        trxs.iter()
            .zip(applied)
            .map(|((ops, client_id), ok)| {
                if *ok {
                    self.log_leader_single(ops.clone(), term, timestamp_ms, client_id.clone())
                } else {
                    0
                }
            })
            .collect()
    }

    /// Follower-side append. Truncates local entries that collide at the
    /// same index with a different term, ignores duplicates at identical
    /// `(index, term)` and rejects non-contiguous prefixes.
    pub fn log_follower(&mut self, incoming: &[LogEntry]) -> FollowerAppend {
        for entry in incoming {
            let last = self.last_index();
            if self.entries.is_empty() {
                // Fresh or freshly restored log: accept the snapshot-point
                // entry itself or the immediate successor; anything older is
                // covered by the snapshot.
                if entry.index == self.last_compaction_at || entry.index == last + 1 {
                    self.entries.push_back(entry.clone());
                } else if entry.index > last + 1 {
                    return FollowerAppend::Rejected;
                }
                continue;
            }
            if entry.index <= last {
                match self.term_of(entry.index) {
                    Some(t) if t == entry.term => continue,
                    _ => {
                        self.truncate_from(entry.index);
                        self.entries.push_back(entry.clone());
                    }
                }
            } else if entry.index == last + 1 {
                self.entries.push_back(entry.clone());
            } else {
                return FollowerAppend::Rejected;
            }
        }
        FollowerAppend::Appended(self.last_index())
    }

    /// Drop all entries with `index >= from`.
    pub fn truncate_from(&mut self, from: LogIndex) {
        while self.entries.back().map(|e| e.index >= from).unwrap_or(false) {
            self.entries.pop_back();
        }
    }

    /// Inclusive range of entries, clamped to what is retained.
    pub fn get(&self, from: LogIndex, to: LogIndex) -> Vec<LogEntry> {
        let first = self.first_index();
        if first == 0 {
            return Vec::new();
        }
        let from = from.max(first);
        let to = to.min(self.last_index());
        if from > to {
            return Vec::new();
        }
        ((from - first) as usize..=(to - first) as usize)
            .filter_map(|i| self.entries.get(i).cloned())
            .collect()
    }

    /// Payload-only view of an inclusive range, used for store application.
    pub fn slices(&self, from: LogIndex, to: LogIndex) -> Vec<(Value, u64)> {
        self.get(from, to).into_iter().map(|e| (e.query, e.timestamp_ms)).collect()
    }

    /// Fold all entries up to `up_to - keep_size` into a new snapshot,
    /// preserving at least `keep_size` trailing entries and the entry that
    /// produced the snapshot. Returns true when a compaction happened.
    pub fn compact(&mut self, up_to: LogIndex, keep_size: u64) -> Result<bool, AgencyError> {
        let cut = up_to.saturating_sub(keep_size);
        let first = self.first_index();
        if cut <= self.last_compaction_at || first == 0 || cut < first {
            return Ok(false);
        }

        let mut store = match &self.snapshot {
            Some(snap) => Store::from_snapshot(&snap.store)?,
            None => Store::new(),
        };
        for (payload, ts) in self.slices(first, cut) {
            store.apply_log_payload(&payload, ts)?;
        }
        let term = self.term_of(cut).unwrap_or(0);
        self.snapshot = Some(CompactedSnapshot {
            index: cut,
            term,
            store: store.to_snapshot(),
        });
        self.last_compaction_at = cut;

        // Keep the snapshot-point entry so the log stays non-empty.
        while self.entries.front().map(|e| e.index < cut).unwrap_or(false) {
            self.entries.pop_front();
        }
        Ok(true)
    }

    /// The last compaction snapshot, if one exists.
    pub fn last_compacted_snapshot(&self) -> Option<&CompactedSnapshot> {
        self.snapshot.as_ref()
    }

    /// Replace log and snapshot with a snapshot received from the leader.
    /// Entries following the snapshot point are appended by the caller.
    pub fn restore_from_snapshot(&mut self, snapshot: CompactedSnapshot) {
        self.last_compaction_at = snapshot.index;
        self.entries.clear();
        self.snapshot = Some(snapshot);
    }

    /// Entries for a long-poll response: `[from, commit_index]`, plus the
    /// first retained index so the caller can detect compaction gaps.
    pub fn to_poll_result(&self, from: LogIndex, commit_index: LogIndex) -> (LogIndex, Vec<LogEntry>) {
        (self.first_index(), self.get(from, commit_index))
    }

    /// Indexes of retained entries carrying any of the given client ids.
    pub fn find_client_indexes(&self, client_ids: &[String]) -> BTreeMap<String, Vec<LogIndex>> {
        let mut out = BTreeMap::new();
        for entry in &self.entries {
            if let Some(cid) = &entry.client_id {
                if client_ids.iter().any(|c| c == cid) {
                    out.entry(cid.clone()).or_insert_with(Vec::new).push(entry.index);
                }
            }
        }
        out
    }

    /// All retained entries, oldest first. Used by persistence at boot.
    pub fn entries(&self) -> impl Iterator<Item = &LogEntry> {
        self.entries.iter()
    }
}
