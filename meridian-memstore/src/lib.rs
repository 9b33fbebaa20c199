//! An in-memory implementation of the `meridian-agency` storage trait.
//!
//! Used by the agency's integration tests and by single-process
//! deployments that can afford to lose the log on restart. Everything
//! lives behind one async `RwLock`; the "durability" contract is simply
//! that a method has fully taken effect by the time it returns.

use anyhow::Result;
use async_trait::async_trait;
use std::collections::BTreeMap;
use tokio::sync::RwLock;

use meridian_agency::state::CompactedSnapshot;
use meridian_agency::state::LogEntry;
use meridian_agency::storage::AgencyStorage;
use meridian_agency::storage::PersistedVote;
use meridian_agency::storage::RecoveredState;
use meridian_agency::LogIndex;

#[derive(Debug, Default)]
struct MemStorageInner {
    vote: PersistedVote,
    entries: BTreeMap<LogIndex, LogEntry>,
    snapshot: Option<CompactedSnapshot>,
}

/// The in-memory storage backend.
#[derive(Debug, Default)]
pub struct MemStorage {
    inner: RwLock<MemStorageInner>,
}

impl MemStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a store pre-seeded with existing state, for restart tests.
    pub fn new_with_state(
        vote: PersistedVote,
        entries: Vec<LogEntry>,
        snapshot: Option<CompactedSnapshot>,
    ) -> Self {
        Self {
            inner: RwLock::new(MemStorageInner {
                vote,
                entries: entries.into_iter().map(|e| (e.index, e)).collect(),
                snapshot,
            }),
        }
    }

    /// The persisted vote, for assertions.
    pub async fn vote(&self) -> PersistedVote {
        self.inner.read().await.vote.clone()
    }

    /// Number of retained entries, for assertions.
    pub async fn entry_count(&self) -> usize {
        self.inner.read().await.entries.len()
    }

    /// The persisted snapshot, for assertions.
    pub async fn snapshot(&self) -> Option<CompactedSnapshot> {
        self.inner.read().await.snapshot.clone()
    }
}

#[async_trait]
impl AgencyStorage for MemStorage {
    async fn recover(&self) -> Result<RecoveredState> {
        let inner = self.inner.read().await;
        tracing::debug!(
            entries = inner.entries.len(),
            term = inner.vote.term,
            "recovering agent state"
        );
        Ok(RecoveredState {
            vote: inner.vote.clone(),
            snapshot: inner.snapshot.clone(),
            entries: inner.entries.values().cloned().collect(),
        })
    }

    async fn save_vote(&self, vote: &PersistedVote) -> Result<()> {
        let mut inner = self.inner.write().await;
        inner.vote = vote.clone();
        Ok(())
    }

    async fn append_entries(&self, entries: &[LogEntry]) -> Result<()> {
        if entries.is_empty() {
            return Ok(());
        }
        let mut inner = self.inner.write().await;
        // The incoming batch replaces anything from its first index on;
        // this covers follower-side conflict truncation in one call.
        let from = entries[0].index;
        inner.entries.split_off(&from);
        for entry in entries {
            inner.entries.insert(entry.index, entry.clone());
        }
        Ok(())
    }

    async fn truncate_from(&self, from: LogIndex) -> Result<()> {
        let mut inner = self.inner.write().await;
        inner.entries.split_off(&from);
        Ok(())
    }

    async fn save_snapshot(&self, snapshot: &CompactedSnapshot) -> Result<()> {
        let mut inner = self.inner.write().await;
        // Forget everything the snapshot covers, except its own entry.
        inner.entries = inner.entries.split_off(&snapshot.index);
        inner.snapshot = Some(snapshot.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use serde_json::Value;

    use super::*;

    fn entry(index: LogIndex, term: u64) -> LogEntry {
        LogEntry {
            index,
            term,
            timestamp_ms: 0,
            client_id: None,
            query: Value::Array(vec![json!({"/k": index})]),
        }
    }

    #[tokio::test]
    async fn append_replaces_from_first_index() {
        let storage = MemStorage::new();
        storage.append_entries(&[entry(1, 1), entry(2, 1), entry(3, 1)]).await.unwrap();
        storage.append_entries(&[entry(2, 2)]).await.unwrap();

        let recovered = storage.recover().await.unwrap();
        assert_eq!(recovered.entries.len(), 2);
        assert_eq!(recovered.entries[1].term, 2);
    }

    #[tokio::test]
    async fn snapshot_drops_covered_entries() {
        let storage = MemStorage::new();
        storage
            .append_entries(&(1..=10).map(|i| entry(i, 1)).collect::<Vec<_>>())
            .await
            .unwrap();
        storage
            .save_snapshot(&CompactedSnapshot {
                index: 7,
                term: 1,
                store: Value::Null,
            })
            .await
            .unwrap();

        let recovered = storage.recover().await.unwrap();
        assert_eq!(recovered.entries.first().map(|e| e.index), Some(7));
        assert_eq!(recovered.snapshot.map(|s| s.index), Some(7));
    }

    #[tokio::test]
    async fn truncate_drops_the_tail() {
        let storage = MemStorage::new();
        storage.append_entries(&[entry(1, 1), entry(2, 1), entry(3, 1)]).await.unwrap();
        storage.truncate_from(2).await.unwrap();
        assert_eq!(storage.entry_count().await, 1);
    }

    #[tokio::test]
    async fn vote_round_trip() {
        let storage = MemStorage::new();
        let vote = PersistedVote {
            term: 3,
            voted_for: Some("A".to_string()),
        };
        storage.save_vote(&vote).await.unwrap();
        assert_eq!(storage.vote().await, vote);
    }
}
