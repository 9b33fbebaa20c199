//! Long-poll notification.
//!
//! A `poll(index, timeout)` either answers immediately — not leader, index
//! at or below the commit frontier, or index below the first retained
//! entry (full snapshot) — or parks a promise keyed by its deadline. Every
//! commit advance wakes all promises whose start index is now covered;
//! resignation wakes everything; the rest expire silently with an
//! empty-log envelope.

use std::time::Duration;

use serde::Deserialize;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::oneshot;
use tokio::time::Instant;

use crate::agent::AgentCore;
use crate::error::AgencyResult;
use crate::network::AgencyNetwork;
use crate::state::LogEntry;
use crate::storage::AgencyStorage;
use crate::LogIndex;

/// The envelope returned by a long poll.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PollResult {
    /// First index covered by `log`, 0 for an empty envelope.
    pub first_index: LogIndex,
    pub commit_index: LogIndex,
    /// Log entries in `[first_index, commit_index]`.
    pub log: Vec<LogEntry>,
    /// Full committed-store snapshot, present when the requested index lies
    /// below the first retained entry (or was 0).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub read_db: Option<Value>,
}

impl PollResult {
    fn empty(commit_index: LogIndex) -> Self {
        Self {
            first_index: 0,
            commit_index,
            log: Vec::new(),
            read_db: None,
        }
    }
}

/// One parked long-poll request.
pub(super) struct PollPromise {
    pub start_index: LogIndex,
    pub deadline: Instant,
    pub tx: oneshot::Sender<AgencyResult<PollResult>>,
}

impl<N: AgencyNetwork, S: AgencyStorage> AgentCore<N, S> {
    /// Serve or park a poll request. Leader-only.
    pub(super) fn handle_poll(
        &mut self,
        index: LogIndex,
        timeout: Duration,
        tx: oneshot::Sender<AgencyResult<PollResult>>,
    ) {
        if !(self.role.is_leader() && self.serving) {
            let _ = tx.send(self.not_leader());
            return;
        }

        if index == 0 || index < self.state.first_index() {
            // The log no longer reaches back that far: answer with the
            // full committed store instead.
            let _ = tx.send(Ok(PollResult {
                first_index: self.state.first_index(),
                commit_index: self.commit_index,
                log: Vec::new(),
                read_db: Some(self.read_db.to_value()),
            }));
            return;
        }

        if index <= self.commit_index {
            let (_, log) = self.state.to_poll_result(index, self.commit_index);
            let _ = tx.send(Ok(PollResult {
                first_index: log.first().map(|e| e.index).unwrap_or(0),
                commit_index: self.commit_index,
                log,
                read_db: None,
            }));
            return;
        }

        let id = self.next_promise_id;
        self.next_promise_id += 1;
        self.poll_promises.insert(id, PollPromise {
            start_index: index,
            deadline: Instant::now() + timeout,
            tx,
        });
        if self.lowest_promise == 0 || index < self.lowest_promise {
            self.lowest_promise = index;
        }
    }

    /// The earliest promise deadline, or far future when none is parked.
    pub(super) fn next_poll_deadline(&self) -> Instant {
        self.poll_promises
            .values()
            .map(|p| p.deadline)
            .min()
            .unwrap_or_else(|| Instant::now() + Duration::from_secs(3600))
    }

    /// Wake every promise whose start index is covered by the new commit
    /// frontier. Called on each commit advance.
    pub(super) fn wake_poll_promises(&mut self) {
        if self.poll_promises.is_empty() || self.commit_index < self.lowest_promise {
            return;
        }
        let commit = self.commit_index;
        let ready: Vec<u64> = self
            .poll_promises
            .iter()
            .filter(|(_, p)| p.start_index <= commit)
            .map(|(id, _)| *id)
            .collect();
        for id in ready {
            if let Some(promise) = self.poll_promises.remove(&id) {
                let (_, log) = self.state.to_poll_result(promise.start_index, commit);
                let _ = promise.tx.send(Ok(PollResult {
                    first_index: log.first().map(|e| e.index).unwrap_or(0),
                    commit_index: commit,
                    log,
                    read_db: None,
                }));
            }
        }
        self.recompute_lowest_promise();
    }

    /// Expire promises past their deadline with an empty envelope.
    pub(super) fn expire_poll_promises(&mut self) {
        let now = Instant::now();
        let commit = self.commit_index;
        let expired: Vec<u64> = self
            .poll_promises
            .iter()
            .filter(|(_, p)| p.deadline <= now)
            .map(|(id, _)| *id)
            .collect();
        for id in expired {
            if let Some(promise) = self.poll_promises.remove(&id) {
                let _ = promise.tx.send(Ok(PollResult::empty(commit)));
            }
        }
        self.recompute_lowest_promise();
    }

    /// Resignation wakes every parked promise with an empty envelope.
    pub(super) fn resign_poll_promises(&mut self) {
        let commit = self.commit_index;
        for (_, promise) in std::mem::take(&mut self.poll_promises) {
            let _ = promise.tx.send(Ok(PollResult::empty(commit)));
        }
        self.lowest_promise = 0;
    }

    fn recompute_lowest_promise(&mut self) {
        self.lowest_promise = self.poll_promises.values().map(|p| p.start_index).min().unwrap_or(0);
    }
}
