//! Metrics reported by a running agent, and a helper to wait on them.
//!
//! Every agent publishes an [`AgentMetrics`] snapshot through a watch
//! channel whenever something observable changes. Tests and callers use
//! [`Wait`] to block until the metrics satisfy a predicate.

use std::time::Duration;

use serde::Deserialize;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::watch;
use tokio::time::timeout;

use crate::AgentId;
use crate::LogIndex;
use crate::Role;
use crate::Term;

/// A snapshot of an agent's observable state.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentMetrics {
    pub id: AgentId,
    pub role: Role,
    pub term: Term,
    pub last_log_index: LogIndex,
    pub commit_index: LogIndex,
    /// The leader this agent currently believes in, if any.
    pub leader: Option<AgentId>,
    /// True on a leader which has committed its reconfiguration entry and
    /// commenced service.
    pub serving: bool,
    /// Index covered by the last compaction snapshot.
    pub last_compaction_at: LogIndex,
}

impl AgentMetrics {
    pub fn new_initial(id: AgentId) -> Self {
        Self {
            id,
            role: Role::Follower,
            term: 0,
            last_log_index: 0,
            commit_index: 0,
            leader: None,
            serving: false,
            last_compaction_at: 0,
        }
    }
}

/// Error returned when a [`Wait`] condition is not reached in time.
#[derive(Debug, Error)]
#[error("timeout after {timeout:?} waiting for {msg}: latest {latest:?}")]
pub struct WaitTimeout {
    pub timeout: Duration,
    pub msg: String,
    pub latest: AgentMetrics,
}

/// Waits for metrics to satisfy a condition, with a timeout.
pub struct Wait {
    pub timeout: Duration,
    pub rx: watch::Receiver<AgentMetrics>,
}

impl Wait {
    /// Block until the metrics satisfy `func`, or time out.
    #[tracing::instrument(level = "debug", skip(self, func), fields(msg = msg))]
    pub async fn metrics<T>(&self, func: T, msg: &str) -> Result<AgentMetrics, WaitTimeout>
    where T: Fn(&AgentMetrics) -> bool + Send {
        let mut rx = self.rx.clone();
        loop {
            let latest = rx.borrow().clone();
            if func(&latest) {
                tracing::debug!("wait condition satisfied: {}", msg);
                return Ok(latest);
            }

            let delta = timeout(self.timeout, rx.changed()).await;
            match delta {
                Ok(Ok(())) => continue,
                // Channel closed: the agent is gone, report the timeout shape.
                Ok(Err(_)) | Err(_) => {
                    return Err(WaitTimeout {
                        timeout: self.timeout,
                        msg: msg.to_string(),
                        latest: rx.borrow().clone(),
                    });
                }
            }
        }
    }

    /// Wait for `commit_index >= index`.
    pub async fn commit(&self, index: LogIndex, msg: &str) -> Result<AgentMetrics, WaitTimeout> {
        self.metrics(|m| m.commit_index >= index, msg).await
    }

    /// Wait for `last_log_index >= index`.
    pub async fn log(&self, index: LogIndex, msg: &str) -> Result<AgentMetrics, WaitTimeout> {
        self.metrics(|m| m.last_log_index >= index, msg).await
    }

    /// Wait for the agent to assume the given role.
    pub async fn role(&self, role: Role, msg: &str) -> Result<AgentMetrics, WaitTimeout> {
        self.metrics(|m| m.role == role, msg).await
    }

    /// Wait for a leader which has commenced service.
    pub async fn serving(&self, msg: &str) -> Result<AgentMetrics, WaitTimeout> {
        self.metrics(|m| m.serving, msg).await
    }

    /// Wait until the agent believes in the given leader.
    pub async fn leader(&self, id: &str, msg: &str) -> Result<AgentMetrics, WaitTimeout> {
        let id = id.to_string();
        self.metrics(move |m| m.leader.as_deref() == Some(id.as_str()), msg).await
    }
}
