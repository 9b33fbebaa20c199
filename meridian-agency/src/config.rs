//! Agent runtime configuration and the replicated cluster configuration.

use std::collections::BTreeMap;

use rand::thread_rng;
use rand::Rng;
use serde::Deserialize;
use serde::Serialize;
use thiserror::Error;

use crate::AgentId;
use crate::Term;

/// Errors from configuration validation.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Per-process runtime configuration of an agent.
///
/// `min_ping`/`max_ping` are in seconds; the election timeout is drawn
/// uniformly from `[min_ping * timeout_mult, max_ping * timeout_mult]`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Config {
    /// This agent's id.
    pub id: AgentId,
    /// This agent's advertised endpoint.
    pub endpoint: String,
    /// The configured size of the active (voting) set.
    pub size: usize,
    /// Lower bound of the heartbeat/election window, in seconds.
    pub min_ping: f64,
    /// Upper bound of the heartbeat/election window, in seconds.
    pub max_ping: f64,
    /// Multiplier applied to both ping bounds, for slow deployments.
    pub timeout_mult: u64,
    /// Maximum number of log entries shipped in one append-entries package.
    pub max_append_size: u64,
    /// Run the supervision loop on the leader.
    pub supervision: bool,
    /// Supervision pass frequency, in seconds.
    pub supervision_frequency: f64,
    /// Grace period before a job may act on a freshly observed failure.
    pub supervision_grace_period: f64,
    /// Compact the log every this many committed entries.
    pub compaction_step: u64,
    /// Number of trailing active entries preserved by a compaction.
    pub compaction_keep_size: u64,
}

impl Config {
    /// A configuration with the defaults used by a small deployment.
    pub fn new(id: impl Into<AgentId>, endpoint: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            endpoint: endpoint.into(),
            size: 1,
            min_ping: 1.0,
            max_ping: 5.0,
            timeout_mult: 1,
            max_append_size: 100,
            supervision: false,
            supervision_frequency: 1.0,
            supervision_grace_period: 10.0,
            compaction_step: 1000,
            compaction_keep_size: 500,
        }
    }

    /// Validate bounds. Returns the config for chaining.
    pub fn validate(self) -> Result<Self, ConfigError> {
        if self.id.is_empty() {
            return Err(ConfigError::Invalid("agent id must not be empty".into()));
        }
        if self.size == 0 {
            return Err(ConfigError::Invalid("active set size must be positive".into()));
        }
        if !(self.min_ping > 0.0 && self.max_ping >= self.min_ping) {
            return Err(ConfigError::Invalid(format!(
                "ping bounds out of order: min {} max {}",
                self.min_ping, self.max_ping
            )));
        }
        if self.timeout_mult == 0 {
            return Err(ConfigError::Invalid("timeout multiplier must be positive".into()));
        }
        if self.max_append_size == 0 {
            return Err(ConfigError::Invalid("max append size must be positive".into()));
        }
        if self.compaction_keep_size >= self.compaction_step {
            return Err(ConfigError::Invalid(
                "compaction keep size must be below the compaction step".into(),
            ));
        }
        Ok(self)
    }

    /// Draw a new randomized election timeout, in milliseconds.
    pub fn new_rand_election_timeout(&self) -> u64 {
        let low = (self.min_ping * 1000.0) as u64 * self.timeout_mult;
        let high = (self.max_ping * 1000.0) as u64 * self.timeout_mult;
        thread_rng().gen_range(low..=high)
    }

    /// The heartbeat send interval, in milliseconds.
    pub fn heartbeat_interval_ms(&self) -> u64 {
        ((self.min_ping * 1000.0) as u64 * self.timeout_mult / 2).max(10)
    }

    /// The grace window after which a peer counts as unresponsive when
    /// challenging our own leadership.
    pub fn leadership_grace_ms(&self) -> u64 {
        (self.max_ping * 1000.0) as u64 * self.timeout_mult
    }
}

/// Outcome of merging one gossiped pool entry.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MergeOutcome {
    /// The entry was already known with the same endpoint.
    Unchanged,
    /// The entry was new and has been adopted.
    Changed,
    /// The entry conflicts with a known id/endpoint pairing.
    Wrong,
}

/// The replicated part of the configuration: who is in the pool and which
/// subset votes. Only the leader mutates this, and always through a
/// committed reconfiguration entry.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterConfig {
    /// Ordered voting members. `active.len() == size` once assembled.
    pub active: Vec<AgentId>,
    /// All known members, id to endpoint. A superset of `active`.
    pub pool: BTreeMap<AgentId, String>,
    /// The configured number of voting members.
    pub size: usize,
    /// Replicated timeout multiplier.
    pub timeout_mult: u64,
}

impl ClusterConfig {
    pub fn new(active: Vec<AgentId>, pool: BTreeMap<AgentId, String>, timeout_mult: u64) -> Self {
        let size = active.len();
        Self {
            active,
            pool,
            size,
            timeout_mult,
        }
    }

    /// Whether the pool has been fully assembled.
    pub fn pool_complete(&self) -> bool {
        self.pool.len() >= self.size && self.active.len() == self.size
    }

    pub fn is_active(&self, id: &str) -> bool {
        self.active.iter().any(|a| a == id)
    }

    pub fn endpoint_of(&self, id: &str) -> Option<&String> {
        self.pool.get(id)
    }

    /// Merge a single proposed pool entry.
    pub fn merge_entry(&mut self, id: &str, endpoint: &str) -> MergeOutcome {
        match self.pool.get(id) {
            Some(known) if known == endpoint => MergeOutcome::Unchanged,
            Some(_) => MergeOutcome::Wrong,
            None => {
                self.pool.insert(id.to_string(), endpoint.to_string());
                MergeOutcome::Changed
            }
        }
    }

    /// Merge a whole proposed pool. Returns the worst verdict observed;
    /// `Wrong` aborts the merge at the offending entry.
    pub fn merge_pool(&mut self, proposed: &BTreeMap<AgentId, String>) -> MergeOutcome {
        let mut outcome = MergeOutcome::Unchanged;
        for (id, endpoint) in proposed {
            match self.merge_entry(id, endpoint) {
                MergeOutcome::Unchanged => {}
                MergeOutcome::Changed => outcome = MergeOutcome::Changed,
                MergeOutcome::Wrong => return MergeOutcome::Wrong,
            }
        }
        outcome
    }

    /// Fill the active set from the pool once enough members are known.
    /// No-op while the pool is still short or the set is already complete.
    pub fn try_activate(&mut self) {
        if self.active.len() == self.size || self.pool.len() < self.size {
            return;
        }
        self.active = self.pool.keys().take(self.size).cloned().collect();
    }
}

/// The payload of a reconfiguration log entry.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Reconfiguration {
    pub term: Term,
    pub id: AgentId,
    pub active: Vec<AgentId>,
    pub pool: BTreeMap<AgentId, String>,
    pub size: usize,
    pub timeout_mult: u64,
}

#[cfg(test)]
mod tests {
    use maplit::btreemap;

    use super::*;

    #[test]
    fn validate_rejects_bad_bounds() {
        let mut c = Config::new("A", "tcp://a");
        c.min_ping = 5.0;
        c.max_ping = 1.0;
        assert!(c.validate().is_err());

        let mut c = Config::new("A", "tcp://a");
        c.compaction_step = 10;
        c.compaction_keep_size = 10;
        assert!(c.validate().is_err());
    }

    #[test]
    fn election_timeout_stays_in_window() {
        let c = Config::new("A", "tcp://a").validate().unwrap();
        for _ in 0..64 {
            let t = c.new_rand_election_timeout();
            assert!((1000..=5000).contains(&t), "timeout {} out of window", t);
        }
    }

    #[test]
    fn pool_merge_verdicts() {
        let mut cfg = ClusterConfig::new(
            vec!["A".into()],
            btreemap! {"A".to_string() => "tcp://a".to_string()},
            1,
        );

        assert_eq!(cfg.merge_entry("A", "tcp://a"), MergeOutcome::Unchanged);
        assert_eq!(cfg.merge_entry("B", "tcp://b"), MergeOutcome::Changed);
        assert_eq!(cfg.merge_entry("A", "tcp://elsewhere"), MergeOutcome::Wrong);

        let proposed = btreemap! {
            "B".to_string() => "tcp://b".to_string(),
            "C".to_string() => "tcp://c".to_string(),
        };
        assert_eq!(cfg.merge_pool(&proposed), MergeOutcome::Changed);
        assert_eq!(cfg.pool.len(), 3);
    }

    #[test]
    fn activation_waits_for_full_pool() {
        let mut cfg = ClusterConfig {
            active: vec![],
            pool: btreemap! {"A".to_string() => "tcp://a".to_string()},
            size: 3,
            timeout_mult: 1,
        };
        cfg.try_activate();
        assert!(cfg.active.is_empty());

        cfg.merge_entry("B", "tcp://b");
        cfg.merge_entry("C", "tcp://c");
        cfg.try_activate();
        assert_eq!(cfg.active.len(), 3);
        assert!(cfg.pool_complete());
    }
}
