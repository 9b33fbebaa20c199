//! Fixtures for testing the agency.

#![allow(dead_code)]

use std::collections::BTreeMap;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use anyhow::anyhow;
use anyhow::Result;
use async_trait::async_trait;
use serde_json::json;
use serde_json::Value;
use tokio::sync::RwLock;
use tokio::time::sleep;
use tokio::time::timeout;
use tracing_subscriber::prelude::*;

use meridian_agency::agent::Agent;
use meridian_agency::comm::AgencyTransport;
use meridian_agency::comm::TransportError;
use meridian_agency::comm::TransportResponse;
use meridian_agency::comm::API_INQUIRE;
use meridian_agency::comm::API_READ;
use meridian_agency::comm::API_WRITE;
use meridian_agency::config::ClusterConfig;
use meridian_agency::config::Config;
use meridian_agency::error::AgencyError;
use meridian_agency::network::AgencyNetwork;
use meridian_agency::network::AppendEntriesRequest;
use meridian_agency::network::AppendEntriesResponse;
use meridian_agency::network::GossipRequest;
use meridian_agency::network::GossipResponse;
use meridian_agency::network::VoteRequest;
use meridian_agency::network::VoteResponse;
use meridian_agency::store::WriteTransaction;
use meridian_agency::AgentId;
use meridian_memstore::MemStorage;

/// Initialize the tracing system.
pub fn init_tracing() {
    let fmt_layer = tracing_subscriber::fmt::Layer::default().with_ansi(false);
    let subscriber = tracing_subscriber::Registry::default()
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .with(fmt_layer);
    let _ = tracing::subscriber::set_global_default(subscriber);
}

/// A fast-paced configuration for in-process clusters.
pub fn test_config(id: &str) -> Config {
    let mut config = Config::new(id, endpoint_of(id));
    config.min_ping = 0.2;
    config.max_ping = 0.5;
    config.timeout_mult = 1;
    config
}

pub fn endpoint_of(id: &str) -> String {
    format!("tcp://{}", id)
}

struct Registered {
    agent: Agent,
    storage: Arc<MemStorage>,
}

/// An in-process network of agents: implements the peer RPC trait and the
/// client transport trait, with node isolation and reply dropping.
pub struct AgencyRouter {
    table: RwLock<BTreeMap<AgentId, Registered>>,
    /// Nodes which can neither send nor receive.
    isolated: RwLock<HashSet<AgentId>>,
    /// Endpoints whose next client reply gets dropped (request still
    /// executes server-side).
    drop_next_reply: RwLock<HashSet<String>>,
}

impl AgencyRouter {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            table: RwLock::new(BTreeMap::new()),
            isolated: RwLock::new(HashSet::new()),
            drop_next_reply: RwLock::new(HashSet::new()),
        })
    }

    /// Spawn a full cluster over this router. All members know the
    /// complete pool from the start.
    pub async fn new_cluster(self: &Arc<Self>, ids: &[&str]) -> Vec<Agent> {
        self.new_cluster_with(ids, |_| {}).await
    }

    pub async fn new_cluster_with(
        self: &Arc<Self>,
        ids: &[&str],
        tweak: impl Fn(&mut Config),
    ) -> Vec<Agent> {
        let pool: BTreeMap<AgentId, String> =
            ids.iter().map(|id| (id.to_string(), endpoint_of(id))).collect();
        let active: Vec<AgentId> = ids.iter().map(|id| id.to_string()).collect();

        let mut agents = Vec::with_capacity(ids.len());
        for id in ids {
            let mut config = test_config(id);
            config.size = ids.len();
            tweak(&mut config);
            let config = Arc::new(config.validate().expect("invalid test config"));
            let cluster = ClusterConfig::new(active.clone(), pool.clone(), config.timeout_mult);
            let storage = Arc::new(MemStorage::new());
            let agent = Agent::new(config, cluster, self.clone(), storage.clone());
            self.table.write().await.insert(id.to_string(), Registered {
                agent: agent.clone(),
                storage,
            });
            agents.push(agent);
        }
        agents
    }

    pub async fn agent(&self, id: &str) -> Agent {
        self.table.read().await.get(id).expect("agent not registered").agent.clone()
    }

    pub async fn storage(&self, id: &str) -> Arc<MemStorage> {
        self.table.read().await.get(id).expect("agent not registered").storage.clone()
    }

    /// Isolate a node from all traffic.
    pub async fn isolate(&self, id: &str) {
        tracing::info!(id, "--- isolating node");
        self.isolated.write().await.insert(id.to_string());
    }

    /// Restore a node's network.
    pub async fn restore(&self, id: &str) {
        tracing::info!(id, "--- restoring node");
        self.isolated.write().await.remove(id);
    }

    /// Drop the next client reply from the given endpoint.
    pub async fn drop_next_reply_from(&self, endpoint: &str) {
        self.drop_next_reply.write().await.insert(endpoint.to_string());
    }

    async fn is_isolated(&self, id: &str) -> bool {
        self.isolated.read().await.contains(id)
    }

    /// The current serving leader, ignoring isolated nodes.
    pub async fn serving_leader(&self) -> Option<Agent> {
        let isolated = self.isolated.read().await;
        let table = self.table.read().await;
        for (id, reg) in table.iter() {
            if isolated.contains(id) {
                continue;
            }
            if reg.agent.leading() {
                return Some(reg.agent.clone());
            }
        }
        None
    }

    /// Wait until some non-isolated node is a serving leader.
    pub async fn wait_for_serving_leader(&self, wait: Duration) -> Result<Agent> {
        let res = timeout(wait, async {
            loop {
                if let Some(agent) = self.serving_leader().await {
                    return agent;
                }
                sleep(Duration::from_millis(25)).await;
            }
        })
        .await;
        res.map_err(|_| anyhow!("no serving leader within {:?}", wait))
    }

    /// Assert exactly one non-isolated node claims serving leadership.
    pub async fn assert_single_leader(&self) {
        let isolated = self.isolated.read().await;
        let table = self.table.read().await;
        let leaders: Vec<&AgentId> = table
            .iter()
            .filter(|(id, reg)| !isolated.contains(*id) && reg.agent.leading())
            .map(|(id, _)| id)
            .collect();
        assert_eq!(leaders.len(), 1, "expected exactly one leader, got {:?}", leaders);
    }

    /// Convenience write of a single key on the given agent.
    pub async fn write_kv(&self, agent: &Agent, path: &str, value: Value) -> Result<u64> {
        let res = agent.write(vec![WriteTransaction::single_set(path, value)]).await?;
        Ok(res.max_index)
    }

    /// Convenience point read on the given agent.
    pub async fn read_kv(&self, agent: &Agent, path: &str) -> Result<Option<Value>> {
        let mut results = agent.read(vec![vec![path.to_string()]]).await?;
        let result = results.pop().ok_or_else(|| anyhow!("empty read result"))?;
        if !result.success {
            return Ok(None);
        }
        // Unwrap the nested segments down to the requested value.
        let mut node = result.value;
        for seg in path.split('/').filter(|s| !s.is_empty()) {
            node = match node {
                Value::Object(mut obj) => obj.remove(seg).unwrap_or(Value::Null),
                _ => return Ok(None),
            };
        }
        Ok(Some(node))
    }
}

#[async_trait]
impl AgencyNetwork for AgencyRouter {
    async fn append_entries(&self, target: &AgentId, rpc: AppendEntriesRequest) -> Result<AppendEntriesResponse> {
        if self.is_isolated(target).await || self.is_isolated(&rpc.leader_id).await {
            return Err(anyhow!("node is isolated"));
        }
        let agent = {
            let table = self.table.read().await;
            table.get(target).ok_or_else(|| anyhow!("unknown target {}", target))?.agent.clone()
        };
        agent.append_entries(rpc).await.map_err(|e| anyhow!(e.to_string()))
    }

    async fn request_vote(&self, target: &AgentId, rpc: VoteRequest) -> Result<VoteResponse> {
        if self.is_isolated(target).await || self.is_isolated(&rpc.candidate_id).await {
            return Err(anyhow!("node is isolated"));
        }
        let agent = {
            let table = self.table.read().await;
            table.get(target).ok_or_else(|| anyhow!("unknown target {}", target))?.agent.clone()
        };
        agent.request_vote(rpc).await.map_err(|e| anyhow!(e.to_string()))
    }

    async fn gossip(&self, target: &AgentId, rpc: GossipRequest) -> Result<GossipResponse> {
        if self.is_isolated(target).await || self.is_isolated(&rpc.id).await {
            return Err(anyhow!("node is isolated"));
        }
        let agent = {
            let table = self.table.read().await;
            table.get(target).ok_or_else(|| anyhow!("unknown target {}", target))?.agent.clone()
        };
        agent.gossip(rpc).await.map_err(|e| anyhow!(e.to_string()))
    }
}

#[async_trait]
impl AgencyTransport for AgencyRouter {
    async fn request(
        &self,
        endpoint: &str,
        path: &str,
        body: Value,
        _timeout: Duration,
    ) -> Result<TransportResponse, TransportError> {
        let id = endpoint.strip_prefix("tcp://").unwrap_or(endpoint).to_string();
        if self.is_isolated(&id).await {
            return Err(TransportError::Connection("node is isolated".into()));
        }
        let agent = {
            let table = self.table.read().await;
            match table.get(&id) {
                Some(reg) => reg.agent.clone(),
                None => return Err(TransportError::Connection(format!("unknown endpoint {}", endpoint))),
            }
        };

        let result = route_client_request(&agent, path, body).await;

        // Reply dropping simulates a lost response after the server-side
        // effect happened.
        if self.drop_next_reply.write().await.remove(endpoint) {
            tracing::info!(endpoint, "--- dropping client reply");
            return Err(TransportError::Timeout);
        }
        result
    }
}

async fn route_client_request(
    agent: &Agent,
    path: &str,
    body: Value,
) -> Result<TransportResponse, TransportError> {
    let not_leader = |leader: Option<AgentId>| TransportResponse {
        status: 503,
        leader_hint: leader.map(|l| endpoint_of(&l)),
        redirect: None,
        body: Value::Null,
    };
    let ok = |body: Value| TransportResponse {
        status: 200,
        leader_hint: None,
        redirect: None,
        body,
    };

    match path {
        API_READ => {
            let queries: Vec<Vec<String>> = serde_json::from_value(body)
                .map_err(|e| TransportError::Connection(e.to_string()))?;
            match agent.read(queries).await {
                Ok(results) => Ok(ok(serde_json::to_value(results).unwrap_or(Value::Null))),
                Err(AgencyError::NotLeader { leader }) => Ok(not_leader(leader)),
                Err(e) => Err(TransportError::Connection(e.to_string())),
            }
        }
        API_WRITE => {
            let raw = body.as_array().cloned().unwrap_or_default();
            let mut trxs = Vec::with_capacity(raw.len());
            for v in &raw {
                trxs.push(
                    WriteTransaction::from_value(v).map_err(|e| TransportError::Connection(e.to_string()))?,
                );
            }
            match agent.write(trxs).await {
                Ok(res) => Ok(ok(json!({
                    "results": res.indexes,
                    "applied": res.applied,
                    "maxIndex": res.max_index,
                }))),
                Err(AgencyError::NotLeader { leader }) => Ok(not_leader(leader)),
                Err(AgencyError::Timeout) => Err(TransportError::Timeout),
                Err(e) => Err(TransportError::Connection(e.to_string())),
            }
        }
        API_INQUIRE => {
            let client_ids: Vec<String> = serde_json::from_value(body)
                .map_err(|e| TransportError::Connection(e.to_string()))?;
            match agent.inquire(client_ids).await {
                Ok(res) => Ok(ok(serde_json::to_value(res).unwrap_or(Value::Null))),
                Err(e) => Err(TransportError::Connection(e.to_string())),
            }
        }
        other => Err(TransportError::Connection(format!("unrouted path {}", other))),
    }
}
