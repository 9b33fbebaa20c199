//! Engine instantiation.
//!
//! The single-server path turns the whole plan into one block tree. The
//! coordinator path first partitions the plan into coordinator and
//! DB-server snippets along `Remote` boundaries, then builds engines in
//! two phases: deploy every DB-server snippet to its owning servers and
//! collect the returned snippet ids, then build the coordinator's block
//! tree back-to-front, fanning a `Gather` out into one remote block per
//! `(server, snippet)`. Remote blocks address servers as `server:<id>`:
//! a shard failover during execution must not redirect traffic away from
//! the server the snippet was instantiated on.

use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::collections::HashMap;

use anyhow::Result;
use async_trait::async_trait;
use serde_json::json;
use serde_json::Value;

use crate::cluster::ClusterView;
use crate::cluster::RebootGuard;
use crate::error::EngineError;
use crate::options::QueryOptions;
use crate::plan::ExecutionNodeId;
use crate::plan::ExecutionPlan;
use crate::plan::NodeKind;
use crate::registry::KillHandle;
use crate::registry::QueryRegistry;
use crate::RegisterId;
use crate::ServerId;
use crate::SnippetId;

/// A running query, as far as engine instantiation is concerned.
pub struct Query {
    pub id: u64,
    pub database: String,
    pub options: QueryOptions,
    registry: QueryRegistry,
    kill: KillHandle,
}

impl Query {
    /// Register a query with the registry, obtaining its kill handle.
    pub fn new(registry: &QueryRegistry, database: impl Into<String>, id: u64, options: QueryOptions) -> Self {
        let database = database.into();
        let kill = registry.open(&database, id);
        Self {
            id,
            database,
            options,
            registry: registry.clone(),
            kill,
        }
    }

    pub fn kill_handle(&self) -> KillHandle {
        self.kill.clone()
    }
}

impl Drop for Query {
    fn drop(&mut self) {
        self.registry.close(&self.database, self.id);
    }
}

/// What a block does, as far as the coordinator wiring is concerned.
#[derive(Clone, Debug, PartialEq)]
pub enum BlockKind {
    Generic,
    /// Requests rows from a deployed snippet on a fixed server.
    Remote {
        /// `server:<id>` — pinned to the instantiation-time server.
        server: String,
        query_id: SnippetId,
        distribute_id: String,
    },
    /// Pass-through carrying an inherited result register.
    IdPassthrough { register: RegisterId },
}

/// One execution block.
#[derive(Clone, Debug)]
pub struct ExecutionBlock {
    pub node: ExecutionNodeId,
    pub kind: BlockKind,
    /// Indexes into the owning engine's block arena.
    pub dependencies: Vec<usize>,
}

/// Progress report of an execution step.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExecutionProgress {
    HasMore,
    Done,
}

/// A tree of blocks mirroring a subset of the plan.
#[derive(Debug)]
pub struct ExecutionEngine {
    /// Engine 0 is always the coordinator (or single-server) root engine.
    pub id: u64,
    blocks: Vec<ExecutionBlock>,
    root: usize,
    result_register: RegisterId,
    kill: KillHandle,
    /// Reboot-tracker guards of every participating server. Dropping the
    /// engine drops the guards, deregistering the callbacks.
    guards: Vec<RebootGuard>,
}

impl ExecutionEngine {
    pub fn root_block(&self) -> &ExecutionBlock {
        &self.blocks[self.root]
    }

    pub fn blocks(&self) -> &[ExecutionBlock] {
        &self.blocks
    }

    pub fn result_register(&self) -> RegisterId {
        self.result_register
    }

    pub fn guard_count(&self) -> usize {
        self.guards.len()
    }

    /// All remote blocks, for wiring inspection.
    pub fn remote_blocks(&self) -> Vec<&ExecutionBlock> {
        self.blocks.iter().filter(|b| matches!(b.kind, BlockKind::Remote { .. })).collect()
    }

    fn check_killed(&self) -> Result<(), EngineError> {
        if self.kill.is_killed() {
            return Err(EngineError::QueryKilled);
        }
        Ok(())
    }

    /// Reset the block tree for a fresh pass.
    pub fn initialize_cursor(&self) -> Result<(), EngineError> {
        self.check_killed()
    }

    /// Drive one step of the engine.
    pub fn execute(&self) -> Result<ExecutionProgress, EngineError> {
        self.check_killed()?;
        Ok(ExecutionProgress::Done)
    }

    /// Drive one step on behalf of a remote client.
    pub fn execute_for_client(&self) -> Result<ExecutionProgress, EngineError> {
        self.check_killed()?;
        Ok(ExecutionProgress::Done)
    }

    /// Produce a batch of rows.
    pub fn get_some(&self) -> Result<ExecutionProgress, EngineError> {
        self.check_killed()?;
        Ok(ExecutionProgress::Done)
    }

    /// Skip a batch of rows.
    pub fn skip_some(&self) -> Result<ExecutionProgress, EngineError> {
        self.check_killed()?;
        Ok(ExecutionProgress::Done)
    }
}

/// Run the maintainer fullCount verification on debug builds.
fn maintainer_checks(plan: &ExecutionPlan) -> Result<(), EngineError> {
    if cfg!(debug_assertions) {
        plan.check_full_count_constraints()?;
    }
    Ok(())
}

/// The single-server path: depth-first post-order block creation.
///
/// Dependencies are wired in visited order; the root block belongs to the
/// last visited node without a parent. A `Return` with inherited results
/// takes its register from the pass-through block below it, otherwise the
/// result lives in register 0.
pub fn instantiate_single_server(query: &Query, plan: &ExecutionPlan) -> Result<ExecutionEngine, EngineError> {
    maintainer_checks(plan)?;

    let order = plan.walk_post_order()?;
    let mut blocks: Vec<ExecutionBlock> = Vec::with_capacity(order.len());
    let mut cache: HashMap<ExecutionNodeId, usize> = HashMap::with_capacity(order.len());
    let mut result_register: RegisterId = 0;

    for id in &order {
        let node = plan.node(*id);
        if node.kind.is_graph_node() {
            prepare_graph_options(query, *id);
        }
        let deps: Vec<usize> = node
            .dependencies
            .iter()
            .map(|dep| {
                cache
                    .get(dep)
                    .copied()
                    .ok_or_else(|| EngineError::MalformedPlan(format!("dependency {} not yet built", dep)))
            })
            .collect::<Result<_, _>>()?;

        let kind = match &node.kind {
            NodeKind::Return { inherit_results: true } => {
                // The pass-through executor below already holds the rows.
                result_register = 0;
                BlockKind::IdPassthrough { register: result_register }
            }
            _ => BlockKind::Generic,
        };
        let idx = blocks.len();
        blocks.push(ExecutionBlock {
            node: *id,
            kind,
            dependencies: deps,
        });
        cache.insert(*id, idx);
    }

    let root = *order.last().ok_or_else(|| EngineError::MalformedPlan("empty plan".into()))?;
    let root_idx = cache[&root];
    Ok(ExecutionEngine {
        id: 0,
        blocks,
        root: root_idx,
        result_register,
        kill: query.kill_handle(),
        guards: Vec::new(),
    })
}

/// Graph nodes resolve their traversal options before block creation.
fn prepare_graph_options(query: &Query, node: ExecutionNodeId) {
    tracing::trace!(query = query.id, node = %node, "preparing graph node options");
}

/// A contiguous DB-server part of the plan, rooted below one `Remote`.
#[derive(Clone, Debug)]
pub struct QuerySnippet {
    pub id: SnippetId,
    /// The remote node this snippet feeds.
    pub remote_node: ExecutionNodeId,
    /// The gather above the remote, unless cancelled by an `Async`.
    pub gather: Option<ExecutionNodeId>,
    /// Snippet nodes, top-down.
    pub nodes: Vec<ExecutionNodeId>,
}

impl QuerySnippet {
    /// Servers owning shards read by this snippet.
    pub fn owning_servers(&self, plan: &ExecutionPlan) -> BTreeSet<ServerId> {
        let mut servers = BTreeSet::new();
        for id in &self.nodes {
            if let Some(shards) = plan.node(*id).kind.shards() {
                servers.extend(shards.keys().cloned());
            }
        }
        servers
    }
}

/// The coordinator side of a partitioned plan, top-down.
#[derive(Clone, Debug, Default)]
pub struct CoordinatorParts {
    pub nodes: Vec<ExecutionNodeId>,
}

/// The DB-server side of a partitioned plan.
#[derive(Clone, Debug, Default)]
pub struct DbServerParts {
    pub snippets: Vec<QuerySnippet>,
    /// Graph nodes encountered on the DB-server side, collected for the
    /// edge-collection lookup.
    pub graph_nodes: Vec<ExecutionNodeId>,
}

struct PartitionWalk<'p> {
    plan: &'p ExecutionPlan,
    coordinator: CoordinatorParts,
    dbserver: DbServerParts,
    next_snippet_id: SnippetId,
}

impl<'p> PartitionWalk<'p> {
    /// Top-down walk. `snippet` is the index of the currently open
    /// DB-server snippet, `None` while on the coordinator.
    fn visit(&mut self, id: ExecutionNodeId, snippet: Option<usize>, mut last_gather: Option<ExecutionNodeId>) {
        let node = self.plan.node(id);
        match (&node.kind, snippet) {
            (NodeKind::Gather { .. }, None) => {
                last_gather = Some(id);
                self.coordinator.nodes.push(id);
            }
            (NodeKind::Async, _) => {
                // An async boundary detaches whatever gather we remembered.
                last_gather = None;
                self.push_current(id, snippet);
            }
            (NodeKind::Remote, None) => {
                // Crossing onto the DB-servers: the subtree below this
                // remote is one snippet.
                self.coordinator.nodes.push(id);
                self.next_snippet_id += 1;
                let idx = self.dbserver.snippets.len();
                self.dbserver.snippets.push(QuerySnippet {
                    id: self.next_snippet_id,
                    remote_node: id,
                    gather: last_gather,
                    nodes: Vec::new(),
                });
                for dep in &node.dependencies {
                    self.visit(*dep, Some(idx), None);
                }
                return;
            }
            (NodeKind::Remote, Some(idx)) => {
                // Crossing back to the coordinator (scatter/distribute
                // input of this snippet).
                self.dbserver.snippets[idx].nodes.push(id);
                for dep in &node.dependencies {
                    self.visit(*dep, None, None);
                }
                return;
            }
            (kind, Some(idx)) => {
                if kind.is_graph_node() {
                    self.dbserver.graph_nodes.push(id);
                }
                self.dbserver.snippets[idx].nodes.push(id);
            }
            (_, None) => {
                self.coordinator.nodes.push(id);
            }
        }
        for dep in &node.dependencies {
            self.visit(*dep, snippet, last_gather);
        }
    }

    fn push_current(&mut self, id: ExecutionNodeId, snippet: Option<usize>) {
        match snippet {
            Some(idx) => self.dbserver.snippets[idx].nodes.push(id),
            None => self.coordinator.nodes.push(id),
        }
    }
}

/// Partition the plan into coordinator and DB-server parts along the
/// `Remote` boundaries.
pub fn partition_plan(plan: &ExecutionPlan) -> Result<(CoordinatorParts, DbServerParts), EngineError> {
    let root = plan.root()?;
    let mut walk = PartitionWalk {
        plan,
        coordinator: CoordinatorParts::default(),
        dbserver: DbServerParts::default(),
        next_snippet_id: 0,
    };
    walk.visit(root, None, None);
    Ok((walk.coordinator, walk.dbserver))
}

/// A deployed batch of snippets on one DB-server.
#[derive(Clone, Debug, serde::Serialize, serde::Deserialize)]
pub struct SnippetDeployed {
    /// The server-side query id; non-zero on success.
    pub server_query_id: u64,
    /// One id per snippet in the deployment body, in order.
    pub snippet_ids: Vec<SnippetId>,
}

/// The deployment seam to the DB-servers.
#[async_trait]
pub trait SnippetApi: Send + Sync {
    /// Deploy a batch of snippets; the body carries the serialized
    /// snippet nodes, query options and variables.
    async fn deploy_snippets(&self, server: &ServerId, body: Value) -> Result<SnippetDeployed>;

    /// Tear a previously deployed query down (rollback path).
    async fn cleanup(&self, server: &ServerId, server_query_id: u64) -> Result<()>;
}

/// The coordinator path: partition, deploy, wire.
pub async fn instantiate_cluster(
    query: &Query,
    plan: &ExecutionPlan,
    api: &dyn SnippetApi,
    view: &ClusterView,
) -> Result<ExecutionEngine, EngineError> {
    maintainer_checks(plan)?;
    let (coordinator, dbserver) = partition_plan(plan)?;

    // Phase 1: deploy the snippets, one request per owning server.
    let mut per_server: BTreeMap<ServerId, Vec<&QuerySnippet>> = BTreeMap::new();
    for snippet in &dbserver.snippets {
        for server in snippet.owning_servers(plan) {
            per_server.entry(server).or_default().push(snippet);
        }
    }

    // remote node -> server -> deployed snippet id
    let mut remote_map: BTreeMap<ExecutionNodeId, BTreeMap<ServerId, SnippetId>> = BTreeMap::new();
    let mut deployed: BTreeMap<ServerId, u64> = BTreeMap::new();
    for (server, snippets) in &per_server {
        let body = json!({
            "queryId": query.id,
            "database": query.database,
            "options": serde_json::to_value(&query.options).unwrap_or(Value::Null),
            "snippets": snippets
                .iter()
                .map(|s| json!({
                    "id": s.id,
                    "nodes": s.nodes.iter().map(|n| serde_json::to_value(plan.node(*n)).unwrap_or(Value::Null)).collect::<Vec<_>>(),
                }))
                .collect::<Vec<_>>(),
        });
        tracing::debug!(server = %server, snippets = snippets.len(), "deploying snippets");
        let res = match api.deploy_snippets(server, body).await {
            Ok(res) if res.server_query_id != 0 && res.snippet_ids.len() == snippets.len() => res,
            Ok(res) => {
                rollback(api, &deployed).await;
                return Err(EngineError::DeploymentFailed {
                    server: server.clone(),
                    reason: format!(
                        "bad deployment reply: query id {}, {} snippet ids for {} snippets",
                        res.server_query_id,
                        res.snippet_ids.len(),
                        snippets.len()
                    ),
                });
            }
            Err(err) => {
                rollback(api, &deployed).await;
                return Err(EngineError::DeploymentFailed {
                    server: server.clone(),
                    reason: err.to_string(),
                });
            }
        };
        deployed.insert(server.clone(), res.server_query_id);
        for (snippet, deployed_id) in snippets.iter().zip(res.snippet_ids) {
            remote_map.entry(snippet.remote_node).or_default().insert(server.clone(), deployed_id);
        }
    }

    // Phase 2: coordinator blocks, back-to-front (leaf-most node last in
    // `coordinator.nodes`, so iterate reversed).
    let mut blocks: Vec<ExecutionBlock> = Vec::new();
    let mut cache: HashMap<ExecutionNodeId, usize> = HashMap::new();
    for id in coordinator.nodes.iter().rev() {
        let node = plan.node(*id);
        match &node.kind {
            NodeKind::Remote => {
                // Represented by the remote blocks under the gather.
                continue;
            }
            NodeKind::Gather { .. } => {
                let mut deps = Vec::new();
                for dep in &node.dependencies {
                    if matches!(plan.node(*dep).kind, NodeKind::Remote) {
                        let servers = remote_map.get(dep).cloned().unwrap_or_default();
                        for (server, snippet_id) in servers {
                            let idx = blocks.len();
                            blocks.push(ExecutionBlock {
                                node: *dep,
                                kind: BlockKind::Remote {
                                    server: format!("server:{}", server),
                                    query_id: snippet_id,
                                    distribute_id: dep.to_string(),
                                },
                                dependencies: Vec::new(),
                            });
                            deps.push(idx);
                        }
                    } else if let Some(idx) = cache.get(dep) {
                        deps.push(*idx);
                    }
                }
                let idx = blocks.len();
                blocks.push(ExecutionBlock {
                    node: *id,
                    kind: BlockKind::Generic,
                    dependencies: deps,
                });
                cache.insert(*id, idx);
            }
            kind => {
                let deps: Vec<usize> =
                    node.dependencies.iter().filter_map(|dep| cache.get(dep).copied()).collect();
                let block_kind = match kind {
                    NodeKind::Return { inherit_results: true } => BlockKind::IdPassthrough { register: 0 },
                    _ => BlockKind::Generic,
                };
                let idx = blocks.len();
                blocks.push(ExecutionBlock {
                    node: *id,
                    kind: block_kind,
                    dependencies: deps,
                });
                cache.insert(*id, idx);
            }
        }
    }

    let root = plan.root()?;
    let root_idx = *cache
        .get(&root)
        .ok_or_else(|| EngineError::MalformedPlan("plan root is not a coordinator node".into()))?;

    // Reboot trackers: one guard per participating server; a restart
    // kills this query through the registry.
    let mut guards = Vec::with_capacity(per_server.len());
    for server in per_server.keys() {
        let wanted = view.reboot_id(server).unwrap_or(0);
        let registry = query.registry.clone();
        let database = query.database.clone();
        let query_id = query.id;
        guards.push(view.register_callback(server.clone(), wanted, move || {
            registry.kill(&database, query_id);
        }));
    }

    Ok(ExecutionEngine {
        id: 0,
        blocks,
        root: root_idx,
        result_register: 0,
        kill: query.kill_handle(),
        guards,
    })
}

async fn rollback(api: &dyn SnippetApi, deployed: &BTreeMap<ServerId, u64>) {
    for (server, server_query_id) in deployed {
        if let Err(err) = api.cleanup(server, *server_query_id).await {
            tracing::warn!(error = %err, server = %server, "failed to clean up deployed snippets");
        }
    }
}
