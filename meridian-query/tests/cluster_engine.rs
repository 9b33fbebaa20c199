use std::sync::Mutex;

use anyhow::anyhow;
use anyhow::Result;
use async_trait::async_trait;
use maplit::btreemap;
use pretty_assertions::assert_eq;
use serde_json::Value;

use meridian_query::cluster::ClusterView;
use meridian_query::engine::instantiate_cluster;
use meridian_query::engine::instantiate_single_server;
use meridian_query::engine::partition_plan;
use meridian_query::engine::BlockKind;
use meridian_query::engine::Query;
use meridian_query::engine::SnippetApi;
use meridian_query::engine::SnippetDeployed;
use meridian_query::error::EngineError;
use meridian_query::options::QueryOptions;
use meridian_query::plan::ExecutionPlan;
use meridian_query::plan::GatherParallelism;
use meridian_query::plan::NodeKind;
use meridian_query::registry::QueryRegistry;
use meridian_query::ServerId;

/// A scatter/gather plan over a collection sharded across two servers:
///
///   singleton -> enumerate(coll) -> remote -> gather -> return
fn two_server_plan() -> ExecutionPlan {
    let mut plan = ExecutionPlan::new();
    let singleton = plan.add_node(NodeKind::Singleton, &[]);
    let enumerate = plan.add_node(
        NodeKind::EnumerateCollection {
            collection: "orders".to_string(),
            shards: btreemap! {
                "DB1".to_string() => vec!["s1".to_string(), "s2".to_string()],
                "DB2".to_string() => vec!["s3".to_string()],
            },
        },
        &[singleton],
    );
    let remote = plan.add_node(NodeKind::Remote, &[enumerate]);
    let gather = plan.add_node(
        NodeKind::Gather {
            parallelism: GatherParallelism::Undefined,
        },
        &[remote],
    );
    plan.add_node(NodeKind::Return { inherit_results: false }, &[gather]);
    plan
}

/// Records deployments and hands out deterministic snippet ids.
#[derive(Default)]
struct RecordingApi {
    deployments: Mutex<Vec<(ServerId, Value)>>,
    cleanups: Mutex<Vec<(ServerId, u64)>>,
    fail_on: Option<ServerId>,
}

#[async_trait]
impl SnippetApi for RecordingApi {
    async fn deploy_snippets(&self, server: &ServerId, body: Value) -> Result<SnippetDeployed> {
        if self.fail_on.as_ref() == Some(server) {
            return Err(anyhow!("deployment refused"));
        }
        let mut deployments = self.deployments.lock().unwrap();
        deployments.push((server.clone(), body.clone()));
        let n = body["snippets"].as_array().map(|a| a.len()).unwrap_or(0);
        let base = deployments.len() as u64 * 100;
        Ok(SnippetDeployed {
            server_query_id: base,
            snippet_ids: (0..n as u64).map(|i| base + i + 1).collect(),
        })
    }

    async fn cleanup(&self, server: &ServerId, server_query_id: u64) -> Result<()> {
        self.cleanups.lock().unwrap().push((server.clone(), server_query_id));
        Ok(())
    }
}

#[test]
fn partitioning_splits_at_the_remote_boundary() {
    let plan = two_server_plan();
    let (coordinator, dbserver) = partition_plan(&plan).unwrap();

    // Coordinator: return, gather, remote placeholder.
    assert_eq!(coordinator.nodes.len(), 3);
    // One snippet rooted below the remote, holding enumerate + singleton.
    assert_eq!(dbserver.snippets.len(), 1);
    let snippet = &dbserver.snippets[0];
    assert_eq!(snippet.nodes.len(), 2);
    assert!(snippet.gather.is_some(), "gather above the remote is remembered");
    assert_eq!(
        snippet.owning_servers(&plan).into_iter().collect::<Vec<_>>(),
        vec!["DB1".to_string(), "DB2".to_string()]
    );
}

#[test]
fn async_cancels_the_remembered_gather() {
    let mut plan = ExecutionPlan::new();
    let singleton = plan.add_node(NodeKind::Singleton, &[]);
    let enumerate = plan.add_node(
        NodeKind::EnumerateCollection {
            collection: "c".to_string(),
            shards: btreemap! {"DB1".to_string() => vec!["s1".to_string()]},
        },
        &[singleton],
    );
    let remote = plan.add_node(NodeKind::Remote, &[enumerate]);
    let asynchronous = plan.add_node(NodeKind::Async, &[remote]);
    let gather = plan.add_node(
        NodeKind::Gather {
            parallelism: GatherParallelism::Parallel,
        },
        &[asynchronous],
    );
    plan.add_node(NodeKind::Return { inherit_results: false }, &[gather]);

    let (_, dbserver) = partition_plan(&plan).unwrap();
    assert_eq!(dbserver.snippets.len(), 1);
    assert!(
        dbserver.snippets[0].gather.is_none(),
        "async between gather and remote cancels the gather"
    );
}

#[tokio::test]
async fn cluster_build_fans_out_one_remote_block_per_server() -> Result<()> {
    let registry = QueryRegistry::new();
    let query = Query::new(&registry, "db", 1, QueryOptions::default());
    let plan = two_server_plan();

    let view = ClusterView::new();
    view.observe_reboot_id("DB1", 1);
    view.observe_reboot_id("DB2", 1);

    let api = RecordingApi::default();
    let engine = instantiate_cluster(&query, &plan, &api, &view).await?;

    // Engine 0 on the coordinator, one guard per participating server.
    assert_eq!(engine.id, 0);
    assert_eq!(engine.guard_count(), 2);

    let remotes = engine.remote_blocks();
    assert_eq!(remotes.len(), 2, "one remote block per (server, snippet)");
    let mut servers: Vec<String> = remotes
        .iter()
        .map(|b| match &b.kind {
            BlockKind::Remote { server, query_id, .. } => {
                assert!(*query_id > 0, "snippet id must be non-zero");
                server.clone()
            }
            other => panic!("unexpected block kind {:?}", other),
        })
        .collect();
    servers.sort();
    // Server-pinned addressing, not shard addressing.
    assert_eq!(servers, vec!["server:DB1".to_string(), "server:DB2".to_string()]);

    // The gather owns the remote blocks as dependencies.
    let gather = engine
        .blocks()
        .iter()
        .find(|b| matches!(plan.node(b.node).kind, NodeKind::Gather { .. }))
        .expect("gather block exists");
    assert_eq!(gather.dependencies.len(), 2);

    // One deployment request went to each owning server.
    let deployments = api.deployments.lock().unwrap();
    assert_eq!(deployments.len(), 2);
    assert!(deployments.iter().all(|(_, body)| body["database"] == "db"));
    Ok(())
}

#[tokio::test]
async fn failed_deployment_rolls_back_earlier_servers() {
    let registry = QueryRegistry::new();
    let query = Query::new(&registry, "db", 2, QueryOptions::default());
    let plan = two_server_plan();
    let view = ClusterView::new();

    let api = RecordingApi {
        fail_on: Some("DB2".to_string()),
        ..RecordingApi::default()
    };
    let err = instantiate_cluster(&query, &plan, &api, &view).await.unwrap_err();
    assert!(matches!(err, EngineError::DeploymentFailed { ref server, .. } if server == "DB2"));

    // DB1 deployed first (sorted order) and must have been cleaned up.
    let cleanups = api.cleanups.lock().unwrap().clone();
    assert_eq!(cleanups.len(), 1);
    assert_eq!(cleanups[0].0, "DB1");
}

/// Scenario: a participating server reboots; the tracker kills the query
/// and every execution entry point raises the kill.
#[tokio::test]
async fn reboot_kills_the_running_query() -> Result<()> {
    let registry = QueryRegistry::new();
    let query = Query::new(&registry, "db", 3, QueryOptions::default());
    let plan = two_server_plan();

    let view = ClusterView::new();
    view.observe_reboot_id("DB1", 1);
    view.observe_reboot_id("DB2", 1);

    let api = RecordingApi::default();
    let engine = instantiate_cluster(&query, &plan, &api, &view).await?;

    engine.initialize_cursor()?;
    engine.execute()?;

    // DB2 restarts: the agency feed reports a bumped reboot id.
    view.observe_reboot_id("DB2", 2);

    assert!(matches!(engine.execute(), Err(EngineError::QueryKilled)));
    assert!(matches!(engine.execute_for_client(), Err(EngineError::QueryKilled)));
    assert!(matches!(engine.get_some(), Err(EngineError::QueryKilled)));
    assert!(matches!(engine.skip_some(), Err(EngineError::QueryKilled)));
    Ok(())
}

/// Dropping the engine drops the guards; a later reboot no longer kills.
#[tokio::test]
async fn dropping_the_engine_unregisters_the_trackers() -> Result<()> {
    let registry = QueryRegistry::new();
    let query = Query::new(&registry, "db", 4, QueryOptions::default());
    let plan = two_server_plan();

    let view = ClusterView::new();
    view.observe_reboot_id("DB1", 1);
    view.observe_reboot_id("DB2", 1);

    let api = RecordingApi::default();
    let engine = instantiate_cluster(&query, &plan, &api, &view).await?;
    let kill = query.kill_handle();

    drop(engine);
    view.observe_reboot_id("DB1", 2);
    assert!(!kill.is_killed(), "dropped guards must not fire");
    Ok(())
}

/// Scenario: a plan with two fullCount limits is rejected at engine
/// instantiation in maintainer (debug) builds.
#[test]
fn double_full_count_plan_is_rejected() {
    let registry = QueryRegistry::new();
    let query = Query::new(&registry, "db", 5, QueryOptions::default());

    let mut plan = ExecutionPlan::new();
    let singleton = plan.add_node(NodeKind::Singleton, &[]);
    let first = plan.add_node(
        NodeKind::Limit {
            offset: 0,
            limit: Some(10),
            full_count: true,
        },
        &[singleton],
    );
    let second = plan.add_node(
        NodeKind::Limit {
            offset: 0,
            limit: Some(5),
            full_count: true,
        },
        &[first],
    );
    plan.add_node(NodeKind::Return { inherit_results: false }, &[second]);

    let res = instantiate_single_server(&query, &plan);
    if cfg!(debug_assertions) {
        assert!(matches!(res, Err(EngineError::FullCountViolation(_))));
    } else {
        assert!(res.is_ok());
    }
}

/// The single-server path wires every node into one block tree.
#[test]
fn single_server_builds_the_whole_plan() -> Result<()> {
    let registry = QueryRegistry::new();
    let query = Query::new(&registry, "db", 6, QueryOptions::default());

    let mut plan = ExecutionPlan::new();
    let singleton = plan.add_node(NodeKind::Singleton, &[]);
    let enumerate = plan.add_node(NodeKind::EnumerateList, &[singleton]);
    let calc = plan.add_node(NodeKind::Calculation, &[enumerate]);
    let filter = plan.add_node(NodeKind::Filter, &[calc]);
    let ret = plan.add_node(NodeKind::Return { inherit_results: true }, &[filter]);

    let engine = instantiate_single_server(&query, &plan)?;
    assert_eq!(engine.blocks().len(), 5);
    assert_eq!(engine.root_block().node, ret);
    assert!(matches!(engine.root_block().kind, BlockKind::IdPassthrough { .. }));
    assert_eq!(engine.result_register(), 0);

    // Dependencies point at already-built blocks.
    for block in engine.blocks() {
        for dep in &block.dependencies {
            assert!(*dep < engine.blocks().len());
        }
    }
    Ok(())
}
