use std::time::Duration;

use anyhow::Result;
use serde_json::json;

use fixtures::endpoint_of;
use fixtures::AgencyRouter;
use meridian_agency::comm::AsyncAgencyComm;
use meridian_agency::store::WriteTransaction;

mod fixtures;

/// Write timeout turns into an inquiry.
///
/// The client writes with a client id, the reply is lost on the wire, and
/// the failover client recovers the assigned log index by inquiring
/// instead of blindly resubmitting — so the same client id yields exactly
/// one log entry.
///
/// RUST_LOG=meridian_agency=debug cargo test -p meridian-agency --test inquiry
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn write_timeout_recovers_by_inquiry() -> Result<()> {
    fixtures::init_tracing();

    let router = AgencyRouter::new();
    let _agents = router.new_cluster(&["A", "B", "C"]).await;
    let leader = router.wait_for_serving_leader(Duration::from_secs(10)).await?;
    let leader_endpoint = endpoint_of(leader.id());

    let endpoints = ["A", "B", "C"]
        .iter()
        .map(|id| endpoint_of(id))
        .collect::<Vec<_>>();
    let comm = AsyncAgencyComm::new(endpoints, router.clone());

    tracing::info!("--- write with a dropped reply");
    router.drop_next_reply_from(&leader_endpoint).await;
    let trx = WriteTransaction::single_set("/x", json!(42)).with_client_id("cid-1");
    let res = comm.write(vec![trx], Duration::from_secs(10)).await?;

    assert_eq!(res["inquired"], json!(true), "reply was dropped, expected inquiry result");
    let indexes = res["results"]["cid-1"].as_array().cloned().unwrap_or_default();
    assert_eq!(indexes.len(), 1, "one client id, one log entry: {:?}", indexes);
    let index = indexes[0].as_u64().unwrap_or(0);
    assert!(index > 0);

    tracing::info!("--- the effect is visible after the recovered index commits");
    assert_eq!(router.read_kv(&leader, "/x").await?, Some(json!(42)));
    Ok(())
}

/// Scenario: the contacted leader dies right after the write; a surviving
/// member still reports the index, and the effect is visible once a new
/// leader serves.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn inquiry_survives_leader_death() -> Result<()> {
    fixtures::init_tracing();

    let router = AgencyRouter::new();
    let _agents = router.new_cluster(&["A", "B", "C"]).await;
    let leader = router.wait_for_serving_leader(Duration::from_secs(10)).await?;

    let trx = WriteTransaction::single_set("/y", json!("survives")).with_client_id("cid-2");
    let res = leader.write(vec![trx]).await?;
    assert!(res.max_index > 0);

    tracing::info!("--- killing the leader after the commit");
    let old_id = leader.id().clone();
    router.isolate(&old_id).await;
    leader.shutdown().await?;

    let survivor_id = ["A", "B", "C"]
        .iter()
        .find(|id| *id != &old_id)
        .map(|id| id.to_string())
        .expect("a survivor exists");
    let survivor = router.agent(&survivor_id).await;

    tracing::info!("--- inquiring on a survivor");
    let inquired = survivor.inquire(vec!["cid-2".to_string()]).await?;
    let found = inquired.indexes.get("cid-2").cloned().unwrap_or_default();
    assert_eq!(found, vec![res.max_index], "survivor must report the same index");

    tracing::info!("--- the effect is visible on the next leader");
    let new_leader = router.wait_for_serving_leader(Duration::from_secs(10)).await?;
    assert_eq!(router.read_kv(&new_leader, "/y").await?, Some(json!("survives")));
    Ok(())
}
