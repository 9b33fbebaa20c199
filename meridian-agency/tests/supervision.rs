use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use serde_json::json;
use tokio::time::sleep;
use tokio::time::timeout;

use fixtures::AgencyRouter;
use meridian_agency::supervision::job::health_status_path;
use meridian_agency::supervision::job::plan_shard_path;
use meridian_agency::supervision::Supervision;
use meridian_agency::store::WriteTransaction;

mod fixtures;

/// Supervision repairs a failed follower.
///
/// A planned shard has a follower whose health flips to FAILED while a
/// spare healthy server exists. Supervision creates a failedFollower job,
/// starts it once the grace period passed, and the plan ends up with the
/// spare in the follower's slot and the failed server parked at the end.
///
/// RUST_LOG=meridian_agency=debug cargo test -p meridian-agency --test supervision
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn failed_follower_is_replaced() -> Result<()> {
    fixtures::init_tracing();

    let router = AgencyRouter::new();
    let _agents = router.new_cluster(&["A"]).await;
    let leader = router.wait_for_serving_leader(Duration::from_secs(10)).await?;

    let mut config = fixtures::test_config("A");
    config.supervision = true;
    config.supervision_frequency = 0.1;
    config.supervision_grace_period = 0.0;
    let _supervision = Supervision::spawn(leader.clone(), Arc::new(config.validate()?));

    tracing::info!("--- seeding plan and health");
    let shard_path = plan_shard_path("db", "orders", "s1");
    leader
        .write(vec![
            WriteTransaction::single_set(&shard_path, json!(["S1", "S2"])),
            WriteTransaction::single_set(health_status_path("S1"), json!("GOOD")),
            WriteTransaction::single_set(health_status_path("S2"), json!("GOOD")),
            WriteTransaction::single_set(health_status_path("S3"), json!("GOOD")),
        ])
        .await?;

    tracing::info!("--- failing follower S2");
    leader
        .write(vec![WriteTransaction::single_set(
            health_status_path("S2"),
            json!("FAILED"),
        )])
        .await?;

    tracing::info!("--- waiting for the repair");
    let repaired = timeout(Duration::from_secs(10), async {
        loop {
            if let Ok(Some(servers)) = router.read_kv(&leader, &shard_path).await {
                if servers == json!(["S1", "S3", "S2"]) {
                    return;
                }
            }
            sleep(Duration::from_millis(50)).await;
        }
    })
    .await;
    assert!(repaired.is_ok(), "plan was not repaired in time");

    tracing::info!("--- the job record moved to Finished");
    let finished = router
        .read_kv(&leader, "/meridian/Target/Finished")
        .await?
        .expect("finished jobs exist");
    let job = finished
        .as_object()
        .and_then(|jobs| jobs.values().next())
        .cloned()
        .expect("one finished job");
    assert_eq!(job["type"], json!("failedFollower"));
    assert_eq!(job["fromServer"], json!("S2"));
    assert_eq!(job["toServer"], json!("S3"));

    // No second job was minted for the same failure.
    let todo = router.read_kv(&leader, "/meridian/Target/ToDo").await?;
    assert!(
        todo.map(|v| v.as_object().map(|o| o.is_empty()).unwrap_or(true)).unwrap_or(true),
        "no job may remain in ToDo"
    );
    Ok(())
}
