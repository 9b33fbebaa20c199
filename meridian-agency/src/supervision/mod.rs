//! The supervision loop.
//!
//! Runs beside a leading agent: each pass takes a consistent snapshot of
//! the committed store, diagnoses failed servers against the planned shard
//! distribution, and repairs the cluster exclusively by writing jobs and
//! job transitions back into the agency as preconditioned transactions.
//! Losing a precondition race (a concurrent pass, a re-election) is
//! harmless: the transaction simply does not apply.

pub mod job;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use serde_json::Value;
use tokio::task::JoinHandle;
use tracing_futures::Instrument;

use crate::agent::epoch_ms;
use crate::agent::Agent;
use crate::config::Config;
use crate::error::AgencyError;
use crate::error::AgencyResult;
use crate::store::Op;
use crate::store::Precondition;
use crate::store::WriteTransaction;
use crate::ROOT_PATH;

use job::FailedFollower;
use job::FailedLeader;
use job::JobDocument;

/// `Target/LatestJobId` — the job id allocator.
fn latest_job_id_path() -> String {
    format!("{}/Target/LatestJobId", ROOT_PATH)
}

/// Navigate nested objects.
fn dig<'v>(v: &'v Value, path: &[&str]) -> Option<&'v Value> {
    let mut node = v;
    for seg in path {
        node = node.as_object()?.get(*seg)?;
    }
    Some(node)
}

fn string_array(v: &Value) -> Vec<String> {
    v.as_array()
        .map(|a| a.iter().filter_map(|s| s.as_str().map(str::to_string)).collect())
        .unwrap_or_default()
}

/// The background supervision task.
pub struct Supervision {
    agent: Agent,
    config: Arc<Config>,
}

impl Supervision {
    /// Spawn the supervision loop for the given agent. The loop is a
    /// no-op while the agent is not a serving leader, and ends when the
    /// agent shuts down.
    pub fn spawn(agent: Agent, config: Arc<Config>) -> JoinHandle<()> {
        let this = Self { agent, config };
        tokio::spawn(this.run().instrument(tracing::debug_span!("supervision")))
    }

    #[tracing::instrument(level = "debug", skip(self), fields(id = %self.agent.id()))]
    async fn run(self) {
        let mut plan_wakeups = match self.agent.subscribe(format!("{}/Plan", ROOT_PATH)).await {
            Ok(rx) => rx,
            Err(_) => return,
        };
        let mut current_wakeups = match self.agent.subscribe(format!("{}/Current", ROOT_PATH)).await {
            Ok(rx) => rx,
            Err(_) => return,
        };
        let mut health_wakeups =
            match self.agent.subscribe(format!("{}/Supervision/Health", ROOT_PATH)).await {
                Ok(rx) => rx,
                Err(_) => return,
            };

        let period = Duration::from_secs_f64(self.config.supervision_frequency.max(0.1));
        let mut tick = tokio::time::interval(period);

        loop {
            tokio::select! {
                _ = tick.tick() => {}
                Some(path) = plan_wakeups.recv() => {
                    tracing::trace!(path = %path, "woken by plan change");
                }
                Some(path) = current_wakeups.recv() => {
                    tracing::trace!(path = %path, "woken by current change");
                }
                Some(path) = health_wakeups.recv() => {
                    tracing::trace!(path = %path, "woken by health change");
                }
            }

            if !self.agent.leading() {
                continue;
            }
            match self.run_pass().await {
                Ok(()) => {}
                Err(AgencyError::Shutdown) => return,
                Err(AgencyError::NotLeader { .. }) | Err(AgencyError::Resigned) => {
                    // Lost leadership mid-pass; the next leader takes over.
                }
                Err(err) if err.is_fatal() => {
                    tracing::error!(error = %err, "fatal error, stopping supervision");
                    return;
                }
                Err(err) => {
                    tracing::error!(error = %err, "supervision pass failed");
                }
            }
        }
    }

    /// One supervision pass over a consistent snapshot.
    #[tracing::instrument(level = "debug", skip(self))]
    async fn run_pass(&self) -> AgencyResult<()> {
        let mut results = self.agent.read(vec![vec![ROOT_PATH.to_string()]]).await?;
        let Some(snapshot) = results.pop() else {
            return Ok(());
        };
        // Strip the root segment; an empty store means nothing to do yet.
        let Some(root) = dig(&snapshot.value, &[&ROOT_PATH[1..]]).cloned() else {
            return Ok(());
        };

        let now = epoch_ms();
        let health = self.read_health(&root);
        let todo = self.read_jobs(&root, "ToDo");
        let pending = self.read_jobs(&root, "Pending");
        let mut handled = self.read_jobs(&root, "Finished");
        handled.extend(self.read_jobs(&root, "Failed"));

        self.create_jobs_for_failures(&root, &health, &todo, &pending, &handled, now).await?;
        self.drive_todo_jobs(&root, &health, &todo, now).await?;
        self.drive_pending_jobs(&root, &pending, now).await?;
        Ok(())
    }

    /// `Supervision/Health/<server>/Status` per server.
    fn read_health(&self, root: &Value) -> BTreeMap<String, String> {
        let mut out = BTreeMap::new();
        if let Some(health) = dig(root, &["Supervision", "Health"]).and_then(Value::as_object) {
            for (server, doc) in health {
                if let Some(status) = dig(doc, &["Status"]).and_then(Value::as_str) {
                    out.insert(server.clone(), status.to_string());
                }
            }
        }
        out
    }

    fn read_jobs(&self, root: &Value, folder: &str) -> Vec<JobDocument> {
        let mut out = Vec::new();
        if let Some(jobs) = dig(root, &["Target", folder]).and_then(Value::as_object) {
            for doc in jobs.values() {
                match serde_json::from_value::<JobDocument>(doc.clone()) {
                    Ok(job) => out.push(job),
                    Err(err) => tracing::warn!(error = %err, "unreadable job document"),
                }
            }
        }
        out
    }

    /// Walk every planned shard; failed participants without an active job
    /// get one.
    async fn create_jobs_for_failures(
        &self,
        root: &Value,
        health: &BTreeMap<String, String>,
        todo: &[JobDocument],
        pending: &[JobDocument],
        handled: &[JobDocument],
        now: u64,
    ) -> AgencyResult<()> {
        let Some(collections) = dig(root, &["Plan", "Collections"]).and_then(Value::as_object) else {
            return Ok(());
        };

        let mut next_job_id = dig(root, &["Target", "LatestJobId"]).and_then(Value::as_u64).unwrap_or(0);
        let busy_shards: Vec<&str> =
            todo.iter().chain(pending).map(|j| j.shard.as_str()).collect();
        // A failure instance gets exactly one job; a retired job for the
        // same (shard, server) pair blocks re-creation so a parked spare
        // is not "repaired" over and over.
        let already_handled = |shard: &str, server: &str| {
            handled.iter().any(|j| j.shard == shard && j.from_server == server)
        };
        let not_before = now + (self.config.supervision_grace_period * 1000.0) as u64;

        for (db, colls) in collections {
            let Some(colls) = colls.as_object() else { continue };
            for (coll, doc) in colls {
                let Some(shards) = dig(doc, &["shards"]).and_then(Value::as_object) else {
                    continue;
                };
                for (shard, servers) in shards {
                    if busy_shards.contains(&shard.as_str()) {
                        continue;
                    }
                    let servers = string_array(servers);
                    let Some((leader, followers)) = servers.split_first() else { continue };

                    let failed =
                        |s: &str| health.get(s).map(|st| st == "FAILED").unwrap_or(false);

                    if failed(leader) && !already_handled(shard, leader) {
                        next_job_id += 1;
                        let job = FailedLeader::new(
                            next_job_id.to_string(),
                            db.clone(),
                            coll.clone(),
                            shard.clone(),
                            leader.clone(),
                            self.agent.id().clone(),
                            now,
                            not_before,
                        );
                        tracing::info!(shard = %shard, server = %leader, job = next_job_id, "creating failedLeader job");
                        self.submit(self.with_job_id_allocation(job.create_transaction(), next_job_id))
                            .await?;
                        continue;
                    }
                    if let Some(follower) =
                        followers.iter().find(|s| failed(s) && !already_handled(shard, s))
                    {
                        next_job_id += 1;
                        let job = FailedFollower::new(
                            next_job_id.to_string(),
                            db.clone(),
                            coll.clone(),
                            shard.clone(),
                            follower.clone(),
                            self.agent.id().clone(),
                            now,
                            not_before,
                        );
                        tracing::info!(shard = %shard, server = %follower, job = next_job_id, "creating failedFollower job");
                        self.submit(self.with_job_id_allocation(job.create_transaction(), next_job_id))
                            .await?;
                    }
                }
            }
        }
        Ok(())
    }

    /// Couple a job creation to the id allocator so two racing passes
    /// cannot mint the same id.
    fn with_job_id_allocation(&self, trx: WriteTransaction, id: u64) -> WriteTransaction {
        let pre = if id == 1 {
            Precondition::OldEmpty(true)
        } else {
            Precondition::Old(json!(id - 1))
        };
        trx.with_op(latest_job_id_path(), Op::Set { new: json!(id), ttl: None })
            .with_precondition(latest_job_id_path(), pre)
    }

    /// Try to start (or expire) every `ToDo` job.
    async fn drive_todo_jobs(
        &self,
        root: &Value,
        health: &BTreeMap<String, String>,
        todo: &[JobDocument],
        now: u64,
    ) -> AgencyResult<()> {
        for doc in todo {
            if doc.not_before > now {
                continue;
            }
            let planned = dig(
                root,
                &["Plan", "Collections", &doc.database, &doc.collection, "shards", &doc.shard],
            )
            .map(string_array)
            .unwrap_or_default();

            match doc.job_type.as_str() {
                "failedFollower" => {
                    let job = FailedFollower { job: doc.clone() };
                    if doc.expired(now) {
                        self.submit(job.abort_transaction("expired", now)).await?;
                        continue;
                    }
                    if !planned.iter().any(|s| s == &doc.from_server) {
                        self.submit(job.abort_transaction("server no longer planned", now)).await?;
                        continue;
                    }
                    // A healthy server not already serving this shard.
                    let to_server = health
                        .iter()
                        .find(|(server, status)| {
                            *status == "GOOD" && !planned.iter().any(|s| s == *server)
                        })
                        .map(|(server, _)| (*server).clone());
                    let Some(to_server) = to_server else { continue };

                    let failover = dig(
                        root,
                        &[
                            "Current",
                            "Collections",
                            &doc.database,
                            &doc.collection,
                            &doc.shard,
                            "failoverCandidates",
                        ],
                    )
                    .cloned()
                    .unwrap_or(Value::Null);

                    tracing::info!(job = %doc.job_id, to = %to_server, "starting failedFollower job");
                    self.submit(job.start_transaction(&planned, &failover, &to_server, now)).await?;
                }
                "failedLeader" => {
                    let job = FailedLeader { job: doc.clone() };
                    if doc.expired(now) {
                        self.submit(job.abort_todo_transaction("expired", now)).await?;
                        continue;
                    }
                    // Promote the first healthy planned follower.
                    let to_server = planned
                        .iter()
                        .skip(1)
                        .find(|s| health.get(*s).map(|st| st == "GOOD").unwrap_or(false))
                        .cloned();
                    let Some(to_server) = to_server else { continue };
                    tracing::info!(job = %doc.job_id, to = %to_server, "starting failedLeader job");
                    self.submit(job.start_transaction(&planned, &to_server, now)).await?;
                }
                other => {
                    tracing::warn!(job = %doc.job_id, kind = %other, "unknown job type");
                }
            }
        }
        Ok(())
    }

    /// Finish or expire pending jobs.
    async fn drive_pending_jobs(
        &self,
        root: &Value,
        pending: &[JobDocument],
        now: u64,
    ) -> AgencyResult<()> {
        for doc in pending {
            if doc.job_type != "failedLeader" {
                continue;
            }
            let job = FailedLeader { job: doc.clone() };
            if doc.expired(now) {
                self.submit(job.abort_transaction("expired", now)).await?;
                continue;
            }
            let Some(to_server) = doc.to_server.clone() else { continue };
            let in_sync = dig(
                root,
                &["Current", "Collections", &doc.database, &doc.collection, &doc.shard, "servers"],
            )
            .map(string_array)
            .map(|servers| servers.iter().any(|s| s == &to_server))
            .unwrap_or(false);
            if in_sync {
                tracing::info!(job = %doc.job_id, "finishing failedLeader job");
                self.submit(job.finish_transaction(&to_server, now)).await?;
            }
        }
        Ok(())
    }

    /// Submit one transaction; precondition losses are expected and fine.
    async fn submit(&self, trx: WriteTransaction) -> AgencyResult<()> {
        let res = self.agent.write(vec![trx]).await?;
        if res.applied.first().copied() != Some(true) {
            tracing::debug!("supervision transaction lost its precondition race");
        }
        Ok(())
    }
}
