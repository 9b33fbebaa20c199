//! Cooperative repair jobs, expressed purely as agency transactions.
//!
//! A job is a document under `Target/{ToDo,Pending,Finished,Failed}`. All
//! state transitions are preconditioned transactions, so concurrent
//! supervision passes (or a re-elected leader replaying its view) cannot
//! double-apply an effect: whoever loses the precondition race simply
//! observes a no-op.

use serde::Deserialize;
use serde::Serialize;
use serde_json::json;
use serde_json::Value;

use crate::store::Op;
use crate::store::Precondition;
use crate::store::WriteTransaction;
use crate::ROOT_PATH;

/// Jobs expire to `Failed` when not finished within this window.
pub const JOB_EXPIRY_SECS: u64 = 4620;

/// Lifecycle states of a job.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobStatus {
    NotFound,
    ToDo,
    Pending,
    Finished,
    Failed,
}

impl JobStatus {
    pub fn folder(&self) -> Option<&'static str> {
        match self {
            JobStatus::NotFound => None,
            JobStatus::ToDo => Some("ToDo"),
            JobStatus::Pending => Some("Pending"),
            JobStatus::Finished => Some("Finished"),
            JobStatus::Failed => Some("Failed"),
        }
    }
}

/// The stored job document.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct JobDocument {
    #[serde(rename = "type")]
    pub job_type: String,
    pub database: String,
    pub collection: String,
    pub shard: String,
    #[serde(rename = "fromServer")]
    pub from_server: String,
    #[serde(rename = "toServer", default, skip_serializing_if = "Option::is_none")]
    pub to_server: Option<String>,
    #[serde(rename = "jobId")]
    pub job_id: String,
    pub creator: String,
    /// Epoch milliseconds.
    #[serde(rename = "timeCreated")]
    pub time_created: u64,
    /// Epoch milliseconds before which the job must not start.
    #[serde(rename = "notBefore")]
    pub not_before: u64,
    #[serde(rename = "timeStarted", default, skip_serializing_if = "Option::is_none")]
    pub time_started: Option<u64>,
    #[serde(rename = "timeFinished", default, skip_serializing_if = "Option::is_none")]
    pub time_finished: Option<u64>,
}

impl JobDocument {
    pub fn expired(&self, now_ms: u64) -> bool {
        now_ms.saturating_sub(self.time_created) > JOB_EXPIRY_SECS * 1000
    }
}

/// `Target/<folder>/<jobId>`.
pub fn job_path(status: JobStatus, job_id: &str) -> String {
    match status.folder() {
        Some(folder) => format!("{}/Target/{}/{}", ROOT_PATH, folder, job_id),
        None => format!("{}/Target/ToDo/{}", ROOT_PATH, job_id),
    }
}

/// `Plan/Collections/<db>/<coll>/shards/<shard>`.
pub fn plan_shard_path(database: &str, collection: &str, shard: &str) -> String {
    format!(
        "{}/Plan/Collections/{}/{}/shards/{}",
        ROOT_PATH, database, collection, shard
    )
}

/// `Current/Collections/<db>/<coll>/<shard>`.
pub fn current_shard_path(database: &str, collection: &str, shard: &str) -> String {
    format!("{}/Current/Collections/{}/{}/{}", ROOT_PATH, database, collection, shard)
}

/// `Supervision/Health/<server>/Status`.
pub fn health_status_path(server: &str) -> String {
    format!("{}/Supervision/Health/{}/Status", ROOT_PATH, server)
}

/// `Supervision/Shards/<shard>` — the shard serialization lock.
pub fn shard_block_path(shard: &str) -> String {
    format!("{}/Supervision/Shards/{}", ROOT_PATH, shard)
}

/// `Supervision/DBServers/<server>` — the server serialization lock.
pub fn server_block_path(server: &str) -> String {
    format!("{}/Supervision/DBServers/{}", ROOT_PATH, server)
}

/// `Plan/Version`.
pub fn plan_version_path() -> String {
    format!("{}/Plan/Version", ROOT_PATH)
}

/// Replace a failed follower of a shard with a healthy replacement.
///
/// Created when supervision sees a FAILED server among a shard's
/// followers. `start` replaces the failed server in the plan and retires
/// the job to `Finished` in one preconditioned transaction.
#[derive(Clone, Debug)]
pub struct FailedFollower {
    pub job: JobDocument,
}

impl FailedFollower {
    pub fn new(
        job_id: impl Into<String>,
        database: impl Into<String>,
        collection: impl Into<String>,
        shard: impl Into<String>,
        from_server: impl Into<String>,
        creator: impl Into<String>,
        now_ms: u64,
        not_before_ms: u64,
    ) -> Self {
        Self {
            job: JobDocument {
                job_type: "failedFollower".to_string(),
                database: database.into(),
                collection: collection.into(),
                shard: shard.into(),
                from_server: from_server.into(),
                to_server: None,
                job_id: job_id.into(),
                creator: creator.into(),
                time_created: now_ms,
                not_before: not_before_ms,
                time_started: None,
                time_finished: None,
            },
        }
    }

    /// The creation transaction: write the job under `ToDo` iff no job
    /// with this id exists there yet.
    pub fn create_transaction(&self) -> WriteTransaction {
        let path = job_path(JobStatus::ToDo, &self.job.job_id);
        let doc = serde_json::to_value(&self.job).unwrap_or(Value::Null);
        WriteTransaction::default()
            .with_op(path.clone(), Op::Set { new: doc, ttl: None })
            .with_precondition(path, Precondition::OldEmpty(true))
    }

    /// The start transaction: replace the failed follower with
    /// `to_server` in the plan (failed server appended as trailing
    /// spare), bump the plan version and retire the job to `Finished`.
    ///
    /// Preconditions pin everything the decision was based on: the
    /// planned server list, the failover candidates, both servers'
    /// health, and the shard/server serialization locks.
    pub fn start_transaction(
        &self,
        planned: &[String],
        failover_candidates: &Value,
        to_server: &str,
        now_ms: u64,
    ) -> WriteTransaction {
        let plan_path = plan_shard_path(&self.job.database, &self.job.collection, &self.job.shard);
        let current_path = current_shard_path(&self.job.database, &self.job.collection, &self.job.shard);

        // The replacement takes the failed follower's position; the failed
        // server moves to the very end as a spare.
        let mut new_planned: Vec<Value> = planned
            .iter()
            .map(|s| {
                if s == &self.job.from_server {
                    Value::String(to_server.to_string())
                } else {
                    Value::String(s.clone())
                }
            })
            .collect();
        new_planned.push(Value::String(self.job.from_server.clone()));

        let mut finished = self.job.clone();
        finished.to_server = Some(to_server.to_string());
        finished.time_started = Some(now_ms);
        finished.time_finished = Some(now_ms);

        WriteTransaction::default()
            .with_op(plan_path.clone(), Op::Set { new: Value::Array(new_planned), ttl: None })
            .with_op(plan_version_path(), Op::Increment { step: 1 })
            .with_op(job_path(JobStatus::ToDo, &self.job.job_id), Op::Delete)
            .with_op(
                job_path(JobStatus::Finished, &self.job.job_id),
                Op::Set {
                    new: serde_json::to_value(&finished).unwrap_or(Value::Null),
                    ttl: None,
                },
            )
            .with_precondition(
                plan_path,
                Precondition::Old(Value::Array(
                    planned.iter().map(|s| Value::String(s.clone())).collect(),
                )),
            )
            .with_precondition(
                format!("{}/failoverCandidates", current_path),
                if failover_candidates.is_null() {
                    Precondition::OldEmpty(true)
                } else {
                    Precondition::Old(failover_candidates.clone())
                },
            )
            .with_precondition(server_block_path(to_server), Precondition::OldEmpty(true))
            .with_precondition(shard_block_path(&self.job.shard), Precondition::OldEmpty(true))
            .with_precondition(health_status_path(to_server), Precondition::Old(json!("GOOD")))
            .with_precondition(
                health_status_path(&self.job.from_server),
                Precondition::Old(json!("FAILED")),
            )
    }

    /// Retire an unstartable job to `Failed`.
    pub fn abort_transaction(&self, reason: &str, now_ms: u64) -> WriteTransaction {
        let mut failed = self.job.clone();
        failed.time_finished = Some(now_ms);
        let mut doc = serde_json::to_value(&failed).unwrap_or(Value::Null);
        if let Some(obj) = doc.as_object_mut() {
            obj.insert("reason".to_string(), Value::String(reason.to_string()));
        }
        WriteTransaction::default()
            .with_op(job_path(JobStatus::ToDo, &self.job.job_id), Op::Delete)
            .with_op(job_path(JobStatus::Failed, &self.job.job_id), Op::Set { new: doc, ttl: None })
            .with_precondition(
                job_path(JobStatus::ToDo, &self.job.job_id),
                Precondition::OldEmpty(false),
            )
    }
}

/// Promote a follower after a shard leader failed.
///
/// Unlike [`FailedFollower`] this job serializes over the shard: `start`
/// moves it to `Pending` and takes the shard lock; it finishes once the
/// promoted follower shows up as leader in `Current`, or aborts releasing
/// the lock.
#[derive(Clone, Debug)]
pub struct FailedLeader {
    pub job: JobDocument,
}

impl FailedLeader {
    pub fn new(
        job_id: impl Into<String>,
        database: impl Into<String>,
        collection: impl Into<String>,
        shard: impl Into<String>,
        from_server: impl Into<String>,
        creator: impl Into<String>,
        now_ms: u64,
        not_before_ms: u64,
    ) -> Self {
        Self {
            job: JobDocument {
                job_type: "failedLeader".to_string(),
                database: database.into(),
                collection: collection.into(),
                shard: shard.into(),
                from_server: from_server.into(),
                to_server: None,
                job_id: job_id.into(),
                creator: creator.into(),
                time_created: now_ms,
                not_before: not_before_ms,
                time_started: None,
                time_finished: None,
            },
        }
    }

    pub fn create_transaction(&self) -> WriteTransaction {
        let path = job_path(JobStatus::ToDo, &self.job.job_id);
        let doc = serde_json::to_value(&self.job).unwrap_or(Value::Null);
        WriteTransaction::default()
            .with_op(path.clone(), Op::Set { new: doc, ttl: None })
            .with_precondition(path, Precondition::OldEmpty(true))
    }

    /// Rotate the promoted follower to the front of the plan, block the
    /// shard, and move the job to `Pending`.
    pub fn start_transaction(&self, planned: &[String], to_server: &str, now_ms: u64) -> WriteTransaction {
        let plan_path = plan_shard_path(&self.job.database, &self.job.collection, &self.job.shard);

        let mut new_planned: Vec<Value> = vec![Value::String(to_server.to_string())];
        new_planned.extend(
            planned
                .iter()
                .filter(|s| *s != &self.job.from_server && s.as_str() != to_server)
                .map(|s| Value::String(s.clone())),
        );
        new_planned.push(Value::String(self.job.from_server.clone()));

        let mut pending = self.job.clone();
        pending.to_server = Some(to_server.to_string());
        pending.time_started = Some(now_ms);

        WriteTransaction::default()
            .with_op(plan_path.clone(), Op::Set { new: Value::Array(new_planned), ttl: None })
            .with_op(plan_version_path(), Op::Increment { step: 1 })
            .with_op(job_path(JobStatus::ToDo, &self.job.job_id), Op::Delete)
            .with_op(
                job_path(JobStatus::Pending, &self.job.job_id),
                Op::Set {
                    new: serde_json::to_value(&pending).unwrap_or(Value::Null),
                    ttl: None,
                },
            )
            .with_op(
                shard_block_path(&self.job.shard),
                Op::Set {
                    new: Value::String(self.job.job_id.clone()),
                    ttl: None,
                },
            )
            .with_precondition(
                plan_path,
                Precondition::Old(Value::Array(
                    planned.iter().map(|s| Value::String(s.clone())).collect(),
                )),
            )
            .with_precondition(shard_block_path(&self.job.shard), Precondition::OldEmpty(true))
            .with_precondition(health_status_path(to_server), Precondition::Old(json!("GOOD")))
            .with_precondition(
                health_status_path(&self.job.from_server),
                Precondition::Old(json!("FAILED")),
            )
    }

    /// Finish a pending job once `Current` shows the promoted leader;
    /// releases the shard lock in the same transaction.
    pub fn finish_transaction(&self, to_server: &str, now_ms: u64) -> WriteTransaction {
        let current_servers = format!(
            "{}/servers",
            current_shard_path(&self.job.database, &self.job.collection, &self.job.shard)
        );
        let mut finished = self.job.clone();
        finished.to_server = Some(to_server.to_string());
        finished.time_finished = Some(now_ms);

        WriteTransaction::default()
            .with_op(job_path(JobStatus::Pending, &self.job.job_id), Op::Delete)
            .with_op(
                job_path(JobStatus::Finished, &self.job.job_id),
                Op::Set {
                    new: serde_json::to_value(&finished).unwrap_or(Value::Null),
                    ttl: None,
                },
            )
            .with_op(shard_block_path(&self.job.shard), Op::Delete)
            .with_precondition(
                job_path(JobStatus::Pending, &self.job.job_id),
                Precondition::OldEmpty(false),
            )
            .with_precondition(
                shard_block_path(&self.job.shard),
                Precondition::Old(Value::String(self.job.job_id.clone())),
            )
            .with_precondition(current_servers, Precondition::In(json!(to_server)))
    }

    /// Retire a job which never started straight to `Failed`.
    pub fn abort_todo_transaction(&self, reason: &str, now_ms: u64) -> WriteTransaction {
        let mut failed = self.job.clone();
        failed.time_finished = Some(now_ms);
        let mut doc = serde_json::to_value(&failed).unwrap_or(Value::Null);
        if let Some(obj) = doc.as_object_mut() {
            obj.insert("reason".to_string(), Value::String(reason.to_string()));
        }
        WriteTransaction::default()
            .with_op(job_path(JobStatus::ToDo, &self.job.job_id), Op::Delete)
            .with_op(job_path(JobStatus::Failed, &self.job.job_id), Op::Set { new: doc, ttl: None })
            .with_precondition(
                job_path(JobStatus::ToDo, &self.job.job_id),
                Precondition::OldEmpty(false),
            )
    }

    /// Abort a pending job, releasing the shard lock in the same
    /// transaction.
    pub fn abort_transaction(&self, reason: &str, now_ms: u64) -> WriteTransaction {
        let mut failed = self.job.clone();
        failed.time_finished = Some(now_ms);
        let mut doc = serde_json::to_value(&failed).unwrap_or(Value::Null);
        if let Some(obj) = doc.as_object_mut() {
            obj.insert("reason".to_string(), Value::String(reason.to_string()));
        }
        WriteTransaction::default()
            .with_op(job_path(JobStatus::Pending, &self.job.job_id), Op::Delete)
            .with_op(job_path(JobStatus::Failed, &self.job.job_id), Op::Set { new: doc, ttl: None })
            .with_op(shard_block_path(&self.job.shard), Op::Delete)
            .with_precondition(
                job_path(JobStatus::Pending, &self.job.job_id),
                Precondition::OldEmpty(false),
            )
            .with_precondition(
                shard_block_path(&self.job.shard),
                Precondition::Old(Value::String(self.job.job_id.clone())),
            )
    }
}
