//! The agent: public handle and core task.
//!
//! [`Agent`] is a cheaply cloneable handle; all operations are shipped over
//! an unbounded channel into the [`AgentCore`] task, which owns the log,
//! the store replicas and the constituent role machine, and runs one
//! role-specific loop at a time (leader / candidate / follower).

mod append;
mod gossip;
mod leader;
mod poll;
mod vote;

pub use leader::FollowerData;
pub use poll::PollResult;

use std::collections::BTreeMap;
use std::collections::HashSet;
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::time::Duration;
use std::time::SystemTime;
use std::time::UNIX_EPOCH;

use serde::Deserialize;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::sync::oneshot;
use tokio::sync::watch;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tokio::time::sleep_until;
use tokio::time::timeout;
use tokio::time::Instant;
use tracing::Span;
use tracing_futures::Instrument;

use crate::config::ClusterConfig;
use crate::config::Config;
use crate::config::Reconfiguration;
use crate::error::AgencyError;
use crate::error::AgencyResult;
use crate::metrics::AgentMetrics;
use crate::metrics::Wait;
use crate::network::AgencyNetwork;
use crate::network::AppendEntriesRequest;
use crate::network::AppendEntriesResponse;
use crate::network::GossipRequest;
use crate::network::GossipResponse;
use crate::network::VoteRequest;
use crate::network::VoteResponse;
use crate::state::LogEntry;
use crate::state::State;
use crate::storage::AgencyStorage;
use crate::storage::PersistedVote;
use crate::store::ReadResult;
use crate::store::Store;
use crate::store::WriteTransaction;
use crate::AgentId;
use crate::LogIndex;
use crate::MessageSummary;
use crate::Role;
use crate::Term;

/// How long a write waits for its entries to commit before reporting a
/// timeout to the caller.
const WRITE_COMMIT_TIMEOUT: Duration = Duration::from_secs(30);

/// Polling interval of `inquire` while a queried client id is in flight.
const INQUIRE_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// The store key under which the replicated configuration lives.
pub const RECONFIGURE_KEY: &str = "/.agency";

/// Current time as epoch milliseconds.
pub(crate) fn epoch_ms() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_millis() as u64).unwrap_or(0)
}

/// Result of a `write` call.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WriteResult {
    /// False when the contacted agent was not a serving leader.
    pub accepted: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub leader: Option<AgentId>,
    /// Per-transaction precondition outcome.
    pub applied: Vec<bool>,
    /// Per-transaction log index, 0 for failed preconditions.
    pub indexes: Vec<LogIndex>,
    /// Highest index assigned by this call.
    pub max_index: LogIndex,
}

/// One element of a `transact` call: a write or an inline read served from
/// the tentative state.
#[derive(Clone, Debug, derive_more::From)]
pub enum TransactOp {
    Write(WriteTransaction),
    Read(Vec<String>),
}

/// Result of a `transact` call.
#[derive(Clone, Debug)]
pub struct TransactResult {
    pub accepted: bool,
    pub leader: Option<AgentId>,
    pub max_index: LogIndex,
    /// Number of writes whose precondition failed.
    pub failed: u64,
    /// Per-operation result: the log index for writes (0 on precondition
    /// failure), the value subtree for reads.
    pub results: Vec<Value>,
}

/// Result of an `inquire` call: log indexes found per client id.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct InquireResult {
    pub indexes: BTreeMap<String, Vec<LogIndex>>,
}

/// Outcome of `wait_for`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WaitForStatus {
    Ok,
    Timeout,
    /// Leadership was lost while waiting; the commit state is unknown.
    Unknown,
}

/// Introspection report of a running agent.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ConfigReport {
    pub id: AgentId,
    pub endpoint: String,
    pub term: Term,
    pub role: Role,
    pub leader: Option<AgentId>,
    pub serving: bool,
    pub commit_index: LogIndex,
    pub last_log_index: LogIndex,
    pub last_compaction_at: LogIndex,
    pub cluster: ClusterConfig,
}

/// Log introspection report (the read-only `state` surface).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StateReport {
    pub first_index: LogIndex,
    pub last_index: LogIndex,
    pub commit_index: LogIndex,
    pub last_compaction_at: LogIndex,
    /// The retained entries, oldest first.
    pub log: Vec<LogEntry>,
}

/// Dumps of the store replicas (the read-only `stores` surface).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StoresReport {
    pub read_db: Value,
    pub spearhead: Value,
    pub transient: Value,
}

/// A message from the public handle to the core task.
pub(crate) enum AgentMsg {
    AppendEntries {
        rpc: AppendEntriesRequest,
        tx: oneshot::Sender<AgencyResult<AppendEntriesResponse>>,
    },
    RequestVote {
        rpc: VoteRequest,
        tx: oneshot::Sender<AgencyResult<VoteResponse>>,
    },
    Gossip {
        rpc: GossipRequest,
        tx: oneshot::Sender<AgencyResult<GossipResponse>>,
    },
    Write {
        trxs: Vec<WriteTransaction>,
        tx: oneshot::Sender<AgencyResult<WriteResult>>,
    },
    Transact {
        ops: Vec<TransactOp>,
        tx: oneshot::Sender<AgencyResult<TransactResult>>,
    },
    Transient {
        trxs: Vec<WriteTransaction>,
        tx: oneshot::Sender<AgencyResult<Vec<bool>>>,
    },
    Read {
        queries: Vec<Vec<String>>,
        tx: oneshot::Sender<AgencyResult<Vec<ReadResult>>>,
    },
    Poll {
        index: LogIndex,
        timeout: Duration,
        tx: oneshot::Sender<AgencyResult<PollResult>>,
    },
    InquireLookup {
        client_ids: Vec<String>,
        tx: oneshot::Sender<AgencyResult<InquireResult>>,
    },
    Subscribe {
        prefix: String,
        paths: mpsc::UnboundedSender<String>,
        tx: oneshot::Sender<()>,
    },
    Config {
        tx: oneshot::Sender<ConfigReport>,
    },
    State {
        tx: oneshot::Sender<StateReport>,
    },
    Stores {
        tx: oneshot::Sender<StoresReport>,
    },
}

struct AgentInner {
    id: AgentId,
    tx_api: mpsc::UnboundedSender<(AgentMsg, Span)>,
    rx_metrics: watch::Receiver<AgentMetrics>,
    core_handle: Mutex<Option<JoinHandle<AgencyResult<()>>>>,
    tx_shutdown: Mutex<Option<oneshot::Sender<()>>>,
    /// Client ids of writes currently between arrival and local append.
    ongoing_trxs: StdMutex<HashSet<String>>,
}

/// The public handle to a spawned agent task. Clone liberally.
pub struct Agent {
    inner: Arc<AgentInner>,
}

impl Clone for Agent {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl Agent {
    /// Create and spawn a new agent task.
    #[tracing::instrument(level = "debug", skip(config, cluster, network, storage), fields(id = %config.id))]
    pub fn new<N, S>(config: Arc<Config>, cluster: ClusterConfig, network: Arc<N>, storage: Arc<S>) -> Self
    where
        N: AgencyNetwork,
        S: AgencyStorage,
    {
        let (tx_api, rx_api) = mpsc::unbounded_channel();
        let (tx_metrics, rx_metrics) = watch::channel(AgentMetrics::new_initial(config.id.clone()));
        let (tx_shutdown, rx_shutdown) = oneshot::channel();
        let id = config.id.clone();
        let core_handle = AgentCore::spawn(
            config,
            cluster,
            network,
            storage,
            tx_api.clone(),
            rx_api,
            tx_metrics,
            rx_shutdown,
        );
        Self {
            inner: Arc::new(AgentInner {
                id,
                tx_api,
                rx_metrics,
                core_handle: Mutex::new(Some(core_handle)),
                tx_shutdown: Mutex::new(Some(tx_shutdown)),
                ongoing_trxs: StdMutex::new(HashSet::new()),
            }),
        }
    }

    pub fn id(&self) -> &AgentId {
        &self.inner.id
    }

    /// The latest metrics snapshot channel.
    pub fn metrics(&self) -> watch::Receiver<AgentMetrics> {
        self.inner.rx_metrics.clone()
    }

    /// A helper to wait for a metrics condition.
    pub fn wait(&self, timeout: Option<Duration>) -> Wait {
        Wait {
            timeout: timeout.unwrap_or(Duration::from_millis(500)),
            rx: self.inner.rx_metrics.clone(),
        }
    }

    /// Whether this agent is a leader which has commenced service.
    pub fn leading(&self) -> bool {
        let m = self.inner.rx_metrics.borrow();
        m.role.is_leader() && m.serving
    }

    fn send(&self, msg: AgentMsg) -> AgencyResult<()> {
        let span = tracing::debug_span!("CH");
        self.inner.tx_api.send((msg, span)).map_err(|_| AgencyError::Shutdown)
    }

    async fn call<T>(&self, make: impl FnOnce(oneshot::Sender<AgencyResult<T>>) -> AgentMsg) -> AgencyResult<T> {
        let (tx, rx) = oneshot::channel();
        self.send(make(tx))?;
        rx.await.map_err(|_| AgencyError::Shutdown)?
    }

    /// Submit write transactions. Only a serving leader accepts; the call
    /// returns once every appended entry is committed.
    #[tracing::instrument(level = "debug", skip(self, trxs), fields(id = %self.inner.id, n = trxs.len()))]
    pub async fn write(&self, trxs: Vec<WriteTransaction>) -> AgencyResult<WriteResult> {
        let client_ids: Vec<String> = trxs.iter().filter_map(|t| t.client_id.clone()).collect();
        if !client_ids.is_empty() {
            let mut ongoing = self.inner.ongoing_trxs.lock().expect("ongoing trx lock poisoned");
            ongoing.extend(client_ids.iter().cloned());
        }

        let res = self.call(|tx| AgentMsg::Write { trxs, tx }).await;

        if !client_ids.is_empty() {
            let mut ongoing = self.inner.ongoing_trxs.lock().expect("ongoing trx lock poisoned");
            for cid in &client_ids {
                ongoing.remove(cid);
            }
        }

        let res = res?;
        if !res.accepted {
            return Err(AgencyError::NotLeader {
                leader: res.leader.clone(),
            });
        }
        if res.max_index > 0 {
            match self.wait_for(res.max_index, WRITE_COMMIT_TIMEOUT).await {
                WaitForStatus::Ok => {}
                WaitForStatus::Timeout => return Err(AgencyError::Timeout),
                WaitForStatus::Unknown => return Err(AgencyError::Resigned),
            }
        }
        Ok(res)
    }

    /// Submit a mixed batch of writes and reads. Reads are served from the
    /// tentative (spearhead) state, so they observe the writes preceding
    /// them in the same batch.
    #[tracing::instrument(level = "debug", skip(self, ops), fields(id = %self.inner.id, n = ops.len()))]
    pub async fn transact(&self, ops: Vec<TransactOp>) -> AgencyResult<TransactResult> {
        let res = self.call(|tx| AgentMsg::Transact { ops, tx }).await?;
        if !res.accepted {
            return Err(AgencyError::NotLeader {
                leader: res.leader.clone(),
            });
        }
        if res.max_index > 0 {
            match self.wait_for(res.max_index, WRITE_COMMIT_TIMEOUT).await {
                WaitForStatus::Ok => {}
                WaitForStatus::Timeout => return Err(AgencyError::Timeout),
                WaitForStatus::Unknown => return Err(AgencyError::Resigned),
            }
        }
        Ok(res)
    }

    /// Apply transactions to the transient store. Not replicated.
    pub async fn transient(&self, trxs: Vec<WriteTransaction>) -> AgencyResult<Vec<bool>> {
        self.call(|tx| AgentMsg::Transient { trxs, tx }).await
    }

    /// Batch subtree reads from the committed state.
    pub async fn read(&self, queries: Vec<Vec<String>>) -> AgencyResult<Vec<ReadResult>> {
        self.call(|tx| AgentMsg::Read { queries, tx }).await
    }

    /// Long-poll for log entries past `index`; see the module docs of
    /// [`poll`](crate::agent::poll) for the envelope semantics.
    pub async fn poll(&self, index: LogIndex, poll_timeout: Duration) -> AgencyResult<PollResult> {
        let (tx, rx) = oneshot::channel();
        self.send(AgentMsg::Poll {
            index,
            timeout: poll_timeout,
            tx,
        })?;
        // The core guarantees a reply at the deadline; the outer timeout
        // only guards against the core dying underneath us.
        match timeout(poll_timeout + Duration::from_secs(5), rx).await {
            Ok(Ok(res)) => res,
            Ok(Err(_)) | Err(_) => Err(AgencyError::Shutdown),
        }
    }

    /// Report the log indexes of transactions bearing the given client
    /// ids. Blocks while any of the ids is still between arrival and local
    /// append on this agent.
    #[tracing::instrument(level = "debug", skip(self), fields(id = %self.inner.id))]
    pub async fn inquire(&self, client_ids: Vec<String>) -> AgencyResult<InquireResult> {
        loop {
            let in_flight = {
                let ongoing = self.inner.ongoing_trxs.lock().expect("ongoing trx lock poisoned");
                client_ids.iter().any(|cid| ongoing.contains(cid))
            };
            if !in_flight {
                break;
            }
            sleep(INQUIRE_POLL_INTERVAL).await;
        }
        self.call(|tx| AgentMsg::InquireLookup { client_ids, tx }).await
    }

    /// Exchange pool gossip with this agent.
    pub async fn gossip(&self, rpc: GossipRequest) -> AgencyResult<GossipResponse> {
        self.call(|tx| AgentMsg::Gossip { rpc, tx }).await
    }

    /// Peer RPC: append entries / heartbeat.
    #[tracing::instrument(level = "trace", skip(self, rpc), fields(rpc = %rpc.summary()))]
    pub async fn append_entries(&self, rpc: AppendEntriesRequest) -> AgencyResult<AppendEntriesResponse> {
        self.call(|tx| AgentMsg::AppendEntries { rpc, tx }).await
    }

    /// Peer RPC: request vote.
    #[tracing::instrument(level = "trace", skip(self, rpc), fields(rpc = %rpc.summary()))]
    pub async fn request_vote(&self, rpc: VoteRequest) -> AgencyResult<VoteResponse> {
        self.call(|tx| AgentMsg::RequestVote { rpc, tx }).await
    }

    /// Register a post-commit trigger for all paths under `prefix`.
    pub async fn subscribe(&self, prefix: impl Into<String>) -> AgencyResult<mpsc::UnboundedReceiver<String>> {
        let (paths_tx, paths_rx) = mpsc::unbounded_channel();
        let (tx, rx) = oneshot::channel();
        self.send(AgentMsg::Subscribe {
            prefix: prefix.into(),
            paths: paths_tx,
            tx,
        })?;
        rx.await.map_err(|_| AgencyError::Shutdown)?;
        Ok(paths_rx)
    }

    /// The agent's configuration report.
    pub async fn config(&self) -> AgencyResult<ConfigReport> {
        let (tx, rx) = oneshot::channel();
        self.send(AgentMsg::Config { tx })?;
        rx.await.map_err(|_| AgencyError::Shutdown)
    }

    /// The agent's retained log and commit frontier.
    pub async fn state(&self) -> AgencyResult<StateReport> {
        let (tx, rx) = oneshot::channel();
        self.send(AgentMsg::State { tx })?;
        rx.await.map_err(|_| AgencyError::Shutdown)
    }

    /// Dumps of the committed, tentative and transient store replicas.
    pub async fn stores(&self) -> AgencyResult<StoresReport> {
        let (tx, rx) = oneshot::channel();
        self.send(AgentMsg::Stores { tx })?;
        rx.await.map_err(|_| AgencyError::Shutdown)
    }

    /// Wait until `commit_index >= index`. The deadline re-arms whenever
    /// commit progresses, to tell a stuck leader from a slow one.
    pub async fn wait_for(&self, index: LogIndex, wait_timeout: Duration) -> WaitForStatus {
        let mut rx = self.inner.rx_metrics.clone();
        let mut last_commit = rx.borrow().commit_index;
        let mut deadline = Instant::now() + wait_timeout;
        loop {
            {
                let m = rx.borrow();
                if m.commit_index >= index {
                    return WaitForStatus::Ok;
                }
                if !m.role.is_leader() {
                    return WaitForStatus::Unknown;
                }
            }
            let now = Instant::now();
            if now >= deadline {
                return WaitForStatus::Timeout;
            }
            match timeout(deadline - now, rx.changed()).await {
                Ok(Ok(())) => {
                    let commit = rx.borrow().commit_index;
                    if commit > last_commit {
                        last_commit = commit;
                        deadline = Instant::now() + wait_timeout;
                    }
                }
                Ok(Err(_)) => return WaitForStatus::Unknown,
                Err(_) => return WaitForStatus::Timeout,
            }
        }
    }

    /// Shut the agent down and await its task.
    pub async fn shutdown(&self) -> AgencyResult<()> {
        if let Some(tx) = self.inner.tx_shutdown.lock().await.take() {
            let _ = tx.send(());
        }
        if let Some(handle) = self.inner.core_handle.lock().await.take() {
            let _ = handle.await.map_err(|e| AgencyError::Storage(anyhow::anyhow!(e)))?;
        }
        Ok(())
    }
}

/// A pending gossip reply that must wait for a reconfiguration commit.
pub(crate) struct PendingGossip {
    pub index: LogIndex,
    pub response: GossipResponse,
    pub tx: oneshot::Sender<AgencyResult<GossipResponse>>,
}

/// The core task owning all agent state.
pub(crate) struct AgentCore<N: AgencyNetwork, S: AgencyStorage> {
    config: Arc<Config>,
    cluster: ClusterConfig,
    network: Arc<N>,
    storage: Arc<S>,

    role: Role,
    current_term: Term,
    voted_for: Option<AgentId>,
    leader: Option<AgentId>,

    state: State,
    /// Committed state, exactly at `commit_index`.
    read_db: Store,
    /// Tentative leader state, ahead of `commit_index`.
    spearhead: Store,
    /// Non-replicated store, cleared on leader change.
    transient: Store,
    commit_index: LogIndex,
    /// True on a leader whose reconfiguration entry has committed.
    serving: bool,

    last_heartbeat: Option<Instant>,
    next_election_timeout: Option<Instant>,

    /// Long-poll promises keyed by an insertion id.
    poll_promises: BTreeMap<u64, poll::PollPromise>,
    next_promise_id: u64,
    /// Smallest start index among registered promises, 0 when none.
    lowest_promise: LogIndex,

    /// Gossip replies deferred until their reconfiguration entry commits.
    pending_gossip: Vec<PendingGossip>,

    /// A sender into our own api channel, used by background tasks (e.g.
    /// gossip rounds) to fold results back into the core.
    tx_api: mpsc::UnboundedSender<(AgentMsg, Span)>,
    rx_api: mpsc::UnboundedReceiver<(AgentMsg, Span)>,
    tx_metrics: watch::Sender<AgentMetrics>,
    rx_shutdown: oneshot::Receiver<()>,
}

impl<N: AgencyNetwork, S: AgencyStorage> AgentCore<N, S> {
    pub(crate) fn spawn(
        config: Arc<Config>,
        cluster: ClusterConfig,
        network: Arc<N>,
        storage: Arc<S>,
        tx_api: mpsc::UnboundedSender<(AgentMsg, Span)>,
        rx_api: mpsc::UnboundedReceiver<(AgentMsg, Span)>,
        tx_metrics: watch::Sender<AgentMetrics>,
        rx_shutdown: oneshot::Receiver<()>,
    ) -> JoinHandle<AgencyResult<()>> {
        let this = Self {
            config,
            cluster,
            network,
            storage,
            role: Role::Follower,
            current_term: 0,
            voted_for: None,
            leader: None,
            state: State::new(),
            read_db: Store::new(),
            spearhead: Store::new(),
            transient: Store::new(),
            commit_index: 0,
            serving: false,
            last_heartbeat: None,
            next_election_timeout: None,
            poll_promises: BTreeMap::new(),
            next_promise_id: 0,
            lowest_promise: 0,
            pending_gossip: Vec::new(),
            tx_api,
            rx_api,
            tx_metrics,
            rx_shutdown,
        };
        tokio::spawn(this.main().instrument(tracing::debug_span!("spawn")))
    }

    #[tracing::instrument(level = "debug", skip(self), fields(id = %self.config.id))]
    async fn main(mut self) -> AgencyResult<()> {
        tracing::debug!("agent is initializing");

        let recovered = self.storage.recover().await.map_err(|e| self.map_fatal_storage_error(e))?;
        self.current_term = recovered.vote.term;
        self.voted_for = recovered.vote.voted_for;
        self.state = State::from_parts(recovered.snapshot, recovered.entries);
        // The commit index must be re-learned from a leader; it is unsafe
        // to initialize it to anything but the snapshot boundary.
        self.commit_index = self.state.last_compaction_at();
        self.rebuild_stores()?;

        // A restarted agent must not disrupt a stable cluster; give the
        // network a moment before the first election can fire.
        self.next_election_timeout =
            Some(Instant::now() + Duration::from_millis(self.config.new_rand_election_timeout()));
        self.report_metrics();

        loop {
            match self.role {
                Role::Leader => leader::LeaderState::new(&mut self).run().await?,
                Role::Candidate => CandidateState::new(&mut self).run().await?,
                Role::Follower => FollowerState::new(&mut self).run().await?,
                Role::Shutdown => {
                    tracing::info!(id = %self.config.id, "agent has shut down");
                    return Ok(());
                }
            }
        }
    }

    /// Rebuild both store replicas from the snapshot and the log:
    /// `read_db` up to the commit index, `spearhead` over the full log.
    fn rebuild_stores(&mut self) -> AgencyResult<()> {
        let mut db = match self.state.last_compacted_snapshot() {
            Some(snap) => Store::from_snapshot(&snap.store)?,
            None => Store::new(),
        };
        let first = self.state.first_index().max(self.state.last_compaction_at() + 1);
        for (payload, ts) in self.state.slices(first, self.commit_index) {
            db.apply_log_payload(&payload, ts)?;
        }
        // Adopt the rebuilt data in place so registered triggers survive.
        self.read_db.restore_from_snapshot(&db.to_snapshot())?;

        self.spearhead = self.read_db.clone_data();
        for (payload, ts) in self.state.slices(self.commit_index + 1, self.state.last_index()) {
            self.spearhead.apply_log_payload(&payload, ts)?;
        }
        Ok(())
    }

    fn report_metrics(&mut self) {
        let res = self.tx_metrics.send(AgentMetrics {
            id: self.config.id.clone(),
            role: self.role,
            term: self.current_term,
            last_log_index: self.state.last_index(),
            commit_index: self.commit_index,
            leader: self.leader.clone(),
            serving: self.serving,
            last_compaction_at: self.state.last_compaction_at(),
        });
        if let Err(err) = res {
            tracing::error!(error = %err, id = %self.config.id, "error reporting metrics");
        }
    }

    /// Persist the vote record. Fatal on failure.
    async fn save_vote(&mut self) -> AgencyResult<()> {
        let vote = PersistedVote {
            term: self.current_term,
            voted_for: self.voted_for.clone(),
        };
        self.storage.save_vote(&vote).await.map_err(|e| self.map_fatal_storage_error(e))
    }

    fn set_role(&mut self, role: Role) {
        if self.role != role {
            tracing::info!(id = %self.config.id, from = ?self.role, to = ?role, "role transition");
        }
        self.role = role;
        if !role.is_leader() {
            // No external read may observe post-resignation values until a
            // new leader commences service.
            self.serving = false;
        }
    }

    fn get_next_election_timeout(&mut self) -> Instant {
        match self.next_election_timeout {
            Some(inst) => inst,
            None => {
                let t = Duration::from_millis(self.config.new_rand_election_timeout());
                let inst = Instant::now() + t;
                self.next_election_timeout = Some(inst);
                inst
            }
        }
    }

    fn update_next_election_timeout(&mut self, heartbeat: bool) {
        let now = Instant::now();
        self.next_election_timeout = Some(now + Duration::from_millis(self.config.new_rand_election_timeout()));
        if heartbeat {
            self.last_heartbeat = Some(now);
        }
    }

    fn update_current_term(&mut self, new_term: Term, voted_for: Option<AgentId>) {
        if new_term > self.current_term {
            self.current_term = new_term;
            self.voted_for = voted_for;
        }
    }

    fn map_fatal_storage_error(&mut self, err: anyhow::Error) -> AgencyError {
        tracing::error!(error = ?err, id = %self.config.id, "fatal storage error, shutting down");
        self.set_role(Role::Shutdown);
        AgencyError::Storage(err)
    }

    /// Apply committed slices into the committed store, advancing
    /// `commit_index` to `to`. Fires triggers, wakes pollers, adopts any
    /// committed reconfiguration and compacts when due.
    fn apply_committed(&mut self, to: LogIndex) -> AgencyResult<()> {
        if to <= self.commit_index {
            return Ok(());
        }
        let entries = self.state.get(self.commit_index + 1, to);
        let mut reconfigured = false;
        for entry in &entries {
            self.read_db.apply_log_payload(&entry.query, entry.timestamp_ms).map_err(|e| {
                tracing::error!(error = %e, index = entry.index, "malformed committed entry");
                e
            })?;
            if payload_touches(&entry.query, RECONFIGURE_KEY) {
                reconfigured = true;
            }
        }
        self.commit_index = to;

        if reconfigured {
            self.adopt_reconfiguration();
        }
        self.wake_poll_promises();
        self.settle_pending_gossip();
        self.report_metrics();
        Ok(())
    }

    /// Adopt a committed reconfiguration from the committed store.
    fn adopt_reconfiguration(&mut self) {
        let Some(value) = self.read_db.get(RECONFIGURE_KEY) else {
            return;
        };
        match serde_json::from_value::<Reconfiguration>(value) {
            Ok(rc) => {
                tracing::info!(id = %self.config.id, active = ?rc.active, "adopting committed reconfiguration");
                self.cluster.active = rc.active;
                self.cluster.pool = rc.pool;
                self.cluster.size = rc.size;
                self.cluster.timeout_mult = rc.timeout_mult;
            }
            Err(err) => {
                tracing::error!(error = %err, "unreadable reconfiguration entry");
            }
        }
    }

    /// Reply to gossip messages whose reconfiguration entry has committed.
    fn settle_pending_gossip(&mut self) {
        let commit = self.commit_index;
        let (ready, waiting): (Vec<_>, Vec<_>) =
            self.pending_gossip.drain(..).partition(|p| p.index <= commit);
        self.pending_gossip = waiting;
        for p in ready {
            let _ = p.tx.send(Ok(p.response));
        }
    }

    /// Run compaction when the committed range has grown past the step.
    async fn compact_if_due(&mut self) -> AgencyResult<()> {
        let due = self.commit_index >= self.state.last_compaction_at() + self.config.compaction_step;
        if !due {
            return Ok(());
        }
        if self.state.compact(self.commit_index, self.config.compaction_keep_size)? {
            if let Some(snap) = self.state.last_compacted_snapshot().cloned() {
                tracing::debug!(id = %self.config.id, index = snap.index, "compacted log");
                self.storage.save_snapshot(&snap).await.map_err(|e| self.map_fatal_storage_error(e))?;
            }
            self.report_metrics();
        }
        Ok(())
    }

    /// Drop expired keys from all store replicas.
    fn clear_expired_keys(&mut self) {
        let now = epoch_ms();
        self.read_db.clear_expired(now);
        self.spearhead.clear_expired(now);
        self.transient.clear_expired(now);
    }

    fn not_leader<T>(&self) -> AgencyResult<T> {
        Err(AgencyError::NotLeader {
            leader: self.leader.clone(),
        })
    }

    /// Handle messages that behave the same in every role.
    fn handle_common(&mut self, msg: AgentMsg) {
        match msg {
            AgentMsg::Read { queries, tx } => {
                let res = if self.role.is_leader() && self.serving {
                    Ok(self.read_db.read(&queries))
                } else {
                    self.not_leader()
                };
                let _ = tx.send(res);
            }
            AgentMsg::InquireLookup { client_ids, tx } => {
                let _ = tx.send(Ok(InquireResult {
                    indexes: self.state.find_client_indexes(&client_ids),
                }));
            }
            AgentMsg::Subscribe { prefix, paths, tx } => {
                self.read_db.register_prefix_trigger(prefix, paths);
                let _ = tx.send(());
            }
            AgentMsg::Config { tx } => {
                let _ = tx.send(ConfigReport {
                    id: self.config.id.clone(),
                    endpoint: self.config.endpoint.clone(),
                    term: self.current_term,
                    role: self.role,
                    leader: self.leader.clone(),
                    serving: self.serving,
                    commit_index: self.commit_index,
                    last_log_index: self.state.last_index(),
                    last_compaction_at: self.state.last_compaction_at(),
                    cluster: self.cluster.clone(),
                });
            }
            AgentMsg::State { tx } => {
                let _ = tx.send(StateReport {
                    first_index: self.state.first_index(),
                    last_index: self.state.last_index(),
                    commit_index: self.commit_index,
                    last_compaction_at: self.state.last_compaction_at(),
                    log: self.state.entries().cloned().collect(),
                });
            }
            AgentMsg::Stores { tx } => {
                let _ = tx.send(StoresReport {
                    read_db: self.read_db.to_value(),
                    spearhead: self.spearhead.to_value(),
                    transient: self.transient.to_value(),
                });
            }
            AgentMsg::Transient { tx, .. } => {
                let _ = tx.send(self.not_leader());
            }
            AgentMsg::Write { tx, .. } => {
                let _ = tx.send(Ok(WriteResult {
                    accepted: false,
                    leader: self.leader.clone(),
                    applied: Vec::new(),
                    indexes: Vec::new(),
                    max_index: 0,
                }));
            }
            AgentMsg::Transact { tx, .. } => {
                let _ = tx.send(Ok(TransactResult {
                    accepted: false,
                    leader: self.leader.clone(),
                    max_index: 0,
                    failed: 0,
                    results: Vec::new(),
                }));
            }
            AgentMsg::Poll { tx, .. } => {
                let _ = tx.send(self.not_leader());
            }
            AgentMsg::AppendEntries { .. } | AgentMsg::RequestVote { .. } | AgentMsg::Gossip { .. } => {
                // Role loops route these to their handlers before calling
                // into here.
                tracing::error!("protocol message reached the common handler");
            }
        }
    }
}

/// Does a log payload touch the given path?
fn payload_touches(payload: &Value, path: &str) -> bool {
    payload
        .as_array()
        .map(|trxs| {
            trxs.iter().any(|ops| ops.as_object().map(|o| o.contains_key(path)).unwrap_or(false))
        })
        .unwrap_or(false)
}

///////////////////////////////////////////////////////////////////////////////////////////////////

/// Volatile follower-state loop.
struct FollowerState<'a, N: AgencyNetwork, S: AgencyStorage> {
    core: &'a mut AgentCore<N, S>,
}

impl<'a, N: AgencyNetwork, S: AgencyStorage> FollowerState<'a, N, S> {
    fn new(core: &'a mut AgentCore<N, S>) -> Self {
        Self { core }
    }

    #[tracing::instrument(level = "debug", skip(self), fields(id = %self.core.config.id, role = "follower"))]
    async fn run(self) -> AgencyResult<()> {
        self.core.report_metrics();
        let mut gossip_tick = tokio::time::interval(Duration::from_secs(1));
        loop {
            if !self.core.role.is_follower() {
                return Ok(());
            }
            let election_timeout = sleep_until(self.core.get_next_election_timeout());

            tokio::select! {
                _ = election_timeout => {
                    // Only assembled, active members campaign.
                    if self.core.cluster.pool_complete() && self.core.cluster.is_active(&self.core.config.id) {
                        self.core.set_role(Role::Candidate);
                    } else {
                        self.core.update_next_election_timeout(false);
                    }
                }
                _ = gossip_tick.tick() => {
                    self.core.clear_expired_keys();
                    if !self.core.cluster.pool_complete() {
                        self.core.spawn_gossip_round();
                    }
                }
                Some((msg, span)) = self.core.rx_api.recv() => {
                    let _ent = span.enter();
                    match msg {
                        AgentMsg::AppendEntries { rpc, tx } => {
                            let _ = tx.send(self.core.handle_append_entries(rpc).await);
                        }
                        AgentMsg::RequestVote { rpc, tx } => {
                            let _ = tx.send(self.core.handle_vote_request(rpc).await);
                        }
                        AgentMsg::Gossip { rpc, tx } => {
                            self.core.handle_gossip(rpc, tx).await?;
                        }
                        other => self.core.handle_common(other),
                    }
                }
                Ok(_) = &mut self.core.rx_shutdown => {
                    self.core.set_role(Role::Shutdown);
                }
            }
        }
    }
}

///////////////////////////////////////////////////////////////////////////////////////////////////

/// Volatile candidate-state loop. Each outer iteration is a new term.
struct CandidateState<'a, N: AgencyNetwork, S: AgencyStorage> {
    core: &'a mut AgentCore<N, S>,
    votes_granted: usize,
    votes_needed: usize,
}

impl<'a, N: AgencyNetwork, S: AgencyStorage> CandidateState<'a, N, S> {
    fn new(core: &'a mut AgentCore<N, S>) -> Self {
        Self {
            core,
            votes_granted: 0,
            votes_needed: 0,
        }
    }

    #[tracing::instrument(level = "debug", skip(self), fields(id = %self.core.config.id, role = "candidate"))]
    async fn run(mut self) -> AgencyResult<()> {
        loop {
            if !self.core.role.is_candidate() {
                return Ok(());
            }

            // New term: vote for ourselves and persist before campaigning.
            self.votes_granted = 1;
            self.votes_needed = crate::majority_of(self.core.cluster.active.len());
            self.core.update_next_election_timeout(false);
            self.core.current_term += 1;
            self.core.voted_for = Some(self.core.config.id.clone());
            self.core.leader = None;
            self.core.save_vote().await?;
            self.core.report_metrics();

            tracing::info!(id = %self.core.config.id, term = self.core.current_term, "campaigning");
            let mut pending_votes = self.spawn_parallel_vote_requests();

            loop {
                if !self.core.role.is_candidate() {
                    return Ok(());
                }
                if self.votes_granted >= self.votes_needed {
                    tracing::info!(id = %self.core.config.id, term = self.core.current_term, "won election");
                    self.core.set_role(Role::Leader);
                    return Ok(());
                }
                let timeout_fut = sleep_until(self.core.get_next_election_timeout());

                tokio::select! {
                    // Election timed out: restart with a new term.
                    _ = timeout_fut => break,
                    Some((peer, res)) = pending_votes.recv() => {
                        self.handle_vote_response(peer, res).await?;
                    }
                    Some((msg, span)) = self.core.rx_api.recv() => {
                        let _ent = span.enter();
                        match msg {
                            AgentMsg::AppendEntries { rpc, tx } => {
                                let _ = tx.send(self.core.handle_append_entries(rpc).await);
                            }
                            AgentMsg::RequestVote { rpc, tx } => {
                                let _ = tx.send(self.core.handle_vote_request(rpc).await);
                            }
                            AgentMsg::Gossip { rpc, tx } => {
                                self.core.handle_gossip(rpc, tx).await?;
                            }
                            other => self.core.handle_common(other),
                        }
                    }
                    Ok(_) = &mut self.core.rx_shutdown => {
                        self.core.set_role(Role::Shutdown);
                    }
                }
            }
        }
    }

    /// Fire vote requests to all active peers, results on a channel.
    fn spawn_parallel_vote_requests(&self) -> mpsc::Receiver<(AgentId, VoteResponse)> {
        let (tx, rx) = mpsc::channel(self.core.cluster.active.len().max(1));
        let rpc = VoteRequest {
            term: self.core.current_term,
            candidate_id: self.core.config.id.clone(),
            last_log_index: self.core.state.last_index(),
            last_log_term: self.core.state.last_term(),
        };
        for peer in self.core.cluster.active.iter().filter(|p| **p != self.core.config.id) {
            let network = self.core.network.clone();
            let peer = peer.clone();
            let rpc = rpc.clone();
            let tx = tx.clone();
            tokio::spawn(
                async move {
                    match network.request_vote(&peer, rpc).await {
                        Ok(res) => {
                            let _ = tx.send((peer, res)).await;
                        }
                        Err(err) => {
                            tracing::warn!(error = %err, target = %peer, "error requesting vote");
                        }
                    }
                }
                .instrument(tracing::debug_span!("vote-request")),
            );
        }
        rx
    }

    async fn handle_vote_response(&mut self, peer: AgentId, res: VoteResponse) -> AgencyResult<()> {
        if res.term > self.core.current_term {
            tracing::debug!(id = %self.core.config.id, peer = %peer, "newer term observed, reverting to follower");
            self.core.update_current_term(res.term, None);
            self.core.save_vote().await?;
            self.core.set_role(Role::Follower);
            return Ok(());
        }
        if res.vote_granted {
            self.votes_granted += 1;
        }
        Ok(())
    }
}
