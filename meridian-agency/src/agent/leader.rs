//! The leader loop: write paths, per-follower replication bookkeeping,
//! commit advancement and the leadership self-check.

use std::collections::BTreeMap;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::mpsc;
use tokio::sync::oneshot;
use tokio::time::sleep_until;
use tokio::time::Instant;
use tracing::Span;
use tracing_futures::Instrument;

use crate::agent::epoch_ms;
use crate::agent::AgentCore;
use crate::agent::AgentMsg;
use crate::agent::TransactOp;
use crate::agent::TransactResult;
use crate::agent::WriteResult;
use crate::agent::RECONFIGURE_KEY;
use crate::config::Reconfiguration;
use crate::error::AgencyResult;
use crate::network::AgencyNetwork;
use crate::network::AppendEntriesRequest;
use crate::state::LogEntry;
use crate::storage::AgencyStorage;
use crate::store::parse_ops;
use crate::store::WriteTransaction;
use crate::AgentId;
use crate::LogIndex;
use crate::MessageSummary;
use crate::Role;

/// Backoff while a package to a peer is in flight.
const IN_FLIGHT_GUARD: Duration = Duration::from_secs(30);

/// Backoff after a failed package.
const FAILURE_BACKOFF: Duration = Duration::from_secs(1);

/// Leader-side bookkeeping for one follower.
#[derive(Clone, Debug)]
pub struct FollowerData {
    /// Highest index the follower confirmed. Monotonic per (term, peer).
    pub last_acked_index: LogIndex,
    /// Time of the last successful reply of any kind.
    pub last_acked_time: Option<Instant>,
    /// Time of the last successful empty-heartbeat reply.
    pub last_empty_acked: Option<Instant>,
    /// Time the last package was dispatched.
    pub last_sent: Option<Instant>,
    /// No entry package may be dispatched before this instant.
    pub earliest_package: Instant,
}

impl FollowerData {
    fn new(now: Instant) -> Self {
        Self {
            last_acked_index: 0,
            last_acked_time: Some(now),
            last_empty_acked: None,
            last_sent: None,
            earliest_package: now,
        }
    }
}

/// An event reported by a dispatched append-entries task.
#[derive(Debug)]
pub(super) enum ReplicaEvent {
    Acked {
        target: AgentId,
        highest: LogIndex,
        sent_entries: bool,
    },
    Failed {
        target: AgentId,
        sent_entries: bool,
    },
    HigherTerm {
        target: AgentId,
        term: u64,
    },
}

impl MessageSummary for ReplicaEvent {
    fn summary(&self) -> String {
        match self {
            ReplicaEvent::Acked {
                target,
                highest,
                sent_entries,
            } => format!("Acked: target={}, highest={}, entries={}", target, highest, sent_entries),
            ReplicaEvent::Failed { target, sent_entries } => {
                format!("Failed: target={}, entries={}", target, sent_entries)
            }
            ReplicaEvent::HigherTerm { target, term } => {
                format!("HigherTerm: target={}, term={}", target, term)
            }
        }
    }
}

/// Volatile leader state.
pub(super) struct LeaderState<'a, N: AgencyNetwork, S: AgencyStorage> {
    pub(super) core: &'a mut AgentCore<N, S>,
    pub(super) followers: BTreeMap<AgentId, FollowerData>,
    replication_tx: mpsc::UnboundedSender<(ReplicaEvent, Span)>,
    replication_rx: mpsc::UnboundedReceiver<(ReplicaEvent, Span)>,
    /// Index of this term's reconfiguration entry; service commences only
    /// once it has committed and the log has no uncommitted tail.
    reconfigure_index: LogIndex,
}

impl<'a, N: AgencyNetwork, S: AgencyStorage> LeaderState<'a, N, S> {
    pub(super) fn new(core: &'a mut AgentCore<N, S>) -> Self {
        let (replication_tx, replication_rx) = mpsc::unbounded_channel();
        Self {
            core,
            followers: BTreeMap::new(),
            replication_tx,
            replication_rx,
            reconfigure_index: 0,
        }
    }

    #[tracing::instrument(level = "debug", skip(self), fields(id = %self.core.config.id, role = "leader"))]
    pub(super) async fn run(mut self) -> AgencyResult<()> {
        let id = self.core.config.id.clone();
        self.core.leader = Some(id.clone());
        self.core.last_heartbeat = None;
        self.core.next_election_timeout = None;
        // The transient store does not survive a leader change.
        self.core.transient.clear();

        // Rebuild both store replicas from snapshot + log before serving.
        self.core.rebuild_stores()?;
        self.sync_followers();
        self.core.report_metrics();

        // Persist this term's reconfiguration; it doubles as the entry a
        // fresh leader commits to learn the commit frontier of its term.
        let rc = Reconfiguration {
            term: self.core.current_term,
            id: id.clone(),
            active: self.core.cluster.active.clone(),
            pool: self.core.cluster.pool.clone(),
            size: self.core.cluster.size,
            timeout_mult: self.core.cluster.timeout_mult,
        };
        let ops = serde_json::json!({
            RECONFIGURE_KEY: {"op": "set", "new": serde_json::to_value(&rc).unwrap_or(Value::Null)}
        });
        self.reconfigure_index = self.append_internal_entry(ops).await?;
        self.send_append_entries();
        self.advance_commit_index().await?;

        let mut heartbeat =
            tokio::time::interval(Duration::from_millis(self.core.config.heartbeat_interval_ms()));

        loop {
            if !self.core.role.is_leader() {
                tracing::info!(id = %id, to = ?self.core.role, "resigning leadership");
                self.core.resign_poll_promises();
                self.core.fail_pending_gossip();
                self.core.transient.clear();
                // Keep a successor hint if one was already learned.
                if self.core.leader.as_deref() == Some(id.as_str()) {
                    self.core.leader = None;
                }
                self.core.report_metrics();
                return Ok(());
            }

            self.sync_followers();
            let poll_deadline = sleep_until(self.core.next_poll_deadline());

            tokio::select! {
                _ = heartbeat.tick() => {
                    self.core.clear_expired_keys();
                    self.challenge_leadership();
                    self.send_append_entries();
                    self.send_heartbeats();
                }
                _ = poll_deadline => {
                    self.core.expire_poll_promises();
                }
                Some((event, span)) = self.replication_rx.recv() => {
                    let _ent = span.enter();
                    tracing::debug!("replica event: {}", event.summary());
                    self.handle_replica_event(event).await?;
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
                            self.handle_gossip_as_leader(rpc, tx).await?;
                        }
                        AgentMsg::Write { trxs, tx } => {
                            self.handle_write(trxs, tx).await?;
                        }
                        AgentMsg::Transact { ops, tx } => {
                            self.handle_transact(ops, tx).await?;
                        }
                        AgentMsg::Transient { trxs, tx } => {
                            self.handle_transient(trxs, tx);
                        }
                        AgentMsg::Poll { index, timeout, tx } => {
                            self.core.handle_poll(index, timeout, tx);
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

    /// Ensure one bookkeeping slot per active peer, dropping slots of
    /// peers that left the active set.
    pub(super) fn sync_followers(&mut self) {
        let now = Instant::now();
        let id = self.core.config.id.clone();
        let active: Vec<AgentId> =
            self.core.cluster.active.iter().filter(|p| **p != id).cloned().collect();
        for peer in &active {
            self.followers.entry(peer.clone()).or_insert_with(|| FollowerData::new(now));
        }
        self.followers.retain(|peer, _| active.iter().any(|a| a == peer));
    }

    /// Append an internally generated transaction (no client id), applying
    /// it to the spearhead and persisting it.
    pub(super) async fn append_internal_entry(&mut self, ops_value: Value) -> AgencyResult<LogIndex> {
        let now = epoch_ms();
        let parsed = parse_ops(&ops_value)?;
        self.core.spearhead.apply_ops(&parsed, now);
        let index = self.core.state.log_leader_single(ops_value, self.core.current_term, now, None);
        self.persist_tail(index).await?;
        self.core.report_metrics();
        Ok(index)
    }

    /// Persist all entries from `from` to the log tail.
    async fn persist_tail(&mut self, from: LogIndex) -> AgencyResult<()> {
        let entries = self.core.state.get(from, self.core.state.last_index());
        if entries.is_empty() {
            return Ok(());
        }
        self.core
            .storage
            .append_entries(&entries)
            .await
            .map_err(|e| self.core.map_fatal_storage_error(e))
    }

    /// The write path: evaluate preconditions against the spearhead, apply
    /// passing transactions there, append them to the log.
    #[tracing::instrument(level = "debug", skip(self, trxs, tx), fields(n = trxs.len()))]
    pub(super) async fn handle_write(
        &mut self,
        trxs: Vec<WriteTransaction>,
        tx: oneshot::Sender<AgencyResult<WriteResult>>,
    ) -> AgencyResult<()> {
        if !self.core.serving {
            let _ = tx.send(Ok(WriteResult {
                accepted: false,
                leader: Some(self.core.config.id.clone()),
                applied: Vec::new(),
                indexes: Vec::new(),
                max_index: 0,
            }));
            return Ok(());
        }

        let now = epoch_ms();
        let mut applied = Vec::with_capacity(trxs.len());
        let mut indexes = Vec::with_capacity(trxs.len());
        let mut first_new = 0;
        for trx in &trxs {
            let ok = self.core.spearhead.check(&trx.preconditions);
            applied.push(ok);
            if !ok {
                indexes.push(0);
                continue;
            }
            self.core.spearhead.apply_ops(&trx.ops, now);
            let index = self.core.state.log_leader_single(
                trx.ops_to_value(),
                self.core.current_term,
                now,
                trx.client_id.clone(),
            );
            if first_new == 0 {
                first_new = index;
            }
            indexes.push(index);
        }

        if first_new > 0 {
            self.persist_tail(first_new).await?;
        }
        let max_index = indexes.iter().copied().max().unwrap_or(0);
        self.core.report_metrics();

        let _ = tx.send(Ok(WriteResult {
            accepted: true,
            leader: Some(self.core.config.id.clone()),
            applied,
            indexes,
            max_index,
        }));

        self.send_append_entries();
        self.advance_commit_index().await
    }

    /// The transact path: a mixed batch of writes and spearhead reads,
    /// evaluated in order against the tentative state.
    #[tracing::instrument(level = "debug", skip(self, ops, tx), fields(n = ops.len()))]
    pub(super) async fn handle_transact(
        &mut self,
        ops: Vec<TransactOp>,
        tx: oneshot::Sender<AgencyResult<TransactResult>>,
    ) -> AgencyResult<()> {
        if !self.core.serving {
            let _ = tx.send(Ok(TransactResult {
                accepted: false,
                leader: Some(self.core.config.id.clone()),
                max_index: 0,
                failed: 0,
                results: Vec::new(),
            }));
            return Ok(());
        }

        let now = epoch_ms();
        let mut results = Vec::with_capacity(ops.len());
        let mut failed = 0;
        let mut max_index = 0;
        let mut first_new = 0;
        for op in &ops {
            match op {
                TransactOp::Write(trx) => {
                    if self.core.spearhead.check(&trx.preconditions) {
                        self.core.spearhead.apply_ops(&trx.ops, now);
                        let index = self.core.state.log_leader_single(
                            trx.ops_to_value(),
                            self.core.current_term,
                            now,
                            trx.client_id.clone(),
                        );
                        if first_new == 0 {
                            first_new = index;
                        }
                        max_index = max_index.max(index);
                        results.push(Value::from(index));
                    } else {
                        failed += 1;
                        results.push(Value::from(0u64));
                    }
                }
                TransactOp::Read(paths) => {
                    let mut reads = self.core.spearhead.read(&[paths.clone()]);
                    results.push(reads.pop().map(|r| r.value).unwrap_or(Value::Null));
                }
            }
        }

        if first_new > 0 {
            self.persist_tail(first_new).await?;
        }
        self.core.report_metrics();

        let _ = tx.send(Ok(TransactResult {
            accepted: true,
            leader: Some(self.core.config.id.clone()),
            max_index,
            failed,
            results,
        }));

        self.send_append_entries();
        self.advance_commit_index().await
    }

    /// Apply transactions to the transient store. Not replicated.
    pub(super) fn handle_transient(
        &mut self,
        trxs: Vec<WriteTransaction>,
        tx: oneshot::Sender<AgencyResult<Vec<bool>>>,
    ) {
        if !self.core.serving {
            let _ = tx.send(self.core.not_leader());
            return;
        }
        let now = epoch_ms();
        let mut results = Vec::with_capacity(trxs.len());
        for trx in &trxs {
            let ok = self.core.transient.check(&trx.preconditions);
            if ok {
                self.core.transient.apply_ops(&trx.ops, now);
            }
            results.push(ok);
        }
        let _ = tx.send(Ok(results));
    }

    /// One replication pass: for every active peer with unconfirmed
    /// entries and no package in flight, dispatch the next batch, with a
    /// store snapshot prepended when the peer is behind the first retained
    /// index.
    #[tracing::instrument(level = "trace", skip(self))]
    pub(super) fn send_append_entries(&mut self) {
        let now = Instant::now();
        let last_index = self.core.state.last_index();
        let peers: Vec<AgentId> = self.followers.keys().cloned().collect();

        for peer in peers {
            let fd = match self.followers.get_mut(&peer) {
                Some(fd) => fd,
                None => continue,
            };
            if now < fd.earliest_package || last_index <= fd.last_acked_index {
                continue;
            }

            let mut last_confirmed = fd.last_acked_index;
            let mut snapshot = None;
            let first = self.core.state.first_index();
            if last_confirmed < first && first > 1 {
                // The peer is behind the first retained entry; ship the
                // committed store as of the compaction point and resend the
                // log from there, snapshot-point entry included.
                match self.core.state.last_compacted_snapshot() {
                    Some(snap) => {
                        last_confirmed = snap.index - 1;
                        snapshot = Some(snap.clone());
                    }
                    None => {
                        last_confirmed = 0;
                    }
                }
            }

            let batch_to = last_confirmed + self.core.config.max_append_size.max(1);
            let unconfirmed = self.core.state.get(last_confirmed, batch_to);
            if unconfirmed.is_empty() {
                continue;
            }

            let (prev_log_index, prev_log_term, entries) = if snapshot.is_some() || last_confirmed == 0 {
                (0, 0, unconfirmed)
            } else {
                let prev = &unconfirmed[0];
                (prev.index, prev.term, unconfirmed[1..].to_vec())
            };
            if entries.is_empty() && snapshot.is_none() {
                continue;
            }

            fd.earliest_package = now + IN_FLIGHT_GUARD;
            fd.last_sent = Some(now);
            self.dispatch(peer, prev_log_index, prev_log_term, snapshot, entries);
        }
    }

    /// Empty heartbeats for peers with nothing to replicate.
    #[tracing::instrument(level = "trace", skip(self))]
    pub(super) fn send_heartbeats(&mut self) {
        let now = Instant::now();
        let last_index = self.core.state.last_index();
        let peers: Vec<AgentId> = self.followers.keys().cloned().collect();
        for peer in peers {
            let fd = match self.followers.get_mut(&peer) {
                Some(fd) => fd,
                None => continue,
            };
            if last_index > fd.last_acked_index {
                // The entry pass covers this peer.
                continue;
            }
            fd.last_sent = Some(now);
            let prev = fd.last_acked_index;
            let prev_term = self.core.state.term_of(prev).unwrap_or(0);
            self.dispatch(peer, prev, prev_term, None, Vec::new());
        }
    }

    /// Fire one append-entries RPC on a background task; the outcome comes
    /// back through the replication channel.
    fn dispatch(
        &self,
        target: AgentId,
        prev_log_index: LogIndex,
        prev_log_term: u64,
        snapshot: Option<crate::state::CompactedSnapshot>,
        entries: Vec<LogEntry>,
    ) {
        let rpc = AppendEntriesRequest {
            term: self.core.current_term,
            leader_id: self.core.config.id.clone(),
            prev_log_index,
            prev_log_term,
            leader_commit: self.core.commit_index,
            sender_time_stamp_ms: epoch_ms(),
            snapshot,
            entries,
        };
        let sent_entries = !rpc.entries.is_empty() || rpc.snapshot.is_some();
        let network = self.core.network.clone();
        let tx = self.replication_tx.clone();
        tokio::spawn(
            async move {
                tracing::debug!(target = %target, "sending append entries: {}", rpc.summary());
                let my_term = rpc.term;
                let event = match network.append_entries(&target, rpc).await {
                    Ok(res) if res.term > my_term => ReplicaEvent::HigherTerm {
                        target,
                        term: res.term,
                    },
                    Ok(res) if res.success => ReplicaEvent::Acked {
                        target,
                        highest: res.highest,
                        sent_entries,
                    },
                    Ok(_) => ReplicaEvent::Failed { target, sent_entries },
                    Err(err) => {
                        tracing::warn!(error = %err, "error sending append entries");
                        ReplicaEvent::Failed { target, sent_entries }
                    }
                };
                let _ = tx.send((event, tracing::debug_span!("CH")));
            }
            .instrument(tracing::debug_span!("append-entries")),
        );
    }

    /// Fold a replication outcome into the follower bookkeeping.
    pub(super) async fn handle_replica_event(&mut self, event: ReplicaEvent) -> AgencyResult<()> {
        let now = Instant::now();
        match event {
            ReplicaEvent::Acked {
                target,
                highest,
                sent_entries,
            } => {
                if let Some(fd) = self.followers.get_mut(&target) {
                    fd.last_acked_index = fd.last_acked_index.max(highest);
                    fd.last_acked_time = Some(now);
                    fd.earliest_package = now;
                    if !sent_entries {
                        fd.last_empty_acked = Some(now);
                    }
                }
                self.advance_commit_index().await?;
                // Keep feeding a catching-up peer without waiting for the
                // next heartbeat tick.
                self.send_append_entries();
            }
            ReplicaEvent::Failed { target, sent_entries } => {
                if let Some(fd) = self.followers.get_mut(&target) {
                    fd.earliest_package = now + FAILURE_BACKOFF;
                    if sent_entries {
                        // Resync from scratch: the next package starts at
                        // the snapshot boundary or index 1.
                        fd.last_acked_index = 0;
                    }
                }
            }
            ReplicaEvent::HigherTerm { target, term } => {
                tracing::info!(id = %self.core.config.id, peer = %target, term, "peer at higher term, stepping down");
                self.core.update_current_term(term, None);
                self.core.save_vote().await?;
                self.core.leader = None;
                self.core.set_role(Role::Follower);
            }
        }
        Ok(())
    }

    /// Advance the commit index to the majority-acked frontier and apply
    /// the newly committed slices.
    pub(super) async fn advance_commit_index(&mut self) -> AgencyResult<()> {
        let mut acked: Vec<LogIndex> = vec![self.core.state.last_index()];
        for peer in self.core.cluster.active.clone() {
            if peer == self.core.config.id {
                continue;
            }
            acked.push(self.followers.get(&peer).map(|fd| fd.last_acked_index).unwrap_or(0));
        }
        acked.sort_unstable_by(|a, b| b.cmp(a));
        let quorum = crate::majority_of(self.core.cluster.active.len().max(1));
        let frontier = acked.get(quorum - 1).copied().unwrap_or(0);

        // Only entries of the current term commit by counting; earlier
        // terms ride along once one of ours is in.
        if frontier > self.core.commit_index && self.core.state.term_of(frontier) == Some(self.core.current_term)
        {
            self.core.apply_committed(frontier)?;
            self.check_commence_service();
            self.core.compact_if_due().await?;
        }
        Ok(())
    }

    /// Commence service once this term's reconfiguration entry committed
    /// and no uncommitted tail remains: from here the spearhead restarts
    /// from the committed state and writes are accepted.
    fn check_commence_service(&mut self) {
        if self.core.serving || self.reconfigure_index == 0 {
            return;
        }
        if self.core.commit_index >= self.reconfigure_index
            && self.core.commit_index == self.core.state.last_index()
        {
            self.core.spearhead = self.core.read_db.clone_data();
            self.core.serving = true;
            tracing::info!(id = %self.core.config.id, term = self.core.current_term, "commencing service");
            self.core.report_metrics();
        }
    }

    /// Resign when a majority of peers has not answered within the grace
    /// window.
    fn challenge_leadership(&mut self) {
        if self.core.cluster.active.len() <= 1 {
            return;
        }
        let grace = Duration::from_millis(self.core.config.leadership_grace_ms());
        let now = Instant::now();
        let good = 1 + self
            .followers
            .values()
            .filter(|fd| fd.last_acked_time.map(|t| now.duration_since(t) < grace).unwrap_or(false))
            .count();
        if good < crate::majority_of(self.core.cluster.active.len()) {
            tracing::warn!(id = %self.core.config.id, good, "leadership challenge failed, resigning");
            self.core.leader = None;
            self.core.set_role(Role::Follower);
        }
    }
}
