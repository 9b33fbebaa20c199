//! The follower-side append-entries path.

use crate::agent::AgentCore;
use crate::error::AgencyResult;
use crate::network::AgencyNetwork;
use crate::network::AppendEntriesRequest;
use crate::network::AppendEntriesResponse;
use crate::state::FollowerAppend;
use crate::storage::AgencyStorage;
use crate::MessageSummary;
use crate::Role;

impl<N: AgencyNetwork, S: AgencyStorage> AgentCore<N, S> {
    /// Handle an append-entries package from a leader: heartbeat, entry
    /// replication, or snapshot catch-up.
    #[tracing::instrument(level = "trace", skip(self, rpc), fields(rpc = %rpc.summary()))]
    pub(super) async fn handle_append_entries(
        &mut self,
        rpc: AppendEntriesRequest,
    ) -> AgencyResult<AppendEntriesResponse> {
        let sender_ts = rpc.sender_time_stamp_ms;
        if rpc.term < self.current_term {
            tracing::debug!(
                current = self.current_term,
                rpc_term = rpc.term,
                "append entries term below current term"
            );
            return Ok(self.reject(sender_ts));
        }

        self.update_next_election_timeout(true);

        if rpc.term > self.current_term {
            self.update_current_term(rpc.term, None);
            self.save_vote().await?;
        }
        if self.leader.as_ref() != Some(&rpc.leader_id) {
            self.leader = Some(rpc.leader_id.clone());
        }
        // A valid append-entries from a peer at our term or above demotes
        // a candidate or a (stale) leader.
        if !self.role.is_follower() {
            self.set_role(Role::Follower);
        }

        if let Some(snapshot) = rpc.snapshot {
            tracing::info!(id = %self.config.id, index = snapshot.index, "installing snapshot from leader");
            self.read_db.restore_from_snapshot(&snapshot.store)?;
            self.storage
                .save_snapshot(&snapshot)
                .await
                .map_err(|e| self.map_fatal_storage_error(e))?;
            self.commit_index = snapshot.index;
            self.state.restore_from_snapshot(snapshot);
        } else if rpc.prev_log_index > 0 {
            // Log consistency check: the entry preceding the package must
            // match in term, else the leader rewinds this follower.
            match self.state.term_of(rpc.prev_log_index) {
                Some(t) if t == rpc.prev_log_term => {}
                _ => {
                    tracing::debug!(
                        prev_index = rpc.prev_log_index,
                        prev_term = rpc.prev_log_term,
                        "log consistency check failed"
                    );
                    self.report_metrics();
                    return Ok(self.reject(sender_ts));
                }
            }
        }

        // The frontier this package proves matched: the last shipped entry,
        // or the agreed-on previous entry for a bare heartbeat. The local
        // log may extend further with entries from an older leader; those
        // are neither acknowledged nor committed here.
        let mut matched = rpc.entries.last().map(|e| e.index).unwrap_or(rpc.prev_log_index);

        if !rpc.entries.is_empty() {
            match self.state.log_follower(&rpc.entries) {
                FollowerAppend::Appended(_) => {
                    self.storage
                        .append_entries(&rpc.entries)
                        .await
                        .map_err(|e| self.map_fatal_storage_error(e))?;
                }
                FollowerAppend::Rejected => {
                    tracing::debug!("non-contiguous entries rejected");
                    self.report_metrics();
                    return Ok(self.reject(sender_ts));
                }
            }
        }
        matched = matched.min(self.state.last_index());

        let new_commit = rpc.leader_commit.min(matched);
        if new_commit > self.commit_index {
            self.apply_committed(new_commit)?;
        }
        self.compact_if_due().await?;
        self.report_metrics();

        Ok(AppendEntriesResponse {
            term: self.current_term,
            success: true,
            highest: matched,
            sender_time_stamp_ms: sender_ts,
        })
    }

    fn reject(&self, sender_ts: u64) -> AppendEntriesResponse {
        AppendEntriesResponse {
            term: self.current_term,
            success: false,
            highest: self.state.last_index(),
            sender_time_stamp_ms: sender_ts,
        }
    }
}
