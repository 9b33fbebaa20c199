//! The vote-request path of the constituent role machine.

use crate::agent::AgentCore;
use crate::error::AgencyResult;
use crate::network::AgencyNetwork;
use crate::network::VoteRequest;
use crate::network::VoteResponse;
use crate::storage::AgencyStorage;
use crate::MessageSummary;
use crate::Role;

impl<N: AgencyNetwork, S: AgencyStorage> AgentCore<N, S> {
    /// Grant the vote iff the candidate's term is current or newer, we
    /// have not voted for anyone else in that term, and the candidate's
    /// log is at least as up to date as ours. The vote record is persisted
    /// before the reply leaves.
    #[tracing::instrument(level = "trace", skip(self, rpc), fields(rpc = %rpc.summary()))]
    pub(super) async fn handle_vote_request(&mut self, rpc: VoteRequest) -> AgencyResult<VoteResponse> {
        if rpc.term < self.current_term {
            tracing::debug!(
                current = self.current_term,
                rpc_term = rpc.term,
                "vote request term below current term"
            );
            return Ok(VoteResponse {
                term: self.current_term,
                vote_granted: false,
            });
        }

        let mut changed = false;
        if rpc.term > self.current_term {
            self.update_current_term(rpc.term, None);
            self.leader = None;
            if !self.role.is_follower() {
                self.set_role(Role::Follower);
            }
            changed = true;
        }

        let log_up_to_date = (rpc.last_log_term, rpc.last_log_index)
            >= (self.state.last_term(), self.state.last_index());
        let can_vote = match &self.voted_for {
            None => true,
            Some(candidate) => candidate == &rpc.candidate_id,
        };

        let granted = log_up_to_date && can_vote;
        if granted {
            if self.voted_for.as_ref() != Some(&rpc.candidate_id) {
                self.voted_for = Some(rpc.candidate_id.clone());
                changed = true;
            }
            // A granted vote resets the election timer so we do not
            // immediately campaign against the candidate we just endorsed.
            self.update_next_election_timeout(false);
        }
        if changed {
            self.save_vote().await?;
            self.report_metrics();
        }

        tracing::debug!(candidate = %rpc.candidate_id, granted, "vote request handled");
        Ok(VoteResponse {
            term: self.current_term,
            vote_granted: granted,
        })
    }
}
