//! Pool assembly by gossip.
//!
//! Before a quorum can form, agents exchange their pools until everyone
//! knows everyone (`pool_complete`). Conflicting id/endpoint pairings are
//! fatal. Once the pool is complete, a stranger gossiping in is refused;
//! if a serving leader learns new pool members, it persists a
//! reconfiguration through the log and answers only after it commits.

use serde_json::json;
use tokio::sync::oneshot;
use tracing_futures::Instrument;

use crate::agent::leader::LeaderState;
use crate::agent::AgentCore;
use crate::agent::AgentMsg;
use crate::agent::PendingGossip;
use crate::agent::RECONFIGURE_KEY;
use crate::config::MergeOutcome;
use crate::config::Reconfiguration;
use crate::error::AgencyError;
use crate::error::AgencyResult;
use crate::network::AgencyNetwork;
use crate::network::GossipRequest;
use crate::network::GossipResponse;
use crate::storage::AgencyStorage;
use crate::MessageSummary;
use crate::Role;

impl<N: AgencyNetwork, S: AgencyStorage> AgentCore<N, S> {
    /// Merge a gossiped pool into ours. `Err` means a fatal disagreement.
    pub(super) fn gossip_merge(&mut self, rpc: &GossipRequest) -> AgencyResult<GossipResponse> {
        if self.cluster.pool_complete() && !self.cluster.pool.contains_key(&rpc.id) {
            tracing::warn!(stranger = %rpc.id, "refusing gossip from stranger to a complete pool");
            return Ok(GossipResponse {
                pool: self.cluster.pool.clone(),
                redirect: self.leader_endpoint(),
                refused: true,
            });
        }

        let mut proposed = rpc.pool.clone();
        proposed.insert(rpc.id.clone(), rpc.endpoint.clone());
        match self.cluster.merge_pool(&proposed) {
            MergeOutcome::Wrong => Err(AgencyError::PoolMismatch(format!(
                "gossip from {} disagrees with known pool",
                rpc.id
            ))),
            outcome => {
                if outcome == MergeOutcome::Changed {
                    tracing::info!(from = %rpc.id, pool = self.cluster.pool.len(), "pool grew from gossip");
                }
                self.cluster.try_activate();
                Ok(GossipResponse {
                    pool: self.cluster.pool.clone(),
                    redirect: if self.role.is_leader() {
                        None
                    } else {
                        self.leader_endpoint()
                    },
                    refused: false,
                })
            }
        }
    }

    fn leader_endpoint(&self) -> Option<String> {
        self.leader.as_ref().and_then(|l| self.cluster.endpoint_of(l)).cloned()
    }

    /// Non-leader gossip handling: merge and reply immediately. A pool
    /// mismatch is fatal and shuts the agent down.
    pub(super) async fn handle_gossip(
        &mut self,
        rpc: GossipRequest,
        tx: oneshot::Sender<AgencyResult<GossipResponse>>,
    ) -> AgencyResult<()> {
        tracing::debug!("gossip: {}", rpc.summary());
        match self.gossip_merge(&rpc) {
            Ok(response) => {
                let _ = tx.send(Ok(response));
            }
            Err(err) => {
                tracing::error!(error = %err, "fatal pool mismatch");
                self.set_role(Role::Shutdown);
                let _ = tx.send(Err(err));
            }
        }
        Ok(())
    }

    /// One proactive gossip round to every known pool member. Replies are
    /// folded back in as callback gossip messages through our own api
    /// channel.
    pub(super) fn spawn_gossip_round(&mut self) {
        let me = self.config.id.clone();
        let my_endpoint = self.config.endpoint.clone();
        let pool = self.cluster.pool.clone();
        for (peer, peer_endpoint) in pool.iter().filter(|(id, _)| **id != me) {
            let rpc = GossipRequest {
                id: me.clone(),
                endpoint: my_endpoint.clone(),
                pool: pool.clone(),
                is_callback: false,
                version: 1,
            };
            let network = self.network.clone();
            let tx_api = self.tx_api.clone();
            let peer = peer.clone();
            let peer_endpoint = peer_endpoint.clone();
            tokio::spawn(
                async move {
                    match network.gossip(&peer, rpc).await {
                        Ok(res) if res.refused => {
                            tracing::error!(peer = %peer, "gossip refused: our id is not in the completed pool");
                        }
                        Ok(res) => {
                            // Fold the peer's view back into ours.
                            let callback = GossipRequest {
                                id: peer,
                                endpoint: peer_endpoint,
                                pool: res.pool,
                                is_callback: true,
                                version: 1,
                            };
                            let (tx, _rx) = oneshot::channel();
                            let _ = tx_api
                                .send((AgentMsg::Gossip { rpc: callback, tx }, tracing::debug_span!("CH")));
                        }
                        Err(err) => {
                            tracing::debug!(error = %err, peer = %peer, "gossip round failed");
                        }
                    }
                }
                .instrument(tracing::debug_span!("gossip-round")),
            );
        }
    }

    /// Resignation fails all gossip replies still waiting on a commit.
    pub(super) fn fail_pending_gossip(&mut self) {
        for pending in self.pending_gossip.drain(..) {
            let _ = pending.tx.send(Err(AgencyError::Resigned));
        }
    }
}

impl<'a, N: AgencyNetwork, S: AgencyStorage> LeaderState<'a, N, S> {
    /// Leader-side gossip: merge, and when a stranger completed our pool,
    /// persist the grown configuration and reply only after it commits.
    pub(super) async fn handle_gossip_as_leader(
        &mut self,
        rpc: GossipRequest,
        tx: oneshot::Sender<AgencyResult<GossipResponse>>,
    ) -> AgencyResult<()> {
        let known_before = self.core.cluster.pool.contains_key(&rpc.id);
        match self.core.gossip_merge(&rpc) {
            Err(err) => {
                tracing::error!(error = %err, "fatal pool mismatch");
                self.core.set_role(Role::Shutdown);
                let _ = tx.send(Err(err));
                Ok(())
            }
            Ok(response) if response.refused => {
                let _ = tx.send(Ok(response));
                Ok(())
            }
            Ok(response) => {
                let grew = !known_before && self.core.cluster.pool_complete();
                if grew && self.core.serving {
                    let rc = Reconfiguration {
                        term: self.core.current_term,
                        id: self.core.config.id.clone(),
                        active: self.core.cluster.active.clone(),
                        pool: self.core.cluster.pool.clone(),
                        size: self.core.cluster.size,
                        timeout_mult: self.core.cluster.timeout_mult,
                    };
                    let ops = json!({
                        RECONFIGURE_KEY: {"op": "set", "new": serde_json::to_value(&rc).unwrap_or_default()}
                    });
                    let index = self.append_internal_entry(ops).await?;
                    self.core.pending_gossip.push(PendingGossip {
                        index,
                        response,
                        tx,
                    });
                    self.send_append_entries();
                    self.advance_commit_index().await?;
                } else {
                    let _ = tx.send(Ok(response));
                }
                Ok(())
            }
        }
    }
}
