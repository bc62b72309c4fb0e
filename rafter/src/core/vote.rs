use tokio::sync::mpsc;
use tracing_futures::Instrument;

use crate::core::CandidateState;
use crate::core::RaftCore;
use crate::core::State;
use crate::core::UpdateCurrentLeader;
use crate::error::RaftResult;
use crate::raft::TimeoutNowRequest;
use crate::raft::VoteRequest;
use crate::raft::VoteResponse;
use crate::AppData;
use crate::AppDataResponse;
use crate::LogId;
use crate::MessageSummary;
use crate::NodeId;
use crate::RaftNetwork;
use crate::RaftStorage;
use crate::Update;

impl<D: AppData, R: AppDataResponse, N: RaftNetwork<D>, S: RaftStorage<D, R>> RaftCore<D, R, N, S> {
    /// Business logic of handling a `VoteRequest` RPC (impl of §5.2).
    ///
    /// An RPC response will be spawned immediately to handle the response from the target peer.
    #[tracing::instrument(level = "debug", skip(self, req), fields(req=%req.summary()))]
    pub(super) async fn handle_vote_request(&mut self, req: VoteRequest) -> RaftResult<VoteResponse> {
        // If candidate's current term is less than this nodes current term, reject.
        if req.term < self.current_term {
            tracing::debug!({candidate=req.candidate_id}, "rejecting vote request received with lower term");
            return Ok(VoteResponse {
                term: self.current_term,
                vote_granted: false,
            });
        }

        // Do not respond to the request if we've received a heartbeat from a live leader within
        // the minimum election timeout, unless the candidate disrupts on purpose as part of a
        // leadership transfer. This is what keeps a partitioned or removed node from deposing a
        // healthy leader when it reconnects with an inflated term.
        if !req.disrupt_leader && self.has_live_leader() {
            tracing::debug!(
                { candidate = req.candidate_id },
                "rejecting vote request received while heartbeats from a live leader are arriving"
            );
            return Ok(VoteResponse {
                term: self.current_term,
                vote_granted: false,
            });
        }

        // Per the Raft spec, if our current term is less than the incoming RPC's term, we must
        // update to the new term and clear our vote, before any other handling.
        if req.term > self.current_term {
            self.update_current_term(req.term, None);
            self.update_next_election_timeout(false);
            self.save_hard_state().await?;
            self.set_target_state(State::Follower);
            self.report_metrics(Update::Ignore);
        }

        // Check if candidate's log is at least as up-to-date as this node's. If not, reject.
        let candidate_last_log = LogId::new(req.last_log_term, req.last_log_index);
        if candidate_last_log < self.last_log_id {
            tracing::debug!({candidate=req.candidate_id}, "rejecting vote request as candidate's log is not up-to-date");
            return Ok(VoteResponse {
                term: self.current_term,
                vote_granted: false,
            });
        }

        // Candidate's log is up-to-date: grant at most one vote per term, first-come-first-served.
        match &self.voted_for {
            // This node has already voted for the candidate.
            Some(candidate_id) if candidate_id == &req.candidate_id => Ok(VoteResponse {
                term: self.current_term,
                vote_granted: true,
            }),
            // This node has already voted for a different candidate.
            Some(_) => Ok(VoteResponse {
                term: self.current_term,
                vote_granted: false,
            }),
            // This node has not yet voted for the current term: vote for the candidate. The
            // vote is persisted before the response leaves this node.
            None => {
                self.voted_for = Some(req.candidate_id);
                self.save_hard_state().await?;
                self.update_next_election_timeout(false);
                self.report_metrics(Update::Ignore);
                tracing::debug!({candidate=req.candidate_id}, "voted for candidate");
                Ok(VoteResponse {
                    term: self.current_term,
                    vote_granted: true,
                })
            }
        }
    }

    /// Handle a TimeoutNow RPC, the final step of a leadership transfer.
    ///
    /// An up-to-date voter receiving this from the current leader starts an election
    /// immediately, ignoring its election timer, and marks the election as deliberately
    /// disruptive so peers waive their leader-stickiness check.
    #[tracing::instrument(level = "debug", skip(self, req), fields(req=%req.summary()))]
    pub(super) async fn handle_timeout_now_request(&mut self, req: TimeoutNowRequest) -> RaftResult<()> {
        if req.term < self.current_term {
            tracing::debug!("ignoring TimeoutNow with stale term");
            return Ok(());
        }
        if req.term > self.current_term {
            self.update_current_term(req.term, None);
            self.save_hard_state().await?;
            self.set_target_state(State::Follower);
        }

        // Only voters campaign; the leader would not target anything else, but the config may
        // have moved on since the RPC was sent.
        if !self.membership.is_voter(&self.id) {
            return Ok(());
        }
        if self.target_state.is_leader() || self.target_state.is_candidate() {
            return Ok(());
        }

        tracing::info!(id = self.id, "received TimeoutNow, starting election immediately");
        self.disrupt_next_election = true;
        self.set_target_state(State::Candidate);
        Ok(())
    }
}

impl<'a, D: AppData, R: AppDataResponse, N: RaftNetwork<D>, S: RaftStorage<D, R>> CandidateState<'a, D, R, N, S> {
    /// Handle response from a vote request sent to a peer.
    #[tracing::instrument(level = "debug", skip(self, res))]
    pub(super) async fn handle_vote_response(&mut self, res: VoteResponse, target: NodeId) -> RaftResult<()> {
        // If peer's term is greater than current term, revert to follower state.
        if res.term > self.core.current_term {
            self.core.update_current_term(res.term, None);
            self.core.save_hard_state().await?;
            self.core.update_current_leader(UpdateCurrentLeader::Unknown);
            self.core.set_target_state(State::Follower);
            tracing::debug!("reverting to follower state due to greater term observed in RequestVote RPC response");
            return Ok(());
        }

        if res.vote_granted {
            self.votes_granted += 1;
            if self.votes_granted >= self.votes_needed {
                // If the campaign was successful, go into leader state.
                tracing::debug!("transitioning to leader state as minimum number of votes have been received");
                self.core.set_target_state(State::Leader);
            }
        }

        Ok(())
    }

    /// Spawn parallel vote requests to all cluster voters.
    #[tracing::instrument(level = "debug", skip(self))]
    pub(super) fn spawn_parallel_vote_requests(&mut self) -> mpsc::Receiver<(VoteResponse, NodeId)> {
        let all_voters = self.core.membership.voter_ids();
        let (tx, rx) = mpsc::channel(all_voters.len().max(1));

        // A TimeoutNow-triggered election disrupts the sitting leader on purpose; the flag is
        // consumed by this first round of requests.
        let disrupt_leader = self.core.disrupt_next_election;
        self.core.disrupt_next_election = false;

        for member in all_voters.into_iter().filter(|member| member != &self.core.id) {
            let rpc = VoteRequest::new(
                self.core.current_term,
                self.core.id,
                self.core.last_log_id.index,
                self.core.last_log_id.term,
                disrupt_leader,
            );
            let (network, tx_inner) = (self.core.network.clone(), tx.clone());
            let _ = tokio::spawn(
                async move {
                    match network.send_vote(member, rpc).await {
                        Ok(res) => {
                            let _ = tx_inner.send((res, member)).await;
                        }
                        Err(err) => tracing::warn!({error=%err, target=member}, "error while requesting vote from peer"),
                    }
                }
                .instrument(tracing::debug_span!("requesting vote from peer")),
            );
        }
        rx
    }
}
