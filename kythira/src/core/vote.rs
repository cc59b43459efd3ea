use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing_futures::Instrument;

use crate::core::RaftCore;
use crate::core::State;
use crate::error::RaftResult;
use crate::quorum::VoteCollector;
use crate::raft::VoteRequest;
use crate::raft::VoteResponse;
use crate::AppData;
use crate::AppDataResponse;
use crate::MessageSummary;
use crate::NodeId;
use crate::RaftNetwork;
use crate::RaftStorage;

impl<D: AppData, R: AppDataResponse, N: RaftNetwork<D>, S: RaftStorage<D, R>> RaftCore<D, R, N, S> {
    /// An RPC invoked by candidates to gather votes (§5.2).
    #[tracing::instrument(level = "debug", skip(self, msg), fields(msg=%msg.summary()))]
    pub(super) async fn handle_vote_request(&mut self, msg: VoteRequest) -> RaftResult<VoteResponse> {
        // If candidate's current term is less than this nodes current term, reject.
        if msg.term < self.current_term {
            tracing::debug!({candidate=msg.candidate_id, self.current_term, rpc_term=msg.term}, "RequestVote RPC term is less than current term");
            return Ok(VoteResponse {
                term: self.current_term,
                vote_granted: false,
            });
        }

        // Do not respond to the request if we've received a heartbeat within the election timeout minimum.
        if let Some(instant) = &self.last_leader_contact {
            let delta = Instant::now().duration_since(*instant);
            if self.config.election_timeout_min >= (delta.as_millis() as u64) {
                tracing::debug!({candidate=msg.candidate_id}, "rejecting vote request received within election timeout minimum");
                return Ok(VoteResponse {
                    term: self.current_term,
                    vote_granted: false,
                });
            }
        }

        // Per spec, if we observe a term greater than our own outside of the election timeout
        // minimum, then we must update term & immediately become follower. We still need to do
        // vote checking after this.
        if msg.term > self.current_term {
            self.bump_term(msg.term, None);
            self.rearm_election_timer(false);
            self.transition(State::Follower);
            self.save_hard_state().await?;
        }

        // Check if candidate's log is at least as up-to-date as this node's (§5.4.1): a greater
        // last log term wins outright, an equal term falls back to log length.
        let candidate_is_uptodate = msg.last_log_term > self.last_log_id.term
            || (msg.last_log_term == self.last_log_id.term && msg.last_log_index >= self.last_log_id.index);
        if !candidate_is_uptodate {
            tracing::debug!(
                { candidate = msg.candidate_id },
                "rejecting vote request as candidate's log is not up-to-date"
            );
            return Ok(VoteResponse {
                term: self.current_term,
                vote_granted: false,
            });
        }

        // Candidate's log is up-to-date so handle voting conditions.
        match &self.voted_for {
            // This node has already voted for the candidate.
            Some(candidate_id) if candidate_id == &msg.candidate_id => Ok(VoteResponse {
                term: self.current_term,
                vote_granted: true,
            }),
            // This node has already voted for a different candidate.
            Some(_) => Ok(VoteResponse {
                term: self.current_term,
                vote_granted: false,
            }),
            // This node has not yet voted for the current term, so vote for the candidate.
            // The vote must be on disk before the reply leaves this node: a crash after
            // granting but before persisting could otherwise double-vote in this term.
            None => {
                self.voted_for = Some(msg.candidate_id);
                self.transition(State::Follower);
                self.rearm_election_timer(false);
                self.save_hard_state().await?;
                tracing::debug!({candidate=msg.candidate_id, msg.term}, "voted for candidate");
                Ok(VoteResponse {
                    term: self.current_term,
                    vote_granted: true,
                })
            }
        }
    }

    /// Build a request vote message for the current term & send it to all peers.
    ///
    /// The returned handles each resolve with the target's response, or go unresolved if the
    /// target was unreachable. They are consumed by the quorum collector.
    #[tracing::instrument(level = "trace", skip(self))]
    pub(super) fn spawn_parallel_vote_requests(&self) -> Vec<(NodeId, oneshot::Receiver<VoteResponse>)> {
        let all_members = self.membership.all_nodes();
        let mut handles = Vec::with_capacity(all_members.len());
        for member in all_members.into_iter().filter(|member| member != &self.id) {
            let rpc = VoteRequest::new(self.current_term, self.id, self.last_log_id.index, self.last_log_id.term);
            let (tx, rx) = oneshot::channel();
            let network = self.network.clone();
            let (id, target) = (self.id, member);
            let _task = tokio::spawn(
                async move {
                    match network.send_vote(target, rpc).await {
                        Ok(res) => {
                            let _ = tx.send(res);
                        }
                        Err(err) => {
                            tracing::warn!({error=%err, target, id}, "error while requesting vote from peer");
                            // Dropping the sender fails the handle, which the collector counts
                            // as a denial for this round.
                        }
                    }
                }
                .instrument(tracing::debug_span!("spawn")),
            );
            handles.push((member, rx));
        }
        handles
    }

    /// Build the quorum collector for this term's round of vote collection.
    ///
    /// Our own vote is pre-granted; the outcome is decided the instant a majority of every
    /// config group has granted, a majority has become impossible, or the deadline passes.
    pub(super) fn new_vote_collector(
        &self,
        handles: Vec<(NodeId, oneshot::Receiver<VoteResponse>)>,
        deadline: Instant,
    ) -> VoteCollector {
        VoteCollector::new(&self.membership, self.id, self.current_term, handles, deadline)
    }
}
