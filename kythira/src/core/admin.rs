use std::collections::BTreeSet;
use std::collections::HashSet;

use crate::core::client::ClientRequestEntry;
use crate::core::ConsensusState;
use crate::core::LeaderState;
use crate::core::LearnerReplication;
use crate::core::RaftCore;
use crate::core::State;
use crate::error::ChangeConfigError;
use crate::error::InitializeError;
use crate::raft::ClientWriteRequest;
use crate::raft::MembershipConfig;
use crate::raft::ResponseTx;
use crate::replication::StreamEvent;
use crate::AppData;
use crate::AppDataResponse;
use crate::NodeId;
use crate::RaftError;
use crate::RaftNetwork;
use crate::RaftStorage;

impl<D: AppData, R: AppDataResponse, N: RaftNetwork<D>, S: RaftStorage<D, R>> RaftCore<D, R, N, S> {
    /// Form a brand new cluster out of a pristine node.
    ///
    /// Only a node with an empty log at term 0 may accept this; anything else means a cluster
    /// already exists. The given member set (always including this node) becomes the config in
    /// memory only — the elected leader's first entry is what makes it durable. A single-member
    /// set short-circuits the election entirely.
    #[tracing::instrument(level = "debug", skip(self))]
    pub(super) async fn initialize_cluster(&mut self, mut members: BTreeSet<NodeId>) -> Result<(), InitializeError> {
        if self.last_log_id.index != 0 || self.current_term != 0 {
            tracing::error!(
                { self.last_log_id.index, self.current_term },
                "rejecting cluster initialization: this node already has state"
            );
            return Err(InitializeError::NotAllowed);
        }

        members.insert(self.id);
        self.membership = MembershipConfig {
            members,
            members_after_consensus: None,
        };

        if self.membership.members.len() == 1 {
            // We are the whole cluster: skip the campaign and take the term.
            self.current_term += 1;
            self.voted_for = Some(self.id);
            self.save_hard_state().await?;
            self.transition(State::Leader);
        } else {
            self.transition(State::Candidate);
        }

        Ok(())
    }
}

impl<'a, D: AppData, R: AppDataResponse, N: RaftNetwork<D>, S: RaftStorage<D, R>> LeaderState<'a, D, R, N, S> {
    /// Begin syncing a new node toward cluster membership, answering `tx` once it is caught up.
    ///
    /// The admission policy gets the final word before any replication state is created for
    /// the target.
    #[tracing::instrument(level = "trace", skip(self, tx))]
    pub(super) async fn sync_new_node(&mut self, target: NodeId, tx: ResponseTx) {
        // Already a member, already named by an in-flight change, or already syncing: there is
        // nothing to do for it.
        if self.core.membership.contains(&target) || self.learners.contains_key(&target) {
            tracing::debug!(target, "target is already a member or already syncing");
            let _ = tx.send(Err(ChangeConfigError::Noop.into()));
            return;
        }

        if !self.core.authorizer.authorize(target).await {
            tracing::warn!({ target }, "membership authorizer refused node admission");
            let _ = tx.send(Err(ChangeConfigError::NotAuthorized.into()));
            return;
        }

        let repl = self.spawn_replication_stream(target);
        self.learners.insert(target, LearnerReplication {
            repl,
            synced: false,
            tx: Some(tx),
        });
    }

    /// Drive a membership change toward the proposed member set.
    #[tracing::instrument(level = "trace", skip(self, tx))]
    pub(super) async fn change_membership(&mut self, members: BTreeSet<NodeId>, tx: ResponseTx) {
        // An empty cluster cannot make decisions.
        if members.is_empty() {
            let _ = tx.send(Err(ChangeConfigError::InoperableConfig.into()));
            return;
        }

        // One change at a time: anything but a settled uniform config refuses a new proposal.
        if !matches!(self.consensus_state, ConsensusState::Uniform) {
            let _ = tx.send(Err(ChangeConfigError::ConfigChangeInProgress.into()));
            return;
        }

        // Every proposed newcomer must be synced before the cluster enters joint consensus.
        // Spawn sync streams for nodes we have never seen (authorization permitting) and
        // collect the set still catching up.
        let mut awaiting = HashSet::new();
        for id in members.difference(&self.core.membership.members) {
            match self.learners.get(id) {
                Some(learner) if learner.synced => continue,
                Some(_) => {}
                None => {
                    if !self.core.authorizer.authorize(*id).await {
                        tracing::warn!(target = *id, "membership authorizer refused node admission");
                        let _ = tx.send(Err(ChangeConfigError::NotAuthorized.into()));
                        return;
                    }
                    let repl = self.spawn_replication_stream(*id);
                    self.learners.insert(*id, LearnerReplication {
                        repl,
                        synced: false,
                        tx: None,
                    });
                }
            }
            awaiting.insert(*id);
        }

        if awaiting.is_empty() {
            self.begin_joint_consensus(members, tx).await;
        } else {
            // Parked until the laggards report in; the sync handler re-enters this flow.
            self.consensus_state = ConsensusState::SyncingLearners {
                awaiting,
                proposal: members,
                tx,
            };
        }
    }

    /// Append the joint config followed by the final config, entering joint consensus.
    ///
    /// Both entries go into the log back to back; the commit of the first moves the cluster
    /// through the joint phase, the commit of the second settles it on the new uniform config
    /// and resolves `tx`.
    #[tracing::instrument(level = "trace", skip(self, tx))]
    pub(super) async fn begin_joint_consensus(&mut self, members: BTreeSet<NodeId>, tx: ResponseTx) {
        if !members.contains(&self.core.id) {
            // The change removes this leader; committing the final config doubles as its cue
            // to stand down.
            self.stepping_down = true;
        }

        self.consensus_state = ConsensusState::Joint { committed: false };
        self.core.membership.members_after_consensus = Some(members.clone());
        let joint_config = self.core.membership.clone();
        let final_config = MembershipConfig {
            members,
            members_after_consensus: None,
        };

        if let Err(err) = self.append_config_entry(joint_config, None).await {
            tracing::error!(error=?err, "failed to append the joint config entry");
        }
        if let Err(err) = self.append_config_entry(final_config, Some(tx)).await {
            tracing::error!(error=?err, "failed to append the final config entry");
        }
    }

    /// Append a membership config entry and set it replicating.
    #[tracing::instrument(level = "trace", skip(self, tx), fields(id=self.core.id))]
    pub(super) async fn append_config_entry(
        &mut self,
        config: MembershipConfig,
        tx: Option<ResponseTx>,
    ) -> Result<(), RaftError> {
        let payload = ClientWriteRequest::<D>::config_change(config);
        let entry = match self.append_payload_to_log(payload.entry).await {
            Ok(entry) => entry,
            Err(err) => {
                let summary = err.to_string();
                if let Some(tx) = tx {
                    let _ = tx.send(Err(err.into()));
                }
                return Err(RaftError::RaftStorage(anyhow::anyhow!(summary)));
            }
        };

        let request = ClientRequestEntry::from_entry(entry, tx);
        self.replicate_client_request(request).await;
        Ok(())
    }

    /// Handle the commitment of a joint consensus cluster configuration.
    #[tracing::instrument(level = "trace", skip(self))]
    pub(super) fn handle_joint_config_committed(&mut self) {
        if let ConsensusState::Joint { committed } = &mut self.consensus_state {
            *committed = true;
        }
        if self.consensus_state.ready_to_conclude() {
            self.promote_synced_learners();
            self.conclude_joint_consensus();
        }
    }

    /// Promote the learners named by the committed joint config to full replication targets.
    ///
    /// New members take part in consensus from the moment the joint config commits, so their
    /// bookkeeping moves from `learners` to `targets` here. A leader elected mid-change has no
    /// learner entries at all — it spawned streams for the whole joint set on taking office —
    /// and a learner missing entirely gets a fresh stream.
    #[tracing::instrument(level = "trace", skip(self))]
    pub(super) fn promote_synced_learners(&mut self) {
        let newcomers: Vec<NodeId> = self
            .core
            .membership
            .members_after_consensus
            .as_ref()
            .map(|new_members| new_members.difference(&self.core.membership.members).cloned().collect())
            .unwrap_or_default();

        for id in newcomers {
            if id == self.core.id || self.targets.contains_key(&id) {
                continue;
            }
            let repl = match self.learners.remove(&id) {
                Some(learner) => {
                    // An add_non_voter caller still waiting on this node gets its answer: the
                    // sync it asked for is complete.
                    if let Some(tx) = learner.tx {
                        let _ = tx.send(Ok(self.core.last_log_id.index));
                    }
                    learner.repl
                }
                None => self.spawn_replication_stream(id),
            };
            self.targets.insert(id, repl);
        }
    }

    /// Collapse the committed joint config to its final form.
    ///
    /// Replication streams for members dropped by the final config stay alive until those
    /// members have replicated the config entry which removes them; the commit handler for the
    /// final config prunes them. Should leadership change before that happens, the Raft spec's
    /// third membership-change safety measure (§6, disregarding vote requests from removed
    /// nodes within the election timeout) covers the stragglers.
    #[tracing::instrument(level = "trace", skip(self))]
    pub(super) fn conclude_joint_consensus(&mut self) {
        if !self.consensus_state.ready_to_conclude() {
            tracing::error!("attempted to conclude joint consensus before the joint config committed");
            return;
        }
        if let Some(new_members) = self.core.membership.members_after_consensus.take() {
            self.core.membership.members = new_members;
        }
        self.consensus_state = ConsensusState::Uniform;
    }

    /// Handle the commitment of the final, uniform cluster configuration.
    #[tracing::instrument(level = "trace", skip(self))]
    pub(super) fn handle_final_config_committed(&mut self, index: u64) {
        if self.stepping_down {
            tracing::debug!("this leader is removed by the committed config; standing down");
            self.core.current_leader = None;
            self.core.transition(State::NonVoter);
            return;
        }

        // Prune replication to ex-members which have already replicated the config removing
        // them; mark the rest for removal as soon as they do.
        let mut done_with: Vec<NodeId> = Vec::new();
        for (id, state) in self.targets.iter_mut() {
            if self.core.membership.contains(id) {
                continue;
            }
            if state.matched.index >= index {
                done_with.push(*id);
            } else {
                state.purge_after = Some(index);
            }
        }

        tracing::debug!(
            targets = ?self.targets.keys().collect::<Vec<_>>(),
            learners = ?self.learners.keys().collect::<Vec<_>>(),
            membership = ?self.core.membership,
            removing = ?done_with,
            "uniform config committed"
        );

        for id in done_with {
            if let Some(state) = self.targets.remove(&id) {
                let _ = state.stream.tx.send((StreamEvent::Halt, tracing::debug_span!("halt")));
                self.leader_metrics.replication.remove(&id);
            }
        }
        self.publish_leader_metrics();
    }
}
