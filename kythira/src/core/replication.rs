use std::collections::BTreeSet;

use tokio::sync::oneshot;

use crate::config::SnapshotPolicy;
use crate::core::ConsensusState;
use crate::core::LeaderState;
use crate::core::ReplicationState;
use crate::core::SnapshotState;
use crate::core::State;
use crate::error::RaftResult;
use crate::quorum::majority_of;
use crate::replication::ReplicationMetrics;
use crate::replication::ReplicationStream;
use crate::replication::StreamEvent;
use crate::replication::StreamReport;
use crate::storage::Snapshot;
use crate::AppData;
use crate::AppDataResponse;
use crate::LogId;
use crate::NodeId;
use crate::RaftNetwork;
use crate::RaftStorage;

impl<'a, D: AppData, R: AppDataResponse, N: RaftNetwork<D>, S: RaftStorage<D, R>> LeaderState<'a, D, R, N, S> {
    /// Spawn a replication task for the given target, returning its bookkeeping handle.
    #[tracing::instrument(level = "trace", skip(self))]
    pub(super) fn spawn_replication_stream(&self, target: NodeId) -> ReplicationState<D> {
        let stream = ReplicationStream::new(
            self.core.id,
            target,
            self.core.current_term,
            self.core.config.clone(),
            self.core.last_log_id,
            self.core.commit_index,
            self.core.network.clone(),
            self.core.storage.clone(),
            self.reports_tx.clone(),
        );
        ReplicationState {
            matched: LogId { term: 0, index: 0 },
            purge_after: None,
            stream,
        }
    }

    /// Handle a report coming up from one of the replication tasks.
    #[tracing::instrument(level = "trace", skip(self, report))]
    pub(super) async fn handle_stream_report(&mut self, report: StreamReport<S::SnapshotData>) {
        let res = match report {
            StreamReport::SteadyState { target, steady } => self.handle_steady_state(target, steady).await,
            StreamReport::Matched { target, matched } => self.handle_matched(target, matched).await,
            StreamReport::HigherTerm { target, term } => self.handle_higher_term(target, term).await,
            StreamReport::NeedsSnapshot { target, tx } => self.handle_needs_snapshot(target, tx).await,
            StreamReport::Fatal => {
                self.core.transition(State::Shutdown);
                return;
            }
        };
        if let Err(err) = res {
            tracing::error!({error=%err, id=self.core.id, term=self.core.current_term}, "error while processing replication report");
        }
    }

    /// Handle a task's steady-state transition.
    ///
    /// A learner reaching steady state has caught up: it becomes eligible for membership, its
    /// waiting admin caller (if any) is answered, and a parked membership change may resume.
    #[tracing::instrument(level = "trace", skip(self))]
    async fn handle_steady_state(&mut self, target: NodeId, steady: bool) -> RaftResult<()> {
        if !steady {
            // Fell out of steady state; it will drive its own catch-up.
            return Ok(());
        }

        if let Some(learner) = self.learners.get_mut(&target) {
            learner.synced = true;
            if let Some(tx) = learner.tx.take() {
                let _ = tx.send(Ok(self.core.last_log_id.index));
            }

            // If a membership change is parked on syncing learners, mark this one done and
            // resume the change once the set drains.
            match std::mem::replace(&mut self.consensus_state, ConsensusState::Uniform) {
                ConsensusState::SyncingLearners {
                    mut awaiting,
                    proposal,
                    tx,
                } => {
                    awaiting.remove(&target);
                    if awaiting.is_empty() {
                        self.begin_joint_consensus(proposal, tx).await;
                    } else {
                        self.consensus_state = ConsensusState::SyncingLearners { awaiting, proposal, tx };
                    }
                }
                other => self.consensus_state = other,
            }
        }
        Ok(())
    }

    /// Handle a task's report of a higher term: this leader is deposed.
    #[tracing::instrument(level = "trace", skip(self))]
    async fn handle_higher_term(&mut self, _target: NodeId, term: u64) -> RaftResult<()> {
        if term > self.core.current_term {
            self.core.bump_term(term, None);
            self.core.save_hard_state().await?;
            self.core.current_leader = None;
            self.core.transition(State::Follower);
        }
        Ok(())
    }

    /// Handle a task's match-index advancement, recomputing the commit index.
    #[tracing::instrument(level = "trace", skip(self))]
    async fn handle_matched(&mut self, target: NodeId, matched: LogId) -> RaftResult<()> {
        let mut found = false;

        if let Some(learner) = self.learners.get_mut(&target) {
            learner.repl.matched = matched;
            found = true;
        }

        let mut purge = false;
        if let Some(state) = self.targets.get_mut(&target) {
            state.matched = matched;
            found = true;
            if let Some(config_index) = &state.purge_after {
                // An ex-member which has replicated the config removing it is done.
                if &matched.index >= config_index {
                    purge = true;
                }
            }
        }

        if !found {
            // A report from a stream removed in the interim; harmless, drop it.
            tracing::debug!(target, "match report from an unknown target");
            return Ok(());
        }

        self.leader_metrics.replication.insert(target, ReplicationMetrics { matched });

        if purge {
            if let Some(state) = self.targets.remove(&target) {
                let _ = state.stream.tx.send((StreamEvent::Halt, tracing::debug_span!("halt")));
                self.leader_metrics.replication.remove(&target);
            }
        }

        // Determine the new commit index of the current membership config nodes, subject to the
        // same-term rule (§5.4.2): a prior-term entry is never committed by counting replicas
        // alone.
        let commit_index = self.calc_commit_index();
        let has_new_commit_index =
            commit_index > self.core.commit_index && self.commit_candidate_has_current_term(commit_index).await;

        if has_new_commit_index {
            self.core.commit_index = commit_index;

            // Every stream learns the new commit index.
            for state in self.targets.values() {
                let _ = state.stream.tx.send((
                    StreamEvent::Commit {
                        commit_index: self.core.commit_index,
                    },
                    tracing::debug_span!("commit"),
                ));
            }
            for learner in self.learners.values() {
                let _ = learner.repl.stream.tx.send((
                    StreamEvent::Commit {
                        commit_index: self.core.commit_index,
                    },
                    tracing::debug_span!("commit"),
                ));
            }

            // Requests whose index just committed resolve now, in log order.
            let newly_committed = self
                .pending
                .iter()
                .enumerate()
                .take_while(|(_, request)| request.entry.log_id.index <= commit_index)
                .last()
                .map(|(offset, _)| offset);
            if let Some(offset) = newly_committed {
                for request in self.pending.drain(..=offset).collect::<Vec<_>>() {
                    self.client_request_post_commit(request).await;
                }
            }
        }

        // Always report on the metrics which were updated above.
        self.publish_leader_metrics();
        Ok(())
    }

    /// Determine the highest index replicated on a majority of every membership config group.
    #[tracing::instrument(level = "trace", skip(self))]
    fn calc_commit_index(&self) -> u64 {
        let current = self.calc_members_commit_index(&self.core.membership.members);

        // Under joint consensus both groups must clear the bar independently.
        match &self.core.membership.members_after_consensus {
            Some(new_members) => std::cmp::min(current, self.calc_members_commit_index(new_members)),
            None => current,
        }
    }

    /// Determine the index replicated on a majority of the given config group.
    ///
    /// Members of a pending joint config are still tracked as learners until the joint entry
    /// commits, so both maps are consulted.
    fn calc_members_commit_index(&self, members: &BTreeSet<NodeId>) -> u64 {
        let mut indices: Vec<u64> = members
            .iter()
            .filter(|id| *id != &self.core.id)
            .map(|id| {
                self.targets
                    .get(id)
                    .map(|state| state.matched.index)
                    .or_else(|| self.learners.get(id).map(|learner| learner.repl.matched.index))
                    .unwrap_or(0)
            })
            .collect();
        // The leader is its own replica.
        if members.contains(&self.core.id) {
            indices.push(self.core.last_log_id.index);
        }
        if indices.is_empty() {
            return self.core.commit_index;
        }
        indices.sort_unstable();
        // In a sorted list, the entry at `len - majority` is held by at least a majority.
        let offset = indices.len() - majority_of(indices.len());
        indices[offset]
    }

    /// Check that the entry at the proposed commit index carries the current term.
    async fn commit_candidate_has_current_term(&mut self, index: u64) -> bool {
        // Terms are monotone along the log, so only the candidate index itself needs checking.
        let term = match self.core.storage.try_get_log_entry(index).await {
            Ok(Some(entry)) => Some(entry.log_id.term),
            Ok(None) if index == self.core.snapshot_last_log_id.index => Some(self.core.snapshot_last_log_id.term),
            Ok(None) => None,
            Err(err) => {
                let _ = self.core.fatal_storage(err);
                return false;
            }
        };
        term == Some(self.core.current_term)
    }

    /// Handle a task's request for the current snapshot.
    #[tracing::instrument(level = "trace", skip(self, tx))]
    async fn handle_needs_snapshot(
        &mut self,
        _target: NodeId,
        tx: oneshot::Sender<Snapshot<S::SnapshotData>>,
    ) -> RaftResult<()> {
        let SnapshotPolicy::LogsSinceLast(threshold) = self.core.config.snapshot_policy;

        // A recent-enough snapshot on hand answers the request directly.
        let current_snapshot =
            self.core.storage.get_current_snapshot().await.map_err(|err| self.core.fatal_storage(err))?;
        if let Some(snapshot) = current_snapshot {
            if snapshot_is_within_half_of_threshold(
                &snapshot.meta.last_log_id.index,
                &self.core.last_log_id.index,
                &threshold,
            ) {
                let _ = tx.send(snapshot);
                return Ok(());
            }
        }

        // A compaction job already running will produce what the task needs: spawn a watcher
        // which drops the request channel when the job finishes, prompting the task to ask
        // again and receive the fresh snapshot through the path above.
        if let Some(SnapshotState::Building { abort, done }) = self.core.snapshot_state.take() {
            let mut watcher = done.subscribe();
            tokio::spawn(async move {
                let _ = watcher.recv().await;
                drop(tx);
            });
            self.core.snapshot_state = Some(SnapshotState::Building { abort, done });
            return Ok(());
        }

        // No snapshot fresh enough and no job running: start one. Under normal operation the
        // leader keeps its snapshotting current and this block never runs; when it does, the
        // task's re-request lands on the watcher path above.
        self.core.maybe_trigger_compaction(true);
        Ok(())
    }
}

/// Check if the given snapshot data is within half of the configured threshold.
fn snapshot_is_within_half_of_threshold(snapshot_last_index: &u64, last_log_index: &u64, threshold: &u64) -> bool {
    // Calculate distance from actor's last log index.
    let distance_from_line = last_log_index.saturating_sub(*snapshot_last_index);
    distance_from_line <= threshold / 2
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_is_within_half_of_threshold() {
        // Passes when the distance is within half.
        assert!(snapshot_is_within_half_of_threshold(&80, &100, &500));
        // Fails when the distance is past half.
        assert!(!snapshot_is_within_half_of_threshold(&80, &500, &500));
        // Guards against underflow.
        assert!(snapshot_is_within_half_of_threshold(&500, &100, &500));
    }
}
