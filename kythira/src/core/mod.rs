//! The core logic of a Raft node.

mod admin;
mod append_entries;
mod client;
mod install_snapshot;
pub(crate) mod replication;
mod vote;

use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::collections::HashSet;
use std::sync::Arc;

use futures::future::AbortHandle;
use futures::future::Abortable;
use futures::stream::FuturesOrdered;
use futures::stream::StreamExt;
use serde::Deserialize;
use serde::Serialize;
use tokio::sync::broadcast;
use tokio::sync::mpsc;
use tokio::sync::oneshot;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::sleep_until;
use tokio::time::Duration;
use tokio::time::Instant;
use tracing::Span;
use tracing_futures::Instrument;

use crate::config::Config;
use crate::config::SnapshotPolicy;
use crate::core::client::ClientRequestEntry;
use crate::error::ChangeConfigError;
use crate::error::ClientWriteError;
use crate::error::InitializeError;
use crate::error::RaftError;
use crate::error::RaftResult;
use crate::membership::MembershipAuthorizer;
use crate::metrics::LeaderMetrics;
use crate::metrics::RaftMetrics;
use crate::quorum::VoteOutcome;
use crate::raft::ApiMessage;
use crate::raft::ClientWriteRequest;
use crate::raft::ClientWriteResponseTx;
use crate::raft::EntryPayload;
use crate::raft::MembershipConfig;
use crate::raft::ResponseTx;
use crate::replication::ReplicationStream;
use crate::replication::StreamEvent;
use crate::replication::StreamReport;
use crate::storage::HardState;
use crate::AppData;
use crate::AppDataResponse;
use crate::LogId;
use crate::MessageSummary;
use crate::NodeId;
use crate::RaftNetwork;
use crate::RaftStorage;
use crate::SnapshotId;
use crate::Update;

/// The roles a Raft node moves through.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum State {
    /// Replicating passively: no vote, no election timer. The state of a pristine node before
    /// cluster initialization, of a node syncing toward membership, and of a removed node.
    NonVoter,
    /// Tracking a leader's log, standing for election if the leader goes quiet.
    Follower,
    /// Campaigning for leadership of the next term.
    Candidate,
    /// Driving replication for the cluster.
    Leader,
    /// Winding the node down.
    Shutdown,
}

impl State {
    pub fn is_non_voter(&self) -> bool {
        *self == State::NonVoter
    }

    pub fn is_follower(&self) -> bool {
        *self == State::Follower
    }

    pub fn is_candidate(&self) -> bool {
        *self == State::Candidate
    }

    pub fn is_leader(&self) -> bool {
        *self == State::Leader
    }
}

/// The heart of a Raft node: one task owning every piece of volatile state.
///
/// All mutation happens from the task driving `main`; the public `Raft` handle reaches it only
/// through the api mailbox, which is what serializes client writes, inbound RPCs, timer fires
/// and replication reports against each other.
pub struct RaftCore<D: AppData, R: AppDataResponse, N: RaftNetwork<D>, S: RaftStorage<D, R>> {
    id: NodeId,
    config: Arc<Config>,
    /// The membership config in effect.
    ///
    /// Adopted from whatever config entry sits latest in the log — at append time, not commit
    /// time — falling back to the snapshot's and then to a single-node initial config.
    membership: MembershipConfig,
    /// The transport for outbound RPCs.
    network: Arc<N>,
    /// The persistence engine & state machine boundary.
    storage: Arc<S>,
    /// The policy hook deciding whether a node may be admitted to the cluster.
    authorizer: Arc<dyn MembershipAuthorizer>,

    /// The role this node is currently in, or headed to.
    ///
    /// Role loops watch this value: the moment a handler retargets it, the active loop winds
    /// down and `main` hands control to the next one.
    state: State,

    /// The current term. Never decreases; see `bump_term`.
    current_term: u64,
    /// The candidate this node voted for in `current_term`, if any.
    voted_for: Option<NodeId>,
    /// The node this node currently believes to be leader, for client redirection.
    current_leader: Option<NodeId>,

    /// The id of the last entry appended to the local log.
    last_log_id: LogId,
    /// The highest index known to be committed cluster-wide. Monotone; starts at 0 on boot
    /// because a commit index may only be taken from a live leader of the current term.
    commit_index: u64,
    /// The id of the last entry fed through the state machine. Trails `commit_index`.
    last_applied: LogId,

    /// Pipeline of background apply tasks; holds at most one task at a time so entries reach
    /// the state machine strictly in log order.
    apply_queue: FuturesOrdered<JoinHandle<anyhow::Result<Option<LogId>>>>,
    /// Whether the one-time catch-up apply pass after boot has been scheduled.
    initial_apply_done: bool,

    /// In-flight snapshot work: a local compaction job, or a stream arriving from the leader.
    snapshot_state: Option<SnapshotState<S::SnapshotData>>,
    /// The id of the last log covered by the current snapshot, if any.
    snapshot_last_log_id: LogId,

    /// When the last contact from a live leader was observed.
    last_leader_contact: Option<Instant>,
    /// The armed election deadline, if any. `None` means "arm a fresh one when next needed".
    election_deadline: Option<Instant>,

    compaction_tx: mpsc::Sender<CompactionOutcome>,
    compaction_rx: mpsc::Receiver<CompactionOutcome>,

    api_rx: mpsc::UnboundedReceiver<(ApiMessage<D, R>, Span)>,
    metrics_tx: watch::Sender<RaftMetrics>,
    shutdown_rx: oneshot::Receiver<()>,
}

impl<D: AppData, R: AppDataResponse, N: RaftNetwork<D>, S: RaftStorage<D, R>> RaftCore<D, R, N, S> {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn spawn(
        id: NodeId,
        config: Arc<Config>,
        network: Arc<N>,
        storage: Arc<S>,
        authorizer: Arc<dyn MembershipAuthorizer>,
        api_rx: mpsc::UnboundedReceiver<(ApiMessage<D, R>, Span)>,
        metrics_tx: watch::Sender<RaftMetrics>,
        shutdown_rx: oneshot::Receiver<()>,
    ) -> JoinHandle<RaftResult<()>> {
        let (compaction_tx, compaction_rx) = mpsc::channel(1);
        let this = Self {
            id,
            config,
            // Replaced with the real config from storage before the first role loop runs.
            membership: MembershipConfig::new_initial(id),
            network,
            storage,
            authorizer,
            state: State::Follower,
            current_term: 0,
            voted_for: None,
            current_leader: None,
            last_log_id: LogId { term: 0, index: 0 },
            commit_index: 0,
            last_applied: LogId { term: 0, index: 0 },
            apply_queue: FuturesOrdered::new(),
            initial_apply_done: false,
            snapshot_state: None,
            snapshot_last_log_id: LogId { term: 0, index: 0 },
            last_leader_contact: None,
            election_deadline: None,
            compaction_tx,
            compaction_rx,
            api_rx,
            metrics_tx,
            shutdown_rx,
        };
        tokio::spawn(this.main().instrument(tracing::debug_span!("spawn")))
    }

    /// Drive the node through its roles until shutdown.
    #[tracing::instrument(level="debug", skip(self), fields(id=self.id, cluster=%self.config.cluster_name))]
    async fn main(mut self) -> RaftResult<()> {
        self.restore_from_storage().await?;

        // Control rotates between the role loops until one of them lands on shutdown. Each
        // loop returns as soon as `state` names a role other than its own.
        loop {
            match self.state {
                State::Leader => LeaderState::new(&mut self).run().await?,
                State::Candidate => self.candidate_loop().await?,
                State::Follower => self.follower_loop().await?,
                State::NonVoter => self.learner_loop().await?,
                State::Shutdown => {
                    tracing::info!(id = self.id, "raft node has shut down");
                    return Ok(());
                }
            }
        }
    }

    /// Recover durable state and decide which role to boot into.
    #[tracing::instrument(level = "debug", skip(self))]
    async fn restore_from_storage(&mut self) -> RaftResult<()> {
        tracing::debug!("raft node is initializing");

        let recovered = self.storage.get_initial_state().await.map_err(|err| self.fatal_storage(err))?;
        self.last_log_id = recovered.last_log_id;
        self.current_term = recovered.hard_state.current_term;
        self.voted_for = recovered.hard_state.voted_for;
        self.membership = recovered.membership;
        self.last_applied = recovered.last_applied_log;
        // The commit index is deliberately NOT recovered: only a live leader of the current
        // term may vouch for one.
        self.commit_index = 0;

        if let Some(snapshot) = self.storage.get_current_snapshot().await.map_err(|err| self.fatal_storage(err))? {
            self.snapshot_last_log_id = snapshot.meta.last_log_id;
            self.publish_metrics(Update::Ignore);
        }

        // Pick the starting role. A node with no vote under the current config replicates
        // passively. A voter which is the entire cluster resumes leadership directly —
        // unless it is pristine, in which case it stays passive awaiting initialization.
        // Everything else starts as an ordinary follower.
        let has_log = self.last_log_id.index != 0;
        self.state = if !self.membership.contains(&self.id) {
            State::NonVoter
        } else if self.membership.members.len() == 1 {
            if has_log {
                State::Leader
            } else {
                State::NonVoter
            }
        } else {
            State::Follower
        };

        if self.state.is_follower() {
            // Give the transport a generous grace period before the first election so a
            // restarted node doesn't drive up its term before anyone can reach it.
            let grace = Duration::from_secs(2) + Duration::from_millis(self.config.new_rand_election_timeout());
            self.election_deadline = Some(Instant::now() + grace);
        }

        tracing::debug!(id = self.id, state = ?self.state, "recovered initial state");
        Ok(())
    }

    ///////////////////////////////////////////////////////////////////////////////////////////
    // Passive roles.

    /// The follower loop: answer RPCs, stand for election when the leader goes quiet.
    #[tracing::instrument(level="trace", skip(self), fields(id=self.id, raft_state="follower"))]
    async fn follower_loop(&mut self) -> RaftResult<()> {
        self.publish_metrics(Update::Update(None));
        while self.state.is_follower() {
            // Re-read each pass: leader contact pushes the deadline out from under us.
            let deadline = self.armed_election_deadline();

            tokio::select! {
                _ = sleep_until(deadline) => self.transition(State::Candidate),
                maybe = self.api_rx.recv() => match maybe {
                    Some((msg, span)) => {
                        let _guard = span.enter();
                        self.dispatch_passive(msg, false).await;
                    }
                    None => self.transition(State::Shutdown),
                },
                Some(outcome) = self.compaction_rx.recv() => self.handle_compaction_outcome(outcome),
                Some(Ok(applied)) = self.apply_queue.next() => {
                    // An error here already retargeted state to shutdown.
                    let _ = self.absorb_apply_result(applied);
                }
                Ok(_) = &mut self.shutdown_rx => self.transition(State::Shutdown),
            }
        }
        Ok(())
    }

    /// The learner loop: replicate passively, never time out, accept cluster initialization.
    #[tracing::instrument(level="trace", skip(self), fields(id=self.id, raft_state="learner"))]
    async fn learner_loop(&mut self) -> RaftResult<()> {
        self.publish_metrics(Update::Update(None));
        while self.state.is_non_voter() {
            tokio::select! {
                maybe = self.api_rx.recv() => match maybe {
                    Some((msg, span)) => {
                        let _guard = span.enter();
                        self.dispatch_passive(msg, true).await;
                    }
                    None => self.transition(State::Shutdown),
                },
                Some(outcome) = self.compaction_rx.recv() => self.handle_compaction_outcome(outcome),
                Some(Ok(applied)) = self.apply_queue.next() => {
                    let _ = self.absorb_apply_result(applied);
                }
                Ok(_) = &mut self.shutdown_rx => self.transition(State::Shutdown),
            }
        }
        Ok(())
    }

    /// Dispatch an api message under the rules shared by every non-leader role: RPCs are
    /// answered, client writes are redirected to the leader, admin commands are refused.
    /// Cluster initialization is only honored when `accepts_initialize` — i.e. on a pristine
    /// learner.
    async fn dispatch_passive(&mut self, msg: ApiMessage<D, R>, accepts_initialize: bool) {
        match msg {
            ApiMessage::AppendEntries { rpc, tx } => {
                let _ = tx.send(self.handle_append_entries_request(rpc).await);
            }
            ApiMessage::Vote { rpc, tx } => {
                let _ = tx.send(self.handle_vote_request(rpc).await);
            }
            ApiMessage::InstallSnapshot { rpc, tx } => {
                let _ = tx.send(self.handle_install_snapshot_request(rpc).await);
            }
            ApiMessage::ClientWrite { rpc, tx } => self.redirect_client_write(rpc, tx),
            ApiMessage::Initialize { members, tx } => {
                if accepts_initialize {
                    let _ = tx.send(self.initialize_cluster(members).await);
                } else {
                    self.refuse_initialize(tx);
                }
            }
            ApiMessage::SyncNode { tx, .. } => self.refuse_admin_not_leader(tx),
            ApiMessage::ChangeMembership { tx, .. } => self.refuse_admin_not_leader(tx),
        }
    }

    ///////////////////////////////////////////////////////////////////////////////////////////
    // Candidate.

    /// The candidate loop: one election per iteration until somebody wins the term.
    #[tracing::instrument(level="trace", skip(self), fields(id=self.id, raft_state="candidate"))]
    async fn candidate_loop(&mut self) -> RaftResult<()> {
        while self.state.is_candidate() {
            // Open the new term: advance it, vote for ourselves, persist both before any
            // RPC carrying the term leaves this node.
            self.rearm_election_timer(false);
            self.current_term += 1;
            self.voted_for = Some(self.id);
            self.current_leader = None;
            self.save_hard_state().await?;
            self.publish_metrics(Update::Update(None));

            // Fan out the vote requests and hand their response handles to the quorum
            // collector, bounded by this term's election timeout.
            let deadline = self.armed_election_deadline();
            let handles = self.spawn_parallel_vote_requests();
            let mut election = Box::pin(self.new_vote_collector(handles, deadline).collect());

            // Keep serving traffic while the collector drives the vote to a verdict. An
            // AppendEntries from a legitimate leader retargets state mid-collection, which
            // both loops observe.
            while self.state.is_candidate() {
                tokio::select! {
                    verdict = &mut election => {
                        match verdict {
                            VoteOutcome::Granted => {
                                tracing::debug!(id = self.id, term = self.current_term, "election won");
                                self.transition(State::Leader);
                            }
                            VoteOutcome::HigherTerm(term) => {
                                tracing::debug!(id = self.id, term, "peer reported a higher term");
                                self.bump_term(term, None);
                                self.rearm_election_timer(false);
                                self.save_hard_state().await?;
                                self.transition(State::Follower);
                            }
                            // Defeated or timed out: fall through to the next term.
                            VoteOutcome::Rejected | VoteOutcome::Expired => {}
                        }
                        break;
                    }
                    maybe = self.api_rx.recv() => match maybe {
                        Some((msg, span)) => {
                            let _guard = span.enter();
                            self.dispatch_passive(msg, false).await;
                        }
                        None => self.transition(State::Shutdown),
                    },
                    Some(outcome) = self.compaction_rx.recv() => self.handle_compaction_outcome(outcome),
                    Some(Ok(applied)) = self.apply_queue.next() => {
                        let _ = self.absorb_apply_result(applied);
                    }
                    Ok(_) = &mut self.shutdown_rx => self.transition(State::Shutdown),
                }
            }
        }
        Ok(())
    }

    ///////////////////////////////////////////////////////////////////////////////////////////
    // Shared plumbing.

    /// Publish a fresh metrics snapshot on the watch channel.
    #[tracing::instrument(level = "trace", skip(self))]
    fn publish_metrics(&mut self, leader_metrics: Update<Option<&LeaderMetrics>>) {
        let leader_metrics = match leader_metrics {
            Update::Update(value) => value.cloned(),
            Update::Ignore => self.metrics_tx.borrow().leader_metrics.clone(),
        };
        let snapshot = RaftMetrics {
            id: self.id,
            state: self.state,
            current_term: self.current_term,
            last_log_index: self.last_log_id.index,
            last_applied: self.last_applied.index,
            current_leader: self.current_leader,
            membership_config: self.membership.clone(),
            snapshot: self.snapshot_last_log_id,
            leader_metrics,
        };
        if self.metrics_tx.send(snapshot).is_err() {
            tracing::debug!(id = self.id, "metrics receiver dropped");
        }
    }

    /// Persist `{current_term, voted_for}`.
    #[tracing::instrument(level = "trace", skip(self))]
    async fn save_hard_state(&mut self) -> RaftResult<()> {
        let hs = HardState {
            current_term: self.current_term,
            voted_for: self.voted_for,
        };
        self.storage.save_hard_state(&hs).await.map_err(|err| self.fatal_storage(err))
    }

    /// Move the node toward the given role.
    ///
    /// A demotion to follower lands on learner instead when this node holds no vote under the
    /// current config.
    #[tracing::instrument(level = "trace", skip(self))]
    fn transition(&mut self, to: State) {
        if to == State::Follower && !self.membership.contains(&self.id) {
            self.state = State::NonVoter;
        } else {
            self.state = to;
        }
    }

    /// The armed election deadline, arming a fresh randomized one if none is set.
    fn armed_election_deadline(&mut self) -> Instant {
        match self.election_deadline {
            Some(deadline) => deadline,
            None => {
                let timeout = Duration::from_millis(self.config.new_rand_election_timeout());
                tracing::debug!(?timeout, "arming election timer");
                let deadline = Instant::now() + timeout;
                self.election_deadline = Some(deadline);
                deadline
            }
        }
    }

    /// Push the election deadline out by a fresh randomized timeout.
    ///
    /// `leader_contact` additionally records the moment as the last time a live leader was
    /// heard from, which the vote handler consults before granting votes away.
    #[tracing::instrument(level = "trace", skip(self))]
    fn rearm_election_timer(&mut self, leader_contact: bool) {
        let now = Instant::now();
        self.election_deadline = Some(now + Duration::from_millis(self.config.new_rand_election_timeout()));
        if leader_contact {
            self.last_leader_contact = Some(now);
        }
    }

    /// Adopt a newer term, clearing the recorded vote unless a new one comes with it.
    #[tracing::instrument(level = "trace", skip(self))]
    fn bump_term(&mut self, term: u64, voted_for: Option<NodeId>) {
        if term > self.current_term {
            self.current_term = term;
            self.voted_for = voted_for;
        }
    }

    /// Bookkeeping shared by every RPC a leader sends (AppendEntries, InstallSnapshot): the
    /// contact rearms the election timer, a newer term is adopted & persisted, the sender is
    /// recorded as the current leader, and any active role yields to it.
    ///
    /// Callers must have already rejected terms below their own.
    pub(super) async fn observe_leader_rpc(&mut self, term: u64, leader_id: NodeId) -> RaftResult<()> {
        self.rearm_election_timer(true);

        let mut changed = false;
        if term > self.current_term {
            self.bump_term(term, None);
            self.save_hard_state().await?;
            changed = true;
        }
        if self.current_leader != Some(leader_id) {
            self.current_leader = Some(leader_id);
            changed = true;
        }
        if !self.state.is_follower() && !self.state.is_non_voter() {
            self.transition(State::Follower);
        }
        if changed {
            self.publish_metrics(Update::Ignore);
        }
        Ok(())
    }

    /// Record a storage failure and begin shutdown.
    ///
    /// Storage that can no longer be trusted means this node must stop participating; the
    /// returned error carries the cause up to whoever awaits the core task.
    #[tracing::instrument(level = "trace", skip(self))]
    fn fatal_storage(&mut self, err: anyhow::Error) -> RaftError {
        tracing::error!({error=?err, id=self.id, term=self.current_term}, "fatal storage error, shutting down");
        self.transition(State::Shutdown);
        RaftError::RaftStorage(err)
    }

    /// Swap in a new membership config, demoting or promoting this node as the config says.
    ///
    /// A config which drops this node sends it to the learner role — the signal a parent
    /// application watches for before retiring a removed node. A config which grants a
    /// previously-passive node a vote promotes it to follower.
    #[tracing::instrument(level = "trace", skip(self))]
    fn adopt_membership(&mut self, config: MembershipConfig) -> RaftResult<()> {
        self.membership = config;
        if !self.membership.contains(&self.id) {
            self.transition(State::NonVoter);
        } else if self.state.is_non_voter() && self.membership.members.contains(&self.id) {
            self.transition(State::Follower);
        }
        Ok(())
    }

    ///////////////////////////////////////////////////////////////////////////////////////////
    // Compaction & the apply pipeline.

    /// Kick off a log compaction job when the log has outgrown the snapshot policy.
    ///
    /// With `force`, the threshold check is skipped and a job starts as long as there is
    /// anything at all to compact. No-op while other snapshot work is in flight.
    #[tracing::instrument(level = "trace", skip(self))]
    pub(self) fn maybe_trigger_compaction(&mut self, force: bool) {
        if self.snapshot_state.is_some() {
            return;
        }
        // Nothing applied yet, or the snapshot is somehow ahead of us: nothing to compact.
        if self.last_applied.index == 0 || self.last_applied.index < self.snapshot_last_log_id.index {
            return;
        }
        let SnapshotPolicy::LogsSinceLast(threshold) = self.config.snapshot_policy;
        let since_last = self.last_applied.index - self.snapshot_last_log_id.index;
        if !force && since_last < threshold {
            return;
        }

        let storage = self.storage.clone();
        let outcome_tx = self.compaction_tx.clone();
        let (abort, registration) = AbortHandle::new_pair();
        let (done_tx, _) = broadcast::channel(1);
        self.snapshot_state = Some(SnapshotState::Building {
            abort,
            done: done_tx.clone(),
        });

        tokio::spawn(
            async move {
                match Abortable::new(storage.do_log_compaction(), registration).await {
                    Ok(Ok(snapshot)) => {
                        let _ = outcome_tx.try_send(CompactionOutcome::Finished(snapshot.meta.last_log_id));
                        // Whoever is waiting on the job learns the covered index.
                        let _ = done_tx.send(snapshot.meta.last_log_id.index);
                    }
                    Ok(Err(err)) => {
                        tracing::error!(error=%err, "log compaction failed");
                        let _ = outcome_tx.try_send(CompactionOutcome::Failed);
                    }
                    Err(_aborted) => {
                        let _ = outcome_tx.try_send(CompactionOutcome::Failed);
                    }
                }
            }
            .instrument(tracing::debug_span!("compaction")),
        );
    }

    /// Absorb the outcome of a compaction job.
    #[tracing::instrument(level = "trace", skip(self))]
    pub(self) fn handle_compaction_outcome(&mut self, outcome: CompactionOutcome) {
        if let CompactionOutcome::Finished(log_id) = outcome {
            self.snapshot_last_log_id = log_id;
            self.publish_metrics(Update::Ignore);
        }
        // The building slot is spent either way; an ingest arriving from the leader stays.
        if let Some(receiving @ SnapshotState::Receiving(_)) = self.snapshot_state.take() {
            self.snapshot_state = Some(receiving);
        }
    }

    /// Absorb the result of a background apply task.
    #[tracing::instrument(level = "trace", skip(self, res))]
    pub(self) fn absorb_apply_result(&mut self, res: anyhow::Result<Option<LogId>>) -> RaftResult<()> {
        let applied_upto = res.map_err(|err| self.fatal_storage(err))?;
        tracing::debug!(?applied_upto, "apply task finished");

        if let Some(log_id) = applied_upto {
            self.last_applied = log_id;
        }
        self.publish_metrics(Update::Ignore);
        self.maybe_trigger_compaction(false);
        Ok(())
    }

    ///////////////////////////////////////////////////////////////////////////////////////////
    // Refusals & redirects.

    /// Refuse a cluster-initialize command: this node is already part of a running cluster.
    #[tracing::instrument(level = "trace", skip(self, tx))]
    fn refuse_initialize(&self, tx: oneshot::Sender<Result<(), InitializeError>>) {
        let _ = tx.send(Err(InitializeError::NotAllowed));
    }

    /// Refuse an admin command: only the leader drives membership changes.
    #[tracing::instrument(level = "trace", skip(self, tx))]
    fn refuse_admin_not_leader(&self, tx: ResponseTx) {
        let _ = tx.send(Err(ChangeConfigError::NodeNotLeader(self.current_leader).into()));
    }

    /// Turn a client write away toward the current leader.
    #[tracing::instrument(level = "trace", skip(self, req, tx))]
    fn redirect_client_write(&self, req: ClientWriteRequest<D>, tx: ClientWriteResponseTx<D, R>) {
        match req.entry {
            EntryPayload::Normal(entry) => {
                let _ = tx.send(Err(ClientWriteError::ForwardToLeader(entry.data, self.current_leader)));
            }
            // Internal payloads never travel through the client-write path; the type system
            // can't encode that, so log loudly if it ever happens.
            _ => tracing::error!("attempted to redirect a Raft-internal entry as a client write"),
        }
    }
}

///////////////////////////////////////////////////////////////////////////////////////////////////
// Snapshot bookkeeping.

/// A snapshot mid-transfer from the leader, assembled chunk by chunk.
pub(self) struct SnapshotIngest<S> {
    /// The id of the snapshot being transferred.
    pub id: SnapshotId,
    /// One past the last byte written.
    pub offset: u64,
    /// The storage-side writer receiving the chunks.
    pub writer: Box<S>,
}

/// In-flight snapshot work on this node.
pub(self) enum SnapshotState<S> {
    /// A local compaction job is running.
    Building {
        /// Aborts the job — e.g. when the leader starts streaming us a snapshot instead.
        abort: AbortHandle,
        /// Broadcasts the covered index once the job finishes.
        done: broadcast::Sender<u64>,
    },
    /// A snapshot is streaming in from the leader.
    Receiving(SnapshotIngest<S>),
}

/// The terminal report of a compaction job.
#[derive(Debug)]
pub(self) enum CompactionOutcome {
    /// A snapshot now covers the log through the given id.
    Finished(LogId),
    /// The job failed or was aborted.
    Failed,
}

///////////////////////////////////////////////////////////////////////////////////////////////////
// Leader.

/// Per-target replication bookkeeping, as seen from the leader.
pub(self) struct ReplicationState<D: AppData> {
    /// The highest log id this target is known to have replicated.
    pub matched: LogId,
    /// Remove this target's stream once its match index reaches the given config index.
    pub purge_after: Option<u64>,
    /// The handle feeding the target's replication task.
    pub stream: ReplicationStream<D>,
}

/// A node being synced toward cluster membership.
pub(self) struct LearnerReplication<D: AppData> {
    /// The replication bookkeeping, same as for a voting member.
    pub repl: ReplicationState<D>,
    /// Whether the learner has caught up far enough to take part in consensus.
    pub synced: bool,
    /// Resolves the admin command which started the sync, once `synced`.
    pub tx: Option<ResponseTx>,
}

/// Where the leader currently stands in the joint-consensus protocol.
pub(self) enum ConsensusState {
    /// A membership change is blocked on learners which are still syncing.
    SyncingLearners {
        /// The learners not yet caught up.
        awaiting: HashSet<NodeId>,
        /// The proposed final member set.
        proposal: BTreeSet<NodeId>,
        /// Resolves the admin command once the change completes.
        tx: ResponseTx,
    },
    /// A joint config is in effect.
    Joint {
        /// Whether the joint config entry has committed yet. A new leader starts this at
        /// false and flips it when its opening entry for the term commits.
        committed: bool,
    },
    /// One uniform config; no change in motion.
    Uniform,
}

impl ConsensusState {
    /// Whether a committed joint config is ready to be collapsed to its final form.
    pub fn ready_to_conclude(&self) -> bool {
        matches!(self, ConsensusState::Joint { committed: true })
    }
}

/// Everything a node holds only while it is the leader.
pub(self) struct LeaderState<'a, D: AppData, R: AppDataResponse, N: RaftNetwork<D>, S: RaftStorage<D, R>> {
    pub(super) core: &'a mut RaftCore<D, R, N, S>,
    /// Replication bookkeeping per voting target.
    pub(super) targets: BTreeMap<NodeId, ReplicationState<D>>,
    /// Nodes being synced toward membership.
    pub(super) learners: BTreeMap<NodeId, LearnerReplication<D>>,
    /// Set when the in-flight config change removes this node: commit of the final config is
    /// also this leader's cue to stand down.
    pub(super) stepping_down: bool,

    /// The leader's per-target progress, as published through metrics.
    pub(super) leader_metrics: LeaderMetrics,

    /// Sender cloned into every replication task for its reports.
    pub(super) reports_tx: mpsc::UnboundedSender<(StreamReport<S::SnapshotData>, Span)>,
    /// The reports arriving from replication tasks.
    pub(super) reports_rx: mpsc::UnboundedReceiver<(StreamReport<S::SnapshotData>, Span)>,

    /// Requests appended at this term, in log order, awaiting commitment.
    pub(super) pending: Vec<ClientRequestEntry<D, R>>,

    /// Where the cluster stands in the joint-consensus protocol.
    pub(super) consensus_state: ConsensusState,
}

impl<'a, D: AppData, R: AppDataResponse, N: RaftNetwork<D>, S: RaftStorage<D, R>> LeaderState<'a, D, R, N, S> {
    pub(self) fn new(core: &'a mut RaftCore<D, R, N, S>) -> Self {
        let consensus_state = if core.membership.is_in_joint_consensus() {
            ConsensusState::Joint { committed: false }
        } else {
            ConsensusState::Uniform
        };
        let (reports_tx, reports_rx) = mpsc::unbounded_channel();
        Self {
            core,
            targets: BTreeMap::new(),
            learners: BTreeMap::new(),
            stepping_down: false,
            leader_metrics: LeaderMetrics::default(),
            reports_tx,
            reports_rx,
            pending: Vec::new(),
            consensus_state,
        }
    }

    /// Run the leader loop.
    #[tracing::instrument(level="trace", skip(self), fields(id=self.core.id, raft_state="leader"))]
    pub(self) async fn run(mut self) -> RaftResult<()> {
        // One replication stream per known peer — voters and joint-config newcomers alike.
        for target in self.core.membership.all_nodes() {
            if target != self.core.id {
                let state = self.spawn_replication_stream(target);
                self.targets.insert(target, state);
            }
        }

        self.core.last_leader_contact = None;
        self.core.election_deadline = None;
        self.core.current_leader = Some(self.core.id);
        self.publish_leader_metrics();

        // Per §8, a fresh leader opens its term by committing an entry of its own — which is
        // also what makes earlier-term entries committable under the same-term rule.
        self.commit_initial_leader_entry().await?;

        loop {
            if !self.core.state.is_leader() {
                tracing::info!(id = self.core.id, state = ?self.core.state, "leaving leader state");
                self.halt_replication();
                // Nothing here can commit anymore on this node; tell the callers now rather
                // than leave them hanging on dead completions.
                self.reject_pending();
                return Ok(());
            }

            let span = tracing::debug_span!("leader");
            let _guard = span.enter();

            tokio::select! {
                Some((report, span)) = self.reports_rx.recv() => {
                    tracing::debug!("replication report: {}", report.summary());
                    let _guard = span.enter();
                    self.handle_stream_report(report).await;
                }
                Some((msg, span)) = self.core.api_rx.recv() => {
                    let _guard = span.enter();
                    match msg {
                        ApiMessage::AppendEntries { rpc, tx } => {
                            let _ = tx.send(self.core.handle_append_entries_request(rpc).await);
                        }
                        ApiMessage::Vote { rpc, tx } => {
                            let _ = tx.send(self.core.handle_vote_request(rpc).await);
                        }
                        ApiMessage::InstallSnapshot { rpc, tx } => {
                            let _ = tx.send(self.core.handle_install_snapshot_request(rpc).await);
                        }
                        ApiMessage::ClientWrite { rpc, tx } => {
                            tracing::debug!("client write: {}", rpc.summary());
                            self.handle_client_write_request(rpc, tx).await;
                        }
                        ApiMessage::Initialize { tx, .. } => self.core.refuse_initialize(tx),
                        ApiMessage::SyncNode { id, tx } => {
                            tracing::debug!(target = id, "sync new node");
                            self.sync_new_node(id, tx).await;
                        }
                        ApiMessage::ChangeMembership { members, tx } => {
                            tracing::debug!(?members, "change membership");
                            self.change_membership(members, tx).await;
                        }
                    }
                }
                Some(outcome) = self.core.compaction_rx.recv() => self.core.handle_compaction_outcome(outcome),
                Some(Ok(applied)) = self.core.apply_queue.next() => {
                    let _ = self.core.absorb_apply_result(applied);
                }
                Ok(_) = &mut self.core.shutdown_rx => {
                    tracing::info!("shutdown requested");
                    self.core.transition(State::Shutdown);
                }
            }
        }
    }

    /// Tell every replication task to wind down.
    fn halt_replication(&mut self) {
        for state in self.targets.values() {
            let _ = state.stream.tx.send((StreamEvent::Halt, tracing::debug_span!("halt")));
        }
        for learner in self.learners.values() {
            let _ = learner.repl.stream.tx.send((StreamEvent::Halt, tracing::debug_span!("halt")));
        }
    }

    /// Publish metrics including the leader's per-target progress.
    #[tracing::instrument(level = "trace", skip(self))]
    pub fn publish_leader_metrics(&mut self) {
        self.core.publish_metrics(Update::Update(Some(&self.leader_metrics)));
    }
}
