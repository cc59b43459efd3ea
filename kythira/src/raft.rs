//! Public Raft interface and data types.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::sync::oneshot;
use tokio::sync::watch;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::Span;

use crate::config::Config;
use crate::core::RaftCore;
use crate::error::ClientWriteError;
use crate::error::InitializeError;
use crate::error::RaftError;
use crate::error::RaftResult;
use crate::error::ResponseError;
use crate::membership::AcceptAll;
use crate::membership::MembershipAuthorizer;
use crate::metrics::RaftMetrics;
use crate::metrics::Wait;
use crate::AppData;
use crate::AppDataResponse;
use crate::LogId;
use crate::MessageSummary;
use crate::NodeId;
use crate::RaftNetwork;
use crate::RaftStorage;
use crate::SnapshotMeta;

/// The Raft API.
///
/// This is the handle to a running Raft node: every interaction — inbound RPCs, client writes,
/// cluster administration — goes through it. The node itself runs as a single spawned task
/// owning all volatile state; this handle merely enqueues messages onto that task's mailbox and
/// awaits the paired one-shot reply, which is what serializes all entry points.
///
/// ### clone
/// Cloning is cheap (an `Arc` bump) and encouraged: hand one handle to your RPC server, another
/// to your client-facing API, and so on.
///
/// ### shutting down
/// A `RaftError::ShuttingDown` from any method means the node's task is winding down —
/// typically for data-safety reasons after a storage fault. Call `shutdown` to await it. The
/// same method is how a parent application stops a healthy node.
pub struct Raft<D: AppData, R: AppDataResponse, N: RaftNetwork<D>, S: RaftStorage<D, R>> {
    inner: Arc<RaftInner<D, R, N, S>>,
}

struct RaftInner<D: AppData, R: AppDataResponse, N: RaftNetwork<D>, S: RaftStorage<D, R>> {
    to_core: mpsc::UnboundedSender<(ApiMessage<D, R>, Span)>,
    metrics_rx: watch::Receiver<RaftMetrics>,
    core_handle: Mutex<Option<JoinHandle<RaftResult<()>>>>,
    shutdown_tx: Mutex<Option<oneshot::Sender<()>>>,
    marker_n: std::marker::PhantomData<N>,
    marker_s: std::marker::PhantomData<S>,
}

impl<D: AppData, R: AppDataResponse, N: RaftNetwork<D>, S: RaftStorage<D, R>> Raft<D, R, N, S> {
    /// Create and spawn a new Raft task with the default admit-everyone membership policy.
    ///
    /// `id` must be stable across restarts of this node — persist it alongside the log. The
    /// `config`, `network` & `storage` collaborators are shared with the spawned task; see the
    /// docs on `Config`, `RaftNetwork` and `RaftStorage` respectively.
    #[tracing::instrument(level="trace", skip(config, network, storage), fields(cluster=%config.cluster_name))]
    pub fn new(id: NodeId, config: Arc<Config>, network: Arc<N>, storage: Arc<S>) -> Self {
        Self::with_authorizer(id, config, network, storage, Arc::new(AcceptAll))
    }

    /// Create and spawn a new Raft task with the given membership authorization policy.
    ///
    /// The authorizer is consulted on the leader before a new node is synced for membership; see
    /// the docs on the `MembershipAuthorizer` trait.
    #[tracing::instrument(level="trace", skip(config, network, storage, authorizer), fields(cluster=%config.cluster_name))]
    pub fn with_authorizer(
        id: NodeId,
        config: Arc<Config>,
        network: Arc<N>,
        storage: Arc<S>,
        authorizer: Arc<dyn MembershipAuthorizer>,
    ) -> Self {
        let (to_core, api_rx) = mpsc::unbounded_channel();
        let (metrics_tx, metrics_rx) = watch::channel(RaftMetrics::new_initial(id));
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let core_handle = RaftCore::spawn(id, config, network, storage, authorizer, api_rx, metrics_tx, shutdown_rx);
        Self {
            inner: Arc::new(RaftInner {
                to_core,
                metrics_rx,
                core_handle: Mutex::new(Some(core_handle)),
                shutdown_tx: Mutex::new(Some(shutdown_tx)),
                marker_n: std::marker::PhantomData,
                marker_s: std::marker::PhantomData,
            }),
        }
    }

    /// Enqueue a message for the core task and await its reply.
    ///
    /// Fails with `ShuttingDown` when the core is gone, on either side of the exchange.
    async fn call<T>(&self, build: impl FnOnce(oneshot::Sender<T>) -> ApiMessage<D, R>) -> Result<T, RaftError> {
        let (tx, rx) = oneshot::channel();
        self.inner
            .to_core
            .send((build(tx), tracing::debug_span!("api")))
            .map_err(|_| RaftError::ShuttingDown)?;
        rx.await.map_err(|_| RaftError::ShuttingDown)
    }

    /// Feed an inbound AppendEntries RPC — a leader's replication batch or heartbeat — into
    /// this node (§5.2, §5.3). Wire transports route received frames here.
    #[tracing::instrument(level = "debug", skip(self, rpc), fields(rpc=%rpc.summary()))]
    pub async fn append_entries(&self, rpc: AppendEntriesRequest<D>) -> Result<AppendEntriesResponse, RaftError> {
        self.call(|tx| ApiMessage::AppendEntries { rpc, tx }).await?
    }

    /// Feed an inbound RequestVote RPC — a campaigning peer asking for this node's vote — into
    /// this node (§5.2). Wire transports route received frames here.
    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn vote(&self, rpc: VoteRequest) -> Result<VoteResponse, RaftError> {
        self.call(|tx| ApiMessage::Vote { rpc, tx }).await?
    }

    /// Feed an inbound InstallSnapshot RPC — one segment of a leader's snapshot transfer to a
    /// node too far behind for entry replay — into this node (§7). Wire transports route
    /// received frames here.
    #[tracing::instrument(level = "debug", skip(self, rpc), fields(snapshot=%rpc.meta.last_log_id))]
    pub async fn install_snapshot(&self, rpc: InstallSnapshotRequest) -> Result<InstallSnapshotResponse, RaftError> {
        self.call(|tx| ApiMessage::InstallSnapshot { rpc, tx }).await?
    }

    /// Run a client command through the replicated log (§5.1).
    ///
    /// The request is appended to the log, committed to the cluster, and applied to the
    /// application state machine; the state machine's output for it comes back as the response.
    /// The reply is only sent after application completes, so a success observed by a client is
    /// always backed by state-machine state.
    ///
    /// For linearizable semantics across leader failovers, clients should attach unique serial
    /// numbers to commands and the state machine should deduplicate on them (a retried command
    /// may otherwise execute twice — see §8). `RaftStorage::apply_to_state_machine` is the place
    /// to implement that.
    #[tracing::instrument(level = "debug", skip(self, rpc))]
    pub async fn client_write(
        &self,
        rpc: ClientWriteRequest<D>,
    ) -> Result<ClientWriteResponse<R>, ClientWriteError<D>> {
        self.call(|tx| ApiMessage::ClientWrite { rpc, tx })
            .await
            .map_err(ClientWriteError::RaftError)?
    }

    /// Submit a mutating client request with a deadline.
    ///
    /// Identical to `client_write`, except that the call fails with `ClientWriteError::Timeout`
    /// once `timeout` elapses. The entry may still commit and apply after the deadline — timing
    /// out only abandons the wait, so clients must handle retries idempotently.
    #[tracing::instrument(level = "debug", skip(self, rpc))]
    pub async fn client_write_timeout(
        &self,
        rpc: ClientWriteRequest<D>,
        timeout: Duration,
    ) -> Result<ClientWriteResponse<R>, ClientWriteError<D>> {
        match tokio::time::timeout(timeout, self.client_write(rpc)).await {
            Ok(res) => res,
            Err(_elapsed) => Err(ClientWriteError::Timeout),
        }
    }

    /// Form a brand new cluster from this pristine node and the given member set.
    ///
    /// Valid only on a node with an empty log at term 0 (otherwise the cluster is already
    /// formed, and the call fails with `InitializeError::NotAllowed` — which is safe to ignore
    /// for exactly that reason). Call it on every discovered member with the full discovered
    /// member set; Raft guarantees that whichever node wins the resulting election propagates
    /// its config, so the procedure is race-free.
    ///
    /// A single-member init makes this node leader outright; a multi-member init starts an
    /// election. Either way the winning leader's first committed entry carries the config.
    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn initialize(&self, members: BTreeSet<NodeId>) -> Result<(), InitializeError> {
        self.call(|tx| ApiMessage::Initialize { members, tx })
            .await
            .map_err(InitializeError::RaftError)?
    }

    /// Bring a new node up-to-speed ahead of granting it membership (§6).
    ///
    /// The target is replicated to as a non-voter until it has caught up; this method resolves
    /// once it has. Follow with `change_membership` to actually grant it a vote. The cluster's
    /// membership authorizer is consulted before any syncing begins; a refusal fails this call
    /// with `ChangeConfigError::NotAuthorized`.
    ///
    /// Fails when this node is not the cluster leader.
    #[tracing::instrument(level = "debug", skip(self, id), fields(target=id))]
    pub async fn add_non_voter(&self, id: NodeId) -> Result<(), ResponseError> {
        self.call(|tx| ApiMessage::SyncNode { id, tx })
            .await
            .map_err(ResponseError::from)?
            .map(|_index| ())
    }

    /// Move the cluster to a new membership config (§6).
    ///
    /// Drives the joint-consensus protocol toward the given member set. Any proposed members
    /// which are not yet synced are first brought up-to-speed as non-voters (prefer calling
    /// `add_non_voter` ahead of time so this step is instantaneous), then the joint config and
    /// the final config are committed in turn.
    ///
    /// Fails when this node is not the cluster leader.
    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn change_membership(&self, members: BTreeSet<NodeId>) -> Result<(), ResponseError> {
        self.call(|tx| ApiMessage::ChangeMembership { members, tx })
            .await
            .map_err(ResponseError::from)?
            .map(|_index| ())
    }

    /// The leader as this node most recently observed it.
    ///
    /// May be stale across a leadership change; it is the hint to hand to clients for request
    /// routing.
    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn current_leader(&self) -> Option<NodeId> {
        self.inner.metrics_rx.borrow().current_leader
    }

    /// Check if this node currently believes itself to be the cluster leader.
    pub fn is_leader(&self) -> bool {
        let metrics = self.inner.metrics_rx.borrow();
        metrics.current_leader == Some(metrics.id)
    }

    /// Get the current term of this Raft node.
    pub fn current_term(&self) -> u64 {
        self.inner.metrics_rx.borrow().current_term
    }

    /// A receiver for the node's metrics stream.
    pub fn metrics(&self) -> watch::Receiver<RaftMetrics> {
        self.inner.metrics_rx.clone()
    }

    /// A helper awaiting some condition on the metrics stream.
    ///
    /// ```ignore
    /// # use std::time::Duration;
    /// # use kythira::{State, Raft};
    ///
    /// // wait for raft log-3 to be received and applied:
    /// r.wait(Some(Duration::from_millis(200))).log(3, "log-3").await?;
    ///
    /// // wait for this node to observe node 2 as leader:
    /// r.wait(None).current_leader(2, "leader").await?;
    /// ```
    pub fn wait(&self, timeout: Option<Duration>) -> Wait {
        Wait {
            timeout: timeout.unwrap_or_else(|| Duration::from_millis(500)),
            rx: self.inner.metrics_rx.clone(),
        }
    }

    /// Stop this node, awaiting the core task's exit.
    pub async fn shutdown(&self) -> anyhow::Result<()> {
        if let Some(tx) = self.inner.shutdown_tx.lock().await.take() {
            let _ = tx.send(());
        }
        if let Some(handle) = self.inner.core_handle.lock().await.take() {
            let _ = handle.await?;
        }
        Ok(())
    }
}

impl<D: AppData, R: AppDataResponse, N: RaftNetwork<D>, S: RaftStorage<D, R>> Clone for Raft<D, R, N, S> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

pub(crate) type ClientWriteResponseTx<D, R> = oneshot::Sender<Result<ClientWriteResponse<R>, ClientWriteError<D>>>;
pub(crate) type ResponseTx = oneshot::Sender<Result<u64, ResponseError>>;

/// A message from the public API to the core task, paired with its reply channel.
pub(crate) enum ApiMessage<D: AppData, R: AppDataResponse> {
    AppendEntries {
        rpc: AppendEntriesRequest<D>,
        tx: oneshot::Sender<Result<AppendEntriesResponse, RaftError>>,
    },
    Vote {
        rpc: VoteRequest,
        tx: oneshot::Sender<Result<VoteResponse, RaftError>>,
    },
    InstallSnapshot {
        rpc: InstallSnapshotRequest,
        tx: oneshot::Sender<Result<InstallSnapshotResponse, RaftError>>,
    },
    ClientWrite {
        rpc: ClientWriteRequest<D>,
        tx: ClientWriteResponseTx<D, R>,
    },
    Initialize {
        members: BTreeSet<NodeId>,
        tx: oneshot::Sender<Result<(), InitializeError>>,
    },
    SyncNode {
        id: NodeId,
        tx: ResponseTx,
    },
    ChangeMembership {
        members: BTreeSet<NodeId>,
        tx: ResponseTx,
    },
}

//////////////////////////////////////////////////////////////////////////////////////////////////
// Log & membership model.

/// One entry of the replicated log.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Entry<D: AppData> {
    pub log_id: LogId,

    /// What the entry carries.
    #[serde(bound = "D: AppData")]
    pub payload: EntryPayload<D>,
}

impl<D: AppData> Entry<D> {
    /// Create a new purged marker at the given log id.
    ///
    /// The marker stands in for the compacted log prefix ending at `log_id`.
    pub fn new_purged_marker(log_id: LogId) -> Self {
        Entry {
            log_id,
            payload: EntryPayload::PurgedMarker,
        }
    }
}

/// The kinds of payload a log entry can carry.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum EntryPayload<D: AppData> {
    /// Nothing: the entry a fresh leader commits to open its term.
    Blank,
    /// An application command.
    #[serde(bound = "D: AppData")]
    Normal(EntryNormal<D>),
    /// A cluster membership config.
    ConfigChange(EntryConfigChange),
    /// The stand-in for a compacted log prefix.
    PurgedMarker,
}

/// An application command riding the log.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EntryNormal<D: AppData> {
    /// The command itself, opaque to Raft.
    #[serde(bound = "D: AppData")]
    pub data: D,
}

/// A membership config riding the log.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EntryConfigChange {
    /// The config the cluster moves to upon appending this entry.
    pub membership: MembershipConfig,
}

impl<D: AppData> MessageSummary for Entry<D> {
    fn summary(&self) -> String {
        format!("{}:{}", self.log_id, self.payload.summary())
    }
}

impl<D: AppData> MessageSummary for &[Entry<D>] {
    fn summary(&self) -> String {
        self.iter().map(|entry| entry.summary()).collect::<Vec<_>>().join(",")
    }
}

impl<D: AppData> MessageSummary for EntryPayload<D> {
    fn summary(&self) -> String {
        match self {
            EntryPayload::Blank => "blank".to_string(),
            EntryPayload::Normal(_) => "normal".to_string(),
            EntryPayload::ConfigChange(change) => format!("config-change: {:?}", change.membership),
            EntryPayload::PurgedMarker => "purged-marker".to_string(),
        }
    }
}

/// Which nodes make up the cluster.
///
/// During a membership change the config is a *joint* of the old and the new member set, and
/// every quorum decision needs a majority of each set independently. A config takes effect the
/// moment the entry carrying it lands in a node's log — commitment is not the trigger.
#[derive(Clone, Default, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MembershipConfig {
    /// The voting members.
    pub members: BTreeSet<NodeId>,
    /// The voting members once the in-flight change concludes; `Some` is what makes a config
    /// joint.
    pub members_after_consensus: Option<BTreeSet<NodeId>>,
}

impl MembershipConfig {
    /// The bootstrap config: a cluster of exactly the given node.
    pub fn new_initial(id: NodeId) -> Self {
        let mut members = BTreeSet::new();
        members.insert(id);
        Self {
            members,
            members_after_consensus: None,
        }
    }

    /// All node IDs named by this config, across both groups of a joint config.
    pub fn all_nodes(&self) -> BTreeSet<u64> {
        match &self.members_after_consensus {
            Some(new_members) => self.members.union(new_members).cloned().collect(),
            None => self.members.clone(),
        }
    }

    /// Check if the given node is named by this config, in either group of a joint config.
    pub fn contains(&self, id: &NodeId) -> bool {
        self.members.contains(id)
            || self.members_after_consensus.as_ref().map_or(false, |members| members.contains(id))
    }

    /// Whether a membership change is in flight.
    pub fn is_in_joint_consensus(&self) -> bool {
        self.members_after_consensus.is_some()
    }

    /// Collapse a joint config to its final form; a uniform config is returned as is.
    pub fn to_final_config(&self) -> Self {
        match &self.members_after_consensus {
            Some(members) => MembershipConfig {
                members: members.clone(),
                members_after_consensus: None,
            },
            None => self.clone(),
        }
    }
}

//////////////////////////////////////////////////////////////////////////////////////////////////
// The three RPC pairs.

/// The log replication & heartbeat RPC, sent only by leaders (§5.2, §5.3).
#[derive(Debug, Serialize, Deserialize)]
pub struct AppendEntriesRequest<D: AppData> {
    /// The term the sending leader holds.
    pub term: u64,
    /// The sending leader's ID, recorded by receivers for client redirection.
    pub leader_id: u64,

    /// The log id directly below `entries`: the log-match point of the consistency check.
    pub prev_log_id: LogId,

    /// The batch of entries to store — empty for a bare heartbeat.
    #[serde(bound = "D: AppData")]
    pub entries: Vec<Entry<D>>,
    /// The commit index as the leader knows it.
    pub leader_commit: u64,
}

impl<D: AppData> MessageSummary for AppendEntriesRequest<D> {
    fn summary(&self) -> String {
        format!(
            "AppendEntries(term={}, leader={}, prev={}, commit={}, entries={})",
            self.term,
            self.leader_id,
            self.prev_log_id,
            self.leader_commit,
            self.entries.len()
        )
    }
}

/// What came back from an `AppendEntriesRequest`.
#[derive(Debug, Serialize, Deserialize)]
pub struct AppendEntriesResponse {
    /// The responder's term, so a stale leader learns it has been deposed.
    pub term: u64,
    /// True when the responder held the log-match point and accepted the batch.
    pub success: bool,
    /// The backtracking hint of the conflicting-term optimization (§5.3). Meaningful only on a
    /// failed consistency check.
    pub conflict_opt: Option<ConflictOpt>,
}

/// The backtracking hint a follower attaches to a failed log-match check (§5.3).
///
/// It names the most recent entry below the follower's run of the conflicting term (or the
/// follower's own last log id when the leader probed past its log entirely). The leader resumes
/// replication one past the reported id, skipping a whole term's worth of conflicting entries
/// per round trip instead of probing an index at a time.
#[derive(Debug, Serialize, Deserialize, PartialEq)]
pub struct ConflictOpt {
    /// The newest entry on the follower known not to conflict with the leader.
    pub log_id: LogId,
}

/// The vote-gathering RPC, sent by candidates campaigning for a term (§5.2).
#[derive(Debug, Serialize, Deserialize)]
pub struct VoteRequest {
    /// The term the candidate is campaigning for.
    pub term: u64,
    /// The campaigning node's ID.
    pub candidate_id: u64,
    /// The index of the candidate's newest log entry, for the up-to-date check (§5.4).
    pub last_log_index: u64,
    /// The term of the candidate's newest log entry, for the up-to-date check (§5.4).
    pub last_log_term: u64,
}

impl VoteRequest {
    /// Create a new instance.
    pub fn new(term: u64, candidate_id: u64, last_log_index: u64, last_log_term: u64) -> Self {
        Self {
            term,
            candidate_id,
            last_log_index,
            last_log_term,
        }
    }
}

impl MessageSummary for VoteRequest {
    fn summary(&self) -> String {
        format!(
            "Vote(term={}, candidate={}, last_log={}-{})",
            self.term, self.candidate_id, self.last_log_term, self.last_log_index
        )
    }
}

/// What came back from a `VoteRequest`.
#[derive(Debug, Serialize, Deserialize)]
pub struct VoteResponse {
    /// The responder's term, so a stale candidate learns it is behind.
    pub term: u64,
    /// True when the responder granted the candidate its vote.
    pub vote_granted: bool,
}

/// One segment of a snapshot transfer from the leader to a lagging follower (§7).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct InstallSnapshotRequest {
    /// The term the sending leader holds.
    pub term: u64,
    /// The sending leader's ID, recorded by receivers for client redirection.
    pub leader_id: u64,

    /// Which snapshot the segment belongs to: its id, covered log id & membership.
    pub meta: SnapshotMeta,

    /// Where in the snapshot byte stream this segment starts.
    pub offset: u64,
    /// The segment's bytes.
    pub data: Vec<u8>,

    /// Marks the final segment of the transfer.
    pub done: bool,
}

impl MessageSummary for InstallSnapshotRequest {
    fn summary(&self) -> String {
        format!(
            "InstallSnapshot(term={}, leader={}, meta={:?}, offset={}, len={}, done={})",
            self.term,
            self.leader_id,
            self.meta,
            self.offset,
            self.data.len(),
            self.done
        )
    }
}

/// What came back from an `InstallSnapshotRequest`.
#[derive(Debug, Serialize, Deserialize)]
pub struct InstallSnapshotResponse {
    /// The responder's term, so a stale leader learns it has been deposed.
    pub term: u64,
}

//////////////////////////////////////////////////////////////////////////////////////////////////
// Client request & response types.

/// A mutation of the replicated state machine, as submitted by a client (§5.1).
///
/// Its payload becomes a log entry, travels the replication pipeline, and reaches the state
/// machine once committed.
#[derive(Debug, Serialize, Deserialize)]
pub struct ClientWriteRequest<D: AppData> {
    /// The payload the log entry will carry.
    #[serde(bound = "D: AppData")]
    pub(crate) entry: EntryPayload<D>,
}

impl<D: AppData> ClientWriteRequest<D> {
    /// Wrap an application command for submission.
    pub fn new(entry: D) -> Self {
        Self::with_payload(EntryPayload::Normal(EntryNormal { data: entry }))
    }

    pub(crate) fn with_payload(entry: EntryPayload<D>) -> Self {
        Self { entry }
    }

    /// Build a payload carrying a membership config.
    pub(crate) fn config_change(membership: MembershipConfig) -> Self {
        Self::with_payload(EntryPayload::ConfigChange(EntryConfigChange { membership }))
    }

    /// Build a blank payload, as committed by new leaders when first coming to power.
    pub(crate) fn blank() -> Self {
        Self::with_payload(EntryPayload::Blank)
    }
}

impl<D: AppData> MessageSummary for ClientWriteRequest<D> {
    fn summary(&self) -> String {
        self.entry.summary()
    }
}

/// The outcome of a committed & applied client write.
#[derive(Debug, Serialize, Deserialize)]
pub struct ClientWriteResponse<R: AppDataResponse> {
    /// The log index the write landed at.
    pub index: u64,
    /// The state machine's output for the command.
    #[serde(bound = "R: AppDataResponse")]
    pub data: R,
}
