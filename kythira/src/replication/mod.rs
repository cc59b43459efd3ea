//! Per-target replication.
//!
//! The leader runs one replication task per target. Each task owns the target's `next_index` &
//! `matched` bookkeeping and keeps at most one AppendEntries RPC in flight: a payload is staged,
//! sent, and its response awaited before anything else goes out, which is what keeps
//! per-follower delivery ordered without sequence numbers. The task reports progress, conflicts
//! and higher terms back to the leader, and switches itself between steady replication,
//! storage-driven catch-up, and snapshot delivery as the target's position demands.

use std::collections::VecDeque;
use std::io::SeekFrom;
use std::sync::Arc;

use futures::future::FutureExt;
use serde::Deserialize;
use serde::Serialize;
use tokio::io::AsyncRead;
use tokio::io::AsyncReadExt;
use tokio::io::AsyncSeek;
use tokio::io::AsyncSeekExt;
use tokio::sync::mpsc;
use tokio::sync::oneshot;
use tokio::time::interval;
use tokio::time::timeout;
use tokio::time::Duration;
use tokio::time::Interval;
use tracing::Instrument;
use tracing::Span;

use crate::config::Config;
use crate::config::SnapshotPolicy;
use crate::error::RaftResult;
use crate::raft::AppendEntriesRequest;
use crate::raft::ConflictOpt;
use crate::raft::Entry;
use crate::raft::EntryPayload;
use crate::raft::InstallSnapshotRequest;
use crate::storage::Snapshot;
use crate::AppData;
use crate::AppDataResponse;
use crate::LogId;
use crate::MessageSummary;
use crate::NodeId;
use crate::RaftNetwork;
use crate::RaftStorage;

/// The replication progress of a single target, as exposed through the leader's metrics.
#[derive(Default, Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ReplicationMetrics {
    pub matched: LogId,
}

/// The leader-side handle to a spawned replication task.
pub(crate) struct ReplicationStream<D: AppData> {
    /// Feeds events (fresh entries, commit updates, the halt order) to the task.
    pub tx: mpsc::UnboundedSender<(StreamEvent<D>, Span)>,
}

impl<D: AppData> ReplicationStream<D> {
    /// Spawn a replication task for the given target.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new<R: AppDataResponse, N: RaftNetwork<D>, S: RaftStorage<D, R>>(
        id: NodeId,
        target: NodeId,
        term: u64,
        config: Arc<Config>,
        last_log: LogId,
        commit_index: u64,
        network: Arc<N>,
        storage: Arc<S>,
        leader_tx: mpsc::UnboundedSender<(StreamReport<S::SnapshotData>, Span)>,
    ) -> Self {
        ReplicationTask::spawn(id, target, term, config, last_log, commit_index, network, storage, leader_tx)
    }
}

/// An event from the leader to one of its replication tasks.
pub(crate) enum StreamEvent<D: AppData> {
    /// A freshly appended entry to replicate, along with the commit index as of its append.
    ///
    /// The entry is always the newest in the log, so its index doubles as the new
    /// `last_log_index` for the task.
    Append {
        entry: Arc<Entry<D>>,
        commit_index: u64,
    },
    /// The commit index moved.
    Commit { commit_index: u64 },
    /// Wind the task down.
    Halt,
}

/// A report from a replication task back to the leader.
pub(crate) enum StreamReport<S>
where S: AsyncRead + AsyncSeek + Send + Unpin + 'static
{
    /// The task entered (or left) steady state.
    ///
    /// In steady state the task wants entries pushed to it as they are appended; outside it,
    /// the task drives itself from storage and the leader should only send metadata.
    SteadyState { target: NodeId, steady: bool },
    /// The target acknowledged the log through `matched`.
    Matched { target: NodeId, matched: LogId },
    /// The target answered with a term above the leader's: time to stand down.
    HigherTerm { target: NodeId, term: u64 },
    /// The target is beyond entry replay; the task needs the current snapshot to proceed.
    NeedsSnapshot {
        target: NodeId,
        tx: oneshot::Sender<Snapshot<S>>,
    },
    /// The task hit an unrecoverable storage fault; the node must shut down.
    Fatal,
}

impl<S: AsyncRead + AsyncSeek + Send + Unpin + 'static> MessageSummary for StreamReport<S> {
    fn summary(&self) -> String {
        match self {
            StreamReport::SteadyState { target, steady } => format!("SteadyState({}, steady={})", target, steady),
            StreamReport::Matched { target, matched } => format!("Matched({}, {})", target, matched),
            StreamReport::HigherTerm { target, term } => format!("HigherTerm({}, term={})", target, term),
            StreamReport::NeedsSnapshot { target, .. } => format!("NeedsSnapshot({})", target),
            StreamReport::Fatal => "Fatal".to_string(),
        }
    }
}

/// What a replication task is currently doing.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum StreamState {
    /// The target tracks the head of the log; fresh entries are pushed as they arrive.
    Steady,
    /// The target is behind; entries are replayed out of storage in batches.
    CatchingUp,
    /// The target is behind the compaction boundary; only a snapshot can help.
    Snapshotting,
    /// The task is winding down.
    Closed,
}

struct ReplicationTask<D: AppData, R: AppDataResponse, N: RaftNetwork<D>, S: RaftStorage<D, R>> {
    /// The ID of this Raft node.
    id: NodeId,
    /// The node being replicated to.
    target: NodeId,
    /// The leader's term, fixed for the lifetime of the task.
    term: u64,

    network: Arc<N>,
    storage: Arc<S>,
    config: Arc<Config>,
    /// `config.max_payload_entries`, precomputed as a usize.
    max_payload: usize,
    marker_r: std::marker::PhantomData<R>,

    /// Reports up to the leader.
    leader_tx: mpsc::UnboundedSender<(StreamReport<S::SnapshotData>, Span)>,
    /// Events down from the leader.
    events_rx: mpsc::UnboundedReceiver<(StreamEvent<D>, Span)>,

    state: StreamState,

    /// The index of the newest entry in the leader's log.
    last_log_index: u64,
    /// The cluster commit index as last relayed by the leader.
    commit_index: u64,

    /// The next index to send.
    ///
    /// Starts at the head of the leader's log and walks backwards over conflict reports from a
    /// divergent or stale target until the logs meet; from there it only advances. When it
    /// falls onto compacted ground the task switches to snapshot delivery — it never drops
    /// below the snapshot boundary.
    next_index: u64,
    /// The newest log id the target is known to hold. Kept at `next_index - 1`, so it doubles
    /// as the log-match point for the consistency check.
    matched: LogId,

    /// Entries handed over by the leader as they were appended, waiting to be staged.
    queue: VecDeque<Arc<Entry<D>>>,
    /// The staged payload. Entries stay here until the target acknowledges them, so a payload
    /// lost to a transport fault is retransmitted as is.
    payload: Vec<Arc<Entry<D>>>,

    /// The fallback send cadence: heartbeats when idle, retries when unreachable.
    heartbeat: Interval,
    /// Per-RPC reply deadline for AppendEntries.
    rpc_timeout: Duration,
    /// Per-RPC reply deadline for InstallSnapshot segments.
    snapshot_rpc_timeout: Duration,
}

impl<D: AppData, R: AppDataResponse, N: RaftNetwork<D>, S: RaftStorage<D, R>> ReplicationTask<D, R, N, S> {
    #[allow(clippy::too_many_arguments)]
    fn spawn(
        id: NodeId,
        target: NodeId,
        term: u64,
        config: Arc<Config>,
        last_log: LogId,
        commit_index: u64,
        network: Arc<N>,
        storage: Arc<S>,
        leader_tx: mpsc::UnboundedSender<(StreamReport<S::SnapshotData>, Span)>,
    ) -> ReplicationStream<D> {
        let (tx, events_rx) = mpsc::unbounded_channel();
        let rpc_timeout = Duration::from_millis(config.heartbeat_interval);
        let snapshot_rpc_timeout = Duration::from_millis(config.install_snapshot_timeout);
        let max_payload = config.max_payload_entries as usize;

        let task = Self {
            id,
            target,
            term,
            network,
            storage,
            heartbeat: interval(rpc_timeout),
            config,
            max_payload,
            marker_r: std::marker::PhantomData,
            leader_tx,
            events_rx,
            state: StreamState::CatchingUp,
            last_log_index: last_log.index,
            commit_index,
            next_index: last_log.index + 1,
            matched: last_log,
            queue: VecDeque::new(),
            payload: Vec::new(),
            rpc_timeout,
            snapshot_rpc_timeout,
        };
        tokio::spawn(task.run().instrument(tracing::debug_span!("spawn")));

        ReplicationStream { tx }
    }

    #[tracing::instrument(level="trace", skip(self), fields(id=self.id, target=self.target, cluster=%self.config.cluster_name))]
    async fn run(mut self) {
        // The opening send announces this term's leadership to the target.
        self.send_payload().await;

        loop {
            match self.state {
                StreamState::Steady => self.steady_loop().await,
                StreamState::CatchingUp => self.catch_up_loop().await,
                StreamState::Snapshotting => self.snapshot_loop().await,
                StreamState::Closed => return,
            }
        }
    }

    /// Send a report up to the leader.
    fn report(&self, report: StreamReport<S::SnapshotData>) {
        let _ = self.leader_tx.send((report, tracing::debug_span!("report")));
    }

    /// A storage fault inside the task is unrecoverable for the whole node.
    fn fail(&mut self, err: anyhow::Error) {
        tracing::error!(error=?err, target=self.target, "storage error in replication task");
        self.report(StreamReport::Fatal);
        self.state = StreamState::Closed;
    }

    /// Pull queued entries into the payload slot, up to one batch, if the slot is free.
    fn stage_from_queue(&mut self) {
        if self.payload.is_empty() && !self.queue.is_empty() {
            let take = std::cmp::min(self.queue.len(), self.max_payload);
            self.payload.extend(self.queue.drain(..take));
        }
    }

    /// Send the staged payload (or a bare heartbeat) and absorb the response.
    ///
    /// Returns false when no response arrived — the target is unreachable this round and the
    /// payload stays staged for a retry on the next tick.
    #[tracing::instrument(level = "trace", skip(self))]
    async fn send_payload(&mut self) -> bool {
        self.stage_from_queue();

        let request = AppendEntriesRequest {
            term: self.term,
            leader_id: self.id,
            // `matched` is the entry at `next_index - 1` by construction, so it doubles as the
            // log-match point for the payload.
            prev_log_id: self.matched,
            entries: self.payload.iter().map(|entry| entry.as_ref().clone()).collect(),
            leader_commit: self.commit_index,
        };

        let res = match timeout(self.rpc_timeout, self.network.send_append_entries(self.target, request)).await {
            Ok(Ok(res)) => res,
            Ok(Err(err)) => {
                tracing::warn!(error=%err, target=self.target, "failed to send AppendEntries");
                return false;
            }
            Err(_elapsed) => {
                tracing::warn!(target = self.target, "AppendEntries timed out");
                return false;
            }
        };

        // A response arrived: whatever was staged has been delivered & judged, one way or the
        // other. Nothing is ever sent twice.
        let shipped_upto = self.payload.last().map(|entry| entry.log_id);
        self.payload.clear();

        if res.term > self.term {
            tracing::debug!(term = res.term, "target is ahead of this leader's term");
            self.report(StreamReport::HigherTerm {
                target: self.target,
                term: res.term,
            });
            self.state = StreamState::Closed;
            return true;
        }

        if res.success {
            if let Some(log_id) = shipped_upto {
                self.matched = log_id;
                self.next_index = log_id.index + 1;
                self.report(StreamReport::Matched {
                    target: self.target,
                    matched: log_id,
                });
                // A target trailing the head of the log too far catches up from storage.
                if self.last_log_index.saturating_sub(self.matched.index) > self.config.replication_lag_threshold {
                    self.state = StreamState::CatchingUp;
                }
            }
            return true;
        }

        self.backtrack(res.conflict_opt).await;
        true
    }

    /// Rewind `next_index` after a failed log-match check.
    #[tracing::instrument(level = "trace", skip(self))]
    async fn backtrack(&mut self, conflict: Option<ConflictOpt>) {
        let hint = match conflict {
            Some(conflict) => conflict,
            None => {
                // No hint from the target; probe a single index back.
                self.next_index = std::cmp::max(self.next_index.saturating_sub(1), 1);
                let probe = self.next_index - 1;
                if probe == 0 {
                    // Backed all the way up to the before-any-entry sentinel.
                    self.matched = LogId { term: 0, index: 0 };
                    self.state = StreamState::CatchingUp;
                    return;
                }
                match self.storage.try_get_log_entry(probe).await {
                    Ok(Some(entry)) => {
                        self.matched = entry.log_id;
                        self.state = StreamState::CatchingUp;
                    }
                    // The probe point sits behind the compacted prefix.
                    Ok(None) => self.state = StreamState::Snapshotting,
                    Err(err) => self.fail(err),
                }
                return;
            }
        };

        // A hint beyond our own log is nonsense from the target; let the next round retry.
        if hint.log_id.index > self.last_log_index {
            return;
        }
        self.next_index = hint.log_id.index + 1;
        self.matched = hint.log_id;

        if hint.log_id.index == 0 {
            // Rewound to the very start of the log; there is nothing to probe in storage.
            self.state = StreamState::CatchingUp;
            self.report(StreamReport::Matched {
                target: self.target,
                matched: self.matched,
            });
            return;
        }

        // Probe our own log at the hinted index: present means we resume from it with its
        // actual term; compacted away means only a snapshot can bring the target back.
        match self.storage.try_get_log_entry(hint.log_id.index).await {
            Ok(Some(entry)) => {
                self.matched.term = entry.log_id.term;
                self.report(StreamReport::Matched {
                    target: self.target,
                    matched: self.matched,
                });
                // A divergence wider than the snapshot threshold is cheaper to repair with a
                // snapshot than with entry replay.
                let SnapshotPolicy::LogsSinceLast(threshold) = self.config.snapshot_policy;
                if self.last_log_index - hint.log_id.index >= threshold {
                    self.state = StreamState::Snapshotting;
                } else {
                    self.state = StreamState::CatchingUp;
                }
            }
            Ok(None) => {
                self.report(StreamReport::Matched {
                    target: self.target,
                    matched: self.matched,
                });
                self.state = StreamState::Snapshotting;
            }
            Err(err) => self.fail(err),
        }
    }

    /// Drain whatever the leader has queued for this task, starting with `first`.
    fn absorb_events(&mut self, first: (StreamEvent<D>, Span)) {
        let mut next = Some(first);
        let mut drained = 0;
        while let Some((event, span)) = next.take() {
            let _guard = span.enter();
            match event {
                StreamEvent::Append { entry, commit_index } => {
                    self.commit_index = commit_index;
                    self.last_log_index = entry.log_id.index;
                    // Outside steady state the entry is left behind on purpose: the catch-up
                    // path replays it out of storage when its turn comes.
                    if self.state == StreamState::Steady {
                        self.queue.push_back(entry);
                    }
                }
                StreamEvent::Commit { commit_index } => self.commit_index = commit_index,
                StreamEvent::Halt => {
                    self.state = StreamState::Closed;
                    return;
                }
            }

            // Bounded, so one hot feed cannot starve the send loop.
            drained += 1;
            if drained > self.max_payload {
                return;
            }
            next = self.events_rx.recv().now_or_never().flatten();
        }
    }

    /// Load the gap `[next_index, upto)` from storage into the payload slot, one batch at most.
    ///
    /// Returns false when the task changed state instead of loading — the gap crosses the
    /// compaction boundary, or storage failed.
    async fn fill_from_storage(&mut self, upto: u64) -> bool {
        if !self.payload.is_empty() {
            // A staged payload is still awaiting its acknowledgement; send that first.
            return true;
        }
        let stop = std::cmp::min(upto, self.next_index + self.max_payload as u64);
        let entries = match self.storage.get_log_entries(self.next_index..stop).await {
            Ok(entries) => entries,
            Err(err) => {
                self.fail(err);
                return false;
            }
        };
        if entries.iter().any(|entry| matches!(entry.payload, EntryPayload::PurgedMarker)) {
            // Part of the gap has been compacted away; entry replay cannot help anymore.
            self.state = StreamState::Snapshotting;
            return false;
        }
        self.payload.extend(entries.into_iter().map(Arc::new));
        true
    }

    /// Whether the target has fallen behind the compaction threshold relative to the commit
    /// index, i.e. entry replay is no longer worth it.
    fn needs_snapshot(&self) -> bool {
        let SnapshotPolicy::LogsSinceLast(threshold) = self.config.snapshot_policy;
        self.commit_index.saturating_sub(self.matched.index) >= threshold
    }

    /// Whether the target holds everything committed so far.
    fn caught_up(&self) -> bool {
        self.next_index > self.commit_index
    }

    ///////////////////////////////////////////////////////////////////////////////////////////
    // Steady state.

    #[tracing::instrument(level = "trace", skip(self), fields(state = "steady"))]
    async fn steady_loop(&mut self) {
        self.report(StreamReport::SteadyState {
            target: self.target,
            steady: true,
        });

        while self.state == StreamState::Steady {
            // Where does the next payload begin?
            let upcoming = self
                .payload
                .first()
                .map(|entry| entry.log_id.index)
                .or_else(|| self.queue.front().map(|entry| entry.log_id.index))
                .unwrap_or(self.last_log_index + 1);

            // Entries may have bypassed this task while it was catching up or snapshotting;
            // close the gap out of storage before touching the queue.
            if self.next_index != upcoming {
                if !self.fill_from_storage(upcoming).await {
                    continue;
                }
                self.send_payload().await;
                continue;
            }

            // Fresh entries ship at once. Staged-but-unacknowledged entries instead wait for
            // the tick below, so an unreachable target is probed at the heartbeat cadence
            // rather than in a hot loop.
            if self.payload.is_empty() && !self.queue.is_empty() {
                self.send_payload().await;
                continue;
            }

            tokio::select! {
                _ = self.heartbeat.tick() => {
                    self.send_payload().await;
                }
                maybe = self.events_rx.recv() => match maybe {
                    Some(event) => self.absorb_events(event),
                    None => self.state = StreamState::Closed,
                },
            }
        }
    }

    ///////////////////////////////////////////////////////////////////////////////////////////
    // Catch-up.

    #[tracing::instrument(level = "trace", skip(self), fields(state = "catching-up"))]
    async fn catch_up_loop(&mut self) {
        self.report(StreamReport::SteadyState {
            target: self.target,
            steady: false,
        });
        // Whatever was buffered belongs to the head of the log; catch-up replays straight from
        // storage instead.
        self.queue.clear();
        self.payload.clear();

        while self.state == StreamState::CatchingUp {
            if self.needs_snapshot() {
                self.state = StreamState::Snapshotting;
                return;
            }
            if self.caught_up() {
                self.state = StreamState::Steady;
                return;
            }

            if !self.fill_from_storage(self.commit_index + 1).await {
                continue;
            }
            if !self.send_payload().await {
                // Unreachable; probe again at the heartbeat cadence rather than spinning.
                self.heartbeat.tick().await;
            }
            if self.caught_up() {
                self.state = StreamState::Steady;
                return;
            }

            // Stay current on commit movement & halt orders while replaying.
            if let Some(event) = self.events_rx.recv().now_or_never().flatten() {
                self.absorb_events(event);
            }
        }
    }

    ///////////////////////////////////////////////////////////////////////////////////////////
    // Snapshot delivery.

    #[tracing::instrument(level = "trace", skip(self), fields(state = "snapshotting"))]
    async fn snapshot_loop(&mut self) {
        self.report(StreamReport::SteadyState {
            target: self.target,
            steady: false,
        });
        self.queue.clear();
        self.payload.clear();

        while self.state == StreamState::Snapshotting {
            // Ask the leader for the current snapshot. The request can go unanswered — e.g.
            // a compaction job is still producing it — in which case we simply ask again.
            let (tx, rx) = oneshot::channel();
            self.report(StreamReport::NeedsSnapshot {
                target: self.target,
                tx,
            });
            let snapshot = match self.await_snapshot(rx).await {
                Some(snapshot) => snapshot,
                None => continue,
            };
            if let Err(err) = self.stream_snapshot(snapshot).await {
                tracing::warn!(error=%err, target=self.target, "error streaming snapshot to target");
            }
        }
    }

    /// Wait for the leader to hand over a snapshot, heartbeating the target meanwhile.
    ///
    /// Returns `None` when the handover channel closed without a snapshot, or the task left
    /// the snapshotting state while waiting.
    #[tracing::instrument(level = "trace", skip(self, rx))]
    async fn await_snapshot(
        &mut self,
        mut rx: oneshot::Receiver<Snapshot<S::SnapshotData>>,
    ) -> Option<Snapshot<S::SnapshotData>> {
        loop {
            if self.state != StreamState::Snapshotting {
                return None;
            }
            tokio::select! {
                _ = self.heartbeat.tick() => {
                    self.send_payload().await;
                }
                maybe = self.events_rx.recv() => match maybe {
                    Some(event) => self.absorb_events(event),
                    None => {
                        self.state = StreamState::Closed;
                        return None;
                    }
                },
                res = &mut rx => return res.ok(),
            }
        }
    }

    /// Stream the given snapshot to the target, segment by segment.
    #[tracing::instrument(level = "trace", skip(self, snapshot))]
    async fn stream_snapshot(&mut self, mut snapshot: Snapshot<S::SnapshotData>) -> RaftResult<()> {
        let size = snapshot.snapshot.seek(SeekFrom::End(0)).await?;

        // Once delivered, the target holds the log through the snapshot boundary.
        self.next_index = snapshot.meta.last_log_id.index + 1;
        self.matched = snapshot.meta.last_log_id;

        let mut offset = 0;
        let mut chunk = Vec::with_capacity(self.config.snapshot_max_chunk_size as usize);
        loop {
            snapshot.snapshot.seek(SeekFrom::Start(offset)).await?;
            let read = snapshot.snapshot.read_buf(&mut chunk).await?;
            let done = offset + read as u64 == size;

            let request = InstallSnapshotRequest {
                term: self.term,
                leader_id: self.id,
                meta: snapshot.meta.clone(),
                offset,
                data: Vec::from(&chunk[..read]),
                done,
            };
            chunk.clear();

            tracing::debug!(target = self.target, offset, size, done, "sending snapshot segment");

            let res = match timeout(
                self.snapshot_rpc_timeout,
                self.network.send_install_snapshot(self.target, request),
            )
            .await
            {
                Ok(Ok(res)) => res,
                Ok(Err(err)) => {
                    tracing::warn!(error=%err, target=self.target, "failed to send InstallSnapshot");
                    continue;
                }
                Err(_elapsed) => {
                    tracing::warn!(target = self.target, "InstallSnapshot timed out");
                    continue;
                }
            };

            if res.term > self.term {
                self.report(StreamReport::HigherTerm {
                    target: self.target,
                    term: res.term,
                });
                self.state = StreamState::Closed;
                return Ok(());
            }

            if done {
                self.report(StreamReport::Matched {
                    target: self.target,
                    matched: snapshot.meta.last_log_id,
                });
                self.state = StreamState::CatchingUp;
                return Ok(());
            }
            offset += read as u64;

            // Stay current on commit movement & halt orders between segments.
            if let Some(event) = self.events_rx.recv().now_or_never().flatten() {
                self.absorb_events(event);
            }
        }
    }
}
