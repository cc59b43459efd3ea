use std::io::SeekFrom;

use tokio::io::AsyncSeekExt;
use tokio::io::AsyncWriteExt;

use crate::core::RaftCore;
use crate::core::SnapshotIngest;
use crate::core::SnapshotState;
use crate::error::RaftResult;
use crate::raft::InstallSnapshotRequest;
use crate::raft::InstallSnapshotResponse;
use crate::AppData;
use crate::AppDataResponse;
use crate::MessageSummary;
use crate::RaftError;
use crate::RaftNetwork;
use crate::RaftStorage;
use crate::SnapshotMeta;
use crate::Update;

impl<D: AppData, R: AppDataResponse, N: RaftNetwork<D>, S: RaftStorage<D, R>> RaftCore<D, R, N, S> {
    /// An RPC invoked by the leader to stream chunks of a snapshot to a follower (§7).
    ///
    /// Chunks belong together by snapshot id and arrive with increasing offsets; the final one
    /// carries `done`. A fresh id at offset 0 starts a new assembly (superseding whatever was
    /// in flight), a fresh id mid-stream is rejected as out of order, and a chunked-up local
    /// compaction always loses to the leader's stream.
    #[tracing::instrument(level = "debug", skip(self, req), fields(req=%req.summary()))]
    pub(super) async fn handle_install_snapshot_request(
        &mut self,
        req: InstallSnapshotRequest,
    ) -> RaftResult<InstallSnapshotResponse> {
        // Requests from a deposed leader are answered with the newer term and nothing else.
        if req.term < self.current_term {
            return Ok(InstallSnapshotResponse {
                term: self.current_term,
            });
        }

        // Only a live leader streams snapshots: note the contact before touching the chunk.
        self.observe_leader_rpc(req.term, req.leader_id).await?;

        match self.snapshot_state.take() {
            // A chunk for the assembly already in progress.
            Some(SnapshotState::Receiving(ingest)) if ingest.id == req.meta.snapshot_id => {
                self.ingest_snapshot_chunk(req, ingest).await?;
            }
            // A different id: acceptable only as the start of a replacement stream.
            Some(SnapshotState::Receiving(ingest)) => {
                if req.offset != 0 {
                    let expect = (ingest.id.clone(), ingest.offset).into();
                    // Keep the in-progress assembly; this chunk is the stray one.
                    self.snapshot_state = Some(SnapshotState::Receiving(ingest));
                    return Err(RaftError::SnapshotMismatch {
                        expect,
                        got: (req.meta.snapshot_id.clone(), req.offset).into(),
                    });
                }
                self.start_snapshot_ingest(req).await?;
            }
            // Our own compaction is redundant now that the leader is sending a snapshot.
            Some(SnapshotState::Building { abort, .. }) => {
                abort.abort();
                self.start_snapshot_ingest(req).await?;
            }
            None => {
                self.start_snapshot_ingest(req).await?;
            }
        }

        Ok(InstallSnapshotResponse {
            term: self.current_term,
        })
    }

    /// Open a new snapshot assembly for the given request, which must be its first chunk.
    async fn start_snapshot_ingest(&mut self, req: InstallSnapshotRequest) -> RaftResult<()> {
        if req.offset != 0 {
            return Err(RaftError::SnapshotMismatch {
                expect: (req.meta.snapshot_id.clone(), 0).into(),
                got: (req.meta.snapshot_id.clone(), req.offset).into(),
            });
        }
        let writer = self.storage.begin_receiving_snapshot().await.map_err(|err| self.fatal_storage(err))?;
        let ingest = SnapshotIngest {
            id: req.meta.snapshot_id.clone(),
            offset: 0,
            writer,
        };
        self.ingest_snapshot_chunk(req, ingest).await
    }

    /// Write one chunk into the assembly, finishing the installation on the `done` chunk.
    ///
    /// On a write failure the assembly is parked back into `snapshot_state` so the leader's
    /// retransmission of the chunk can pick up where this one left off.
    async fn ingest_snapshot_chunk(
        &mut self,
        req: InstallSnapshotRequest,
        mut ingest: SnapshotIngest<S::SnapshotData>,
    ) -> RaftResult<()> {
        // Chunks may be retransmitted; land this one exactly where the leader says it goes.
        if req.offset != ingest.offset {
            if let Err(err) = ingest.writer.seek(SeekFrom::Start(req.offset)).await {
                self.snapshot_state = Some(SnapshotState::Receiving(ingest));
                return Err(err.into());
            }
            ingest.offset = req.offset;
        }

        if let Err(err) = ingest.writer.write_all(&req.data).await {
            self.snapshot_state = Some(SnapshotState::Receiving(ingest));
            return Err(err.into());
        }
        ingest.offset += req.data.len() as u64;

        if !req.done {
            // More chunks coming; park the assembly until they do.
            self.snapshot_state = Some(SnapshotState::Receiving(ingest));
            return Ok(());
        }

        self.install_assembled_snapshot(req.meta, ingest).await
    }

    /// Hand the fully assembled snapshot to storage and adopt its watermarks.
    ///
    /// Failures past this point are fatal: a half-installed snapshot is not a state this node
    /// can keep operating on.
    async fn install_assembled_snapshot(
        &mut self,
        meta: SnapshotMeta,
        mut ingest: SnapshotIngest<S::SnapshotData>,
    ) -> RaftResult<()> {
        ingest.writer.shutdown().await.map_err(|err| self.fatal_storage(err.into()))?;
        self.storage
            .finalize_snapshot_installation(&meta, ingest.writer)
            .await
            .map_err(|err| self.fatal_storage(err))?;

        // Storage has swapped in the snapshot and dropped the covered log prefix; line the
        // volatile state up with it. The restore may carry a membership this node has never
        // seen, so re-read it through storage rather than trusting what we had.
        let membership = self.storage.get_membership_config().await.map_err(|err| self.fatal_storage(err))?;
        self.adopt_membership(membership)?;

        self.last_log_id = meta.last_log_id;
        if meta.last_log_id.index >= self.last_applied.index {
            self.last_applied = meta.last_log_id;
        }
        self.commit_index = std::cmp::max(self.commit_index, meta.last_log_id.index);
        self.snapshot_last_log_id = meta.last_log_id;
        self.publish_metrics(Update::Ignore);
        Ok(())
    }
}
