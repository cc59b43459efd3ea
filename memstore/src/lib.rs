//! An in-memory implementation of the `kythira::RaftStorage` trait.
//!
//! This is the reference persistence engine used by the kythira test suite. All four durable
//! slots — hard state, log, snapshot, state machine — live behind async RwLocks, and every
//! mutation completes before the storage call returns, which is what stands in for durability
//! in-process.


use std::collections::BTreeMap;
use std::collections::HashMap;
use std::io::Cursor;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;

use anyhow::Result;
use kythira::async_trait::async_trait;
use kythira::raft::Entry;
use kythira::raft::EntryPayload;
use kythira::raft::MembershipConfig;
use kythira::storage::HardState;
use kythira::storage::InitialState;
use kythira::storage::Snapshot;
use kythira::storage::SnapshotMeta;
use kythira::LogId;
use kythira::NodeId;
use kythira::RaftStorage;
use kythira::RaftStorageDebug;
use serde::Deserialize;
use serde::Serialize;
use tokio::sync::RwLock;
use tokio::sync::RwLockWriteGuard;

/// The application data request type which the `MemStore` works with.
///
/// Conceptually, for demo purposes, this represents an update to a client's status info,
/// returning the previously recorded status.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ClientRequest {
    /// The ID of the client which has sent the request.
    pub client: String,
    /// The serial number of this request.
    ///
    /// Clients which retry a command after a leadership change reuse the serial; the state
    /// machine deduplicates on it so a retried command is never executed twice.
    pub serial: u64,
    /// A string describing the status of the client. For a real application, this should probably
    /// be an enum representing all of the various types of requests / operations which a client
    /// can perform.
    pub status: String,
}

/// The application data response type which the `MemStore` works with.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ClientResponse(pub Option<String>);

/// The state machine of the `MemStore`.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct MemStoreStateMachine {
    pub last_applied_log: LogId,
    /// A mapping of client IDs to their state info.
    pub client_serial_responses: HashMap<String, (u64, Option<String>)>,
    /// The current status of a client by ID.
    pub client_status: HashMap<String, String>,
}

/// The current snapshot of the `MemStore`.
#[derive(Clone, Debug)]
pub struct MemStoreSnapshot {
    pub meta: SnapshotMeta,
    /// The data of the state machine at the time of this snapshot.
    pub data: Vec<u8>,
}

/// An in-memory storage system implementing the `kythira::RaftStorage` trait.
pub struct MemStore {
    /// The ID of the Raft node for which this memory storage instances is configured.
    id: NodeId,
    /// The Raft log.
    log: RwLock<BTreeMap<u64, Entry<ClientRequest>>>,
    /// The Raft state machine.
    sm: RwLock<MemStoreStateMachine>,
    /// The current hard state.
    hs: RwLock<Option<HardState>>,
    /// The current snapshot.
    current_snapshot: RwLock<Option<MemStoreSnapshot>>,
    /// A counter distinguishing snapshots built over the same log id.
    snapshot_idx: AtomicU64,
}

impl MemStore {
    /// Create a new `MemStore` instance.
    pub fn new(id: NodeId) -> Self {
        Self {
            id,
            log: RwLock::new(BTreeMap::new()),
            sm: RwLock::new(MemStoreStateMachine::default()),
            hs: RwLock::new(None),
            current_snapshot: RwLock::new(None),
            snapshot_idx: AtomicU64::new(0),
        }
    }

    /// Get a handle to the log for testing purposes.
    pub async fn get_log(&self) -> RwLockWriteGuard<'_, BTreeMap<u64, Entry<ClientRequest>>> {
        self.log.write().await
    }
}

#[async_trait]
impl RaftStorage<ClientRequest, ClientResponse> for MemStore {
    type SnapshotData = Cursor<Vec<u8>>;

    #[tracing::instrument(level = "trace", skip(self))]
    async fn get_membership_config(&self) -> Result<MembershipConfig> {
        let log = self.log.read().await;
        let cfg = log.values().rev().find_map(|entry| match &entry.payload {
            EntryPayload::ConfigChange(cfg) => Some(cfg.membership.clone()),
            _ => None,
        });
        Ok(match cfg {
            Some(cfg) => cfg,
            None => {
                // The log carries no config; the latest snapshot is the next authority, else
                // this is a pristine node.
                let snapshot = self.current_snapshot.read().await;
                match &*snapshot {
                    Some(snapshot) => snapshot.meta.membership.clone(),
                    None => MembershipConfig::new_initial(self.id),
                }
            }
        })
    }

    #[tracing::instrument(level = "trace", skip(self))]
    async fn get_initial_state(&self) -> Result<InitialState> {
        let membership = self.get_membership_config().await?;
        let mut hs = self.hs.write().await;
        let log = self.log.read().await;
        let sm = self.sm.read().await;
        match &mut *hs {
            Some(inner) => {
                let last_log_id = match log.values().rev().next() {
                    Some(entry) => entry.log_id,
                    None => LogId { term: 0, index: 0 },
                };
                Ok(InitialState {
                    last_log_id,
                    last_applied_log: sm.last_applied_log,
                    hard_state: inner.clone(),
                    membership,
                })
            }
            None => {
                let new = InitialState::new_initial(self.id);
                *hs = Some(new.hard_state.clone());
                Ok(new)
            }
        }
    }

    #[tracing::instrument(level = "trace", skip(self, hs))]
    async fn save_hard_state(&self, hs: &HardState) -> Result<()> {
        *self.hs.write().await = Some(hs.clone());
        Ok(())
    }

    #[tracing::instrument(level = "trace", skip(self, range))]
    async fn get_log_entries<RNG: std::ops::RangeBounds<u64> + Clone + std::fmt::Debug + Send + Sync>(
        &self,
        range: RNG,
    ) -> Result<Vec<Entry<ClientRequest>>> {
        let log = self.log.read().await;
        Ok(log.range(range).map(|(_, entry)| entry.clone()).collect())
    }

    #[tracing::instrument(level = "trace", skip(self))]
    async fn try_get_log_entry(&self, log_index: u64) -> Result<Option<Entry<ClientRequest>>> {
        let log = self.log.read().await;
        Ok(log.get(&log_index).cloned())
    }

    #[tracing::instrument(level = "trace", skip(self))]
    async fn get_last_log_id(&self) -> Result<LogId> {
        let log = self.log.read().await;
        if let Some(entry) = log.values().rev().next() {
            return Ok(entry.log_id);
        }
        let sm = self.sm.read().await;
        Ok(sm.last_applied_log)
    }

    #[tracing::instrument(level = "trace", skip(self, range))]
    async fn delete_logs_from<RNG: std::ops::RangeBounds<u64> + Clone + std::fmt::Debug + Send + Sync>(
        &self,
        range: RNG,
    ) -> Result<()> {
        let mut log = self.log.write().await;
        let keys: Vec<u64> = log.range(range).map(|(key, _)| *key).collect();
        for key in keys {
            log.remove(&key);
        }
        Ok(())
    }

    #[tracing::instrument(level = "trace", skip(self, entries))]
    async fn append_to_log(&self, entries: &[&Entry<ClientRequest>]) -> Result<()> {
        let mut log = self.log.write().await;
        for entry in entries {
            log.insert(entry.log_id.index, (*entry).clone());
        }
        Ok(())
    }

    #[tracing::instrument(level = "trace", skip(self, entries))]
    async fn apply_to_state_machine(&self, entries: &[&Entry<ClientRequest>]) -> Result<Vec<ClientResponse>> {
        let mut sm = self.sm.write().await;
        let mut res = Vec::with_capacity(entries.len());
        for entry in entries {
            sm.last_applied_log = entry.log_id;
            match &entry.payload {
                EntryPayload::Normal(norm) => {
                    let data = &norm.data;
                    // Replays of a client's latest serial return the recorded response without
                    // re-executing the command.
                    if let Some((serial, response)) = sm.client_serial_responses.get(&data.client) {
                        if serial == &data.serial {
                            res.push(ClientResponse(response.clone()));
                            continue;
                        }
                    }
                    let previous = sm.client_status.insert(data.client.clone(), data.status.clone());
                    sm.client_serial_responses.insert(data.client.clone(), (data.serial, previous.clone()));
                    res.push(ClientResponse(previous));
                }
                // Blank entries, config changes & purged markers mutate no client state.
                _ => res.push(ClientResponse(None)),
            }
        }
        Ok(res)
    }

    #[tracing::instrument(level = "trace", skip(self))]
    async fn do_log_compaction(&self) -> Result<Snapshot<Self::SnapshotData>> {
        let (data, last_applied_log);
        {
            // Serialize the data of the state machine.
            let sm = self.sm.read().await;
            data = serde_json::to_vec(&*sm)?;
            last_applied_log = sm.last_applied_log;
        }

        let membership_config = self.get_membership_config().await?;

        let snapshot_idx = self.snapshot_idx.fetch_add(1, Ordering::SeqCst) + 1;
        let snapshot_id = format!("{}-{}-{}", last_applied_log.term, last_applied_log.index, snapshot_idx);

        let snapshot = {
            let mut log = self.log.write().await;
            let mut current_snapshot = self.current_snapshot.write().await;

            // Drop the compacted prefix, leaving a purged marker standing in for it.
            *log = log.split_off(&last_applied_log.index);
            log.insert(last_applied_log.index, Entry::new_purged_marker(last_applied_log));

            let meta = SnapshotMeta {
                last_log_id: last_applied_log,
                membership: membership_config,
                snapshot_id,
            };
            let snapshot = MemStoreSnapshot { meta, data };
            *current_snapshot = Some(snapshot.clone());
            snapshot
        };

        tracing::trace!({ snapshot_size = snapshot.data.len() }, "log compaction complete");
        Ok(Snapshot {
            meta: snapshot.meta,
            snapshot: Box::new(Cursor::new(snapshot.data)),
        })
    }

    #[tracing::instrument(level = "trace", skip(self))]
    async fn begin_receiving_snapshot(&self) -> Result<Box<Self::SnapshotData>> {
        Ok(Box::new(Cursor::new(Vec::new())))
    }

    #[tracing::instrument(level = "trace", skip(self, snapshot))]
    async fn finalize_snapshot_installation(
        &self,
        meta: &SnapshotMeta,
        snapshot: Box<Self::SnapshotData>,
    ) -> Result<()> {
        tracing::trace!(
            { snapshot_size = snapshot.get_ref().len() },
            "decoding snapshot for installation"
        );
        let new_snapshot = MemStoreSnapshot {
            meta: meta.clone(),
            data: snapshot.into_inner(),
        };

        {
            // Drop the now-covered log prefix, leaving a purged marker at the boundary.
            let mut log = self.log.write().await;
            *log = log.split_off(&meta.last_log_id.index);
            log.insert(meta.last_log_id.index, Entry::new_purged_marker(meta.last_log_id));
        }

        {
            // Restore the state machine from the snapshot bytes.
            let new_sm: MemStoreStateMachine = serde_json::from_slice(&new_snapshot.data)?;
            let mut sm = self.sm.write().await;
            *sm = new_sm;
        }

        // Update the current snapshot.
        let mut current_snapshot = self.current_snapshot.write().await;
        *current_snapshot = Some(new_snapshot);
        Ok(())
    }

    #[tracing::instrument(level = "trace", skip(self))]
    async fn get_current_snapshot(&self) -> Result<Option<Snapshot<Self::SnapshotData>>> {
        match &*self.current_snapshot.read().await {
            Some(snapshot) => {
                let data = snapshot.data.clone();
                Ok(Some(Snapshot {
                    meta: snapshot.meta.clone(),
                    snapshot: Box::new(Cursor::new(data)),
                }))
            }
            None => Ok(None),
        }
    }
}

#[async_trait]
impl RaftStorageDebug<MemStoreStateMachine> for MemStore {
    /// Get a handle to the state machine for testing purposes.
    async fn get_state_machine(&self) -> MemStoreStateMachine {
        self.sm.read().await.clone()
    }

    /// Get the current hard state for testing purposes.
    async fn read_hard_state(&self) -> Option<HardState> {
        self.hs.read().await.clone()
    }
}
