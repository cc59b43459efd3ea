use std::sync::Arc;

use futures::stream::StreamExt;

use crate::core::LeaderState;
use crate::core::State;
use crate::error::ChangeConfigError;
use crate::error::ClientWriteError;
use crate::error::RaftError;
use crate::error::RaftResult;
use crate::error::ResponseError;
use crate::raft::ClientWriteRequest;
use crate::raft::ClientWriteResponse;
use crate::raft::ClientWriteResponseTx;
use crate::raft::Entry;
use crate::raft::EntryPayload;
use crate::raft::ResponseTx;
use crate::replication::StreamEvent;
use crate::AppData;
use crate::AppDataResponse;
use crate::LogId;
use crate::RaftNetwork;
use crate::RaftStorage;

/// A wrapper around a ClientRequest which has been transformed into an Entry, along with its response channel.
pub(super) struct ClientRequestEntry<D: AppData, R: AppDataResponse> {
    /// The Arc'd entry of the ClientRequest.
    ///
    /// This value is Arc'd so that it may be sent across thread boundaries for replication
    /// without having to clone the data payload itself.
    pub entry: Arc<Entry<D>>,
    /// The response channel for the request.
    pub tx: ClientOrInternalResponseTx<D, R>,
}

impl<D: AppData, R: AppDataResponse> ClientRequestEntry<D, R> {
    /// Create a new instance from the raw components of a client request.
    pub(crate) fn from_entry<T: Into<ClientOrInternalResponseTx<D, R>>>(entry: Entry<D>, tx: T) -> Self {
        Self {
            entry: Arc::new(entry),
            tx: tx.into(),
        }
    }
}

/// An enum type wrapping either a client response channel or an internal Raft response channel.
#[derive(derive_more::From)]
pub enum ClientOrInternalResponseTx<D: AppData, R: AppDataResponse> {
    Client(ClientWriteResponseTx<D, R>),
    Internal(Option<ResponseTx>),
}

impl<'a, D: AppData, R: AppDataResponse, N: RaftNetwork<D>, S: RaftStorage<D, R>> LeaderState<'a, D, R, N, S> {
    /// Commit the initial entry which new leaders are obligated to create when first coming to power, per §8.
    #[tracing::instrument(level = "trace", skip(self))]
    pub(super) async fn commit_initial_leader_entry(&mut self) -> RaftResult<()> {
        // If the cluster has just formed, and the current index is 0, then commit the current
        // config, else a blank payload.
        let last_index = self.core.last_log_id.index;

        let req: ClientWriteRequest<D> = if last_index == 0 {
            ClientWriteRequest::config_change(self.core.membership.clone())
        } else {
            // Complete a partial member-change:
            //
            // Raft appends two consecutive membership change logs: the joint config and the final config,
            // to impl a membership change.
            //
            // It is possible only the first one, the joint config log is written in to storage or replicated.
            // Thus if a new leader sees only the first one, it needs to append the final config log to let
            // the change-membership operation to finish.

            let last_logs =
                self.core.storage.get_log_entries(last_index..=last_index).await.map_err(RaftError::RaftStorage)?;
            let last_log = &last_logs[0];

            let req = match last_log.payload {
                EntryPayload::ConfigChange(ref mem) => {
                    if mem.membership.members_after_consensus.is_some() {
                        let final_config = mem.membership.to_final_config();
                        Some(ClientWriteRequest::config_change(final_config))
                    } else {
                        None
                    }
                }
                _ => None,
            };

            req.unwrap_or_else(ClientWriteRequest::blank)
        };

        // Commit the initial payload to the cluster.
        let entry = self.append_payload_to_log(req.entry).await?;
        self.core.last_log_id.term = self.core.current_term; // This only ever needs to be updated once per term.

        let cr_entry = ClientRequestEntry::from_entry(entry, None);
        self.replicate_client_request(cr_entry).await;

        Ok(())
    }

    /// Handle client write requests.
    #[tracing::instrument(level = "trace", skip(self, rpc, tx))]
    pub(super) async fn handle_client_write_request(
        &mut self,
        rpc: ClientWriteRequest<D>,
        tx: ClientWriteResponseTx<D, R>,
    ) {
        let entry = match self.append_payload_to_log(rpc.entry).await {
            Ok(entry) => ClientRequestEntry::from_entry(entry, tx),
            Err(err) => {
                let _ = tx.send(Err(ClientWriteError::RaftError(err)));
                return;
            }
        };
        self.replicate_client_request(entry).await;
    }

    /// Transform the given payload into an entry, assign an index and term, and append the entry to the log.
    #[tracing::instrument(level = "trace", skip(self, payload))]
    pub(super) async fn append_payload_to_log(&mut self, payload: EntryPayload<D>) -> RaftResult<Entry<D>> {
        let entry = Entry {
            log_id: LogId {
                index: self.core.last_log_id.index + 1,
                term: self.core.current_term,
            },
            payload,
        };
        self.core
            .storage
            .append_to_log(&[&entry])
            .await
            .map_err(|err| self.core.fatal_storage(err))?;
        self.core.last_log_id.index = entry.log_id.index;

        self.publish_leader_metrics();

        Ok(entry)
    }

    /// Begin the process of replicating the given client request.
    ///
    /// NOTE WELL: this routine does not wait for the request to actually finish replication, it
    /// merely beings the process. Once the request is committed to the cluster, its response will
    /// be generated asynchronously.
    #[tracing::instrument(level = "trace", skip(self, req))]
    pub(super) async fn replicate_client_request(&mut self, req: ClientRequestEntry<D, R>) {
        // Replicate the request if there are other cluster members. The client response will be
        // returned elsewhere after the entry has been committed to the cluster.
        let entry_arc = req.entry.clone();

        // A leader which is the sole voting member of every config group is a quorum by itself:
        // the entry commits on append. Replication to any learners rides along behind the
        // commit rather than gating it.
        let leader_is_lone_quorum = self.core.membership.members.len() == 1
            && self.core.membership.members.contains(&self.core.id)
            && self
                .core
                .membership
                .members_after_consensus
                .as_ref()
                .map(|members| members.len() == 1 && members.contains(&self.core.id))
                .unwrap_or(true);

        if leader_is_lone_quorum {
            self.core.commit_index = entry_arc.log_id.index;
            self.publish_leader_metrics();
        }

        for state in self.targets.values() {
            let _ = state.stream.tx.send((
                StreamEvent::Append {
                    entry: entry_arc.clone(),
                    commit_index: self.core.commit_index,
                },
                tracing::debug_span!("replicate"),
            ));
        }
        for learner in self.learners.values() {
            let _ = learner.repl.stream.tx.send((
                StreamEvent::Append {
                    entry: entry_arc.clone(),
                    commit_index: self.core.commit_index,
                },
                tracing::debug_span!("replicate"),
            ));
        }

        if leader_is_lone_quorum {
            self.client_request_post_commit(req).await;
        } else {
            self.pending.push(req);
        }
    }

    /// Handle the post-commit logic for a client request.
    ///
    /// The completion handle is only fulfilled after the entry has been applied to the state
    /// machine: a success observed by a client is always backed by applied state.
    #[tracing::instrument(level = "trace", skip(self, req))]
    pub(super) async fn client_request_post_commit(&mut self, req: ClientRequestEntry<D, R>) {
        let entry = &req.entry;

        match req.tx {
            ClientOrInternalResponseTx::Client(tx) => {
                match &entry.payload {
                    EntryPayload::Normal(_) => match self.apply_entry_to_state_machine(&entry).await {
                        Ok(data) => {
                            let _ = tx.send(Ok(ClientWriteResponse {
                                index: req.entry.log_id.index,
                                data,
                            }));
                        }
                        Err(err) => {
                            let _ = tx.send(Err(ClientWriteError::RaftError(err)));
                        }
                    },
                    _ => {
                        // Why is this a bug, and why are we shutting down? This is because we can not easily
                        // encode these constraints in the type system, and client requests should be the only
                        // log entry types for which a `ClientOrInternalResponseTx::Client` type is used. This
                        // error should never be hit unless we've done a poor job in code review.
                        tracing::error!("critical error in kythira, this is a programming bug, please open an issue");
                        self.core.transition(State::Shutdown);
                    }
                }
            }
            ClientOrInternalResponseTx::Internal(tx) => {
                self.handle_special_log(entry);

                let res = self.apply_entry_to_state_machine(&entry).await;
                let res = match res {
                    Ok(_data) => Ok(entry.log_id.index),
                    Err(err) => {
                        tracing::error!("res of applying to state machine: {:?}", err);
                        Err(err)
                    }
                };

                self.core.last_applied = entry.log_id;
                self.publish_leader_metrics();

                match tx {
                    None => {
                        tracing::debug!("no response tx to send res");
                    }

                    Some(tx) => {
                        let send_res = tx.send(res.map_err(ResponseError::from));
                        tracing::debug!("send internal response through tx, res: {:?}", send_res);
                    }
                }
            }
        }

        // Trigger log compaction if needed.
        self.core.maybe_trigger_compaction(false);
    }

    /// Fail every request which was appended at this node's term but has not committed.
    ///
    /// Called on the way out of leader state. Requests whose index has already committed are
    /// not here — they were drained to `client_request_post_commit` as the commit index
    /// advanced, and Raft guarantees every committed entry survives into the next term.
    #[tracing::instrument(level = "trace", skip(self))]
    pub(super) fn reject_pending(&mut self) {
        let leader_hint = self.core.current_leader;
        for req in self.pending.drain(..) {
            tracing::debug!(index = req.entry.log_id.index, "rejecting uncommitted request on leadership loss");
            match req.tx {
                ClientOrInternalResponseTx::Client(tx) => {
                    let _ = tx.send(Err(ClientWriteError::LeadershipLost { leader_hint }));
                }
                ClientOrInternalResponseTx::Internal(tx) => {
                    if let Some(tx) = tx {
                        let _ = tx.send(Err(ChangeConfigError::NodeNotLeader(leader_hint).into()));
                    }
                }
            }
        }
    }

    pub fn handle_special_log(&mut self, entry: &Arc<Entry<D>>) {
        match &entry.payload {
            EntryPayload::ConfigChange(ref mem) => {
                let m = &mem.membership;
                if m.is_in_joint_consensus() {
                    self.handle_joint_config_committed();
                } else {
                    self.handle_final_config_committed(entry.log_id.index);
                }
            }
            EntryPayload::Blank => {}
            EntryPayload::Normal(_) => {}
            EntryPayload::PurgedMarker => {}
        }
    }

    /// Apply the given log entry to the state machine.
    #[tracing::instrument(level = "trace", skip(self, entry))]
    pub(super) async fn apply_entry_to_state_machine(&mut self, entry: &Entry<D>) -> RaftResult<R> {
        // First, we just ensure that we apply any outstanding up to, but not including, the index
        // of the given entry. We need to be able to return the data response from applying this
        // entry to the state machine.
        //
        // Note that this would only ever happen if a node had unapplied logs from before becoming leader.

        let log_id = &entry.log_id;
        let index = log_id.index;

        let expected_next_index = self.core.last_applied.index + 1;
        if index != expected_next_index {
            let entries = self
                .core
                .storage
                .get_log_entries(expected_next_index..index)
                .await
                .map_err(|err| self.core.fatal_storage(err))?;

            if let Some(entry) = entries.last() {
                self.core.last_applied = entry.log_id;
            }

            let data_entries: Vec<_> = entries.iter().collect();
            if !data_entries.is_empty() {
                self.core
                    .storage
                    .apply_to_state_machine(&data_entries)
                    .await
                    .map_err(|err| self.core.fatal_storage(err))?;
            }
        }

        // Before we can safely apply this entry to the state machine, we need to ensure there is
        // no pending task to replicate entries to the state machine. This is edge case, and would only
        // happen once very early in a new leader's term.
        if !self.core.apply_queue.is_empty() {
            if let Some(Ok(apply_result)) = self.core.apply_queue.next().await {
                self.core.absorb_apply_result(apply_result)?;
            }
        }

        // Apply this entry to the state machine and return its data response. An application
        // failure on a committed entry is fatal: no further commits may be observed.
        let res = self
            .core
            .storage
            .apply_to_state_machine(&[entry])
            .await
            .map_err(|err| self.core.fatal_storage(err));

        self.core.last_applied = *log_id;
        self.publish_leader_metrics();
        let mut res = res?;

        match res.pop() {
            Some(data) => Ok(data),
            None => Err(self.core.fatal_storage(anyhow::anyhow!(
                "state machine returned no response for applied entry"
            ))),
        }
    }
}
