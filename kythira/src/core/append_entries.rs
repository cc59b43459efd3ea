use crate::core::RaftCore;
use crate::error::RaftResult;
use crate::raft::AppendEntriesRequest;
use crate::raft::AppendEntriesResponse;
use crate::raft::ConflictOpt;
use crate::raft::Entry;
use crate::raft::EntryPayload;
use crate::AppData;
use crate::AppDataResponse;
use crate::MessageSummary;
use crate::RaftNetwork;
use crate::RaftStorage;
use crate::Update;

impl<D: AppData, R: AppDataResponse, N: RaftNetwork<D>, S: RaftStorage<D, R>> RaftCore<D, R, N, S> {
    /// An RPC invoked by the leader to replicate log entries (§5.3); also used as heartbeat (§5.2).
    #[tracing::instrument(level = "debug", skip(self, msg), fields(msg=%msg.summary()))]
    pub(super) async fn handle_append_entries_request(
        &mut self,
        msg: AppendEntriesRequest<D>,
    ) -> RaftResult<AppendEntriesResponse> {
        // If message's term is less than most recent term, then we do not honor the request.
        if msg.term < self.current_term {
            tracing::debug!({self.current_term, rpc_term=msg.term}, "AppendEntries RPC term is less than current term");
            return Ok(AppendEntriesResponse {
                term: self.current_term,
                success: false,
                conflict_opt: None,
            });
        }

        // A live leader for the current term has made contact: adopt its term if newer, record
        // it for client redirection, and fall in line behind it.
        self.observe_leader_rpc(msg.term, msg.leader_id).await?;

        // The log-matching check: the entry at `prev_log_id` must exist locally with the same
        // term before anything in this payload may be accepted.
        if msg.prev_log_id.index > 0 && msg.prev_log_id != self.last_log_id {
            // The target log is too short to contain the log-match point.
            if msg.prev_log_id.index > self.last_log_id.index {
                return Ok(AppendEntriesResponse {
                    term: self.current_term,
                    success: false,
                    conflict_opt: Some(ConflictOpt { log_id: self.last_log_id }),
                });
            }

            let prev_entry = self
                .storage
                .try_get_log_entry(msg.prev_log_id.index)
                .await
                .map_err(|err| self.fatal_storage(err))?;

            let local_term = match prev_entry {
                Some(entry) => Some(entry.log_id.term),
                // The entry has been compacted away. The snapshot boundary is the one compacted
                // id whose term we still know.
                None if msg.prev_log_id == self.snapshot_last_log_id => Some(self.snapshot_last_log_id.term),
                None => None,
            };

            match local_term {
                Some(term) if term == msg.prev_log_id.term => (), // Logs match; proceed.
                Some(term) => {
                    // A conflicting suffix starts at (or before) the log-match point. Report a
                    // hint covering the whole run of the conflicting term, and erase the
                    // conflicting suffix — it can never commit.
                    let conflict_opt = Some(self.build_conflict_hint(term, msg.prev_log_id.index).await);
                    self.storage
                        .delete_logs_from(msg.prev_log_id.index..)
                        .await
                        .map_err(|err| self.fatal_storage(err))?;
                    self.last_log_id = self.storage.get_last_log_id().await.map_err(|err| self.fatal_storage(err))?;
                    self.publish_metrics(Update::Ignore);
                    return Ok(AppendEntriesResponse {
                        term: self.current_term,
                        success: false,
                        conflict_opt,
                    });
                }
                None => {
                    return Ok(AppendEntriesResponse {
                        term: self.current_term,
                        success: false,
                        conflict_opt: Some(ConflictOpt {
                            log_id: self.snapshot_last_log_id,
                        }),
                    });
                }
            }
        }

        // The log-match point holds; fold in whatever entries the payload carries.
        if !msg.entries.is_empty() {
            self.append_log_entries(&msg.entries).await?;
        }

        // The commit index may only advance over the portion of the log this exchange verified
        // against the leader: up through the last appended entry, or the log-match point for a
        // heartbeat. Anything beyond that could still be a divergent local suffix, and
        // committing it would apply an entry the leader never committed.
        let matching_upto = msg.entries.last().map(|entry| entry.log_id.index).unwrap_or(msg.prev_log_id.index);
        let new_commit_index = std::cmp::min(msg.leader_commit, matching_upto);
        if new_commit_index > self.commit_index {
            self.commit_index = new_commit_index;
            self.publish_metrics(Update::Ignore);
        }
        self.schedule_apply();

        Ok(AppendEntriesResponse {
            term: self.current_term,
            success: true,
            conflict_opt: None,
        })
    }

    /// Build the conflict hint for a rejected log-match check.
    ///
    /// Scans a bounded window of the log below `upto` for the run of entries carrying the
    /// conflicting term, and reports the most recent entry *before* that run. The leader resumes
    /// replication one past the reported id, skipping the entire conflicting term in a single
    /// round trip. The hint never drops below the snapshot boundary.
    #[tracing::instrument(level = "trace", skip(self))]
    async fn build_conflict_hint(&mut self, conflicting_term: u64, upto: u64) -> ConflictOpt {
        let window_start = std::cmp::max(
            upto.saturating_sub(self.config.max_payload_entries),
            self.snapshot_last_log_id.index,
        );
        let entries = match self.storage.get_log_entries(window_start..upto).await {
            Ok(entries) => entries,
            Err(err) => {
                tracing::error!(error=%err, "error fetching log entries while building conflict hint");
                return ConflictOpt {
                    log_id: self.snapshot_last_log_id,
                };
            }
        };

        for entry in entries.iter().rev() {
            if entry.log_id.term != conflicting_term {
                return ConflictOpt { log_id: entry.log_id };
            }
        }
        ConflictOpt {
            log_id: self.snapshot_last_log_id,
        }
    }

    /// Append the given entries to the log.
    ///
    /// Entries already present with a matching term are skipped; the first divergent index has
    /// its suffix erased before the leader's entries take its place. Configuration entries take
    /// effect here, at append time — not at commit time — per the membership change protocol.
    #[tracing::instrument(level = "trace", skip(self, entries))]
    async fn append_log_entries(&mut self, entries: &[Entry<D>]) -> RaftResult<()> {
        let mut to_append: Vec<&Entry<D>> = Vec::with_capacity(entries.len());
        let mut diverged = false;
        for entry in entries {
            if !diverged && entry.log_id.index <= self.last_log_id.index {
                let existing =
                    self.storage.try_get_log_entry(entry.log_id.index).await.map_err(|err| self.fatal_storage(err))?;
                if let Some(existing) = existing {
                    if existing.log_id.term == entry.log_id.term {
                        // Already present; nothing to do for this index.
                        continue;
                    }
                }
                // Local entry at this index disagrees with the leader; everything from here on
                // is a doomed suffix.
                self.storage
                    .delete_logs_from(entry.log_id.index..)
                    .await
                    .map_err(|err| self.fatal_storage(err))?;
                diverged = true;
            }
            to_append.push(entry);
        }

        if to_append.is_empty() {
            return Ok(());
        }

        // Check the given entries for any config changes and take the most recent.
        let last_conf_change = to_append
            .iter()
            .filter_map(|ent| match &ent.payload {
                EntryPayload::ConfigChange(conf) => Some(conf),
                _ => None,
            })
            .last();
        let new_membership = last_conf_change.map(|conf| {
            tracing::debug!({membership=?conf}, "appending membership config entry to log");
            conf.membership.clone()
        });

        // Entries must be durable before the reply acknowledging them is sent.
        self.storage.append_to_log(&to_append).await.map_err(|err| self.fatal_storage(err))?;
        if let Some(entry) = to_append.last() {
            self.last_log_id = entry.log_id;
        }

        // A config change adopted at append time may later be truncated away by a subsequent
        // AppendEntries; the replacement entries then carry the config to revert to.
        if let Some(membership) = new_membership {
            self.adopt_membership(membership)?;
        }

        self.publish_metrics(Update::Ignore);
        Ok(())
    }

    /// Replicate any outstanding entries to the state machine for which it is safe to do so.
    ///
    /// The pipeline holds at most one apply task at a time and the task consumes a dense index
    /// range, so entries reach the state machine strictly in log order, each exactly once.
    #[tracing::instrument(level = "trace", skip(self))]
    pub(super) fn schedule_apply(&mut self) {
        // Perform initial replication to state machine if needed.
        if !self.initial_apply_done {
            // Optimistic update as this routine will always pass no matter what.
            self.initial_apply_done = true;
            self.schedule_initial_apply();
            return;
        }
        // If we already have an active apply task, then do nothing.
        if !self.apply_queue.is_empty() {
            return;
        }
        // If we don't have any new entries to apply, then do nothing.
        if self.commit_index <= self.last_applied.index {
            return;
        }
        // Drive the apply task over the committed-but-unapplied range.
        let start = self.last_applied.index + 1;
        let stop = self.commit_index + 1;
        let storage = self.storage.clone();
        let handle = tokio::spawn(async move {
            let mut applied_upto: Option<crate::LogId> = None;
            let entries = storage.get_log_entries(start..stop).await?;
            if let Some(entry) = entries.last() {
                applied_upto = Some(entry.log_id);
            }
            let refs: Vec<_> = entries.iter().collect();
            if refs.is_empty() {
                return Ok(applied_upto);
            }
            storage.apply_to_state_machine(&refs).await?;
            Ok(applied_upto)
        });
        self.apply_queue.push(handle);
    }

    /// Perform an initial replication of outstanding entries to the state machine.
    ///
    /// This will only be executed once, and only in response to its first payload of entries
    /// from the AppendEntries RPC handler.
    #[tracing::instrument(level = "trace", skip(self))]
    fn schedule_initial_apply(&mut self) {
        // If we already have an active apply task, then do nothing.
        if !self.apply_queue.is_empty() {
            return;
        }

        let start = self.last_applied.index + 1;
        let stop = std::cmp::min(self.commit_index, self.last_log_id.index) + 1;
        let storage = self.storage.clone();

        // Fetch the series of entries which must be applied to the state machine, then apply them.
        let handle = tokio::spawn(async move {
            let mut applied_upto: Option<crate::LogId> = None;
            let entries = storage.get_log_entries(start..stop).await?;
            if let Some(entry) = entries.last() {
                applied_upto = Some(entry.log_id);
            }
            let refs: Vec<_> = entries.iter().collect();
            if refs.is_empty() {
                return Ok(applied_upto);
            }
            storage.apply_to_state_machine(&refs).await?;
            Ok(applied_upto)
        });
        self.apply_queue.push(handle);
    }
}
