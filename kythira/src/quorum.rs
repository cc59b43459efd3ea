//! Quorum accounting and the vote-collection combinator.
//!
//! Every quorum decision in this crate — leader election, commit-index advancement — requires a
//! simple majority of the current membership config, and a majority of *both* config groups when
//! the cluster is in joint consensus. The [`Tally`] type centralizes that accounting, and the
//! [`VoteCollector`] combinator drives an election's fan-out of response handles to a decision
//! under a deadline.

use std::collections::BTreeSet;

use futures::stream::FuturesUnordered;
use futures::StreamExt;
use tokio::sync::oneshot;
use tokio::time::sleep_until;
use tokio::time::Instant;

use crate::raft::MembershipConfig;
use crate::raft::VoteResponse;
use crate::NodeId;

/// Compute the simple majority threshold of a group of the given size.
pub fn majority_of(n: usize) -> usize {
    (n / 2) + 1
}

/// Joint-consensus aware accounting of grants & denials from cluster members.
///
/// A node which is a member of both config groups counts toward both. Nodes outside every group
/// are ignored entirely. The tally is seeded with this node's own grant.
pub struct Tally {
    members_old: BTreeSet<NodeId>,
    members_new: Option<BTreeSet<NodeId>>,
    granted_old: usize,
    needed_old: usize,
    denied_old: usize,
    granted_new: usize,
    needed_new: usize,
    denied_new: usize,
}

impl Tally {
    /// Create a new tally for the given membership config, pre-granting `id`'s own vote.
    pub fn new(membership: &MembershipConfig, id: NodeId) -> Self {
        let members_old = membership.members.clone();
        let members_new = membership.members_after_consensus.clone();
        let needed_old = majority_of(members_old.len());
        let needed_new = members_new.as_ref().map(|m| majority_of(m.len())).unwrap_or(0);
        let mut this = Self {
            members_old,
            members_new,
            granted_old: 0,
            needed_old,
            denied_old: 0,
            granted_new: 0,
            needed_new,
            denied_new: 0,
        };
        this.grant(id);
        this
    }

    /// Register a grant from the given node, returning true if quorum is now reached.
    pub fn grant(&mut self, node: NodeId) -> bool {
        if self.members_old.contains(&node) {
            self.granted_old += 1;
        }
        if self.members_new.as_ref().map(|m| m.contains(&node)).unwrap_or(false) {
            self.granted_new += 1;
        }
        self.has_quorum()
    }

    /// Register a denial (or an unreachable peer) from the given node.
    pub fn deny(&mut self, node: NodeId) {
        if self.members_old.contains(&node) {
            self.denied_old += 1;
        }
        if self.members_new.as_ref().map(|m| m.contains(&node)).unwrap_or(false) {
            self.denied_new += 1;
        }
    }

    /// Check if the required majority has been reached in every config group.
    pub fn has_quorum(&self) -> bool {
        self.granted_old >= self.needed_old && self.granted_new >= self.needed_new
    }

    /// Check if a majority has become arithmetically impossible in some config group.
    pub fn is_defeated(&self) -> bool {
        if self.members_old.len() - self.denied_old < self.needed_old {
            return true;
        }
        if let Some(members) = &self.members_new {
            if members.len() - self.denied_new < self.needed_new {
                return true;
            }
        }
        false
    }
}

/// The decided outcome of a round of vote collection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VoteOutcome {
    /// The required majority granted its vote in every config group.
    Granted,
    /// A majority became impossible in at least one config group.
    Rejected,
    /// A peer reported a higher term; the candidate must step down.
    HigherTerm(u64),
    /// The deadline elapsed before the outcome was decided.
    Expired,
}

/// A combinator driving a set of vote response handles to a quorum decision under a deadline.
///
/// The collector resolves the moment the outcome is decided — never later, and never before the
/// quorum threshold is actually met. Handles which are still unresolved at that point are
/// dropped, cancelling their sender side best-effort. A dropped or failed sender counts as a
/// denial: an unreachable peer cannot grant a vote this round.
pub struct VoteCollector {
    tally: Tally,
    term: u64,
    handles: Vec<(NodeId, oneshot::Receiver<VoteResponse>)>,
    deadline: Instant,
}

impl VoteCollector {
    /// Create a new collector over the given response handles.
    ///
    /// `term` is the election term the requests were sent at; any response bearing a greater
    /// term short-circuits the collection.
    pub fn new(
        membership: &MembershipConfig,
        id: NodeId,
        term: u64,
        handles: Vec<(NodeId, oneshot::Receiver<VoteResponse>)>,
        deadline: Instant,
    ) -> Self {
        Self {
            tally: Tally::new(membership, id),
            term,
            handles,
            deadline,
        }
    }

    /// Drive the handles to a decision.
    #[tracing::instrument(level = "trace", skip(self), fields(term=self.term))]
    pub async fn collect(self) -> VoteOutcome {
        let Self {
            mut tally,
            term,
            handles,
            deadline,
        } = self;

        let mut pending: FuturesUnordered<_> = handles
            .into_iter()
            .map(|(target, rx)| async move { (target, rx.await) })
            .collect();

        loop {
            if tally.has_quorum() {
                return VoteOutcome::Granted;
            }
            if tally.is_defeated() {
                return VoteOutcome::Rejected;
            }

            tokio::select! {
                _ = sleep_until(deadline) => return VoteOutcome::Expired,
                next = pending.next() => match next {
                    // All handles resolved without reaching quorum.
                    None => return VoteOutcome::Rejected,
                    Some((target, Ok(res))) => {
                        if res.term > term {
                            return VoteOutcome::HigherTerm(res.term);
                        }
                        if res.vote_granted {
                            tally.grant(target);
                        } else {
                            tally.deny(target);
                        }
                    }
                    // The sender task failed or was cancelled before producing a response.
                    Some((target, Err(_))) => tally.deny(target),
                },
            }
        }
    }
}
