//! Cluster membership bookkeeping.
//!
//! [`ClusterView`] is one node's picture of the cluster: who the members
//! are, when each was last heard from, the role and term each most recently
//! claimed, and who currently leads. It is updated from message traffic and
//! from this node's own transitions, never guessed at. Liveness here is a
//! reporting concern: a silent member shows up as offline in status output,
//! while quorum arithmetic always runs over the full configured membership.

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use crate::types::{NodeId, Role, Term};

#[derive(Debug, Clone, Copy)]
struct MemberState {
    role: Role,
    term: Term,
    last_heard: Option<Instant>,
}

/// Status line for one member, as reported by `ClusterStatus`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemberSummary {
    pub id: NodeId,
    /// Last role this member was seen claiming.
    pub role: Role,
    /// Last term this member was seen in.
    pub term: Term,
    /// Whether the member was heard from within the offline threshold.
    pub online: bool,
}

/// One node's view of the whole cluster.
pub struct ClusterView {
    self_id: NodeId,
    members: BTreeMap<NodeId, MemberState>,
    leader: Option<NodeId>,
    offline_after: Duration,
}

impl ClusterView {
    pub fn new(self_id: NodeId, members: &[NodeId], offline_after: Duration) -> Self {
        let members = members
            .iter()
            .map(|&id| {
                (
                    id,
                    MemberState {
                        role: Role::Follower,
                        term: 0,
                        last_heard: None,
                    },
                )
            })
            .collect();
        Self {
            self_id,
            members,
            leader: None,
            offline_after,
        }
    }

    /// Notes a message from `from`: refreshes its last-heard instant and the
    /// role and term it claimed. Unknown senders are ignored; membership is
    /// fixed at configuration time.
    pub fn observe(&mut self, from: NodeId, term: Term, role: Role, now: Instant) {
        if let Some(member) = self.members.get_mut(&from) {
            member.last_heard = Some(now);
            member.role = role;
            member.term = term;
        }
    }

    /// Records this node's own role and term after a transition.
    pub fn record_self(&mut self, role: Role, term: Term, now: Instant) {
        if let Some(member) = self.members.get_mut(&self.self_id) {
            member.last_heard = Some(now);
            member.role = role;
            member.term = term;
        }
    }

    pub fn set_leader(&mut self, leader: Option<NodeId>) {
        self.leader = leader;
    }

    /// The member this node currently believes leads, if any.
    pub fn leader(&self) -> Option<NodeId> {
        self.leader
    }

    /// Number of configured members.
    pub fn member_count(&self) -> usize {
        self.members.len()
    }

    /// Votes or replicas needed for a strict majority of the membership.
    pub fn majority(&self) -> usize {
        self.members.len() / 2 + 1
    }

    /// Whether `id` was heard from within the offline threshold. This node
    /// itself always counts as online.
    pub fn is_online(&self, id: NodeId, now: Instant) -> bool {
        if id == self.self_id {
            return true;
        }
        self.members
            .get(&id)
            .and_then(|member| member.last_heard)
            .is_some_and(|heard| now.duration_since(heard) <= self.offline_after)
    }

    /// Per-member status lines in ID order.
    pub fn snapshot(&self, now: Instant) -> Vec<MemberSummary> {
        self.members
            .iter()
            .map(|(&id, member)| MemberSummary {
                id,
                role: member.role,
                term: member.term,
                online: self.is_online(id, now),
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn view() -> ClusterView {
        ClusterView::new(1, &[1, 2, 3], Duration::from_millis(1500))
    }

    #[test]
    fn majority_is_strict() {
        assert_eq!(view().majority(), 2);
        assert_eq!(ClusterView::new(1, &[1], Duration::ZERO).majority(), 1);
        assert_eq!(
            ClusterView::new(1, &[1, 2, 3, 4, 5], Duration::ZERO).majority(),
            3
        );
    }

    #[test]
    fn silent_members_go_offline_after_the_threshold() {
        let mut view = view();
        let start = Instant::now();
        view.observe(2, 1, Role::Follower, start);

        assert!(view.is_online(2, start + Duration::from_millis(900)));
        assert!(!view.is_online(2, start + Duration::from_millis(1600)));
        // Never-heard members are offline, except ourselves.
        assert!(!view.is_online(3, start));
        assert!(view.is_online(1, start + Duration::from_secs(60)));
    }

    #[test]
    fn snapshot_reports_last_claimed_role_and_term() {
        let mut view = view();
        let now = Instant::now();
        view.record_self(Role::Leader, 3, now);
        view.observe(2, 3, Role::Follower, now);

        let summary = view.snapshot(now);
        assert_eq!(summary.len(), 3);
        assert_eq!(summary[0].role, Role::Leader);
        assert_eq!(summary[0].term, 3);
        assert!(summary[0].online);
        assert!(summary[1].online);
        assert!(!summary[2].online);
    }

    #[test]
    fn leader_tracking_round_trips() {
        let mut view = view();
        assert_eq!(view.leader(), None);
        view.set_leader(Some(2));
        assert_eq!(view.leader(), Some(2));
        view.set_leader(None);
        assert_eq!(view.leader(), None);
    }

    #[test]
    fn unknown_senders_are_ignored() {
        let mut view = view();
        let now = Instant::now();
        view.observe(99, 5, Role::Leader, now);
        assert_eq!(view.snapshot(now).len(), 3);
        assert!(!view.is_online(99, now));
    }
}
