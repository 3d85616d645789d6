//! Group membership and table configuration.

use serde::{Deserialize, Serialize};

use crate::error::SstError;

/// Logical node identifier within a group.
pub type NodeId = u64;

/// Whether mirrors are refreshed by remote reads or pushed by remote writes.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum Mode {
    /// Each node continuously pulls every peer row with one-sided reads.
    Reads,
    /// Each node pushes its own row with one-sided writes via `put`.
    #[default]
    Writes,
}

/// An immutable, ordered group of nodes. Rank equals position in `members`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Group {
    members: Vec<NodeId>,
    me: usize,
}

impl Group {
    /// Build a group from the ordered member list and the local node's id.
    pub fn new(members: Vec<NodeId>, me_id: NodeId) -> Result<Group, SstError> {
        if members.is_empty() {
            return Err(SstError::Config("member list is empty".into()));
        }
        for (i, a) in members.iter().enumerate() {
            if members[i + 1..].contains(a) {
                return Err(SstError::Config(format!("duplicate member id {a}")));
            }
        }
        let me = members
            .iter()
            .position(|&id| id == me_id)
            .ok_or_else(|| SstError::Config(format!("local id {me_id} is not a member")))?;
        Ok(Group { members, me })
    }

    pub fn num_members(&self) -> usize {
        self.members.len()
    }

    pub fn members(&self) -> &[NodeId] {
        &self.members
    }

    /// Rank of the local node (its row index).
    pub fn my_rank(&self) -> usize {
        self.me
    }

    pub fn my_id(&self) -> NodeId {
        self.members[self.me]
    }

    pub fn id_of(&self, rank: usize) -> NodeId {
        self.members[rank]
    }

    /// Ranks of every peer, in descending order.
    ///
    /// Bootstrap connection setup and the `sync` barrier both walk peers in
    /// this order, so every pair of nodes agrees on who connects to whom:
    /// the peer with the higher rank acts as the server. Ids play no part
    /// here; they need not be monotonic in rank order.
    pub fn peers_by_descending_rank(&self) -> Vec<usize> {
        (0..self.members.len())
            .rev()
            .filter(|&rank| rank != self.me)
            .collect()
    }
}

/// Construction-time configuration for one table.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SstConfig {
    pub group: Group,
    #[serde(default)]
    pub mode: Mode,
}

impl SstConfig {
    pub fn new(group: Group) -> SstConfig {
        SstConfig {
            group,
            mode: Mode::default(),
        }
    }

    pub fn with_mode(mut self, mode: Mode) -> SstConfig {
        self.mode = mode;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ranks_follow_member_order() {
        let group = Group::new(vec![12, 7, 30], 7).unwrap();
        assert_eq!(group.my_rank(), 1);
        assert_eq!(group.my_id(), 7);
        assert_eq!(group.num_members(), 3);
    }

    #[test]
    fn peer_order_is_descending_by_rank() {
        let group = Group::new(vec![12, 7, 30], 7).unwrap();
        assert_eq!(group.peers_by_descending_rank(), vec![2, 0]);
    }

    #[test]
    fn peer_order_ignores_id_values() {
        // Ids deliberately disagree with rank order: rank 0 holds id 5,
        // rank 1 holds id 100, rank 2 holds id 1. Setup order follows rank.
        let group = Group::new(vec![5, 100, 1], 100).unwrap();
        assert_eq!(group.peers_by_descending_rank(), vec![2, 0]);

        let group = Group::new(vec![5, 100, 1], 1).unwrap();
        assert_eq!(group.peers_by_descending_rank(), vec![1, 0]);
    }

    #[test]
    fn rejects_bad_membership() {
        assert!(matches!(Group::new(vec![], 0), Err(SstError::Config(_))));
        assert!(matches!(Group::new(vec![1, 1], 1), Err(SstError::Config(_))));
        assert!(matches!(Group::new(vec![1, 2], 9), Err(SstError::Config(_))));
    }
}
