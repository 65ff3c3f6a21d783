//! Group registry: group name to member peers, as observed locally.
//!
//! Groups exist only while they have members. Iteration order is sorted so
//! that fan-out and cleanup produce events in a deterministic order.

use std::collections::{BTreeMap, BTreeSet};

use crate::identity::NodeId;

#[derive(Debug, Default)]
pub struct GroupRegistry {
    groups: BTreeMap<String, BTreeSet<NodeId>>,
}

impl GroupRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `peer` to `group`. Returns true if this changed membership.
    pub fn join(&mut self, peer: NodeId, group: &str) -> bool {
        self.groups.entry(group.to_string()).or_default().insert(peer)
    }

    /// Remove `peer` from `group`. Returns true if this changed membership.
    pub fn leave(&mut self, peer: NodeId, group: &str) -> bool {
        let Some(members) = self.groups.get_mut(group) else {
            return false;
        };
        let removed = members.remove(&peer);
        if members.is_empty() {
            self.groups.remove(group);
        }
        removed
    }

    /// Snapshot of members, for SHOUT fan-out.
    pub fn members_of(&self, group: &str) -> Vec<NodeId> {
        self.groups
            .get(group)
            .map(|m| m.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Sorted group names `peer` belongs to.
    pub fn groups_of(&self, peer: NodeId) -> Vec<String> {
        self.groups
            .iter()
            .filter(|(_, members)| members.contains(&peer))
            .map(|(name, _)| name.clone())
            .collect()
    }

    /// Drop `peer` from every group; returns the groups it left, sorted.
    pub fn remove_peer(&mut self, peer: NodeId) -> Vec<String> {
        let left = self.groups_of(peer);
        for group in &left {
            self.leave(peer, group);
        }
        left
    }

    pub fn contains(&self, group: &str) -> bool {
        self.groups.contains_key(group)
    }

    pub fn is_member(&self, peer: NodeId, group: &str) -> bool {
        self.groups
            .get(group)
            .map_or(false, |m| m.contains(&peer))
    }

    /// All known group names, sorted.
    pub fn names(&self) -> Vec<String> {
        self.groups.keys().cloned().collect()
    }
}
