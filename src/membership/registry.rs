use crate::common::MemberId;
use crate::member::{Member, MemberRecord};
use indexmap::IndexMap;
use rand::seq::SliceRandom;

/// Member records keyed by id, plus a randomized list of the non-local
/// members used to spread probe and gossip load evenly.
///
/// Every record except the local member's is mirrored in the peer list; the
/// list is reshuffled on every insertion and removal so that round-robin
/// probing walks the membership in a different order on every epoch.
#[derive(Debug)]
pub(crate) struct Registry {
    local_id: MemberId,
    members: IndexMap<MemberId, MemberRecord>,
    peers: Vec<MemberId>,
}

impl Registry {
    pub(crate) fn new(local_id: MemberId) -> Self {
        Registry {
            local_id,
            members: IndexMap::new(),
            peers: Vec::new(),
        }
    }

    pub(crate) fn local_id(&self) -> &MemberId {
        &self.local_id
    }

    pub(crate) fn local(&self) -> &MemberRecord {
        self.members
            .get(&self.local_id)
            .expect("local member is always present")
    }

    pub(crate) fn local_mut(&mut self) -> &mut MemberRecord {
        self.members
            .get_mut(&self.local_id)
            .expect("local member is always present")
    }

    pub(crate) fn get(&self, id: &MemberId) -> Option<&MemberRecord> {
        self.members.get(id)
    }

    pub(crate) fn get_mut(&mut self, id: &MemberId) -> Option<&mut MemberRecord> {
        self.members.get_mut(id)
    }

    pub(crate) fn contains(&self, id: &MemberId) -> bool {
        self.members.contains_key(id)
    }

    pub(crate) fn len(&self) -> usize {
        self.members.len()
    }

    pub(crate) fn records(&self) -> impl Iterator<Item = &MemberRecord> {
        self.members.values()
    }

    pub(crate) fn insert(&mut self, record: MemberRecord) {
        let id = record.id.clone();
        self.members.insert(id.clone(), record);

        if id != self.local_id {
            self.peers.push(id);
            self.peers.shuffle(&mut rand::thread_rng());
        }
    }

    pub(crate) fn remove(&mut self, id: &MemberId) -> Option<MemberRecord> {
        let record = self.members.shift_remove(id);

        if record.is_some() {
            self.peers.retain(|peer| peer != id);
            self.peers.shuffle(&mut rand::thread_rng());
        }

        record
    }

    pub(crate) fn clear(&mut self) {
        self.members.clear();
        self.peers.clear();
    }

    /// Snapshots of every record, the local member included.
    pub(crate) fn snapshot(&self) -> Vec<Member> {
        self.members.values().map(MemberRecord::snapshot).collect()
    }

    /// Snapshots of every non-local member, in insertion order. This is the
    /// fan-out set for broadcasts.
    pub(crate) fn peer_snapshots(&self) -> Vec<Member> {
        self.members
            .values()
            .filter(|record| record.id != self.local_id)
            .map(MemberRecord::snapshot)
            .collect()
    }

    /// Peers in the currently stored randomized order; the round-robin probe
    /// counter indexes into this sequence.
    pub(crate) fn ordered_peers(&self) -> Vec<Member> {
        self.peers
            .iter()
            .filter_map(|id| self.members.get(id))
            .map(MemberRecord::snapshot)
            .collect()
    }

    /// A fresh private shuffle of the peers, for gossip target selection.
    pub(crate) fn shuffled_peers(&self) -> Vec<Member> {
        let mut peers = self.ordered_peers();
        peers.shuffle(&mut rand::thread_rng());
        peers
    }

    /// Up to `count` random members, excluding the local member and
    /// `exclude`.
    pub(crate) fn select_random(&self, count: usize, exclude: &MemberId) -> Vec<Member> {
        let mut members: Vec<Member> = self
            .members
            .values()
            .filter(|record| record.id != self.local_id && record.id != *exclude)
            .map(MemberRecord::snapshot)
            .collect();

        members.shuffle(&mut rand::thread_rng());
        members.truncate(count);
        members
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::Address;

    fn record(id: &str) -> MemberRecord {
        let port = 7000 + id.len() as u16;
        MemberRecord::from_member(&Member::new(id.into(), Address::new("localhost", port)))
    }

    fn registry() -> Registry {
        let mut registry = Registry::new("local".into());
        registry.insert(record("local"));
        registry
    }

    #[test]
    fn peers_mirror_non_local_records() {
        let mut registry = registry();
        registry.insert(record("a"));
        registry.insert(record("b"));

        assert_eq!(registry.len(), 3);
        assert_eq!(registry.peers.len(), 2);
        assert!(!registry.peers.contains(&"local".into()));

        registry.remove(&"a".into());
        assert_eq!(registry.len(), 2);
        assert_eq!(registry.peers, vec!["b".into()]);
    }

    #[test]
    fn ordered_peers_exclude_local() {
        let mut registry = registry();
        registry.insert(record("a"));
        registry.insert(record("b"));
        registry.insert(record("c"));

        let peers = registry.ordered_peers();
        assert_eq!(peers.len(), 3);
        assert!(peers.iter().all(|peer| peer.id != "local".into()));
    }

    #[test]
    fn select_random_excludes_local_and_target() {
        let mut registry = registry();
        registry.insert(record("a"));
        registry.insert(record("b"));
        registry.insert(record("c"));

        let selected = registry.select_random(10, &"a".into());
        assert_eq!(selected.len(), 2);
        assert!(selected
            .iter()
            .all(|member| member.id != "a".into() && member.id != "local".into()));

        let selected = registry.select_random(1, &"a".into());
        assert_eq!(selected.len(), 1);
    }

    #[test]
    fn clear_empties_peers() {
        let mut registry = registry();
        registry.insert(record("a"));

        registry.clear();
        assert_eq!(registry.len(), 0);
        assert!(registry.ordered_peers().is_empty());
    }
}
