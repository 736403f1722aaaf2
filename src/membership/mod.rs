mod registry;

pub(crate) use registry::Registry;

use crate::{
    common::{Address, MemberId, Properties},
    config::Config,
    event::{EventSender, MembershipEvent},
    member::{Member, MemberRecord, State},
};
use rand::seq::SliceRandom;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info};

pub(crate) type SharedRegistry = Arc<RwLock<Registry>>;

/// Outbox for fire-and-forget gossip sends, drained by a dedicated sender
/// task.
pub(crate) type GossipSender = mpsc::UnboundedSender<(Address, Vec<Member>)>;

/// The state reconciler.
///
/// Merges incoming member records into the registry along the
/// (term, state) lattice, emits membership events, and queues accepted
/// updates for the next gossip round. All mutation happens on the protocol
/// driver; the registry lock only covers concurrent public queries.
pub(crate) struct Membership {
    registry: SharedRegistry,
    local_id: MemberId,
    /// Shadow of the local record's properties, used to detect drift on
    /// every gossip tick.
    local_properties: Properties,
    updates: Vec<Member>,
    events: EventSender,
    gossip_tx: GossipSender,
    config: Config,
}

enum Rule {
    /// No record yet: admit as alive.
    Insert,
    /// Newer term under a different version: a new incarnation.
    Replace,
    /// Newer term, same incarnation.
    Newer,
    /// Same term, state advances along the lattice.
    Advance,
    Reject,
}

impl Membership {
    pub(crate) fn new(
        local: &Member,
        registry: SharedRegistry,
        events: EventSender,
        gossip_tx: GossipSender,
        config: Config,
    ) -> Self {
        let record = MemberRecord::local(local);
        let snapshot = record.snapshot();
        let local_properties = record.properties.clone();
        registry.write().unwrap().insert(record);

        info!(id = %snapshot.id, "member activated");
        events.post(MembershipEvent::MemberAdded(snapshot));

        Membership {
            registry,
            local_id: local.id.clone(),
            local_properties,
            updates: Vec::new(),
            events,
            gossip_tx,
            config,
        }
    }

    /// Merges one incoming record. Returns whether it was accepted; accepted
    /// updates are queued for the next gossip round.
    pub(crate) fn update_state(&mut self, incoming: Member) -> bool {
        if incoming.id == self.local_id {
            return false;
        }

        match self.reconcile(incoming) {
            Some(update) => {
                self.record_update(update);
                true
            }
            None => false,
        }
    }

    fn reconcile(&self, incoming: Member) -> Option<Member> {
        let mut registry = self.registry.write().unwrap();

        let rule = match registry.get(&incoming.id) {
            None => Rule::Insert,
            Some(record) if incoming.term > record.term => {
                if incoming.version != record.version {
                    Rule::Replace
                } else {
                    Rule::Newer
                }
            }
            Some(record) if incoming.term == record.term && incoming.state > record.state => {
                Rule::Advance
            }
            Some(_) => Rule::Reject,
        };

        match rule {
            Rule::Insert => Some(self.admit(&mut registry, &incoming)),
            Rule::Replace => {
                if let Some(old) = registry.remove(&incoming.id) {
                    debug!(local = %self.local_id, member = %old.id, "member evicted for new version");
                    self.events
                        .post(MembershipEvent::MemberRemoved(old.snapshot()));
                }
                Some(self.admit(&mut registry, &incoming))
            }
            Rule::Newer => self.apply_newer(&mut registry, incoming),
            Rule::Advance => self.apply_advance(&mut registry, incoming),
            Rule::Reject => None,
        }
    }

    /// Inserts a fresh record for `incoming`, always in the alive state.
    fn admit(&self, registry: &mut Registry, incoming: &Member) -> Member {
        let mut record = MemberRecord::from_member(incoming);
        record.set_state(State::Alive);
        let added = record.snapshot();
        registry.insert(record);

        debug!(local = %self.local_id, member = %added.id, "member added");
        self.events
            .post(MembershipEvent::MemberAdded(added.clone()));
        added
    }

    /// Same incarnation with a strictly newer term: adopt the term, then
    /// apply the state delta.
    fn apply_newer(&self, registry: &mut Registry, incoming: Member) -> Option<Member> {
        let mut suspect_notice = None;
        let mut dead = false;

        let update = {
            let record = registry.get_mut(&incoming.id)?;
            record.term = incoming.term;

            if incoming.state == State::Alive && record.state != State::Alive {
                record.set_state(State::Alive);
                debug!(local = %self.local_id, member = %record.id, "member reachable");
                self.events
                    .post(MembershipEvent::ReachabilityChanged(record.snapshot()));
                if incoming.properties != record.properties {
                    record.properties.extend(incoming.properties.clone());
                    debug!(local = %self.local_id, member = %record.id, "member metadata changed");
                    self.events
                        .post(MembershipEvent::MetadataChanged(record.snapshot()));
                }
            } else if incoming.state == State::Suspect && record.state != State::Suspect {
                if incoming.properties != record.properties {
                    record.properties.extend(incoming.properties.clone());
                    debug!(local = %self.local_id, member = %record.id, "member metadata changed");
                    self.events
                        .post(MembershipEvent::MetadataChanged(record.snapshot()));
                }
                record.set_state(State::Suspect);
                debug!(local = %self.local_id, member = %record.id, "member unreachable");
                self.events
                    .post(MembershipEvent::ReachabilityChanged(record.snapshot()));
                if self.config.notify_suspect {
                    suspect_notice = Some(record.snapshot());
                }
            } else if incoming.state == State::Dead && record.state != State::Dead {
                if record.state == State::Alive {
                    record.set_state(State::Suspect);
                    debug!(local = %self.local_id, member = %record.id, "member unreachable");
                    self.events
                        .post(MembershipEvent::ReachabilityChanged(record.snapshot()));
                }
                record.set_state(State::Dead);
                dead = true;
            } else if incoming.properties != record.properties {
                record.properties.extend(incoming.properties.clone());
                debug!(local = %self.local_id, member = %record.id, "member metadata changed");
                self.events
                    .post(MembershipEvent::MetadataChanged(record.snapshot()));
            }

            record.snapshot()
        };

        if dead {
            if let Some(old) = registry.remove(&incoming.id) {
                debug!(local = %self.local_id, member = %old.id, "member removed");
                self.events
                    .post(MembershipEvent::MemberRemoved(old.snapshot()));
            }
        }
        if let Some(notice) = suspect_notice {
            self.notify_suspect(registry, notice);
        }

        Some(update)
    }

    /// Same term, state advancing along the lattice.
    fn apply_advance(&self, registry: &mut Registry, incoming: Member) -> Option<Member> {
        let mut suspect_notice = None;
        let mut dead = false;

        let update = {
            let record = registry.get_mut(&incoming.id)?;
            record.set_state(incoming.state);

            match incoming.state {
                State::Suspect => {
                    debug!(local = %self.local_id, member = %record.id, "member unreachable");
                    self.events
                        .post(MembershipEvent::ReachabilityChanged(record.snapshot()));
                    if self.config.notify_suspect {
                        suspect_notice = Some(record.snapshot());
                    }
                }
                State::Dead => dead = true,
                State::Alive => {}
            }

            record.snapshot()
        };

        if dead {
            if let Some(old) = registry.remove(&incoming.id) {
                debug!(local = %self.local_id, member = %old.id, "member removed");
                self.events
                    .post(MembershipEvent::MemberRemoved(old.snapshot()));
            }
        }
        if let Some(notice) = suspect_notice {
            self.notify_suspect(registry, notice);
        }

        Some(update)
    }

    /// Pushes a freshly demoted record to one random peer straight away so
    /// word of the suspicion spreads ahead of the next gossip tick.
    fn notify_suspect(&self, registry: &Registry, update: Member) {
        let peers = registry.peer_snapshots();
        if let Some(peer) = peers.choose(&mut rand::thread_rng()) {
            let _ = self.gossip_tx.send((peer.address.clone(), vec![update]));
        }
    }

    /// Compares the local record's properties against the shadow snapshot;
    /// on drift, bumps the local term and announces the change.
    pub(crate) fn check_metadata(&mut self) {
        let update = {
            let mut registry = self.registry.write().unwrap();
            let local = registry.local_mut();

            if local.properties == self.local_properties {
                None
            } else {
                self.local_properties = local.properties.clone();
                debug!(id = %local.id, "local properties changed");
                local.term += 1;
                Some(local.snapshot())
            }
        };

        if let Some(update) = update {
            self.events
                .post(MembershipEvent::MetadataChanged(update.clone()));
            self.record_update(update);
        }
    }

    /// Declares dead every member that has sat in the suspect state longer
    /// than `timeout`. This is the only transition driven purely by local
    /// time.
    pub(crate) fn check_failures(&self, timeout: Duration) {
        let removed = {
            let mut registry = self.registry.write().unwrap();
            let now = Instant::now();

            let expired: Vec<MemberId> = registry
                .records()
                .filter(|record| {
                    record.state == State::Suspect
                        && now.duration_since(record.timestamp) > timeout
                })
                .map(|record| record.id.clone())
                .collect();

            let mut removed = Vec::new();
            for id in expired {
                if let Some(mut record) = registry.remove(&id) {
                    record.set_state(State::Dead);
                    removed.push(record.snapshot());
                }
            }
            removed
        };

        for member in removed {
            debug!(local = %self.local_id, member = %member.id, "member removed");
            self.events.post(MembershipEvent::MemberRemoved(member));
        }
    }

    /// Answers a probe with the local record, advancing the local term first
    /// when the caller's view disputes it. Returns the snapshot to reply
    /// with and whether the term advanced.
    pub(crate) fn handle_probe(&self, incoming: &Member) -> (Member, bool) {
        let mut registry = self.registry.write().unwrap();
        let local = registry.local_mut();
        let mut disputed = false;

        if incoming.term > local.term {
            local.term = incoming.term + 1;
            disputed = true;
        } else if incoming.state == State::Suspect {
            local.term += 1;
            disputed = true;
        }

        (local.snapshot(), disputed)
    }

    /// Queues a snapshot for the next gossip round. The queue is unbounded:
    /// every tick drains it whole, so growth is limited to the update rate
    /// within one gossip interval.
    pub(crate) fn record_update(&mut self, update: Member) {
        self.updates.push(update);
    }

    /// Drains the queued updates.
    pub(crate) fn take_updates(&mut self) -> Vec<Member> {
        std::mem::take(&mut self.updates)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn local_member() -> Member {
        Member::new("local".into(), Address::new("localhost", 7000)).with_version("1".into())
    }

    fn remote(id: &str, term: u64, state: State) -> Member {
        let mut member =
            Member::new(id.into(), Address::new("localhost", 7100)).with_version("1".into());
        member.term = term;
        member.state = state;
        member
    }

    struct Harness {
        membership: Membership,
        registry: SharedRegistry,
        events: mpsc::UnboundedReceiver<MembershipEvent>,
        gossip: mpsc::UnboundedReceiver<(Address, Vec<Member>)>,
    }

    fn harness(config: Config) -> Harness {
        let (events, mut event_rx) = EventSender::channel();
        let (gossip_tx, gossip_rx) = mpsc::unbounded_channel();
        let registry = Arc::new(RwLock::new(Registry::new("local".into())));
        let membership = Membership::new(
            &local_member(),
            registry.clone(),
            events,
            gossip_tx,
            config,
        );

        // Drop the activation event so tests start from a clean stream.
        assert!(matches!(
            event_rx.try_recv(),
            Ok(MembershipEvent::MemberAdded(_))
        ));

        Harness {
            membership,
            registry,
            events: event_rx,
            gossip: gossip_rx,
        }
    }

    impl Harness {
        fn state_of(&self, id: &str) -> Option<(State, u64)> {
            self.registry
                .read()
                .unwrap()
                .get(&id.into())
                .map(|record| (record.state, record.term))
        }
    }

    #[test]
    fn rejects_updates_for_the_local_member() {
        let mut harness = harness(Config::default());
        let mut update = local_member();
        update.term = u64::MAX;
        update.state = State::Dead;

        assert!(!harness.membership.update_state(update));
        assert!(harness.events.try_recv().is_err());
        assert_eq!(harness.registry.read().unwrap().len(), 1);
    }

    #[test]
    fn first_observation_is_admitted_alive() {
        let mut harness = harness(Config::default());

        assert!(harness
            .membership
            .update_state(remote("b", 5, State::Suspect)));

        assert_eq!(harness.state_of("b"), Some((State::Alive, 5)));
        assert!(matches!(
            harness.events.try_recv(),
            Ok(MembershipEvent::MemberAdded(member)) if member.id == "b".into()
        ));
        assert_eq!(harness.membership.take_updates().len(), 1);
    }

    #[test]
    fn duplicate_updates_are_rejected() {
        let mut harness = harness(Config::default());
        let update = remote("b", 5, State::Alive);

        assert!(harness.membership.update_state(update.clone()));
        assert!(!harness.membership.update_state(update));

        assert_eq!(harness.membership.take_updates().len(), 1);
        // Only the single added event.
        assert!(harness.events.try_recv().is_ok());
        assert!(harness.events.try_recv().is_err());
    }

    #[test]
    fn older_terms_are_rejected() {
        let mut harness = harness(Config::default());
        harness.membership.update_state(remote("b", 5, State::Alive));

        assert!(!harness.membership.update_state(remote("b", 4, State::Dead)));
        assert_eq!(harness.state_of("b"), Some((State::Alive, 5)));
    }

    #[test]
    fn same_term_state_advances() {
        let mut harness = harness(Config::default());
        harness.membership.update_state(remote("b", 5, State::Alive));
        harness.events.try_recv().unwrap();

        assert!(harness
            .membership
            .update_state(remote("b", 5, State::Suspect)));

        assert_eq!(harness.state_of("b"), Some((State::Suspect, 5)));
        assert!(matches!(
            harness.events.try_recv(),
            Ok(MembershipEvent::ReachabilityChanged(member))
                if member.id == "b".into() && member.state == State::Suspect
        ));
    }

    #[test]
    fn same_term_state_never_retreats() {
        let mut harness = harness(Config::default());
        harness.membership.update_state(remote("b", 5, State::Alive));
        harness
            .membership
            .update_state(remote("b", 5, State::Suspect));

        assert!(!harness.membership.update_state(remote("b", 5, State::Alive)));
        assert_eq!(harness.state_of("b"), Some((State::Suspect, 5)));
    }

    #[test]
    fn same_term_dead_removes_the_member() {
        let mut harness = harness(Config::default());
        harness.membership.update_state(remote("b", 5, State::Alive));
        harness.events.try_recv().unwrap();

        assert!(harness.membership.update_state(remote("b", 5, State::Dead)));

        assert_eq!(harness.state_of("b"), None);
        assert!(matches!(
            harness.events.try_recv(),
            Ok(MembershipEvent::MemberRemoved(member))
                if member.id == "b".into() && member.state == State::Dead
        ));
    }

    #[test]
    fn newer_term_recovers_a_suspect() {
        let mut harness = harness(Config::default());
        harness.membership.update_state(remote("b", 5, State::Alive));
        harness
            .membership
            .update_state(remote("b", 5, State::Suspect));
        while harness.events.try_recv().is_ok() {}

        assert!(harness.membership.update_state(remote("b", 6, State::Alive)));

        assert_eq!(harness.state_of("b"), Some((State::Alive, 6)));
        assert!(matches!(
            harness.events.try_recv(),
            Ok(MembershipEvent::ReachabilityChanged(member))
                if member.id == "b".into() && member.state == State::Alive
        ));
    }

    #[test]
    fn newer_term_dead_transitions_through_suspect() {
        let mut harness = harness(Config::default());
        harness.membership.update_state(remote("b", 5, State::Alive));
        harness.events.try_recv().unwrap();

        assert!(harness.membership.update_state(remote("b", 6, State::Dead)));

        assert_eq!(harness.state_of("b"), None);
        assert!(matches!(
            harness.events.try_recv(),
            Ok(MembershipEvent::ReachabilityChanged(member)) if member.state == State::Suspect
        ));
        assert!(matches!(
            harness.events.try_recv(),
            Ok(MembershipEvent::MemberRemoved(member)) if member.state == State::Dead
        ));
    }

    #[test]
    fn newer_term_merges_changed_properties() {
        let mut harness = harness(Config::default());
        harness.membership.update_state(remote("b", 5, State::Alive));
        harness.events.try_recv().unwrap();

        let update = remote("b", 6, State::Alive).with_property("role", "storage");
        assert!(harness.membership.update_state(update));

        assert!(matches!(
            harness.events.try_recv(),
            Ok(MembershipEvent::MetadataChanged(member))
                if member.properties.get("role").map(String::as_str) == Some("storage")
        ));
    }

    #[test]
    fn version_change_is_a_new_incarnation() {
        let mut harness = harness(Config::default());
        harness.membership.update_state(remote("b", 5, State::Alive));
        harness.events.try_recv().unwrap();

        let mut restarted = remote("b", 6, State::Alive);
        restarted.version = Some("2".into());
        assert!(harness.membership.update_state(restarted));

        assert!(matches!(
            harness.events.try_recv(),
            Ok(MembershipEvent::MemberRemoved(member))
                if member.version == Some("1".into())
        ));
        assert!(matches!(
            harness.events.try_recv(),
            Ok(MembershipEvent::MemberAdded(member))
                if member.version == Some("2".into()) && member.state == State::Alive
        ));
        assert_eq!(harness.state_of("b"), Some((State::Alive, 6)));
    }

    #[test]
    fn notify_suspect_gossips_one_immediate_update() {
        let mut harness = harness(Config::default().with_notify_suspect(true));
        harness.membership.update_state(remote("b", 5, State::Alive));

        harness
            .membership
            .update_state(remote("b", 5, State::Suspect));

        let (_, updates) = harness.gossip.try_recv().unwrap();
        assert_eq!(updates.len(), 1);
        assert_eq!(updates[0].state, State::Suspect);
        assert!(harness.gossip.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn suspects_expire_into_removal() {
        let mut harness = harness(Config::default());
        harness.membership.update_state(remote("b", 5, State::Alive));
        harness
            .membership
            .update_state(remote("b", 5, State::Suspect));
        while harness.events.try_recv().is_ok() {}

        let timeout = Duration::from_secs(10);
        harness.membership.check_failures(timeout);
        assert_eq!(harness.state_of("b"), Some((State::Suspect, 5)));

        tokio::time::advance(timeout + Duration::from_millis(1)).await;
        harness.membership.check_failures(timeout);

        assert_eq!(harness.state_of("b"), None);
        assert!(matches!(
            harness.events.try_recv(),
            Ok(MembershipEvent::MemberRemoved(member)) if member.id == "b".into()
        ));
    }

    #[test]
    fn metadata_drift_bumps_the_local_term() {
        let mut harness = harness(Config::default());
        let term_before = harness.registry.read().unwrap().local().term;

        harness.membership.check_metadata();
        assert!(harness.events.try_recv().is_err());

        harness
            .registry
            .write()
            .unwrap()
            .local_mut()
            .properties
            .insert("role".to_string(), "storage".to_string());
        harness.membership.check_metadata();

        assert_eq!(
            harness.registry.read().unwrap().local().term,
            term_before + 1
        );
        assert!(matches!(
            harness.events.try_recv(),
            Ok(MembershipEvent::MetadataChanged(member)) if member.id == "local".into()
        ));
        assert_eq!(harness.membership.take_updates().len(), 1);

        // Unchanged properties stay quiet.
        harness.membership.check_metadata();
        assert!(harness.events.try_recv().is_err());
    }

    #[test]
    fn hostile_probe_advances_the_local_term() {
        let harness = harness(Config::default());
        let term = harness.registry.read().unwrap().local().term;

        let probe = remote("b", term + 10, State::Alive);
        let (reply, disputed) = harness.membership.handle_probe(&probe);
        assert!(disputed);
        assert_eq!(reply.term, term + 11);

        let suspect_probe = remote("b", 0, State::Suspect);
        let (reply, disputed) = harness.membership.handle_probe(&suspect_probe);
        assert!(disputed);
        assert_eq!(reply.term, term + 12);

        let benign = remote("b", 0, State::Alive);
        let (reply, disputed) = harness.membership.handle_probe(&benign);
        assert!(!disputed);
        assert_eq!(reply.term, term + 12);
    }

    #[test]
    fn take_updates_drains_the_queue() {
        let mut harness = harness(Config::default());
        harness.membership.update_state(remote("b", 5, State::Alive));
        harness.membership.update_state(remote("c", 5, State::Alive));

        assert_eq!(harness.membership.take_updates().len(), 2);
        assert!(harness.membership.take_updates().is_empty());
    }
}
