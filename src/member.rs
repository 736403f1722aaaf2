use crate::common::{Address, MemberId, Properties, Version};
use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::time::Instant;

/// Reachability of a member as seen by the local node.
///
/// The derived ordering is the lattice the reconciler walks: within a single
/// term a member's state only ever advances `Alive -> Suspect -> Dead`. A
/// state may move backwards only when the term strictly increases.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum State {
    Alive,
    Suspect,
    Dead,
}

impl State {
    /// Whether the member is still tracked by the failure detector.
    pub fn is_active(self) -> bool {
        self != State::Dead
    }

    /// Whether the member responded to the most recent round of probes.
    pub fn is_reachable(self) -> bool {
        self == State::Alive
    }
}

/// Immutable snapshot of a member.
///
/// This is the wire unit exchanged by probes and gossip, the payload carried
/// by membership events, and the value returned from public queries.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Member {
    pub id: MemberId,
    pub address: Address,
    pub zone: Option<String>,
    pub rack: Option<String>,
    pub host: Option<String>,
    pub properties: Properties,
    /// Absent on bootstrap stubs built from bare discovery nodes.
    pub version: Option<Version>,
    pub state: State,
    pub term: u64,
}

impl Member {
    /// Builds a bare member definition: alive, term zero, no version.
    pub fn new(id: MemberId, address: Address) -> Self {
        Member {
            id,
            address,
            zone: None,
            rack: None,
            host: None,
            properties: Properties::default(),
            version: None,
            state: State::Alive,
            term: 0,
        }
    }

    /// Bootstrap stub for a node the discovery service announced but the
    /// protocol has not yet observed. Version-less and at term zero, so a
    /// probe of it never disputes the real member's term; the probe reply
    /// supplies the genuine record.
    pub fn stub(id: MemberId, address: Address) -> Self {
        Member::new(id, address)
    }

    pub fn with_version(mut self, version: Version) -> Self {
        self.version = Some(version);
        self
    }

    pub fn with_zone(mut self, zone: impl Into<String>) -> Self {
        self.zone = Some(zone.into());
        self
    }

    pub fn with_rack(mut self, rack: impl Into<String>) -> Self {
        self.rack = Some(rack.into());
        self
    }

    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.host = Some(host.into());
        self
    }

    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }
}

/// Live registry record for a member. Only the protocol driver mutates
/// these; everyone else sees `Member` snapshots.
#[derive(Debug, Clone)]
pub(crate) struct MemberRecord {
    pub(crate) id: MemberId,
    pub(crate) address: Address,
    pub(crate) zone: Option<String>,
    pub(crate) rack: Option<String>,
    pub(crate) host: Option<String>,
    pub(crate) properties: Properties,
    pub(crate) version: Option<Version>,
    pub(crate) state: State,
    pub(crate) term: u64,
    /// Wall-clock moment of the last state change; drives the suspicion
    /// timeout.
    pub(crate) timestamp: Instant,
}

impl MemberRecord {
    /// Record for the local member. The initial term is wall-clock
    /// milliseconds, so a restarted member always rejoins above any term its
    /// previous incarnation held.
    pub(crate) fn local(member: &Member) -> Self {
        let millis = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|elapsed| elapsed.as_millis() as u64)
            .unwrap_or(0);

        MemberRecord {
            id: member.id.clone(),
            address: member.address.clone(),
            zone: member.zone.clone(),
            rack: member.rack.clone(),
            host: member.host.clone(),
            properties: member.properties.clone(),
            version: member.version.clone(),
            state: State::Alive,
            term: millis,
            timestamp: Instant::now(),
        }
    }

    /// Record adopting a remote member's snapshot wholesale.
    pub(crate) fn from_member(member: &Member) -> Self {
        MemberRecord {
            id: member.id.clone(),
            address: member.address.clone(),
            zone: member.zone.clone(),
            rack: member.rack.clone(),
            host: member.host.clone(),
            properties: member.properties.clone(),
            version: member.version.clone(),
            state: member.state,
            term: member.term,
            timestamp: Instant::now(),
        }
    }

    /// Changes the state, refreshing the timestamp only on an actual change.
    pub(crate) fn set_state(&mut self, state: State) {
        if self.state != state {
            self.state = state;
            self.timestamp = Instant::now();
        }
    }

    pub(crate) fn snapshot(&self) -> Member {
        Member {
            id: self.id.clone(),
            address: self.address.clone(),
            zone: self.zone.clone(),
            rack: self.rack.clone(),
            host: self.host.clone(),
            properties: self.properties.clone(),
            version: self.version.clone(),
            state: self.state,
            term: self.term,
        }
    }
}
