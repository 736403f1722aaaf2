use std::time::Duration;

/// Tuning options for probing, gossip, and failure detection.
#[derive(Debug, Clone)]
pub struct Config {
    /// Period between direct probes of the next round-robin peer.
    pub probe_interval: Duration,
    /// Period between failure sweeps and gossip fan-outs.
    pub gossip_interval: Duration,
    /// Maximum number of peers per gossip batch.
    pub gossip_fanout: usize,
    /// Number of peers asked to probe a suspect on the local node's behalf.
    pub suspect_probes: usize,
    /// Age in the suspect state after which a member is declared dead.
    pub failure_timeout: Duration,
    /// Gossip a suspect update to one random peer as soon as a peer is
    /// demoted locally.
    pub notify_suspect: bool,
    /// Broadcast the local record to all peers whenever a hostile probe
    /// forces the local term to advance.
    pub broadcast_disputes: bool,
    /// Broadcast a suspect update to all peers once every indirect probe of
    /// the suspect has failed.
    pub broadcast_updates: bool,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            probe_interval: Duration::from_secs(1),
            gossip_interval: Duration::from_millis(250),
            gossip_fanout: 2,
            suspect_probes: 3,
            failure_timeout: Duration::from_secs(10),
            notify_suspect: false,
            broadcast_disputes: true,
            broadcast_updates: false,
        }
    }
}

impl Config {
    pub fn new() -> Self {
        Config::default()
    }

    pub fn with_probe_interval(mut self, interval: Duration) -> Self {
        self.probe_interval = interval;
        self
    }

    pub fn with_gossip_interval(mut self, interval: Duration) -> Self {
        self.gossip_interval = interval;
        self
    }

    pub fn with_gossip_fanout(mut self, fanout: usize) -> Self {
        self.gossip_fanout = fanout;
        self
    }

    pub fn with_suspect_probes(mut self, probes: usize) -> Self {
        self.suspect_probes = probes;
        self
    }

    pub fn with_failure_timeout(mut self, timeout: Duration) -> Self {
        self.failure_timeout = timeout;
        self
    }

    pub fn with_notify_suspect(mut self, notify: bool) -> Self {
        self.notify_suspect = notify;
        self
    }

    pub fn with_broadcast_disputes(mut self, broadcast: bool) -> Self {
        self.broadcast_disputes = broadcast;
        self
    }

    pub fn with_broadcast_updates(mut self, broadcast: bool) -> Self {
        self.broadcast_updates = broadcast;
        self
    }
}
