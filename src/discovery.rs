use crate::common::{Address, MemberId};
use tokio::sync::mpsc;

/// A peer announced by the discovery provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Node {
    pub id: MemberId,
    pub address: Address,
}

impl Node {
    pub fn new(id: MemberId, address: Address) -> Self {
        Node { id, address }
    }
}

/// Join and leave notifications from the discovery provider. Leave is
/// advisory: the failure detector, not discovery, decides when an active
/// member is gone.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiscoveryEvent {
    Join(Node),
    Leave(Node),
}

/// Source of seed peers for the protocol.
pub trait Discovery: Send + 'static {
    /// The currently known set of nodes. Queried fresh on every probe tick.
    fn nodes(&self) -> Vec<Node>;

    /// Registers a listener for join/leave notifications.
    fn subscribe(&mut self) -> mpsc::UnboundedReceiver<DiscoveryEvent>;
}

/// Discovery over a fixed seed list. Emits no events.
#[derive(Debug, Default)]
pub struct StaticDiscovery {
    nodes: Vec<Node>,
    // Held so subscribed receivers stay open for the protocol's lifetime.
    listeners: Vec<mpsc::UnboundedSender<DiscoveryEvent>>,
}

impl StaticDiscovery {
    pub fn new(nodes: Vec<Node>) -> Self {
        StaticDiscovery {
            nodes,
            listeners: Vec::new(),
        }
    }
}

impl Discovery for StaticDiscovery {
    fn nodes(&self) -> Vec<Node> {
        self.nodes.clone()
    }

    fn subscribe(&mut self) -> mpsc::UnboundedReceiver<DiscoveryEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.listeners.push(tx);
        rx
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn static_discovery_lists_seeds() {
        let node = Node::new("a".into(), Address::new("localhost", 7000));
        let discovery = StaticDiscovery::new(vec![node.clone()]);

        assert_eq!(discovery.nodes(), vec![node]);
    }
}
