use crate::{
    common::MemberId,
    config::Config,
    discovery::Discovery,
    error::Result,
    event::{EventBus, MembershipEvent},
    member::Member,
    membership::{Membership, Registry, SharedRegistry},
    protocol::{run_sender, Protocol},
    transport::{Client, Inbound},
};
use std::sync::{Arc, Mutex, RwLock};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::info;

/// A node's handle on the membership service.
///
/// `join` starts the protocol against the supplied transports; the cluster
/// then keeps an eventually consistent view of which peers are reachable and
/// streams membership events to subscribers. `join` and `leave` are
/// idempotent, and a cluster joins at most once over its lifetime.
pub struct Cluster {
    config: Config,
    events: EventBus,
    inner: Mutex<Inner>,
}

enum Inner {
    Idle,
    Running(Running),
    Stopped,
}

struct Running {
    registry: SharedRegistry,
    shutdown: oneshot::Sender<()>,
    driver: JoinHandle<()>,
}

impl Cluster {
    pub fn new(config: Config) -> Self {
        Cluster {
            config,
            events: EventBus::new(),
            inner: Mutex::new(Inner::Idle),
        }
    }

    /// Starts the membership protocol as `local`, wiring the transport
    /// client, the inbound message stream, and the discovery provider.
    ///
    /// The first call wins; any later call (including after `leave`) is a
    /// no-op.
    pub async fn join<C, D>(
        &self,
        client: C,
        inbound: mpsc::UnboundedReceiver<Inbound>,
        mut discovery: D,
        local: Member,
    ) -> Result<()>
    where
        C: Client,
        D: Discovery,
    {
        let mut inner = self.inner.lock().unwrap();
        if !matches!(*inner, Inner::Idle) {
            return Ok(());
        }

        let registry: SharedRegistry = Arc::new(RwLock::new(Registry::new(local.id.clone())));
        let events = self.events.start();
        let (gossip_tx, gossip_rx) = mpsc::unbounded_channel();

        let membership = Membership::new(
            &local,
            registry.clone(),
            events,
            gossip_tx.clone(),
            self.config.clone(),
        );

        tokio::spawn(run_sender(client.clone(), gossip_rx));

        let discovery_events = discovery.subscribe();
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let protocol = Protocol::new(
            self.config.clone(),
            membership,
            registry.clone(),
            client,
            discovery,
            discovery_events,
            inbound,
            gossip_tx,
            shutdown_rx,
        );
        let driver = tokio::spawn(protocol.run());

        info!(id = %local.id, "started");
        *inner = Inner::Running(Running {
            registry,
            shutdown: shutdown_tx,
            driver,
        });
        Ok(())
    }

    /// Stops the protocol: timers are cancelled, the local member goes dead,
    /// and the registry is cleared. In-flight probe completions are dropped.
    /// Calling `leave` more than once, or before `join`, is a no-op.
    pub async fn leave(&self) -> Result<()> {
        let running = {
            let mut inner = self.inner.lock().unwrap();
            match std::mem::replace(&mut *inner, Inner::Stopped) {
                Inner::Running(running) => Some(running),
                Inner::Idle => {
                    *inner = Inner::Idle;
                    None
                }
                Inner::Stopped => None,
            }
        };

        if let Some(running) = running {
            let _ = running.shutdown.send(());
            let _ = running.driver.await;
            info!("stopped");
        }
        Ok(())
    }

    /// Snapshot of every known member, the local member included.
    pub fn members(&self) -> Vec<Member> {
        match &*self.inner.lock().unwrap() {
            Inner::Running(running) => running.registry.read().unwrap().snapshot(),
            _ => Vec::new(),
        }
    }

    /// Snapshot of a single member, if known.
    pub fn member(&self, id: &MemberId) -> Option<Member> {
        match &*self.inner.lock().unwrap() {
            Inner::Running(running) => running
                .registry
                .read()
                .unwrap()
                .get(id)
                .map(|record| record.snapshot()),
            _ => None,
        }
    }

    /// Snapshot of the local member while the protocol is running.
    pub fn local_member(&self) -> Option<Member> {
        match &*self.inner.lock().unwrap() {
            Inner::Running(running) => {
                let registry = running.registry.read().unwrap();
                registry.get(registry.local_id()).map(|r| r.snapshot())
            }
            _ => None,
        }
    }

    /// Sets a property on the local member. The change is picked up at the
    /// next gossip tick, which bumps the local term and announces the new
    /// metadata to the cluster.
    pub fn set_property(&self, key: impl Into<String>, value: impl Into<String>) {
        if let Inner::Running(running) = &*self.inner.lock().unwrap() {
            let mut registry = running.registry.write().unwrap();
            registry
                .local_mut()
                .properties
                .insert(key.into(), value.into());
        }
    }

    /// Subscribes to membership events. Works before `join`; events arrive
    /// in the order they were produced. Dropping the receiver unsubscribes.
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<MembershipEvent> {
        self.events.subscribe()
    }
}
