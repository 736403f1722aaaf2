use crate::member::Member;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

/// Change notifications delivered to subscribers, in the order they were
/// posted. Each carries a snapshot of the member taken at the moment of the
/// change.
#[derive(Debug, Clone, PartialEq)]
pub enum MembershipEvent {
    MemberAdded(Member),
    MemberRemoved(Member),
    ReachabilityChanged(Member),
    MetadataChanged(Member),
}

impl MembershipEvent {
    /// The member snapshot carried by the event.
    pub fn member(&self) -> &Member {
        match self {
            MembershipEvent::MemberAdded(member) => member,
            MembershipEvent::MemberRemoved(member) => member,
            MembershipEvent::ReachabilityChanged(member) => member,
            MembershipEvent::MetadataChanged(member) => member,
        }
    }
}

type Subscribers = Arc<Mutex<Vec<mpsc::UnboundedSender<MembershipEvent>>>>;

/// Subscription table shared between the public facade and the dispatcher
/// task. Subscribing works before the protocol starts; dropping the receiver
/// unsubscribes.
#[derive(Debug, Clone, Default)]
pub(crate) struct EventBus {
    subscribers: Subscribers,
}

impl EventBus {
    pub(crate) fn new() -> Self {
        EventBus::default()
    }

    pub(crate) fn subscribe(&self) -> mpsc::UnboundedReceiver<MembershipEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers.lock().unwrap().push(tx);
        rx
    }

    /// Spawns the dispatcher task and returns the handle used to post
    /// events. Dispatch runs on its own task so slow subscribers never stall
    /// the protocol; the task ends once every sender handle is dropped.
    pub(crate) fn start(&self) -> EventSender {
        let (tx, mut rx) = mpsc::unbounded_channel::<MembershipEvent>();
        let subscribers = self.subscribers.clone();

        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                let mut subscribers = subscribers.lock().unwrap();
                subscribers.retain(|subscriber| subscriber.send(event.clone()).is_ok());
            }
        });

        EventSender { tx }
    }
}

/// Posting half of the event bus.
#[derive(Debug, Clone)]
pub(crate) struct EventSender {
    tx: mpsc::UnboundedSender<MembershipEvent>,
}

impl EventSender {
    /// Queues an event for dispatch. Events posted during shutdown, after
    /// the dispatcher has stopped, are dropped.
    pub(crate) fn post(&self, event: MembershipEvent) {
        let _ = self.tx.send(event);
    }

    #[cfg(test)]
    pub(crate) fn channel() -> (Self, mpsc::UnboundedReceiver<MembershipEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (EventSender { tx }, rx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::Address;

    fn member(id: &str) -> Member {
        Member::new(id.into(), Address::new("localhost", 7000))
    }

    #[tokio::test]
    async fn subscribers_see_events_in_post_order() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();
        let events = bus.start();

        events.post(MembershipEvent::MemberAdded(member("a")));
        events.post(MembershipEvent::ReachabilityChanged(member("a")));
        events.post(MembershipEvent::MemberRemoved(member("a")));

        assert_eq!(
            rx.recv().await.unwrap(),
            MembershipEvent::MemberAdded(member("a"))
        );
        assert_eq!(
            rx.recv().await.unwrap(),
            MembershipEvent::ReachabilityChanged(member("a"))
        );
        assert_eq!(
            rx.recv().await.unwrap(),
            MembershipEvent::MemberRemoved(member("a"))
        );
    }

    #[tokio::test]
    async fn dropped_subscribers_are_pruned() {
        let bus = EventBus::new();
        let dropped = bus.subscribe();
        let mut kept = bus.subscribe();
        let events = bus.start();

        drop(dropped);
        events.post(MembershipEvent::MemberAdded(member("a")));

        assert_eq!(
            kept.recv().await.unwrap(),
            MembershipEvent::MemberAdded(member("a"))
        );
        assert_eq!(bus.subscribers.lock().unwrap().len(), 1);
    }
}
