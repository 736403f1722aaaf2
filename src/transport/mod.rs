pub mod proto;

use crate::common::Address;
use crate::member::Member;
use async_trait::async_trait;
use tokio::sync::oneshot;

pub use proto::{Request, Response};

/// Client half of the transports the protocol consumes: request/response
/// messaging for probes, plus fire-and-forget datagram unicast for gossip.
///
/// Implementations are cloned freely; every in-flight probe holds its own
/// handle.
#[async_trait]
pub trait Client: Clone + Send + Sync + 'static {
    type Error: std::error::Error + Send + Sync + 'static;

    /// Sends a request and awaits the peer's reply.
    async fn request(
        &self,
        target: Address,
        request: Request,
    ) -> std::result::Result<Response, Self::Error>;

    /// Sends a gossip batch without waiting for delivery.
    async fn unicast(
        &self,
        target: Address,
        updates: Vec<Member>,
    ) -> std::result::Result<(), Self::Error>;
}

/// Server-side message handed to the protocol by the transport.
///
/// Probe and probe-request messages carry a responder; dropping it without
/// replying surfaces as a transport error on the calling side.
#[derive(Debug)]
pub enum Inbound {
    Probe {
        member: Member,
        reply: oneshot::Sender<Member>,
    },
    ProbeRequest {
        suspect: Member,
        reply: oneshot::Sender<bool>,
    },
    Gossip {
        updates: Vec<Member>,
    },
}
