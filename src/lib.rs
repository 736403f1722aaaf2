//! SWIM cluster membership library.
//!
//! Each node keeps an eventually consistent view of which peers are
//! reachable, tracks per-member metadata, and streams membership events to
//! local subscribers. Failure detection follows the SWIM scheme: periodic
//! direct probes, indirect probes through peers on failure, and a suspicion
//! timeout; accepted changes piggyback on periodic gossip.

pub mod cluster;
mod common;
mod config;
pub mod discovery;
mod error;
mod event;
mod member;
mod membership;
mod protocol;
pub mod test_utils;
pub mod transport;

pub use self::cluster::Cluster;
pub use self::common::{Address, MemberId, Properties, Version};
pub use self::config::Config;
pub use self::discovery::{Discovery, DiscoveryEvent, Node, StaticDiscovery};
pub use self::error::{Error, Result};
pub use self::event::MembershipEvent;
pub use self::member::{Member, State};
pub use self::transport::{Client, Inbound};
