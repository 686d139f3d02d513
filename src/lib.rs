//! mqrelay - a lightweight MQTT 3.1.1 broker.
//!
//! The broker core is split along the protocol's natural seams:
//! - [`packet`]: typed MQTT 3.1.1 packets and the wire codec
//! - [`topic`]: the wildcard-capable topic tree
//! - [`session`]: per-client session state (subscriptions, in-flight
//!   packets, missed messages)
//! - [`backend`]: the process-wide authority (authentication, session
//!   registry, retained store, routing) behind the [`Backend`] trait
//! - [`client`]: the per-connection state machine
//! - [`broker`] / [`server`]: the facade and the accept loop

pub mod backend;
pub mod broker;
pub mod client;
pub mod config;
pub mod error;
pub mod packet;
pub mod server;
pub mod session;
pub mod topic;

pub use backend::{Backend, Client, ClientRef, MemoryBackend};
pub use broker::Broker;
pub use crate::config::Config;
pub use error::{Error, ProtocolError, Result};
pub use packet::{Message, QoS};
pub use server::Server;
pub use session::Session;
