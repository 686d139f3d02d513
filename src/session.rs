//! Per-client session state.
//!
//! A session survives its connection when the client asked for a persistent
//! session (CleanSession=0). It tracks subscriptions, in-flight packets in
//! both directions, the packet-id allocator and messages missed while
//! offline.

use std::collections::BTreeMap;
use std::sync::{Arc, Weak};

use ahash::AHashMap;
use parking_lot::Mutex;

use crate::backend::{Client, ClientRef};
use crate::packet::{Message, Packet, QoS};
use crate::topic::topic_matches_filter;

/// Direction of an in-flight packet store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Packets received from the client (QoS 2 publishes awaiting PUBREL).
    Incoming,
    /// Packets sent to the client and not yet fully acknowledged.
    Outgoing,
}

#[derive(Default)]
struct Inner {
    /// Topic filter -> granted QoS.
    subscriptions: AHashMap<String, QoS>,
    /// QoS 2 publishes received but not yet released.
    incoming: AHashMap<u16, Packet>,
    /// In-flight outbound packets, iterated in id order on replay.
    outgoing: BTreeMap<u16, Packet>,
    /// Packet-id allocator position.
    counter: u16,
    /// Messages captured by offline subscriptions, in arrival order.
    missed: Vec<Message>,
}

/// In-memory session state, shared between the backend and the connection
/// that currently owns it.
#[derive(Default)]
pub struct Session {
    inner: Mutex<Inner>,
    /// The client currently bound to this session, if any.
    current_client: Mutex<Option<Weak<dyn Client>>>,
}

impl Session {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store the granted QoS for a topic filter, replacing any previous
    /// subscription on the same filter.
    pub fn save_subscription(&self, filter: &str, qos: QoS) {
        self.inner.lock().subscriptions.insert(filter.to_string(), qos);
    }

    pub fn delete_subscription(&self, filter: &str) {
        self.inner.lock().subscriptions.remove(filter);
    }

    /// The highest granted QoS among all filters matching the topic, so a
    /// client with overlapping subscriptions receives each message once at
    /// the maximum granted QoS.
    pub fn lookup_subscription(&self, topic: &str) -> Option<QoS> {
        self.inner
            .lock()
            .subscriptions
            .iter()
            .filter(|(filter, _)| topic_matches_filter(topic, filter))
            .map(|(_, qos)| *qos)
            .max()
    }

    pub fn all_subscriptions(&self) -> Vec<(String, QoS)> {
        self.inner
            .lock()
            .subscriptions
            .iter()
            .map(|(filter, qos)| (filter.clone(), *qos))
            .collect()
    }

    /// Store an in-flight packet keyed by its packet id. Packets without an
    /// id are not tracked.
    pub fn save_packet(&self, dir: Direction, packet: Packet) {
        let Some(id) = packet_id(&packet) else {
            return;
        };
        let mut inner = self.inner.lock();
        match dir {
            Direction::Incoming => {
                inner.incoming.insert(id, packet);
            }
            Direction::Outgoing => {
                inner.outgoing.insert(id, packet);
            }
        }
    }

    pub fn lookup_packet(&self, dir: Direction, id: u16) -> Option<Packet> {
        let inner = self.inner.lock();
        match dir {
            Direction::Incoming => inner.incoming.get(&id).cloned(),
            Direction::Outgoing => inner.outgoing.get(&id).cloned(),
        }
    }

    pub fn delete_packet(&self, dir: Direction, id: u16) {
        let mut inner = self.inner.lock();
        match dir {
            Direction::Incoming => {
                inner.incoming.remove(&id);
            }
            Direction::Outgoing => {
                inner.outgoing.remove(&id);
            }
        }
    }

    /// All stored packets; the outgoing direction is ordered by packet id so
    /// reconnect replay is deterministic.
    pub fn all_packets(&self, dir: Direction) -> Vec<Packet> {
        let inner = self.inner.lock();
        match dir {
            Direction::Incoming => inner.incoming.values().cloned().collect(),
            Direction::Outgoing => inner.outgoing.values().cloned().collect(),
        }
    }

    /// Allocate the next outbound packet id.
    ///
    /// Ids wrap past 65535 back to 1 (0 is reserved) and skip ids still
    /// occupied by in-flight packets. Returns None when all 65535 ids are in
    /// use, which callers must treat as a fatal back-pressure signal.
    pub fn next_packet_id(&self) -> Option<u16> {
        let mut inner = self.inner.lock();
        for _ in 0..u16::MAX {
            inner.counter = if inner.counter == u16::MAX {
                1
            } else {
                inner.counter + 1
            };
            if !inner.outgoing.contains_key(&inner.counter) {
                return Some(inner.counter);
            }
        }
        None
    }

    /// Append a message missed while offline.
    pub fn queue_missed(&self, msg: Message) {
        self.inner.lock().missed.push(msg);
    }

    /// Drain the missed-message queue in arrival order.
    pub fn take_missed(&self) -> Vec<Message> {
        std::mem::take(&mut self.inner.lock().missed)
    }

    /// Clear all session state. Used when a client reconnects with
    /// CleanSession=1.
    pub fn reset(&self) {
        *self.inner.lock() = Inner::default();
    }

    /// Bind a client to this session, returning the previously bound client
    /// so the caller can evict it.
    pub fn attach_client(&self, client: &ClientRef) -> Option<ClientRef> {
        let mut current = self.current_client.lock();
        let previous = current.as_ref().and_then(Weak::upgrade);
        *current = Some(Arc::downgrade(client));
        previous
    }

    /// Unbind a client, but only if it is still the current one. A client
    /// evicted by a takeover must not detach its successor. Returns whether
    /// the caller was the current client.
    pub fn detach_client(&self, client: &ClientRef) -> bool {
        let mut current = self.current_client.lock();
        let still_current = current
            .as_ref()
            .and_then(Weak::upgrade)
            .is_some_and(|bound| Arc::ptr_eq(&bound, client));
        if still_current {
            *current = None;
        }
        still_current
    }
}

/// The packet id carried by an in-flight packet, if any.
fn packet_id(packet: &Packet) -> Option<u16> {
    match packet {
        Packet::Publish(publish) => publish.packet_id,
        Packet::Pubrel { packet_id } => Some(*packet_id),
        _ => None,
    }
}
