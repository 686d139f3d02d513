//! Broker backend: authentication, session registry, retained messages and
//! message routing.
//!
//! A single backend instance is shared by every connection. Connections are
//! seen through the [`Client`] trait, which is all the backend needs: a way
//! to deliver messages, a way to force a disconnect, and the session bound
//! at CONNECT.

use std::sync::Arc;
use std::thread;

use ahash::AHashMap;
use log::{debug, warn};
use parking_lot::Mutex;

use crate::error::Result;
use crate::packet::{Message, QoS};
use crate::session::Session;
use crate::topic::Tree;

/// The backend's view of a client connection.
pub trait Client: Send + Sync + 'static {
    /// Deliver a message. Returns false once the connection can no longer
    /// accept messages.
    fn publish(&self, msg: &Message) -> bool;

    /// Force a disconnect. `clean` suppresses the client's will.
    fn close(&self, clean: bool);

    /// The session bound by `setup`, if any.
    fn session(&self) -> Option<Arc<Session>>;

    fn bind_session(&self, session: Arc<Session>);

    /// CleanSession flag recorded at CONNECT.
    fn clean(&self) -> bool;

    fn set_clean(&self, clean: bool);
}

/// Shared handle to a connected client.
pub type ClientRef = Arc<dyn Client>;

/// Provides queuing and session storage to the broker and its clients.
pub trait Backend: Send + Sync + 'static {
    /// Check the supplied credentials. `Ok(false)` rejects the connection
    /// with CONNACK NotAuthorized.
    fn authenticate(
        &self,
        client: &ClientRef,
        username: Option<&str>,
        password: Option<&[u8]>,
    ) -> Result<bool>;

    /// Look up or create the session for `id`, bind it to the client and
    /// return whether stored state was resumed. An empty id yields a fresh
    /// session that is not registered. Any previous client using the same
    /// id is closed cleanly.
    fn setup(&self, client: &ClientRef, id: &str, clean: bool) -> Result<(Arc<Session>, bool)>;

    /// Register the client for the filter and return the retained messages
    /// whose topic matches it.
    fn subscribe(&self, client: &ClientRef, filter: &str) -> Result<Vec<Message>>;

    fn unsubscribe(&self, client: &ClientRef, filter: &str) -> Result<()>;

    /// Route a message: update the retained store, deliver to online
    /// subscribers, and queue for matching offline sessions.
    fn publish(&self, client: &ClientRef, msg: &Message) -> Result<()>;

    /// Called when the client goes offline: drop its live subscriptions and
    /// either reset the session or convert its QoS >= 1 subscriptions into
    /// offline subscriptions.
    fn terminate(&self, client: &ClientRef) -> Result<()>;
}

/// Client value stored in the live queue; identity is the connection.
#[derive(Clone)]
struct QueuedClient(ClientRef);

impl PartialEq for QueuedClient {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

/// Session value stored in the offline queue; identity is the session
/// allocation.
#[derive(Clone)]
struct QueuedSession(Arc<Session>);

impl PartialEq for QueuedSession {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

/// A backend that stores everything in memory.
pub struct MemoryBackend {
    /// user -> password. When unset, every connection is allowed.
    logins: Option<AHashMap<String, String>>,
    /// Live subscriptions: filter -> connected clients.
    queue: Tree<QueuedClient>,
    /// Retained messages: concrete topic -> last retained message.
    retained: Tree<Message>,
    /// Offline subscriptions: filter -> persistent sessions.
    offline_queue: Tree<QueuedSession>,
    /// Persistent sessions by client id.
    sessions: Mutex<AHashMap<String, Arc<Session>>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self {
            logins: None,
            queue: Tree::new(),
            retained: Tree::new(),
            offline_queue: Tree::new(),
            sessions: Mutex::new(AHashMap::new()),
        }
    }

    /// Restrict connections to the supplied user/password pairs.
    pub fn with_logins<I>(logins: I) -> Self
    where
        I: IntoIterator<Item = (String, String)>,
    {
        Self {
            logins: Some(logins.into_iter().collect()),
            ..Self::new()
        }
    }
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl Backend for MemoryBackend {
    fn authenticate(
        &self,
        _client: &ClientRef,
        username: Option<&str>,
        password: Option<&[u8]>,
    ) -> Result<bool> {
        // allow all if there are no logins
        let Some(logins) = &self.logins else {
            return Ok(true);
        };

        let (Some(username), Some(password)) = (username, password) else {
            return Ok(false);
        };

        Ok(logins
            .get(username)
            .is_some_and(|stored| constant_time_eq(stored.as_bytes(), password)))
    }

    fn setup(&self, client: &ClientRef, id: &str, clean: bool) -> Result<(Arc<Session>, bool)> {
        client.set_clean(clean);

        // a zero-length id gets a temporary session that is not stored
        if id.is_empty() {
            let session = Arc::new(Session::new());
            session.attach_client(client);
            client.bind_session(session.clone());
            return Ok((session, false));
        }

        let mut evicted = None;
        let (session, resumed) = {
            let mut sessions = self.sessions.lock();

            if let Some(session) = sessions.get(id).cloned() {
                evicted = session.attach_client(client);

                if clean {
                    session.reset();
                }

                // the session is no longer offline
                self.offline_queue.clear(&QueuedSession(session.clone()));

                // restore live routing for the stored subscriptions (no
                // retained re-delivery on resume)
                for (filter, _) in session.all_subscriptions() {
                    self.queue.add(&filter, QueuedClient(client.clone()));
                }

                (session, true)
            } else {
                let session = Arc::new(Session::new());
                session.attach_client(client);
                sessions.insert(id.to_string(), session.clone());
                (session, false)
            }
        };

        client.bind_session(session.clone());

        // the evicted client's terminate path takes the registry lock, so
        // its close happens after the lock is released
        if let Some(previous) = evicted {
            debug!("closing previous client for id {:?}", id);
            previous.close(true);
        }

        if resumed {
            // forward missed messages without holding up the CONNECT
            let client = client.clone();
            let session = session.clone();
            thread::Builder::new()
                .name("missed-replay".to_string())
                .spawn(move || {
                    for msg in session.take_missed() {
                        if !client.publish(&msg) {
                            warn!("missed-message replay interrupted");
                            break;
                        }
                    }
                })?;
        }

        Ok((session, resumed))
    }

    fn subscribe(&self, client: &ClientRef, filter: &str) -> Result<Vec<Message>> {
        self.queue.add(filter, QueuedClient(client.clone()));
        Ok(self.retained.search(filter))
    }

    fn unsubscribe(&self, client: &ClientRef, filter: &str) -> Result<()> {
        self.queue.remove(filter, &QueuedClient(client.clone()));
        Ok(())
    }

    fn publish(&self, _client: &ClientRef, msg: &Message) -> Result<()> {
        if msg.retain {
            if msg.payload.is_empty() {
                self.retained.empty(&msg.topic);
            } else {
                self.retained.set(&msg.topic, msg.clone());
            }
        }

        // deliver to online subscribers
        for QueuedClient(subscriber) in self.queue.matches(&msg.topic) {
            subscriber.publish(msg);
        }

        // queue for offline sessions
        for QueuedSession(session) in self.offline_queue.matches(&msg.topic) {
            session.queue_missed(msg.clone());
        }

        Ok(())
    }

    fn terminate(&self, client: &ClientRef) -> Result<()> {
        self.queue.clear(&QueuedClient(client.clone()));

        let Some(session) = client.session() else {
            return Ok(());
        };

        // serialized with setup so a takeover cannot interleave
        let _sessions = self.sessions.lock();

        // a later client may already own this session; its state is no
        // longer ours to touch
        if !session.detach_client(client) {
            return Ok(());
        }

        if client.clean() {
            session.reset();
            return Ok(());
        }

        // convert QoS >= 1 subscriptions into offline subscriptions
        for (filter, qos) in session.all_subscriptions() {
            if qos >= QoS::AtLeastOnce {
                self.offline_queue.add(&filter, QueuedSession(session.clone()));
            }
        }

        Ok(())
    }
}

/// Compare two byte strings without an early exit on mismatch.
fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}
