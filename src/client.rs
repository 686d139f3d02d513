//! Per-connection client handling.
//!
//! Every accepted connection gets a reader thread driving the protocol state
//! machine and a writer thread draining a single outbound queue, so packets
//! are written in issue order. The backend sees the connection only through
//! [`ClientHandle`].

use std::io::{Read, Write};
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::panic;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crossbeam_channel::{unbounded, Receiver, Sender};
use log::{debug, trace, warn};
use parking_lot::Mutex;

use crate::backend::{Backend, Client, ClientRef};
use crate::error::{Error, ProtocolError, Result};
use crate::packet::{
    self, Connack, ConnackCode, Connect, Message, Packet, Publish, QoS, Suback, Subscribe,
    Unsubscribe,
};
use crate::session::{Direction, Session};

/// Initial read buffer size.
const INITIAL_BUFFER_SIZE: usize = 1024;

/// SUBACK return code for a rejected filter.
const SUBACK_FAILURE: u8 = 0x80;

/// Connection id source, used for identity in the topic trees and for
/// thread names.
static NEXT_CLIENT_ID: AtomicU64 = AtomicU64::new(1);

/// Client connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ClientState {
    /// Waiting for CONNECT.
    Connecting,
    /// Handshake complete, normal dispatch.
    Connected,
    /// Terminal.
    Disconnected,
}

/// Outbound events consumed by the writer thread.
enum OutboundEvent {
    Packet(Packet),
    Close,
}

/// The backend's view of a connected client: an identity, an outbound
/// queue, and the bound session.
pub struct ClientHandle {
    id: u64,
    remote_addr: SocketAddr,
    tx: Sender<OutboundEvent>,
    /// Clone of the connection socket, used to force the reader loop out of
    /// a blocking read on close.
    stream: TcpStream,
    session: Mutex<Option<Arc<Session>>>,
    /// CleanSession flag from CONNECT.
    clean: AtomicBool,
    /// Set by a clean close (session takeover); suppresses the will.
    will_discarded: AtomicBool,
    closed: AtomicBool,
}

impl ClientHandle {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    fn will_discarded(&self) -> bool {
        self.will_discarded.load(Ordering::Relaxed)
    }

    /// Queue an outbound packet; the writer thread preserves issue order.
    fn send(&self, packet: Packet) -> bool {
        self.tx.send(OutboundEvent::Packet(packet)).is_ok()
    }

    /// Stop the writer after it drained the queue. Used on the connection's
    /// own exit path, where pending packets must still reach the wire.
    fn finish(&self) {
        self.closed.store(true, Ordering::Relaxed);
        let _ = self.tx.send(OutboundEvent::Close);
    }
}

impl Client for ClientHandle {
    /// Deliver a message to this client.
    ///
    /// The QoS is downgraded to the highest granted QoS among the session's
    /// matching subscriptions; QoS > 0 deliveries allocate a packet id and
    /// are tracked until acknowledged. Returns false once the client is no
    /// longer able to accept messages.
    fn publish(&self, msg: &Message) -> bool {
        if self.closed.load(Ordering::Relaxed) {
            return false;
        }

        let Some(session) = self.session() else {
            return false;
        };

        // skip if the subscription vanished between match and delivery
        let Some(granted) = session.lookup_subscription(&msg.topic) else {
            return true;
        };

        let mut publish = Publish {
            dup: false,
            packet_id: None,
            message: Message {
                qos: msg.qos.min(granted),
                ..msg.clone()
            },
        };

        if publish.message.qos > QoS::AtMostOnce {
            let Some(id) = session.next_packet_id() else {
                // all 65535 ids in flight: the connection is hopelessly
                // backed up
                warn!("client {}: packet ids exhausted, closing", self.id);
                self.close(false);
                return false;
            };
            publish.packet_id = Some(id);
            session.save_packet(Direction::Outgoing, Packet::Publish(publish.clone()));
        }

        self.send(Packet::Publish(publish))
    }

    /// Tear down the connection. `clean` suppresses the will (used when a
    /// new client takes over the session).
    fn close(&self, clean: bool) {
        if clean {
            self.will_discarded.store(true, Ordering::Relaxed);
        }
        self.closed.store(true, Ordering::Relaxed);
        let _ = self.tx.send(OutboundEvent::Close);
        // unblocks the reader thread
        let _ = self.stream.shutdown(Shutdown::Both);
    }

    /// The session bound by `setup`, if the handshake got that far.
    fn session(&self) -> Option<Arc<Session>> {
        self.session.lock().clone()
    }

    fn bind_session(&self, session: Arc<Session>) {
        *self.session.lock() = Some(session);
    }

    /// CleanSession flag recorded at CONNECT.
    fn clean(&self) -> bool {
        self.clean.load(Ordering::Relaxed)
    }

    fn set_clean(&self, clean: bool) {
        self.clean.store(clean, Ordering::Relaxed);
    }
}

/// Spawn the reader and writer threads for an accepted connection.
pub(crate) fn spawn(
    backend: Arc<dyn Backend>,
    connect_timeout: Duration,
    stream: TcpStream,
) -> Result<()> {
    let id = NEXT_CLIENT_ID.fetch_add(1, Ordering::Relaxed);
    let remote_addr = stream.peer_addr()?;
    stream.set_nodelay(true)?;

    let (tx, rx) = unbounded();

    let handle = Arc::new(ClientHandle {
        id,
        remote_addr,
        tx,
        stream: stream.try_clone()?,
        session: Mutex::new(None),
        clean: AtomicBool::new(false),
        will_discarded: AtomicBool::new(false),
        closed: AtomicBool::new(false),
    });

    let writer_stream = stream.try_clone()?;
    thread::Builder::new()
        .name(format!("writer-{}", id))
        .spawn(move || writer_loop(writer_stream, rx))?;

    let client_ref: ClientRef = handle.clone();

    let client = RemoteClient {
        backend,
        handle,
        client: client_ref,
        stream,
        read_buf: vec![0u8; INITIAL_BUFFER_SIZE],
        read_pos: 0,
        state: ClientState::Connecting,
        will: None,
        registered: false,
        connect_timeout,
    };

    thread::Builder::new()
        .name(format!("client-{}", id))
        .spawn(move || client.run())?;

    Ok(())
}

/// Drain the outbound queue onto the socket.
fn writer_loop(mut stream: TcpStream, rx: Receiver<OutboundEvent>) {
    let mut buf = Vec::with_capacity(INITIAL_BUFFER_SIZE);

    for event in rx {
        match event {
            OutboundEvent::Packet(packet) => {
                buf.clear();
                packet::encode_packet(&packet, &mut buf);
                if stream.write_all(&buf).is_err() {
                    break;
                }
            }
            OutboundEvent::Close => break,
        }
    }

    let _ = stream.shutdown(Shutdown::Both);
}

/// The protocol state machine driven by the connection's reader thread.
struct RemoteClient {
    backend: Arc<dyn Backend>,
    handle: Arc<ClientHandle>,
    /// The same handle, as the backend sees it.
    client: ClientRef,
    stream: TcpStream,
    read_buf: Vec<u8>,
    read_pos: usize,
    state: ClientState,
    /// Will recorded at CONNECT; cleared by a graceful DISCONNECT.
    will: Option<Message>,
    /// Whether `Backend::setup` completed, i.e. terminate is owed.
    registered: bool,
    connect_timeout: Duration,
}

impl RemoteClient {
    fn run(mut self) {
        // a panicking connection must still release its session and fire
        // the will
        let result = panic::catch_unwind(panic::AssertUnwindSafe(|| self.process()))
            .unwrap_or_else(|_| {
                Err(Error::Io(std::io::Error::other("connection task panicked")))
            });
        self.state = ClientState::Disconnected;

        match &result {
            Ok(()) => debug!("client {}: disconnected", self.handle.id),
            Err(e) => debug!("client {}: connection lost: {}", self.handle.id, e),
        }

        // will fires on any ungraceful exit; DISCONNECT already cleared it
        // and a session takeover marks it discarded
        if let Some(will) = self.will.take() {
            if !self.handle.will_discarded() {
                if let Err(e) = self.backend.publish(&self.client, &will) {
                    warn!("client {}: will delivery failed: {}", self.handle.id, e);
                }
            }
        }

        if self.registered {
            if let Err(e) = self.backend.terminate(&self.client) {
                warn!("client {}: terminate failed: {}", self.handle.id, e);
            }
        }

        // let the writer drain (a rejecting CONNACK must still go out)
        self.handle.finish();
    }

    fn process(&mut self) -> Result<()> {
        // the CONNECT must arrive promptly
        self.stream.set_read_timeout(Some(self.connect_timeout))?;

        while self.state != ClientState::Disconnected {
            let packet = self.receive()?;
            self.handle_packet(packet)?;
        }

        Ok(())
    }

    fn handle_packet(&mut self, packet: Packet) -> Result<()> {
        match (self.state, packet) {
            (ClientState::Connecting, Packet::Connect(connect)) => self.handle_connect(connect),
            (ClientState::Connecting, _) => Err(ProtocolError::ConnectExpected.into()),
            (ClientState::Connected, packet) => self.dispatch(packet),
            (ClientState::Disconnected, _) => Ok(()),
        }
    }

    /// Process the CONNECT handshake. A rejected connection gets a CONNACK
    /// with the reason code and goes straight to Disconnected; no session
    /// was set up, so no will or terminate follows.
    fn handle_connect(&mut self, connect: Connect) -> Result<()> {
        if connect.protocol_name != "MQTT" || connect.protocol_version != 4 {
            debug!(
                "client {}: unsupported protocol {} level {}",
                self.handle.id, connect.protocol_name, connect.protocol_version
            );
            self.send_connack(ConnackCode::UnacceptableProtocolVersion, false);
            self.state = ClientState::Disconnected;
            return Ok(());
        }

        // MQTT-3.1.3-7: zero-length client id requires CleanSession=1
        if connect.client_id.is_empty() && !connect.clean_session {
            self.send_connack(ConnackCode::IdentifierRejected, false);
            self.state = ClientState::Disconnected;
            return Ok(());
        }

        let allowed = self.backend.authenticate(
            &self.client,
            connect.username.as_deref(),
            connect.password.as_deref(),
        )?;
        if !allowed {
            debug!(
                "client {}: authentication failed for {:?}",
                self.handle.id, connect.username
            );
            self.send_connack(ConnackCode::NotAuthorized, false);
            self.state = ClientState::Disconnected;
            return Ok(());
        }

        let (session, resumed) =
            self.backend
                .setup(&self.client, &connect.client_id, connect.clean_session)?;
        self.registered = true;

        self.will = connect.will;

        debug!(
            "client {} ({:?}): connected from {}, clean={}, resumed={}",
            self.handle.id, connect.client_id, self.handle.remote_addr, connect.clean_session, resumed
        );

        // MQTT-3.2.2-2: session present only when resuming stored state
        self.send_connack(
            ConnackCode::Accepted,
            resumed && !connect.clean_session,
        );

        self.resume_pending(&session);

        self.state = ClientState::Connected;

        // keep-alive: the client must show activity within 1.5x the interval
        let read_timeout = if connect.keep_alive > 0 {
            Some(Duration::from_millis(u64::from(connect.keep_alive) * 1500))
        } else {
            None
        };
        self.stream.set_read_timeout(read_timeout)?;

        Ok(())
    }

    /// Re-send unacknowledged outbound packets after a reconnect: PUBLISH
    /// with the DUP flag, or the bare PUBREL where a PUBREC already came
    /// back.
    fn resume_pending(&mut self, session: &Arc<Session>) {
        for stored in session.all_packets(Direction::Outgoing) {
            match stored {
                Packet::Publish(mut publish) => {
                    publish.dup = true;
                    trace!(
                        "client {}: resending PUBLISH id={:?}",
                        self.handle.id,
                        publish.packet_id
                    );
                    self.handle.send(Packet::Publish(publish));
                }
                Packet::Pubrel { packet_id } => {
                    trace!("client {}: resending PUBREL id={}", self.handle.id, packet_id);
                    self.handle.send(Packet::Pubrel { packet_id });
                }
                _ => {}
            }
        }
    }

    /// Dispatch one packet in the Connected state.
    fn dispatch(&mut self, packet: Packet) -> Result<()> {
        let session = self
            .handle
            .session()
            .ok_or_else(|| Error::Backend("no session bound".into()))?;

        match packet {
            Packet::Publish(publish) => self.handle_publish(&session, publish)?,

            Packet::Puback { packet_id } => {
                session.delete_packet(Direction::Outgoing, packet_id);
            }

            Packet::Pubrec { packet_id } => {
                // replace the stored PUBLISH with a PUBREL record at the
                // same id, so a reconnect resumes the handshake mid-way
                session.save_packet(Direction::Outgoing, Packet::Pubrel { packet_id });
                self.handle.send(Packet::Pubrel { packet_id });
            }

            Packet::Pubrel { packet_id } => {
                if let Some(Packet::Publish(publish)) =
                    session.lookup_packet(Direction::Incoming, packet_id)
                {
                    self.backend.publish(&self.client, &publish.message)?;
                    session.delete_packet(Direction::Incoming, packet_id);
                }
                // answered even for an unknown id: a duplicate release after
                // the flow already completed
                self.handle.send(Packet::Pubcomp { packet_id });
            }

            Packet::Pubcomp { packet_id } => {
                session.delete_packet(Direction::Outgoing, packet_id);
            }

            Packet::Subscribe(subscribe) => self.handle_subscribe(&session, subscribe)?,

            Packet::Unsubscribe(unsub) => self.handle_unsubscribe(&session, unsub)?,

            Packet::Pingreq => {
                self.handle.send(Packet::Pingresp);
            }

            Packet::Disconnect => {
                // MQTT-3.14.4-3: a graceful disconnect discards the will
                self.will = None;
                self.state = ClientState::Disconnected;
            }

            Packet::Connect(_) => {
                // MQTT-3.1.0-2
                return Err(ProtocolError::DuplicateConnect.into());
            }

            Packet::Connack(_) | Packet::Suback(_) | Packet::Unsuback { .. } | Packet::Pingresp => {
                return Err(ProtocolError::Malformed(
                    "server-side packet received from client".into(),
                )
                .into());
            }
        }

        Ok(())
    }

    fn handle_publish(&mut self, session: &Arc<Session>, publish: Publish) -> Result<()> {
        let topic = &publish.message.topic;

        // MQTT-3.3.2-2: topic names must not contain wildcards
        if topic.contains('+') || topic.contains('#') {
            return Err(ProtocolError::WildcardInTopicName(topic.clone()).into());
        }

        match publish.message.qos {
            QoS::AtMostOnce => {
                self.backend.publish(&self.client, &publish.message)?;
            }
            QoS::AtLeastOnce => {
                let packet_id = required_packet_id(&publish)?;
                self.backend.publish(&self.client, &publish.message)?;
                self.handle.send(Packet::Puback { packet_id });
            }
            QoS::ExactlyOnce => {
                let packet_id = required_packet_id(&publish)?;
                // exactly-once: defer the publish until PUBREL, and treat a
                // repeated id as the retransmission it is
                if session.lookup_packet(Direction::Incoming, packet_id).is_none() {
                    session.save_packet(Direction::Incoming, Packet::Publish(publish));
                }
                self.handle.send(Packet::Pubrec { packet_id });
            }
        }

        Ok(())
    }

    fn handle_subscribe(&mut self, session: &Arc<Session>, subscribe: Subscribe) -> Result<()> {
        let mut return_codes = Vec::with_capacity(subscribe.filters.len());
        let mut retained = Vec::new();

        for (filter, qos) in &subscribe.filters {
            if !valid_filter(filter) {
                return_codes.push(SUBACK_FAILURE);
                continue;
            }

            session.save_subscription(filter, *qos);
            retained.extend(self.backend.subscribe(&self.client, filter)?);
            return_codes.push(*qos as u8);
        }

        self.handle.send(Packet::Suback(Suback {
            packet_id: subscribe.packet_id,
            return_codes,
        }));

        // MQTT-3.3.1-8: retained messages follow the SUBACK
        for msg in retained {
            self.handle.publish(&msg);
        }

        Ok(())
    }

    fn handle_unsubscribe(&mut self, session: &Arc<Session>, unsub: Unsubscribe) -> Result<()> {
        for filter in &unsub.filters {
            session.delete_subscription(filter);
            self.backend.unsubscribe(&self.client, filter)?;
        }

        self.handle.send(Packet::Unsuback {
            packet_id: unsub.packet_id,
        });

        Ok(())
    }

    fn send_connack(&self, code: ConnackCode, session_present: bool) {
        self.handle.send(Packet::Connack(Connack {
            session_present,
            code,
        }));
    }

    /// Blocking read of the next complete packet.
    fn receive(&mut self) -> Result<Packet> {
        loop {
            if self.read_pos > 0 {
                let data = &self.read_buf[..self.read_pos];
                if let Some((packet, consumed)) = packet::decode_packet(data)? {
                    self.read_buf.copy_within(consumed..self.read_pos, 0);
                    self.read_pos -= consumed;
                    return Ok(packet);
                }
            }

            if self.read_pos >= self.read_buf.len() {
                let new_size = self.read_buf.len() * 2;
                self.read_buf.resize(new_size, 0);
            }

            let n = self.stream.read(&mut self.read_buf[self.read_pos..])?;
            if n == 0 {
                return Err(Error::Io(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "connection closed",
                )));
            }
            self.read_pos += n;
        }
    }
}

fn required_packet_id(publish: &Publish) -> Result<u16> {
    publish
        .packet_id
        .ok_or_else(|| ProtocolError::Malformed("QoS > 0 PUBLISH without packet id".into()).into())
}

/// A filter is valid when `#` only appears alone as the final level and `+`
/// only appears alone within a level.
fn valid_filter(filter: &str) -> bool {
    let levels: Vec<&str> = filter.split('/').collect();
    for (i, level) in levels.iter().enumerate() {
        match *level {
            "#" => {
                if i != levels.len() - 1 {
                    return false;
                }
            }
            "+" => {}
            _ => {
                if level.contains('#') || level.contains('+') {
                    return false;
                }
            }
        }
    }
    true
}
