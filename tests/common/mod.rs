//! Raw MQTT client for driving the broker over real TCP connections.
//!
//! Deliberately low-level: every packet is visible to the test, so QoS
//! handshakes can be broken off halfway to exercise resend behavior.

use std::collections::VecDeque;
use std::io::{ErrorKind, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use bytes::Bytes;
use mqrelay::packet::{
    self, Connack, Connect, Message, Packet, Publish, QoS, Suback, Subscribe, Unsubscribe,
};
use mqrelay::Broker;

/// How long a test read may block before the test is declared stuck.
const READ_TIMEOUT: Duration = Duration::from_secs(5);

/// Bind an ephemeral port and serve exactly `num` connections.
pub fn run_broker(broker: Broker, num: usize) -> (SocketAddr, JoinHandle<()>) {
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
    let addr = listener.local_addr().expect("local addr");

    let handle = thread::spawn(move || {
        for _ in 0..num {
            let (stream, _) = listener.accept().expect("accept");
            broker.handle(stream);
        }
    });

    (addr, handle)
}

pub fn message(topic: &str, payload: &[u8], qos: QoS, retain: bool) -> Message {
    Message {
        topic: topic.to_string(),
        payload: Bytes::copy_from_slice(payload),
        qos,
        retain,
    }
}

pub struct TestClient {
    stream: TcpStream,
    read_buf: Vec<u8>,
    read_pos: usize,
    /// Packets read past while waiting for a specific one.
    pending: VecDeque<Packet>,
    next_packet_id: u16,
}

impl TestClient {
    pub fn dial(addr: SocketAddr) -> Self {
        let stream = TcpStream::connect(addr).expect("connect");
        stream.set_read_timeout(Some(READ_TIMEOUT)).expect("timeout");
        stream.set_nodelay(true).expect("nodelay");
        Self {
            stream,
            read_buf: vec![0u8; 1024],
            read_pos: 0,
            pending: VecDeque::new(),
            next_packet_id: 0,
        }
    }

    pub fn next_packet_id(&mut self) -> u16 {
        self.next_packet_id += 1;
        self.next_packet_id
    }

    pub fn send(&mut self, packet: Packet) {
        let mut buf = Vec::new();
        packet::encode_packet(&packet, &mut buf);
        self.stream.write_all(&buf).expect("send");
    }

    /// Next packet, in arrival order.
    pub fn receive(&mut self) -> Packet {
        if let Some(packet) = self.pending.pop_front() {
            return packet;
        }
        self.read_packet().expect("connection closed while receiving")
    }

    /// Wait for a packet matching the predicate, buffering everything else.
    pub fn wait_for(&mut self, mut pred: impl FnMut(&Packet) -> bool) -> Packet {
        if let Some(at) = self.pending.iter().position(&mut pred) {
            return self.pending.remove(at).expect("indexed");
        }
        loop {
            let packet = self.read_packet().expect("connection closed while waiting");
            if pred(&packet) {
                return packet;
            }
            self.pending.push_back(packet);
        }
    }

    /// Assert the broker sends nothing (within a short window).
    pub fn expect_silence(&mut self) {
        assert!(self.pending.is_empty(), "unexpected buffered packet");
        self.stream
            .set_read_timeout(Some(Duration::from_millis(200)))
            .expect("timeout");
        if let Some(packet) = self.read_packet() {
            panic!("expected silence, got {:?}", packet);
        }
        self.stream.set_read_timeout(Some(READ_TIMEOUT)).expect("timeout");
    }

    /// Assert the broker closes the connection without further packets.
    pub fn expect_closed(&mut self) {
        assert!(self.pending.is_empty(), "unexpected buffered packet");
        if let Some(packet) = self.read_packet() {
            panic!("expected close, got {:?}", packet);
        }
    }

    /// CONNECT and wait for the CONNACK.
    pub fn connect(&mut self, client_id: &str, clean_session: bool) -> Connack {
        self.connect_with(Connect {
            protocol_name: "MQTT".to_string(),
            protocol_version: 4,
            clean_session,
            keep_alive: 0,
            client_id: client_id.to_string(),
            will: None,
            username: None,
            password: None,
        })
    }

    pub fn connect_with(&mut self, connect: Connect) -> Connack {
        self.send(Packet::Connect(connect));
        let packet = self.wait_for(|p| matches!(p, Packet::Connack(_)));
        match packet {
            Packet::Connack(connack) => connack,
            _ => unreachable!(),
        }
    }

    pub fn subscribe(&mut self, filter: &str, qos: QoS) -> Suback {
        self.subscribe_many(&[(filter, qos)])
    }

    pub fn subscribe_many(&mut self, filters: &[(&str, QoS)]) -> Suback {
        let packet_id = self.next_packet_id();
        self.send(Packet::Subscribe(Subscribe {
            packet_id,
            filters: filters
                .iter()
                .map(|(f, q)| (f.to_string(), *q))
                .collect(),
        }));
        let packet = self.wait_for(
            |p| matches!(p, Packet::Suback(suback) if suback.packet_id == packet_id),
        );
        match packet {
            Packet::Suback(suback) => suback,
            _ => unreachable!(),
        }
    }

    pub fn unsubscribe(&mut self, filter: &str) {
        let packet_id = self.next_packet_id();
        self.send(Packet::Unsubscribe(Unsubscribe {
            packet_id,
            filters: vec![filter.to_string()],
        }));
        self.wait_for(|p| matches!(p, Packet::Unsuback { packet_id: id } if *id == packet_id));
    }

    /// PUBLISH with the full acknowledgement handshake for the QoS.
    pub fn publish(&mut self, msg: Message) {
        let packet_id = if msg.qos == QoS::AtMostOnce {
            None
        } else {
            Some(self.next_packet_id())
        };
        let qos = msg.qos;

        self.send(Packet::Publish(Publish {
            dup: false,
            packet_id,
            message: msg,
        }));

        match qos {
            QoS::AtMostOnce => {}
            QoS::AtLeastOnce => {
                let id = packet_id.expect("id");
                self.wait_for(|p| matches!(p, Packet::Puback { packet_id } if *packet_id == id));
            }
            QoS::ExactlyOnce => {
                let id = packet_id.expect("id");
                self.wait_for(|p| matches!(p, Packet::Pubrec { packet_id } if *packet_id == id));
                self.send(Packet::Pubrel { packet_id: id });
                self.wait_for(|p| matches!(p, Packet::Pubcomp { packet_id } if *packet_id == id));
            }
        }
    }

    /// Wait for the next inbound PUBLISH.
    pub fn expect_publish(&mut self) -> Publish {
        let packet = self.wait_for(|p| matches!(p, Packet::Publish(_)));
        match packet {
            Packet::Publish(publish) => publish,
            _ => unreachable!(),
        }
    }

    /// Run the receiver's half of the acknowledgement handshake.
    pub fn ack_publish(&mut self, publish: &Publish) {
        match publish.message.qos {
            QoS::AtMostOnce => {}
            QoS::AtLeastOnce => {
                let id = publish.packet_id.expect("id");
                self.send(Packet::Puback { packet_id: id });
            }
            QoS::ExactlyOnce => {
                let id = publish.packet_id.expect("id");
                self.send(Packet::Pubrec { packet_id: id });
                self.wait_for(|p| matches!(p, Packet::Pubrel { packet_id } if *packet_id == id));
                self.send(Packet::Pubcomp { packet_id: id });
            }
        }
    }

    /// Receive a PUBLISH and complete its handshake.
    pub fn expect_message(&mut self) -> Publish {
        let publish = self.expect_publish();
        self.ack_publish(&publish);
        publish
    }

    /// Graceful disconnect: send DISCONNECT and wait for the broker to
    /// finish tearing the connection down, so session state is settled when
    /// this returns.
    pub fn disconnect(mut self) {
        self.send(Packet::Disconnect);
        while self.read_packet().is_some() {}
    }

    /// Abrupt close, as if the client crashed.
    pub fn kill(self) {
        let _ = self.stream.shutdown(Shutdown::Both);
    }

    /// Read one packet off the wire; None when the peer closed.
    fn read_packet(&mut self) -> Option<Packet> {
        loop {
            if self.read_pos > 0 {
                let data = &self.read_buf[..self.read_pos];
                if let Some((packet, consumed)) = packet::decode_packet(data).expect("decode") {
                    self.read_buf.copy_within(consumed..self.read_pos, 0);
                    self.read_pos -= consumed;
                    return Some(packet);
                }
            }

            if self.read_pos >= self.read_buf.len() {
                let new_size = self.read_buf.len() * 2;
                self.read_buf.resize(new_size, 0);
            }

            match self.stream.read(&mut self.read_buf[self.read_pos..]) {
                Ok(0) => return None,
                Ok(n) => self.read_pos += n,
                Err(e) if e.kind() == ErrorKind::WouldBlock || e.kind() == ErrorKind::TimedOut => {
                    return None;
                }
                Err(e) if e.kind() == ErrorKind::ConnectionReset => return None,
                Err(e) => panic!("read failed: {}", e),
            }
        }
    }
}
