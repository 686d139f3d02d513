//! MQTT 3.1.1 packet types and codec.
//!
//! The codec is symmetric: every control packet can be decoded and encoded,
//! so the broker and test clients share the same wire representation.

use bytes::Bytes;

use crate::error::{ProtocolError, Result};

/// MQTT Control Packet Types (4 bits).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PacketType {
    Connect = 1,
    Connack = 2,
    Publish = 3,
    Puback = 4,
    Pubrec = 5,
    Pubrel = 6,
    Pubcomp = 7,
    Subscribe = 8,
    Suback = 9,
    Unsubscribe = 10,
    Unsuback = 11,
    Pingreq = 12,
    Pingresp = 13,
    Disconnect = 14,
}

impl TryFrom<u8> for PacketType {
    type Error = ProtocolError;

    fn try_from(value: u8) -> std::result::Result<Self, Self::Error> {
        match value {
            1 => Ok(PacketType::Connect),
            2 => Ok(PacketType::Connack),
            3 => Ok(PacketType::Publish),
            4 => Ok(PacketType::Puback),
            5 => Ok(PacketType::Pubrec),
            6 => Ok(PacketType::Pubrel),
            7 => Ok(PacketType::Pubcomp),
            8 => Ok(PacketType::Subscribe),
            9 => Ok(PacketType::Suback),
            10 => Ok(PacketType::Unsubscribe),
            11 => Ok(PacketType::Unsuback),
            12 => Ok(PacketType::Pingreq),
            13 => Ok(PacketType::Pingresp),
            14 => Ok(PacketType::Disconnect),
            _ => Err(ProtocolError::UnknownPacketType(value)),
        }
    }
}

/// Quality of Service levels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
#[repr(u8)]
#[allow(clippy::enum_variant_names)] // MQTT spec names
pub enum QoS {
    #[default]
    AtMostOnce = 0,
    AtLeastOnce = 1,
    ExactlyOnce = 2,
}

impl TryFrom<u8> for QoS {
    type Error = ProtocolError;

    fn try_from(value: u8) -> std::result::Result<Self, Self::Error> {
        match value {
            0 => Ok(QoS::AtMostOnce),
            1 => Ok(QoS::AtLeastOnce),
            2 => Ok(QoS::ExactlyOnce),
            _ => Err(ProtocolError::Malformed(format!("QoS out of range: {}", value))),
        }
    }
}

/// CONNACK return codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnackCode {
    Accepted = 0,
    UnacceptableProtocolVersion = 1,
    IdentifierRejected = 2,
    ServerUnavailable = 3,
    BadUsernamePassword = 4,
    NotAuthorized = 5,
}

impl TryFrom<u8> for ConnackCode {
    type Error = ProtocolError;

    fn try_from(value: u8) -> std::result::Result<Self, Self::Error> {
        match value {
            0 => Ok(ConnackCode::Accepted),
            1 => Ok(ConnackCode::UnacceptableProtocolVersion),
            2 => Ok(ConnackCode::IdentifierRejected),
            3 => Ok(ConnackCode::ServerUnavailable),
            4 => Ok(ConnackCode::BadUsernamePassword),
            5 => Ok(ConnackCode::NotAuthorized),
            _ => Err(ProtocolError::Malformed(format!(
                "CONNACK return code out of range: {}",
                value
            ))),
        }
    }
}

/// An application message as routed by the broker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub topic: String,
    pub payload: Bytes,
    pub qos: QoS,
    pub retain: bool,
}

/// MQTT Packets.
#[derive(Debug, Clone)]
pub enum Packet {
    Connect(Connect),
    Connack(Connack),
    Publish(Publish),
    Puback { packet_id: u16 },
    Pubrec { packet_id: u16 },
    Pubrel { packet_id: u16 },
    Pubcomp { packet_id: u16 },
    Subscribe(Subscribe),
    Suback(Suback),
    Unsubscribe(Unsubscribe),
    Unsuback { packet_id: u16 },
    Pingreq,
    Pingresp,
    Disconnect,
}

/// CONNECT packet data.
///
/// Protocol name and version are carried as decoded; validating them against
/// MQTT 3.1.1 is the connection handshake's job, which must answer with the
/// proper CONNACK code rather than drop the packet.
#[derive(Debug, Clone)]
pub struct Connect {
    pub protocol_name: String,
    pub protocol_version: u8,
    pub clean_session: bool,
    pub keep_alive: u16,
    pub client_id: String,
    pub will: Option<Message>,
    pub username: Option<String>,
    pub password: Option<Vec<u8>>,
}

/// CONNACK packet data.
#[derive(Debug, Clone)]
pub struct Connack {
    pub session_present: bool,
    pub code: ConnackCode,
}

/// PUBLISH packet data.
#[derive(Debug, Clone)]
pub struct Publish {
    pub dup: bool,
    pub packet_id: Option<u16>,
    pub message: Message,
}

/// SUBSCRIBE packet data.
#[derive(Debug, Clone)]
pub struct Subscribe {
    pub packet_id: u16,
    pub filters: Vec<(String, QoS)>,
}

/// SUBACK packet data.
#[derive(Debug, Clone)]
pub struct Suback {
    pub packet_id: u16,
    pub return_codes: Vec<u8>,
}

/// UNSUBSCRIBE packet data.
#[derive(Debug, Clone)]
pub struct Unsubscribe {
    pub packet_id: u16,
    pub filters: Vec<String>,
}

// === Field readers ===
//
// Each reader consumes its field from the front of the input slice, so a
// packet body is parsed by threading one `&mut &[u8]` through them. Whatever
// is left over when the readers are done is the payload (or, for most
// packets, must be nothing).

fn take_u8(input: &mut &[u8]) -> Result<u8> {
    let (&first, tail) = input.split_first().ok_or(ProtocolError::Truncated)?;
    *input = tail;
    Ok(first)
}

fn take_u16(input: &mut &[u8]) -> Result<u16> {
    let raw = take_bytes(input, 2)?;
    Ok(u16::from(raw[0]) << 8 | u16::from(raw[1]))
}

fn take_bytes<'a>(input: &mut &'a [u8], count: usize) -> Result<&'a [u8]> {
    if input.len() < count {
        return Err(ProtocolError::Truncated.into());
    }
    let (head, tail) = input.split_at(count);
    *input = tail;
    Ok(head)
}

/// Length-prefixed UTF-8 string. U+0000 is banned anywhere in an MQTT
/// string.
fn take_str(input: &mut &[u8]) -> Result<String> {
    let count = take_u16(input)? as usize;
    let raw = take_bytes(input, count)?;
    if raw.iter().any(|&b| b == 0) {
        return Err(ProtocolError::Malformed("string contains U+0000".into()).into());
    }
    String::from_utf8(raw.to_vec()).map_err(|_| ProtocolError::NotUtf8.into())
}

/// Length-prefixed binary data.
fn take_blob(input: &mut &[u8]) -> Result<Vec<u8>> {
    let count = take_u16(input)? as usize;
    Ok(take_bytes(input, count)?.to_vec())
}

/// Non-empty, null-free topic filter.
fn take_filter(input: &mut &[u8]) -> Result<String> {
    let filter = take_str(input)?;
    // MQTT-4.7.3-1
    if filter.is_empty() {
        return Err(ProtocolError::Malformed("empty topic filter".into()).into());
    }
    Ok(filter)
}

// === Length field ===

/// Parse the variable-length body length that follows the first header
/// byte. Returns the body length and the number of bytes the field itself
/// occupied, or None while the field is still incomplete.
pub fn read_packet_length(buf: &[u8]) -> Result<Option<(usize, usize)>> {
    let mut length = 0usize;
    for (used, &b) in buf.iter().enumerate() {
        // at most four length bytes
        if used == 4 {
            return Err(ProtocolError::BadLengthField.into());
        }
        length |= usize::from(b & 0x7F) << (7 * used);
        if b & 0x80 == 0 {
            return Ok(Some((length, used + 1)));
        }
    }
    Ok(None)
}

/// Append the variable-length encoding of a body length.
fn write_packet_length(mut length: usize, out: &mut Vec<u8>) {
    loop {
        let septet = (length & 0x7F) as u8;
        length >>= 7;
        out.push(if length > 0 { septet | 0x80 } else { septet });
        if length == 0 {
            break;
        }
    }
}

// === Decoding ===

/// Try to decode a complete packet from the buffer.
/// Returns Ok(Some((packet, bytes_consumed))) if successful,
/// Ok(None) if more data is needed, or Err on protocol errors.
pub fn decode_packet(buf: &[u8]) -> Result<Option<(Packet, usize)>> {
    let Some((&head, after_head)) = buf.split_first() else {
        return Ok(None);
    };

    let Some((body_len, len_bytes)) = read_packet_length(after_head)? else {
        return Ok(None);
    };

    let frame_len = 1 + len_bytes + body_len;
    if buf.len() < frame_len {
        return Ok(None);
    }

    let kind = PacketType::try_from(head >> 4)?;
    let low_bits = head & 0x0F;
    let body = &buf[1 + len_bytes..frame_len];

    // MQTT-3.6.1-1, MQTT-3.8.1-1, MQTT-3.10.1-1: these three carry fixed
    // flags of 0010
    let needs_flag_bits = matches!(
        kind,
        PacketType::Pubrel | PacketType::Subscribe | PacketType::Unsubscribe
    );
    if needs_flag_bits && low_bits != 0x02 {
        return Err(ProtocolError::Malformed(format!(
            "{:?} requires fixed-header flags 0010",
            kind
        ))
        .into());
    }

    let packet = match kind {
        PacketType::Connect => decode_connect(body)?,
        PacketType::Connack => decode_connack(body)?,
        PacketType::Publish => decode_publish(low_bits, body)?,
        PacketType::Puback => Packet::Puback {
            packet_id: ack_packet_id(body)?,
        },
        PacketType::Pubrec => Packet::Pubrec {
            packet_id: ack_packet_id(body)?,
        },
        PacketType::Pubrel => Packet::Pubrel {
            packet_id: ack_packet_id(body)?,
        },
        PacketType::Pubcomp => Packet::Pubcomp {
            packet_id: ack_packet_id(body)?,
        },
        PacketType::Subscribe => decode_subscribe(body)?,
        PacketType::Suback => decode_suback(body)?,
        PacketType::Unsubscribe => decode_unsubscribe(body)?,
        PacketType::Unsuback => Packet::Unsuback {
            packet_id: ack_packet_id(body)?,
        },
        PacketType::Pingreq => Packet::Pingreq,
        PacketType::Pingresp => Packet::Pingresp,
        PacketType::Disconnect => Packet::Disconnect,
    };

    Ok(Some((packet, frame_len)))
}

fn decode_connect(body: &[u8]) -> Result<Packet> {
    let mut body = body;

    let protocol = take_str(&mut body)?;
    let level = take_u8(&mut body)?;
    let flag_bits = take_u8(&mut body)?;

    // MQTT-3.1.2-3: bit 0 of the connect flags is reserved and stays zero
    if flag_bits & 0x01 != 0 {
        return Err(ProtocolError::Malformed("CONNECT reserved flag bit is set".into()).into());
    }

    let clean = flag_bits & 0x02 != 0;
    let has_will = flag_bits & 0x04 != 0;
    let will_qos_bits = (flag_bits >> 3) & 0x03;
    let will_retained = flag_bits & 0x20 != 0;
    let has_password = flag_bits & 0x40 != 0;
    let has_username = flag_bits & 0x80 != 0;

    // MQTT-3.1.2-11 through -15: the will qos/retain bits mean nothing
    // without the will flag and must stay zero
    if !has_will && (will_qos_bits != 0 || will_retained) {
        return Err(ProtocolError::Malformed("will bits set without a will".into()).into());
    }

    // MQTT-3.1.2-22: a password is only allowed alongside a username
    if has_password && !has_username {
        return Err(
            ProtocolError::Malformed("password flag set without a username".into()).into(),
        );
    }

    let keep_alive = take_u16(&mut body)?;
    let client_id = take_str(&mut body)?;

    let will = if has_will {
        Some(Message {
            topic: take_str(&mut body)?,
            payload: Bytes::from(take_blob(&mut body)?),
            qos: QoS::try_from(will_qos_bits)?,
            retain: will_retained,
        })
    } else {
        None
    };

    let username = has_username.then(|| take_str(&mut body)).transpose()?;
    let password = has_password.then(|| take_blob(&mut body)).transpose()?;

    Ok(Packet::Connect(Connect {
        protocol_name: protocol,
        protocol_version: level,
        clean_session: clean,
        keep_alive,
        client_id,
        will,
        username,
        password,
    }))
}

fn decode_connack(body: &[u8]) -> Result<Packet> {
    let mut body = body;
    let ack_flags = take_u8(&mut body)?;
    let code = ConnackCode::try_from(take_u8(&mut body)?)?;
    Ok(Packet::Connack(Connack {
        session_present: ack_flags & 0x01 != 0,
        code,
    }))
}

fn decode_publish(low_bits: u8, body: &[u8]) -> Result<Packet> {
    let mut body = body;

    let qos = QoS::try_from((low_bits >> 1) & 0x03)?;
    let topic = take_str(&mut body)?;
    let packet_id = match qos {
        QoS::AtMostOnce => None,
        _ => Some(take_u16(&mut body)?),
    };

    // everything after the variable header is the payload
    Ok(Packet::Publish(Publish {
        dup: low_bits & 0x08 != 0,
        packet_id,
        message: Message {
            topic,
            payload: Bytes::copy_from_slice(body),
            qos,
            retain: low_bits & 0x01 != 0,
        },
    }))
}

/// The two-byte body shared by PUBACK, PUBREC, PUBREL, PUBCOMP and
/// UNSUBACK.
fn ack_packet_id(body: &[u8]) -> Result<u16> {
    let mut body = body;
    take_u16(&mut body)
}

fn decode_subscribe(body: &[u8]) -> Result<Packet> {
    let mut body = body;
    let packet_id = take_u16(&mut body)?;

    let mut filters = Vec::new();
    while !body.is_empty() {
        let filter = take_filter(&mut body)?;
        let qos = QoS::try_from(take_u8(&mut body)? & 0x03)?;
        filters.push((filter, qos));
    }

    if filters.is_empty() {
        return Err(ProtocolError::Malformed("SUBSCRIBE without filters".into()).into());
    }

    Ok(Packet::Subscribe(Subscribe { packet_id, filters }))
}

fn decode_suback(body: &[u8]) -> Result<Packet> {
    let mut body = body;
    let packet_id = take_u16(&mut body)?;
    Ok(Packet::Suback(Suback {
        packet_id,
        return_codes: body.to_vec(),
    }))
}

fn decode_unsubscribe(body: &[u8]) -> Result<Packet> {
    let mut body = body;
    let packet_id = take_u16(&mut body)?;

    let mut filters = Vec::new();
    while !body.is_empty() {
        filters.push(take_filter(&mut body)?);
    }

    if filters.is_empty() {
        return Err(ProtocolError::Malformed("UNSUBSCRIBE without filters".into()).into());
    }

    Ok(Packet::Unsubscribe(Unsubscribe { packet_id, filters }))
}

// === Encoding ===

/// Encode a packet into the provided buffer.
pub fn encode_packet(packet: &Packet, out: &mut Vec<u8>) {
    match packet {
        Packet::Connect(connect) => encode_connect(connect, out),
        Packet::Connack(connack) => encode_connack(connack, out),
        Packet::Publish(publish) => encode_publish(publish, out),
        Packet::Puback { packet_id } => encode_ack(PacketType::Puback, 0, *packet_id, out),
        Packet::Pubrec { packet_id } => encode_ack(PacketType::Pubrec, 0, *packet_id, out),
        Packet::Pubrel { packet_id } => {
            // MQTT-3.6.1-1
            encode_ack(PacketType::Pubrel, 0x02, *packet_id, out)
        }
        Packet::Pubcomp { packet_id } => encode_ack(PacketType::Pubcomp, 0, *packet_id, out),
        Packet::Subscribe(subscribe) => encode_subscribe(subscribe, out),
        Packet::Suback(suback) => encode_suback(suback, out),
        Packet::Unsubscribe(unsub) => encode_unsubscribe(unsub, out),
        Packet::Unsuback { packet_id } => encode_ack(PacketType::Unsuback, 0, *packet_id, out),
        Packet::Pingreq => encode_bare(PacketType::Pingreq, out),
        Packet::Pingresp => encode_bare(PacketType::Pingresp, out),
        Packet::Disconnect => encode_bare(PacketType::Disconnect, out),
    }
}

fn write_str(s: &str, out: &mut Vec<u8>) {
    out.extend_from_slice(&(s.len() as u16).to_be_bytes());
    out.extend_from_slice(s.as_bytes());
}

fn write_blob(data: &[u8], out: &mut Vec<u8>) {
    out.extend_from_slice(&(data.len() as u16).to_be_bytes());
    out.extend_from_slice(data);
}

fn encode_connect(connect: &Connect, out: &mut Vec<u8>) {
    let mut flag_bits = 0u8;
    if connect.clean_session {
        flag_bits |= 0x02;
    }
    if let Some(will) = &connect.will {
        flag_bits |= 0x04 | (will.qos as u8) << 3;
        if will.retain {
            flag_bits |= 0x20;
        }
    }
    if connect.password.is_some() {
        flag_bits |= 0x40;
    }
    if connect.username.is_some() {
        flag_bits |= 0x80;
    }

    // name + level + flags + keep-alive, then the payload fields
    let mut body_len = 2 + connect.protocol_name.len() + 1 + 1 + 2;
    body_len += 2 + connect.client_id.len();
    if let Some(will) = &connect.will {
        body_len += 2 + will.topic.len() + 2 + will.payload.len();
    }
    if let Some(username) = &connect.username {
        body_len += 2 + username.len();
    }
    if let Some(password) = &connect.password {
        body_len += 2 + password.len();
    }

    out.push((PacketType::Connect as u8) << 4);
    write_packet_length(body_len, out);
    write_str(&connect.protocol_name, out);
    out.push(connect.protocol_version);
    out.push(flag_bits);
    out.extend_from_slice(&connect.keep_alive.to_be_bytes());
    write_str(&connect.client_id, out);
    if let Some(will) = &connect.will {
        write_str(&will.topic, out);
        write_blob(&will.payload, out);
    }
    if let Some(username) = &connect.username {
        write_str(username, out);
    }
    if let Some(password) = &connect.password {
        write_blob(password, out);
    }
}

fn encode_connack(connack: &Connack, out: &mut Vec<u8>) {
    out.push((PacketType::Connack as u8) << 4);
    write_packet_length(2, out);
    out.push(u8::from(connack.session_present));
    out.push(connack.code as u8);
}

fn encode_publish(publish: &Publish, out: &mut Vec<u8>) {
    let msg = &publish.message;

    let mut head = (PacketType::Publish as u8) << 4 | (msg.qos as u8) << 1;
    if publish.dup {
        head |= 0x08;
    }
    if msg.retain {
        head |= 0x01;
    }
    out.push(head);

    let id_len = if msg.qos == QoS::AtMostOnce { 0 } else { 2 };
    write_packet_length(2 + msg.topic.len() + id_len + msg.payload.len(), out);

    write_str(&msg.topic, out);
    if let Some(id) = publish.packet_id {
        out.extend_from_slice(&id.to_be_bytes());
    }
    out.extend_from_slice(&msg.payload);
}

fn encode_ack(kind: PacketType, flag_bits: u8, packet_id: u16, out: &mut Vec<u8>) {
    out.push((kind as u8) << 4 | flag_bits);
    write_packet_length(2, out);
    out.extend_from_slice(&packet_id.to_be_bytes());
}

fn encode_subscribe(subscribe: &Subscribe, out: &mut Vec<u8>) {
    out.push((PacketType::Subscribe as u8) << 4 | 0x02);

    let filters_len: usize = subscribe.filters.iter().map(|(f, _)| 2 + f.len() + 1).sum();
    write_packet_length(2 + filters_len, out);

    out.extend_from_slice(&subscribe.packet_id.to_be_bytes());
    for (filter, qos) in &subscribe.filters {
        write_str(filter, out);
        out.push(*qos as u8);
    }
}

fn encode_suback(suback: &Suback, out: &mut Vec<u8>) {
    out.push((PacketType::Suback as u8) << 4);
    write_packet_length(2 + suback.return_codes.len(), out);
    out.extend_from_slice(&suback.packet_id.to_be_bytes());
    out.extend_from_slice(&suback.return_codes);
}

fn encode_unsubscribe(unsub: &Unsubscribe, out: &mut Vec<u8>) {
    out.push((PacketType::Unsubscribe as u8) << 4 | 0x02);

    let filters_len: usize = unsub.filters.iter().map(|f| 2 + f.len()).sum();
    write_packet_length(2 + filters_len, out);

    out.extend_from_slice(&unsub.packet_id.to_be_bytes());
    for filter in &unsub.filters {
        write_str(filter, out);
    }
}

fn encode_bare(kind: PacketType, out: &mut Vec<u8>) {
    out.push((kind as u8) << 4);
    write_packet_length(0, out);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(packet: &Packet) -> Packet {
        let mut buf = Vec::new();
        encode_packet(packet, &mut buf);
        let (decoded, consumed) = decode_packet(&buf).unwrap().unwrap();
        assert_eq!(consumed, buf.len());
        decoded
    }

    #[test]
    fn test_packet_length_field() {
        let mut buf = Vec::new();
        write_packet_length(0, &mut buf);
        assert_eq!(buf, [0]);

        buf.clear();
        write_packet_length(127, &mut buf);
        assert_eq!(buf, [127]);

        buf.clear();
        write_packet_length(128, &mut buf);
        assert_eq!(buf, [0x80, 0x01]);

        assert_eq!(read_packet_length(&[0x80, 0x01]).unwrap(), Some((128, 2)));
        // continuation bit set but no more bytes
        assert_eq!(read_packet_length(&[0x80]).unwrap(), None);
        // more than 4 length bytes
        assert!(read_packet_length(&[0xFF, 0xFF, 0xFF, 0xFF, 0x01]).is_err());
    }

    #[test]
    fn test_connect_roundtrip() {
        let connect = Connect {
            protocol_name: "MQTT".to_string(),
            protocol_version: 4,
            clean_session: false,
            keep_alive: 30,
            client_id: "test".to_string(),
            will: Some(Message {
                topic: "will/topic".to_string(),
                payload: Bytes::from_static(b"gone"),
                qos: QoS::AtLeastOnce,
                retain: true,
            }),
            username: Some("user".to_string()),
            password: Some(b"pass".to_vec()),
        };

        let Packet::Connect(decoded) = roundtrip(&Packet::Connect(connect)) else {
            panic!("expected CONNECT");
        };

        assert_eq!(decoded.protocol_name, "MQTT");
        assert_eq!(decoded.protocol_version, 4);
        assert!(!decoded.clean_session);
        assert_eq!(decoded.keep_alive, 30);
        assert_eq!(decoded.client_id, "test");
        let will = decoded.will.unwrap();
        assert_eq!(will.topic, "will/topic");
        assert_eq!(will.qos, QoS::AtLeastOnce);
        assert!(will.retain);
        assert_eq!(decoded.username.as_deref(), Some("user"));
        assert_eq!(decoded.password.as_deref(), Some(b"pass".as_slice()));
    }

    #[test]
    fn test_publish_roundtrip() {
        let publish = Publish {
            dup: true,
            packet_id: Some(7),
            message: Message {
                topic: "foo/bar".to_string(),
                payload: Bytes::from_static(b"hello"),
                qos: QoS::ExactlyOnce,
                retain: false,
            },
        };

        let Packet::Publish(decoded) = roundtrip(&Packet::Publish(publish)) else {
            panic!("expected PUBLISH");
        };

        assert!(decoded.dup);
        assert_eq!(decoded.packet_id, Some(7));
        assert_eq!(decoded.message.topic, "foo/bar");
        assert_eq!(decoded.message.payload.as_ref(), b"hello");
        assert_eq!(decoded.message.qos, QoS::ExactlyOnce);
    }

    #[test]
    fn test_qos0_publish_has_no_packet_id() {
        let publish = Publish {
            dup: false,
            packet_id: None,
            message: Message {
                topic: "t".to_string(),
                payload: Bytes::from_static(b"x"),
                qos: QoS::AtMostOnce,
                retain: false,
            },
        };

        let Packet::Publish(decoded) = roundtrip(&Packet::Publish(publish)) else {
            panic!("expected PUBLISH");
        };
        assert_eq!(decoded.packet_id, None);
    }

    #[test]
    fn test_subscribe_roundtrip() {
        let subscribe = Subscribe {
            packet_id: 3,
            filters: vec![
                ("a/b".to_string(), QoS::AtMostOnce),
                ("c/#".to_string(), QoS::ExactlyOnce),
            ],
        };

        let Packet::Subscribe(decoded) = roundtrip(&Packet::Subscribe(subscribe)) else {
            panic!("expected SUBSCRIBE");
        };

        assert_eq!(decoded.packet_id, 3);
        assert_eq!(decoded.filters.len(), 2);
        assert_eq!(decoded.filters[1], ("c/#".to_string(), QoS::ExactlyOnce));
    }

    #[test]
    fn test_subscribe_flags_enforced() {
        let mut buf = Vec::new();
        encode_packet(
            &Packet::Subscribe(Subscribe {
                packet_id: 1,
                filters: vec![("t".to_string(), QoS::AtMostOnce)],
            }),
            &mut buf,
        );
        // corrupt the fixed header flags
        buf[0] = (PacketType::Subscribe as u8) << 4;
        assert!(decode_packet(&buf).is_err());
    }

    #[test]
    fn test_connack_roundtrip() {
        let Packet::Connack(decoded) = roundtrip(&Packet::Connack(Connack {
            session_present: true,
            code: ConnackCode::Accepted,
        })) else {
            panic!("expected CONNACK");
        };
        assert!(decoded.session_present);
        assert_eq!(decoded.code, ConnackCode::Accepted);
    }

    #[test]
    fn test_acks_and_pings() {
        assert!(matches!(
            roundtrip(&Packet::Puback { packet_id: 9 }),
            Packet::Puback { packet_id: 9 }
        ));
        assert!(matches!(
            roundtrip(&Packet::Pubrel { packet_id: 10 }),
            Packet::Pubrel { packet_id: 10 }
        ));
        assert!(matches!(roundtrip(&Packet::Pingreq), Packet::Pingreq));
        assert!(matches!(roundtrip(&Packet::Disconnect), Packet::Disconnect));
    }

    #[test]
    fn test_partial_packet_needs_more() {
        let mut buf = Vec::new();
        encode_packet(
            &Packet::Publish(Publish {
                dup: false,
                packet_id: None,
                message: Message {
                    topic: "topic".to_string(),
                    payload: Bytes::from_static(b"payload"),
                    qos: QoS::AtMostOnce,
                    retain: false,
                },
            }),
            &mut buf,
        );

        // any strict prefix decodes to None
        assert!(decode_packet(&buf[..buf.len() - 1]).unwrap().is_none());
        assert!(decode_packet(&buf[..1]).unwrap().is_none());
    }

    #[test]
    fn test_string_with_null_rejected() {
        // hand-built SUBSCRIBE with a null byte inside the filter
        let mut buf = vec![(PacketType::Subscribe as u8) << 4 | 0x02];
        let body = [0u8, 1, 0, 3, b'a', 0, b'b', 0];
        buf.push(body.len() as u8);
        buf.extend_from_slice(&body);
        assert!(decode_packet(&buf).is_err());
    }

    #[test]
    fn test_reserved_connect_flag_rejected() {
        let connect = Connect {
            protocol_name: "MQTT".to_string(),
            protocol_version: 4,
            clean_session: true,
            keep_alive: 0,
            client_id: "c".to_string(),
            will: None,
            username: None,
            password: None,
        };
        let mut buf = Vec::new();
        encode_packet(&Packet::Connect(connect), &mut buf);

        // flags byte sits right after the 7-byte variable header prefix:
        // fixed(2) + name(6) + version(1)
        let flags_at = 2 + 6 + 1;
        buf[flags_at] |= 0x01;
        assert!(decode_packet(&buf).is_err());
    }

    #[test]
    fn test_will_bits_without_will_rejected() {
        let connect = Connect {
            protocol_name: "MQTT".to_string(),
            protocol_version: 4,
            clean_session: true,
            keep_alive: 0,
            client_id: "c".to_string(),
            will: None,
            username: None,
            password: None,
        };
        let mut buf = Vec::new();
        encode_packet(&Packet::Connect(connect), &mut buf);

        // set a will qos without the will flag
        let flags_at = 2 + 6 + 1;
        buf[flags_at] |= 0x08;
        assert!(decode_packet(&buf).is_err());
    }
}
