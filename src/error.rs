//! Error types for mqrelay.

use std::io;

use thiserror::Error;

/// Main error type for mqrelay.
#[derive(Error, Debug)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("Backend error: {0}")]
    Backend(String),
}

/// MQTT protocol errors.
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("Unknown packet type: {0}")]
    UnknownPacketType(u8),

    #[error("Length field is unterminated or longer than four bytes")]
    BadLengthField,

    #[error("Packet body ends mid-field")]
    Truncated,

    #[error("String field is not valid UTF-8")]
    NotUtf8,

    #[error("Malformed packet: {0}")]
    Malformed(String),

    #[error("Expected CONNECT as the first packet")]
    ConnectExpected,

    #[error("Unexpected CONNECT packet after handshake")]
    DuplicateConnect,

    #[error("Wildcard character in topic name: {0}")]
    WildcardInTopicName(String),
}

pub type Result<T> = std::result::Result<T, Error>;
