//! Engine.IO v4 / Socket.IO v4 text packet codec.
//!
//! Every WebSocket text frame is one Engine.IO packet: a type digit followed
//! by its data. Socket.IO packets ride inside Engine.IO `message` packets:
//!
//! ```text
//! 4 2 ["svc_device","{\"ip\":\"10.0.0.1\",\"port\":5555}"]
//! | | `-- event payload (JSON array: name, args...)
//! | `---- Socket.IO type (event)
//! `------ Engine.IO type (message)
//! ```
//!
//! Only the default namespace and text packets are used by the farm.

use serde_json::Value;

use crate::error::{Error, Result};

/// Engine.IO packet types.
pub mod engine_type {
    /// Handshake from the server, carries `{sid, pingInterval, ...}`.
    pub const OPEN: char = '0';
    /// Transport close.
    pub const CLOSE: char = '1';
    /// Server heartbeat.
    pub const PING: char = '2';
    /// Heartbeat reply.
    pub const PONG: char = '3';
    /// Carries a Socket.IO packet.
    pub const MESSAGE: char = '4';
}

/// Socket.IO packet types.
pub mod socket_type {
    /// Namespace connect / connect acknowledgment.
    pub const CONNECT: char = '0';
    /// Namespace disconnect.
    pub const DISCONNECT: char = '1';
    /// Named event.
    pub const EVENT: char = '2';
    /// Event acknowledgment.
    pub const ACK: char = '3';
    /// Namespace connect refused.
    pub const CONNECT_ERROR: char = '4';
}

/// A decoded Engine.IO packet.
#[derive(Debug, Clone, PartialEq)]
pub enum EnginePacket {
    /// Handshake payload (raw JSON text).
    Open(String),
    /// The server is closing the transport.
    Close,
    /// Heartbeat; the data must be echoed in the pong.
    Ping(String),
    /// Heartbeat reply.
    Pong(String),
    /// Socket.IO packet text.
    Message(String),
    /// Upgrade/noop and anything else the farm does not use.
    Other(char),
}

/// A decoded Socket.IO packet.
#[derive(Debug, Clone, PartialEq)]
pub enum SocketPacket {
    /// Connect acknowledgment, with its optional `{sid}` payload.
    Connect(Option<Value>),
    /// The server dropped this client from the namespace.
    Disconnect,
    /// Named event with its arguments.
    Event {
        /// Event name.
        name: String,
        /// Arguments after the name.
        args: Vec<Value>,
    },
    /// The server refused the namespace connect.
    ConnectError(Option<Value>),
    /// Acks and binary packets.
    Other(char),
}

/// Decode one Engine.IO text frame.
pub fn decode_engine(text: &str) -> Result<EnginePacket> {
    let mut chars = text.chars();
    let Some(kind) = chars.next() else {
        return Err(Error::connection("empty Engine.IO packet"));
    };
    let data = chars.as_str().to_string();
    Ok(match kind {
        engine_type::OPEN => EnginePacket::Open(data),
        engine_type::CLOSE => EnginePacket::Close,
        engine_type::PING => EnginePacket::Ping(data),
        engine_type::PONG => EnginePacket::Pong(data),
        engine_type::MESSAGE => EnginePacket::Message(data),
        _ => EnginePacket::Other(kind),
    })
}

/// Decode the Socket.IO packet carried by an Engine.IO message.
///
/// A namespace prefix (`/ns,`) and an ack id are skipped.
pub fn decode_socket(text: &str) -> Result<SocketPacket> {
    let mut chars = text.chars();
    let Some(kind) = chars.next() else {
        return Err(Error::connection("empty Socket.IO packet"));
    };
    let mut rest = chars.as_str();

    if rest.starts_with('/') {
        rest = match rest.find(',') {
            Some(comma) => &rest[comma + 1..],
            None => "",
        };
    }
    rest = rest.trim_start_matches(|c: char| c.is_ascii_digit());

    let payload = if rest.is_empty() {
        None
    } else {
        Some(serde_json::from_str::<Value>(rest).map_err(|e| {
            Error::connection(format!("invalid Socket.IO payload: {rest}")).with_source(e)
        })?)
    };

    Ok(match kind {
        socket_type::CONNECT => SocketPacket::Connect(payload),
        socket_type::DISCONNECT => SocketPacket::Disconnect,
        socket_type::EVENT => {
            let Some(Value::Array(mut items)) = payload else {
                return Err(Error::connection("Socket.IO event without an array payload"));
            };
            if items.is_empty() {
                return Err(Error::connection("Socket.IO event without a name"));
            }
            let Value::String(name) = items.remove(0) else {
                return Err(Error::connection("Socket.IO event name is not a string"));
            };
            SocketPacket::Event { name, args: items }
        }
        socket_type::CONNECT_ERROR => SocketPacket::ConnectError(payload),
        _ => SocketPacket::Other(kind),
    })
}

/// `40`: connect to the default namespace.
pub fn encode_connect() -> String {
    format!("{}{}", engine_type::MESSAGE, socket_type::CONNECT)
}

/// `41`: leave the default namespace.
pub fn encode_disconnect() -> String {
    format!("{}{}", engine_type::MESSAGE, socket_type::DISCONNECT)
}

/// `42["name",args...]`.
pub fn encode_event(name: &str, args: &[Value]) -> String {
    let mut items = Vec::with_capacity(args.len() + 1);
    items.push(Value::String(name.to_string()));
    items.extend_from_slice(args);
    format!(
        "{}{}{}",
        engine_type::MESSAGE,
        socket_type::EVENT,
        Value::Array(items)
    )
}

/// `3<data>`: reply to a ping.
pub fn encode_pong(data: &str) -> String {
    format!("{}{}", engine_type::PONG, data)
}
