//! Shared wire-format types for host-to-host mesh communication in vmesh.
//!
//! This crate is the single source of truth for the message protocol used
//! between peer agents on the mesh (see spec §4.4, §6 "Peer socket"). The
//! core crate depends on this to avoid duplicating the framing logic at
//! every call site.
//!
//! ## Wire Format
//!
//! Every message is framed as:
//!
//! ```text
//! ┌──────────────┬───────────┬────────────┬──────────────────┐
//! │ size (4 B)   │ type (1B) │ tag (2 B)  │ body (N bytes)   │
//! └──────────────┴───────────┴────────────┴──────────────────┘
//! ```
//!
//! - **size**: `u32` little-endian, size of the whole message *including*
//!   the 7-byte header (matches spec §6: `[size:u32-le, type:u8, tag:u16-le]`
//!   followed by `size-7` body bytes).
//! - **type**: one byte mapping to [`MessageType`].
//! - **tag**: `u16` little-endian, an opaque per-message counter independent
//!   of the command `tid` (used by transports that multiplex several
//!   logical streams over one socket).
//! - **body**: JSON-encoded [`MessageBody`].

use serde::{Deserialize, Serialize};
use std::fmt;

// ---------------------------------------------------------------------------
// Error
// ---------------------------------------------------------------------------

/// Errors that can occur while framing or parsing a mesh message.
#[derive(Debug)]
pub enum ProtocolError {
    /// Message buffer too short or malformed.
    InvalidMessage(String),
    /// The type byte does not map to a known [`MessageType`].
    UnknownMessageType(u8),
    /// An I/O error occurred while reading or writing.
    Io(std::io::Error),
    /// JSON (de)serialization failed.
    Json(serde_json::Error),
}

impl fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProtocolError::InvalidMessage(msg) => write!(f, "invalid message: {msg}"),
            ProtocolError::UnknownMessageType(b) => write!(f, "unknown message type: {b}"),
            ProtocolError::Io(e) => write!(f, "io error: {e}"),
            ProtocolError::Json(e) => write!(f, "json error: {e}"),
        }
    }
}

impl std::error::Error for ProtocolError {}

impl From<std::io::Error> for ProtocolError {
    fn from(e: std::io::Error) -> Self {
        ProtocolError::Io(e)
    }
}

impl From<serde_json::Error> for ProtocolError {
    fn from(e: serde_json::Error) -> Self {
        ProtocolError::Json(e)
    }
}

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// Header size in bytes: 4 (size) + 1 (type) + 2 (tag).
pub const HEADER_SIZE: usize = 7;

// ---------------------------------------------------------------------------
// MessageType / MessageBody
// ---------------------------------------------------------------------------

/// Message types exchanged between peer agents (spec §4.4).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum MessageType {
    /// A compiled command forwarded for local execution on the recipient.
    Command = 1,
    /// A response (or aggregated response set) to a previously sent command.
    Response = 2,
    /// A batch of queued VMs assigned to the recipient by the scheduler.
    VmLaunch = 3,
    /// The recipient's result of attempting a `VmLaunch` batch.
    VmLaunchResult = 4,
    /// File distribution protocol traffic (find/descriptor/part requests).
    File = 5,
    /// Plumber pipe traffic, opaque to the mesh layer.
    Plumber = 6,
    /// A structured log line forwarded from a peer.
    Log = 7,
    /// A free-form status string (e.g. file-transfer progress).
    Status = 8,
    /// Liveness probe.
    Ping = 9,
    /// Liveness probe reply.
    Pong = 10,
}

impl TryFrom<u8> for MessageType {
    type Error = ProtocolError;

    fn try_from(byte: u8) -> Result<Self, Self::Error> {
        match byte {
            1 => Ok(MessageType::Command),
            2 => Ok(MessageType::Response),
            3 => Ok(MessageType::VmLaunch),
            4 => Ok(MessageType::VmLaunchResult),
            5 => Ok(MessageType::File),
            6 => Ok(MessageType::Plumber),
            7 => Ok(MessageType::Log),
            8 => Ok(MessageType::Status),
            9 => Ok(MessageType::Ping),
            10 => Ok(MessageType::Pong),
            _ => Err(ProtocolError::UnknownMessageType(byte)),
        }
    }
}

/// The typed body of a mesh envelope (spec §4.4: "a body that is one of...").
///
/// `Command`/`Response`/`VmLaunch`/`VmLaunchResult` carry their payload as
/// opaque JSON (`serde_json::Value`): the concrete `Command`/`Response`/
/// `QueuedVMs` types live in the core crate, which avoids a dependency
/// cycle while keeping exactly one encoding in play.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MessageBody {
    Command { tid: u32, command: serde_json::Value },
    Response { tid: u32, response: serde_json::Value },
    VmLaunch { tid: u32, namespace: String, queued: serde_json::Value },
    VmLaunchResult { tid: u32, errors: Vec<String> },
    File { payload: serde_json::Value },
    Plumber { pipe: String, payload: Vec<u8> },
    Log { level: String, from: String, text: String },
    Status { text: String },
    Ping,
    Pong,
}

impl MessageBody {
    /// The `tid` carried by request/response-shaped bodies, if any.
    pub fn tid(&self) -> Option<u32> {
        match self {
            MessageBody::Command { tid, .. }
            | MessageBody::Response { tid, .. }
            | MessageBody::VmLaunch { tid, .. }
            | MessageBody::VmLaunchResult { tid, .. } => Some(*tid),
            _ => None,
        }
    }

    fn message_type(&self) -> MessageType {
        match self {
            MessageBody::Command { .. } => MessageType::Command,
            MessageBody::Response { .. } => MessageType::Response,
            MessageBody::VmLaunch { .. } => MessageType::VmLaunch,
            MessageBody::VmLaunchResult { .. } => MessageType::VmLaunchResult,
            MessageBody::File { .. } => MessageType::File,
            MessageBody::Plumber { .. } => MessageType::Plumber,
            MessageBody::Log { .. } => MessageType::Log,
            MessageBody::Status { .. } => MessageType::Status,
            MessageBody::Ping => MessageType::Ping,
            MessageBody::Pong => MessageType::Pong,
        }
    }
}

// ---------------------------------------------------------------------------
// Envelope
// ---------------------------------------------------------------------------

/// A mesh envelope: `from`, `to` (resolved recipient list or `["all"]` for
/// broadcast), and a typed body (spec §4.4).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    pub from: String,
    pub to: Vec<String>,
    pub body: MessageBody,
}

impl Envelope {
    pub fn new(from: impl Into<String>, to: Vec<String>, body: MessageBody) -> Self {
        Self { from: from.into(), to, body }
    }

    /// `to == ["all"]` marks an unresolved broadcast; resolved at send time.
    pub fn is_broadcast(&self) -> bool {
        self.to.len() == 1 && self.to[0] == "all"
    }
}

/// Generate a random 31-bit transaction id (spec §4.4: "a random 31-bit `tid`").
pub fn new_tid() -> u32 {
    use rand::Rng;
    rand::thread_rng().gen_range(0..=0x7fff_ffffu32)
}

// ---------------------------------------------------------------------------
// Message (wire frame)
// ---------------------------------------------------------------------------

/// A framed wire message: header + JSON-encoded [`Envelope`] body.
#[derive(Debug, Clone)]
pub struct Message {
    pub msg_type: MessageType,
    pub tag: u16,
    pub payload: Vec<u8>,
}

impl Message {
    /// Build a framed message from an envelope, tagging it with `tag`.
    pub fn from_envelope(envelope: &Envelope, tag: u16) -> Result<Self, ProtocolError> {
        let payload = serde_json::to_vec(envelope)?;
        Ok(Self { msg_type: envelope.body.message_type(), tag, payload })
    }

    /// Decode the JSON payload back into an [`Envelope`].
    pub fn into_envelope(self) -> Result<Envelope, ProtocolError> {
        Ok(serde_json::from_slice(&self.payload)?)
    }

    /// Serialize this message into a byte buffer (header + payload). `size`
    /// in the header includes the header itself, per spec §6.
    pub fn serialize(&self) -> Vec<u8> {
        let total_len = (HEADER_SIZE + self.payload.len()) as u32;
        let mut buf = Vec::with_capacity(total_len as usize);
        buf.extend_from_slice(&total_len.to_le_bytes());
        buf.push(self.msg_type as u8);
        buf.extend_from_slice(&self.tag.to_le_bytes());
        buf.extend_from_slice(&self.payload);
        buf
    }

    /// Deserialize a message from a contiguous byte slice.
    pub fn deserialize(data: &[u8]) -> Result<Self, ProtocolError> {
        if data.len() < HEADER_SIZE {
            return Err(ProtocolError::InvalidMessage("message too short".into()));
        }
        let total_len = u32::from_le_bytes([data[0], data[1], data[2], data[3]]) as usize;
        let msg_type = MessageType::try_from(data[4])?;
        let tag = u16::from_le_bytes([data[5], data[6]]);
        if total_len < HEADER_SIZE || data.len() < total_len {
            return Err(ProtocolError::InvalidMessage("incomplete message".into()));
        }
        let payload = data[HEADER_SIZE..total_len].to_vec();
        Ok(Self { msg_type, tag, payload })
    }

    /// Read a complete message from a synchronous [`std::io::Read`] stream.
    pub fn read_from_sync<R: std::io::Read>(reader: &mut R) -> Result<Self, ProtocolError> {
        let mut header = [0u8; HEADER_SIZE];
        reader.read_exact(&mut header)?;
        let total_len = u32::from_le_bytes([header[0], header[1], header[2], header[3]]) as usize;
        let msg_type = MessageType::try_from(header[4])?;
        let tag = u16::from_le_bytes([header[5], header[6]]);
        if total_len < HEADER_SIZE {
            return Err(ProtocolError::InvalidMessage("size smaller than header".into()));
        }
        let mut payload = vec![0u8; total_len - HEADER_SIZE];
        if !payload.is_empty() {
            reader.read_exact(&mut payload)?;
        }
        Ok(Self { msg_type, tag, payload })
    }

    /// Split a header already read by the caller into `(total_len, msg_type, tag)`,
    /// so async callers (see `mesh::transport` in the core crate) can read the
    /// fixed-size header with their own executor's reader before pulling the
    /// variable-length payload.
    pub fn parse_header(header: &[u8; HEADER_SIZE]) -> Result<(usize, MessageType, u16), ProtocolError> {
        let total_len = u32::from_le_bytes([header[0], header[1], header[2], header[3]]) as usize;
        let msg_type = MessageType::try_from(header[4])?;
        let tag = u16::from_le_bytes([header[5], header[6]]);
        if total_len < HEADER_SIZE {
            return Err(ProtocolError::InvalidMessage("size smaller than header".into()));
        }
        Ok((total_len, msg_type, tag))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_command_envelope() {
        let env = Envelope::new(
            "h0",
            vec!["h1".to_string()],
            MessageBody::Command { tid: 42, command: serde_json::json!({"original": "vm info"}) },
        );
        let msg = Message::from_envelope(&env, 7).unwrap();
        let bytes = msg.serialize();
        let parsed = Message::deserialize(&bytes).unwrap();
        assert_eq!(parsed.msg_type, MessageType::Command);
        assert_eq!(parsed.tag, 7);
        let env2 = parsed.into_envelope().unwrap();
        assert_eq!(env2.from, "h0");
        assert_eq!(env2.body.tid(), Some(42));
    }

    #[test]
    fn rejects_short_buffer() {
        let err = Message::deserialize(&[0u8; 3]).unwrap_err();
        assert!(matches!(err, ProtocolError::InvalidMessage(_)));
    }

    #[test]
    fn rejects_unknown_type() {
        let mut buf = vec![11, 0, 0, 0, 200, 0, 0];
        buf.truncate(7);
        let err = Message::deserialize(&buf).unwrap_err();
        assert!(matches!(err, ProtocolError::UnknownMessageType(200)));
    }

    #[test]
    fn broadcast_recipients_detected() {
        let env = Envelope::new("h0", vec!["all".into()], MessageBody::Ping);
        assert!(env.is_broadcast());
        let env2 = Envelope::new("h0", vec!["h1".into()], MessageBody::Ping);
        assert!(!env2.is_broadcast());
    }

    #[test]
    fn tid_is_31_bit() {
        for _ in 0..1000 {
            assert!(new_tid() <= 0x7fff_ffff);
        }
    }
}
