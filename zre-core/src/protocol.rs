//! ZRE peer protocol: message types, envelope and version.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::identity::NodeId;

/// Current protocol version. Used in beacon and handshake.
pub const PROTOCOL_VERSION: u8 = 1;

/// Header key/value pairs announced in `Hello`.
pub type Headers = BTreeMap<String, String>;

/// All peer-to-peer message types. Encoding is bincode; framing is length-prefix (see wire module).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Message {
    /// Handshake: always the first frame on a link.
    Hello {
        protocol_version: u8,
        /// Port of the sender's mailbox listener.
        mailbox_port: u16,
        name: String,
        /// Groups the sender currently belongs to, sorted.
        groups: Vec<String>,
        status: u8,
        headers: Headers,
    },
    /// Unicast message.
    Whisper { content: Vec<Vec<u8>> },
    /// Group multicast message.
    Shout { group: String, content: Vec<Vec<u8>> },
    Join { group: String, status: u8 },
    Leave { group: String, status: u8 },
    /// Liveness probe.
    Ping,
    PingOk,
}

impl Message {
    /// Short uppercase command name, for logs.
    pub fn command(&self) -> &'static str {
        match self {
            Message::Hello { .. } => "HELLO",
            Message::Whisper { .. } => "WHISPER",
            Message::Shout { .. } => "SHOUT",
            Message::Join { .. } => "JOIN",
            Message::Leave { .. } => "LEAVE",
            Message::Ping => "PING",
            Message::PingOk => "PING_OK",
        }
    }
}

/// One frame on the wire: per-link sequence number, sender and message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    pub sequence: u16,
    pub sender: NodeId,
    pub message: Message,
}
