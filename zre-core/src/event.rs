//! Events delivered to the caller, in causal order per observer.

use std::convert::Infallible;
use std::fmt;
use std::str::FromStr;
use std::net::SocketAddr;

use crate::identity::NodeId;
use crate::protocol::Headers;

/// Message content: an ordered sequence of opaque frames.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Payload(Vec<Vec<u8>>);

impl Payload {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, frame: impl Into<Vec<u8>>) {
        self.0.push(frame.into());
    }

    pub fn frames(&self) -> &[Vec<u8>] {
        &self.0
    }

    pub fn into_frames(self) -> Vec<Vec<u8>> {
        self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// First frame as UTF-8, if present and valid.
    pub fn first_str(&self) -> Option<&str> {
        self.0.first().and_then(|f| std::str::from_utf8(f).ok())
    }
}

impl From<Vec<Vec<u8>>> for Payload {
    fn from(frames: Vec<Vec<u8>>) -> Self {
        Payload(frames)
    }
}

impl From<&str> for Payload {
    fn from(s: &str) -> Self {
        Payload(vec![s.as_bytes().to_vec()])
    }
}

impl FromStr for Payload {
    type Err = Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Payload::from(s))
    }
}

impl From<Vec<u8>> for Payload {
    fn from(frame: Vec<u8>) -> Self {
        Payload(vec![frame])
    }
}

#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash)]
pub enum EventKind {
    Enter,
    Exit,
    Join,
    Leave,
    Whisper,
    Shout,
    Evasive,
    Silent,
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            EventKind::Enter => "ENTER",
            EventKind::Exit => "EXIT",
            EventKind::Join => "JOIN",
            EventKind::Leave => "LEAVE",
            EventKind::Whisper => "WHISPER",
            EventKind::Shout => "SHOUT",
            EventKind::Evasive => "EVASIVE",
            EventKind::Silent => "SILENT",
        };
        f.write_str(s)
    }
}

/// One observation about a peer. Every variant names the originating peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    Enter {
        peer: NodeId,
        name: String,
        headers: Headers,
        address: SocketAddr,
    },
    Exit {
        peer: NodeId,
        name: String,
    },
    Join {
        peer: NodeId,
        name: String,
        group: String,
    },
    Leave {
        peer: NodeId,
        name: String,
        group: String,
    },
    Whisper {
        peer: NodeId,
        name: String,
        payload: Payload,
    },
    Shout {
        peer: NodeId,
        name: String,
        group: String,
        payload: Payload,
    },
    Evasive {
        peer: NodeId,
        name: String,
    },
    Silent {
        peer: NodeId,
        name: String,
    },
}

impl Event {
    pub fn kind(&self) -> EventKind {
        match self {
            Event::Enter { .. } => EventKind::Enter,
            Event::Exit { .. } => EventKind::Exit,
            Event::Join { .. } => EventKind::Join,
            Event::Leave { .. } => EventKind::Leave,
            Event::Whisper { .. } => EventKind::Whisper,
            Event::Shout { .. } => EventKind::Shout,
            Event::Evasive { .. } => EventKind::Evasive,
            Event::Silent { .. } => EventKind::Silent,
        }
    }

    pub fn peer(&self) -> NodeId {
        match self {
            Event::Enter { peer, .. }
            | Event::Exit { peer, .. }
            | Event::Join { peer, .. }
            | Event::Leave { peer, .. }
            | Event::Whisper { peer, .. }
            | Event::Shout { peer, .. }
            | Event::Evasive { peer, .. }
            | Event::Silent { peer, .. } => *peer,
        }
    }

    pub fn peer_name(&self) -> &str {
        match self {
            Event::Enter { name, .. }
            | Event::Exit { name, .. }
            | Event::Join { name, .. }
            | Event::Leave { name, .. }
            | Event::Whisper { name, .. }
            | Event::Shout { name, .. }
            | Event::Evasive { name, .. }
            | Event::Silent { name, .. } => name,
        }
    }

    /// Group name for JOIN, LEAVE and SHOUT.
    pub fn group(&self) -> Option<&str> {
        match self {
            Event::Join { group, .. } | Event::Leave { group, .. } | Event::Shout { group, .. } => {
                Some(group)
            }
            _ => None,
        }
    }

    /// Content for WHISPER and SHOUT.
    pub fn payload(&self) -> Option<&Payload> {
        match self {
            Event::Whisper { payload, .. } | Event::Shout { payload, .. } => Some(payload),
            _ => None,
        }
    }

    /// Headers announced with ENTER.
    pub fn headers(&self) -> Option<&Headers> {
        match self {
            Event::Enter { headers, .. } => Some(headers),
            _ => None,
        }
    }

    pub fn header(&self, key: &str) -> Option<&str> {
        self.headers()
            .and_then(|h| h.get(key))
            .map(String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accessors() {
        let peer = NodeId::generate();
        let ev = Event::Shout {
            peer,
            name: "t1".into(),
            group: "test group".into(),
            payload: Payload::from("Hello World"),
        };
        assert_eq!(ev.kind(), EventKind::Shout);
        assert_eq!(ev.kind().to_string(), "SHOUT");
        assert_eq!(ev.peer(), peer);
        assert_eq!(ev.peer_name(), "t1");
        assert_eq!(ev.group(), Some("test group"));
        assert_eq!(ev.payload().and_then(Payload::first_str), Some("Hello World"));
        assert!(ev.headers().is_none());
    }

    #[test]
    fn enter_headers() {
        let mut headers = Headers::new();
        headers.insert("test_header".into(), "test2".into());
        let ev = Event::Enter {
            peer: NodeId::generate(),
            name: "t2".into(),
            headers,
            address: "127.0.0.1:5000".parse().unwrap(),
        };
        assert_eq!(ev.header("test_header"), Some("test2"));
        assert_eq!(ev.group(), None);
    }

    #[test]
    fn payload_frames() {
        let mut p = Payload::new();
        assert!(p.is_empty());
        p.push("a");
        p.push(vec![0u8, 1, 2]);
        assert_eq!(p.frames().len(), 2);
        assert_eq!(p.first_str(), Some("a"));
        assert_eq!(p.into_frames()[1], vec![0u8, 1, 2]);
        let parsed: Payload = "Hello World".parse().unwrap();
        assert_eq!(parsed, Payload::from("Hello World"));
    }
}
