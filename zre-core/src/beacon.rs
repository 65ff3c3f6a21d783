//! Discovery beacon: fixed 22-byte UDP datagram.
//!
//! ```text
//! 'Z' 'R' 'E'   3 bytes
//! version       1 byte, 0x01
//! UUID          16 bytes
//! port          2 bytes, network order
//! ```

use crate::identity::NodeId;

pub const BEACON_SIGNATURE: [u8; 3] = *b"ZRE";
pub const BEACON_VERSION: u8 = 0x01;
pub const BEACON_SIZE: usize = 22;

/// Well-known UDP port for beacons.
pub const DISCOVERY_PORT: u16 = 5670;

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct Beacon {
    pub node: NodeId,
    /// Mailbox port of the sender. Zero means the sender is going away.
    pub port: u16,
}

impl Beacon {
    pub fn new(node: NodeId, port: u16) -> Self {
        Self { node, port }
    }

    /// Beacon announcing that `node` is stopping.
    pub fn departure(node: NodeId) -> Self {
        Self { node, port: 0 }
    }

    pub fn is_departure(&self) -> bool {
        self.port == 0
    }

    pub fn encode(&self) -> [u8; BEACON_SIZE] {
        let mut out = [0u8; BEACON_SIZE];
        out[0..3].copy_from_slice(&BEACON_SIGNATURE);
        out[3] = BEACON_VERSION;
        out[4..20].copy_from_slice(self.node.as_bytes());
        out[20..22].copy_from_slice(&self.port.to_be_bytes());
        out
    }

    /// Parse a datagram. Foreign or malformed datagrams are an error the caller ignores.
    pub fn decode(bytes: &[u8]) -> Result<Self, BeaconError> {
        if bytes.len() != BEACON_SIZE {
            return Err(BeaconError::Size(bytes.len()));
        }
        if bytes[0..3] != BEACON_SIGNATURE {
            return Err(BeaconError::Signature);
        }
        if bytes[3] != BEACON_VERSION {
            return Err(BeaconError::Version(bytes[3]));
        }
        let mut id = [0u8; 16];
        id.copy_from_slice(&bytes[4..20]);
        let port = u16::from_be_bytes([bytes[20], bytes[21]]);
        Ok(Self {
            node: NodeId::from_bytes(id),
            port,
        })
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum BeaconError {
    #[error("unexpected beacon size {0}")]
    Size(usize),
    #[error("bad beacon signature")]
    Signature,
    #[error("unsupported beacon version {0}")]
    Version(u8),
}
