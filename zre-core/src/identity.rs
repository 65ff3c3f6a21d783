//! Node identity: 16-byte UUID plus a human-readable name.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Node ID (16 bytes, random UUID). Carried in beacons and in every envelope.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
pub struct NodeId(#[serde(with = "bytes_16")] [u8; 16]);

mod bytes_16 {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    pub fn serialize<S: Serializer>(v: &[u8; 16], serializer: S) -> Result<S::Ok, S::Error> {
        v.as_slice().serialize(serializer)
    }
    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<[u8; 16], D::Error> {
        let buf: Vec<u8> = Deserialize::deserialize(d)?;
        buf.try_into()
            .map_err(|_| serde::de::Error::custom("expected 16 bytes"))
    }
}

impl NodeId {
    /// Fresh random identity (UUID v4).
    pub fn generate() -> Self {
        NodeId(Uuid::new_v4().into_bytes())
    }

    pub fn from_bytes(bytes: [u8; 16]) -> Self {
        NodeId(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }

    /// Short form used as the default node name: first 6 hex characters.
    pub fn short(&self) -> String {
        let mut s = self.to_string();
        s.truncate(6);
        s
    }
}

/// Uppercase hex without dashes, 32 characters.
impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for b in &self.0 {
            write!(f, "{:02X}", b)?;
        }
        Ok(())
    }
}

impl FromStr for NodeId {
    type Err = uuid::Error;

    /// Accepts the 32-char hex form as well as the dashed UUID form.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(|u| NodeId(u.into_bytes()))
    }
}

/// Identity of the local node. Immutable for the life of a `NodeCore`.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct NodeIdentity {
    id: NodeId,
    name: String,
}

impl NodeIdentity {
    /// Random ID; name defaults to the ID's short form.
    pub fn generate(name: Option<String>) -> Self {
        let id = NodeId::generate();
        Self::new(id, name)
    }

    pub fn new(id: NodeId, name: Option<String>) -> Self {
        let name = name.unwrap_or_else(|| id.short());
        Self { id, name }
    }

    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_parse_roundtrip() {
        let id = NodeId::generate();
        let s = id.to_string();
        assert_eq!(s.len(), 32);
        assert!(s.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_lowercase()));
        let parsed: NodeId = s.parse().unwrap();
        assert_eq!(parsed, id);
    }

    #[test]
    fn default_name_is_short_id() {
        let ident = NodeIdentity::generate(None);
        assert_eq!(ident.name(), &ident.id().to_string()[..6]);
        let named = NodeIdentity::generate(Some("t1".into()));
        assert_eq!(named.name(), "t1");
    }

    #[test]
    fn distinct_ids() {
        assert_ne!(NodeId::generate(), NodeId::generate());
    }
}
