//! Peer state and the peer table owned by `NodeCore`.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::time::Instant;

use crate::identity::NodeId;
use crate::liveness::Liveness;
use crate::protocol::Headers;

/// Everything known about one remote node.
#[derive(Debug, Clone)]
pub struct Peer {
    id: NodeId,
    name: Option<String>,
    /// Remote mailbox (listener) address.
    endpoint: SocketAddr,
    headers: Headers,
    /// Last status counter the peer announced.
    status: u8,
    /// Peer has said Hello to us.
    ready: bool,
    /// We have a live outbound link to the peer.
    connected: bool,
    created_at: Instant,
    last_seen: Instant,
    last_sent: Instant,
    liveness: Liveness,
    sent_sequence: u16,
    want_sequence: u16,
}

impl Peer {
    pub fn new(id: NodeId, endpoint: SocketAddr, now: Instant) -> Self {
        Self {
            id,
            name: None,
            endpoint,
            headers: Headers::new(),
            status: 0,
            ready: false,
            connected: false,
            created_at: now,
            last_seen: now,
            last_sent: now,
            liveness: Liveness::Alive,
            sent_sequence: 0,
            want_sequence: 0,
        }
    }

    pub fn id(&self) -> NodeId {
        self.id
    }

    /// Announced name, or the short ID before the handshake.
    pub fn name(&self) -> String {
        self.name.clone().unwrap_or_else(|| self.id.short())
    }

    pub fn set_name(&mut self, name: String) {
        self.name = Some(name);
    }

    pub fn endpoint(&self) -> SocketAddr {
        self.endpoint
    }

    pub fn set_endpoint(&mut self, endpoint: SocketAddr) {
        self.endpoint = endpoint;
    }

    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    pub fn header(&self, key: &str) -> Option<&str> {
        self.headers.get(key).map(String::as_str)
    }

    pub fn set_headers(&mut self, headers: Headers) {
        self.headers = headers;
    }

    pub fn status(&self) -> u8 {
        self.status
    }

    pub fn set_status(&mut self, status: u8) {
        self.status = status;
    }

    pub fn is_ready(&self) -> bool {
        self.ready
    }

    pub fn set_ready(&mut self) {
        self.ready = true;
    }

    pub fn is_connected(&self) -> bool {
        self.connected
    }

    /// A new outbound link starts; numbering restarts at 1.
    pub fn connect(&mut self, now: Instant) {
        self.connected = true;
        self.sent_sequence = 0;
        self.last_sent = now;
    }

    pub fn disconnect(&mut self) {
        self.connected = false;
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    pub fn last_seen(&self) -> Instant {
        self.last_seen
    }

    pub fn last_sent(&self) -> Instant {
        self.last_sent
    }

    pub fn liveness(&self) -> Liveness {
        self.liveness
    }

    pub fn set_liveness(&mut self, liveness: Liveness) {
        self.liveness = liveness;
    }

    /// Any traffic from the peer.
    pub fn refresh(&mut self, now: Instant) {
        self.last_seen = now;
        self.liveness = Liveness::Alive;
    }

    /// Sequence number for the next outbound frame.
    pub fn next_sequence(&mut self, now: Instant) -> u16 {
        self.sent_sequence = self.sent_sequence.wrapping_add(1);
        self.last_sent = now;
        self.sent_sequence
    }

    /// Hello starts a new inbound sequence.
    pub fn reset_inbound(&mut self, hello_sequence: u16) {
        self.want_sequence = hello_sequence;
    }

    /// True if `sequence` is the next one expected; advances on success.
    pub fn check_sequence(&mut self, sequence: u16) -> bool {
        let expected = self.want_sequence.wrapping_add(1);
        if sequence == expected {
            self.want_sequence = sequence;
            true
        } else {
            false
        }
    }
}

/// Peers keyed by ID. Only `NodeCore` mutates it.
#[derive(Debug, Default)]
pub struct PeerTable {
    peers: BTreeMap<NodeId, Peer>,
}

impl PeerTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create the peer if absent, else refresh it. Returns true if created.
    pub fn upsert(&mut self, id: NodeId, endpoint: SocketAddr, now: Instant) -> bool {
        match self.peers.get_mut(&id) {
            Some(peer) => {
                peer.set_endpoint(endpoint);
                peer.refresh(now);
                false
            }
            None => {
                self.peers.insert(id, Peer::new(id, endpoint, now));
                true
            }
        }
    }

    pub fn get(&self, id: &NodeId) -> Option<&Peer> {
        self.peers.get(id)
    }

    pub fn get_mut(&mut self, id: &NodeId) -> Option<&mut Peer> {
        self.peers.get_mut(id)
    }

    pub fn remove(&mut self, id: &NodeId) -> Option<Peer> {
        self.peers.remove(id)
    }

    pub fn contains(&self, id: &NodeId) -> bool {
        self.peers.contains_key(id)
    }

    /// Snapshot of all peer IDs, sorted.
    pub fn all(&self) -> Vec<NodeId> {
        self.peers.keys().copied().collect()
    }

    /// Peers that completed the handshake, sorted.
    pub fn ready(&self) -> Vec<NodeId> {
        self.peers
            .values()
            .filter(|p| p.is_ready())
            .map(Peer::id)
            .collect()
    }

    /// Other peers registered at `endpoint`, excluding `except`.
    pub fn at_endpoint(&self, endpoint: SocketAddr, except: NodeId) -> Vec<NodeId> {
        self.peers
            .values()
            .filter(|p| p.id() != except && p.endpoint() == endpoint)
            .map(Peer::id)
            .collect()
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    pub fn clear(&mut self) {
        self.peers.clear();
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], port))
    }

    #[test]
    fn upsert_creates_then_refreshes() {
        let mut table = PeerTable::new();
        let id = NodeId::generate();
        let t0 = Instant::now();
        assert!(table.upsert(id, addr(1), t0));
        let later = t0 + Duration::from_secs(3);
        table.get_mut(&id).unwrap().set_liveness(Liveness::Evasive);
        assert!(!table.upsert(id, addr(2), later));
        let peer = table.get(&id).unwrap();
        assert_eq!(peer.last_seen(), later);
        assert_eq!(peer.endpoint(), addr(2));
        assert_eq!(peer.liveness(), Liveness::Alive);
    }

    #[test]
    fn sequence_checking() {
        let mut peer = Peer::new(NodeId::generate(), addr(1), Instant::now());
        peer.reset_inbound(1);
        assert!(peer.check_sequence(2));
        assert!(peer.check_sequence(3));
        assert!(!peer.check_sequence(5));
        peer.reset_inbound(u16::MAX);
        assert!(peer.check_sequence(0));
    }

    #[test]
    fn outbound_numbering_restarts_on_connect() {
        let now = Instant::now();
        let mut peer = Peer::new(NodeId::generate(), addr(1), now);
        peer.connect(now);
        assert_eq!(peer.next_sequence(now), 1);
        assert_eq!(peer.next_sequence(now), 2);
        peer.disconnect();
        assert!(!peer.is_connected());
        peer.connect(now);
        assert_eq!(peer.next_sequence(now), 1);
    }

    #[test]
    fn endpoint_lookup_excludes_self() {
        let mut table = PeerTable::new();
        let now = Instant::now();
        let a = NodeId::generate();
        let b = NodeId::generate();
        table.upsert(a, addr(7), now);
        assert!(table.at_endpoint(addr(7), a).is_empty());
        assert_eq!(table.at_endpoint(addr(7), b), vec![a]);
    }

    #[test]
    fn name_falls_back_to_short_id() {
        let id = NodeId::generate();
        let mut peer = Peer::new(id, addr(1), Instant::now());
        assert_eq!(peer.name(), id.short());
        peer.set_name("t2".into());
        assert_eq!(peer.name(), "t2");
    }
}
