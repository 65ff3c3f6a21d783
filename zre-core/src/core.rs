//! Host-driven API: NodeCore receives inputs from the host, returns actions.
//!
//! All Peer Table and Group Registry mutation happens here. The host feeds
//! beacon sightings, decoded envelopes, link failures, local commands and
//! reaper ticks, each with an explicit `now`, and performs the returned
//! actions in order.

use std::collections::BTreeSet;
use std::net::{IpAddr, SocketAddr};
use std::time::Instant;

use tracing::{debug, info, warn};

use crate::beacon::Beacon;
use crate::event::{Event, Payload};
use crate::group::GroupRegistry;
use crate::identity::{NodeId, NodeIdentity};
use crate::liveness::{Liveness, Timeouts};
use crate::peer::{Peer, PeerTable};
use crate::protocol::{Envelope, Headers, Message, PROTOCOL_VERSION};
use crate::wire;

/// Action for host to perform.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    /// Open an outbound link to the peer's mailbox. Frames for the peer that
    /// follow must be queued on this link.
    Connect { peer: NodeId, endpoint: SocketAddr },
    /// Write an encoded frame on the peer's outbound link.
    Send { peer: NodeId, frame: Vec<u8> },
    /// Close every link to the peer and drop queued frames.
    Disconnect { peer: NodeId },
    /// Deliver to the caller's event queue.
    Emit(Event),
}

/// Main coordinator. Host passes inputs; core returns actions.
pub struct NodeCore {
    identity: NodeIdentity,
    mailbox_port: u16,
    timeouts: Timeouts,
    /// Our own change counter, bumped on every join/leave.
    status: u8,
    headers: Headers,
    peers: PeerTable,
    groups: GroupRegistry,
}

impl NodeCore {
    pub fn new(identity: NodeIdentity, mailbox_port: u16, timeouts: Timeouts) -> Self {
        Self {
            identity,
            mailbox_port,
            timeouts,
            status: 0,
            headers: Headers::new(),
            peers: PeerTable::new(),
            groups: GroupRegistry::new(),
        }
    }

    pub fn with_headers(mut self, headers: Headers) -> Self {
        self.headers = headers;
        self
    }

    pub fn identity(&self) -> &NodeIdentity {
        &self.identity
    }

    pub fn id(&self) -> NodeId {
        self.identity.id()
    }

    pub fn mailbox_port(&self) -> u16 {
        self.mailbox_port
    }

    pub fn status(&self) -> u8 {
        self.status
    }

    /// Beacon advertising our mailbox.
    pub fn beacon(&self) -> Beacon {
        Beacon::new(self.id(), self.mailbox_port)
    }

    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    /// Takes effect on the next Hello we send.
    pub fn set_header(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.headers.insert(key.into(), value.into());
    }

    // ----------------------------------------------------------------------
    // Network inputs

    /// A valid beacon arrived from `from`.
    pub fn on_beacon(&mut self, beacon: Beacon, from: IpAddr, now: Instant) -> Vec<Action> {
        let mut actions = Vec::new();
        if beacon.node == self.id() {
            return actions;
        }
        if beacon.is_departure() {
            if self.peers.contains(&beacon.node) {
                debug!(peer = %beacon.node, "departure beacon");
                self.remove_peer(beacon.node, &mut actions);
            }
            return actions;
        }
        let endpoint = SocketAddr::new(from, beacon.port);
        self.require_peer(beacon.node, endpoint, now, &mut actions);
        actions
    }

    /// An envelope arrived on an inbound connection from `from`.
    ///
    /// `Err` means the connection violated the protocol and must be dropped;
    /// no state has been changed in that case.
    pub fn on_envelope(
        &mut self,
        envelope: Envelope,
        from: IpAddr,
        now: Instant,
    ) -> Result<Vec<Action>, ProtocolError> {
        let sender = envelope.sender;
        if sender == self.id() {
            return Err(ProtocolError::FromSelf);
        }
        if let Message::Hello {
            protocol_version,
            mailbox_port,
            name,
            groups,
            status,
            headers,
        } = envelope.message
        {
            if protocol_version != PROTOCOL_VERSION {
                return Err(ProtocolError::Version(protocol_version));
            }
            if envelope.sequence != 1 {
                return Err(ProtocolError::HelloSequence(envelope.sequence));
            }
            let hello = Hello {
                endpoint: SocketAddr::new(from, mailbox_port),
                name,
                groups,
                status,
                headers,
            };
            return Ok(self.on_hello(sender, hello, now));
        }

        let mut actions = Vec::new();
        let Some(peer) = self.peers.get_mut(&sender) else {
            debug!(peer = %sender, command = envelope.message.command(), "ignoring frame from unknown peer");
            return Ok(actions);
        };
        if !peer.is_ready() {
            debug!(peer = %sender, command = envelope.message.command(), "ignoring frame before hello");
            return Ok(actions);
        }
        if !peer.check_sequence(envelope.sequence) {
            warn!(peer = %sender, sequence = envelope.sequence, "lost messages from peer, dropping it");
            self.remove_peer(sender, &mut actions);
            return Ok(actions);
        }
        peer.refresh(now);
        let name = peer.name();

        match envelope.message {
            Message::Whisper { content } => {
                actions.push(Action::Emit(Event::Whisper {
                    peer: sender,
                    name,
                    payload: Payload::from(content),
                }));
            }
            Message::Shout { group, content } => {
                if self.groups.is_member(self.id(), &group) {
                    actions.push(Action::Emit(Event::Shout {
                        peer: sender,
                        name,
                        group,
                        payload: Payload::from(content),
                    }));
                } else {
                    debug!(peer = %sender, %group, "shout for a group we are not in");
                }
            }
            Message::Join { group, status } => {
                self.check_status(sender, status);
                if self.groups.join(sender, &group) {
                    actions.push(Action::Emit(Event::Join {
                        peer: sender,
                        name,
                        group,
                    }));
                }
            }
            Message::Leave { group, status } => {
                self.check_status(sender, status);
                if self.groups.leave(sender, &group) {
                    actions.push(Action::Emit(Event::Leave {
                        peer: sender,
                        name,
                        group,
                    }));
                }
            }
            Message::Ping => {
                self.send(sender, Message::PingOk, now, &mut actions);
            }
            // Liveness was refreshed above; Hello never reaches here.
            Message::PingOk | Message::Hello { .. } => {}
        }
        Ok(actions)
    }

    fn on_hello(&mut self, sender: NodeId, hello: Hello, now: Instant) -> Vec<Action> {
        let Hello {
            endpoint,
            name,
            groups,
            status,
            headers,
        } = hello;
        let mut actions = Vec::new();
        self.require_peer(sender, endpoint, now, &mut actions);

        let Some(peer) = self.peers.get_mut(&sender) else {
            return actions;
        };
        peer.reset_inbound(1);
        peer.set_name(name.clone());
        peer.set_headers(headers.clone());
        peer.set_status(status);
        peer.refresh(now);

        if !peer.is_ready() {
            peer.set_ready();
            info!(peer = %sender, %name, %endpoint, "peer entered");
            actions.push(Action::Emit(Event::Enter {
                peer: sender,
                name: name.clone(),
                headers,
                address: endpoint,
            }));
            for group in groups {
                if self.groups.join(sender, &group) {
                    actions.push(Action::Emit(Event::Join {
                        peer: sender,
                        name: name.clone(),
                        group,
                    }));
                }
            }
            return actions;
        }

        // Re-hello after the peer reconnected: reconcile memberships.
        debug!(peer = %sender, "re-hello");
        let announced: BTreeSet<&String> = groups.iter().collect();
        for group in self.groups.groups_of(sender) {
            if !announced.contains(&group) && self.groups.leave(sender, &group) {
                actions.push(Action::Emit(Event::Leave {
                    peer: sender,
                    name: name.clone(),
                    group,
                }));
            }
        }
        for group in groups {
            if self.groups.join(sender, &group) {
                actions.push(Action::Emit(Event::Join {
                    peer: sender,
                    name: name.clone(),
                    group,
                }));
            }
        }
        actions
    }

    /// The outbound link to `peer` broke. No event; beacons trigger a reconnect.
    pub fn on_link_lost(&mut self, peer: NodeId) {
        if let Some(p) = self.peers.get_mut(&peer) {
            if p.is_connected() {
                debug!(%peer, "outbound link lost");
                p.disconnect();
            }
        }
    }

    // ----------------------------------------------------------------------
    // Local commands

    /// Join `group`. Idempotent: no traffic if already a member.
    pub fn join(&mut self, group: &str, now: Instant) -> Vec<Action> {
        let mut actions = Vec::new();
        if !self.groups.join(self.id(), group) {
            return actions;
        }
        self.status = self.status.wrapping_add(1);
        info!(%group, status = self.status, "joined group");
        let msg = Message::Join {
            group: group.to_string(),
            status: self.status,
        };
        self.send_all(msg, now, &mut actions);
        actions
    }

    /// Leave `group`. Idempotent: no traffic if not a member.
    pub fn leave(&mut self, group: &str, now: Instant) -> Vec<Action> {
        let mut actions = Vec::new();
        if !self.groups.leave(self.id(), group) {
            return actions;
        }
        self.status = self.status.wrapping_add(1);
        info!(%group, status = self.status, "left group");
        let msg = Message::Leave {
            group: group.to_string(),
            status: self.status,
        };
        self.send_all(msg, now, &mut actions);
        actions
    }

    /// Unicast. Unknown or unreachable peers are logged and skipped.
    pub fn whisper(&mut self, peer: NodeId, payload: Payload, now: Instant) -> Vec<Action> {
        let mut actions = Vec::new();
        match self.peers.get(&peer) {
            Some(p) if p.is_connected() => {
                let msg = Message::Whisper {
                    content: payload.into_frames(),
                };
                self.send(peer, msg, now, &mut actions);
            }
            Some(_) => warn!(%peer, "whisper to disconnected peer dropped"),
            None => warn!(%peer, "whisper to unknown peer dropped"),
        }
        actions
    }

    /// Multicast to the group's members as known right now.
    pub fn shout(
        &mut self,
        group: &str,
        payload: Payload,
        now: Instant,
    ) -> Result<Vec<Action>, CommandError> {
        if !self.groups.contains(group) {
            return Err(CommandError::UnknownGroup(group.to_string()));
        }
        let mut actions = Vec::new();
        let content = payload.into_frames();
        let me = self.id();
        for member in self.groups.members_of(group) {
            if member == me {
                continue;
            }
            let msg = Message::Shout {
                group: group.to_string(),
                content: content.clone(),
            };
            self.send(member, msg, now, &mut actions);
        }
        Ok(actions)
    }

    // ----------------------------------------------------------------------
    // Reaper

    /// Periodic sweep: handshake timeouts, liveness transitions, idle pings.
    pub fn tick(&mut self, now: Instant) -> Vec<Action> {
        let mut actions = Vec::new();
        for id in self.peers.all() {
            let Some(peer) = self.peers.get(&id) else {
                continue;
            };
            let idle = now.saturating_duration_since(peer.last_seen());

            if !peer.is_ready() {
                let waiting = now.saturating_duration_since(peer.created_at());
                if waiting > self.timeouts.handshake || idle > self.timeouts.expired {
                    debug!(peer = %id, "handshake timed out, discarding");
                    self.remove_peer(id, &mut actions);
                }
                continue;
            }

            let target = self.timeouts.classify(idle);
            let current = peer.liveness();
            let name = peer.name();
            if target == Liveness::Expired {
                info!(peer = %id, %name, "peer expired");
                self.remove_peer(id, &mut actions);
                continue;
            }
            if target >= Liveness::Evasive && current < Liveness::Evasive {
                debug!(peer = %id, "peer evasive, pinging");
                actions.push(Action::Emit(Event::Evasive {
                    peer: id,
                    name: name.clone(),
                }));
                self.send(id, Message::Ping, now, &mut actions);
            }
            if target >= Liveness::Silent && current < Liveness::Silent {
                debug!(peer = %id, "peer silent");
                actions.push(Action::Emit(Event::Silent { peer: id, name }));
            }
            if let Some(peer) = self.peers.get_mut(&id) {
                if target > current {
                    peer.set_liveness(target);
                }
                let since_sent = now.saturating_duration_since(peer.last_sent());
                if peer.is_connected() && since_sent >= self.timeouts.ping_interval {
                    self.send(id, Message::Ping, now, &mut actions);
                }
            }
        }
        actions
    }

    /// Close all links and forget every peer. Emits no events.
    pub fn shutdown(&mut self) -> Vec<Action> {
        let actions = self
            .peers
            .all()
            .into_iter()
            .map(|peer| Action::Disconnect { peer })
            .collect();
        self.peers.clear();
        self.groups = GroupRegistry::new();
        actions
    }

    // ----------------------------------------------------------------------
    // Queries

    /// Peers that completed the handshake.
    pub fn peers(&self) -> Vec<NodeId> {
        self.peers.ready()
    }

    pub fn peer(&self, id: &NodeId) -> Option<&Peer> {
        self.peers.get(id)
    }

    pub fn peer_address(&self, id: &NodeId) -> Option<SocketAddr> {
        self.peers.get(id).map(Peer::endpoint)
    }

    pub fn peer_header_value(&self, id: &NodeId, key: &str) -> Option<String> {
        self.peers
            .get(id)
            .and_then(|p| p.header(key))
            .map(str::to_string)
    }

    /// Groups we are in, sorted.
    pub fn own_groups(&self) -> Vec<String> {
        self.groups.groups_of(self.id())
    }

    /// Groups that at least one remote peer is in, sorted.
    pub fn peer_groups(&self) -> Vec<String> {
        let me = self.id();
        self.groups
            .names()
            .into_iter()
            .filter(|g| self.groups.members_of(g).iter().any(|m| *m != me))
            .collect()
    }

    /// Remote members of `group`.
    pub fn peers_by_group(&self, group: &str) -> Vec<NodeId> {
        let me = self.id();
        self.groups
            .members_of(group)
            .into_iter()
            .filter(|m| *m != me)
            .collect()
    }

    // ----------------------------------------------------------------------
    // Internals

    /// Find or create the peer. A new peer gets an outbound link and our Hello;
    /// a known but disconnected peer is reconnected.
    fn require_peer(
        &mut self,
        id: NodeId,
        endpoint: SocketAddr,
        now: Instant,
        actions: &mut Vec<Action>,
    ) {
        let created = self.peers.upsert(id, endpoint, now);
        if created {
            // A restarted node may reuse the endpoint under a new identity.
            for stale in self.peers.at_endpoint(endpoint, id) {
                if let Some(p) = self.peers.get_mut(&stale) {
                    debug!(peer = %stale, %endpoint, "purging peer on reused endpoint");
                    p.disconnect();
                    actions.push(Action::Disconnect { peer: stale });
                }
            }
            debug!(peer = %id, %endpoint, "new peer");
        }
        let connected = self.peers.get(&id).map_or(true, Peer::is_connected);
        if !connected {
            self.connect_peer(id, endpoint, now, actions);
        }
    }

    fn connect_peer(
        &mut self,
        id: NodeId,
        endpoint: SocketAddr,
        now: Instant,
        actions: &mut Vec<Action>,
    ) {
        let Some(peer) = self.peers.get_mut(&id) else {
            return;
        };
        peer.connect(now);
        actions.push(Action::Connect { peer: id, endpoint });
        let hello = self.hello();
        self.send(id, hello, now, actions);
    }

    fn hello(&self) -> Message {
        Message::Hello {
            protocol_version: PROTOCOL_VERSION,
            mailbox_port: self.mailbox_port,
            name: self.identity.name().to_string(),
            groups: self.own_groups(),
            status: self.status,
            headers: self.headers.clone(),
        }
    }

    fn send(&mut self, id: NodeId, message: Message, now: Instant, actions: &mut Vec<Action>) {
        let sender = self.id();
        let Some(peer) = self.peers.get_mut(&id) else {
            return;
        };
        if !peer.is_connected() {
            return;
        }
        let envelope = Envelope {
            sequence: peer.next_sequence(now),
            sender,
            message,
        };
        match wire::encode_frame(&envelope) {
            Ok(frame) => actions.push(Action::Send { peer: id, frame }),
            Err(err) => warn!(peer = %id, %err, "failed to encode frame"),
        }
    }

    fn send_all(&mut self, message: Message, now: Instant, actions: &mut Vec<Action>) {
        for id in self.peers.all() {
            self.send(id, message.clone(), now, actions);
        }
    }

    /// LEAVE per group (sorted), then EXIT, then close links. Unready peers
    /// vanish without events.
    fn remove_peer(&mut self, id: NodeId, actions: &mut Vec<Action>) {
        let Some(peer) = self.peers.remove(&id) else {
            return;
        };
        let left = self.groups.remove_peer(id);
        if peer.is_ready() {
            let name = peer.name();
            for group in left {
                actions.push(Action::Emit(Event::Leave {
                    peer: id,
                    name: name.clone(),
                    group,
                }));
            }
            actions.push(Action::Emit(Event::Exit { peer: id, name }));
        }
        actions.push(Action::Disconnect { peer: id });
    }

    fn check_status(&mut self, id: NodeId, status: u8) {
        if let Some(peer) = self.peers.get_mut(&id) {
            let expected = peer.status().wrapping_add(1);
            if status != expected {
                debug!(peer = %id, status, expected, "peer status out of step");
            }
            peer.set_status(status);
        }
    }
}

/// Validated Hello contents.
struct Hello {
    endpoint: SocketAddr,
    name: String,
    groups: Vec<String>,
    status: u8,
    headers: Headers,
}

/// Inbound connection broke the protocol; the host drops it.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("unsupported protocol version {0}")]
    Version(u8),
    #[error("hello must carry sequence 1, got {0}")]
    HelloSequence(u16),
    #[error("frame claims to come from this node")]
    FromSelf,
}

/// Caller misuse reported synchronously.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum CommandError {
    #[error("unknown group {0:?}")]
    UnknownGroup(String),
}
