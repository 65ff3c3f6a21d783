//! Engine Loop: the one task that owns `NodeCore`, the sockets and every link.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot};
use tokio::task::AbortHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, trace, warn};
use zre_core::{Action, Beacon, CommandError, Event, Message, NodeCore, NodeId, Payload};

use crate::config::Config;
use crate::discovery::BeaconSocket;
use crate::transport::{self, ConnId, Link, LinkId, NetEvent};

/// Link tasks report back through a bounded channel so a flood of inbound
/// frames slows the readers down instead of growing memory.
const NET_CHANNEL_CAPACITY: usize = 1024;

type Reply<T> = oneshot::Sender<T>;

pub enum ToEngineActor {
    Join {
        group: String,
    },
    Leave {
        group: String,
    },
    Whisper {
        peer: NodeId,
        payload: Payload,
    },
    Shout {
        group: String,
        payload: Payload,
        reply: Reply<Result<(), CommandError>>,
    },
    SetHeader {
        key: String,
        value: String,
    },
    Peers {
        reply: Reply<Vec<NodeId>>,
    },
    OwnGroups {
        reply: Reply<Vec<String>>,
    },
    PeerGroups {
        reply: Reply<Vec<String>>,
    },
    PeersByGroup {
        group: String,
        reply: Reply<Vec<NodeId>>,
    },
    PeerAddress {
        peer: NodeId,
        reply: Reply<Option<SocketAddr>>,
    },
    PeerHeader {
        peer: NodeId,
        key: String,
        reply: Reply<Option<String>>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

/// An accepted connection and the peer its Hello named, once seen.
struct Inbound {
    peer: Option<NodeId>,
    handle: AbortHandle,
}

pub struct EngineActor {
    core: NodeCore,
    inbox: mpsc::Receiver<ToEngineActor>,
    events: mpsc::UnboundedSender<Event>,

    beacon: BeaconSocket,
    listener: TcpListener,
    net_tx: mpsc::Sender<NetEvent>,
    net_rx: mpsc::Receiver<NetEvent>,

    /// Outbound link per peer. At most one; a reconnect replaces it.
    links: HashMap<NodeId, Link>,
    inbound: HashMap<ConnId, Inbound>,
    next_link: LinkId,
    next_conn: ConnId,

    beacon_interval: Duration,
    reap_interval: Duration,
    handshake_timeout: Duration,
}

impl EngineActor {
    pub fn new(
        core: NodeCore,
        config: &Config,
        beacon: BeaconSocket,
        listener: TcpListener,
        inbox: mpsc::Receiver<ToEngineActor>,
        events: mpsc::UnboundedSender<Event>,
    ) -> Self {
        let (net_tx, net_rx) = mpsc::channel(NET_CHANNEL_CAPACITY);
        Self {
            core,
            inbox,
            events,
            beacon,
            listener,
            net_tx,
            net_rx,
            links: HashMap::new(),
            inbound: HashMap::new(),
            next_link: 0,
            next_conn: 0,
            beacon_interval: config.beacon_interval(),
            reap_interval: config.reap_interval(),
            handshake_timeout: config.handshake_timeout(),
        }
    }

    /// Run until shutdown is requested or the `Node` handle is dropped.
    pub async fn run(mut self, ready: oneshot::Sender<()>) {
        ready.send(()).ok();
        let shutdown_completed_signal = self.run_inner().await;
        if let Err(err) = self.shutdown().await {
            error!(?err, "error during shutdown");
        }
        // Closes the event queue before the caller is told we are done.
        drop(self);
        if let Some(reply) = shutdown_completed_signal {
            reply.send(()).ok();
        }
    }

    async fn run_inner(&mut self) -> Option<oneshot::Sender<()>> {
        let mut beacon_interval = interval(self.beacon_interval);
        beacon_interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut reap_interval = interval(self.reap_interval);
        reap_interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                biased;
                msg = self.inbox.recv() => {
                    match msg {
                        Some(ToEngineActor::Shutdown { reply }) => break Some(reply),
                        Some(msg) => self.on_actor_message(msg),
                        None => {
                            debug!("node handle dropped, stopping engine");
                            break None;
                        }
                    }
                },
                Some(event) = self.net_rx.recv() => {
                    self.on_net_event(event);
                },
                res = self.beacon.recv() => {
                    match res {
                        Ok(Some((beacon, from))) => {
                            let actions = self.core.on_beacon(beacon, from, Instant::now());
                            self.apply(actions);
                        }
                        Ok(None) => {}
                        Err(err) => warn!(%err, "beacon receive failed"),
                    }
                },
                res = self.listener.accept() => {
                    match res {
                        Ok((stream, from)) => self.on_accept(stream, from),
                        Err(err) => warn!(%err, "accept failed"),
                    }
                },
                _ = beacon_interval.tick() => {
                    if let Err(err) = self.beacon.publish(&self.core.beacon()).await {
                        warn!(%err, "beacon send failed");
                    }
                },
                _ = reap_interval.tick() => {
                    let actions = self.core.tick(Instant::now());
                    self.apply(actions);
                },
            }
        }
    }

    fn on_actor_message(&mut self, msg: ToEngineActor) {
        let now = Instant::now();
        match msg {
            ToEngineActor::Join { group } => {
                let actions = self.core.join(&group, now);
                self.apply(actions);
            }
            ToEngineActor::Leave { group } => {
                let actions = self.core.leave(&group, now);
                self.apply(actions);
            }
            ToEngineActor::Whisper { peer, payload } => {
                let actions = self.core.whisper(peer, payload, now);
                self.apply(actions);
            }
            ToEngineActor::Shout {
                group,
                payload,
                reply,
            } => {
                let result = match self.core.shout(&group, payload, now) {
                    Ok(actions) => {
                        self.apply(actions);
                        Ok(())
                    }
                    Err(err) => Err(err),
                };
                reply.send(result).ok();
            }
            ToEngineActor::SetHeader { key, value } => {
                self.core.set_header(key, value);
            }
            ToEngineActor::Peers { reply } => {
                reply.send(self.core.peers()).ok();
            }
            ToEngineActor::OwnGroups { reply } => {
                reply.send(self.core.own_groups()).ok();
            }
            ToEngineActor::PeerGroups { reply } => {
                reply.send(self.core.peer_groups()).ok();
            }
            ToEngineActor::PeersByGroup { group, reply } => {
                reply.send(self.core.peers_by_group(&group)).ok();
            }
            ToEngineActor::PeerAddress { peer, reply } => {
                reply.send(self.core.peer_address(&peer)).ok();
            }
            ToEngineActor::PeerHeader { peer, key, reply } => {
                reply.send(self.core.peer_header_value(&peer, &key)).ok();
            }
            // Handled by the run loop.
            ToEngineActor::Shutdown { .. } => {}
        }
    }

    fn on_net_event(&mut self, event: NetEvent) {
        match event {
            NetEvent::Envelope {
                conn,
                from,
                envelope,
            } => {
                // Frames still queued from a connection we already dropped.
                let Some(inbound) = self.inbound.get_mut(&conn) else {
                    return;
                };
                let sender = envelope.sender;
                if let Message::Hello { .. } = envelope.message {
                    inbound.peer = Some(sender);
                } else if inbound.peer != Some(sender) {
                    warn!(conn, peer = %sender, "sender changed mid-connection, dropping it");
                    self.close_inbound(conn);
                    return;
                }
                match self.core.on_envelope(envelope, from, Instant::now()) {
                    Ok(actions) => self.apply(actions),
                    Err(err) => {
                        warn!(conn, peer = %sender, %err, "protocol violation, dropping connection");
                        self.close_inbound(conn);
                    }
                }
            }
            NetEvent::InboundClosed { conn } => {
                self.inbound.remove(&conn);
            }
            NetEvent::LinkLost { peer, link } => {
                // A replaced link may report after its successor is up.
                if self.links.get(&peer).map(Link::id) == Some(link) {
                    self.links.remove(&peer);
                    self.core.on_link_lost(peer);
                }
            }
        }
    }

    fn on_accept(&mut self, stream: TcpStream, from: SocketAddr) {
        let conn = self.next_conn;
        self.next_conn += 1;
        trace!(conn, %from, "accepted connection");
        let handle = transport::spawn_inbound(
            conn,
            stream,
            from,
            self.handshake_timeout,
            self.net_tx.clone(),
        );
        self.inbound.insert(conn, Inbound { peer: None, handle });
    }

    /// Perform core actions in order.
    fn apply(&mut self, actions: Vec<Action>) {
        for action in actions {
            match action {
                Action::Connect { peer, endpoint } => {
                    let id = self.next_link;
                    self.next_link += 1;
                    debug!(%peer, %endpoint, link = id, "connecting");
                    let link = transport::spawn_link(
                        id,
                        peer,
                        endpoint,
                        self.handshake_timeout,
                        self.net_tx.clone(),
                    );
                    self.links.insert(peer, link);
                }
                Action::Send { peer, frame } => match self.links.get(&peer) {
                    Some(link) => {
                        if !link.send(frame) {
                            debug!(%peer, "link closed, frame dropped");
                        }
                    }
                    None => debug!(%peer, "no link, frame dropped"),
                },
                Action::Disconnect { peer } => {
                    self.links.remove(&peer);
                    let conns: Vec<ConnId> = self
                        .inbound
                        .iter()
                        .filter(|(_, inbound)| inbound.peer == Some(peer))
                        .map(|(conn, _)| *conn)
                        .collect();
                    for conn in conns {
                        self.close_inbound(conn);
                    }
                }
                Action::Emit(event) => {
                    if self.events.send(event).is_err() {
                        trace!("event receiver dropped");
                    }
                }
            }
        }
    }

    fn close_inbound(&mut self, conn: ConnId) {
        if let Some(inbound) = self.inbound.remove(&conn) {
            inbound.handle.abort();
        }
    }

    /// Announce departure, then close every link and reader.
    async fn shutdown(&mut self) -> Result<()> {
        let departed = self
            .beacon
            .publish(&Beacon::departure(self.core.id()))
            .await
            .context("sending departure beacon");
        let actions = self.core.shutdown();
        self.apply(actions);
        self.links.clear();
        for (_, inbound) in self.inbound.drain() {
            inbound.handle.abort();
        }
        departed
    }
}
