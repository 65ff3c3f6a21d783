//! Public node handle. Commands go to the engine task; events come back on an ordered queue.

use std::net::SocketAddr;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{info, warn};
use zre_core::{CommandError, Event, Headers, NodeCore, NodeId, NodeIdentity, Payload};

use crate::config::Config;
use crate::discovery::BeaconSocket;
use crate::engine::{EngineActor, ToEngineActor};
use crate::error::Error;

const INBOX_CAPACITY: usize = 256;

struct Running {
    inbox: mpsc::Sender<ToEngineActor>,
    handle: JoinHandle<()>,
}

/// A participant in the proximity network.
///
/// Identity is fixed for the lifetime of the handle and survives stop/start.
pub struct Node {
    config: Config,
    identity: NodeIdentity,
    headers: Headers,
    running: Option<Running>,
    events: Option<mpsc::UnboundedReceiver<Event>>,
}

impl Node {
    pub fn new(config: Config) -> Self {
        let identity = NodeIdentity::generate(config.name.clone());
        let headers = config.headers.clone();
        Self {
            config,
            identity,
            headers,
            running: None,
            events: None,
        }
    }

    pub fn with_name(name: impl Into<String>) -> Self {
        Self::new(Config {
            name: Some(name.into()),
            ..Config::default()
        })
    }

    pub fn uuid(&self) -> NodeId {
        self.identity.id()
    }

    pub fn name(&self) -> &str {
        self.identity.name()
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn is_running(&self) -> bool {
        self.running.is_some()
    }

    /// Stored locally and carried in every later Hello. Not network traffic by itself.
    pub async fn set_header(
        &mut self,
        key: impl Into<String>,
        value: impl Into<String>,
    ) -> Result<(), Error> {
        let (key, value) = (key.into(), value.into());
        self.headers.insert(key.clone(), value.clone());
        if self.running.is_some() {
            self.send(ToEngineActor::SetHeader { key, value }).await?;
        }
        Ok(())
    }

    /// Bind sockets and spawn the engine. A no-op if already running.
    ///
    /// On failure nothing is left running and the call can be retried.
    pub async fn start(&mut self) -> Result<(), Error> {
        if self.running.is_some() {
            return Ok(());
        }
        self.config.validate()?;

        let listener = TcpListener::bind((self.config.bind_address, self.config.mailbox_port))
            .await
            .map_err(|source| Error::Bind {
                what: "mailbox listener",
                source,
            })?;
        let mailbox_port = listener
            .local_addr()
            .map_err(|source| Error::Bind {
                what: "mailbox listener",
                source,
            })?
            .port();
        let beacon = BeaconSocket::bind(
            self.config.bind_address,
            self.config.discovery_port,
            self.config.beacon_address,
        )
        .map_err(|source| Error::Bind {
            what: "beacon socket",
            source,
        })?;

        let core = NodeCore::new(self.identity.clone(), mailbox_port, self.config.timeouts())
            .with_headers(self.headers.clone());
        let (inbox_tx, inbox_rx) = mpsc::channel(INBOX_CAPACITY);
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (ready_tx, ready_rx) = oneshot::channel();
        let actor = EngineActor::new(core, &self.config, beacon, listener, inbox_rx, events_tx);
        let handle = tokio::spawn(actor.run(ready_tx));
        ready_rx.await.map_err(|_| Error::EngineStopped)?;

        info!(
            node = %self.uuid(),
            name = self.name(),
            mailbox_port,
            discovery_port = self.config.discovery_port,
            "node started"
        );
        self.events = Some(events_rx);
        self.running = Some(Running {
            inbox: inbox_tx,
            handle,
        });
        Ok(())
    }

    /// Send a departure beacon, close every link and wait for the engine to
    /// finish. Events already queued stay readable. A no-op if not running.
    pub async fn stop(&mut self) {
        let Some(running) = self.running.take() else {
            return;
        };
        let (reply, done) = oneshot::channel();
        if running
            .inbox
            .send(ToEngineActor::Shutdown { reply })
            .await
            .is_ok()
        {
            done.await.ok();
        }
        if let Err(err) = running.handle.await {
            warn!(%err, "engine task failed");
        }
        info!(node = %self.uuid(), "node stopped");
    }

    pub async fn join(&self, group: impl Into<String>) -> Result<(), Error> {
        self.send(ToEngineActor::Join {
            group: group.into(),
        })
        .await
    }

    pub async fn leave(&self, group: impl Into<String>) -> Result<(), Error> {
        self.send(ToEngineActor::Leave {
            group: group.into(),
        })
        .await
    }

    /// Unicast. An unknown or unreachable peer drops the message silently.
    pub async fn whisper(&self, peer: NodeId, payload: impl Into<Payload>) -> Result<(), Error> {
        self.send(ToEngineActor::Whisper {
            peer,
            payload: payload.into(),
        })
        .await
    }

    pub async fn whispers(&self, peer: NodeId, text: &str) -> Result<(), Error> {
        self.whisper(peer, Payload::from(text)).await
    }

    /// Send to every peer currently known to be in `group`.
    pub async fn shout(
        &self,
        group: impl Into<String>,
        payload: impl Into<Payload>,
    ) -> Result<(), Error> {
        let group = group.into();
        let payload = payload.into();
        let result = self
            .request(|reply| ToEngineActor::Shout {
                group,
                payload,
                reply,
            })
            .await?;
        result.map_err(|CommandError::UnknownGroup(group)| Error::UnknownGroup(group))
    }

    pub async fn shouts(&self, group: impl Into<String>, text: &str) -> Result<(), Error> {
        self.shout(group, Payload::from(text)).await
    }

    /// Next event, waiting as long as it takes. `None` once the node has
    /// stopped and the queue is drained, or if it never started.
    pub async fn recv(&mut self) -> Option<Event> {
        self.events.as_mut()?.recv().await
    }

    /// Like [`Node::recv`], but `None` after `timeout` with nothing to read.
    pub async fn recv_timeout(&mut self, timeout: Duration) -> Option<Event> {
        tokio::time::timeout(timeout, self.recv())
            .await
            .ok()
            .flatten()
    }

    /// Peers that completed the handshake.
    pub async fn peers(&self) -> Result<Vec<NodeId>, Error> {
        self.request(|reply| ToEngineActor::Peers { reply }).await
    }

    /// Groups this node has joined.
    pub async fn own_groups(&self) -> Result<Vec<String>, Error> {
        self.request(|reply| ToEngineActor::OwnGroups { reply })
            .await
    }

    /// Groups that at least one known peer has joined.
    pub async fn peer_groups(&self) -> Result<Vec<String>, Error> {
        self.request(|reply| ToEngineActor::PeerGroups { reply })
            .await
    }

    pub async fn peers_by_group(&self, group: impl Into<String>) -> Result<Vec<NodeId>, Error> {
        let group = group.into();
        self.request(|reply| ToEngineActor::PeersByGroup { group, reply })
            .await
    }

    pub async fn peer_address(&self, peer: NodeId) -> Result<Option<SocketAddr>, Error> {
        self.request(|reply| ToEngineActor::PeerAddress { peer, reply })
            .await
    }

    pub async fn peer_header_value(
        &self,
        peer: NodeId,
        key: impl Into<String>,
    ) -> Result<Option<String>, Error> {
        let key = key.into();
        self.request(|reply| ToEngineActor::PeerHeader { peer, key, reply })
            .await
    }

    async fn send(&self, msg: ToEngineActor) -> Result<(), Error> {
        let running = self.running.as_ref().ok_or(Error::NotStarted)?;
        running
            .inbox
            .send(msg)
            .await
            .map_err(|_| Error::EngineStopped)
    }

    async fn request<T>(
        &self,
        msg: impl FnOnce(oneshot::Sender<T>) -> ToEngineActor,
    ) -> Result<T, Error> {
        let (reply, rx) = oneshot::channel();
        self.send(msg(reply)).await?;
        rx.await.map_err(|_| Error::EngineStopped)
    }
}

#[cfg(test)]
mod tests {
    use std::net::Ipv4Addr;

    use rand::Rng;
    use zre_core::EventKind;

    use super::*;

    fn random_port() -> u16 {
        rand::thread_rng().gen_range(20000..60000)
    }

    fn test_config(name: &str, discovery_port: u16) -> Config {
        Config {
            name: Some(name.into()),
            discovery_port,
            beacon_address: Ipv4Addr::new(127, 255, 255, 255),
            beacon_interval_ms: 100,
            reap_interval_ms: 50,
            ping_interval_ms: 200,
            evasive_timeout_ms: 1000,
            silent_timeout_ms: 1500,
            expired_timeout_ms: 2000,
            handshake_timeout_ms: 1000,
            ..Config::default()
        }
    }

    /// Next event that is not a liveness warning.
    async fn next(node: &mut Node) -> Event {
        loop {
            let event = node
                .recv_timeout(Duration::from_secs(10))
                .await
                .expect("timed out waiting for event");
            if !matches!(event.kind(), EventKind::Evasive | EventKind::Silent) {
                return event;
            }
        }
    }

    #[tokio::test]
    async fn two_nodes_enter_join_and_shout() {
        crate::logging::setup_tracing();
        let port = random_port();
        let mut t1 = Node::new(test_config("t1", port));
        t1.set_header("X-HELLO", "World").await.unwrap();
        let mut t2 = Node::new(test_config("t2", port));
        t2.set_header("test_header", "test2").await.unwrap();
        t1.start().await.unwrap();
        t2.start().await.unwrap();

        let ev = next(&mut t1).await;
        assert_eq!(ev.kind(), EventKind::Enter);
        assert_eq!(ev.peer(), t2.uuid());
        assert_eq!(ev.peer_name(), "t2");
        assert_eq!(ev.header("test_header"), Some("test2"));

        let ev = next(&mut t2).await;
        assert_eq!(ev.kind(), EventKind::Enter);
        assert_eq!(ev.peer(), t1.uuid());
        assert_eq!(ev.peer_name(), "t1");
        assert_eq!(ev.header("X-HELLO"), Some("World"));

        t1.join("test group").await.unwrap();
        t2.join("test group").await.unwrap();

        let ev = next(&mut t1).await;
        assert_eq!(ev.kind(), EventKind::Join);
        assert_eq!(ev.peer(), t2.uuid());
        assert_eq!(ev.group(), Some("test group"));

        let ev = next(&mut t2).await;
        assert_eq!(ev.kind(), EventKind::Join);
        assert_eq!(ev.peer(), t1.uuid());
        assert_eq!(ev.group(), Some("test group"));

        t1.shouts("test group", "Hello World").await.unwrap();
        let ev = next(&mut t2).await;
        assert_eq!(ev.kind(), EventKind::Shout);
        assert_eq!(ev.peer(), t1.uuid());
        assert_eq!(ev.group(), Some("test group"));
        assert_eq!(ev.payload().and_then(Payload::first_str), Some("Hello World"));

        t2.whispers(t1.uuid(), "psst").await.unwrap();
        let ev = next(&mut t1).await;
        assert_eq!(ev.kind(), EventKind::Whisper);
        assert_eq!(ev.peer(), t2.uuid());
        assert_eq!(ev.payload().and_then(Payload::first_str), Some("psst"));

        assert_eq!(t1.peers().await.unwrap(), vec![t2.uuid()]);
        assert_eq!(t1.own_groups().await.unwrap(), vec!["test group"]);
        assert_eq!(t1.peer_groups().await.unwrap(), vec!["test group"]);
        assert_eq!(
            t1.peers_by_group("test group").await.unwrap(),
            vec![t2.uuid()]
        );
        assert_eq!(
            t1.peer_header_value(t2.uuid(), "test_header").await.unwrap(),
            Some("test2".to_string())
        );
        let addr = t1.peer_address(t2.uuid()).await.unwrap().unwrap();
        assert!(addr.ip().is_loopback());

        t1.stop().await;
        let ev = next(&mut t2).await;
        assert_eq!(ev.kind(), EventKind::Leave);
        assert_eq!(ev.peer(), t1.uuid());
        assert_eq!(ev.group(), Some("test group"));
        let ev = next(&mut t2).await;
        assert_eq!(ev.kind(), EventKind::Exit);
        assert_eq!(ev.peer(), t1.uuid());
        assert!(t2.peers().await.unwrap().is_empty());
        t2.stop().await;
    }

    #[tokio::test]
    async fn lifecycle_is_idempotent_and_guards_commands() {
        let mut node = Node::new(test_config("solo", random_port()));
        assert!(matches!(node.join("g").await, Err(Error::NotStarted)));
        assert!(matches!(node.peers().await, Err(Error::NotStarted)));
        assert!(node.recv_timeout(Duration::from_millis(10)).await.is_none());
        node.stop().await;

        node.start().await.unwrap();
        node.start().await.unwrap();
        assert!(node.is_running());
        assert!(matches!(
            node.shouts("nobody", "x").await,
            Err(Error::UnknownGroup(g)) if g == "nobody"
        ));
        node.join("g").await.unwrap();
        node.join("g").await.unwrap();
        node.shouts("g", "x").await.unwrap();
        assert_eq!(node.own_groups().await.unwrap(), vec!["g"]);
        node.whispers(NodeId::generate(), "lost").await.unwrap();
        node.leave("missing").await.unwrap();
        assert!(node.recv_timeout(Duration::from_millis(300)).await.is_none());

        node.stop().await;
        node.stop().await;
        assert!(!node.is_running());
        assert!(matches!(node.leave("g").await, Err(Error::NotStarted)));
        assert!(node.recv().await.is_none());

        let id = node.uuid();
        node.start().await.unwrap();
        assert_eq!(node.uuid(), id);
        assert!(node.own_groups().await.unwrap().is_empty());
        node.stop().await;
    }

    #[tokio::test]
    async fn invalid_config_keeps_node_stopped() {
        let mut config = test_config("bad", random_port());
        config.evasive_timeout_ms = 50;
        let mut node = Node::new(config);
        assert!(matches!(node.start().await, Err(Error::Config(_))));
        assert!(!node.is_running());
    }

    #[tokio::test]
    async fn bind_failure_is_retryable() {
        let taken = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let mut config = test_config("busy", random_port());
        config.bind_address = Ipv4Addr::LOCALHOST;
        config.mailbox_port = taken.local_addr().unwrap().port();
        let mut node = Node::new(config);
        assert!(matches!(
            node.start().await,
            Err(Error::Bind { what: "mailbox listener", .. })
        ));
        assert!(!node.is_running());

        drop(taken);
        node.start().await.unwrap();
        node.stop().await;
    }

    #[test]
    fn default_name_is_short_id() {
        let node = Node::new(Config::default());
        assert_eq!(node.name(), node.uuid().short());
        assert_eq!(node.name().len(), 6);
        let named = Node::with_name("t1");
        assert_eq!(named.name(), "t1");
        assert!(!named.is_running());
    }
}
