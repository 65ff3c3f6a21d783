//! Peer links over TCP: one outbound writer per peer, one reader per accepted connection.
//!
//! Links are one-way. We dial a peer's mailbox to send, and read whatever
//! peers send to our own listener. Tasks never touch node state; they report
//! to the engine through [`NetEvent`].

use std::io;
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::AbortHandle;
use tokio::time::timeout;
use tracing::debug;
use zre_core::wire::{decode_body, frame_len, LEN_SIZE};
use zre_core::{Envelope, Message, NodeId};

pub type LinkId = u64;
pub type ConnId = u64;

/// Reports from link tasks to the engine.
#[derive(Debug)]
pub enum NetEvent {
    Envelope {
        conn: ConnId,
        from: IpAddr,
        envelope: Envelope,
    },
    InboundClosed {
        conn: ConnId,
    },
    LinkLost {
        peer: NodeId,
        link: LinkId,
    },
}

/// Sending half of an outbound link. Dropping it flushes queued frames and closes the socket.
pub struct Link {
    id: LinkId,
    tx: mpsc::UnboundedSender<Vec<u8>>,
}

impl Link {
    pub fn id(&self) -> LinkId {
        self.id
    }

    /// Queue an encoded frame. False if the link task has already ended.
    pub fn send(&self, frame: Vec<u8>) -> bool {
        self.tx.send(frame).is_ok()
    }
}

/// Dial `endpoint` and write queued frames until the link is dropped or fails.
pub fn spawn_link(
    id: LinkId,
    peer: NodeId,
    endpoint: SocketAddr,
    connect_timeout: Duration,
    net_tx: mpsc::Sender<NetEvent>,
) -> Link {
    let (tx, rx) = mpsc::unbounded_channel::<Vec<u8>>();
    tokio::spawn(async move {
        if let Err(err) = run_link(endpoint, connect_timeout, rx).await {
            debug!(%peer, %endpoint, %err, "outbound link failed");
            net_tx.send(NetEvent::LinkLost { peer, link: id }).await.ok();
        }
    });
    Link { id, tx }
}

async fn run_link(
    endpoint: SocketAddr,
    connect_timeout: Duration,
    mut rx: mpsc::UnboundedReceiver<Vec<u8>>,
) -> io::Result<()> {
    let stream = timeout(connect_timeout, TcpStream::connect(endpoint))
        .await
        .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "connect timed out"))??;
    stream.set_nodelay(true)?;
    let (mut reader, mut writer) = stream.into_split();
    // Nothing is ever sent back on this link; a readable socket means it closed.
    let mut probe = [0u8; 1];
    loop {
        tokio::select! {
            frame = rx.recv() => match frame {
                Some(frame) => writer.write_all(&frame).await?,
                None => break,
            },
            read = reader.read(&mut probe) => {
                return match read {
                    Ok(0) => Err(io::ErrorKind::UnexpectedEof.into()),
                    Ok(_) => Err(io::Error::new(io::ErrorKind::InvalidData, "unexpected data on outbound link")),
                    Err(err) => Err(err),
                };
            }
        }
    }
    writer.shutdown().await.ok();
    Ok(())
}

/// Read envelopes from an accepted connection. The first frame must be a
/// Hello within `handshake_timeout` or the connection is dropped silently.
pub fn spawn_inbound(
    conn: ConnId,
    stream: TcpStream,
    from: SocketAddr,
    handshake_timeout: Duration,
    net_tx: mpsc::Sender<NetEvent>,
) -> AbortHandle {
    tokio::spawn(async move {
        if let Err(err) = read_inbound(conn, stream, from.ip(), handshake_timeout, &net_tx).await {
            debug!(conn, %from, "inbound connection closed: {err:#}");
        }
        net_tx.send(NetEvent::InboundClosed { conn }).await.ok();
    })
    .abort_handle()
}

async fn read_inbound(
    conn: ConnId,
    mut stream: TcpStream,
    from: IpAddr,
    handshake_timeout: Duration,
    net_tx: &mpsc::Sender<NetEvent>,
) -> Result<()> {
    let first = timeout(handshake_timeout, read_envelope(&mut stream))
        .await
        .context("no hello before handshake timeout")??;
    if !matches!(first.message, Message::Hello { .. }) {
        bail!("first frame was {}", first.message.command());
    }
    let mut envelope = first;
    loop {
        net_tx
            .send(NetEvent::Envelope {
                conn,
                from,
                envelope,
            })
            .await
            .context("engine stopped")?;
        envelope = read_envelope(&mut stream).await?;
    }
}

async fn read_envelope<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Envelope> {
    let mut len_buf = [0u8; LEN_SIZE];
    reader.read_exact(&mut len_buf).await?;
    let len = frame_len(len_buf)?;
    let mut body = vec![0u8; len];
    reader.read_exact(&mut body).await?;
    Ok(decode_body(&body)?)
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use tokio::net::TcpListener;
    use zre_core::{encode_frame, PROTOCOL_VERSION};

    use super::*;

    fn hello(sender: NodeId) -> Envelope {
        Envelope {
            sequence: 1,
            sender,
            message: Message::Hello {
                protocol_version: PROTOCOL_VERSION,
                mailbox_port: 5000,
                name: "t1".into(),
                groups: Vec::new(),
                status: 0,
                headers: BTreeMap::new(),
            },
        }
    }

    async fn next(rx: &mut mpsc::Receiver<NetEvent>) -> NetEvent {
        timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap()
    }

    #[tokio::test]
    async fn link_delivers_frames_to_inbound_reader() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let endpoint = listener.local_addr().unwrap();
        let (net_tx, mut net_rx) = mpsc::channel(16);
        let sender = NodeId::generate();

        let link = spawn_link(7, sender, endpoint, Duration::from_secs(1), net_tx.clone());
        assert_eq!(link.id(), 7);
        assert!(link.send(encode_frame(&hello(sender)).unwrap()));
        let ping = Envelope {
            sequence: 2,
            sender,
            message: Message::Ping,
        };
        assert!(link.send(encode_frame(&ping).unwrap()));

        let (stream, from) = listener.accept().await.unwrap();
        let _reader = spawn_inbound(1, stream, from, Duration::from_secs(1), net_tx);

        match next(&mut net_rx).await {
            NetEvent::Envelope { conn, envelope, .. } => {
                assert_eq!(conn, 1);
                assert_eq!(envelope, hello(sender));
            }
            other => panic!("unexpected {other:?}"),
        }
        match next(&mut net_rx).await {
            NetEvent::Envelope { envelope, .. } => assert_eq!(envelope, ping),
            other => panic!("unexpected {other:?}"),
        }

        drop(link);
        match next(&mut net_rx).await {
            NetEvent::InboundClosed { conn } => assert_eq!(conn, 1),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn non_hello_first_frame_is_dropped() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let endpoint = listener.local_addr().unwrap();
        let (net_tx, mut net_rx) = mpsc::channel(16);

        let mut client = TcpStream::connect(endpoint).await.unwrap();
        let (stream, from) = listener.accept().await.unwrap();
        let _reader = spawn_inbound(3, stream, from, Duration::from_secs(1), net_tx);
        let ping = Envelope {
            sequence: 1,
            sender: NodeId::generate(),
            message: Message::Ping,
        };
        client
            .write_all(&encode_frame(&ping).unwrap())
            .await
            .unwrap();

        match next(&mut net_rx).await {
            NetEvent::InboundClosed { conn } => assert_eq!(conn, 3),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn silent_connection_times_out() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let endpoint = listener.local_addr().unwrap();
        let (net_tx, mut net_rx) = mpsc::channel(16);

        let _client = TcpStream::connect(endpoint).await.unwrap();
        let (stream, from) = listener.accept().await.unwrap();
        let _reader = spawn_inbound(4, stream, from, Duration::from_millis(100), net_tx);
        assert!(matches!(
            next(&mut net_rx).await,
            NetEvent::InboundClosed { conn: 4 }
        ));
    }

    #[tokio::test]
    async fn refused_connect_reports_link_lost() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let endpoint = listener.local_addr().unwrap();
        drop(listener);
        let (net_tx, mut net_rx) = mpsc::channel(16);
        let peer = NodeId::generate();
        let _link = spawn_link(9, peer, endpoint, Duration::from_secs(1), net_tx);
        match next(&mut net_rx).await {
            NetEvent::LinkLost { peer: p, link } => {
                assert_eq!(p, peer);
                assert_eq!(link, 9);
            }
            other => panic!("unexpected {other:?}"),
        }
    }
}
