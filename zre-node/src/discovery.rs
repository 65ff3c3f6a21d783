//! LAN discovery: UDP broadcast beacons on the shared discovery port.

use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};

use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tracing::{debug, trace};
use zre_core::beacon::BEACON_SIZE;
use zre_core::Beacon;

/// One socket per node, bound with address reuse so several nodes on a host
/// share the discovery port.
pub struct BeaconSocket {
    socket: UdpSocket,
    destination: SocketAddr,
}

impl BeaconSocket {
    /// Must be called inside a tokio runtime.
    pub fn bind(bind: Ipv4Addr, port: u16, destination: Ipv4Addr) -> io::Result<Self> {
        let socket = make_broadcast_socket(bind, port)?;
        Ok(Self {
            socket,
            destination: SocketAddr::from((destination, port)),
        })
    }

    pub async fn publish(&self, beacon: &Beacon) -> io::Result<()> {
        self.socket
            .send_to(&beacon.encode(), self.destination)
            .await
            .map(|_| ())
    }

    /// Next datagram. `Ok(None)` for anything that is not a valid beacon.
    /// Cancel safe.
    pub async fn recv(&self) -> io::Result<Option<(Beacon, IpAddr)>> {
        // One spare byte so oversized datagrams fail the size check.
        let mut buf = [0u8; BEACON_SIZE + 1];
        let (n, from) = self.socket.recv_from(&mut buf).await?;
        match Beacon::decode(&buf[..n]) {
            Ok(beacon) => {
                trace!(node = %beacon.node, port = beacon.port, %from, "beacon");
                Ok(Some((beacon, from.ip())))
            }
            Err(err) => {
                debug!(%from, %err, "ignoring datagram");
                Ok(None)
            }
        }
    }
}

fn make_broadcast_socket(bind: Ipv4Addr, port: u16) -> io::Result<UdpSocket> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    #[cfg(all(unix, not(any(target_os = "solaris", target_os = "illumos"))))]
    socket.set_reuse_port(true)?;
    socket.set_broadcast(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&SocketAddr::from((bind, port)).into())?;
    UdpSocket::from_std(socket.into())
}
