//! Transport links.
//!
//! One packet-oriented abstraction over the supported transports:
//!
//! - **UDP**: one packet per datagram, connected socket, stray-source drops
//! - **TCP**: 16-bit big-endian length prefix per record, size-bounded
//! - **TCP via HTTP proxy**: a `CONNECT` handshake, then plain TCP framing
//! - **DCO**: kernel data-channel offload behind a device capability
//!
//! The connect loop owns exactly one link per attempt and is the only
//! caller; links surface typed errors and never retry on their own.

mod dco;
mod proxy;
mod tcp;
mod udp;

pub use dco::{DcoDevice, DcoHandoff, DcoStats};
pub use proxy::{connect_via_proxy, ProxyConfig};
pub use tcp::TcpLink;
pub use udp::UdpLink;

use std::net::SocketAddr;
use std::time::Duration;

use bytes::Bytes;
use tokio::time::timeout;

use crate::error::{Error, ErrorCode, Result};
use crate::protocol::MAX_PACKET;
use crate::remote::{IpVersion, Protocol, Remote};

/// Resolve a remote into candidate socket addresses, honouring its IP
/// version constraint. A literal IP short-circuits without a lookup.
pub async fn resolve(remote: &Remote) -> Result<Vec<SocketAddr>> {
    if let Some(addr) = remote.resolved {
        return Ok(vec![addr]);
    }
    let addrs: Vec<SocketAddr> =
        tokio::net::lookup_host((remote.host.as_str(), remote.port))
            .await
            .map_err(|e| {
                Error::tagged(
                    ErrorCode::ResolveError,
                    format!("cannot resolve {}: {e}", remote.host),
                )
            })?
            .filter(|addr| match remote.ip_version {
                IpVersion::Any => true,
                IpVersion::V4 => addr.is_ipv4(),
                IpVersion::V6 => addr.is_ipv6(),
            })
            .collect();
    if addrs.is_empty() {
        return Err(Error::tagged(
            ErrorCode::ResolveError,
            format!("no usable addresses for {}", remote.host),
        ));
    }
    Ok(addrs)
}

/// An established transport link.
pub enum Link {
    Udp(UdpLink),
    Tcp(TcpLink),
}

impl Link {
    /// Connect to a resolved address within a deadline. `proxy` applies to
    /// the proxied transport only.
    pub async fn connect(
        remote: &Remote,
        addr: SocketAddr,
        deadline: Duration,
        proxy: Option<&ProxyConfig>,
    ) -> Result<Link> {
        match remote.protocol {
            Protocol::Udp => {
                let link = timeout(deadline, UdpLink::connect(addr))
                    .await
                    .map_err(|_| {
                        Error::tagged(ErrorCode::UdpConnectError, "UDP connect timeout")
                    })??;
                Ok(Link::Udp(link))
            }
            Protocol::Tcp => {
                let link = timeout(deadline, TcpLink::connect(addr))
                    .await
                    .map_err(|_| {
                        Error::tagged(ErrorCode::TcpConnectError, "TCP connect timeout")
                    })??;
                Ok(Link::Tcp(link))
            }
            Protocol::TcpViaHttp => {
                let proxy = proxy.ok_or_else(|| {
                    Error::tagged(ErrorCode::ProxyError, "proxy transport without proxy config")
                })?;
                let stream = timeout(
                    deadline,
                    connect_via_proxy(proxy, &remote.host, remote.port),
                )
                .await
                .map_err(|_| Error::tagged(ErrorCode::ProxyError, "proxy connect timeout"))??;
                Ok(Link::Tcp(TcpLink::from_stream(stream)))
            }
        }
    }

    /// Send one packet.
    pub async fn send(&mut self, packet: Bytes) -> Result<()> {
        if packet.is_empty() || packet.len() > MAX_PACKET {
            return Err(Error::tagged(
                ErrorCode::BufferError,
                format!("bad outgoing packet size {}", packet.len()),
            ));
        }
        match self {
            Link::Udp(link) => link.send(packet).await,
            Link::Tcp(link) => link.send(packet).await,
        }
    }

    /// Receive one packet.
    pub async fn recv(&mut self) -> Result<Bytes> {
        match self {
            Link::Udp(link) => link.recv().await,
            Link::Tcp(link) => link.recv().await,
        }
    }

    /// Bytes queued but not yet handed to the kernel.
    pub fn send_queue_size(&self) -> usize {
        match self {
            Link::Udp(_) => 0,
            Link::Tcp(link) => link.send_queue_size(),
        }
    }

    /// Raw socket descriptor for `socket_protect`, or -1 when unavailable.
    pub fn raw_fd(&self) -> i64 {
        match self {
            Link::Udp(link) => link.raw_fd(),
            Link::Tcp(link) => link.raw_fd(),
        }
    }

    /// The connected peer address.
    pub fn peer_addr(&self) -> SocketAddr {
        match self {
            Link::Udp(link) => link.peer_addr(),
            Link::Tcp(link) => link.peer_addr(),
        }
    }

    /// Shut the link down.
    pub async fn stop(&mut self) {
        if let Link::Tcp(link) = self {
            link.stop().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::{IpVersion, Protocol, Remote};

    #[tokio::test]
    async fn test_resolve_literal_ip() {
        let remote = Remote::new("192.0.2.7", 1194, Protocol::Udp, IpVersion::Any).unwrap();
        let addrs = resolve(&remote).await.unwrap();
        assert_eq!(addrs, vec!["192.0.2.7:1194".parse().unwrap()]);
    }

    #[tokio::test]
    async fn test_resolve_localhost_v4_filter() {
        let remote = Remote::new("localhost", 1194, Protocol::Udp, IpVersion::V4).unwrap();
        let addrs = resolve(&remote).await.unwrap();
        assert!(addrs.iter().all(|a| a.is_ipv4()));
    }

    #[tokio::test]
    async fn test_udp_link_round_trip() {
        let server = tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let server_addr = server.local_addr().unwrap();

        let remote =
            Remote::new(&server_addr.ip().to_string(), server_addr.port(), Protocol::Udp, IpVersion::V4)
                .unwrap();
        let mut link = Link::connect(&remote, server_addr, Duration::from_secs(5), None)
            .await
            .unwrap();
        assert!(link.raw_fd() != 0);

        link.send(Bytes::from_static(b"hello")).await.unwrap();
        let mut buf = [0u8; 64];
        let (n, client_addr) = server.recv_from(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"hello");

        server.send_to(b"reply", client_addr).await.unwrap();
        let got = link.recv().await.unwrap();
        assert_eq!(got.as_ref(), b"reply");
    }

    #[tokio::test]
    async fn test_tcp_link_framing() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let accept = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            TcpLink::from_stream(stream)
        });

        let remote =
            Remote::new(&addr.ip().to_string(), addr.port(), Protocol::Tcp, IpVersion::V4)
                .unwrap();
        let mut client = Link::connect(&remote, addr, Duration::from_secs(5), None)
            .await
            .unwrap();
        let mut server = accept.await.unwrap();

        client.send(Bytes::from_static(b"framed packet")).await.unwrap();
        let got = server.recv().await.unwrap();
        assert_eq!(got.as_ref(), b"framed packet");

        server.send(Bytes::from_static(b"response")).await.unwrap();
        let got = client.recv().await.unwrap();
        assert_eq!(got.as_ref(), b"response");
    }

    #[tokio::test]
    async fn test_oversized_send_rejected() {
        let server = tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = server.local_addr().unwrap();
        let remote =
            Remote::new(&addr.ip().to_string(), addr.port(), Protocol::Udp, IpVersion::V4)
                .unwrap();
        let mut link = Link::connect(&remote, addr, Duration::from_secs(5), None)
            .await
            .unwrap();
        let big = Bytes::from(vec![0u8; MAX_PACKET + 1]);
        let err = link.send(big).await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::BufferError);
    }
}
