//! TCP link: length-prefixed records over a stream.
//!
//! Each record is a 16-bit big-endian length followed by the packet. A
//! record length of zero or beyond the packet bound is unrecoverable and
//! terminates the link.

use std::net::SocketAddr;

use bytes::{BufMut, Bytes, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use crate::error::{Error, ErrorCode, Result};
use crate::protocol::MAX_PACKET;

/// Cap on bytes buffered for sending before the link declares overflow.
const SEND_QUEUE_CAP: usize = 256 * 1024;

/// A TCP (or proxied-TCP) link.
pub struct TcpLink {
    stream: TcpStream,
    peer: SocketAddr,
    queued: usize,
}

impl TcpLink {
    /// Connect to the peer.
    pub async fn connect(peer: SocketAddr) -> Result<Self> {
        let stream = TcpStream::connect(peer).await.map_err(|e| {
            Error::tagged(
                ErrorCode::TcpConnectError,
                format!("TCP connect to {peer} failed: {e}"),
            )
        })?;
        stream.set_nodelay(true).map_err(Error::Network)?;
        Ok(Self::from_stream(stream))
    }

    /// Wrap an already-connected stream (plain or proxied).
    pub fn from_stream(stream: TcpStream) -> Self {
        let peer = stream
            .peer_addr()
            .unwrap_or_else(|_| "0.0.0.0:0".parse().expect("literal address"));
        let _ = stream.set_nodelay(true);
        Self {
            stream,
            peer,
            queued: 0,
        }
    }

    /// Send one record.
    pub async fn send(&mut self, packet: Bytes) -> Result<()> {
        if self.queued + packet.len() > SEND_QUEUE_CAP {
            return Err(Error::tagged(
                ErrorCode::TcpOverflow,
                "TCP output queue overflow",
            ));
        }
        self.queued += packet.len();
        let mut record = BytesMut::with_capacity(2 + packet.len());
        record.put_u16(packet.len() as u16);
        record.put_slice(&packet);
        let result = self.stream.write_all(&record).await.map_err(|e| {
            Error::tagged(ErrorCode::NetworkSendError, format!("TCP send: {e}"))
        });
        self.queued -= packet.len();
        result
    }

    /// Receive one record.
    pub async fn recv(&mut self) -> Result<Bytes> {
        let mut prefix = [0u8; 2];
        self.stream.read_exact(&mut prefix).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::UnexpectedEof {
                Error::tagged(ErrorCode::NetworkEofError, "TCP EOF")
            } else {
                Error::tagged(ErrorCode::NetworkRecvError, format!("TCP recv: {e}"))
            }
        })?;
        let len = u16::from_be_bytes(prefix) as usize;
        if len == 0 || len > MAX_PACKET {
            return Err(Error::tagged(
                ErrorCode::TcpSizeError,
                format!("bad embedded record size {len}"),
            ));
        }
        let mut body = vec![0u8; len];
        self.stream.read_exact(&mut body).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::UnexpectedEof {
                Error::tagged(ErrorCode::NetworkEofError, "TCP EOF in record")
            } else {
                Error::tagged(ErrorCode::NetworkRecvError, format!("TCP recv: {e}"))
            }
        })?;
        Ok(Bytes::from(body))
    }

    /// Bytes currently buffered for sending.
    pub fn send_queue_size(&self) -> usize {
        self.queued
    }

    /// Connected peer.
    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    /// Raw descriptor for `socket_protect`.
    pub fn raw_fd(&self) -> i64 {
        #[cfg(unix)]
        {
            use std::os::fd::AsRawFd;
            self.stream.as_raw_fd() as i64
        }
        #[cfg(not(unix))]
        {
            -1
        }
    }

    /// Close the write side.
    pub async fn stop(&mut self) {
        let _ = self.stream.shutdown().await;
    }
}
