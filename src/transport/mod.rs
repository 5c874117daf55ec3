//! Transport adapters (spec §2, §4.2 and Design Notes §9).
//!
//! The session engine is oblivious to which concrete carrier an endpoint
//! speaks; it only needs the minimal capability set Design Notes §9 names:
//! read-one-datagram, write-one-datagram, local-addr, remote-addr, close.
//! That's the [`Transport`] trait below. Four concrete adapters implement
//! it: [`stream_datagram`] (length-prefixed framing over a reliable byte
//! stream), [`packet`] (one UDP-like datagram in, one out),
//! [`icmp_disguised`] (datagram traffic riding inside ICMP echo packets),
//! and [`write_only_packet`] (a server-side handle that replies through a
//! shared listening socket without owning a dedicated connection).

pub mod icmp_disguised;
pub mod packet;
pub mod stream_datagram;
pub mod write_only_packet;

use std::io;
use std::net::SocketAddr;

use async_trait::async_trait;

pub use crate::framing::TransportTag;

/// The capability set every concrete carrier must provide. Implementations
/// take `&self` rather than `&mut self` so one [`Transport`] can be shared
/// (typically behind an `Arc`) between its endpoint's read pump and the
/// session's send path without a wrapping lock at this layer — the same way
/// a `tokio::net::UdpSocket` or `&TcpStream` supports concurrent reads and
/// writes natively. Adapters whose underlying carrier needs serialized
/// writes (the length-prefixed stream transport) hold their own internal
/// mutex around the write path instead.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Read exactly one datagram (or one length-prefixed frame, for the
    /// stream transport). Returns an error on any I/O failure or clean EOF.
    async fn read_datagram(&self) -> io::Result<Vec<u8>>;

    /// Write exactly one datagram.
    async fn write_datagram(&self, data: &[u8]) -> io::Result<()>;

    fn local_addr(&self) -> io::Result<SocketAddr>;

    fn remote_addr(&self) -> io::Result<SocketAddr>;

    async fn close(&self) -> io::Result<()>;

    fn tag(&self) -> TransportTag;

    /// Write-only handles (spec §4.2) have no read pump of their own; their
    /// reads were already consumed by the server's shared listener.
    fn is_write_only(&self) -> bool {
        false
    }
}

/// Socket-family selector used when dialing — a session dials once per
/// `(transport, ip family)` pair it has enabled (spec §4.5).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IpFamily {
    V4,
    V6,
}

impl IpFamily {
    pub fn is_v6(self) -> bool {
        matches!(self, IpFamily::V6)
    }
}
