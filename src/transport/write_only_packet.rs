//! Server-side reply handle over a shared listening socket (spec §4.2:
//! "the server's inbound packet and ICMP-disguised traffic is pumped by one
//! listener per bound address; an endpoint fed by that listener writes
//! through a handle to the shared socket rather than owning a dial'd one").
//!
//! Grounded on the original `writeOnlyConn`, whose `Read` method panics
//! because nothing should ever call it — the shared listener's own read loop
//! is what feeds data to this endpoint. A panic in a trait method is not
//! idiomatic here, so [`WriteOnlyPacket::read_datagram`] returns an error
//! instead.

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::net::UdpSocket;

use crate::obfuscator::Obfuscator;

use super::icmp_disguised;
use super::{Transport, TransportTag};

/// Extra state a write-only handle needs when it's disguising replies as
/// ICMP echo traffic: the identifier the inbound echo request carried (it
/// must come back unchanged for the dial side's filter to accept it) and a
/// sequence counter of its own.
struct IcmpReplyState {
    is_ipv6: bool,
    identifier: u16,
    next_seq: AtomicU16,
}

pub struct WriteOnlyPacket {
    socket: Arc<UdpSocket>,
    obfuscator: Arc<dyn Obfuscator>,
    remote_addr: SocketAddr,
    tag: TransportTag,
    icmp: Option<IcmpReplyState>,
}

impl WriteOnlyPacket {
    /// A plain UDP-like write-only handle: outbound bytes cross the wire
    /// unchanged apart from obfuscation.
    pub fn new(
        socket: Arc<UdpSocket>,
        obfuscator: Arc<dyn Obfuscator>,
        remote_addr: SocketAddr,
        tag: TransportTag,
    ) -> Self {
        Self {
            socket,
            obfuscator,
            remote_addr,
            tag,
            icmp: None,
        }
    }

    /// A write-only handle replying over the ICMP-disguised carrier. Every
    /// write is wrapped in an echo-reply header carrying `identifier` —
    /// captured from the echo request that created this handle — so the
    /// dial side's `IcmpDisguised::read_datagram` filter accepts it.
    pub fn new_icmp_reply(
        socket: Arc<UdpSocket>,
        obfuscator: Arc<dyn Obfuscator>,
        remote_addr: SocketAddr,
        is_ipv6: bool,
        identifier: u16,
    ) -> Self {
        Self {
            socket,
            obfuscator,
            remote_addr,
            tag: TransportTag::IcmpDisguised,
            icmp: Some(IcmpReplyState {
                is_ipv6,
                identifier,
                next_seq: AtomicU16::new(0),
            }),
        }
    }
}

#[async_trait]
impl Transport for WriteOnlyPacket {
    async fn read_datagram(&self) -> io::Result<Vec<u8>> {
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "write-only packet handle has no read side; reads are pumped by the shared listener",
        ))
    }

    async fn write_datagram(&self, data: &[u8]) -> io::Result<()> {
        let wire = self.obfuscator.encode_datagram(data.to_vec());
        let wire = match &self.icmp {
            Some(icmp) => {
                let seq = icmp.next_seq.fetch_add(1, Ordering::Relaxed);
                icmp_disguised::build_echo_reply(icmp.is_ipv6, icmp.identifier, seq, &wire)
            }
            None => wire,
        };
        self.socket.send_to(&wire, self.remote_addr).await?;
        Ok(())
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    fn remote_addr(&self) -> io::Result<SocketAddr> {
        Ok(self.remote_addr)
    }

    async fn close(&self) -> io::Result<()> {
        // The shared socket outlives any one endpoint; there is nothing for
        // an individual handle to tear down.
        Ok(())
    }

    fn tag(&self) -> TransportTag {
        self.tag
    }

    fn is_write_only(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::obfuscator::IdentityObfuscator;

    #[tokio::test]
    async fn read_is_unsupported() {
        let socket = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
        let handle = WriteOnlyPacket::new(
            socket,
            Arc::new(IdentityObfuscator),
            "127.0.0.1:9".parse().unwrap(),
            TransportTag::Packet,
        );
        let err = handle.read_datagram().await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::Unsupported);
        assert!(handle.is_write_only());
    }

    #[tokio::test]
    async fn write_reaches_the_named_remote() {
        let socket = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
        let peer = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let peer_addr = peer.local_addr().unwrap();

        let handle = WriteOnlyPacket::new(socket, Arc::new(IdentityObfuscator), peer_addr, TransportTag::Packet);
        handle.write_datagram(b"pong").await.unwrap();

        let mut buf = [0u8; 16];
        let n = peer.recv(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"pong");
    }

    #[tokio::test]
    async fn icmp_reply_wraps_payload_in_an_echo_reply_header() {
        let socket = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
        let handle = WriteOnlyPacket::new_icmp_reply(
            socket,
            Arc::new(IdentityObfuscator),
            "127.0.0.1:0".parse().unwrap(),
            false,
            0xabcd,
        );
        // No real ICMP socket is bound in this test, so the send itself may
        // fail (raw sockets need privilege); this only exercises the framing
        // helper is reachable through the write path without panicking on
        // the `icmp` branch.
        let _ = handle.write_datagram(b"pong").await;
        assert!(handle.is_write_only());
    }
}
