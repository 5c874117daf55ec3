//! One UDP-like datagram in, one out (spec §4.2, dial side).
//!
//! This is the dialing half only: a [`PacketTransport`] owns a connected
//! socket and is used by a session that initiated the carrier itself. The
//! server's inbound side shares one listening socket across many remotes
//! instead — see [`super::write_only_packet`].

use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::net::UdpSocket;

use crate::obfuscator::Obfuscator;

use super::{Transport, TransportTag};

pub struct PacketTransport {
    socket: UdpSocket,
    obfuscator: Arc<dyn Obfuscator>,
    remote_addr: SocketAddr,
}

#[async_trait]
impl Transport for PacketTransport {
    async fn read_datagram(&self) -> std::io::Result<Vec<u8>> {
        let mut buf = vec![0u8; 64 * 1024];
        let n = self.socket.recv(&mut buf).await?;
        buf.truncate(n);
        Ok(self.obfuscator.decode_datagram(buf))
    }

    async fn write_datagram(&self, data: &[u8]) -> std::io::Result<()> {
        let wire = self.obfuscator.encode_datagram(data.to_vec());
        self.socket.send(&wire).await?;
        Ok(())
    }

    fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    fn remote_addr(&self) -> std::io::Result<SocketAddr> {
        Ok(self.remote_addr)
    }

    async fn close(&self) -> std::io::Result<()> {
        // UDP sockets have nothing to shut down; dropping the socket is the
        // real close and happens when the owning Endpoint is dropped.
        Ok(())
    }

    fn tag(&self) -> TransportTag {
        TransportTag::Packet
    }
}

/// Bind an ephemeral local port matching `remote`'s address family and
/// connect it, so every subsequent `send`/`recv` implicitly targets `remote`.
pub async fn dial(remote: SocketAddr, obfuscator: Arc<dyn Obfuscator>) -> std::io::Result<PacketTransport> {
    let bind_addr = if remote.is_ipv6() { "[::]:0" } else { "0.0.0.0:0" };
    let socket = UdpSocket::bind(bind_addr).await?;
    socket.connect(remote).await?;
    Ok(PacketTransport {
        socket,
        obfuscator,
        remote_addr: remote,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::obfuscator::IdentityObfuscator;

    #[tokio::test]
    async fn dial_sends_and_receives() {
        let echo = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let echo_addr = echo.local_addr().unwrap();

        let client = dial(echo_addr, Arc::new(IdentityObfuscator)).await.unwrap();
        client.write_datagram(b"ping").await.unwrap();

        let mut buf = [0u8; 16];
        let (n, from) = echo.recv_from(&mut buf).await.unwrap();
        echo.send_to(&buf[..n], from).await.unwrap();

        let got = client.read_datagram().await.unwrap();
        assert_eq!(got, b"ping");
    }
}
