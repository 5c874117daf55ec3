//! Dialing client: a single session presented as one bidirectional datagram
//! conduit (spec §4.9; `examples/original_source/client.go`).

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::sync::{mpsc, Mutex as AsyncMutex};

use crate::addr::Addr;
use crate::config::Config;
use crate::error::MdpError;
use crate::ids::{NodeId, SessionId};
use crate::session::{QueueItem, Session};

const QUEUE_CAPACITY: usize = 1024;

/// One multipath session dialed out to a remote node, read and written as a
/// plain datagram conduit. Multiplexing across transports and IP families
/// happens underneath; a caller only ever sees whole datagrams in and out.
pub struct Client {
    session: Arc<Session>,
    in_rx: AsyncMutex<mpsc::Receiver<QueueItem>>,
}

impl Client {
    /// Dial `config.addr` on every enabled transport × IP-family combination
    /// (spec §4.5). Fails only if every dial attempt failed.
    pub async fn dial(self_node_id: NodeId, target_node_id: NodeId, config: Config, remote: SocketAddr) -> Result<Self, MdpError> {
        let config = config.normalize();
        let (in_tx, in_rx) = mpsc::channel(QUEUE_CAPACITY);
        let session = Session::dial(self_node_id, target_node_id, config, remote, in_tx).await?;
        Ok(Self {
            session,
            in_rx: AsyncMutex::new(in_rx),
        })
    }

    /// Read one datagram, or `Closed` once this client has been closed
    /// (spec §4.9: `Client::Read` selects the close gate against its
    /// session's inbound queue).
    pub async fn read(&self) -> Result<Vec<u8>, MdpError> {
        let mut rx = self.in_rx.lock().await;
        tokio::select! {
            item = rx.recv() => item.map(|i| i.payload).ok_or(MdpError::Closed),
            _ = self.session.wait_closed() => Err(MdpError::Closed),
        }
    }

    /// Write one datagram on the most-recently-receiving endpoint (spec
    /// §4.4).
    pub async fn write(&self, payload: &[u8]) -> Result<usize, MdpError> {
        self.session.write_to_src(payload).await?;
        Ok(payload.len())
    }

    pub async fn close(&self) -> Result<(), Arc<MdpError>> {
        self.session.close().await
    }

    pub fn session_id(&self) -> SessionId {
        self.session.session_id()
    }

    pub fn is_closed(&self) -> bool {
        self.session.is_closed()
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.session.local_addr()
    }

    pub fn remote_addr(&self) -> Option<Addr> {
        self.session.src_addr()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn dial_succeeds_over_udp_alone_even_with_no_listener() {
        let config = Config {
            disable_tcp: true,
            disable_udp: false,
            disable_icmdp: true,
            ..Config::default()
        };
        // UDP "dialing" is just a local connect() with no handshake, so this
        // succeeds even though nothing is listening on the remote port.
        let remote: SocketAddr = "127.0.0.1:1".parse().unwrap();
        let client = Client::dial(NodeId(1), NodeId(2), config, remote).await;
        assert!(client.is_ok());
    }
}
