//! Length-prefixed datagram framing over a reliable byte stream (spec §4.1,
//! §6: "stream transport — session preamble written once ... subsequent
//! frames: length(u16 BE) ‖ bytes").
//!
//! Grounded on `original_source/conn.go`'s `tcpDatagram`, whose `writeM
//! sync.Mutex` around `Write` is why the write half here is behind a
//! `tokio::sync::Mutex` even though nothing else about a `TcpStream` needs
//! one.

use std::net::SocketAddr;

use async_trait::async_trait;
use tokio::io::{split, AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::net::TcpStream;
use tokio::sync::Mutex;

use crate::error::MdpError;
use crate::framing::TRAILER_LEN;
use crate::ids::{NodeId, SessionId};
use crate::obfuscator::{DuplexIo, Obfuscator};

use super::{Transport, TransportTag};

/// Largest frame this side will accept. Guards against a malicious or
/// confused peer claiming an enormous length prefix.
const MAX_FRAME_LEN: usize = 1 << 16;

pub struct StreamDatagram {
    reader: Mutex<ReadHalf<Box<dyn DuplexIo>>>,
    writer: Mutex<WriteHalf<Box<dyn DuplexIo>>>,
    local_addr: SocketAddr,
    remote_addr: SocketAddr,
}

impl StreamDatagram {
    fn from_duplex(conn: Box<dyn DuplexIo>, local_addr: SocketAddr, remote_addr: SocketAddr) -> Self {
        let (reader, writer) = split(conn);
        Self {
            reader: Mutex::new(reader),
            writer: Mutex::new(writer),
            local_addr,
            remote_addr,
        }
    }
}

#[async_trait]
impl Transport for StreamDatagram {
    async fn read_datagram(&self) -> std::io::Result<Vec<u8>> {
        let mut reader = self.reader.lock().await;
        let mut len_buf = [0u8; 2];
        reader.read_exact(&mut len_buf).await?;
        let len = u16::from_be_bytes(len_buf) as usize;
        if len < TRAILER_LEN {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("stream frame of {len} bytes is shorter than the 8-byte trailer"),
            ));
        }
        if len > MAX_FRAME_LEN {
            return Err(std::io::Error::new(std::io::ErrorKind::InvalidData, "stream frame too large"));
        }
        let mut buf = vec![0u8; len];
        reader.read_exact(&mut buf).await?;
        Ok(buf)
    }

    async fn write_datagram(&self, data: &[u8]) -> std::io::Result<()> {
        let mut writer = self.writer.lock().await;
        let len = data.len() as u16;
        writer.write_all(&len.to_be_bytes()).await?;
        writer.write_all(data).await?;
        writer.flush().await?;
        Ok(())
    }

    fn local_addr(&self) -> std::io::Result<SocketAddr> {
        Ok(self.local_addr)
    }

    fn remote_addr(&self) -> std::io::Result<SocketAddr> {
        Ok(self.remote_addr)
    }

    async fn close(&self) -> std::io::Result<()> {
        self.writer.lock().await.shutdown().await
    }

    fn tag(&self) -> TransportTag {
        TransportTag::StreamDatagram
    }
}

/// Dial side: connect, obfuscate the raw stream, write the
/// `SessionID ‖ NodeID` preamble, then start framing datagrams.
pub async fn dial(
    addr: SocketAddr,
    session_id: SessionId,
    node_id: NodeId,
    obfuscator: &dyn Obfuscator,
) -> Result<StreamDatagram, MdpError> {
    let stream = TcpStream::connect(addr).await.map_err(MdpError::TransportIo)?;
    stream.set_nodelay(true).ok();
    let local_addr = stream.local_addr().map_err(MdpError::TransportIo)?;
    let remote_addr = stream.peer_addr().map_err(MdpError::TransportIo)?;

    let boxed: Box<dyn DuplexIo> = Box::new(stream);
    let mut boxed = obfuscator.wrap_stream(boxed);
    boxed
        .write_all(&session_id.0.to_be_bytes())
        .await
        .map_err(MdpError::TransportIo)?;
    boxed
        .write_all(&node_id.0.to_be_bytes())
        .await
        .map_err(MdpError::TransportIo)?;

    Ok(StreamDatagram::from_duplex(boxed, local_addr, remote_addr))
}

/// Accept side: an already-accepted `TcpStream` has its preamble read back
/// off so the server can associate it with a session before any framed
/// datagram arrives.
pub async fn accept(
    stream: TcpStream,
    obfuscator: &dyn Obfuscator,
) -> Result<(SessionId, NodeId, StreamDatagram), MdpError> {
    stream.set_nodelay(true).ok();
    let local_addr = stream.local_addr().map_err(MdpError::TransportIo)?;
    let remote_addr = stream.peer_addr().map_err(MdpError::TransportIo)?;

    let boxed: Box<dyn DuplexIo> = Box::new(stream);
    let mut boxed = obfuscator.wrap_stream(boxed);

    let mut sid_buf = [0u8; 4];
    boxed.read_exact(&mut sid_buf).await.map_err(MdpError::TransportIo)?;
    let mut nid_buf = [0u8; 4];
    boxed.read_exact(&mut nid_buf).await.map_err(MdpError::TransportIo)?;
    let session_id = SessionId(u32::from_be_bytes(sid_buf));
    let node_id = NodeId(u32::from_be_bytes(nid_buf));

    Ok((session_id, node_id, StreamDatagram::from_duplex(boxed, local_addr, remote_addr)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::obfuscator::IdentityObfuscator;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn dial_writes_preamble_and_frames_round_trip() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let dial_fut = dial(addr, SessionId(42), NodeId(7), &IdentityObfuscator);
        let (accept_res, dial_res) = tokio::join!(
            async {
                let (stream, _) = listener.accept().await.unwrap();
                accept(stream, &IdentityObfuscator).await
            },
            dial_fut,
        );

        let (sid, nid, server_side) = accept_res.unwrap();
        assert_eq!(sid, SessionId(42));
        assert_eq!(nid, NodeId(7));

        let client_side = dial_res.unwrap();
        client_side.write_datagram(b"hello world").await.unwrap();
        let got = server_side.read_datagram().await.unwrap();
        assert_eq!(got, b"hello world");
    }
}
