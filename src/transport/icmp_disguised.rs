//! Datagram traffic disguised as ICMP echo request/reply packets (spec §4.2,
//! Glossary: "ICMP-disguised-datagram channel").
//!
//! ICMP has no port concept, so this carrier borrows the echo header's
//! identifier/sequence fields the way the original `icmpDatagram` does:
//! identifier stands in for "remote port" (it's fixed per dial, chosen by the
//! initiator) and sequence stands in for "local port" in the endpoint index
//! (spec §3's "(ip-family, transport-tag, local-port/seq, remote-port/id)").
//!
//! Built on a `SOCK_RAW` socket via `socket2` (the same crate the rest of
//! this workspace already depends on for low-level socket construction),
//! then handed to `tokio::net::UdpSocket::from_std` — mio polls readiness on
//! the raw fd generically and doesn't care that the underlying protocol is
//! `IPPROTO_ICMP` rather than `IPPROTO_UDP`. This is the same conversion path
//! real-world async ICMP pingers use to get a raw socket onto an async
//! runtime without a dedicated `AsyncRawSocket` type.
//!
//! One kernel quirk this adapter has to account for: on Linux, a raw IPv4
//! socket delivers the IPv4 header along with every received packet, while a
//! raw IPv6 ICMP socket does not (IPv6 has no equivalent of `IP_HDRINCL` on
//! receive). `read_datagram` strips the IPv4 header when present and leaves
//! IPv6 payloads alone.

use std::io;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicU16, Ordering};

use async_trait::async_trait;
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;

use crate::obfuscator::Obfuscator;

use super::{Transport, TransportTag};

const ICMP_ECHO_REQUEST_V4: u8 = 8;
const ICMP_ECHO_REPLY_V4: u8 = 0;
const ICMP_ECHO_REQUEST_V6: u8 = 128;
const ICMP_ECHO_REPLY_V6: u8 = 129;

const ICMP_HEADER_LEN: usize = 8;
const IPV4_HEADER_MIN_LEN: usize = 20;

pub struct IcmpDisguised {
    socket: UdpSocket,
    remote_addr: SocketAddr,
    is_ipv6: bool,
    identifier: u16,
    next_seq: AtomicU16,
    obfuscator: std::sync::Arc<dyn Obfuscator>,
}

impl IcmpDisguised {
    pub fn identifier(&self) -> u16 {
        self.identifier
    }
}

/// True if `icmp_type` is an echo *request* for `is_ipv6`'s family — what
/// the server's shared listener is looking for (spec §4.8 step 1: "demux
/// frame"). The dial side filters for the opposite, an echo *reply*.
pub(crate) fn is_echo_request(is_ipv6: bool, icmp_type: u8) -> bool {
    icmp_type == if is_ipv6 { ICMP_ECHO_REQUEST_V6 } else { ICMP_ECHO_REQUEST_V4 }
}

/// One parsed inbound ICMP echo message, stripped of any IPv4 header.
/// Shared by the dial-side read pump and the server's shared listener (spec
/// §4.2 write-only-packet; §4.8 server listener demux).
pub(crate) struct IcmpMessage {
    pub icmp_type: u8,
    pub identifier: u16,
    pub seq: u16,
    pub payload: Vec<u8>,
}

/// Parse one raw-socket read into an [`IcmpMessage`], or `None` if it's too
/// short to be a well-formed ICMP echo message. Does not filter by type —
/// callers decide whether they wanted a request or a reply.
pub(crate) fn parse_inbound(is_ipv6: bool, buf: &[u8]) -> Option<IcmpMessage> {
    let icmp_slice: &[u8] = if !is_ipv6 {
        if buf.len() < IPV4_HEADER_MIN_LEN {
            return None;
        }
        let ihl = (buf[0] & 0x0f) as usize * 4;
        if buf.len() < ihl {
            return None;
        }
        &buf[ihl..]
    } else {
        buf
    };
    if icmp_slice.len() < ICMP_HEADER_LEN {
        return None;
    }
    Some(IcmpMessage {
        icmp_type: icmp_slice[0],
        identifier: u16::from_be_bytes([icmp_slice[4], icmp_slice[5]]),
        seq: u16::from_be_bytes([icmp_slice[6], icmp_slice[7]]),
        payload: icmp_slice[ICMP_HEADER_LEN..].to_vec(),
    })
}

/// Build an echo *reply* carrying `payload` — what the server side sends
/// back disguised as the other half of the ping exchange the client
/// initiated.
pub(crate) fn build_echo_reply(is_ipv6: bool, identifier: u16, seq: u16, payload: &[u8]) -> Vec<u8> {
    let icmp_type = if is_ipv6 { ICMP_ECHO_REPLY_V6 } else { ICMP_ECHO_REPLY_V4 };
    build_echo_packet(icmp_type, is_ipv6, identifier, seq, payload)
}

/// Bind an unconnected raw ICMP socket for the server's shared listener —
/// the receiving half of the disguise, fielding echo requests from any
/// sender rather than one dialed remote.
pub async fn listen(is_ipv6: bool) -> io::Result<UdpSocket> {
    let (domain, protocol) = if is_ipv6 {
        (Domain::IPV6, Protocol::ICMPV6)
    } else {
        (Domain::IPV4, Protocol::ICMPV4)
    };
    let raw = Socket::new(domain, Type::RAW, Some(protocol))?;
    raw.set_nonblocking(true)?;
    let bind_addr: SocketAddr = if is_ipv6 {
        "[::]:0".parse().unwrap()
    } else {
        "0.0.0.0:0".parse().unwrap()
    };
    raw.bind(&bind_addr.into())?;
    let std_socket: std::net::UdpSocket = raw.into();
    UdpSocket::from_std(std_socket)
}

#[async_trait]
impl Transport for IcmpDisguised {
    async fn read_datagram(&self) -> io::Result<Vec<u8>> {
        loop {
            let mut buf = vec![0u8; 64 * 1024];
            let n = self.socket.recv(&mut buf).await?;
            buf.truncate(n);

            let icmp_slice: &[u8] = if !self.is_ipv6 {
                if buf.len() < IPV4_HEADER_MIN_LEN {
                    continue;
                }
                let ihl = (buf[0] & 0x0f) as usize * 4;
                if buf.len() < ihl {
                    continue;
                }
                &buf[ihl..]
            } else {
                &buf[..]
            };

            if icmp_slice.len() < ICMP_HEADER_LEN {
                continue;
            }
            let icmp_type = icmp_slice[0];
            let expect_reply_type = if self.is_ipv6 { ICMP_ECHO_REPLY_V6 } else { ICMP_ECHO_REPLY_V4 };
            if icmp_type != expect_reply_type {
                continue;
            }
            let identifier = u16::from_be_bytes([icmp_slice[4], icmp_slice[5]]);
            if identifier != self.identifier {
                continue;
            }
            let payload = icmp_slice[ICMP_HEADER_LEN..].to_vec();
            return Ok(self.obfuscator.decode_datagram(payload));
        }
    }

    async fn write_datagram(&self, data: &[u8]) -> io::Result<()> {
        let wire = self.obfuscator.encode_datagram(data.to_vec());
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        let packet = build_echo_request(self.is_ipv6, self.identifier, seq, &wire);
        self.socket.send(&packet).await?;
        Ok(())
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    fn remote_addr(&self) -> io::Result<SocketAddr> {
        Ok(self.remote_addr)
    }

    async fn close(&self) -> io::Result<()> {
        Ok(())
    }

    fn tag(&self) -> TransportTag {
        TransportTag::IcmpDisguised
    }
}

/// Open a raw ICMP socket, connect it to `remote`, and pick a random
/// identifier for this carrier's lifetime.
pub async fn dial(remote: IpAddr, obfuscator: std::sync::Arc<dyn Obfuscator>) -> io::Result<IcmpDisguised> {
    let is_ipv6 = remote.is_ipv6();
    let (domain, protocol) = if is_ipv6 {
        (Domain::IPV6, Protocol::ICMPV6)
    } else {
        (Domain::IPV4, Protocol::ICMPV4)
    };

    let raw = Socket::new(domain, Type::RAW, Some(protocol))?;
    raw.set_nonblocking(true)?;
    let remote_addr = SocketAddr::new(remote, 0);
    raw.connect(&remote_addr.into())?;

    let std_socket: std::net::UdpSocket = raw.into();
    let socket = UdpSocket::from_std(std_socket)?;

    let identifier = rand::random::<u16>();

    Ok(IcmpDisguised {
        socket,
        remote_addr,
        is_ipv6,
        identifier,
        next_seq: AtomicU16::new(0),
        obfuscator,
    })
}

fn build_echo_request(is_ipv6: bool, identifier: u16, seq: u16, payload: &[u8]) -> Vec<u8> {
    let icmp_type = if is_ipv6 { ICMP_ECHO_REQUEST_V6 } else { ICMP_ECHO_REQUEST_V4 };
    build_echo_packet(icmp_type, is_ipv6, identifier, seq, payload)
}

fn build_echo_packet(icmp_type: u8, is_ipv6: bool, identifier: u16, seq: u16, payload: &[u8]) -> Vec<u8> {
    let mut packet = Vec::with_capacity(ICMP_HEADER_LEN + payload.len());
    packet.push(icmp_type);
    packet.push(0); // code
    packet.extend_from_slice(&[0u8, 0u8]); // checksum placeholder
    packet.extend_from_slice(&identifier.to_be_bytes());
    packet.extend_from_slice(&seq.to_be_bytes());
    packet.extend_from_slice(payload);

    // IPv6 checksums are computed by the kernel over a pseudo-header it
    // alone knows (source/dest address); only IPv4 gets one here.
    if !is_ipv6 {
        let checksum = icmp_checksum(&packet);
        packet[2..4].copy_from_slice(&checksum.to_be_bytes());
    }
    packet
}

/// RFC 1071 one's-complement checksum over an ICMPv4 message.
fn icmp_checksum(data: &[u8]) -> u16 {
    let mut sum = 0u32;
    let mut chunks = data.chunks_exact(2);
    for chunk in &mut chunks {
        sum += u16::from_be_bytes([chunk[0], chunk[1]]) as u32;
    }
    if let [last] = chunks.remainder() {
        sum += (*last as u32) << 8;
    }
    while sum >> 16 != 0 {
        sum = (sum & 0xffff) + (sum >> 16);
    }
    !(sum as u16)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn echo_request_checksum_is_self_consistent() {
        let packet = build_echo_request(false, 0x1234, 1, b"payload");
        // The checksum of a buffer including its own correct checksum field
        // sums to 0xffff (one's-complement identity).
        let checksum = icmp_checksum(&packet);
        assert_eq!(checksum, 0);
    }

    #[test]
    fn echo_request_header_fields_round_trip() {
        let packet = build_echo_request(false, 0xabcd, 42, b"hi");
        assert_eq!(packet[0], ICMP_ECHO_REQUEST_V4);
        assert_eq!(u16::from_be_bytes([packet[4], packet[5]]), 0xabcd);
        assert_eq!(u16::from_be_bytes([packet[6], packet[7]]), 42);
        assert_eq!(&packet[ICMP_HEADER_LEN..], b"hi");
    }

    #[test]
    fn v6_echo_request_skips_checksum() {
        let packet = build_echo_request(true, 1, 1, b"x");
        assert_eq!(packet[0], ICMP_ECHO_REQUEST_V6);
        assert_eq!(&packet[2..4], &[0, 0]);
    }
}
