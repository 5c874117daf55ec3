//! Wire framing codec (spec §4.1).
//!
//! Every outbound datagram gets an 8-byte trailer; every inbound datagram of
//! at least 8 bytes is split back into payload + ids. Byte layout is pinned
//! by the quantified invariant in spec §8: `D[-8:-4] == BE(NodeID)`,
//! `D[-4:] == BE(SessionID)`.

use crate::error::MdpError;
use crate::ids::{NodeId, SessionId};

pub const TRAILER_LEN: usize = 8;

/// Append the `NodeID ‖ SessionID` trailer to a payload, ready for the wire.
pub fn frame(payload: &[u8], session_id: SessionId, node_id: NodeId) -> Vec<u8> {
    let mut out = Vec::with_capacity(payload.len() + TRAILER_LEN);
    out.extend_from_slice(payload);
    out.extend_from_slice(&node_id.0.to_be_bytes());
    out.extend_from_slice(&session_id.0.to_be_bytes());
    out
}

/// Split an inbound datagram into `(payload, session_id, node_id)`.
///
/// Frames shorter than [`TRAILER_LEN`] are rejected (spec I4: dropped
/// silently by the server; callers elsewhere may still want the typed
/// error, e.g. in tests).
pub fn unframe(bytes: &[u8]) -> Result<(&[u8], SessionId, NodeId), MdpError> {
    if bytes.len() < TRAILER_LEN {
        return Err(MdpError::ShortPacket { len: bytes.len() });
    }
    let split = bytes.len() - TRAILER_LEN;
    let payload = &bytes[..split];
    let node_id = u32::from_be_bytes(bytes[split..split + 4].try_into().unwrap());
    let session_id = u32::from_be_bytes(bytes[split + 4..split + 8].try_into().unwrap());
    Ok((payload, SessionId(session_id), NodeId(node_id)))
}

/// Transport family tag packed into an endpoint index (spec §3: Endpoint's
/// index is "a packed uint64 derived from (ip-family, transport-tag,
/// local-port/seq, remote-port/id)").
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportTag {
    StreamDatagram,
    Packet,
    IcmpDisguised,
}

impl TransportTag {
    fn bits(self) -> u64 {
        match self {
            // IANA protocol numbers, kept for readability even though any
            // distinct values would do.
            TransportTag::StreamDatagram => 0x06,
            TransportTag::Packet => 0x11,
            TransportTag::IcmpDisguised => 0x01,
        }
    }
}

/// Deterministic O(1) key for a session's endpoint set: one entry per
/// `(role's IP family, transport, local-port/seq, remote port/id)` tuple
/// (spec I2: endpoint indices are unique within a set). `local_port` is a
/// dual-purpose slot: a server-accepted endpoint passes its real local
/// port, while a dialed endpoint (whose real local port is an ephemeral one
/// nobody queries) passes its dial thread index instead, which is what
/// keeps concurrent `Config::threads` dials of the same transport from
/// colliding on the same index.
///
/// The original Go implementation (`arm.go::endpointIndex`) packs these same
/// four fields but left only a single bit of headroom between the transport
/// tag and the local port, which a 16-bit local port silently overruns. This
/// widens the packing so the index stays injective, which is what spec
/// invariant I2 actually requires.
pub fn endpoint_index(is_ipv6: bool, transport: TransportTag, local_port: u16, remote_port: u16) -> u64 {
    let family_bit = if is_ipv6 { 1u64 } else { 0u64 };
    (family_bit << 63) | (transport.bits() << 48) | ((local_port as u64) << 16) | remote_port as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_unframe_round_trip() {
        let payload = b"hello world";
        let sid = SessionId(0xdeadbeef);
        let nid = NodeId(0x1);
        let wire = frame(payload, sid, nid);

        assert_eq!(&wire[wire.len() - 8..wire.len() - 4], &nid.0.to_be_bytes());
        assert_eq!(&wire[wire.len() - 4..], &sid.0.to_be_bytes());

        let (p, got_sid, got_nid) = unframe(&wire).unwrap();
        assert_eq!(p, payload);
        assert_eq!(got_sid, sid);
        assert_eq!(got_nid, nid);
    }

    #[test]
    fn unframe_rejects_short_packets() {
        let err = unframe(&[1, 2, 3]).unwrap_err();
        assert!(matches!(err, MdpError::ShortPacket { len: 3 }));
    }

    #[test]
    fn endpoint_index_is_injective_over_ports() {
        let a = endpoint_index(false, TransportTag::Packet, 1000, 2000);
        let b = endpoint_index(false, TransportTag::Packet, 1000, 2001);
        let c = endpoint_index(false, TransportTag::StreamDatagram, 1000, 2000);
        let d = endpoint_index(true, TransportTag::Packet, 1000, 2000);
        assert_ne!(a, b);
        assert_ne!(a, c);
        assert_ne!(a, d);
    }
}
