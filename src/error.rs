//! Error taxonomy for the session engine.
//!
//! Kinds mirror spec §7: closed, no-endpoint, transport-dial, transport-io,
//! short-packet, unknown-route. The last two are never surfaced to a
//! caller — they are dropped at the point of detection — but are kept in
//! the enum so internal plumbing can reason about them uniformly.

use std::io;

use thiserror::Error;

/// Errors surfaced by the public API of the `mdp` crate.
#[derive(Debug, Error)]
pub enum MdpError {
    /// The session or server has passed its close gate.
    #[error("mdp: closed")]
    Closed,

    /// A send was attempted on a side with no live endpoints.
    #[error("mdp: no endpoint available to send on")]
    NoEndpoint,

    /// Every dial attempt for a session failed; carries the last error seen.
    #[error("mdp: all transport dials failed: {0}")]
    TransportDial(#[source] io::Error),

    /// A read or write on an underlying transport connection failed.
    #[error("mdp: transport io error: {0}")]
    TransportIo(#[from] io::Error),

    /// An inbound frame was shorter than the 8-byte trailer. Not normally
    /// surfaced — the server drops these silently — but constructible for
    /// tests that exercise the framing codec directly.
    #[error("mdp: short packet ({len} bytes, need at least 8)")]
    ShortPacket { len: usize },

    /// An inbound frame named a `NodeID` that is neither this node nor a
    /// configured forward target.
    #[error("mdp: unknown route (node {0})")]
    UnknownRoute(u32),
}

pub type Result<T> = std::result::Result<T, MdpError>;
