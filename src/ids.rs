//! Session and node identifiers.
//!
//! Both are plain 32-bit values on the wire (spec §3); these newtypes exist
//! so call sites can't accidentally swap the two when threading them through
//! the framing codec and the server's routing tables.

use std::fmt;

use rand::Rng;

/// Identifies a logical session end-to-end. Always nonzero.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(pub u32);

impl SessionId {
    /// Generate a random nonzero session id, the way a dialing client does
    /// when `Config::session_id` is left unset.
    pub fn random() -> Self {
        let mut rng = rand::thread_rng();
        loop {
            let v: u32 = rng.gen();
            if v != 0 {
                return Self(v);
            }
        }
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:08x}", self.0)
    }
}

/// Identifies a process's static role: "me" vs. a named forward target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub u32);

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:08x}", self.0)
    }
}

/// Key for the server's forwarded-session table: `(SessionID, NodeID)`.
pub type ForwardKey = (SessionId, NodeId);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn random_session_id_is_nonzero() {
        for _ in 0..1000 {
            assert_ne!(SessionId::random().0, 0);
        }
    }
}
