//! Session/client configuration and its normalization step (spec §6, Design
//! Notes; `examples/original_source/session.go`'s `Config.def()`).

use std::sync::Arc;

use crate::addr::DualStackAddr;
use crate::ids::{NodeId, SessionId};
use crate::obfuscator::{IdentityObfuscator, Obfuscator};

/// Configuration accepted by [`crate::Client`] and [`crate::Server`].
#[derive(Clone)]
pub struct Config {
    /// Session identifier. `None`/`Some(0)` means "generate one" —
    /// normalized away by [`Config::normalize`].
    pub session_id: Option<SessionId>,
    pub node_id: NodeId,
    /// Node identifiers this process is willing to forward sessions toward.
    /// Only meaningful for a server; routes themselves are registered
    /// separately via `Server::set_forward_node`.
    pub forward_node_ids: Vec<NodeId>,
    pub addr: DualStackAddr,
    pub threads: u8,
    pub disable_icmdp: bool,
    pub disable_tcp: bool,
    pub disable_udp: bool,
    pub obfuscator: Option<Arc<dyn Obfuscator>>,
}

impl std::fmt::Debug for Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Config")
            .field("session_id", &self.session_id)
            .field("node_id", &self.node_id)
            .field("forward_node_ids", &self.forward_node_ids)
            .field("addr", &self.addr)
            .field("threads", &self.threads)
            .field("disable_icmdp", &self.disable_icmdp)
            .field("disable_tcp", &self.disable_tcp)
            .field("disable_udp", &self.disable_udp)
            .field("obfuscator", &"<dyn Obfuscator>")
            .finish()
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            session_id: None,
            node_id: NodeId(0),
            forward_node_ids: Vec::new(),
            addr: DualStackAddr::default(),
            threads: 1,
            disable_icmdp: false,
            disable_tcp: false,
            disable_udp: false,
            obfuscator: None,
        }
    }
}

impl Config {
    /// Apply the defaulting rules spec §6 requires: nonzero random
    /// `SessionID` if unset, `Threads` clamped into `[1, 32]`, re-enable UDP
    /// if every transport was disabled, default the obfuscator to identity.
    /// Idempotent — normalizing an already-normalized config is a no-op.
    pub fn normalize(mut self) -> Self {
        let needs_session_id = matches!(self.session_id, None | Some(SessionId(0)));
        if needs_session_id {
            self.session_id = Some(SessionId::random());
        }

        self.threads = self.threads.clamp(1, 32);

        if self.disable_icmdp && self.disable_tcp && self.disable_udp {
            self.disable_udp = false;
        }

        if self.obfuscator.is_none() {
            self.obfuscator = Some(Arc::new(IdentityObfuscator));
        }

        self
    }

    pub fn obfuscator(&self) -> Arc<dyn Obfuscator> {
        self.obfuscator.clone().unwrap_or_else(|| Arc::new(IdentityObfuscator))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_fills_session_id_and_clamps_threads() {
        let cfg = Config {
            threads: 0,
            ..Config::default()
        }
        .normalize();
        assert_ne!(cfg.session_id.unwrap().0, 0);
        assert_eq!(cfg.threads, 1);
    }

    #[test]
    fn normalize_reenables_udp_when_everything_disabled() {
        let cfg = Config {
            disable_icmdp: true,
            disable_tcp: true,
            disable_udp: true,
            ..Config::default()
        }
        .normalize();
        assert!(!cfg.disable_udp);
    }

    #[test]
    fn normalize_is_idempotent_on_session_id() {
        let cfg = Config::default().normalize();
        let sid = cfg.session_id;
        let cfg = cfg.normalize();
        assert_eq!(cfg.session_id, sid);
    }
}
