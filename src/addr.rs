//! Addressing types (spec §3, §6).
//!
//! `DualStackAddr` is operator-facing configuration (a forward target, or a
//! session's configured remote). `Addr` is what the engine hands back to an
//! application from `Server::read_from`/`Client` — it carries a weak
//! back-reference to the session that produced it so a reply can find its
//! way home in O(1) without a second table probe (Design Notes §9).

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::sync::Weak;

use crate::error::MdpError;
use crate::session::Session;

/// Operator-configured dual-stack target: a forward node, or the address a
/// client dials.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DualStackAddr {
    pub ip4: Option<Ipv4Addr>,
    pub ip6: Option<Ipv6Addr>,
    pub port: u16,
    pub zone: Option<String>,
}

impl DualStackAddr {
    pub fn new_v4(ip4: Ipv4Addr, port: u16) -> Self {
        Self {
            ip4: Some(ip4),
            ip6: None,
            port,
            zone: None,
        }
    }

    pub fn new_v6(ip6: Ipv6Addr, port: u16) -> Self {
        Self {
            ip4: None,
            ip6: Some(ip6),
            port,
            zone: None,
        }
    }

    /// Invalid if neither IP is present or the port is zero (spec §3).
    pub fn is_invalid(&self) -> bool {
        (self.ip4.is_none() && self.ip6.is_none()) || self.port == 0
    }
}

/// An address handed to the application by the engine. `Network()` is
/// always `"mdp"`; `String()` matches the usual `ip:port` text form.
#[derive(Clone)]
pub struct Addr {
    pub ip: IpAddr,
    pub port: u16,
    pub zone: Option<String>,
    pub(crate) owning_session: Weak<Session>,
}

impl Addr {
    /// `ip` is unmapped first (spec §6: `addr.String()` must match the
    /// canonical `ip:port` text form). A dual-stack listener bound on `"::"`
    /// hands back a v4 peer's address as a v4-mapped v6 address
    /// (`::ffff:a.b.c.d`); left as-is, `Display` would render
    /// `[::ffff:127.0.0.1]:port` instead of `127.0.0.1:port`.
    pub(crate) fn new(ip: IpAddr, port: u16, zone: Option<String>, session: Weak<Session>) -> Self {
        Self {
            ip: unmap_v4(ip),
            port,
            zone,
            owning_session: session,
        }
    }

    pub fn network(&self) -> &'static str {
        "mdp"
    }

    /// Recover the session that produced this address, or `Closed` if it has
    /// since gone away.
    pub(crate) fn session(&self) -> Result<std::sync::Arc<Session>, MdpError> {
        self.owning_session.upgrade().ok_or(MdpError::Closed)
    }
}

impl fmt::Display for Addr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (&self.ip, &self.zone) {
            (IpAddr::V6(ip6), Some(zone)) => write!(f, "[{}%{}]:{}", ip6, zone, self.port),
            (IpAddr::V6(ip6), None) => write!(f, "[{}]:{}", ip6, self.port),
            (ip, _) => write!(f, "{}:{}", ip, self.port),
        }
    }
}

impl fmt::Debug for Addr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Addr")
            .field("ip", &self.ip)
            .field("port", &self.port)
            .field("zone", &self.zone)
            .finish()
    }
}

/// Unmap a v4-mapped v6 address (`::ffff:a.b.c.d`) back to plain v4; any
/// other address, v4 or genuine v6, passes through unchanged. Written by
/// hand rather than via `Ipv6Addr::to_ipv4_mapped` since that was only
/// stabilized in Rust 1.75 and this crate's MSRV is 1.74.
fn unmap_v4(ip: IpAddr) -> IpAddr {
    match ip {
        IpAddr::V6(v6) => {
            let segments = v6.segments();
            if segments[0..5] == [0, 0, 0, 0, 0] && segments[5] == 0xffff {
                let o = v6.octets();
                IpAddr::V4(Ipv4Addr::new(o[12], o[13], o[14], o[15]))
            } else {
                IpAddr::V6(v6)
            }
        }
        v4 => v4,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dual_stack_invalid_without_ip_or_port() {
        assert!(DualStackAddr::default().is_invalid());
        assert!(DualStackAddr::new_v4(Ipv4Addr::LOCALHOST, 0).is_invalid());
        assert!(!DualStackAddr::new_v4(Ipv4Addr::LOCALHOST, 1989).is_invalid());
    }

    #[test]
    fn addr_string_form() {
        let addr = Addr::new(IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1)), 1989, None, Weak::new());
        assert_eq!(addr.to_string(), "127.0.0.1:1989");
        assert_eq!(addr.network(), "mdp");
    }

    #[test]
    fn new_unmaps_v4_mapped_v6_addresses() {
        let mapped = IpAddr::V6(Ipv6Addr::new(0, 0, 0, 0, 0, 0xffff, 0x7f00, 0x0001));
        let addr = Addr::new(mapped, 1989, None, Weak::new());
        assert_eq!(addr.ip, IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1)));
        assert_eq!(addr.to_string(), "127.0.0.1:1989");
    }

    #[test]
    fn new_leaves_genuine_v6_addresses_alone() {
        let real_v6 = IpAddr::V6(Ipv6Addr::LOCALHOST);
        let addr = Addr::new(real_v6, 1989, None, Weak::new());
        assert_eq!(addr.ip, real_v6);
    }
}
