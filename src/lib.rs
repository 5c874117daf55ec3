//! # mdp
//!
//! A session-oriented datagram transport that multiplexes one logical
//! bidirectional datagram stream over several heterogeneous transports at
//! once — a reliable byte stream, plain UDP, and datagrams disguised as
//! ICMP echo traffic — so the loss of any single carrier is invisible to
//! the application as long as one survives.
//!
//! [`Client`] dials a remote node and presents it as one conduit of whole
//! datagrams in and out. [`Server`] listens passively across all three
//! carriers, demultiplexes inbound traffic by session and node id, and can
//! either terminate a session locally or relay it on toward another node
//! (spec §4.7's forward-relay routing).
//!
//! Every type here is built on `tokio`; there is no synchronous API.

pub mod addr;
pub mod client;
pub mod closegate;
pub mod config;
pub mod endpoint;
pub mod error;
pub mod framing;
pub mod ids;
pub mod logging;
pub mod obfuscator;
pub mod server;
pub mod session;
pub mod transport;

pub use addr::{Addr, DualStackAddr};
pub use client::Client;
pub use config::Config;
pub use error::{MdpError, Result};
pub use ids::{ForwardKey, NodeId, SessionId};
pub use obfuscator::{IdentityObfuscator, Obfuscator};
pub use server::Server;
pub use session::Session;

/// The current version of this crate.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
