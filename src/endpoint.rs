//! Endpoint lifecycle: one concrete carrier of a session (spec §3, §4.2).
//!
//! An endpoint owns a single [`Transport`] and runs its own read pump as an
//! independent task. On any read failure or EOF the pump exits and the
//! endpoint self-deregisters from its owning session's endpoint set — the
//! session itself is untouched, so a single-transport outage is invisible to
//! the application as long as at least one endpoint on that side survives.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Instant;

use tokio::sync::Mutex as AsyncMutex;
use tracing::debug;

use crate::error::MdpError;
use crate::framing;
use crate::session::Session;
use crate::transport::{Transport, TransportTag};

/// Which side of a session an endpoint belongs to (spec §3's Endpoint
/// `role` field).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Faces the peer/client side.
    Input,
    /// Faces a forward-relay downstream node.
    Destination,
}

pub struct Endpoint {
    pub index: u64,
    pub role: Role,
    pub transport: Arc<dyn Transport>,
    /// Insertion sequence within the owning session, used to break ties
    /// deterministically when no endpoint has ever received (Design Notes
    /// §9, open question 4).
    pub inserted_at: u64,
    created_at: Instant,
    last_recv: AsyncMutex<Option<Instant>>,
    last_sent: AsyncMutex<Option<Instant>>,
    recv_count: AtomicU64,
    send_count: AtomicU64,
    session: Weak<Session>,
}

impl Endpoint {
    pub fn new(
        index: u64,
        role: Role,
        transport: Arc<dyn Transport>,
        inserted_at: u64,
        session: Weak<Session>,
    ) -> Arc<Self> {
        Arc::new(Self {
            index,
            role,
            transport,
            inserted_at,
            created_at: Instant::now(),
            last_recv: AsyncMutex::new(None),
            last_sent: AsyncMutex::new(None),
            recv_count: AtomicU64::new(0),
            send_count: AtomicU64::new(0),
            session,
        })
    }

    pub fn tag(&self) -> TransportTag {
        self.transport.tag()
    }

    pub async fn last_recv(&self) -> Option<Instant> {
        *self.last_recv.lock().await
    }

    /// Record a datagram delivered by a path other than this endpoint's own
    /// read pump — the server's shared packet/ICMP listener, which feeds
    /// write-only endpoints data it already read off the shared socket
    /// (spec §4.2: write-only handles "have no reads of their own").
    pub(crate) async fn record_recv(&self) {
        *self.last_recv.lock().await = Some(Instant::now());
        self.recv_count.fetch_add(1, Ordering::Relaxed);
    }

    /// Most recent activity on this endpoint in either direction, or its
    /// creation time if it has never seen any — the NAT-survival sweep's
    /// staleness clock (spec §5: "NAT-survival timeout ... endpoints whose
    /// lastRecv is older than this are candidates for cleanup").
    pub async fn last_activity(&self) -> Instant {
        let recv = *self.last_recv.lock().await;
        let sent = *self.last_sent.lock().await;
        [recv, sent].into_iter().flatten().max().unwrap_or(self.created_at)
    }

    /// Attempt one write. Per spec §4.2 the send counter tracks failed
    /// attempts, not successful ones — a health signal for "this endpoint
    /// keeps refusing writes", not a throughput counter.
    pub async fn send(&self, data: &[u8]) -> Result<(), MdpError> {
        match self.transport.write_datagram(data).await {
            Ok(()) => {
                *self.last_sent.lock().await = Some(Instant::now());
                Ok(())
            }
            Err(e) => {
                self.send_count.fetch_add(1, Ordering::Relaxed);
                Err(MdpError::TransportIo(e))
            }
        }
    }

    /// Read pump: blocks until the underlying connection ends, feeding every
    /// datagram to the owning session's inbound path. Write-only handles
    /// have no reads of their own (they're fed by the server's shared
    /// listener pump) and return immediately.
    pub async fn run(self: Arc<Self>) {
        if self.transport.is_write_only() {
            return;
        }

        loop {
            let data = match self.transport.read_datagram().await {
                Ok(data) => data,
                Err(e) => {
                    debug!(index = self.index, tag = ?self.tag(), error = %e, "endpoint read pump ending");
                    break;
                }
            };
            // Every wire format carries the 8-byte trailer (spec §6), even
            // the stream transport's already length-delimited frames. Strip
            // it here so every role sees the same bare payload; the server's
            // shared listeners strip it earlier themselves, to decide
            // routing before a session even exists.
            let payload = match framing::unframe(&data) {
                Ok((payload, _session_id, _node_id)) => payload.to_vec(),
                Err(_) => continue,
            };

            *self.last_recv.lock().await = Some(Instant::now());
            self.recv_count.fetch_add(1, Ordering::Relaxed);

            let Some(session) = self.session.upgrade() else {
                break;
            };
            if !session.input(payload, self.role).await {
                break;
            }
        }

        if let Some(session) = self.session.upgrade() {
            session.deregister_endpoint(self.role, self.index);
        }
    }
}
