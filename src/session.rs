//! The session engine: multi-endpoint multiplex/demultiplex state machine
//! (spec §2, §3, §4.3–§4.7).

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tokio::sync::{mpsc, Mutex as AsyncMutex};
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::addr::{Addr, DualStackAddr};
use crate::closegate::CloseGate;
use crate::config::Config;
use crate::endpoint::{Endpoint, Role};
use crate::error::MdpError;
use crate::framing;
use crate::ids::{NodeId, SessionId};
use crate::obfuscator::Obfuscator;
use crate::transport::{icmp_disguised, packet, stream_datagram, IpFamily, Transport, TransportTag};

/// One item delivered by an endpoint read pump into a session queue (spec
/// §3: "bounded (capacity 1024) queues of `{Addr, payload}`").
pub struct QueueItem {
    pub addr: Addr,
    pub payload: Vec<u8>,
}

const QUEUE_CAPACITY: usize = 1024;

pub struct Session {
    session_id: SessionId,
    self_node_id: NodeId,
    forward_node_id: OnceLock<NodeId>,
    config: Config,
    obfuscator: Arc<dyn Obfuscator>,

    src_addr: OnceLock<Addr>,
    dst_addr: OnceLock<Addr>,

    src_endpoints: DashMap<u64, Arc<Endpoint>>,
    dst_endpoints: DashMap<u64, Arc<Endpoint>>,
    next_inserted_at: AtomicU64,

    src_in_tx: mpsc::Sender<QueueItem>,
    dst_in_tx: mpsc::Sender<QueueItem>,
    dst_in_rx: AsyncMutex<Option<mpsc::Receiver<QueueItem>>>,
    /// Only populated for forwarding sessions created via
    /// [`Session::new_forwarding`] — a terminating session's `src_in`
    /// receiver is owned externally (by the `Client` or the `Server`'s
    /// shared read queue), so there is nothing for a forward pump to drain.
    src_in_rx: AsyncMutex<Option<mpsc::Receiver<QueueItem>>>,

    close: CloseGate,
    forward_tasks: AsyncMutex<Vec<JoinHandle<()>>>,
    endpoint_tasks: AsyncMutex<Vec<JoinHandle<()>>>,
}

impl Session {
    /// Construct a session whose `srcInQueue` is fed into `src_in_tx`. A
    /// client passes a dedicated per-session channel and keeps the receiver
    /// for itself; a server passes a clone of its single shared sender so
    /// every terminating session's inbound traffic lands on one queue (spec
    /// §4.8: "a fresh session sharing the server's single source-input
    /// queue").
    fn new_inner(
        session_id: SessionId,
        self_node_id: NodeId,
        config: Config,
        src_in_tx: mpsc::Sender<QueueItem>,
        src_in_rx: Option<mpsc::Receiver<QueueItem>>,
    ) -> Arc<Self> {
        let obfuscator = config.obfuscator();
        let (dst_in_tx, dst_in_rx) = mpsc::channel(QUEUE_CAPACITY);
        Arc::new(Self {
            session_id,
            self_node_id,
            forward_node_id: OnceLock::new(),
            config,
            obfuscator,
            src_addr: OnceLock::new(),
            dst_addr: OnceLock::new(),
            src_endpoints: DashMap::new(),
            dst_endpoints: DashMap::new(),
            next_inserted_at: AtomicU64::new(0),
            src_in_tx,
            dst_in_tx,
            dst_in_rx: AsyncMutex::new(Some(dst_in_rx)),
            src_in_rx: AsyncMutex::new(src_in_rx),
            close: CloseGate::new(),
            forward_tasks: AsyncMutex::new(Vec::new()),
            endpoint_tasks: AsyncMutex::new(Vec::new()),
        })
    }

    /// A terminating session: its `srcInQueue` sender is owned by whoever
    /// constructs it (a `Client`'s own channel, or a clone of the `Server`'s
    /// single shared sender) and drained externally.
    pub(crate) fn new(session_id: SessionId, self_node_id: NodeId, config: Config, src_in_tx: mpsc::Sender<QueueItem>) -> Arc<Self> {
        Self::new_inner(session_id, self_node_id, config, src_in_tx, None)
    }

    /// A forwarding session: both queues are private, since I7 says a
    /// forwarding session's `srcInQueue` is consumed by its own forward pump
    /// rather than by the application.
    pub fn new_forwarding(session_id: SessionId, self_node_id: NodeId, config: Config) -> Arc<Self> {
        let (tx, rx) = mpsc::channel(QUEUE_CAPACITY);
        Self::new_inner(session_id, self_node_id, config, tx, Some(rx))
    }

    pub fn session_id(&self) -> SessionId {
        self.session_id
    }

    pub fn is_closed(&self) -> bool {
        self.close.is_closed()
    }

    /// Resolves once this session's close gate has fired. Lets a `Client`
    /// or `Server` select between the gate and their own queues the way
    /// spec §4.9 describes for `Client::Read`.
    pub async fn wait_closed(&self) {
        self.close.wait().await
    }

    /// The peer-facing address (spec §3's `srcAddr`): for a dialed session
    /// this is the remote the client connected to; for a server-terminated
    /// or forwarding session it's the first inbound packet's origin.
    pub fn src_addr(&self) -> Option<Addr> {
        self.src_addr.get().cloned()
    }

    /// The forward-target address (spec §3's `dstAddr`), populated only on
    /// a session that has become a relay.
    pub fn dst_addr(&self) -> Option<Addr> {
        self.dst_addr.get().cloned()
    }

    /// Local address of any one input-side endpoint, if this session has
    /// dialed or accepted at least one. There is no single well-defined
    /// "local address" for a multi-endpoint session — this picks whichever
    /// endpoint answers first, which is adequate for informational
    /// `LocalAddr()` calls and not used in any routing decision.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.src_endpoints.iter().find_map(|e| e.value().transport.local_addr().ok())
    }

    fn next_seq(&self) -> u64 {
        self.next_inserted_at.fetch_add(1, Ordering::Relaxed)
    }

    // ---- dial path (client / forward) -----------------------------------

    /// Dial every enabled transport × IP-family combination toward `remote`,
    /// creating one input-role (src) endpoint per success (spec §4.5).
    /// Returns the last dial error only if every attempt failed.
    pub async fn dial(
        self_node_id: NodeId,
        target_node_id: NodeId,
        config: Config,
        remote: SocketAddr,
        src_in_tx: mpsc::Sender<QueueItem>,
    ) -> Result<Arc<Self>, MdpError> {
        let session_id = config.session_id.unwrap_or_else(SessionId::random);
        let session = Self::new(session_id, self_node_id, config, src_in_tx);
        session.forward_node_id.set(target_node_id).ok();

        let zone = None;
        session
            .src_addr
            .set(Addr::new(remote.ip(), remote.port(), zone, Arc::downgrade(&session)))
            .ok();

        let mut last_err: Option<MdpError> = None;
        let mut dialed_any = false;

        for family in [IpFamily::V4, IpFamily::V6] {
            if (family.is_v6() && remote.is_ipv6()) || (!family.is_v6() && remote.is_ipv4()) {
                for thread_idx in 0..session.config.threads as u16 {
                    match session.dial_one(Role::Input, family, remote, thread_idx).await {
                        Ok(()) => dialed_any = true,
                        Err(e) => last_err = Some(e),
                    }
                }
            }
        }

        if !dialed_any {
            return Err(last_err.unwrap_or(MdpError::NoEndpoint));
        }
        Ok(session)
    }

    /// The `NodeID` this session's endpoints should stamp on the wire:
    /// for an input-role (peer-facing) endpoint, always this process's own
    /// id; for a destination-role (forward-relay) endpoint, the next-hop
    /// id — the same one `output()` uses for the per-frame trailer (spec
    /// §4.6: "the downstream sees ... the correct next-hop NodeID").
    fn outbound_node_id(&self, role: Role) -> NodeId {
        match role {
            Role::Input => self.self_node_id,
            Role::Destination => *self.forward_node_id.get().unwrap_or(&self.self_node_id),
        }
    }

    async fn dial_one(self: &Arc<Self>, role: Role, family: IpFamily, remote: SocketAddr, thread_idx: u16) -> Result<(), MdpError> {
        let mut dialed: Vec<(Arc<dyn Transport>, TransportTag)> = Vec::new();
        let node_id = self.outbound_node_id(role);

        if !self.config.disable_tcp {
            match stream_datagram::dial(remote, self.session_id, node_id, self.obfuscator.as_ref()).await {
                Ok(t) => dialed.push((Arc::new(t), TransportTag::StreamDatagram)),
                Err(e) => debug!(%remote, error = %e, "stream dial failed"),
            }
        }
        if !self.config.disable_udp {
            match packet::dial(remote, self.obfuscator.clone()).await {
                Ok(t) => dialed.push((Arc::new(t), TransportTag::Packet)),
                Err(e) => debug!(%remote, error = %e, "packet dial failed"),
            }
        }
        if !self.config.disable_icmdp {
            match icmp_disguised::dial(remote.ip(), self.obfuscator.clone()).await {
                Ok(t) => dialed.push((Arc::new(t), TransportTag::IcmpDisguised)),
                Err(e) => debug!(%remote, error = %e, "icmp-disguised dial failed"),
            }
        }

        if dialed.is_empty() {
            return Err(MdpError::TransportDial(std::io::Error::new(
                std::io::ErrorKind::Other,
                "every configured transport failed to dial",
            )));
        }

        for (transport, tag) in dialed {
            // Fold `thread_idx` into the local-port/seq slot of the packed
            // endpoint index (spec §3) instead of the dialed remote's port —
            // every thread otherwise dials the same `(family, tag,
            // remote.port(), remote.port())` tuple, so the 2nd..Nth thread's
            // `insert` would silently overwrite the 1st's endpoint in the
            // `DashMap`, leaking its socket and read pump (`arm.go`'s
            // `endpointIndex` packs `threadIndex` here for the same reason).
            self.insert_endpoint(role, family, tag, thread_idx, remote.port(), transport)
                .await;
        }
        Ok(())
    }

    /// Add destination-role endpoints toward a forward target, turning a
    /// terminating session into a relay (spec §4.8 step 3:
    /// `addDestinationEndpoints`). Idempotent under races — only the first
    /// caller actually dials and spawns the forward pumps.
    pub async fn add_destination_endpoints(self: &Arc<Self>, target_node_id: NodeId, downstream: DualStackAddr) {
        if self.forward_node_id.set(target_node_id).is_err() {
            return;
        }

        let zone = downstream.zone.clone();
        let ip = downstream
            .ip6
            .map(std::net::IpAddr::V6)
            .or_else(|| downstream.ip4.map(std::net::IpAddr::V4));
        let Some(ip) = ip else {
            return;
        };
        self.dst_addr
            .set(Addr::new(ip, downstream.port, zone, Arc::downgrade(self)))
            .ok();

        let remote = SocketAddr::new(ip, downstream.port);
        for family in [IpFamily::V4, IpFamily::V6] {
            if family.is_v6() == ip.is_ipv6() {
                for thread_idx in 0..self.config.threads as u16 {
                    if let Err(e) = self.dial_one(Role::Destination, family, remote, thread_idx).await {
                        debug!(%remote, error = %e, "destination dial failed");
                    }
                }
            }
        }

        self.spawn_forward_pumps().await;
        info!(session = %self.session_id, node = %target_node_id, "session now forwarding");
    }

    /// Spawn the two forward-direction pumps (spec §4.6): one drains
    /// `srcInQueue` and writes toward the destination side, the other drains
    /// `dstInQueue` and writes back toward the source side. Each exits on
    /// close-gate firing or its queue's sender side going away.
    async fn spawn_forward_pumps(self: &Arc<Self>) {
        let src_rx = self.src_in_rx.lock().await.take();
        let dst_rx = self.dst_in_rx.lock().await.take();

        let mut tasks = Vec::new();

        if let Some(mut src_rx) = src_rx {
            let session = self.clone();
            tasks.push(tokio::spawn(async move {
                loop {
                    tokio::select! {
                        item = src_rx.recv() => {
                            let Some(item) = item else { break };
                            if session.output(&item.payload, true).await.is_err() {
                                break;
                            }
                        }
                        _ = session.close.wait() => break,
                    }
                }
            }));
        }

        if let Some(mut dst_rx) = dst_rx {
            let session = self.clone();
            tasks.push(tokio::spawn(async move {
                loop {
                    tokio::select! {
                        item = dst_rx.recv() => {
                            let Some(item) = item else { break };
                            if session.output(&item.payload, false).await.is_err() {
                                break;
                            }
                        }
                        _ = session.close.wait() => break,
                    }
                }
            }));
        }

        self.forward_tasks.lock().await.extend(tasks);
    }

    // ---- server-side endpoint upsert -------------------------------------

    /// Load-or-store an endpoint by its packed index (spec §4.7). Only the
    /// true inserter spawns the read pump; race-losers get the existing
    /// endpoint back. Also assigns this session's role-appropriate address
    /// exactly once, on the very first upsert (spec I6).
    pub async fn upsert_endpoint(
        self: &Arc<Self>,
        role: Role,
        family: IpFamily,
        tag: TransportTag,
        local_port: u16,
        remote_addr: SocketAddr,
        make_transport: impl FnOnce() -> Arc<dyn Transport>,
    ) -> Arc<Endpoint> {
        let index = framing::endpoint_index(family.is_v6(), tag, local_port, remote_addr.port());
        let set = self.endpoint_set(role);

        if let Some(existing) = set.get(&index) {
            return existing.clone();
        }

        let addr_slot = match role {
            Role::Input => &self.src_addr,
            Role::Destination => &self.dst_addr,
        };
        addr_slot
            .set(Addr::new(remote_addr.ip(), remote_addr.port(), None, Arc::downgrade(self)))
            .ok();

        let inserted_at = self.next_seq();
        let entry = set.entry(index);
        let is_new = matches!(entry, dashmap::mapref::entry::Entry::Vacant(_));
        let endpoint = entry
            .or_insert_with(|| Endpoint::new(index, role, make_transport(), inserted_at, Arc::downgrade(self)))
            .clone();

        if is_new {
            let ep = endpoint.clone();
            let handle = tokio::spawn(async move { ep.run().await });
            self.endpoint_tasks.lock().await.push(handle);
        }

        endpoint
    }

    fn endpoint_set(&self, role: Role) -> &DashMap<u64, Arc<Endpoint>> {
        match role {
            Role::Input => &self.src_endpoints,
            Role::Destination => &self.dst_endpoints,
        }
    }

    /// Insert one just-dialed endpoint. `thread_idx` (this transport's
    /// `0..config.threads` iteration count) occupies the packed index's
    /// local-port/seq slot — a dialed endpoint's real local port is an
    /// OS-assigned ephemeral one the session never queries, and every
    /// thread dials the same `remote`, so `thread_idx` is what keeps
    /// concurrent threads of the same transport from colliding in the
    /// endpoint set.
    async fn insert_endpoint(
        self: &Arc<Self>,
        role: Role,
        family: IpFamily,
        tag: TransportTag,
        thread_idx: u16,
        remote_port: u16,
        transport: Arc<dyn Transport>,
    ) {
        let index = framing::endpoint_index(family.is_v6(), tag, thread_idx, remote_port);
        let inserted_at = self.next_seq();
        let endpoint = Endpoint::new(index, role, transport, inserted_at, Arc::downgrade(self));
        self.endpoint_set(role).insert(index, endpoint.clone());
        let handle = tokio::spawn(async move { endpoint.run().await });
        self.endpoint_tasks.lock().await.push(handle);
    }

    pub(crate) fn deregister_endpoint(&self, role: Role, index: u64) {
        self.endpoint_set(role).remove(&index);
    }

    /// Accept an already-established stream connection whose preamble has
    /// been read, attaching it as an input-role endpoint (spec §4.8 step 5,
    /// stream listener branch).
    pub async fn attach_stream(self: &Arc<Self>, transport: stream_datagram::StreamDatagram) {
        let remote = match transport.remote_addr() {
            Ok(a) => a,
            Err(_) => return,
        };
        let transport: Arc<dyn Transport> = Arc::new(transport);
        self.upsert_endpoint(
            Role::Input,
            IpFamily::from_addr(remote),
            TransportTag::StreamDatagram,
            remote.port(),
            remote,
            move || transport,
        )
        .await;
    }

    // ---- inbound / outbound ------------------------------------------------

    /// Called by an endpoint's read pump for every datagram it reads (spec
    /// §4.3). Empty payloads are silently accepted (treated as a no-op, not
    /// an error). Returns `false` once the session has closed, signalling
    /// the pump to stop.
    pub(crate) async fn input(&self, payload: Vec<u8>, role: Role) -> bool {
        if self.close.is_closed() {
            return false;
        }
        if payload.is_empty() {
            return true;
        }

        let addr_slot = match role {
            Role::Input => &self.src_addr,
            Role::Destination => &self.dst_addr,
        };
        let Some(addr) = addr_slot.get().cloned() else {
            return true;
        };

        let tx = match role {
            Role::Input => &self.src_in_tx,
            Role::Destination => &self.dst_in_tx,
        };
        let item = QueueItem { addr, payload };

        tokio::select! {
            res = tx.send(item) => res.is_ok(),
            _ = self.close.wait() => false,
        }
    }

    /// Frame and send on the most-recently-receiving endpoint of the chosen
    /// side (spec §4.4). `to_destination_side=true` writes toward the
    /// forward target; `false` writes back toward the originating peer.
    pub(crate) async fn output(&self, payload: &[u8], to_destination_side: bool) -> Result<(), MdpError> {
        if self.close.is_closed() {
            return Err(MdpError::Closed);
        }

        let set = if to_destination_side {
            &self.dst_endpoints
        } else {
            &self.src_endpoints
        };
        let endpoint = most_recently_receiving(set).await.ok_or(MdpError::NoEndpoint)?;

        let role = if to_destination_side { Role::Destination } else { Role::Input };
        let node_id = self.outbound_node_id(role);
        let framed = framing::frame(payload, self.session_id, node_id);
        endpoint.send(&framed).await
    }

    /// Public write used by a terminating session's owner (client write, or
    /// a forwarding session relaying source-bound traffic).
    pub async fn write_to_src(&self, payload: &[u8]) -> Result<(), MdpError> {
        self.output(payload, false).await
    }

    pub async fn write_to_dst(&self, payload: &[u8]) -> Result<(), MdpError> {
        self.output(payload, true).await
    }

    // ---- close / NAT sweep -------------------------------------------------

    pub async fn close(&self) -> Result<(), Arc<MdpError>> {
        self.close
            .close_with(|| async {
                for tasks in [&self.forward_tasks, &self.endpoint_tasks] {
                    for handle in tasks.lock().await.drain(..) {
                        handle.abort();
                    }
                }

                let mut last_err = None;
                for set in [&self.src_endpoints, &self.dst_endpoints] {
                    for entry in set.iter() {
                        if let Err(e) = entry.value().transport.close().await {
                            last_err = Some(e);
                        }
                    }
                    set.clear();
                }

                match last_err {
                    Some(e) => Err(Arc::new(MdpError::TransportIo(e))),
                    None => Ok(()),
                }
            })
            .await
    }

    /// True if every endpoint (or the session itself, if it has none yet)
    /// has been idle for longer than `timeout` — the NAT-survival sweep's
    /// predicate (resolves Design Notes §9 open question 2).
    pub async fn is_idle_since(&self, timeout: Duration) -> bool {
        let now = Instant::now();
        let mut any_endpoint = false;
        for set in [&self.src_endpoints, &self.dst_endpoints] {
            for entry in set.iter() {
                any_endpoint = true;
                if now.duration_since(entry.value().last_activity().await) < timeout {
                    return false;
                }
            }
        }
        any_endpoint
    }
}

/// Scan an endpoint set for the one with the latest `last_recv`, breaking
/// ties (including "never received") by insertion order (Design Notes §9,
/// open question 4).
async fn most_recently_receiving(set: &DashMap<u64, Arc<Endpoint>>) -> Option<Arc<Endpoint>> {
    let mut best: Option<(Arc<Endpoint>, Option<Instant>, u64)> = None;
    for entry in set.iter() {
        let ep = entry.value().clone();
        let last_recv = ep.last_recv().await;
        let inserted_at = ep.inserted_at;
        best = Some(match best {
            None => (ep, last_recv, inserted_at),
            Some((cur_ep, cur_recv, cur_seq)) => {
                let better = match (last_recv, cur_recv) {
                    (Some(a), Some(b)) => a > b,
                    (Some(_), None) => true,
                    (None, Some(_)) => false,
                    (None, None) => inserted_at < cur_seq,
                };
                if better {
                    (ep, last_recv, inserted_at)
                } else {
                    (cur_ep, cur_recv, cur_seq)
                }
            }
        });
    }
    best.map(|(ep, _, _)| ep)
}

impl IpFamily {
    fn from_addr(addr: SocketAddr) -> Self {
        if addr.is_ipv6() {
            IpFamily::V6
        } else {
            IpFamily::V4
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::Server;

    /// Dial both TCP and UDP against a real listener, lose the UDP endpoint
    /// outright (as an EOF would), and confirm the session keeps working
    /// over the surviving TCP endpoint — multipath's whole point.
    #[tokio::test]
    async fn session_keeps_working_after_one_endpoint_is_lost() {
        let server = Server::listen(0).await.unwrap();
        server.set_node_id(NodeId(7));
        let port = server.local_addr().port();
        let remote: SocketAddr = format!("127.0.0.1:{port}").parse().unwrap();

        let config = Config {
            disable_icmdp: true,
            threads: 1,
            ..Config::default()
        };
        let (tx, mut rx) = mpsc::channel(16);
        let session = Session::dial(NodeId(7), NodeId(7), config, remote, tx).await.unwrap();

        for i in 0..5u8 {
            session.write_to_src(&[i]).await.unwrap();
            let (payload, addr) = server.read_from().await.unwrap();
            assert_eq!(payload, vec![i]);
            server.write_to(&payload, &addr).await.unwrap();
            let echoed = rx.recv().await.unwrap();
            assert_eq!(echoed.payload, vec![i]);
        }

        let udp_index = session
            .src_endpoints
            .iter()
            .find(|e| e.value().tag() == TransportTag::Packet)
            .map(|e| *e.key())
            .expect("udp endpoint present after dialing with udp enabled");
        session.src_endpoints.remove(&udp_index);

        session.write_to_src(b"still alive").await.unwrap();
        let (payload, addr) = server.read_from().await.unwrap();
        assert_eq!(payload, b"still alive");
        server.write_to(&payload, &addr).await.unwrap();
        let echoed = rx.recv().await.unwrap();
        assert_eq!(echoed.payload, b"still alive");

        server.close().await.unwrap();
    }
}
