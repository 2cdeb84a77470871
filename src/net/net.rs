//! The mesh handle: one [Net] per mesh membership.
//!
//! Owns the peer table, the handler table, the hook registry and the mesh-wide tasks (accept,
//!  heartbeat send, liveness check). Child meshes multiplex the parent's listener; the high
//!  bits of the connect record's target port route an inbound connection to the right child.

use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::{Arc, RwLock, Weak};
use std::time::Duration;

use anyhow::{anyhow, bail};
use bytes::Bytes;
use rustc_hash::FxHashMap;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::net::accept;
use crate::net::ack::await_ack;
use crate::net::config::{NetConfig, Tunables};
use crate::net::connect;
use crate::net::error::SendError;
use crate::net::handler::HandlerTable;
use crate::net::heartbeat;
use crate::net::hooks::{Hooks, TlsPolicy};
use crate::net::hostname::HostName;
use crate::net::peer::Peer;
use crate::net::peers::{PeerTable, SanctionedList};
use crate::net::queue::{make_frame, FlushClass, WriteFlags};
use crate::net::reader;
use crate::net::stats::{NetStats, PeerSnapshot};
use crate::net::subnet::{Subnets, SubnetStatus};
use crate::net::watchlist::Watchlist;
use crate::net::wire::{envelope_wire_len, AckMsg, AckPayloadMsg, DecomNameMsg, UserMsgHeader, WireType, MAX_USER_MSG_LEN};
use crate::net::writer;

/// caller-visible knobs for one send; the queueing flags proper are internal
#[derive(Debug, Clone, Copy, Default)]
pub struct SendOpts {
    /// flush the stream right after this frame
    pub nodelay: bool,
    /// bypass the queue caps; the frame must not be dropped
    pub nodrop: bool,
    /// insert in comparator order (requires a registered comparator)
    pub inorder: bool,
}

const MAX_SEND_TAILS: usize = 32;

pub struct Net {
    hostname: HostName,
    my_port: u16,
    app: String,
    service: String,
    instance: String,
    tls_policy: TlsPolicy,
    /// 0 for a parent mesh; a child's slot in the parent's connect-record routing
    net_index: u8,
    parent: Weak<Net>,
    children: RwLock<FxHashMap<u8, Arc<Net>>>,

    pub tunables: Tunables,
    pub hooks: Hooks,
    pub(crate) peers: PeerTable,
    pub sanctioned: SanctionedList,
    pub handlers: HandlerTable,
    pub stats: NetStats,
    pub watchlist: Watchlist,
    pub subnets: Arc<Subnets>,

    seqnum: AtomicI32,
    exit_tx: watch::Sender<bool>,
}

impl std::fmt::Debug for Net {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Net{{{}:{} {}/{}/{}}}", self.hostname, self.my_port, self.app, self.service, self.instance)
    }
}

impl Net {
    /// Brings up a mesh membership: binds (or adopts) the listener, registers with the name
    ///  service when no port is pinned, and starts the accept and heartbeat tasks.
    pub async fn start(config: NetConfig) -> anyhow::Result<Arc<Net>> {
        Self::start_with_hooks(config, Hooks::new()).await
    }

    pub async fn start_with_hooks(mut config: NetConfig, hooks: Hooks) -> anyhow::Result<Arc<Net>> {
        let hostname = HostName::intern(&config.hostname);

        let listener = match config.listener.take() {
            // the host bound the listener early, to keep a second instance off the same data
            Some(std_listener) => {
                std_listener.set_nonblocking(true)?;
                TcpListener::from_std(std_listener)?
            }
            None => {
                let port = if config.port != 0 {
                    config.port
                } else {
                    let name_service = hooks.name_service()
                        .ok_or_else(|| anyhow!("port 0 requires a registered name service"))?;
                    let port = name_service.register(&config.app, &config.service, &config.instance, 0).await?;
                    info!(port, service = %config.service, "registered port with name service");
                    port
                };
                TcpListener::bind(("0.0.0.0", port)).await?
            }
        };
        let my_port = listener.local_addr()?.port();
        if config.port != 0 && config.port != my_port {
            bail!("listener is bound to port {} but config says {}", my_port, config.port);
        }

        // a pinned port still gets asserted with the name service, and a mismatch there is
        // unrecoverable misconfiguration
        if config.port != 0 {
            if let Some(name_service) = hooks.name_service() {
                let registered = name_service.register(&config.app, &config.service, &config.instance, my_port).await?;
                if registered != 0 && registered != my_port {
                    bail!("name service assigned port {} but we are bound to {}", registered, my_port);
                }
            }
        }

        let net = Arc::new(Net {
            hostname: hostname.clone(),
            my_port,
            app: config.app,
            service: config.service,
            instance: config.instance,
            tls_policy: config.tls_policy,
            net_index: 0,
            parent: Weak::new(),
            children: RwLock::new(FxHashMap::default()),
            tunables: Tunables::default(),
            hooks,
            peers: PeerTable::new(),
            sanctioned: SanctionedList::new(),
            handlers: HandlerTable::new(config.max_user_type),
            stats: NetStats::default(),
            watchlist: Watchlist::new(),
            subnets: Arc::new(Subnets::new()),
            seqnum: AtomicI32::new(0),
            exit_tx: watch::channel(false).0,
        });

        // the node itself is always in the peer table but never a send target
        net.peers.insert(hostname, my_port);

        tokio::spawn(accept::run_accept(net.clone(), listener));
        tokio::spawn(heartbeat::run_heartbeat_send(net.clone()));
        tokio::spawn(heartbeat::run_heartbeat_check(net.clone()));

        info!(host = %net.hostname, port = my_port, service = %net.service, "mesh started");
        Ok(net)
    }

    /// Creates a child mesh that shares this mesh's listener and subnet table but has its own
    ///  peers, handlers, hooks and tunables. `net_index` must be in 1..=15 and unused.
    pub fn new_child(self: &Arc<Self>, net_index: u8, service: &str) -> anyhow::Result<Arc<Net>> {
        if net_index == 0 || net_index > 15 {
            bail!("child net index {} out of range (1..=15)", net_index);
        }
        let mut children = self.children.write().expect("child net registry poisoned");
        if children.contains_key(&net_index) {
            bail!("child net index {} already in use", net_index);
        }

        let child = Arc::new(Net {
            hostname: self.hostname.clone(),
            my_port: self.my_port,
            app: self.app.clone(),
            service: service.to_string(),
            instance: self.instance.clone(),
            tls_policy: self.tls_policy,
            net_index,
            parent: Arc::downgrade(self),
            children: RwLock::new(FxHashMap::default()),
            tunables: Tunables::default(),
            hooks: Hooks::new(),
            peers: PeerTable::new(),
            sanctioned: SanctionedList::new(),
            handlers: HandlerTable::new(256),
            stats: NetStats::default(),
            watchlist: Watchlist::new(),
            subnets: self.subnets.clone(),
            seqnum: AtomicI32::new(0),
            exit_tx: watch::channel(false).0,
        });
        child.peers.insert(child.hostname.clone(), child.my_port);
        children.insert(net_index, child.clone());

        tokio::spawn(heartbeat::run_heartbeat_send(child.clone()));
        tokio::spawn(heartbeat::run_heartbeat_check(child.clone()));

        info!(service, net_index, "child mesh started");
        Ok(child)
    }

    pub fn hostname(&self) -> &HostName {
        &self.hostname
    }

    pub fn my_port(&self) -> u16 {
        self.my_port
    }

    pub fn service_triple(&self) -> (&str, &str, &str) {
        (&self.app, &self.service, &self.instance)
    }

    pub fn tls_policy(&self) -> TlsPolicy {
        self.tls_policy
    }

    pub(crate) fn net_index(&self) -> u8 {
        self.net_index
    }

    pub(crate) fn parent(&self) -> Option<Arc<Net>> {
        self.parent.upgrade()
    }

    pub(crate) fn child_by_index(&self, net_index: u8) -> Option<Arc<Net>> {
        self.children.read().expect("child net registry poisoned").get(&net_index).cloned()
    }

    pub fn is_exiting(&self) -> bool {
        *self.exit_tx.borrow()
    }

    pub(crate) async fn exit_notified(&self) {
        let mut rx = self.exit_tx.subscribe();
        if *rx.borrow() {
            return;
        }
        let _ = rx.changed().await;
    }

    /// Cooperative shutdown: flags every task, wakes the blocked ones, closes all sockets.
    pub fn shutdown(&self) {
        if self.exit_tx.send_replace(true) {
            return;
        }
        info!(host = %self.hostname, service = %self.service, "mesh shutting down");

        for peer in self.peers.snapshot() {
            self.close_peer(&peer);
            peer.acks.clear();
        }
        for child in self.children.read().expect("child net registry poisoned").values() {
            child.shutdown();
        }
    }

    // ---- peer management ------------------------------------------------------------------

    /// Adds a peer by name, e.g. from the seed list, and starts dialing it. Adding a peer that
    ///  exists (including this node itself) is a no-op.
    pub fn add_peer(self: &Arc<Self>, host: &str, port: u16) {
        if let Some(peer) = self.insert_peer(host, port) {
            self.ensure_connect_task(&peer);
        }
    }

    pub(crate) fn insert_peer(&self, host: &str, port: u16) -> Option<Arc<Peer>> {
        if self.is_exiting() {
            return None;
        }
        self.peers.insert(HostName::intern(host), port)
    }

    /// Spawns the peer's permanent dial task if it does not have one. The task exits only on
    ///  decommission or mesh shutdown.
    pub(crate) fn ensure_connect_task(self: &Arc<Self>, peer: &Arc<Peer>) {
        if peer.host == self.hostname || peer.is_decom() || self.is_exiting() {
            return;
        }
        if !peer.have_connect_task.swap(true, Ordering::SeqCst) {
            tokio::spawn(connect::run_connect(self.clone(), peer.clone()));
        }
    }

    /// Installs an established, handshake-complete stream on the peer and starts its
    ///  reader/writer pair. Returns false (dropping the stream) when the peer already has a
    ///  connection, i.e. this side lost a crossed dial/accept race.
    pub(crate) fn spawn_workers(self: &Arc<Self>, peer: &Arc<Peer>, stream: tokio::net::TcpStream, subnet: Option<String>) -> bool {
        {
            let mut qstat = peer.qstat.lock().expect("peer qstat poisoned");
            if qstat.is_none() {
                if let Some(factory) = self.hooks.qstat() {
                    *qstat = Some(factory.init(&self.service, &peer.host));
                }
            }
        }

        let Some(closed_rx) = peer.publish_conn(subnet) else {
            debug!(host = %peer.host, "dropping redundant connection, peer already has one");
            return false;
        };
        let (read_half, write_half) = stream.into_split();
        tokio::spawn(reader::run_reader(self.clone(), peer.clone(), read_half, closed_rx.clone()));
        tokio::spawn(writer::run_writer(self.clone(), peer.clone(), write_half, closed_rx));
        true
    }

    /// Closes a peer's socket and fires host-down exactly once per connection. Never touches
    ///  the peer table lock (see [Peer::close]).
    pub(crate) fn close_peer(&self, peer: &Peer) {
        if peer.close() {
            self.fire_host_down(&peer.host);
        }
    }

    pub(crate) fn fire_host_down(&self, host: &HostName) {
        if let Some(hook) = self.hooks.host_down() {
            hook.on_host_down(host);
        }
    }

    /// Drops a peer's connection without decommissioning it; the dial loop reconnects.
    pub fn close_connection(&self, host: &str) -> bool {
        let host = HostName::intern(host);
        match self.peers.get(&host) {
            Some(peer) => {
                info!(host = %host, service = %self.service, "administratively closing connection");
                self.close_peer(&peer);
                true
            }
            None => false,
        }
    }

    /// Decommissions a peer: splices it out of the table and tears down its state. Worker
    ///  tasks notice the flag and unwind on their own. With `delayed_recheck` a second pass
    ///  runs shortly after, catching a racing re-add via gossip.
    pub fn decom_peer(self: &Arc<Self>, host: &str, delayed_recheck: bool) {
        let host = HostName::intern(host);
        if host == self.hostname {
            return;
        }

        if let Some(peer) = self.peers.remove(&host) {
            info!(host = %host, service = %self.service, "decommissioning peer");
            peer.set_decom();
            self.close_peer(&peer);
            peer.queue.clear();
            peer.acks.clear();
            if let Some(qstat) = peer.qstat.lock().expect("peer qstat poisoned").as_ref() {
                qstat.on_clear();
            }
        }

        if delayed_recheck && !self.is_exiting() {
            let net = self.clone();
            let host = host.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_secs(2)).await;
                net.decom_peer(host.as_str(), false);
            });
        }
    }

    /// Broadcasts decommission-by-name for `host` to every other peer, then applies it
    ///  locally. Returns how many peers were notified.
    pub fn send_decom_all(self: &Arc<Self>, host: &str) -> usize {
        let target = HostName::intern(host);
        let mut notified = 0;

        // the decommissioned node is notified too; it ignores a decom naming itself
        for peer in self.peers.snapshot() {
            if peer.host == self.hostname {
                continue;
            }
            let mut body = Vec::new();
            DecomNameMsg { host: target.to_string() }.encode(&mut body);
            let frame = make_frame(
                WireType::DecomName,
                WriteFlags::urgent(),
                Bytes::from(body),
                envelope_wire_len(self.hostname.as_str(), peer.host.as_str()),
            );
            if peer.enqueue_frame(frame, &self.tunables, None).is_ok() {
                notified += 1;
            }
        }

        self.decom_peer(host, true);
        notified
    }

    // ---- send paths -----------------------------------------------------------------------

    pub(crate) fn next_seqnum(&self) -> i32 {
        self.seqnum.fetch_add(1, Ordering::Relaxed).wrapping_add(1)
    }

    fn send_target(&self, host: &str) -> Result<Arc<Peer>, SendError> {
        let host = HostName::intern(host);
        if host == self.hostname {
            return Err(SendError::SendToMe);
        }
        self.peers.get(&host).ok_or(SendError::InvalidNode)
    }

    fn check_sendable(&self, peer: &Peer) -> Result<(), SendError> {
        if !peer.has_conn() {
            return Err(SendError::NoSock);
        }
        if peer.is_closed() {
            return Err(SendError::Closed);
        }
        // the hello gate: no user traffic until the peer has introduced itself
        if !peer.got_hello() {
            return Err(SendError::WriteFail);
        }
        Ok(())
    }

    /// Fire-and-forget send. Success means the frame was queued; only queue backpressure is
    ///  reported, never delivery.
    pub fn send(&self, host: &str, usertype: i32, data: &[u8], nodelay: bool) -> Result<(), SendError> {
        self.send_flags(host, usertype, data, SendOpts { nodelay, ..SendOpts::default() })
    }

    /// Like [Net::send] but the frame may not be dropped for queue-full.
    pub fn send_nodrop(&self, host: &str, usertype: i32, data: &[u8], nodelay: bool) -> Result<(), SendError> {
        self.send_flags(host, usertype, data, SendOpts { nodelay, nodrop: true, ..SendOpts::default() })
    }

    /// Send with bounded reordering against the registered comparator.
    pub fn send_inorder(&self, host: &str, usertype: i32, data: &[u8], nodelay: bool) -> Result<(), SendError> {
        self.send_flags(host, usertype, data, SendOpts { nodelay, inorder: true, ..SendOpts::default() })
    }

    pub fn send_flags(&self, host: &str, usertype: i32, data: &[u8], opts: SendOpts) -> Result<(), SendError> {
        self.send_int(host, usertype, data, &[], opts)
    }

    /// Send with extra payload fragments appended after `data`, gathered into one frame.
    pub fn send_tails(&self, host: &str, usertype: i32, data: &[u8], tails: &[&[u8]], nodelay: bool) -> Result<(), SendError> {
        self.send_int(host, usertype, data, tails, SendOpts { nodelay, ..SendOpts::default() })
    }

    fn send_int(&self, host: &str, usertype: i32, data: &[u8], tails: &[&[u8]], opts: SendOpts) -> Result<(), SendError> {
        if tails.len() > MAX_SEND_TAILS {
            warn!(num_tails = tails.len(), "too many tails passed to send, max {}", MAX_SEND_TAILS);
            return Err(SendError::WriteFail);
        }

        let peer = self.send_target(host)?;
        self.check_sendable(&peer)?;

        peer.stats.num_sends.fetch_add(1, Ordering::Relaxed);
        let flush_interval = self.tunables.flush_interval.load(Ordering::Relaxed);
        let nodelay = match peer.queue.flush_tick(opts.nodelay, flush_interval) {
            FlushClass::Explicit => {
                self.stats.explicit_flushes.fetch_add(1, Ordering::Relaxed);
                true
            }
            FlushClass::Interval => {
                self.stats.send_interval_flushes.fetch_add(1, Ordering::Relaxed);
                true
            }
            FlushClass::Buffered => false,
        };

        let body = self.build_user_msg(usertype, self.next_seqnum(), false, data, tails)?;
        let frame = make_frame(
            WireType::UserMsg,
            WriteFlags {
                no_delay: nodelay,
                no_limit: opts.nodrop,
                inorder: opts.inorder,
                ..WriteFlags::none()
            },
            body,
            envelope_wire_len(self.hostname.as_str(), peer.host.as_str()),
        );

        let cmp = if opts.inorder { self.hooks.netcmp() } else { None };
        let result = peer.enqueue_frame(frame, &self.tunables, cmp.as_deref());

        if result == Err(SendError::QueueFull)
            && self.tunables.dump_full_queue.load(Ordering::Relaxed) != 0
        {
            self.dump_queue(&peer);
        }
        result
    }

    /// Synchronous send: blocks until the remote handler acks or `waitms` elapses. The
    ///  returned value is exactly the non-negative code the handler passed to the ack
    ///  primitive.
    pub async fn send_message(self: &Arc<Self>, host: &str, usertype: i32, data: &[u8], waitms: u64) -> Result<i32, SendError> {
        let (outrc, _) = self.send_message_int(host, usertype, data, waitms, false).await?;
        Ok(outrc)
    }

    /// Like [Net::send_message] but also returns the handler's ack payload, if it sent one.
    pub async fn send_message_payload(self: &Arc<Self>, host: &str, usertype: i32, data: &[u8], waitms: u64) -> Result<(i32, Option<Vec<u8>>), SendError> {
        self.send_message_int(host, usertype, data, waitms, true).await
    }

    async fn send_message_int(self: &Arc<Self>, host: &str, usertype: i32, data: &[u8], waitms: u64, want_payload: bool) -> Result<(i32, Option<Vec<u8>>), SendError> {
        // the Arc<Peer> is held across the whole wait, so a concurrent decommission can tear
        // down the registry (failing us fast) but never free state under us
        let peer = self.send_target(host)?;
        self.check_sendable(&peer)?;

        let seqnum = self.next_seqnum();
        let body = self.build_user_msg(usertype, seqnum, true, data, &[])?;
        let frame = make_frame(
            WireType::UserMsg,
            WriteFlags::nodelay(),
            body,
            envelope_wire_len(self.hostname.as_str(), peer.host.as_str()),
        );

        let rx = peer.acks.register(seqnum);
        if let Err(e) = peer.enqueue_frame(frame, &self.tunables, None) {
            peer.acks.remove(seqnum);
            return Err(e);
        }

        let result = await_ack(&peer.acks, seqnum, rx, waitms).await?;
        let payload = if want_payload { result.payload } else { None };
        Ok((result.outrc, payload))
    }

    /// The ack primitive: answers one synchronous send. Used through
    ///  [crate::net::handler::AckHandle].
    pub(crate) async fn send_ack(&self, to: &HostName, seqnum: i32, outrc: i32, payload: Option<&[u8]>) -> Result<(), SendError> {
        let peer = self.peers.get(to).ok_or(SendError::InvalidNode)?;
        self.check_sendable(&peer)?;

        let mut body = Vec::new();
        let wire_type = match payload {
            Some(payload) => {
                AckPayloadMsg { seqnum, outrc, payload: payload.to_vec() }.encode(&mut body);
                WireType::AckPayload
            }
            None => {
                AckMsg { seqnum, outrc }.encode(&mut body);
                WireType::Ack
            }
        };

        let frame = make_frame(
            wire_type,
            WriteFlags::nodelay(),
            Bytes::from(body),
            envelope_wire_len(self.hostname.as_str(), peer.host.as_str()),
        );
        peer.enqueue_frame(frame, &self.tunables, None)
    }

    fn build_user_msg(&self, usertype: i32, seqnum: i32, waitforack: bool, data: &[u8], tails: &[&[u8]]) -> Result<Bytes, SendError> {
        let tail_len: usize = tails.iter().map(|t| t.len()).sum();
        let datalen = data.len() + tail_len;
        if datalen > MAX_USER_MSG_LEN {
            return Err(SendError::WriteFail);
        }

        let mut body: Vec<u8> = Vec::new();
        body.try_reserve_exact(UserMsgHeader::LEN + datalen)
            .map_err(|_| SendError::MallocFail)?;

        UserMsgHeader { usertype, seqnum, waitforack, datalen }.encode(&mut body);
        body.extend_from_slice(data);
        for tail in tails {
            body.extend_from_slice(tail);
        }
        Ok(Bytes::from(body))
    }

    /// Blocks bulk producers until every overfull peer queue drains below the throttle
    ///  thresholds. Returns the number of peers waited on.
    pub async fn throttle_wait(&self) -> usize {
        let mut waited = 0;
        for peer in self.peers.snapshot() {
            if peer.host == self.hostname || peer.is_closed() {
                continue;
            }
            if peer.throttle_wait(&self.tunables).await > 0 {
                waited += 1;
                self.stats.throttle_waits.fetch_add(1, Ordering::Relaxed);
            }
        }
        waited
    }

    // ---- introspection --------------------------------------------------------------------

    /// every known peer, this node excluded
    pub fn nodes(&self) -> Vec<HostName> {
        self.peers.snapshot()
            .iter()
            .filter(|p| p.host != self.hostname)
            .map(|p| p.host.clone())
            .collect()
    }

    /// peers with a live socket
    pub fn connected_nodes(&self) -> Vec<HostName> {
        self.peers.snapshot()
            .iter()
            .filter(|p| p.host != self.hostname && p.has_conn() && !p.is_closed())
            .map(|p| p.host.clone())
            .collect()
    }

    pub fn count_nodes(&self) -> usize {
        self.peers.len()
    }

    pub(crate) fn get_peer(&self, host: &str) -> Option<Arc<Peer>> {
        self.peers.get(&HostName::intern(host))
    }

    pub fn get_queue_size(&self, host: &str) -> Result<(u32, u32), SendError> {
        let peer = self.get_peer(host).ok_or(SendError::InvalidNode)?;
        let (count, _) = peer.queue.depth();
        Ok((self.tunables.max_queue.load(Ordering::Relaxed), count))
    }

    pub fn peer_snapshots(&self) -> Vec<PeerSnapshot> {
        self.peers.snapshot()
            .iter()
            .map(|peer| {
                let counters = peer.queue.counters();
                PeerSnapshot {
                    host: peer.host.clone(),
                    port: peer.port(),
                    state: peer.conn_state(),
                    sanctioned: self.sanctioned.contains(&peer.host),
                    queue_count: counters.count,
                    queue_bytes: counters.bytes,
                    peak_queue_count: counters.peak_count,
                    peak_queue_count_at: counters.peak_count_at,
                    peak_queue_bytes: counters.peak_bytes,
                    peak_queue_bytes_at: counters.peak_bytes_at,
                    dedupe_count: counters.dedupe_count,
                    num_queue_full: counters.num_queue_full,
                    bytes_written: peer.stats.bytes_written.load(Ordering::Relaxed),
                    bytes_read: peer.stats.bytes_read.load(Ordering::Relaxed),
                    throttle_waits: peer.stats.throttle_waits.load(Ordering::Relaxed),
                    reorders: counters.reorders,
                    udp_sent: peer.stats.udp_sent.load(Ordering::Relaxed),
                    udp_recv: peer.stats.udp_recv.load(Ordering::Relaxed),
                    distress: peer.distress(),
                    subnet: peer.last_used_subnet(),
                    queue_size_metric: peer.queue_metric.snapshot(),
                }
            })
            .collect()
    }

    pub fn subnet_status(&self) -> Vec<SubnetStatus> {
        self.subnets.status()
    }

    /// Answers through the rtcpu hook when one is registered, optimistically otherwise. Hosts
    ///  use this for offload target picking.
    pub fn machine_is_up(&self, host: &str) -> bool {
        self.hooks.rtcpu().map(|h| h.machine_is_up(host)).unwrap_or(true)
    }

    /// Administratively disables or re-enables a subnet. Disabling synchronously shuts down
    ///  every open socket using it, here and in the child meshes.
    pub fn clip_subnet(&self, suffix: &str, disable: bool) -> bool {
        if !self.subnets.set_disabled(suffix, disable) {
            return false;
        }
        if disable {
            self.kill_subnet(suffix);
        }
        true
    }

    fn kill_subnet(&self, suffix: &str) {
        for peer in self.peers.snapshot() {
            if peer.last_used_subnet().as_deref() == Some(suffix) {
                info!(host = %peer.host, suffix, "closing socket on disabled subnet");
                self.close_peer(&peer);
            }
        }
        for child in self.children.read().expect("child net registry poisoned").values() {
            child.kill_subnet(suffix);
        }
    }

    /// UDP datagram accounting for the host's side channels; the transport only keeps the
    ///  books.
    pub fn inc_udp_sent(&self, host: &str) {
        if let Some(peer) = self.get_peer(host) {
            peer.stats.udp_sent.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn inc_udp_recv(&self, host: &str) {
        if let Some(peer) = self.get_peer(host) {
            peer.stats.udp_recv.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn reset_udp_stats(&self) {
        for peer in self.peers.snapshot() {
            peer.stats.reset_udp();
        }
    }

    /// Logs the contents of a peer's send queue, rendering user frames through the getlsn
    ///  hook when one is registered. Triggered by queue-full failures when the dump switch is
    ///  on.
    fn dump_queue(&self, peer: &Peer) {
        let getlsn = self.hooks.getlsn();
        let mut idx = 0;
        warn!(host = %peer.host, "dumping send queue after queue-full");
        peer.queue.for_each_frame(|frame| {
            let lsn = getlsn.as_ref()
                .filter(|_| frame.wire_type == WireType::UserMsg && frame.body.len() > UserMsgHeader::LEN)
                .and_then(|hook| hook.lsn(&frame.body[UserMsgHeader::LEN..]));
            match lsn {
                Some((file, offset)) => {
                    debug!(idx, wire_type = ?frame.wire_type, len = frame.wire_len, file, offset, "queued frame");
                }
                None => {
                    debug!(idx, wire_type = ?frame.wire_type, len = frame.wire_len, "queued frame");
                }
            }
            idx += 1;
        });
    }
}


#[cfg(test)]
mod test {
    use std::net::IpAddr;
    use std::time::Instant;

    use async_trait::async_trait;
    use tokio::sync::mpsc;

    use crate::net::handler::{NetHandler, ReceivedMessage};
    use crate::net::hooks::HostResolver;

    use super::*;

    /// every hostname is this machine; ports still tell the nodes apart
    struct LoopbackResolver;
    #[async_trait]
    impl HostResolver for LoopbackResolver {
        async fn lookup(&self, _host: &str) -> anyhow::Result<IpAddr> {
            Ok(IpAddr::from([127, 0, 0, 1]))
        }
    }

    async fn start_node(name: &str) -> Arc<Net> {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let mut config = NetConfig::new(name, listener.local_addr().unwrap().port());
        config.listener = Some(listener);

        let hooks = Hooks::new();
        hooks.set_resolver(Arc::new(LoopbackResolver));

        let net = Net::start_with_hooks(config, hooks).await.unwrap();
        net.tunables.heartbeat_send_secs.store(1, Ordering::Relaxed);
        net.tunables.dial_jitter_max_ms.store(50, Ordering::Relaxed);
        net
    }

    async fn wait_until(what: &str, budget: Duration, mut cond: impl FnMut() -> bool) {
        let deadline = Instant::now() + budget;
        while !cond() {
            assert!(Instant::now() < deadline, "timed out waiting for {}", what);
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    fn up(net: &Net, host: &str) -> bool {
        net.get_peer(host).map(|p| p.got_hello()).unwrap_or(false)
    }

    struct Recorder {
        tx: mpsc::UnboundedSender<(String, Vec<u8>)>,
    }
    #[async_trait]
    impl NetHandler for Recorder {
        async fn handle(&self, msg: ReceivedMessage<'_>) {
            let _ = self.tx.send((msg.from.to_string(), msg.data.to_vec()));
        }
    }

    struct Acker {
        rc: i32,
    }
    #[async_trait]
    impl NetHandler for Acker {
        async fn handle(&self, msg: ReceivedMessage<'_>) {
            if let Some(ack) = msg.ack {
                ack.ack(self.rc).await.unwrap();
            }
        }
    }

    struct PayloadAcker;
    #[async_trait]
    impl NetHandler for PayloadAcker {
        async fn handle(&self, msg: ReceivedMessage<'_>) {
            if let Some(ack) = msg.ack {
                ack.ack_with_payload(7, b"pong").await.unwrap();
            }
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_two_node_mesh_exchanges_user_message() {
        let a = start_node("s1-a").await;
        let b = start_node("s1-b").await;

        let (tx, mut rx) = mpsc::unbounded_channel();
        b.handlers.register(5, "recorder", Arc::new(Recorder { tx })).unwrap();

        // seeding a with b is enough for both sides to learn each other
        a.add_peer("s1-b", b.my_port());
        wait_until("mesh up", Duration::from_secs(10), || up(&a, "s1-b") && up(&b, "s1-a")).await;

        assert_eq!(a.count_nodes(), 2);
        assert_eq!(b.count_nodes(), 2);

        a.send("s1-b", 5, b"abc", true).unwrap();
        let (from, body) = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("handler was not invoked")
            .unwrap();
        assert_eq!(from, "s1-a");
        assert_eq!(body, b"abc");

        a.shutdown();
        b.shutdown();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_gossip_reveals_third_node() {
        let a = start_node("s2-a").await;
        let b = start_node("s2-b").await;
        let c = start_node("s2-c").await;

        // a and c only know the common seed b
        a.add_peer("s2-b", b.my_port());
        c.add_peer("s2-b", b.my_port());

        wait_until("gossip closure", Duration::from_secs(15), || {
            up(&a, "s2-c") && up(&c, "s2-a")
        }).await;

        assert_eq!(a.count_nodes(), 3);
        assert_eq!(b.count_nodes(), 3);
        assert_eq!(c.count_nodes(), 3);

        a.shutdown();
        b.shutdown();
        c.shutdown();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_send_message_returns_handler_rc() {
        let a = start_node("s5-a").await;
        let b = start_node("s5-b").await;
        b.handlers.register(9, "acker", Arc::new(Acker { rc: 42 })).unwrap();

        a.add_peer("s5-b", b.my_port());
        wait_until("mesh up", Duration::from_secs(10), || up(&a, "s5-b")).await;

        let outrc = a.send_message("s5-b", 9, b"ping", 5000).await.unwrap();
        assert_eq!(outrc, 42);

        // nobody registered for user type 10: the message is dropped and the wait times out
        let err = a.send_message("s5-b", 10, b"ping", 300).await.unwrap_err();
        assert_eq!(err, SendError::Timeout);

        a.shutdown();
        b.shutdown();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_send_message_payload_roundtrip() {
        let a = start_node("pay-a").await;
        let b = start_node("pay-b").await;
        b.handlers.register(3, "payload-acker", Arc::new(PayloadAcker)).unwrap();

        a.add_peer("pay-b", b.my_port());
        wait_until("mesh up", Duration::from_secs(10), || up(&a, "pay-b")).await;

        let (outrc, payload) = a.send_message_payload("pay-b", 3, b"ping", 5000).await.unwrap();
        assert_eq!(outrc, 7);
        assert_eq!(payload.as_deref(), Some(&b"pong"[..]));

        a.shutdown();
        b.shutdown();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_local_send_errors() {
        let a = start_node("err-a").await;

        assert_eq!(a.send("err-a", 1, b"x", false), Err(SendError::SendToMe));
        assert_eq!(a.send("err-nobody", 1, b"x", false), Err(SendError::InvalidNode));

        // a peer that exists but was never reached has no socket
        a.add_peer("err-unreachable", 1);
        assert_eq!(a.send("err-unreachable", 1, b"x", false), Err(SendError::NoSock));

        a.shutdown();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_close_connection_reconnects() {
        let a = start_node("cc-a").await;
        let b = start_node("cc-b").await;

        a.add_peer("cc-b", b.my_port());
        wait_until("mesh up", Duration::from_secs(10), || up(&a, "cc-b") && up(&b, "cc-a")).await;

        assert!(a.close_connection("cc-b"));
        // the dial loop brings the link back on its own
        wait_until("reconnect", Duration::from_secs(15), || up(&a, "cc-b")).await;

        a.shutdown();
        b.shutdown();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_decom_broadcast_removes_peer() {
        let a = start_node("dec-a").await;
        let b = start_node("dec-b").await;

        a.add_peer("dec-b", b.my_port());
        wait_until("mesh up", Duration::from_secs(10), || up(&a, "dec-b")).await;

        let notified = a.send_decom_all("dec-b");
        assert_eq!(notified, 1);
        assert!(a.get_peer("dec-b").is_none());
        assert_eq!(a.count_nodes(), 1);

        a.shutdown();
        b.shutdown();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_start_rejects_name_service_port_mismatch() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let mut config = NetConfig::new("ns-mismatch", port);
        config.listener = Some(listener);

        let hooks = Hooks::new();
        let mut name_service = crate::net::hooks::MockNameService::new();
        let wrong_port = if port == 1 { 2 } else { 1 };
        name_service.expect_register().returning(move |_, _, _, _| Ok(wrong_port));
        hooks.set_name_service(Arc::new(name_service));

        assert!(Net::start_with_hooks(config, hooks).await.is_err());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_allow_hook_rejects_connection() {
        let a = start_node("al-a").await;
        let b = start_node("al-b").await;

        let mut allow = crate::net::hooks::MockAllowHook::new();
        allow.expect_allow().returning(|_| false);
        b.hooks.set_allow(Arc::new(allow));

        a.add_peer("al-b", b.my_port());
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(!up(&a, "al-b"), "rejected host must never complete a hello exchange");

        a.shutdown();
        b.shutdown();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_queue_size_introspection() {
        let a = start_node("qs-a").await;
        a.add_peer("qs-peer", 1);

        let (limit, usage) = a.get_queue_size("qs-peer").unwrap();
        assert_eq!(limit, 25_000);
        assert_eq!(usage, 0);
        assert_eq!(a.get_queue_size("qs-nobody"), Err(SendError::InvalidNode));

        a.shutdown();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_sanctioned_list_is_independent_of_connectivity() {
        let a = start_node("sanc-a").await;
        assert!(a.sanctioned.add(HostName::intern("sanc-ghost")));
        assert!(a.sanctioned.contains(&HostName::intern("sanc-ghost")));
        assert_eq!(a.count_nodes(), 1);

        let snap = a.peer_snapshots();
        assert_eq!(snap.len(), 1);
        assert!(!snap[0].sanctioned);

        a.shutdown();
    }
}
