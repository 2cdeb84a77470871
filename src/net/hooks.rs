//! Pluggable host hooks.
//!
//! The transport stays ignorant of everything above and around it: who resolves service names
//!  to ports, how TLS is negotiated, which peers are admissible, what an LSN looks like inside
//!  a user frame. The host process registers implementations of these traits; every one of
//!  them is optional.

use std::cmp::Ordering;
use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, RwLock};

use anyhow::anyhow;
use async_trait::async_trait;
#[cfg(test)] use mockall::automock;
use tokio::net::TcpStream;

use crate::net::hostname::HostName;
use crate::net::watchlist::WatchedStream;

/// TLS posture for mesh connections. Negotiation itself is delegated to the [Crypto] hook.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum TlsPolicy {
    Disabled,
    /// accept TLS if the peer requests it
    Allow,
    /// request TLS on dial and reject peers that don't negotiate it
    Require,
}

/// TLS handshake hook. The stream is handed over after the plaintext connect exchange and
///  comes back ready for framed traffic (e.g. after a kernel-TLS style in-place negotiation).
#[async_trait]
pub trait Crypto: Send + Sync + 'static {
    async fn connect_handshake(&self, stream: TcpStream) -> anyhow::Result<TcpStream>;
    async fn accept_handshake(&self, stream: TcpStream) -> anyhow::Result<TcpStream>;
}

/// Name service (portmux / getservbyname style): maps a service triple to a TCP port on a
///  given machine, and registers our own listening port under the triple.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait NameService: Send + Sync + 'static {
    async fn resolve(&self, host: &str, app: &str, service: &str, instance: &str) -> anyhow::Result<u16>;

    /// Asserts our registration. `port` 0 asks the service to assign one; the returned port is
    ///  authoritative.
    async fn register(&self, app: &str, service: &str, instance: &str, port: u16) -> anyhow::Result<u16>;
}

/// Maps a (possibly subnet-suffixed) hostname to an address for dialing.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait HostResolver: Send + Sync + 'static {
    async fn lookup(&self, host: &str) -> anyhow::Result<IpAddr>;
}

/// The default resolver: plain DNS via the runtime.
pub struct DnsResolver;

#[async_trait]
impl HostResolver for DnsResolver {
    async fn lookup(&self, host: &str) -> anyhow::Result<IpAddr> {
        let mut addrs = tokio::net::lookup_host((host, 0u16)).await?;
        addrs.next()
            .map(|a| a.ip())
            .ok_or_else(|| anyhow!("no address for host {}", host))
    }
}

/// Comparator for in-order enqueueing, e.g. by the LSN embedded in a replication record. Gets
///  the full user frame bodies (user message header plus data).
pub trait NetCmp: Send + Sync + 'static {
    fn compare(&self, a: &[u8], b: &[u8]) -> Ordering;
}

/// Extracts an LSN from a user frame body for queue-dump diagnostics.
pub trait GetLsn: Send + Sync + 'static {
    fn lsn(&self, body: &[u8]) -> Option<(u32, u32)>;
}

/// Admission check for inbound connections.
#[cfg_attr(test, automock)]
pub trait AllowHook: Send + Sync + 'static {
    fn allow(&self, host: &HostName) -> bool;
}

/// "Is this machine up" oracle, used by hosts for offload target picking.
pub trait Rtcpu: Send + Sync + 'static {
    fn machine_is_up(&self, host: &str) -> bool;
}

/// Notification hooks into the peer lifecycle.
pub trait NewNodeHook: Send + Sync + 'static {
    fn on_new_node(&self, host: &HostName, port: u16);
}
pub trait HostDownHook: Send + Sync + 'static {
    fn on_host_down(&self, host: &HostName);
}
pub trait HelloHook: Send + Sync + 'static {
    fn on_hello(&self, host: &HostName);
}

/// Called at the start and end of every transport task, for caller-side thread-local setup.
pub trait TaskLifecycle: Send + Sync + 'static {
    fn on_start(&self);
    fn on_stop(&self);
}

/// An application socket admitted by the accept path: anything whose first byte is non-zero.
///  The stream is wrapped with the watchlist's idle timers before being handed over.
pub struct AppSockSession {
    pub stream: WatchedStream<TcpStream>,
    /// the peeked first byte, still unread in the stream
    pub first_byte: u8,
    pub admin: bool,
    pub peer_addr: SocketAddr,
}

#[async_trait]
pub trait AppSockHandler: Send + Sync + 'static {
    async fn serve(&self, session: AppSockSession);
}

/// Per-peer queue observation hooks, e.g. for an external queue browser.
pub trait QueueStatFactory: Send + Sync + 'static {
    fn init(&self, service: &str, host: &HostName) -> Arc<dyn QueueStat>;
}
pub trait QueueStat: Send + Sync + 'static {
    fn on_enqueue(&self, wire_type: i32, wire_len: usize);
    fn on_reader_attach(&self);
    fn on_clear(&self);
}

/// The full hook registry. All slots start empty and may be registered at any time, including
///  while the mesh is running; reads are lock-cheap clone-outs.
pub struct Hooks {
    name_service: RwLock<Option<Arc<dyn NameService>>>,
    resolver: RwLock<Arc<dyn HostResolver>>,
    crypto: RwLock<Option<Arc<dyn Crypto>>>,
    netcmp: RwLock<Option<Arc<dyn NetCmp>>>,
    getlsn: RwLock<Option<Arc<dyn GetLsn>>>,
    allow: RwLock<Option<Arc<dyn AllowHook>>>,
    rtcpu: RwLock<Option<Arc<dyn Rtcpu>>>,
    new_node: RwLock<Option<Arc<dyn NewNodeHook>>>,
    host_down: RwLock<Option<Arc<dyn HostDownHook>>>,
    hello: RwLock<Option<Arc<dyn HelloHook>>>,
    task_lifecycle: RwLock<Option<Arc<dyn TaskLifecycle>>>,
    appsock: RwLock<Option<Arc<dyn AppSockHandler>>>,
    admin_appsock: RwLock<Option<Arc<dyn AppSockHandler>>>,
    qstat: RwLock<Option<Arc<dyn QueueStatFactory>>>,
}

macro_rules! hook_accessors {
    ($set:ident, $get:ident, $field:ident, $ty:ty) => {
        pub fn $set(&self, hook: Arc<$ty>) {
            *self.$field.write().expect("hook registry poisoned") = Some(hook);
        }
        pub fn $get(&self) -> Option<Arc<$ty>> {
            self.$field.read().expect("hook registry poisoned").clone()
        }
    }
}

impl Hooks {
    pub fn new() -> Hooks {
        Hooks {
            name_service: RwLock::new(None),
            resolver: RwLock::new(Arc::new(DnsResolver)),
            crypto: RwLock::new(None),
            netcmp: RwLock::new(None),
            getlsn: RwLock::new(None),
            allow: RwLock::new(None),
            rtcpu: RwLock::new(None),
            new_node: RwLock::new(None),
            host_down: RwLock::new(None),
            hello: RwLock::new(None),
            task_lifecycle: RwLock::new(None),
            appsock: RwLock::new(None),
            admin_appsock: RwLock::new(None),
            qstat: RwLock::new(None),
        }
    }

    hook_accessors!(set_name_service, name_service, name_service, dyn NameService);
    hook_accessors!(set_crypto, crypto, crypto, dyn Crypto);
    hook_accessors!(set_netcmp, netcmp, netcmp, dyn NetCmp);
    hook_accessors!(set_getlsn, getlsn, getlsn, dyn GetLsn);
    hook_accessors!(set_allow, allow, allow, dyn AllowHook);
    hook_accessors!(set_rtcpu, rtcpu, rtcpu, dyn Rtcpu);
    hook_accessors!(set_new_node, new_node, new_node, dyn NewNodeHook);
    hook_accessors!(set_host_down, host_down, host_down, dyn HostDownHook);
    hook_accessors!(set_hello, hello, hello, dyn HelloHook);
    hook_accessors!(set_task_lifecycle, task_lifecycle, task_lifecycle, dyn TaskLifecycle);
    hook_accessors!(set_appsock, appsock, appsock, dyn AppSockHandler);
    hook_accessors!(set_admin_appsock, admin_appsock, admin_appsock, dyn AppSockHandler);
    hook_accessors!(set_qstat, qstat, qstat, dyn QueueStatFactory);

    pub fn set_resolver(&self, resolver: Arc<dyn HostResolver>) {
        *self.resolver.write().expect("hook registry poisoned") = resolver;
    }
    pub fn resolver(&self) -> Arc<dyn HostResolver> {
        self.resolver.read().expect("hook registry poisoned").clone()
    }

    pub fn notify_task_start(&self) {
        if let Some(lc) = self.task_lifecycle() {
            lc.on_start();
        }
    }
    pub fn notify_task_stop(&self) {
        if let Some(lc) = self.task_lifecycle() {
            lc.on_stop();
        }
    }
}

impl Default for Hooks {
    fn default() -> Self {
        Hooks::new()
    }
}
