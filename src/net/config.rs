use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::Duration;

use crate::net::hooks::TlsPolicy;

/// Startup configuration for one mesh membership. Everything here is fixed once the mesh is
///  started; knobs that are meant to be turned at runtime live in [Tunables].
#[derive(Debug)]
pub struct NetConfig {
    /// this node's own name in the mesh; also its identity for all peers
    pub hostname: String,
    /// listen port; 0 means "register with the name service and use whatever it assigns"
    pub port: u16,

    /// service triple used for name-service registration and resolution
    pub app: String,
    pub service: String,
    pub instance: String,

    /// a listener bound by the host process before startup, to guard against a second instance
    ///  coming up on the same data. When absent the mesh binds its own.
    pub listener: Option<std::net::TcpListener>,

    pub tls_policy: TlsPolicy,

    /// number of user-type slots in the handler table
    pub max_user_type: usize,
}

impl NetConfig {
    pub fn new(hostname: impl Into<String>, port: u16) -> NetConfig {
        NetConfig {
            hostname: hostname.into(),
            port,
            app: "replinet".to_string(),
            service: "replication".to_string(),
            instance: "default".to_string(),
            listener: None,
            tls_policy: TlsPolicy::Disabled,
            max_user_type: 256,
        }
    }

    pub fn with_service(mut self, app: impl Into<String>, service: impl Into<String>, instance: impl Into<String>) -> NetConfig {
        self.app = app.into();
        self.service = service.into();
        self.instance = instance.into();
        self
    }
}


/// Runtime-adjustable knobs. All of them are plain atomics so operational tooling can turn them
///  while the mesh is live, without any locking.
#[derive(Debug)]
pub struct Tunables {
    /// send queue cap, in frames
    pub max_queue: AtomicU32,
    /// send queue cap, in bytes
    pub max_bytes: AtomicU64,
    /// every this many sends on a peer, the next send is promoted to no-delay
    pub flush_interval: AtomicU32,
    /// upper bound on how far an in-order insert walks back from the queue tail
    pub reorder_lookahead: AtomicU32,
    pub heartbeat_send_secs: AtomicU32,
    pub heartbeat_check_secs: AtomicU32,
    /// percentage of the queue caps below which throttled producers are released
    pub throttle_percent: AtomicU32,
    /// how often to re-assert our name-service registration; 0 disables
    pub portmux_register_secs: AtomicU32,
    /// buffered-stream size for peer sockets
    pub buf_size: AtomicU32,
    /// how long the accept path waits for the first byte of a new connection
    pub netpoll_ms: AtomicU32,
    /// writer wakeup floor: the writer re-checks its queue at least this often
    pub writer_poll_ms: AtomicU32,
    /// how long a dialing socket may take to become writable
    pub connect_timeout_ms: AtomicU32,
    /// upper bound for the random pre-dial sleep that spreads out reconnect storms
    pub dial_jitter_max_ms: AtomicU32,
    /// how long a subnet marked bad is skipped by the dial rotation
    pub subnet_blackout_ms: AtomicU64,
    /// when set, a failed enqueue dumps the queue contents to the log
    pub dump_full_queue: AtomicU32,
}

impl Default for Tunables {
    fn default() -> Tunables {
        Tunables {
            max_queue: AtomicU32::new(25_000),
            max_bytes: AtomicU64::new(512 * 1024 * 1024),
            flush_interval: AtomicU32::new(1000),
            reorder_lookahead: AtomicU32::new(20),
            heartbeat_send_secs: AtomicU32::new(5),
            heartbeat_check_secs: AtomicU32::new(10),
            throttle_percent: AtomicU32::new(50),
            portmux_register_secs: AtomicU32::new(600),
            buf_size: AtomicU32::new(1024 * 1024),
            netpoll_ms: AtomicU32::new(100),
            writer_poll_ms: AtomicU32::new(1000),
            connect_timeout_ms: AtomicU32::new(100),
            dial_jitter_max_ms: AtomicU32::new(5000),
            subnet_blackout_ms: AtomicU64::new(5000),
            dump_full_queue: AtomicU32::new(0),
        }
    }
}

impl Tunables {
    pub fn heartbeat_send_time(&self) -> Duration {
        Duration::from_secs(self.heartbeat_send_secs.load(Ordering::Relaxed) as u64)
    }

    pub fn heartbeat_check_time(&self) -> Duration {
        Duration::from_secs(self.heartbeat_check_secs.load(Ordering::Relaxed) as u64)
    }

    pub fn writer_poll(&self) -> Duration {
        Duration::from_millis(self.writer_poll_ms.load(Ordering::Relaxed) as u64)
    }

    pub fn netpoll(&self) -> Duration {
        Duration::from_millis(self.netpoll_ms.load(Ordering::Relaxed) as u64)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms.load(Ordering::Relaxed) as u64)
    }

    pub fn subnet_blackout(&self) -> Duration {
        Duration::from_millis(self.subnet_blackout_ms.load(Ordering::Relaxed))
    }

    /// thresholds below which throttle waiters are released; `None` when throttling is
    ///  effectively disabled by the current settings
    pub fn throttle_thresholds(&self) -> Option<(u32, u64)> {
        let percent = self.throttle_percent.load(Ordering::Relaxed) as u64;
        let max_queue = self.max_queue.load(Ordering::Relaxed);
        let max_bytes = self.max_bytes.load(Ordering::Relaxed);

        let queue_threshold = (percent * max_queue as u64 / 100) as u32;
        let byte_threshold = percent * max_bytes / 100;

        if queue_threshold == 0 || queue_threshold >= max_queue
            || byte_threshold == 0 || byte_threshold >= max_bytes
        {
            return None;
        }
        Some((queue_threshold, byte_threshold))
    }
}
