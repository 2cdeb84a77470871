use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Mutex;

use crate::net::hostname::HostName;
use crate::net::peer::ConnState;

/// Per-peer transfer and behavior counters. All plain atomics; reads are snapshots, not
///  transactionally consistent with each other.
#[derive(Debug, Default)]
pub struct PeerStats {
    pub bytes_written: AtomicU64,
    pub bytes_read: AtomicU64,
    pub throttle_waits: AtomicU64,
    pub num_sends: AtomicU64,
    pub num_flushes: AtomicU64,
    pub udp_sent: AtomicU64,
    pub udp_recv: AtomicU64,
}

impl PeerStats {
    pub fn reset_udp(&self) {
        self.udp_sent.store(0, Ordering::Relaxed);
        self.udp_recv.store(0, Ordering::Relaxed);
    }
}

/// Mesh-wide counters, aggregated across peers as events happen.
#[derive(Debug, Default)]
pub struct NetStats {
    pub throttle_waits: AtomicU64,
    pub num_flushes: AtomicU64,
    pub explicit_flushes: AtomicU64,
    pub send_interval_flushes: AtomicU64,
    pub num_accepts: AtomicU64,
    pub num_accept_timeouts: AtomicU64,
}

/// how many recent frame sizes the queue-size metric averages over
const QUEUE_SIZE_WINDOW: usize = 512;

/// Sliding-window metric over the sizes of frames entering a peer's send queue: mean and
///  standard deviation of the last `QUEUE_SIZE_WINDOW` frame footprints. Sums and squared
///  sums are cached so the enqueue path stays O(1); the buffer only grows until the window
///  is full, then recycles the oldest slot.
pub struct QueueSizeMetric {
    window: Mutex<SizeWindow>,
}

#[derive(Default)]
struct SizeWindow {
    sizes: Vec<f64>,
    /// slot the next frame size evicts once the window is full
    next: usize,
    sum: f64,
    square_sum: f64,
}

impl SizeWindow {
    fn record(&mut self, frame_len: usize) {
        let size = frame_len as f64;
        if self.sizes.len() < QUEUE_SIZE_WINDOW {
            self.sizes.push(size);
        } else {
            let evicted = std::mem::replace(&mut self.sizes[self.next], size);
            self.next = (self.next + 1) % QUEUE_SIZE_WINDOW;
            self.sum -= evicted;
            self.square_sum -= evicted * evicted;
        }
        self.sum += size;
        self.square_sum += size * size;
    }

    fn mean(&self) -> f64 {
        self.sum / self.sizes.len() as f64
    }

    fn std_dev(&self) -> f64 {
        if self.sizes.len() < 2 {
            // pragmatic value that serves the purpose of standard deviation in this context
            return 0.0;
        }

        let mean = self.mean();
        let diff_of_squares = self.square_sum - mean * mean * self.sizes.len() as f64;

        (diff_of_squares / (self.sizes.len() - 1) as f64).sqrt()
    }
}

impl QueueSizeMetric {
    pub fn new() -> QueueSizeMetric {
        QueueSizeMetric { window: Mutex::new(SizeWindow::default()) }
    }

    pub fn add(&self, frame_len: usize) {
        self.window.lock().expect("queue size metric poisoned").record(frame_len);
    }

    /// `(mean, std_dev)` over the window; `None` until the first frame is queued
    pub fn snapshot(&self) -> Option<(f64, f64)> {
        let window = self.window.lock().expect("queue size metric poisoned");
        if window.sizes.is_empty() {
            return None;
        }
        Some((window.mean(), window.std_dev()))
    }
}

impl std::fmt::Debug for QueueSizeMetric {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "QueueSizeMetric")
    }
}

/// Point-in-time view of one peer, for operational introspection.
#[derive(Debug, Clone)]
pub struct PeerSnapshot {
    pub host: HostName,
    pub port: u16,
    pub state: ConnState,
    pub sanctioned: bool,
    pub queue_count: u32,
    pub queue_bytes: u64,
    pub peak_queue_count: u32,
    pub peak_queue_count_at: i64,
    pub peak_queue_bytes: u64,
    pub peak_queue_bytes_at: i64,
    pub dedupe_count: u64,
    pub num_queue_full: u64,
    pub bytes_written: u64,
    pub bytes_read: u64,
    pub throttle_waits: u64,
    pub reorders: u64,
    pub udp_sent: u64,
    pub udp_recv: u64,
    pub distress: u32,
    pub subnet: Option<String>,
    pub queue_size_metric: Option<(f64, f64)>,
}

/// Counters kept per registered user-type handler.
#[derive(Debug, Default)]
pub struct HandlerStats {
    pub calls: AtomicU64,
    pub total_us: AtomicU64,
}

/// Timestamp helper: seconds since the epoch, the granularity the liveness checks work in.
pub fn epoch_secs() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

/// Last-inbound-data timestamp for one peer, shared between the reader (writes) and the
///  liveness check task (reads).
#[derive(Debug)]
pub struct RxTimestamp(AtomicI64);

impl RxTimestamp {
    pub fn now() -> RxTimestamp {
        RxTimestamp(AtomicI64::new(epoch_secs()))
    }

    pub fn touch(&self) {
        self.0.store(epoch_secs(), Ordering::Relaxed);
    }

    pub fn age_secs(&self) -> i64 {
        epoch_secs() - self.0.load(Ordering::Relaxed)
    }
}
