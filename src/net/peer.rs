//! Per-peer state: connection lifecycle, send queue, ack wait list, liveness bookkeeping.
//!
//! A peer entry lives as long as the peer is part of the mesh, across any number of socket
//!  lifetimes. At most one connect task, one reader and one writer exist per peer at any time;
//!  the reader/writer pair belongs to one socket generation and exits when it dies.

use std::sync::atomic::{AtomicBool, AtomicU16, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::watch;
use tracing::debug;

use crate::net::ack::AckRegistry;
use crate::net::config::Tunables;
use crate::net::error::SendError;
use crate::net::hooks::{NetCmp, QueueStat};
use crate::net::hostname::HostName;
use crate::net::queue::{QueueLimits, QueuedFrame, SendQueue};
use crate::net::stats::{PeerStats, QueueSizeMetric, RxTimestamp};

/// Externally visible connection state, derived from the lifecycle flags.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum ConnState {
    /// no socket, no workers; the connect task will dial
    Idle,
    /// a dial attempt is in flight
    Connecting,
    /// socket up, connect message exchanged, peer's hello not yet seen
    HelloPending,
    /// fully up: user messages flow
    Up,
    /// shutdown initiated, workers draining
    Closing,
    /// decommissioned
    Closed,
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum Worker {
    Reader,
    Writer,
}

/// Handles for one socket generation. The reader and writer own the stream halves themselves;
///  this records the shared teardown signal.
pub(crate) struct Conn {
    closed_tx: watch::Sender<bool>,
    pub subnet: Option<String>,
}

#[derive(Default)]
struct Lifecycle {
    conn: Option<Conn>,
    have_reader: bool,
    have_writer: bool,
}

pub struct Peer {
    pub host: HostName,
    /// 0 means "unknown, resolve through the name service on each dial"
    port: AtomicU16,

    pub queue: SendQueue,
    pub acks: AckRegistry,
    pub stats: PeerStats,
    pub queue_metric: QueueSizeMetric,
    /// updated by the reader on every inbound frame; the liveness check kills stale sockets
    pub last_rx: RxTimestamp,
    pub(crate) qstat: Mutex<Option<Arc<dyn QueueStat>>>,

    lifecycle: Mutex<Lifecycle>,
    got_hello: AtomicBool,
    decom: AtomicBool,
    closed: AtomicBool,
    /// the socket is fully released, not merely shutting down
    really_closed: AtomicBool,
    running_user_func: AtomicBool,
    /// consecutive reader failures since the last success; throttles log spam only
    distress: AtomicU32,
    dialing: AtomicBool,
    pub(crate) have_connect_task: AtomicBool,
}

impl Peer {
    pub fn new(host: HostName, port: u16) -> Peer {
        Peer {
            host,
            port: AtomicU16::new(port),
            queue: SendQueue::new(),
            acks: AckRegistry::new(),
            stats: PeerStats::default(),
            queue_metric: QueueSizeMetric::new(),
            last_rx: RxTimestamp::now(),
            qstat: Mutex::new(None),
            lifecycle: Mutex::new(Lifecycle::default()),
            got_hello: AtomicBool::new(false),
            decom: AtomicBool::new(false),
            closed: AtomicBool::new(true),
            really_closed: AtomicBool::new(true),
            running_user_func: AtomicBool::new(false),
            distress: AtomicU32::new(0),
            dialing: AtomicBool::new(false),
            have_connect_task: AtomicBool::new(false),
        }
    }

    pub fn port(&self) -> u16 {
        self.port.load(Ordering::Relaxed)
    }

    pub fn set_port(&self, port: u16) {
        self.port.store(port, Ordering::Relaxed);
    }

    pub fn has_conn(&self) -> bool {
        self.lifecycle.lock().expect("peer lifecycle poisoned").conn.is_some()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn is_really_closed(&self) -> bool {
        self.really_closed.load(Ordering::SeqCst)
    }

    pub fn got_hello(&self) -> bool {
        self.got_hello.load(Ordering::SeqCst)
    }

    pub fn set_got_hello(&self) {
        self.got_hello.store(true, Ordering::SeqCst);
    }

    pub fn is_decom(&self) -> bool {
        self.decom.load(Ordering::SeqCst)
    }

    pub fn set_decom(&self) {
        self.decom.store(true, Ordering::SeqCst);
    }

    pub fn set_running_user_func(&self, running: bool) {
        self.running_user_func.store(running, Ordering::SeqCst);
    }

    pub fn is_running_user_func(&self) -> bool {
        self.running_user_func.load(Ordering::SeqCst)
    }

    /// returns the previous value so the reader can log only on the first failure
    pub fn enter_distress(&self) -> u32 {
        self.distress.fetch_add(1, Ordering::Relaxed)
    }

    /// returns how many failure cycles the peer had accumulated
    pub fn leave_distress(&self) -> u32 {
        self.distress.swap(0, Ordering::Relaxed)
    }

    pub fn distress(&self) -> u32 {
        self.distress.load(Ordering::Relaxed)
    }

    pub(crate) fn set_dialing(&self, dialing: bool) {
        self.dialing.store(dialing, Ordering::SeqCst);
    }

    pub fn conn_state(&self) -> ConnState {
        if self.is_decom() {
            return ConnState::Closed;
        }
        let lifecycle = self.lifecycle.lock().expect("peer lifecycle poisoned");
        if lifecycle.conn.is_some() {
            if self.is_closed() {
                ConnState::Closing
            } else if self.got_hello() {
                ConnState::Up
            } else {
                ConnState::HelloPending
            }
        } else if lifecycle.have_reader || lifecycle.have_writer {
            ConnState::Closing
        } else if self.dialing.load(Ordering::SeqCst) {
            ConnState::Connecting
        } else {
            ConnState::Idle
        }
    }

    pub fn last_used_subnet(&self) -> Option<String> {
        self.lifecycle.lock().expect("peer lifecycle poisoned")
            .conn.as_ref()
            .and_then(|c| c.subnet.clone())
    }

    /// Installs a new socket generation: clears the closed flags, resets the hello gate and
    ///  marks both workers as live. Returns the teardown signal the workers watch, or `None`
    ///  when another connection is already installed or still draining - the loser of a
    ///  crossed dial/accept race must drop its stream.
    pub(crate) fn publish_conn(&self, subnet: Option<String>) -> Option<watch::Receiver<bool>> {
        let mut lifecycle = self.lifecycle.lock().expect("peer lifecycle poisoned");
        if lifecycle.conn.is_some() || lifecycle.have_reader || lifecycle.have_writer {
            return None;
        }

        let (closed_tx, closed_rx) = watch::channel(false);
        lifecycle.conn = Some(Conn { closed_tx, subnet });
        lifecycle.have_reader = true;
        lifecycle.have_writer = true;
        self.got_hello.store(false, Ordering::SeqCst);
        self.closed.store(false, Ordering::SeqCst);
        self.really_closed.store(false, Ordering::SeqCst);
        self.last_rx.touch();

        Some(closed_rx)
    }

    /// Initiates shutdown of the current socket: wakes blocked workers so they exit on their
    ///  own, and releases the connection immediately if none are live. Closing also drops the
    ///  hello gate so user sends fail until the next connection's hello.
    ///
    /// Returns true on the open -> closed transition, so the caller can fire the host-down
    ///  notification exactly once per connection.
    ///
    /// Must never acquire the peer table lock: the liveness check calls this while holding the
    ///  table's read lock.
    pub fn close(&self) -> bool {
        let mut lifecycle = self.lifecycle.lock().expect("peer lifecycle poisoned");
        self.close_ll(&mut lifecycle)
    }

    fn close_ll(&self, lifecycle: &mut Lifecycle) -> bool {
        let newly_closed = !self.closed.swap(true, Ordering::SeqCst);
        if newly_closed {
            self.got_hello.store(false, Ordering::SeqCst);
        }
        if let Some(conn) = &lifecycle.conn {
            let _ = conn.closed_tx.send(true);
        }
        self.queue.wake_writer();

        if !lifecycle.have_reader && !lifecycle.have_writer {
            if lifecycle.conn.take().is_some() {
                debug!(host = %self.host, "socket fully released");
            }
            self.really_closed.store(true, Ordering::SeqCst);
        }
        newly_closed
    }

    /// A reader or writer task is exiting. The last one out releases the socket. Returns
    ///  whether this exit was the closed transition (host-down fires then) and whether the
    ///  socket is now fully released.
    pub(crate) fn worker_exited(&self, worker: Worker) -> (bool, bool) {
        let mut lifecycle = self.lifecycle.lock().expect("peer lifecycle poisoned");
        match worker {
            Worker::Reader => lifecycle.have_reader = false,
            Worker::Writer => lifecycle.have_writer = false,
        }
        let was_released = self.is_really_closed();
        let newly_closed = self.close_ll(&mut lifecycle);
        (newly_closed, !was_released && self.is_really_closed())
    }

    pub(crate) fn queue_limits(&self, tunables: &Tunables) -> QueueLimits {
        QueueLimits {
            max_queue: tunables.max_queue.load(Ordering::Relaxed),
            max_bytes: tunables.max_bytes.load(Ordering::Relaxed),
            reorder_lookahead: tunables.reorder_lookahead.load(Ordering::Relaxed),
        }
    }

    /// Queues a frame, feeding the queue metrics and waking the writer for no-delay frames.
    ///  Buffered frames are left for the writer's poll interval to batch up.
    pub(crate) fn enqueue_frame(&self, frame: QueuedFrame, tunables: &Tunables, cmp: Option<&dyn NetCmp>) -> Result<(), SendError> {
        let wire_type: i32 = frame.wire_type.into();
        let wire_len = frame.wire_len;
        let no_delay = frame.flags.no_delay;

        self.queue.enqueue(frame, self.queue_limits(tunables), cmp)?;

        self.queue_metric.add(wire_len);
        if let Some(qstat) = self.qstat.lock().expect("peer qstat poisoned").as_ref() {
            qstat.on_enqueue(wire_type, wire_len);
        }
        if no_delay {
            self.queue.wake_writer();
        }
        Ok(())
    }

    /// Blocks the caller until this peer's queue depth drops below the throttle thresholds.
    ///  Returns the number of wait loops taken.
    pub async fn throttle_wait(&self, tunables: &Tunables) -> u64 {
        let mut waits = 0;
        loop {
            if self.is_closed() {
                return waits;
            }
            let Some((queue_threshold, byte_threshold)) = tunables.throttle_thresholds() else {
                return waits;
            };
            let (count, bytes) = self.queue.depth();
            if count <= queue_threshold && bytes <= byte_threshold {
                return waits;
            }

            waits += 1;
            self.stats.throttle_waits.fetch_add(1, Ordering::Relaxed);
            self.queue.throttle_parked(Duration::from_secs(1)).await;
        }
    }
}

impl std::fmt::Debug for Peer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Peer{{{}:{} {:?}}}", self.host, self.port(), self.conn_state())
    }
}


#[cfg(test)]
mod test {
    use std::sync::atomic::Ordering as AtomicOrdering;

    use bytes::Bytes;

    use crate::net::queue::{make_frame, WriteFlags};
    use crate::net::wire::WireType;

    use super::*;

    fn test_peer() -> Peer {
        Peer::new(HostName::intern("peer-under-test"), 7000)
    }

    #[test]
    fn test_fresh_peer_is_idle() {
        let peer = test_peer();
        assert_eq!(peer.conn_state(), ConnState::Idle);
        assert!(peer.is_really_closed());
        assert!(!peer.has_conn());
    }

    #[test]
    fn test_publish_conn_transitions_to_hello_pending() {
        let peer = test_peer();
        let closed_rx = peer.publish_conn(Some("_n1".to_string())).unwrap();

        assert_eq!(peer.conn_state(), ConnState::HelloPending);
        assert!(!*closed_rx.borrow());
        assert!(peer.has_conn());
        assert!(!peer.is_really_closed());
        assert_eq!(peer.last_used_subnet().as_deref(), Some("_n1"));

        peer.set_got_hello();
        assert_eq!(peer.conn_state(), ConnState::Up);
    }

    #[test]
    fn test_close_signals_workers_and_waits_for_them() {
        let peer = test_peer();
        let closed_rx = peer.publish_conn(None).unwrap();

        peer.close();
        assert!(*closed_rx.borrow());
        assert_eq!(peer.conn_state(), ConnState::Closing);
        // workers are still registered, so the socket is not yet fully released
        assert!(!peer.is_really_closed());

        assert_eq!(peer.worker_exited(Worker::Reader), (false, false));
        let (_, released) = peer.worker_exited(Worker::Writer);
        assert!(released);
        assert!(peer.is_really_closed());
        assert_eq!(peer.conn_state(), ConnState::Idle);
    }

    #[test]
    fn test_worker_exit_initiates_close() {
        let peer = test_peer();
        let closed_rx = peer.publish_conn(None).unwrap();

        // a reader dying on a socket error closes the connection for the writer too
        let (newly_closed, _) = peer.worker_exited(Worker::Reader);
        assert!(newly_closed);
        assert!(*closed_rx.borrow());
        assert!(peer.is_closed());
        // the hello gate drops with the connection
        assert!(!peer.got_hello());
    }

    #[test]
    fn test_reconnect_resets_hello_gate() {
        let peer = test_peer();
        peer.publish_conn(None).unwrap();
        peer.set_got_hello();
        peer.close();
        peer.worker_exited(Worker::Reader);
        peer.worker_exited(Worker::Writer);

        assert!(peer.publish_conn(None).is_some());
        assert!(!peer.got_hello());
        assert_eq!(peer.conn_state(), ConnState::HelloPending);
    }

    #[test]
    fn test_publish_conn_rejects_second_socket() {
        let peer = test_peer();
        peer.publish_conn(None).unwrap();
        // a crossed dial/accept race: the second connection must be refused
        assert!(peer.publish_conn(None).is_none());
    }

    #[test]
    fn test_distress_cycle() {
        let peer = test_peer();
        assert_eq!(peer.enter_distress(), 0);
        assert_eq!(peer.enter_distress(), 1);
        assert_eq!(peer.leave_distress(), 2);
        assert_eq!(peer.distress(), 0);
    }

    #[tokio::test]
    async fn test_throttle_wait_released_by_drain() {
        let tunables = Tunables::default();
        tunables.max_queue.store(4, AtomicOrdering::Relaxed);
        tunables.max_bytes.store(1 << 20, AtomicOrdering::Relaxed);
        // thresholds: 2 frames / 512k bytes

        let peer = Arc::new(test_peer());
        peer.publish_conn(None).unwrap();
        for i in 0..4u8 {
            peer.enqueue_frame(
                make_frame(WireType::UserMsg, WriteFlags::none(), Bytes::copy_from_slice(&[i]), 52),
                &tunables,
                None,
            ).unwrap();
        }

        let waiter = {
            let peer = peer.clone();
            let tunables = Arc::new(tunables);
            let t = tunables.clone();
            tokio::spawn(async move { peer.throttle_wait(&t).await })
        };

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!waiter.is_finished());

        let _ = peer.queue.drain();
        let waits = tokio::time::timeout(Duration::from_secs(5), waiter)
            .await
            .expect("throttle waiter was not released by the drain")
            .unwrap();
        assert!(waits >= 1);
    }

    #[test]
    fn test_decom_is_terminal_state() {
        let peer = test_peer();
        peer.publish_conn(None).unwrap();
        peer.set_decom();
        assert_eq!(peer.conn_state(), ConnState::Closed);
    }
}
