//! The per-peer send queue.
//!
//! Enqueue happens on caller tasks under a plain mutex; the writer drains by detaching the
//!  whole list under the mutex and writing with the mutex released, so senders are never
//!  blocked behind the network. The mutex is never held across an `.await`.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use bytes::Bytes;
use tokio::sync::Notify;

use crate::net::error::SendError;
use crate::net::hooks::NetCmp;
use crate::net::stats::epoch_secs;
use crate::net::wire::WireType;

/// Per-frame queueing behavior flags.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Default)]
pub struct WriteFlags {
    /// insert at the front of the queue, pre-empting bulk traffic
    pub head: bool,
    /// drop the frame if the current head frame has the same type
    pub no_dupe: bool,
    /// flush the stream after the write batch containing this frame
    pub no_delay: bool,
    /// bypass the queue's count and byte caps
    pub no_limit: bool,
    /// insert in comparator order within the reorder lookahead window
    pub inorder: bool,
}

impl WriteFlags {
    pub const fn none() -> WriteFlags {
        WriteFlags { head: false, no_dupe: false, no_delay: false, no_limit: false, inorder: false }
    }

    pub const fn nodelay() -> WriteFlags {
        WriteFlags { no_delay: true, ..WriteFlags::none() }
    }

    /// heartbeats jump the queue, collapse against a queued heartbeat, flush immediately and
    ///  ignore backpressure
    pub const fn heartbeat() -> WriteFlags {
        WriteFlags { head: true, no_dupe: true, no_delay: true, no_limit: true, inorder: false }
    }

    /// decom messages pre-empt bulk traffic and must never be dropped
    pub const fn urgent() -> WriteFlags {
        WriteFlags { head: true, no_dupe: false, no_delay: true, no_limit: true, inorder: false }
    }
}

/// One outbound frame, encoded except for its envelope. The writer prepends the envelope with
///  the node's identity at the time of transmission, so only the type is fixed here.
#[derive(Debug, Clone)]
pub struct QueuedFrame {
    pub wire_type: WireType,
    pub flags: WriteFlags,
    pub body: Bytes,
    /// envelope length plus body length, the frame's full footprint on the wire
    pub wire_len: usize,
    pub enqueued_at: Instant,
}

#[derive(Debug, Clone, Copy)]
pub struct QueueLimits {
    pub max_queue: u32,
    pub max_bytes: u64,
    pub reorder_lookahead: u32,
}

/// How the flush-interval accounting classified one send.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum FlushClass {
    /// the caller asked for no-delay itself
    Explicit,
    /// promoted to no-delay because the interval counter ran over
    Interval,
    Buffered,
}

#[derive(Debug, Default)]
struct QueueInner {
    list: VecDeque<QueuedFrame>,
    bytes: u64,
    peak_count: u32,
    peak_count_at: i64,
    peak_bytes: u64,
    peak_bytes_at: i64,
    dedupe_count: u64,
    num_queue_full: u64,
    reorders: u64,
    sends_since_flush: u32,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct QueueCounters {
    pub count: u32,
    pub bytes: u64,
    pub peak_count: u32,
    pub peak_count_at: i64,
    pub peak_bytes: u64,
    pub peak_bytes_at: i64,
    pub dedupe_count: u64,
    pub num_queue_full: u64,
    pub reorders: u64,
}

pub struct SendQueue {
    inner: Mutex<QueueInner>,
    write_wakeup: Notify,
    throttle_wakeup: Notify,
}

impl SendQueue {
    pub fn new() -> SendQueue {
        SendQueue {
            inner: Mutex::new(QueueInner::default()),
            write_wakeup: Notify::new(),
            throttle_wakeup: Notify::new(),
        }
    }

    /// Queues a frame for the writer. Fails with [SendError::QueueFull] when either cap is
    ///  exceeded, except that one frame is always allowed into an empty queue so a critical
    ///  message can't deadlock behind a stuck peer.
    pub fn enqueue(&self, frame: QueuedFrame, limits: QueueLimits, cmp: Option<&dyn NetCmp>) -> Result<(), SendError> {
        let mut inner = self.inner.lock().expect("send queue poisoned");

        if !inner.list.is_empty()
            && !frame.flags.no_limit
            && (inner.list.len() as u32 > limits.max_queue || inner.bytes > limits.max_bytes)
        {
            inner.num_queue_full += 1;
            return Err(SendError::QueueFull);
        }

        if frame.flags.no_dupe
            && inner.list.front().map(|head| head.wire_type == frame.wire_type).unwrap_or(false)
        {
            inner.dedupe_count += 1;
            return Ok(());
        }

        let wire_len = frame.wire_len as u64;

        if frame.flags.head || inner.list.is_empty() {
            if frame.flags.head {
                inner.list.push_front(frame);
            } else {
                inner.list.push_back(frame);
            }
        } else if frame.flags.inorder && cmp.is_some() {
            let cmp = cmp.expect("checked above");
            let mut idx = inner.list.len();
            let mut steps = 0;
            while idx > 0
                && steps < limits.reorder_lookahead
                && cmp.compare(&frame.body, &inner.list[idx - 1].body) == std::cmp::Ordering::Less
            {
                idx -= 1;
                steps += 1;
            }
            if idx != inner.list.len() {
                inner.reorders += 1;
            }
            inner.list.insert(idx, frame);
        } else {
            inner.list.push_back(frame);
        }

        inner.bytes += wire_len;
        if inner.list.len() as u32 > inner.peak_count {
            inner.peak_count = inner.list.len() as u32;
            inner.peak_count_at = epoch_secs();
        }
        if inner.bytes > inner.peak_bytes {
            inner.peak_bytes = inner.bytes;
            inner.peak_bytes_at = epoch_secs();
        }

        Ok(())
    }

    /// Detaches the entire queue for the writer, resetting the counters, and releases any
    ///  throttled producers. Returns `None` when there is nothing to write.
    pub fn drain(&self) -> Option<(VecDeque<QueuedFrame>, u32, u64)> {
        let detached = {
            let mut inner = self.inner.lock().expect("send queue poisoned");
            if inner.list.is_empty() {
                return None;
            }
            let list = std::mem::take(&mut inner.list);
            let count = list.len() as u32;
            let bytes = inner.bytes;
            inner.bytes = 0;
            (list, count, bytes)
        };

        self.throttle_wakeup.notify_waiters();
        Some(detached)
    }

    /// Drops all queued frames, e.g. when the connection is torn down.
    pub fn clear(&self) -> (u32, u64) {
        let cleared = {
            let mut inner = self.inner.lock().expect("send queue poisoned");
            let count = inner.list.len() as u32;
            let bytes = inner.bytes;
            inner.list.clear();
            inner.bytes = 0;
            (count, bytes)
        };
        self.throttle_wakeup.notify_waiters();
        cleared
    }

    pub fn depth(&self) -> (u32, u64) {
        let inner = self.inner.lock().expect("send queue poisoned");
        (inner.list.len() as u32, inner.bytes)
    }

    pub fn counters(&self) -> QueueCounters {
        let inner = self.inner.lock().expect("send queue poisoned");
        QueueCounters {
            count: inner.list.len() as u32,
            bytes: inner.bytes,
            peak_count: inner.peak_count,
            peak_count_at: inner.peak_count_at,
            peak_bytes: inner.peak_bytes,
            peak_bytes_at: inner.peak_bytes_at,
            dedupe_count: inner.dedupe_count,
            num_queue_full: inner.num_queue_full,
            reorders: inner.reorders,
        }
    }

    /// Calls `f` for every queued frame, under the queue mutex. Only for diagnostics.
    pub fn for_each_frame(&self, mut f: impl FnMut(&QueuedFrame)) {
        let inner = self.inner.lock().expect("send queue poisoned");
        for frame in &inner.list {
            f(frame);
        }
    }

    /// Flush-interval accounting: every `flush_interval` buffered sends, the next one is
    ///  promoted to no-delay. An explicitly no-delay send resets the interval.
    pub fn flush_tick(&self, explicit_nodelay: bool, flush_interval: u32) -> FlushClass {
        let mut inner = self.inner.lock().expect("send queue poisoned");
        inner.sends_since_flush += 1;
        if explicit_nodelay {
            inner.sends_since_flush = 0;
            FlushClass::Explicit
        } else if inner.sends_since_flush > flush_interval {
            inner.sends_since_flush = 0;
            FlushClass::Interval
        } else {
            FlushClass::Buffered
        }
    }

    pub fn wake_writer(&self) {
        self.write_wakeup.notify_one();
    }

    /// Parks the writer until it is woken or the poll interval elapses, whichever is first.
    pub async fn wait_for_work(&self, poll: Duration) {
        let _ = tokio::time::timeout(poll, self.write_wakeup.notified()).await;
    }

    /// Parks a throttled producer until the writer drains the queue or the interval elapses.
    pub async fn throttle_parked(&self, interval: Duration) {
        let _ = tokio::time::timeout(interval, self.throttle_wakeup.notified()).await;
    }
}

/// builds a frame with its wire footprint computed from the envelope and long-name tails
pub fn make_frame(wire_type: WireType, flags: WriteFlags, body: Bytes, envelope_len: usize) -> QueuedFrame {
    let wire_len = envelope_len + body.len();
    QueuedFrame {
        wire_type,
        flags,
        body,
        wire_len,
        enqueued_at: Instant::now(),
    }
}
