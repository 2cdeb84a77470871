//! Idle timers layered on top of admitted application sockets.
//!
//! Every appsock stream is wrapped in a [WatchedStream] that stamps when a read or write
//!  started. A periodic sweep (driven by the liveness check task) kills sessions whose pending
//!  I/O has been stuck longer than their timeout. Killing is the async analogue of
//!  `shutdown(2)`: it wakes the blocked operation, which then fails with a timeout error, and
//!  the session unwinds on its own.

use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll, Waker};

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tracing::info;

use crate::net::stats::epoch_secs;

#[derive(Debug)]
pub struct WatchState {
    /// 0 disables the respective timer
    read_timeout_secs: AtomicU32,
    write_timeout_secs: AtomicU32,
    /// epoch seconds when the pending operation started; 0 while idle
    read_started: AtomicI64,
    write_started: AtomicI64,
    killed: AtomicBool,
    /// the stream was dropped; the sweep prunes the entry
    done: AtomicBool,
    read_waker: Mutex<Option<Waker>>,
    write_waker: Mutex<Option<Waker>>,
}

impl WatchState {
    fn new(read_timeout_secs: u32, write_timeout_secs: u32) -> WatchState {
        WatchState {
            read_timeout_secs: AtomicU32::new(read_timeout_secs),
            write_timeout_secs: AtomicU32::new(write_timeout_secs),
            read_started: AtomicI64::new(0),
            write_started: AtomicI64::new(0),
            killed: AtomicBool::new(false),
            done: AtomicBool::new(false),
            read_waker: Mutex::new(None),
            write_waker: Mutex::new(None),
        }
    }

    pub fn set_timeouts(&self, read_timeout_secs: u32, write_timeout_secs: u32) {
        self.read_timeout_secs.store(read_timeout_secs, Ordering::Relaxed);
        self.write_timeout_secs.store(write_timeout_secs, Ordering::Relaxed);
    }

    /// Terminal: wakes any pending read/write, which will fail with a timeout error.
    pub fn kill(&self) {
        self.killed.store(true, Ordering::SeqCst);
        if let Some(w) = self.read_waker.lock().expect("watch state poisoned").take() {
            w.wake();
        }
        if let Some(w) = self.write_waker.lock().expect("watch state poisoned").take() {
            w.wake();
        }
    }

    pub fn is_killed(&self) -> bool {
        self.killed.load(Ordering::SeqCst)
    }

    fn timed_out(&self, now: i64) -> bool {
        let check = |started: &AtomicI64, timeout: &AtomicU32| {
            let started = started.load(Ordering::Relaxed);
            let timeout = timeout.load(Ordering::Relaxed) as i64;
            started != 0 && timeout != 0 && now - started > timeout
        };
        check(&self.read_started, &self.read_timeout_secs)
            || check(&self.write_started, &self.write_timeout_secs)
    }
}

/// A stream wrapper feeding one watchlist entry. Dropping it retires the entry.
pub struct WatchedStream<S> {
    inner: S,
    state: Arc<WatchState>,
}

impl<S> WatchedStream<S> {
    pub fn state(&self) -> Arc<WatchState> {
        self.state.clone()
    }

    pub fn get_ref(&self) -> &S {
        &self.inner
    }
}

impl<S> Drop for WatchedStream<S> {
    fn drop(&mut self) {
        self.state.done.store(true, Ordering::SeqCst);
    }
}

fn killed_error() -> io::Error {
    io::Error::new(io::ErrorKind::TimedOut, "session timed out by watchlist")
}

impl<S: AsyncRead + Unpin> AsyncRead for WatchedStream<S> {
    fn poll_read(mut self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
        if self.state.is_killed() {
            return Poll::Ready(Err(killed_error()));
        }
        *self.state.read_waker.lock().expect("watch state poisoned") = Some(cx.waker().clone());

        let state = self.state.clone();
        match Pin::new(&mut self.inner).poll_read(cx, buf) {
            Poll::Pending => {
                if state.read_started.load(Ordering::Relaxed) == 0 {
                    state.read_started.store(epoch_secs(), Ordering::Relaxed);
                }
                Poll::Pending
            }
            ready => {
                state.read_started.store(0, Ordering::Relaxed);
                ready
            }
        }
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for WatchedStream<S> {
    fn poll_write(mut self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        if self.state.is_killed() {
            return Poll::Ready(Err(killed_error()));
        }
        *self.state.write_waker.lock().expect("watch state poisoned") = Some(cx.waker().clone());

        let state = self.state.clone();
        match Pin::new(&mut self.inner).poll_write(cx, buf) {
            Poll::Pending => {
                if state.write_started.load(Ordering::Relaxed) == 0 {
                    state.write_started.store(epoch_secs(), Ordering::Relaxed);
                }
                Poll::Pending
            }
            ready => {
                state.write_started.store(0, Ordering::Relaxed);
                ready
            }
        }
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        if self.state.is_killed() {
            return Poll::Ready(Err(killed_error()));
        }
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}


pub struct Watchlist {
    entries: Mutex<Vec<Arc<WatchState>>>,
}

impl Watchlist {
    pub fn new() -> Watchlist {
        Watchlist { entries: Mutex::new(Vec::new()) }
    }

    pub fn wrap<S>(&self, stream: S, read_timeout_secs: u32, write_timeout_secs: u32) -> WatchedStream<S> {
        let state = Arc::new(WatchState::new(read_timeout_secs, write_timeout_secs));
        self.entries.lock().expect("watchlist poisoned").push(state.clone());
        WatchedStream { inner: stream, state }
    }

    /// Kills every session with an over-age pending operation and prunes retired entries.
    pub fn sweep(&self) {
        let now = epoch_secs();
        let mut entries = self.entries.lock().expect("watchlist poisoned");
        entries.retain(|state| {
            if state.done.load(Ordering::SeqCst) {
                return false;
            }
            if !state.is_killed() && state.timed_out(now) {
                info!("timing out watched session");
                state.kill();
            }
            true
        });
    }

    pub fn len(&self) -> usize {
        self.entries.lock().expect("watchlist poisoned").len()
    }
}


#[cfg(test)]
mod test {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    use super::*;

    #[tokio::test]
    async fn test_kill_wakes_blocked_read() {
        let watchlist = Watchlist::new();
        let (client, _server) = tokio::io::duplex(64);
        let mut watched = watchlist.wrap(client, 0, 0);
        let state = watched.state();

        let reader = tokio::spawn(async move {
            let mut buf = [0u8; 8];
            watched.read_exact(&mut buf).await
        });

        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        state.kill();

        let result = tokio::time::timeout(std::time::Duration::from_secs(2), reader)
            .await
            .expect("blocked read was not woken by kill")
            .unwrap();
        assert_eq!(result.unwrap_err().kind(), io::ErrorKind::TimedOut);
    }

    #[tokio::test]
    async fn test_sweep_kills_overdue_read() {
        let watchlist = Watchlist::new();
        let (client, _server) = tokio::io::duplex(64);
        let mut watched = watchlist.wrap(client, 5, 0);
        let state = watched.state();

        let reader = tokio::spawn(async move {
            let mut buf = [0u8; 8];
            watched.read_exact(&mut buf).await
        });

        // let the read park, then age it past its timeout
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        state.read_started.store(epoch_secs() - 10, Ordering::Relaxed);
        watchlist.sweep();

        let result = tokio::time::timeout(std::time::Duration::from_secs(2), reader)
            .await
            .expect("overdue read was not killed by sweep")
            .unwrap();
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_sweep_leaves_healthy_sessions_alone() {
        let watchlist = Watchlist::new();
        let (client, mut server) = tokio::io::duplex(64);
        let mut watched = watchlist.wrap(client, 5, 5);

        watchlist.sweep();
        server.write_all(b"pong").await.unwrap();

        let mut buf = [0u8; 4];
        watched.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"pong");
    }

    #[tokio::test]
    async fn test_dropped_stream_is_pruned() {
        let watchlist = Watchlist::new();
        let (client, _server) = tokio::io::duplex(64);
        let watched = watchlist.wrap(client, 1, 1);
        assert_eq!(watchlist.len(), 1);

        drop(watched);
        watchlist.sweep();
        assert_eq!(watchlist.len(), 0);
    }

    #[tokio::test]
    async fn test_completed_read_clears_age() {
        let watchlist = Watchlist::new();
        let (client, mut server) = tokio::io::duplex(64);
        let mut watched = watchlist.wrap(client, 5, 0);
        let state = watched.state();

        server.write_all(b"data").await.unwrap();
        let mut buf = [0u8; 4];
        watched.read_exact(&mut buf).await.unwrap();

        assert_eq!(state.read_started.load(Ordering::Relaxed), 0);
    }
}
