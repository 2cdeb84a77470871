//! The per-connection writer task.
//!
//! Drains the peer's send queue in detached batches and streams them out, rewriting every
//!  frame's envelope with the node's current identity immediately before transmit. The queue
//!  mutex is never held while writing, so senders enqueue freely during a slow batch.

use std::io;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::BytesMut;
use tokio::io::{AsyncWriteExt, BufWriter};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::net::hello;
use crate::net::net::Net;
use crate::net::peer::{Peer, Worker};
use crate::net::wire::Envelope;

pub(crate) async fn run_writer(net: Arc<Net>, peer: Arc<Peer>, write_half: OwnedWriteHalf, mut closed_rx: watch::Receiver<bool>) {
    net.hooks.notify_task_start();
    debug!(host = %peer.host, "writer starting");

    let buf_size = net.tunables.buf_size.load(Ordering::Relaxed) as usize;
    let mut stream = BufWriter::with_capacity(buf_size, write_half);

    // first thing on a fresh connection: advertise our peer list
    if let Err(e) = hello::enqueue_hello(&net, &peer, false) {
        debug!(to = %peer.host, "could not queue hello: {}", e);
    }

    'conn: while !peer.is_decom() && !peer.is_closed() && !net.is_exiting() {
        while let Some((frames, count, bytes)) = peer.queue.drain() {
            let batch_start = Instant::now();
            let mut need_flush = false;
            let mut max_age = Duration::ZERO;
            let mut write_failed = false;

            for frame in frames {
                if write_failed || *closed_rx.borrow() {
                    // drop the remainder of the detached batch, like any frames lost to a
                    // broken connection
                    continue;
                }
                if frame.flags.no_delay {
                    need_flush = true;
                    max_age = max_age.max(frame.enqueued_at.elapsed());
                }

                let mut envelope = BytesMut::with_capacity(frame.wire_len - frame.body.len());
                Envelope::encode(
                    net.hostname().as_str(),
                    net.my_port(),
                    peer.host.as_str(),
                    peer.port(),
                    frame.wire_type,
                    &mut envelope,
                );

                let write_result = tokio::select! {
                    r = async {
                        stream.write_all(&envelope).await?;
                        stream.write_all(&frame.body).await
                    } => r,
                    _ = closed_rx.changed() => Err(io::Error::new(io::ErrorKind::ConnectionAborted, "connection closing")),
                };

                match write_result {
                    Ok(()) => {
                        peer.stats.bytes_written.fetch_add((envelope.len() + frame.body.len()) as u64, Ordering::Relaxed);
                    }
                    Err(e) => {
                        info!(host = %peer.host, "write error: {}", e);
                        write_failed = true;
                    }
                }
            }

            if need_flush && !write_failed {
                let flush_result = tokio::select! {
                    r = stream.flush() => r,
                    _ = closed_rx.changed() => Err(io::Error::new(io::ErrorKind::ConnectionAborted, "connection closing")),
                };
                match flush_result {
                    Ok(()) => {
                        peer.stats.num_flushes.fetch_add(1, Ordering::Relaxed);
                        net.stats.num_flushes.fetch_add(1, Ordering::Relaxed);
                    }
                    Err(e) => {
                        info!(host = %peer.host, "flush error: {}", e);
                        write_failed = true;
                    }
                }
            }

            let elapsed = batch_start.elapsed();
            if elapsed >= Duration::from_secs(2) {
                // informational; a slow batch does not necessarily mean the network misbehaves
                warn!(host = %peer.host, secs = elapsed.as_secs(), items = count, bytes,
                    max_age_ms = max_age.as_millis() as u64, "long write");
            }

            if write_failed {
                break 'conn;
            }
        }

        tokio::select! {
            _ = peer.queue.wait_for_work(net.tunables.writer_poll()) => {}
            _ = closed_rx.changed() => {}
        }
    }

    // half-close so the remote reader sees EOF promptly
    let _ = stream.shutdown().await;

    debug!(host = %peer.host, "writer exiting");
    let (newly_closed, _) = peer.worker_exited(Worker::Writer);
    if newly_closed {
        net.fire_host_down(&peer.host);
    }
    net.hooks.notify_task_stop();
}
