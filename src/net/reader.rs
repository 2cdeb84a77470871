//! The per-connection reader task.
//!
//! Reads one envelope at a time and dispatches on its type. Any I/O error drops the
//!  connection and leaves reconnecting to the dial loop; the distress counter keeps a flapping
//!  link from flooding the log.

use std::future::Future;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Instant;

use tokio::io::{AsyncReadExt, BufReader};
use tokio::net::tcp::OwnedReadHalf;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::net::ack::AckResult;
use crate::net::handler::{AckHandle, ReceivedMessage};
use crate::net::hello;
use crate::net::hostname::HostName;
use crate::net::net::Net;
use crate::net::peer::{Peer, Worker};
use crate::net::wire::{AckMsg, AckPayloadMsg, DecomNameMsg, Envelope, HelloPayload, UserMsgHeader, WireType};

/// Runs `part` unless the connection's teardown signal fires first. Cancelling a read
///  mid-frame is fine: it only happens when the connection is going away.
async fn gated<T>(part: impl Future<Output = anyhow::Result<T>>, closed_rx: &mut watch::Receiver<bool>) -> Option<anyhow::Result<T>> {
    tokio::select! {
        r = part => Some(r),
        _ = closed_rx.changed() => None,
    }
}

/// Counts every byte coming off the socket into the peer's transfer stats.
struct CountingReader {
    inner: OwnedReadHalf,
    peer: Arc<Peer>,
}

impl tokio::io::AsyncRead for CountingReader {
    fn poll_read(
        mut self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
        buf: &mut tokio::io::ReadBuf<'_>,
    ) -> std::task::Poll<std::io::Result<()>> {
        let before = buf.filled().len();
        let result = std::pin::Pin::new(&mut self.inner).poll_read(cx, buf);
        if let std::task::Poll::Ready(Ok(())) = &result {
            let read = buf.filled().len() - before;
            self.peer.stats.bytes_read.fetch_add(read as u64, Ordering::Relaxed);
        }
        result
    }
}

pub(crate) async fn run_reader(net: Arc<Net>, peer: Arc<Peer>, read_half: OwnedReadHalf, mut closed_rx: watch::Receiver<bool>) {
    net.hooks.notify_task_start();
    debug!(host = %peer.host, "reader starting");

    let buf_size = net.tunables.buf_size.load(Ordering::Relaxed) as usize;
    let mut stream = BufReader::with_capacity(buf_size, CountingReader { inner: read_half, peer: peer.clone() });
    let mut scratch = vec![0u8; buf_size];

    if let Some(qstat) = peer.qstat.lock().expect("peer qstat poisoned").clone() {
        qstat.on_reader_attach();
    }

    'conn: while !peer.is_decom() && !peer.is_closed() && !net.is_exiting() {
        let envelope = match gated(Envelope::read(&mut stream), &mut closed_rx).await {
            None => break,
            Some(Err(e)) => {
                if peer.enter_distress() == 0 {
                    warn!(host = %peer.host, "entering distress mode: {}", e);
                }
                break;
            }
            Some(Ok(envelope)) => envelope,
        };

        let cycles = peer.leave_distress();
        if cycles > 0 {
            info!(host = %peer.host, cycles, "leaving distress mode");
        }

        // any inbound data counts as liveness, not just heartbeats
        peer.last_rx.touch();

        let wire_type = match WireType::try_from(envelope.wire_type) {
            Ok(t) => t,
            Err(_) => {
                warn!(host = %peer.host, wire_type = envelope.wire_type, "unknown frame type, dropping connection");
                break;
            }
        };

        match wire_type {
            WireType::Heartbeat => {
                // nothing beyond the timestamp touch above
            }

            WireType::Hello | WireType::HelloReply => {
                let payload = match gated(HelloPayload::read(&mut stream), &mut closed_rx).await {
                    None => break,
                    Some(Err(e)) => {
                        warn!(host = %peer.host, "bad hello payload: {}", e);
                        break;
                    }
                    Some(Ok(payload)) => payload,
                };
                hello::process_hello(&net, &peer, payload, wire_type == WireType::HelloReply).await;
            }

            WireType::Decom => {
                // legacy decommission-by-number; consume and ignore
                let mut node = [0u8; 4];
                match gated(async { Ok(stream.read_exact(&mut node).await?) }, &mut closed_rx).await {
                    None | Some(Err(_)) => break,
                    Some(Ok(_)) => {
                        warn!(host = %peer.host, "ignoring legacy numeric decom");
                    }
                }
            }

            WireType::DecomName => {
                let msg = match gated(DecomNameMsg::read(&mut stream), &mut closed_rx).await {
                    None => break,
                    Some(Err(e)) => {
                        warn!(host = %peer.host, "bad decom payload: {}", e);
                        break;
                    }
                    Some(Ok(msg)) => msg,
                };
                info!(host = %peer.host, decom = %msg.host, "peer decommission received");
                net.decom_peer(&msg.host, true);
            }

            WireType::UserMsg => {
                if !dispatch_user_msg(&net, &peer, &mut stream, &mut scratch, &mut closed_rx).await {
                    break 'conn;
                }
            }

            WireType::Ack => {
                let msg = match gated(AckMsg::read(&mut stream), &mut closed_rx).await {
                    None => break,
                    Some(Err(_)) => break,
                    Some(Ok(msg)) => msg,
                };
                peer.acks.complete(msg.seqnum, AckResult { outrc: msg.outrc, payload: None });
            }

            WireType::AckPayload => {
                let msg = match gated(AckPayloadMsg::read(&mut stream), &mut closed_rx).await {
                    None => break,
                    Some(Err(e)) => {
                        warn!(host = %peer.host, "bad ack payload: {}", e);
                        break;
                    }
                    Some(Ok(msg)) => msg,
                };
                peer.acks.complete(msg.seqnum, AckResult { outrc: msg.outrc, payload: Some(msg.payload) });
            }
        }
    }

    debug!(host = %peer.host, "reader exiting");
    let (newly_closed, _) = peer.worker_exited(Worker::Reader);
    if newly_closed {
        net.fire_host_down(&peer.host);
    }
    net.hooks.notify_task_stop();
}

/// Reads and dispatches one user message. Returns false when the connection should drop.
async fn dispatch_user_msg(
    net: &Arc<Net>,
    peer: &Arc<Peer>,
    stream: &mut BufReader<CountingReader>,
    scratch: &mut Vec<u8>,
    closed_rx: &mut watch::Receiver<bool>,
) -> bool {
    let header = match gated(UserMsgHeader::read(stream), closed_rx).await {
        None => return false,
        Some(Err(e)) => {
            warn!(host = %peer.host, "bad user message header: {}", e);
            return false;
        }
        Some(Ok(header)) => header,
    };

    // reuse the scratch buffer when the body fits, allocate otherwise
    let mut big_body;
    let body: &mut [u8] = if header.datalen <= scratch.len() {
        &mut scratch[..header.datalen]
    } else {
        big_body = vec![0u8; header.datalen];
        &mut big_body[..]
    };
    match gated(async { Ok(stream.read_exact(body).await?) }, closed_rx).await {
        None | Some(Err(_)) => return false,
        Some(Ok(_)) => {}
    }

    if net.is_exiting() {
        return true;
    }

    let Some(registered) = net.handlers.get(header.usertype) else {
        debug!(host = %peer.host, usertype = header.usertype, "no handler for user type, dropping message");
        return true;
    };

    let ack = if header.waitforack {
        Some(AckHandle::new(net.clone(), peer.host.clone(), header.seqnum))
    } else {
        None
    };

    let from: HostName = peer.host.clone();
    peer.set_running_user_func(true);
    let start = Instant::now();

    registered.func.handle(ReceivedMessage {
        from,
        usertype: header.usertype,
        data: body,
        ack,
    }).await;

    registered.stats.calls.fetch_add(1, Ordering::Relaxed);
    registered.stats.total_us.fetch_add(start.elapsed().as_micros() as u64, Ordering::Relaxed);
    peer.last_rx.touch();
    peer.set_running_user_func(false);

    true
}
