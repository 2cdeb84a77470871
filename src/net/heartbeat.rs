//! Heartbeat emission and the liveness check.
//!
//! The send task queues a heartbeat to every peer on a fixed period. Heartbeat frames jump
//!  the queue, collapse against a heartbeat already at the head, flush immediately and bypass
//!  backpressure, so even a peer drowning in bulk traffic keeps proving the link alive.
//!
//! The check task is the other half: any socket that has produced no inbound data for the
//!  check interval is shut down (and its subnet marked bad), letting the dial loop reconnect,
//!  on another subnet if one is available. It also re-asserts the name-service registration
//!  and sweeps the appsock watchlist while it is at it.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

use crate::net::net::Net;
use crate::net::queue::{make_frame, WriteFlags};
use crate::net::wire::{envelope_wire_len, WireType};

pub(crate) async fn run_heartbeat_send(net: Arc<Net>) {
    net.hooks.notify_task_start();
    info!(period_secs = net.tunables.heartbeat_send_secs.load(Ordering::Relaxed), "heartbeat send task starting");

    while !net.is_exiting() {
        for peer in net.peers.snapshot() {
            if &peer.host == net.hostname() {
                continue;
            }
            let frame = make_frame(
                WireType::Heartbeat,
                WriteFlags::heartbeat(),
                Bytes::new(),
                envelope_wire_len(net.hostname().as_str(), peer.host.as_str()),
            );
            if let Err(e) = peer.enqueue_frame(frame, &net.tunables, None) {
                debug!(host = %peer.host, "heartbeat enqueue failed: {}", e);
            }
        }

        tokio::select! {
            _ = sleep(net.tunables.heartbeat_send_time()) => {}
            _ = net.exit_notified() => {}
        }
    }

    info!("heartbeat send task exiting");
    net.hooks.notify_task_stop();
}

pub(crate) async fn run_heartbeat_check(net: Arc<Net>) {
    net.hooks.notify_task_start();
    info!(check_secs = net.tunables.heartbeat_check_secs.load(Ordering::Relaxed), "heartbeat check task starting");

    let mut last_register = Instant::now();

    while !net.is_exiting() {
        reassert_registration(&net, &mut last_register).await;

        let check_time = net.tunables.heartbeat_check_secs.load(Ordering::Relaxed) as i64;
        for peer in net.peers.snapshot() {
            if &peer.host == net.hostname() || !peer.has_conn() {
                continue;
            }
            // a handler in flight owns the reader, so silence is expected then
            if peer.is_running_user_func() {
                continue;
            }

            let age = peer.last_rx.age_secs();
            if age > check_time {
                warn!(host = %peer.host, age_secs = age, "no data from peer, killing session");
                if let Some(subnet) = peer.last_used_subnet() {
                    net.subnets.mark_bad(&subnet);
                }
                net.close_peer(&peer);
            }
        }

        net.watchlist.sweep();

        tokio::select! {
            _ = sleep(Duration::from_secs(1)) => {}
            _ = net.exit_notified() => {}
        }
    }

    info!("heartbeat check task exiting");
    net.hooks.notify_task_stop();
}

/// Periodically re-registers with the name service. A registration coming back with a
///  different port is unrecoverable: the mesh is already using the old one everywhere.
async fn reassert_registration(net: &Arc<Net>, last_register: &mut Instant) {
    let interval_secs = net.tunables.portmux_register_secs.load(Ordering::Relaxed) as u64;
    if interval_secs == 0 || last_register.elapsed() < Duration::from_secs(interval_secs) {
        return;
    }
    let Some(name_service) = net.hooks.name_service() else {
        return;
    };

    *last_register = Instant::now();
    let (app, service, instance) = net.service_triple();
    match name_service.register(app, service, instance, net.my_port()).await {
        Ok(port) if port > 0 && port != net.my_port() => {
            error!(
                my_port = net.my_port(), registered_port = port,
                "name service re-registration returned a different port; cannot continue"
            );
            std::process::abort();
        }
        Ok(_) => {}
        Err(e) => {
            warn!("name service re-registration failed: {}", e);
        }
    }
}
