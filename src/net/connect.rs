//! The per-peer dial loop.
//!
//! One connect task per peer, alive for as long as the peer exists. While the peer has a
//!  socket it idles as a keep-alive; otherwise it dials with a random jitter (so a rebooting
//!  cluster does not stampede one node), rotating through the configured subnets and asking
//!  the name service for the port when none is pinned.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail};
use bytes::BytesMut;
use rand::Rng;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpSocket, TcpStream};
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::net::hooks::TlsPolicy;
use crate::net::net::Net;
use crate::net::peer::Peer;
use crate::net::subnet::SubnetChoice;
use crate::net::wire::ConnectMsg;

pub(crate) async fn run_connect(net: Arc<Net>, peer: Arc<Peer>) {
    net.hooks.notify_task_start();
    debug!(host = %peer.host, "connect task starting");

    while !peer.is_decom() && !net.is_exiting() {
        if peer.has_conn() {
            // keep-alive role: just re-check periodically
            sleep(Duration::from_secs(1)).await;
            continue;
        }

        // spread out reconnect storms
        let jitter_max = net.tunables.dial_jitter_max_ms.load(std::sync::atomic::Ordering::Relaxed) as u64;
        if jitter_max > 0 {
            let jitter_ms = rand::thread_rng().gen_range(0..=jitter_max);
            sleep(Duration::from_millis(jitter_ms)).await;
        }
        if peer.is_decom() || net.is_exiting() || peer.has_conn() {
            continue;
        }
        if !peer.is_really_closed() {
            // previous generation's workers are still letting go of the socket
            sleep(Duration::from_millis(100)).await;
            continue;
        }

        peer.set_dialing(true);
        let attempt = dial_once(&net, &peer).await;
        peer.set_dialing(false);

        match attempt {
            Ok(()) => {
                info!(host = %peer.host, port = peer.port(), "connection established");
            }
            Err(e) => {
                debug!(host = %peer.host, "dial failed: {}", e);
                sleep(Duration::from_secs(1)).await;
            }
        }
    }

    debug!(host = %peer.host, "connect task exiting");
    peer.have_connect_task.store(false, std::sync::atomic::Ordering::SeqCst);
    net.hooks.notify_task_stop();
}

async fn dial_once(net: &Arc<Net>, peer: &Arc<Peer>) -> anyhow::Result<()> {
    let (dial_name, subnet) = match net.subnets.pick(net.tunables.subnet_blackout()) {
        SubnetChoice::NoneConfigured => (peer.host.to_string(), None),
        SubnetChoice::Unavailable => bail!("all subnets disabled or blacked out"),
        SubnetChoice::Use(suffix) if suffix.is_empty() => (peer.host.to_string(), None),
        SubnetChoice::Use(suffix) => (format!("{}{}", peer.host, suffix), Some(suffix)),
    };

    let ip = net.hooks.resolver().lookup(&dial_name).await?;

    // always re-resolve an unpinned port: it may have moved since the last connect
    let port = match peer.port() {
        0 => resolve_port(net, &dial_name).await?,
        port => port,
    };

    let stream = connect_with_timeout(net, SocketAddr::new(ip, port)).await?;
    stream.set_nodelay(true)?;

    // the connect message goes out before the connection is published, so a heartbeat can
    // never beat it onto the wire
    let tls = net.tls_policy() == TlsPolicy::Require;
    let msg = ConnectMsg {
        to_host: peer.host.to_string(),
        to_port: port,
        to_net_index: net.net_index(),
        tls,
        from_host: net.hostname().to_string(),
        from_port: net.my_port(),
        from_net_index: net.net_index(),
    };
    let mut buf = BytesMut::new();
    msg.encode(&mut buf);

    let mut stream = stream;
    stream.write_all(&buf).await?;

    let stream = if tls {
        let crypto = net.hooks.crypto()
            .ok_or_else(|| anyhow!("tls required but no crypto hook registered"))?;
        crypto.connect_handshake(stream).await?
    } else {
        stream
    };

    peer.set_port(port);
    if !net.spawn_workers(peer, stream, subnet) {
        bail!("lost dial race, peer already has a connection");
    }

    if let Some(hook) = net.hooks.new_node() {
        hook.on_new_node(&peer.host, port);
    }
    Ok(())
}

async fn resolve_port(net: &Arc<Net>, dial_name: &str) -> anyhow::Result<u16> {
    let Some(name_service) = net.hooks.name_service() else {
        bail!("peer {} has no port and no name service is registered", dial_name);
    };

    // a child mesh resolves under its parent's triple first, then its own
    if let Some(parent) = net.parent() {
        let (app, service, instance) = parent.service_triple();
        if let Ok(port) = name_service.resolve(dial_name, app, service, instance).await {
            if port > 0 {
                return Ok(port);
            }
        }
    }

    let (app, service, instance) = net.service_triple();
    let port = name_service.resolve(dial_name, app, service, instance).await?;
    if port == 0 {
        bail!("name service returned no port for {} ({}/{}/{})", dial_name, app, service, instance);
    }
    Ok(port)
}

async fn connect_with_timeout(net: &Arc<Net>, addr: SocketAddr) -> anyhow::Result<TcpStream> {
    let socket = match addr {
        SocketAddr::V4(_) => TcpSocket::new_v4()?,
        SocketAddr::V6(_) => TcpSocket::new_v6()?,
    };
    socket.set_keepalive(true)?;

    match tokio::time::timeout(net.tunables.connect_timeout(), socket.connect(addr)).await {
        Ok(Ok(stream)) => Ok(stream),
        Ok(Err(e)) => Err(e.into()),
        Err(_) => {
            warn!(%addr, "connect timed out");
            Err(anyhow!("connect to {} timed out", addr))
        }
    }
}
