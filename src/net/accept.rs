//! The accept loop: one per mesh (children share the parent's listener).
//!
//! The first byte of a new connection decides what it is. A zero byte is a mesh peer's
//!  connect record; anything else is an application socket that gets wrapped with the
//!  watchlist's idle timers and handed to the registered appsock hook. The admin sentinel
//!  `'@'` is only honored from loopback.

use std::net::SocketAddr;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail};
use tokio::io::AsyncReadExt;
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, error, info, warn};

use crate::net::hooks::{AppSockSession, TlsPolicy};
use crate::net::hostname::HostName;
use crate::net::net::Net;
use crate::net::wire::ConnectMsg;

const ADMIN_SENTINEL: u8 = b'@';

pub(crate) async fn run_accept(net: Arc<Net>, listener: TcpListener) {
    net.hooks.notify_task_start();
    info!(port = net.my_port(), "accept task starting");

    loop {
        let accepted = tokio::select! {
            r = listener.accept() => r,
            _ = net.exit_notified() => break,
        };
        if net.is_exiting() {
            break;
        }

        match accepted {
            Ok((stream, addr)) => {
                net.stats.num_accepts.fetch_add(1, Ordering::Relaxed);
                let net = net.clone();
                tokio::spawn(async move {
                    if let Err(e) = handle_incoming(net, stream, addr).await {
                        debug!(%addr, "inbound connection dropped: {}", e);
                    }
                });
            }
            Err(e) => {
                error!("accept error: {}", e);
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        }
    }

    info!("accept task exiting");
    net.hooks.notify_task_stop();
}

async fn handle_incoming(net: Arc<Net>, mut stream: TcpStream, addr: SocketAddr) -> anyhow::Result<()> {
    stream.set_nodelay(true)?;
    stream.set_linger(None)?;

    // the first byte must arrive within the poll budget or the connection is dropped
    let mut first = [0u8; 1];
    match tokio::time::timeout(net.tunables.netpoll(), stream.peek(&mut first)).await {
        Err(_) => {
            net.stats.num_accept_timeouts.fetch_add(1, Ordering::Relaxed);
            bail!("timeout waiting for first byte");
        }
        Ok(Err(e)) => return Err(e.into()),
        Ok(Ok(0)) => bail!("closed before first byte"),
        Ok(Ok(_)) => {}
    }

    if first[0] != 0 {
        return admit_appsock(net, stream, addr, first[0]).await;
    }

    // mesh connection: consume the tag and read the connect record
    stream.read_exact(&mut first).await?;
    let msg = ConnectMsg::read(&mut stream).await?;

    // high bits of the target port select a child mesh sharing this listener
    let target = match msg.to_net_index {
        0 => net.clone(),
        idx => net.child_by_index(idx)
            .ok_or_else(|| anyhow!("connect for unknown child net {}", idx))?,
    };

    if msg.to_host != target.hostname().as_str() || msg.to_port != target.my_port() {
        bail!(
            "connect message addressed to {}:{}, but this is {}:{}",
            msg.to_host, msg.to_port, target.hostname(), target.my_port()
        );
    }

    let stream = match (msg.tls, target.tls_policy()) {
        (true, TlsPolicy::Disabled) => bail!("peer requested tls but it is disabled here"),
        (true, _) => {
            let crypto = target.hooks.crypto()
                .ok_or_else(|| anyhow!("peer requested tls but no crypto hook registered"))?;
            crypto.accept_handshake(stream).await?
        }
        (false, TlsPolicy::Require) => bail!("tls required but peer did not request it"),
        (false, _) => stream,
    };

    let from = HostName::intern(&msg.from_host);
    if &from == target.hostname() {
        bail!("connect message claims to be from this node");
    }

    if let Some(allow) = target.hooks.allow() {
        if !allow.allow(&from) {
            warn!(host = %from, "rejecting connection from unsanctioned host");
            bail!("host not allowed");
        }
    }

    if let Some(new_peer) = target.insert_peer(from.as_str(), msg.from_port) {
        debug!(host = %new_peer.host, "inbound connect from new peer");
    }
    let peer = target.peers.get(&from).ok_or_else(|| anyhow!("peer vanished during accept"))?;
    if peer.is_decom() {
        bail!("peer {} is decommissioned", from);
    }
    if msg.from_port != 0 {
        peer.set_port(msg.from_port);
    }

    // an old socket for this peer is stale the moment the peer dials anew; shut it down and
    // wait for its workers to let go before installing the new one
    if peer.has_conn() {
        info!(host = %peer.host, "closing stale socket for reconnecting peer");
        target.close_peer(&peer);
        let waited = tokio::time::timeout(Duration::from_secs(5), async {
            while !peer.is_really_closed() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        }).await;
        if waited.is_err() {
            bail!("stale socket for {} did not release in time", peer.host);
        }
    }

    if !target.spawn_workers(&peer, stream, None) {
        bail!("lost accept race, peer already has a connection");
    }
    // the accept path doubles as the connect starter for peers we learn about this way
    target.ensure_connect_task(&peer);

    if let Some(hook) = target.hooks.new_node() {
        hook.on_new_node(&peer.host, peer.port());
    }
    Ok(())
}

async fn admit_appsock(net: Arc<Net>, stream: TcpStream, addr: SocketAddr, first_byte: u8) -> anyhow::Result<()> {
    let admin = first_byte == ADMIN_SENTINEL;
    if admin && !addr.ip().is_loopback() {
        warn!(%addr, "rejecting remote admin socket");
        bail!("admin sockets must originate from loopback");
    }

    let hook = if admin { net.hooks.admin_appsock() } else { net.hooks.appsock() };
    let Some(hook) = hook else {
        debug!(%addr, first_byte, "no appsock handler registered, dropping connection");
        return Ok(());
    };

    let watched = net.watchlist.wrap(stream, 0, 0);
    hook.serve(AppSockSession {
        stream: watched,
        first_byte,
        admin,
        peer_addr: addr,
    }).await;
    Ok(())
}
