//! The gossip ("hello") protocol.
//!
//! Both sides of a fresh connection send a hello carrying their complete known peer list. A
//!  receiver only ever *adds* peers - removal goes through decommissioning - and kicks off
//!  connect tasks for newly learned ones, so any weakly connected seed graph converges to a
//!  full mesh. Receiving a hello also opens the sender's hello gate: user messages to that
//!  peer are permitted from then on.

use std::sync::Arc;

use bytes::BytesMut;
use tracing::{debug, info};

use crate::net::error::SendError;
use crate::net::net::Net;
use crate::net::peer::Peer;
use crate::net::queue::{make_frame, WriteFlags};
use crate::net::wire::{envelope_wire_len, HelloHost, HelloPayload, WireType};

/// the sender's view of the mesh: every known peer, self included
pub(crate) fn build_payload(net: &Net) -> HelloPayload {
    let hosts = net.peers.snapshot()
        .iter()
        .map(|peer| HelloHost {
            name: peer.host.to_string(),
            port: if &peer.host == net.hostname() { net.my_port() } else { peer.port() },
        })
        .collect();
    HelloPayload { hosts }
}

pub(crate) fn enqueue_hello(net: &Net, peer: &Peer, reply: bool) -> Result<(), SendError> {
    let payload = build_payload(net);
    let mut body = BytesMut::new();
    payload.encode(&mut body);

    let wire_type = if reply { WireType::HelloReply } else { WireType::Hello };
    let frame = make_frame(
        wire_type,
        WriteFlags::nodelay(),
        body.freeze(),
        envelope_wire_len(net.hostname().as_str(), peer.host.as_str()),
    );
    peer.enqueue_frame(frame, &net.tunables, None)
}

/// Folds a received peer list into the table and opens the sender's hello gate. Replies with
///  our own list unless this already is the reply leg.
pub(crate) async fn process_hello(net: &Arc<Net>, peer: &Arc<Peer>, payload: HelloPayload, is_reply: bool) {
    debug!(from = %peer.host, hosts = payload.hosts.len(), is_reply, "processing hello");

    for entry in &payload.hosts {
        if entry.name.is_empty() {
            continue;
        }
        if let Some(new_peer) = net.insert_peer(&entry.name, entry.port) {
            info!(host = %new_peer.host, port = entry.port, "learned new peer via hello from {}", peer.host);
            net.ensure_connect_task(&new_peer);
        }
    }

    peer.set_got_hello();

    if let Some(hook) = net.hooks.hello() {
        hook.on_hello(&peer.host);
    }

    if !is_reply {
        if let Err(e) = enqueue_hello(net, peer, true) {
            debug!(to = %peer.host, "could not queue hello reply: {}", e);
        }
    }
}
