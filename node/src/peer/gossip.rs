//! Gossip origination and flood-forwarding.
//!
//! Every peer originates a bounded number of messages and floods everything
//! it sees for the first time to all neighbours except the arrival socket.
//! The hash set gives at-most-once delivery per message per node.

use std::sync::Arc;
use std::time::Duration;

use crate::network::message::Message;
use crate::peer::PeerState;
use crate::utilities::hash::Hasher;
use crate::utilities::time::WallClock;

pub(crate) fn spawn_gossip_loop(state: Arc<PeerState>) {
    tokio::spawn(async move {
        // Let neighbour connections stabilise.
        tokio::time::sleep(Duration::from_secs(state.config.gossip.warmup_sec)).await;
        let interval = Duration::from_secs(state.config.gossip.interval_sec);
        while let Some(seq) = next_sequence(&state) {
            let content = format!(
                "{:.6}:{}:{}",
                WallClock::unix_now(),
                state.endpoint.ip,
                seq
            );
            let hash = Hasher::sha256_hex(&content);
            log::info!("Generated gossip #{seq}: {content}");
            state.message_log.lock().insert(hash.clone());

            broadcast(
                &state,
                Message::Gossip {
                    content,
                    hash,
                    origin_ip: state.endpoint.ip.clone(),
                    origin_port: state.endpoint.port,
                    sender_ip: None,
                    sender_port: None,
                },
                None,
            );
            tokio::time::sleep(interval).await;
        }
    });
}

/// Claim the next origination slot, or None once the ceiling is reached.
pub(crate) fn next_sequence(state: &Arc<PeerState>) -> Option<u32> {
    let mut count = state.gossip_count.lock();
    if *count >= state.config.gossip.max_messages {
        return None;
    }
    *count += 1;
    Some(*count)
}

/// Returns true when the message was seen for the first time (and forwarded).
pub(crate) fn on_gossip(
    state: &Arc<PeerState>,
    content: String,
    hash: String,
    origin_ip: String,
    origin_port: u16,
    sender: u64,
) -> bool {
    let hash = if hash.is_empty() {
        Hasher::sha256_hex(&content)
    } else {
        hash
    };

    if !state.message_log.lock().insert(hash.clone()) {
        // Duplicate: no forward, no log.
        return false;
    }

    log::info!(
        "GOSSIP (first time): '{content}'  from {origin_ip}:{origin_port}  ts={:.3}",
        WallClock::unix_now()
    );
    broadcast(
        state,
        Message::Gossip {
            content,
            hash,
            origin_ip,
            origin_port,
            sender_ip: Some(state.endpoint.ip.clone()),
            sender_port: Some(state.endpoint.port),
        },
        Some(sender),
    );
    true
}

/// Send to every neighbour, excluding the connection `exclude` if given.
pub(crate) fn broadcast(state: &Arc<PeerState>, msg: Message, exclude: Option<u64>) {
    let targets: Vec<crate::network::transport::Connection> =
        state.neighbours.lock().values().cloned().collect();
    for conn in targets {
        if exclude.map_or(false, |id| id == conn.id()) {
            continue;
        }
        conn.send(msg.clone());
    }
}
