//! Seed registration and membership union.
//!
//! For each seed (shuffled): connect, send `REGISTER_REQUEST`, read exactly
//! one `REGISTER_RESPONSE` synchronously, and only then hand the socket to a
//! background listener. The union of all returned peer lists, keyed by
//! endpoint with the maximum degree seen, feeds neighbour selection.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

use crate::network::message::{Message, PeerEntry, RegisterStatus};
use crate::network::transport::{self, MessageStream};
use crate::network::Endpoint;
use crate::peer::PeerState;

#[derive(Debug, Error)]
pub enum BootstrapError {
    #[error("could not register with any seed")]
    NoSeedAccepted,
}

pub(crate) async fn register_with_seeds(
    state: &Arc<PeerState>,
) -> Result<Vec<PeerEntry>, BootstrapError> {
    let connect_timeout = Duration::from_secs(state.config.dial.connect_timeout_sec);
    let mut registered = 0usize;
    let mut collected: Vec<Vec<PeerEntry>> = Vec::new();

    for seed in super::shuffled_seeds(state) {
        let Some(stream) =
            transport::connect_with_retries(&seed, state.config.dial.seed_attempts, connect_timeout)
                .await
        else {
            log::warn!("Cannot reach seed {seed}");
            continue;
        };

        log::info!("Registering with seed {seed}");
        let (mut messages, conn) = transport::split(stream);
        if !conn.send(Message::RegisterRequest {
            ip: state.endpoint.ip.clone(),
            port: state.endpoint.port,
        }) {
            continue;
        }

        // Exactly one synchronous response before anything else reads this
        // socket.
        let peer_list = match messages.next().await {
            Some(Message::RegisterResponse {
                status: RegisterStatus::Ok,
                peer_list,
            }) => peer_list.unwrap_or_default(),
            other => {
                log::warn!("Registration rejected/failed at {seed}: {other:?}");
                continue;
            }
        };

        log::info!("Registered with seed {seed}");
        log::info!("Peer list from {seed}: {peer_list:?}");
        collected.push(peer_list);
        registered += 1;

        state.seed_channels.lock().insert(seed.clone(), conn);
        tokio::spawn(listen_seed(state.clone(), messages, seed));
    }

    log::info!(
        "Registered with {registered}/{} required seeds",
        state.seed_quorum
    );
    if registered == 0 {
        return Err(BootstrapError::NoSeedAccepted);
    }
    Ok(merge_peer_lists(&state.endpoint, collected))
}

/// Union keyed by endpoint, keeping the maximum degree seen across seeds and
/// dropping the node's own endpoint.
fn merge_peer_lists(own: &Endpoint, lists: Vec<Vec<PeerEntry>>) -> Vec<PeerEntry> {
    let mut union: HashMap<Endpoint, u32> = HashMap::new();
    for entry in lists.into_iter().flatten() {
        let key = entry.endpoint();
        if key == *own {
            continue;
        }
        let degree = union.entry(key).or_insert(0);
        *degree = (*degree).max(entry.degree);
    }
    union
        .into_iter()
        .map(|(endpoint, degree)| PeerEntry {
            ip: endpoint.ip,
            port: endpoint.port,
            degree,
        })
        .collect()
}

/// Background reader for a seed socket after registration completed.
async fn listen_seed(
    state: Arc<PeerState>,
    mut messages: MessageStream<tokio::net::tcp::OwnedReadHalf>,
    seed: Endpoint,
) {
    while let Some(msg) = messages.next().await {
        if let Message::DeadConfirmed { dead_ip, dead_port } = msg {
            super::on_dead_confirmed(&state, Endpoint::new(dead_ip, dead_port));
        }
        // Other seed-to-peer pushes would be handled here.
    }
    log::info!("Seed {seed} connection closed");
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(port: u16, degree: u32) -> PeerEntry {
        PeerEntry {
            ip: "127.0.0.1".to_string(),
            port,
            degree,
        }
    }

    #[test]
    fn union_keeps_maximum_degree() {
        let own = Endpoint::new("127.0.0.1", 6001);
        let merged = merge_peer_lists(
            &own,
            vec![
                vec![entry(6002, 1), entry(6003, 0)],
                vec![entry(6002, 4), entry(6004, 2)],
            ],
        );
        let mut degrees: Vec<(u16, u32)> =
            merged.iter().map(|e| (e.port, e.degree)).collect();
        degrees.sort_unstable();
        assert_eq!(degrees, vec![(6002, 4), (6003, 0), (6004, 2)]);
    }

    #[test]
    fn union_drops_own_endpoint() {
        let own = Endpoint::new("127.0.0.1", 6001);
        let merged = merge_peer_lists(&own, vec![vec![entry(6001, 3), entry(6002, 1)]]);
        assert_eq!(merged.len(), 1);
        assert_eq!(merged[0].port, 6002);
    }
}
