//! Liveness rounds: TCP PING/PONG plus a system ICMP probe.
//!
//! Both a failed send and a missing PONG count as a miss; the counter resets
//! on any PONG. Reaching the threshold hands the neighbour to the suspicion
//! engine.

use std::collections::HashSet;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use tokio::process::Command;

use crate::network::message::Message;
use crate::network::transport::Connection;
use crate::network::Endpoint;
use crate::peer::{suspicion, PeerState};

pub(crate) fn spawn_liveness_loop(state: Arc<PeerState>) {
    tokio::spawn(async move {
        // Let gossip start first.
        tokio::time::sleep(Duration::from_secs(state.config.liveness.startup_delay_sec)).await;
        let half_round = Duration::from_secs(state.config.liveness.ping_interval_sec / 2);

        loop {
            state.pong_received.lock().clear();

            let targets: Vec<(Endpoint, Connection)> = state
                .neighbours
                .lock()
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect();

            for (peer, conn) in &targets {
                let sent = conn.send(Message::Ping {
                    from_ip: state.endpoint.ip.clone(),
                    from_port: state.endpoint.port,
                });
                if !sent {
                    miss(&state, peer);
                }
                // Independent system-level probe.
                if !icmp_probe(&peer.ip).await {
                    miss(&state, peer);
                }
            }

            // Wait for PONGs.
            tokio::time::sleep(half_round).await;

            let still_present: Vec<Endpoint> =
                state.neighbours.lock().keys().cloned().collect();
            let ponged: HashSet<Endpoint> = state.pong_received.lock().clone();

            for peer in still_present {
                if ponged.contains(&peer) {
                    state.missed_pings.lock().insert(peer, 0);
                } else {
                    miss(&state, &peer);
                }
            }

            tokio::time::sleep(half_round).await;
        }
    });
}

/// One ICMP echo with a one second deadline, via the system ping binary.
pub(crate) async fn icmp_probe(host: &str) -> bool {
    let mut command = Command::new("ping");
    #[cfg(target_os = "windows")]
    command.args(["-n", "1", "-w", "1000", host]);
    #[cfg(not(target_os = "windows"))]
    command.args(["-c", "1", "-W", "1", host]);
    command.stdout(Stdio::null()).stderr(Stdio::null());

    match tokio::time::timeout(Duration::from_secs(3), command.status()).await {
        Ok(Ok(status)) => status.success(),
        _ => false,
    }
}

/// Count one miss; at the threshold the neighbour becomes a suspect.
pub(crate) fn miss(state: &Arc<PeerState>, peer: &Endpoint) {
    let count = {
        let mut missed = state.missed_pings.lock();
        let counter = missed.entry(peer.clone()).or_insert(0);
        *counter += 1;
        *counter
    };
    if count >= state.config.liveness.miss_threshold {
        suspicion::start_suspicion(state, peer);
    }
}
