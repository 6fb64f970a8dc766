//! Seed-to-seed mesh formation.
//!
//! For every unordered pair of seeds exactly one socket exists: the
//! higher-port side dials and the lower-port side accepts. The port parity
//! rule makes dial races rare; if one happens anyway, last-store-wins in
//! `seed_channels` keeps the map at one socket per peer.

use std::sync::Arc;
use std::time::Duration;

use crate::network::message::Message;
use crate::network::transport;
use crate::network::Endpoint;
use crate::seed::SeedState;

pub(crate) fn spawn_dialers(state: Arc<SeedState>) {
    tokio::spawn(async move {
        // Give the other seeds a moment to bind their listeners.
        tokio::time::sleep(Duration::from_secs(state.config.dial.mesh_grace_sec)).await;
        for seed in state.all_seeds.clone() {
            if seed.port > state.endpoint.port {
                tokio::spawn(dial_seed(state.clone(), seed));
            }
        }
    });
}

/// Connect to one higher-port seed, identify ourselves, read until the
/// connection drops, then retry with linear backoff.
async fn dial_seed(state: Arc<SeedState>, seed: Endpoint) {
    let seed_id = seed.to_string();
    let connect_timeout = Duration::from_secs(state.config.dial.connect_timeout_sec);

    for attempt in 0..state.config.dial.mesh_attempts {
        if let Ok(stream) = transport::connect(&seed, connect_timeout).await {
            let (mut messages, conn) = transport::split(stream);
            conn.send(Message::SeedHello {
                seed_id: state.id.clone(),
            });
            state
                .seed_channels
                .lock()
                .insert(seed_id.clone(), conn.clone());
            log::info!("Dialled seed {seed}");

            // Proposals and votes sent back to us arrive on this socket.
            let mut registered_peer: Option<Endpoint> = None;
            while let Some(msg) = messages.next().await {
                super::route_message(&state, msg, &conn, &mut registered_peer);
            }

            let mut channels = state.seed_channels.lock();
            if channels.get(&seed_id).map_or(false, |c| c.id() == conn.id()) {
                channels.remove(&seed_id);
            }
            drop(channels);
            log::info!("Lost connection to seed {seed}, will retry");
        }
        tokio::time::sleep(Duration::from_secs(3 + u64::from(attempt))).await;
    }
}
