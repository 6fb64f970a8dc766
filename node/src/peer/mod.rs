//! Peer node: registers through the seeds, attaches to neighbours with
//! power-law preferential attachment, floods gossip and takes part in
//! two-level failure detection.
//!
//! Startup is strictly serial until every seed socket has delivered its
//! registration response; only then do background readers, the overlay and
//! the periodic loops start. This removes read races on the seed sockets.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use rand::seq::SliceRandom;
use tokio::net::{TcpListener, TcpStream};

use crate::config::{ProtocolConfig, SeedList};
use crate::network::message::Message;
use crate::network::transport::{self, Connection};
use crate::network::Endpoint;
use crate::peer::suspicion::SuspicionEntry;

mod bootstrap;
mod gossip;
mod liveness;
mod suspicion;
mod topology;

pub(crate) struct PeerState {
    pub(crate) endpoint: Endpoint,
    pub(crate) id: String,
    pub(crate) all_seeds: Vec<Endpoint>,
    /// Computed over the seed count and logged; registration aborts only when
    /// no seed accepts at all.
    pub(crate) seed_quorum: usize,
    pub(crate) config: ProtocolConfig,

    /// Hashes of every gossip message seen. Grows monotonically for the
    /// lifetime of the process.
    pub(crate) message_log: Mutex<HashSet<String>>,
    pub(crate) neighbours: Mutex<HashMap<Endpoint, Connection>>,
    /// Registration sockets, kept open for asynchronous `DEAD_CONFIRMED`.
    pub(crate) seed_channels: Mutex<HashMap<Endpoint, Connection>>,
    pub(crate) missed_pings: Mutex<HashMap<Endpoint, u32>>,
    /// Neighbours that answered in the current ping round.
    pub(crate) pong_received: Mutex<HashSet<Endpoint>>,
    pub(crate) suspected: Mutex<HashMap<Endpoint, SuspicionEntry>>,
    pub(crate) gossip_count: Mutex<u32>,
}

pub struct PeerNode {
    state: Arc<PeerState>,
}

impl PeerNode {
    pub fn new(endpoint: Endpoint, seeds: SeedList, config: ProtocolConfig) -> PeerNode {
        let seed_quorum = seeds.len() / 2 + 1;
        log::info!("Initialized  quorum={}/{}", seed_quorum, seeds.len());
        let id = endpoint.to_string();
        PeerNode {
            state: Arc::new(PeerState {
                endpoint,
                id,
                all_seeds: seeds.seeds,
                seed_quorum,
                config,
                message_log: Mutex::new(HashSet::new()),
                neighbours: Mutex::new(HashMap::new()),
                seed_channels: Mutex::new(HashMap::new()),
                missed_pings: Mutex::new(HashMap::new()),
                pong_received: Mutex::new(HashSet::new()),
                suspected: Mutex::new(HashMap::new()),
                gossip_count: Mutex::new(0),
            }),
        }
    }

    pub async fn run(self) -> anyhow::Result<()> {
        let listener = TcpListener::bind(self.state.endpoint.addr()).await?;
        log::info!("Listening on {}", self.state.endpoint);
        tokio::spawn(accept_loop(self.state.clone(), listener));

        let union = match bootstrap::register_with_seeds(&self.state).await {
            Ok(union) => union,
            Err(err) => {
                log::error!("FATAL: could not register with any seed. Exiting.");
                return Err(err.into());
            }
        };
        log::info!("Union peer list has {} entries: {:?}", union.len(), union);

        let neighbours =
            topology::select_neighbours(&mut rand::thread_rng(), &union, &self.state.endpoint);
        log::info!(
            "Selected neighbours (power-law): {:?}",
            neighbours.iter().map(Endpoint::to_string).collect::<Vec<_>>()
        );
        for neighbour in neighbours {
            tokio::spawn(connect_neighbour(self.state.clone(), neighbour));
        }

        // Allow inbound connections from neighbours too.
        tokio::time::sleep(Duration::from_secs(self.state.config.dial.stabilise_sec)).await;

        gossip::spawn_gossip_loop(self.state.clone());
        liveness::spawn_liveness_loop(self.state.clone());

        tokio::signal::ctrl_c().await?;
        log::info!("Shutting down.");
        Ok(())
    }
}

/// Shuffled copy of the configured seed endpoints.
pub(crate) fn shuffled_seeds(state: &PeerState) -> Vec<Endpoint> {
    let mut candidates = state.all_seeds.clone();
    candidates.shuffle(&mut rand::thread_rng());
    candidates
}

async fn accept_loop(state: Arc<PeerState>, listener: TcpListener) {
    loop {
        match listener.accept().await {
            Ok((stream, _)) => {
                tokio::spawn(handle_inbound(state.clone(), stream));
            }
            Err(err) => log::warn!("Accept failed: {err}"),
        }
    }
}

/// Reader loop for one inbound connection. The first message must be `HELLO`
/// and supplies the remote endpoint.
async fn handle_inbound(state: Arc<PeerState>, stream: TcpStream) {
    let (mut messages, conn) = transport::split(stream);
    let mut peer_key: Option<Endpoint> = None;

    while let Some(msg) = messages.next().await {
        match msg {
            Message::Hello { ip, port } => {
                let key = Endpoint::new(ip, port);
                state.neighbours.lock().insert(key.clone(), conn.clone());
                state.missed_pings.lock().insert(key.clone(), 0);
                log::info!("Inbound HELLO from {key}");
                peer_key = Some(key);
            }
            Message::Pong { .. } => {
                if let Some(key) = &peer_key {
                    state.missed_pings.lock().insert(key.clone(), 0);
                    state.pong_received.lock().insert(key.clone());
                }
            }
            other => handle_overlay_message(&state, other, &conn).await,
        }
    }

    // A dropped socket bypasses the miss counter entirely.
    if let Some(key) = peer_key {
        log::info!("Lost inbound connection from {key}");
        remove_neighbour_if(&state, &key, conn.id());
        suspicion::start_suspicion(&state, &key);
    }
}

/// Dial one chosen neighbour, say `HELLO` and read from it until it drops.
async fn connect_neighbour(state: Arc<PeerState>, neighbour: Endpoint) {
    let connect_timeout = Duration::from_secs(state.config.dial.connect_timeout_sec);
    let Some(stream) = transport::connect_with_retries(
        &neighbour,
        state.config.dial.neighbour_attempts,
        connect_timeout,
    )
    .await
    else {
        log::info!("Could not connect to neighbour {neighbour}");
        return;
    };

    let (mut messages, conn) = transport::split(stream);
    conn.send(Message::Hello {
        ip: state.endpoint.ip.clone(),
        port: state.endpoint.port,
    });
    state
        .neighbours
        .lock()
        .insert(neighbour.clone(), conn.clone());
    state.missed_pings.lock().insert(neighbour.clone(), 0);
    log::info!("Connected to neighbour {neighbour}");

    while let Some(msg) = messages.next().await {
        match msg {
            Message::Pong { .. } => {
                state.missed_pings.lock().insert(neighbour.clone(), 0);
                state.pong_received.lock().insert(neighbour.clone());
            }
            other => handle_overlay_message(&state, other, &conn).await,
        }
    }

    log::info!("Lost connection to neighbour {neighbour}");
    remove_neighbour_if(&state, &neighbour, conn.id());
    suspicion::start_suspicion(&state, &neighbour);
}

/// Traffic common to inbound and outbound neighbour sockets. Unknown types
/// are ignored.
async fn handle_overlay_message(state: &Arc<PeerState>, msg: Message, conn: &Connection) {
    match msg {
        Message::Gossip {
            content,
            hash,
            origin_ip,
            origin_port,
            ..
        } => {
            gossip::on_gossip(state, content, hash, origin_ip, origin_port, conn.id());
        }
        Message::Ping { .. } => {
            conn.send(Message::Pong {
                from_ip: state.endpoint.ip.clone(),
                from_port: state.endpoint.port,
            });
        }
        Message::SuspectRequest {
            suspect_ip,
            suspect_port,
            ..
        } => {
            suspicion::on_suspect_request(state, Endpoint::new(suspect_ip, suspect_port), conn)
                .await;
        }
        Message::SuspectResponse {
            suspect_ip,
            suspect_port,
            alive,
            responder_ip,
            responder_port,
        } => {
            suspicion::on_suspect_response(
                state,
                Endpoint::new(suspect_ip, suspect_port),
                alive,
                format!("{responder_ip}:{responder_port}"),
            );
        }
        Message::DeadConfirmed { dead_ip, dead_port } => {
            on_dead_confirmed(state, Endpoint::new(dead_ip, dead_port));
        }
        _ => {}
    }
}

/// Drop the stored neighbour entry, unless a reconnect already replaced it.
fn remove_neighbour_if(state: &Arc<PeerState>, key: &Endpoint, conn_id: u64) {
    let mut neighbours = state.neighbours.lock();
    if neighbours.get(key).map_or(false, |c| c.id() == conn_id) {
        neighbours.remove(key);
    }
}

/// The authoritative eviction signal, arriving on a seed or neighbour socket.
pub(crate) fn on_dead_confirmed(state: &Arc<PeerState>, dead: Endpoint) {
    log::info!("DEAD_CONFIRMED for {dead}, removing from neighbours");
    // Dropping the handle ends the writer task and releases the socket.
    state.neighbours.lock().remove(&dead);
    state.suspected.lock().remove(&dead);
    state.missed_pings.lock().remove(&dead);
}

#[cfg(test)]
pub(crate) fn test_state(config: ProtocolConfig) -> Arc<PeerState> {
    let seeds: Vec<Endpoint> = (0..3)
        .map(|i| Endpoint::new("127.0.0.1", 5001 + i as u16))
        .collect();
    let endpoint = Endpoint::new("127.0.0.1", 6001);
    Arc::new(PeerState {
        id: endpoint.to_string(),
        endpoint,
        seed_quorum: seeds.len() / 2 + 1,
        all_seeds: seeds,
        config,
        message_log: Mutex::new(HashSet::new()),
        neighbours: Mutex::new(HashMap::new()),
        seed_channels: Mutex::new(HashMap::new()),
        missed_pings: Mutex::new(HashMap::new()),
        pong_received: Mutex::new(HashSet::new()),
        suspected: Mutex::new(HashMap::new()),
        gossip_count: Mutex::new(0),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn dead_confirmed_evicts_every_trace() {
        let state = test_state(ProtocolConfig::default());
        let dead = Endpoint::new("127.0.0.1", 6004);
        let (conn, _rx) = Connection::test_pair();
        state.neighbours.lock().insert(dead.clone(), conn);
        state.missed_pings.lock().insert(dead.clone(), 2);
        state
            .suspected
            .lock()
            .insert(dead.clone(), SuspicionEntry::seeded(&state.id));

        on_dead_confirmed(&state, dead.clone());

        assert!(!state.neighbours.lock().contains_key(&dead));
        assert!(!state.suspected.lock().contains_key(&dead));
        assert!(!state.missed_pings.lock().contains_key(&dead));
    }

    #[tokio::test]
    async fn stale_connection_does_not_evict_replacement() {
        let state = test_state(ProtocolConfig::default());
        let key = Endpoint::new("127.0.0.1", 6002);
        let (old_conn, _old_rx) = Connection::test_pair();
        let (new_conn, _new_rx) = Connection::test_pair();
        let old_id = old_conn.id();
        state.neighbours.lock().insert(key.clone(), new_conn);
        drop(old_conn);

        remove_neighbour_if(&state, &key, old_id);
        assert!(state.neighbours.lock().contains_key(&key));
    }
}
