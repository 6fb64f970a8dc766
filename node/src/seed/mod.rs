//! Seed node: the trusted directory role.
//!
//! Seeds keep an all-pairs mesh among themselves (one socket per pair, the
//! lower-port side accepts and the higher-port side dials) and run two
//! symmetric one-shot vote protocols over it: peer registration and dead-peer
//! removal. The proposer is whichever seed received the triggering message
//! from a peer; every other seed votes YES unconditionally.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::net::{TcpListener, TcpStream};

use crate::config::{ProtocolConfig, SeedList};
use crate::network::message::{Message, RegisterStatus};
use crate::network::transport::{self, Connection};
use crate::network::Endpoint;
use crate::seed::consensus::{MajorityQuorum, RoundStatus, VoteRound};
use crate::seed::registry::PeerRegistry;
use crate::utilities::id::{request_id, RequestId};

mod consensus;
mod mesh;
mod registry;

/// An in-flight registration: the vote round plus the socket to answer on.
pub(crate) struct RegistrationRound {
    pub(crate) round: VoteRound,
    pub(crate) requester: Connection,
}

pub(crate) struct SeedState {
    pub(crate) endpoint: Endpoint,
    pub(crate) id: String,
    pub(crate) all_seeds: Vec<Endpoint>,
    pub(crate) quorum: MajorityQuorum,
    pub(crate) config: ProtocolConfig,

    pub(crate) registry: Mutex<PeerRegistry>,
    pub(crate) pending_reg: Mutex<HashMap<RequestId, RegistrationRound>>,
    pub(crate) pending_rem: Mutex<HashMap<RequestId, VoteRound>>,
    /// (dead endpoint, reporter) pairs already acted on. One fresh report is
    /// enough to propose; repeats of the same report must not re-propose.
    pub(crate) dead_reports: Mutex<HashMap<Endpoint, HashSet<String>>>,
    /// One socket per peer seed, keyed by seed id.
    pub(crate) seed_channels: Mutex<HashMap<String, Connection>>,
    /// Registration sockets of admitted peers, the delivery path for
    /// asynchronous `DEAD_CONFIRMED` pushes.
    pub(crate) peer_channels: Mutex<HashMap<Endpoint, Connection>>,
}

pub struct SeedNode {
    state: Arc<SeedState>,
}

impl SeedNode {
    pub fn new(endpoint: Endpoint, seeds: SeedList, config: ProtocolConfig) -> SeedNode {
        let quorum = MajorityQuorum::new(seeds.len());
        log::info!(
            "Initialized  n_seeds={}  quorum={}",
            quorum.size(),
            quorum.threshold()
        );
        let id = endpoint.to_string();
        SeedNode {
            state: Arc::new(SeedState {
                endpoint,
                id,
                all_seeds: seeds.seeds,
                quorum,
                config,
                registry: Mutex::new(PeerRegistry::default()),
                pending_reg: Mutex::new(HashMap::new()),
                pending_rem: Mutex::new(HashMap::new()),
                dead_reports: Mutex::new(HashMap::new()),
                seed_channels: Mutex::new(HashMap::new()),
                peer_channels: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub async fn run(self) -> anyhow::Result<()> {
        let listener = TcpListener::bind(self.state.endpoint.addr()).await?;
        log::info!("Listening on {}", self.state.endpoint);

        let state = self.state.clone();
        tokio::spawn(accept_loop(state, listener));

        mesh::spawn_dialers(self.state.clone());

        tokio::signal::ctrl_c().await?;
        log::info!("Shutting down.");
        Ok(())
    }
}

async fn accept_loop(state: Arc<SeedState>, listener: TcpListener) {
    loop {
        match listener.accept().await {
            Ok((stream, _)) => {
                tokio::spawn(handle_connection(state.clone(), stream));
            }
            Err(err) => log::warn!("Accept failed: {err}"),
        }
    }
}

/// Reader loop for one accepted connection (peer or lower-port seed).
async fn handle_connection(state: Arc<SeedState>, stream: TcpStream) {
    let (mut messages, conn) = transport::split(stream);
    let mut peer_seed_id: Option<String> = None;
    let mut registered_peer: Option<Endpoint> = None;

    while let Some(msg) = messages.next().await {
        match msg {
            Message::SeedHello { seed_id } => {
                log::info!("Seed {seed_id} connected (inbound)");
                state
                    .seed_channels
                    .lock()
                    .insert(seed_id.clone(), conn.clone());
                peer_seed_id = Some(seed_id);
            }
            other => route_message(&state, other, &conn, &mut registered_peer),
        }
    }

    if let Some(seed_id) = peer_seed_id {
        let mut channels = state.seed_channels.lock();
        if channels.get(&seed_id).map_or(false, |c| c.id() == conn.id()) {
            channels.remove(&seed_id);
        }
        drop(channels);
        log::info!("Seed {seed_id} disconnected");
    }
    if let Some(peer) = registered_peer {
        let mut channels = state.peer_channels.lock();
        if channels.get(&peer).map_or(false, |c| c.id() == conn.id()) {
            channels.remove(&peer);
        }
    }
}

/// Dispatch one received message. Unknown and peer-overlay types are ignored.
pub(crate) fn route_message(
    state: &Arc<SeedState>,
    msg: Message,
    conn: &Connection,
    registered_peer: &mut Option<Endpoint>,
) {
    match msg {
        Message::RegisterRequest { ip, port } => {
            let peer = Endpoint::new(ip, port);
            *registered_peer = Some(peer.clone());
            on_register_request(state, peer, conn);
        }
        Message::RegisterProposal {
            req_id,
            peer_ip,
            peer_port,
            proposer,
        } => on_register_proposal(state, req_id, Endpoint::new(peer_ip, peer_port), proposer, conn),
        Message::RegisterVote { req_id, voter, vote } => {
            on_register_vote(state, &req_id, voter, vote);
        }
        Message::PeerListRequest { ip, port } => {
            on_peer_list_request(state, Endpoint::new(ip, port), conn);
        }
        Message::DeadReport {
            dead_ip,
            dead_port,
            reporter,
            ..
        } => on_dead_report(state, Endpoint::new(dead_ip, dead_port), reporter),
        Message::DeadProposal {
            req_id,
            dead_ip,
            dead_port,
            ..
        } => on_dead_proposal(state, req_id, Endpoint::new(dead_ip, dead_port), conn),
        Message::DeadVote { req_id, voter, vote, .. } => {
            on_dead_vote(state, &req_id, voter, vote);
        }
        Message::DeadConfirmed { dead_ip, dead_port } => {
            on_dead_confirmed(state, Endpoint::new(dead_ip, dead_port));
        }
        _ => {}
    }
}

fn broadcast_to_seeds(state: &Arc<SeedState>, msg: Message) {
    let targets: Vec<Connection> = state.seed_channels.lock().values().cloned().collect();
    for conn in targets {
        conn.send(msg.clone());
    }
}

// Registration consensus.

/// A peer asks to join; this seed becomes the proposer.
fn on_register_request(state: &Arc<SeedState>, peer: Endpoint, conn: &Connection) {
    let snapshot = {
        let registry = state.registry.lock();
        registry.contains(&peer).then(|| registry.snapshot_excluding(&peer))
    };
    if let Some(snapshot) = snapshot {
        log::info!("REGISTER_REQUEST {peer} already in PL, ACK");
        state.peer_channels.lock().insert(peer, conn.clone());
        conn.send(Message::RegisterResponse {
            status: RegisterStatus::Ok,
            peer_list: Some(snapshot),
        });
        return;
    }

    let req_id = request_id("reg", &peer);
    log::info!("REGISTER_REQUEST {peer}  req_id={req_id}");
    state.pending_reg.lock().insert(
        req_id.clone(),
        RegistrationRound {
            round: VoteRound::new(peer.clone(), &state.id),
            requester: conn.clone(),
        },
    );

    let n_channels = state.seed_channels.lock().len();
    log::info!("Broadcasting REGISTER_PROPOSAL to {n_channels} peer seed(s)  req_id={req_id}");
    broadcast_to_seeds(
        state,
        Message::RegisterProposal {
            req_id: req_id.clone(),
            peer_ip: peer.ip.clone(),
            peer_port: peer.port,
            proposer: state.id.clone(),
        },
    );

    // May already pass when n_seeds == 1.
    check_reg_quorum(state, &req_id);
    spawn_registration_timeout(state.clone(), req_id);
}

/// Non-proposer side: vote YES on the socket the proposal arrived on.
fn on_register_proposal(
    state: &Arc<SeedState>,
    req_id: String,
    peer: Endpoint,
    proposer: String,
    conn: &Connection,
) {
    log::info!("REGISTER_PROPOSAL req_id={req_id} peer={peer} from={proposer}, voting YES");
    conn.send(Message::RegisterVote {
        req_id,
        voter: state.id.clone(),
        vote: true,
    });
}

fn on_register_vote(state: &Arc<SeedState>, req_id: &str, voter: String, vote: bool) {
    log::info!("REGISTER_VOTE req_id={req_id} voter={voter} vote={vote}");
    {
        let mut pending = state.pending_reg.lock();
        let Some(entry) = pending.get_mut(req_id) else {
            return;
        };
        entry.round.record(voter, vote);
    }
    check_reg_quorum(state, req_id);
}

fn check_reg_quorum(state: &Arc<SeedState>, req_id: &str) {
    let (status, entry) = {
        let mut pending = state.pending_reg.lock();
        let Some(entry) = pending.get(req_id) else {
            return;
        };
        let status = entry.round.evaluate(&state.quorum);
        if status == RoundStatus::Pending {
            return;
        }
        // Removing the entry decides the round exactly once; late votes and
        // the timeout task find nothing to act on.
        let Some(entry) = pending.remove(req_id) else {
            return;
        };
        (status, entry)
    };

    if status == RoundStatus::Commit {
        let (yes, _) = entry.round.tally();
        let peer = entry.round.subject;
        let (snapshot, pl_size) = {
            let mut registry = state.registry.lock();
            registry.insert(peer.clone());
            (registry.snapshot_excluding(&peer), registry.len())
        };
        log::info!("Peer {peer} REGISTERED  yes={yes}  PL_size={pl_size}");
        state
            .peer_channels
            .lock()
            .insert(peer, entry.requester.clone());
        entry.requester.send(Message::RegisterResponse {
            status: RegisterStatus::Ok,
            peer_list: Some(snapshot),
        });
    } else {
        log::info!("Registration REJECTED req_id={req_id}");
        entry.requester.send(Message::RegisterResponse {
            status: RegisterStatus::Rejected,
            peer_list: None,
        });
    }
}

fn spawn_registration_timeout(state: Arc<SeedState>, req_id: RequestId) {
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_secs(state.config.consensus.vote_timeout_sec)).await;
        let entry = state.pending_reg.lock().remove(&req_id);
        if let Some(entry) = entry {
            log::info!("Registration TIMEOUT req_id={req_id}");
            entry.requester.send(Message::RegisterResponse {
                status: RegisterStatus::Timeout,
                peer_list: None,
            });
        }
    });
}

fn on_peer_list_request(state: &Arc<SeedState>, requester: Endpoint, conn: &Connection) {
    log::info!("PEER_LIST_REQUEST from {requester}");
    let peer_list = state.registry.lock().snapshot_excluding(&requester);
    conn.send(Message::PeerListResponse { peer_list });
}

// Removal consensus.

fn on_dead_report(state: &Arc<SeedState>, dead: Endpoint, reporter: String) {
    log::info!("DEAD_REPORT  dead={dead}  reporter={reporter}");
    // The reporting peer's neighbourhood already reached its own quorum, so a
    // single fresh report triggers the seed-level vote.
    {
        let mut reports = state.dead_reports.lock();
        if !reports.entry(dead.clone()).or_default().insert(reporter) {
            return;
        }
    }
    propose_removal(state, dead);
}

fn propose_removal(state: &Arc<SeedState>, dead: Endpoint) {
    if !state.registry.lock().contains(&dead) {
        return;
    }
    let req_id = request_id("rem", &dead);
    log::info!("DEAD_PROPOSAL req_id={req_id}  dead={dead}");
    state
        .pending_rem
        .lock()
        .insert(req_id.clone(), VoteRound::new(dead.clone(), &state.id));
    broadcast_to_seeds(
        state,
        Message::DeadProposal {
            req_id: req_id.clone(),
            dead_ip: dead.ip.clone(),
            dead_port: dead.port,
            proposer: state.id.clone(),
        },
    );
    check_rem_quorum(state, &req_id);
    spawn_removal_timeout(state.clone(), req_id);
}

fn on_dead_proposal(state: &Arc<SeedState>, req_id: String, dead: Endpoint, conn: &Connection) {
    log::info!("DEAD_PROPOSAL received req_id={req_id}, voting YES");
    conn.send(Message::DeadVote {
        req_id,
        voter: state.id.clone(),
        vote: true,
        dead_ip: dead.ip,
        dead_port: dead.port,
    });
}

fn on_dead_vote(state: &Arc<SeedState>, req_id: &str, voter: String, vote: bool) {
    log::info!("DEAD_VOTE req_id={req_id} voter={voter} vote={vote}");
    {
        let mut pending = state.pending_rem.lock();
        let Some(round) = pending.get_mut(req_id) else {
            return;
        };
        round.record(voter, vote);
    }
    check_rem_quorum(state, req_id);
}

fn check_rem_quorum(state: &Arc<SeedState>, req_id: &str) {
    let (status, round) = {
        let mut pending = state.pending_rem.lock();
        let Some(round) = pending.get(req_id) else {
            return;
        };
        let status = round.evaluate(&state.quorum);
        if status == RoundStatus::Pending {
            return;
        }
        let Some(round) = pending.remove(req_id) else {
            return;
        };
        (status, round)
    };

    if status != RoundStatus::Commit {
        log::info!("Removal REJECTED req_id={req_id}");
        return;
    }

    let dead = round.subject;
    let (removed, pl_size) = {
        let mut registry = state.registry.lock();
        (registry.remove(&dead), registry.len())
    };
    if removed {
        log::info!("Peer {dead} REMOVED from PL  req_id={req_id}  PL_size={pl_size}");
        fan_out_dead_confirmed(state, &dead);
    }
}

fn spawn_removal_timeout(state: Arc<SeedState>, req_id: RequestId) {
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_secs(state.config.consensus.vote_timeout_sec)).await;
        if state.pending_rem.lock().remove(&req_id).is_some() {
            log::info!("Removal TIMEOUT req_id={req_id}");
        }
    });
}

/// Announce a committed removal to peer seeds and, over the retained
/// registration sockets, to every registered peer.
fn fan_out_dead_confirmed(state: &Arc<SeedState>, dead: &Endpoint) {
    let msg = Message::DeadConfirmed {
        dead_ip: dead.ip.clone(),
        dead_port: dead.port,
    };
    broadcast_to_seeds(state, msg.clone());
    let peers: Vec<Connection> = {
        let mut channels = state.peer_channels.lock();
        channels.remove(dead);
        channels.values().cloned().collect()
    };
    for conn in peers {
        conn.send(msg.clone());
    }
}

/// Another seed committed a removal before us; sync the local registry.
fn on_dead_confirmed(state: &Arc<SeedState>, dead: Endpoint) {
    let removed = state.registry.lock().remove(&dead);
    if removed {
        log::info!("Synced removal of {dead} via DEAD_CONFIRMED from peer seed");
        state.peer_channels.lock().remove(&dead);
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use tokio::sync::mpsc::UnboundedReceiver;

    use super::*;

    fn test_state(n_seeds: usize, vote_timeout_sec: u64) -> Arc<SeedState> {
        let seeds: Vec<Endpoint> = (0..n_seeds)
            .map(|i| Endpoint::new("127.0.0.1", 5001 + i as u16))
            .collect();
        let endpoint = seeds[0].clone();
        let mut config = ProtocolConfig::default();
        config.consensus.vote_timeout_sec = vote_timeout_sec;
        Arc::new(SeedState {
            id: endpoint.to_string(),
            endpoint,
            all_seeds: seeds,
            quorum: MajorityQuorum::new(n_seeds),
            config,
            registry: Mutex::new(PeerRegistry::default()),
            pending_reg: Mutex::new(HashMap::new()),
            pending_rem: Mutex::new(HashMap::new()),
            dead_reports: Mutex::new(HashMap::new()),
            seed_channels: Mutex::new(HashMap::new()),
            peer_channels: Mutex::new(HashMap::new()),
        })
    }

    fn drain(rx: &mut UnboundedReceiver<Message>) -> Vec<Message> {
        let mut out = Vec::new();
        while let Ok(msg) = rx.try_recv() {
            out.push(msg);
        }
        out
    }

    #[tokio::test]
    async fn single_seed_commits_on_self_vote() {
        let state = test_state(1, 10);
        let (conn, mut rx) = Connection::test_pair();
        let peer = Endpoint::new("127.0.0.1", 6001);

        on_register_request(&state, peer.clone(), &conn);

        let responses = drain(&mut rx);
        assert_eq!(responses.len(), 1);
        assert_matches!(
            &responses[0],
            Message::RegisterResponse {
                status: RegisterStatus::Ok,
                peer_list: Some(list),
            } if list.is_empty()
        );
        assert!(state.registry.lock().contains(&peer));
        assert!(state.pending_reg.lock().is_empty());
    }

    #[tokio::test]
    async fn duplicate_register_answers_without_new_proposal() {
        let state = test_state(1, 10);
        let (conn, mut rx) = Connection::test_pair();
        let peer = Endpoint::new("127.0.0.1", 6001);

        on_register_request(&state, peer.clone(), &conn);
        drain(&mut rx);

        on_register_request(&state, peer.clone(), &conn);
        let responses = drain(&mut rx);
        assert_eq!(responses.len(), 1);
        assert_matches!(
            &responses[0],
            Message::RegisterResponse {
                status: RegisterStatus::Ok,
                ..
            }
        );
        assert!(state.pending_reg.lock().is_empty());
        assert_eq!(state.registry.lock().len(), 1);
    }

    #[tokio::test]
    async fn snapshot_excludes_the_joiner() {
        let state = test_state(1, 10);
        let (conn_a, mut rx_a) = Connection::test_pair();
        let (conn_b, mut rx_b) = Connection::test_pair();
        let peer_a = Endpoint::new("127.0.0.1", 6001);
        let peer_b = Endpoint::new("127.0.0.1", 6002);

        on_register_request(&state, peer_a.clone(), &conn_a);
        drain(&mut rx_a);
        on_register_request(&state, peer_b.clone(), &conn_b);

        let responses = drain(&mut rx_b);
        assert_matches!(
            &responses[0],
            Message::RegisterResponse {
                status: RegisterStatus::Ok,
                peer_list: Some(list),
            } if list.len() == 1 && list[0].endpoint() == peer_a
        );
    }

    #[tokio::test]
    async fn registration_times_out_without_quorum() {
        let state = test_state(3, 0);
        let (conn, mut rx) = Connection::test_pair();
        let peer = Endpoint::new("127.0.0.1", 6001);

        on_register_request(&state, peer.clone(), &conn);
        tokio::time::sleep(Duration::from_millis(50)).await;

        let responses = drain(&mut rx);
        assert_eq!(responses.len(), 1);
        assert_matches!(
            &responses[0],
            Message::RegisterResponse {
                status: RegisterStatus::Timeout,
                peer_list: None,
            }
        );
        assert!(!state.registry.lock().contains(&peer));
        assert!(state.pending_reg.lock().is_empty());
    }

    #[tokio::test]
    async fn votes_complete_a_three_seed_round() {
        let state = test_state(3, 10);
        let (conn, mut rx) = Connection::test_pair();
        let peer = Endpoint::new("127.0.0.1", 6001);

        on_register_request(&state, peer.clone(), &conn);
        assert!(drain(&mut rx).is_empty());

        let req_id = state.pending_reg.lock().keys().next().unwrap().clone();
        on_register_vote(&state, &req_id, "127.0.0.1:5002".to_string(), true);

        let responses = drain(&mut rx);
        assert_matches!(
            &responses[0],
            Message::RegisterResponse {
                status: RegisterStatus::Ok,
                ..
            }
        );
        assert!(state.registry.lock().contains(&peer));
    }

    #[tokio::test]
    async fn dead_report_removes_and_fans_out() {
        let state = test_state(1, 10);
        let (conn_a, mut rx_a) = Connection::test_pair();
        let (conn_b, mut rx_b) = Connection::test_pair();
        let peer_a = Endpoint::new("127.0.0.1", 6001);
        let peer_b = Endpoint::new("127.0.0.1", 6002);

        on_register_request(&state, peer_a.clone(), &conn_a);
        on_register_request(&state, peer_b.clone(), &conn_b);
        drain(&mut rx_a);
        drain(&mut rx_b);

        on_dead_report(&state, peer_b.clone(), "127.0.0.1:6001".to_string());

        assert!(!state.registry.lock().contains(&peer_b));
        assert_eq!(state.registry.lock().len(), 1);
        let to_a = drain(&mut rx_a);
        assert_matches!(
            &to_a[0],
            Message::DeadConfirmed { dead_port: 6002, .. }
        );
        // The dead peer's own channel is dropped before the fan-out.
        assert!(drain(&mut rx_b).is_empty());
    }

    #[tokio::test]
    async fn duplicate_dead_report_does_not_repropose() {
        let state = test_state(1, 10);
        let (conn, mut rx) = Connection::test_pair();
        let peer = Endpoint::new("127.0.0.1", 6001);

        on_register_request(&state, peer.clone(), &conn);
        drain(&mut rx);

        on_dead_report(&state, peer.clone(), "127.0.0.1:6002".to_string());
        on_dead_report(&state, peer.clone(), "127.0.0.1:6002".to_string());

        assert!(!state.registry.lock().contains(&peer));
        assert!(state.pending_rem.lock().is_empty());
    }

    #[tokio::test]
    async fn dead_confirmed_sync_is_idempotent() {
        let state = test_state(3, 10);
        let peer = Endpoint::new("127.0.0.1", 6001);
        state.registry.lock().insert(peer.clone());

        on_dead_confirmed(&state, peer.clone());
        assert!(!state.registry.lock().contains(&peer));

        // A second delivery for an already-removed peer changes nothing.
        on_dead_confirmed(&state, peer.clone());
        assert_eq!(state.registry.lock().len(), 0);
    }
}
