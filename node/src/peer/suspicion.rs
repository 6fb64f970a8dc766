//! Peer-level suspicion with neighbour quorum.
//!
//! Before a peer escalates a dead neighbour to the seeds, it polls its other
//! neighbours. Each responder answers with a fast TCP port-knock; ICMP is
//! deliberately avoided here because it is unreliable on loopback. Once a
//! majority of neighbours (minimum one) confirm the suspect unreachable, a
//! single `DEAD_REPORT` goes to every seed socket.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpStream;

use crate::network::message::Message;
use crate::network::transport::Connection;
use crate::network::Endpoint;
use crate::peer::PeerState;
use crate::utilities::time::WallClock;

#[derive(Debug, Default)]
pub(crate) struct SuspicionEntry {
    /// Node ids that confirmed the suspect unreachable, the own id included.
    pub(crate) confirmations: HashSet<String>,
    /// Frozen once the dead report went out.
    pub(crate) reported: bool,
}

impl SuspicionEntry {
    pub(crate) fn seeded(own_id: &str) -> SuspicionEntry {
        let mut entry = SuspicionEntry::default();
        entry.confirmations.insert(own_id.to_string());
        entry
    }
}

/// Open a suspicion for `suspect` and poll the other neighbours. Idempotent
/// while an entry exists.
pub(crate) fn start_suspicion(state: &Arc<PeerState>, suspect: &Endpoint) {
    {
        let mut suspected = state.suspected.lock();
        if suspected.contains_key(suspect) {
            return;
        }
        suspected.insert(suspect.clone(), SuspicionEntry::seeded(&state.id));
    }
    log::info!("SUSPICION started for {suspect}");

    let request = Message::SuspectRequest {
        suspect_ip: suspect.ip.clone(),
        suspect_port: suspect.port,
        requester_ip: state.endpoint.ip.clone(),
        requester_port: state.endpoint.port,
    };
    let targets: Vec<Connection> = state
        .neighbours
        .lock()
        .iter()
        .filter(|(key, _)| *key != suspect)
        .map(|(_, conn)| conn.clone())
        .collect();
    for conn in targets {
        conn.send(request.clone());
    }

    spawn_suspicion_timeout(state.clone(), suspect.clone());
}

fn spawn_suspicion_timeout(state: Arc<PeerState>, suspect: Endpoint) {
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_secs(state.config.suspicion.timeout_sec)).await;
        let lapsed = {
            let mut suspected = state.suspected.lock();
            match suspected.get(&suspect) {
                Some(entry) if !entry.reported => {
                    suspected.remove(&suspect);
                    true
                }
                _ => false,
            }
        };
        if lapsed {
            log::info!("Suspicion TIMEOUT for {suspect}, no peer quorum, cancelling");
        }
    });
}

/// Answer a neighbour's poll with a port-knock verdict.
pub(crate) async fn on_suspect_request(
    state: &Arc<PeerState>,
    suspect: Endpoint,
    conn: &Connection,
) {
    let alive = port_knock(
        &suspect,
        Duration::from_secs(state.config.suspicion.knock_timeout_sec),
    )
    .await;
    log::info!(
        "SUSPECT_REQUEST for {suspect}, ping={}",
        if alive { "alive" } else { "dead" }
    );
    conn.send(Message::SuspectResponse {
        suspect_ip: suspect.ip,
        suspect_port: suspect.port,
        alive,
        responder_ip: state.endpoint.ip.clone(),
        responder_port: state.endpoint.port,
    });
}

/// Alive iff a TCP connect succeeds within the deadline. A refused or timed
/// out connect means the process is gone.
pub(crate) async fn port_knock(target: &Endpoint, deadline: Duration) -> bool {
    matches!(
        tokio::time::timeout(deadline, TcpStream::connect(target.addr())).await,
        Ok(Ok(_))
    )
}

pub(crate) fn on_suspect_response(
    state: &Arc<PeerState>,
    suspect: Endpoint,
    alive: bool,
    responder: String,
) {
    let confirmations = {
        let mut suspected = state.suspected.lock();
        let Some(entry) = suspected.get_mut(&suspect) else {
            return;
        };
        if entry.reported {
            return;
        }
        if !alive {
            entry.confirmations.insert(responder.clone());
        }
        entry.confirmations.len()
    };
    log::info!(
        "SUSPECT_RESPONSE from {responder} for {suspect}: alive={alive} confirms={confirmations}"
    );

    let total = state.neighbours.lock().len();
    let peer_quorum = std::cmp::max(1, total / 2 + 1);
    if confirmations < peer_quorum {
        return;
    }

    // Flip the reported flag exactly once.
    {
        let mut suspected = state.suspected.lock();
        let Some(entry) = suspected.get_mut(&suspect) else {
            return;
        };
        if entry.reported {
            return;
        }
        entry.reported = true;
    }
    report_dead(state, &suspect);
}

/// Escalate a confirmed suspicion to every seed we hold a socket for.
pub(crate) fn report_dead(state: &Arc<PeerState>, dead: &Endpoint) {
    let timestamp = WallClock::unix_now();
    log::info!(
        "DEAD_REPORT: Dead Node:{}:{}:{timestamp:.6}:{}",
        dead.ip,
        dead.port,
        state.endpoint.ip
    );
    let report = Message::DeadReport {
        dead_ip: dead.ip.clone(),
        dead_port: dead.port,
        timestamp,
        reporter: state.id.clone(),
    };
    let seeds: Vec<Connection> = state.seed_channels.lock().values().cloned().collect();
    for conn in seeds {
        conn.send(report.clone());
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use crate::config::ProtocolConfig;
    use crate::peer::test_state;

    use super::*;

    fn neighbour(state: &Arc<PeerState>, port: u16) -> tokio::sync::mpsc::UnboundedReceiver<Message> {
        let (conn, rx) = Connection::test_pair();
        state
            .neighbours
            .lock()
            .insert(Endpoint::new("127.0.0.1", port), conn);
        rx
    }

    #[tokio::test]
    async fn start_is_idempotent_and_polls_other_neighbours() {
        let state = test_state(ProtocolConfig::default());
        let suspect = Endpoint::new("127.0.0.1", 6004);
        let mut other_rx = neighbour(&state, 6002);
        let mut suspect_rx = neighbour(&state, 6004);

        start_suspicion(&state, &suspect);
        start_suspicion(&state, &suspect);

        let entry_confirmations = state.suspected.lock()[&suspect].confirmations.clone();
        assert_eq!(entry_confirmations.len(), 1);
        assert!(entry_confirmations.contains(&state.id));

        // One request to the other neighbour, none to the suspect.
        assert_matches!(other_rx.try_recv().unwrap(), Message::SuspectRequest { .. });
        assert!(other_rx.try_recv().is_err());
        assert!(suspect_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn alive_responses_are_not_counted() {
        let state = test_state(ProtocolConfig::default());
        let suspect = Endpoint::new("127.0.0.1", 6004);
        let _rx_a = neighbour(&state, 6002);
        let _rx_b = neighbour(&state, 6003);
        let _rx_c = neighbour(&state, 6004);
        start_suspicion(&state, &suspect);

        on_suspect_response(&state, suspect.clone(), true, "127.0.0.1:6002".to_string());

        let suspected = state.suspected.lock();
        assert_eq!(suspected[&suspect].confirmations.len(), 1);
        assert!(!suspected[&suspect].reported);
    }

    #[tokio::test]
    async fn quorum_of_dead_confirmations_reports_once() {
        let state = test_state(ProtocolConfig::default());
        let suspect = Endpoint::new("127.0.0.1", 6004);
        let _rx_a = neighbour(&state, 6002);
        let _rx_b = neighbour(&state, 6003);
        let _rx_c = neighbour(&state, 6004);
        let (seed_conn, mut seed_rx) = Connection::test_pair();
        state
            .seed_channels
            .lock()
            .insert(Endpoint::new("127.0.0.1", 5001), seed_conn);
        start_suspicion(&state, &suspect);

        // Three neighbours: quorum is 2; self plus one dead confirmation.
        on_suspect_response(&state, suspect.clone(), false, "127.0.0.1:6002".to_string());
        assert!(state.suspected.lock()[&suspect].reported);
        assert_matches!(
            seed_rx.try_recv().unwrap(),
            Message::DeadReport { dead_port: 6004, .. }
        );

        // Confirmations freeze after the report.
        on_suspect_response(&state, suspect.clone(), false, "127.0.0.1:6003".to_string());
        assert_eq!(state.suspected.lock()[&suspect].confirmations.len(), 2);
        assert!(seed_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn timeout_discards_unreported_suspicion() {
        let mut config = ProtocolConfig::default();
        config.suspicion.timeout_sec = 0;
        let state = test_state(config);
        let suspect = Endpoint::new("127.0.0.1", 6004);

        start_suspicion(&state, &suspect);
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert!(!state.suspected.lock().contains_key(&suspect));
    }

    #[tokio::test]
    async fn knock_on_closed_port_is_dead() {
        // Nothing listens on this port.
        let target = Endpoint::new("127.0.0.1", 1);
        assert!(!port_knock(&target, Duration::from_secs(1)).await);
    }
}
