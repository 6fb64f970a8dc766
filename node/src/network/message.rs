//! The wire catalogue.
//!
//! Every frame carries one JSON object whose `type` field selects the
//! handler. Unknown types decode to [`Message::Unknown`] and are ignored by
//! every router, which keeps old nodes forward compatible with new traffic.

use serde::{Deserialize, Serialize};

use crate::network::Endpoint;

/// One row of a membership snapshot as it travels on the wire.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerEntry {
    pub ip: String,
    pub port: u16,
    #[serde(default)]
    pub degree: u32,
}

impl PeerEntry {
    pub fn endpoint(&self) -> Endpoint {
        Endpoint::new(self.ip.clone(), self.port)
    }
}

/// Outcome of a registration attempt, as reported to the joining peer.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RegisterStatus {
    Ok,
    Rejected,
    Timeout,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Message {
    /// First message on a dialled seed-to-seed socket, identifies the dialler.
    #[serde(rename = "SEED_HELLO")]
    SeedHello { seed_id: String },

    #[serde(rename = "REGISTER_REQUEST")]
    RegisterRequest { ip: String, port: u16 },

    #[serde(rename = "REGISTER_PROPOSAL")]
    RegisterProposal {
        req_id: String,
        peer_ip: String,
        peer_port: u16,
        proposer: String,
    },

    #[serde(rename = "REGISTER_VOTE")]
    RegisterVote {
        req_id: String,
        voter: String,
        vote: bool,
    },

    #[serde(rename = "REGISTER_RESPONSE")]
    RegisterResponse {
        status: RegisterStatus,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        peer_list: Option<Vec<PeerEntry>>,
    },

    /// Retained for external tooling; peers receive the list inline in
    /// `REGISTER_RESPONSE` and never issue this.
    #[serde(rename = "PEER_LIST_REQUEST")]
    PeerListRequest { ip: String, port: u16 },

    #[serde(rename = "PEER_LIST_RESPONSE")]
    PeerListResponse { peer_list: Vec<PeerEntry> },

    /// First message on any peer-to-peer socket, supplies the remote endpoint.
    #[serde(rename = "HELLO")]
    Hello { ip: String, port: u16 },

    #[serde(rename = "GOSSIP")]
    Gossip {
        #[serde(default)]
        content: String,
        #[serde(default)]
        hash: String,
        #[serde(default)]
        origin_ip: String,
        #[serde(default)]
        origin_port: u16,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        sender_ip: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        sender_port: Option<u16>,
    },

    #[serde(rename = "PING")]
    Ping { from_ip: String, from_port: u16 },

    #[serde(rename = "PONG")]
    Pong { from_ip: String, from_port: u16 },

    #[serde(rename = "SUSPECT_REQUEST")]
    SuspectRequest {
        suspect_ip: String,
        suspect_port: u16,
        requester_ip: String,
        requester_port: u16,
    },

    #[serde(rename = "SUSPECT_RESPONSE")]
    SuspectResponse {
        suspect_ip: String,
        suspect_port: u16,
        alive: bool,
        responder_ip: String,
        responder_port: u16,
    },

    #[serde(rename = "DEAD_REPORT")]
    DeadReport {
        dead_ip: String,
        dead_port: u16,
        timestamp: f64,
        reporter: String,
    },

    #[serde(rename = "DEAD_PROPOSAL")]
    DeadProposal {
        req_id: String,
        dead_ip: String,
        dead_port: u16,
        proposer: String,
    },

    #[serde(rename = "DEAD_VOTE")]
    DeadVote {
        req_id: String,
        voter: String,
        vote: bool,
        dead_ip: String,
        dead_port: u16,
    },

    #[serde(rename = "DEAD_CONFIRMED")]
    DeadConfirmed { dead_ip: String, dead_port: u16 },

    #[serde(other)]
    Unknown,
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use serde_json::json;

    use super::*;

    #[test]
    fn register_request_wire_form() {
        let msg = Message::RegisterRequest {
            ip: "127.0.0.1".to_string(),
            port: 6001,
        };
        let value = serde_json::to_value(&msg).unwrap();
        assert_eq!(
            value,
            json!({"type": "REGISTER_REQUEST", "ip": "127.0.0.1", "port": 6001})
        );
    }

    #[test]
    fn register_response_status_is_lowercase() {
        let msg = Message::RegisterResponse {
            status: RegisterStatus::Timeout,
            peer_list: None,
        };
        let value = serde_json::to_value(&msg).unwrap();
        assert_eq!(value, json!({"type": "REGISTER_RESPONSE", "status": "timeout"}));
    }

    #[test]
    fn register_response_without_peer_list_decodes() {
        let msg: Message =
            serde_json::from_value(json!({"type": "REGISTER_RESPONSE", "status": "rejected"}))
                .unwrap();
        assert_matches!(
            msg,
            Message::RegisterResponse {
                status: RegisterStatus::Rejected,
                peer_list: None,
            }
        );
    }

    #[test]
    fn gossip_round_trips_with_sender() {
        let msg = Message::Gossip {
            content: "1234.5:127.0.0.1:1".to_string(),
            hash: "aa".to_string(),
            origin_ip: "127.0.0.1".to_string(),
            origin_port: 6001,
            sender_ip: Some("127.0.0.1".to_string()),
            sender_port: Some(6002),
        };
        let raw = serde_json::to_vec(&msg).unwrap();
        let back: Message = serde_json::from_slice(&raw).unwrap();
        assert_eq!(back, msg);
    }

    #[test]
    fn gossip_without_sender_omits_fields() {
        let msg = Message::Gossip {
            content: "c".to_string(),
            hash: "h".to_string(),
            origin_ip: "127.0.0.1".to_string(),
            origin_port: 6001,
            sender_ip: None,
            sender_port: None,
        };
        let value = serde_json::to_value(&msg).unwrap();
        assert!(value.get("sender_ip").is_none());
        assert!(value.get("sender_port").is_none());
    }

    #[test]
    fn unknown_type_is_tolerated() {
        let msg: Message =
            serde_json::from_value(json!({"type": "FUTURE_THING", "anything": 42})).unwrap();
        assert_matches!(msg, Message::Unknown);
    }

    #[test]
    fn peer_entry_degree_defaults_to_zero() {
        let entry: PeerEntry =
            serde_json::from_value(json!({"ip": "127.0.0.1", "port": 6003})).unwrap();
        assert_eq!(entry.degree, 0);
    }

    #[test]
    fn dead_report_round_trips() {
        let msg = Message::DeadReport {
            dead_ip: "127.0.0.1".to_string(),
            dead_port: 6004,
            timestamp: 1700000000.25,
            reporter: "127.0.0.1:6001".to_string(),
        };
        let raw = serde_json::to_vec(&msg).unwrap();
        let back: Message = serde_json::from_slice(&raw).unwrap();
        assert_eq!(back, msg);
    }
}
