//! # Gossipnet Node
//!
//! A small gossip based peer-to-peer overlay with two cooperating node roles.
//!
//! **Seeds** form a full mesh among themselves and act as a trusted directory:
//! they admit new peers and confirm dead ones through one-shot majority votes.
//!
//! **Peers** register with the seeds, merge the returned membership lists and
//! attach to neighbours with power-law preferential attachment, producing a
//! scale-free overlay. Gossip messages flood the overlay with hash based
//! deduplication. Liveness is detected in two levels: local missed-ping
//! accounting escalates to peer-level suspicion with a neighbour quorum, and a
//! confirmed suspicion escalates to seed-level removal consensus.
//!
//! All traffic is 4-byte big-endian length-prefixed JSON over TCP.

pub use crate::config::{ConfigurationError, ProtocolConfig, SeedList};
pub use crate::logging::init_logging;
pub use crate::network::Endpoint;
pub use crate::peer::PeerNode;
pub use crate::seed::SeedNode;

pub mod cli;

mod config;
mod logging;
mod network;
mod peer;
mod seed;
mod utilities;
