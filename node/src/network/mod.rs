use std::fmt::Display;

use serde::{Deserialize, Serialize};

pub(crate) mod message;
pub(crate) mod transport;

/// Identifies any node of the network uniquely.
///
/// The string form `<ip>:<port>` doubles as the node id used in votes,
/// suspicion confirmations and log lines.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Endpoint {
    pub ip: String,
    pub port: u16,
}

impl Endpoint {
    pub fn new(ip: impl Into<String>, port: u16) -> Self {
        Endpoint { ip: ip.into(), port }
    }

    /// Socket address form accepted by `TcpStream::connect`.
    pub fn addr(&self) -> String {
        format!("{}:{}", self.ip, self.port)
    }
}

impl Display for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.ip, self.port)
    }
}
