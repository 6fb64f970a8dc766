//! Configuration options for the node.
//!
//! Two layers: the seed list comes from a CSV file shared by seeds and peers
//! (one `<ip>,<port>` row per seed), and the protocol tunables carry the
//! protocol constants as defaults, optionally overridden from a TOML file.

use std::path::Path;

use serde_derive::{Deserialize, Serialize};
use thiserror::Error;

use crate::network::Endpoint;

#[derive(Debug, Error)]
pub enum ConfigurationError {
    #[error("Seed list file does not exist: '{}'", .0)]
    SeedListMissing(String),
    #[error("Malformed seed list row: '{}'", .0)]
    MalformedRow(String),
    #[error(transparent)]
    IoError(#[from] std::io::Error),
    #[error("{}", .0)]
    Other(String),
}

type Result<T> = std::result::Result<T, ConfigurationError>;

/// The fixed seed set, identical on every node of one deployment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SeedList {
    pub seeds: Vec<Endpoint>,
}

impl SeedList {
    pub fn load_csv(path: &Path) -> Result<SeedList> {
        if !path.exists() {
            return Err(ConfigurationError::SeedListMissing(
                path.display().to_string(),
            ));
        }
        Self::parse(&std::fs::read_to_string(path)?)
    }

    /// Rows with fewer than two columns are skipped; whitespace is trimmed.
    pub fn parse(raw: &str) -> Result<SeedList> {
        let mut seeds = Vec::new();
        for line in raw.lines() {
            let mut columns = line.split(',').map(str::trim);
            let (Some(ip), Some(port)) = (columns.next(), columns.next()) else {
                continue;
            };
            if ip.is_empty() {
                continue;
            }
            let port = port
                .parse::<u16>()
                .map_err(|_| ConfigurationError::MalformedRow(line.to_string()))?;
            seeds.push(Endpoint::new(ip, port));
        }
        Ok(SeedList { seeds })
    }

    pub fn len(&self) -> usize {
        self.seeds.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seeds.is_empty()
    }
}

/// Protocol tunables. The defaults are the protocol constants; a TOML file
/// may override any subset of them.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct ProtocolConfig {
    pub gossip: GossipConfig,
    pub liveness: LivenessConfig,
    pub suspicion: SuspicionConfig,
    pub consensus: ConsensusConfig,
    pub dial: DialConfig,
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        ProtocolConfig {
            gossip: GossipConfig::default(),
            liveness: LivenessConfig::default(),
            suspicion: SuspicionConfig::default(),
            consensus: ConsensusConfig::default(),
            dial: DialConfig::default(),
        }
    }
}

impl ProtocolConfig {
    pub fn try_load(path: &Path) -> Result<ProtocolConfig> {
        let config = config::Config::builder()
            .add_source(config::File::from(path))
            .build()
            .map_err(|e| ConfigurationError::Other(e.to_string()))?;

        config
            .try_deserialize()
            .map_err(|e| ConfigurationError::Other(e.to_string()))
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct GossipConfig {
    /// Seconds between self-originated messages.
    pub interval_sec: u64,
    /// Ceiling on self-originated messages.
    pub max_messages: u32,
    /// Seconds to let neighbour connections stabilise before gossiping.
    pub warmup_sec: u64,
}

impl Default for GossipConfig {
    fn default() -> Self {
        GossipConfig {
            interval_sec: 5,
            max_messages: 10,
            warmup_sec: 2,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct LivenessConfig {
    /// Seconds between ping rounds.
    pub ping_interval_sec: u64,
    /// Consecutive missed pings before suspicion starts.
    pub miss_threshold: u32,
    /// Seconds before the first ping round.
    pub startup_delay_sec: u64,
}

impl Default for LivenessConfig {
    fn default() -> Self {
        LivenessConfig {
            ping_interval_sec: 8,
            miss_threshold: 3,
            startup_delay_sec: 5,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct SuspicionConfig {
    /// Seconds to wait for neighbour confirmations before a suspicion lapses.
    pub timeout_sec: u64,
    /// Deadline for the TCP port-knock a responder performs.
    pub knock_timeout_sec: u64,
}

impl Default for SuspicionConfig {
    fn default() -> Self {
        SuspicionConfig {
            timeout_sec: 20,
            knock_timeout_sec: 1,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct ConsensusConfig {
    /// Seconds a proposer waits for votes before marking a round decided.
    pub vote_timeout_sec: u64,
}

impl Default for ConsensusConfig {
    fn default() -> Self {
        ConsensusConfig { vote_timeout_sec: 10 }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct DialConfig {
    /// Per-attempt connect deadline, seconds.
    pub connect_timeout_sec: u64,
    /// Attempts when a peer dials a seed for registration.
    pub seed_attempts: u32,
    /// Attempts when a peer dials a chosen neighbour.
    pub neighbour_attempts: u32,
    /// Attempts when a seed dials a higher-port seed.
    pub mesh_attempts: u32,
    /// Grace period before the seed mesh starts dialling, seconds.
    pub mesh_grace_sec: u64,
    /// Seconds to wait for inbound neighbours before the loops start.
    pub stabilise_sec: u64,
}

impl Default for DialConfig {
    fn default() -> Self {
        DialConfig {
            connect_timeout_sec: 5,
            seed_attempts: 4,
            neighbour_attempts: 5,
            mesh_attempts: 15,
            mesh_grace_sec: 2,
            stabilise_sec: 2,
        }
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    #[test]
    fn parse_trims_and_skips_short_rows() {
        let list = SeedList::parse("127.0.0.1, 5001\njunk\n 127.0.0.1 ,5002 \n\n").unwrap();
        assert_eq!(
            list.seeds,
            vec![
                Endpoint::new("127.0.0.1", 5001),
                Endpoint::new("127.0.0.1", 5002),
            ]
        );
    }

    #[test]
    fn parse_rejects_bad_port() {
        let err = SeedList::parse("127.0.0.1,not_a_port").unwrap_err();
        assert_matches!(err, ConfigurationError::MalformedRow(_));
    }

    #[test]
    fn missing_seed_list_is_fatal() {
        let err = SeedList::load_csv(Path::new("/definitely/not/here.csv")).unwrap_err();
        assert_matches!(err, ConfigurationError::SeedListMissing(_));
    }

    #[test]
    fn defaults_match_protocol_constants() {
        let config = ProtocolConfig::default();
        assert_eq!(config.gossip.interval_sec, 5);
        assert_eq!(config.gossip.max_messages, 10);
        assert_eq!(config.liveness.ping_interval_sec, 8);
        assert_eq!(config.liveness.miss_threshold, 3);
        assert_eq!(config.suspicion.timeout_sec, 20);
        assert_eq!(config.consensus.vote_timeout_sec, 10);
    }
}
