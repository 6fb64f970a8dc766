//! Command line entry points for the two node roles.

use std::path::{Path, PathBuf};

use clap::Parser;

use crate::config::{ProtocolConfig, SeedList};
use crate::network::Endpoint;
use crate::peer::PeerNode;
use crate::seed::SeedNode;

#[derive(Debug, Clone, Parser)]
#[command(about = "Trusted directory node of the gossip overlay")]
pub struct SeedCmd {
    /// Address to bind the listener on
    pub bind_ip: String,
    /// Port to bind the listener on
    pub bind_port: u16,
    /// CSV file with one `<ip>,<port>` row per seed
    #[arg(default_value = "config.csv")]
    pub config_path: PathBuf,
    /// Optional TOML file overriding protocol tunables
    #[arg(long)]
    pub tunables: Option<PathBuf>,
}

impl SeedCmd {
    pub async fn execute(&self) -> anyhow::Result<()> {
        let seeds = SeedList::load_csv(&self.config_path)?;
        let config = load_tunables(self.tunables.as_deref())?;
        let endpoint = Endpoint::new(self.bind_ip.clone(), self.bind_port);
        SeedNode::new(endpoint, seeds, config).run().await
    }
}

#[derive(Debug, Clone, Parser)]
#[command(about = "Peer node of the gossip overlay")]
pub struct PeerCmd {
    /// Address to bind the listener on
    pub bind_ip: String,
    /// Port to bind the listener on
    pub bind_port: u16,
    /// CSV file with one `<ip>,<port>` row per seed
    #[arg(default_value = "config.csv")]
    pub config_path: PathBuf,
    /// Optional TOML file overriding protocol tunables
    #[arg(long)]
    pub tunables: Option<PathBuf>,
}

impl PeerCmd {
    pub async fn execute(&self) -> anyhow::Result<()> {
        let seeds = SeedList::load_csv(&self.config_path)?;
        let config = load_tunables(self.tunables.as_deref())?;
        let endpoint = Endpoint::new(self.bind_ip.clone(), self.bind_port);
        PeerNode::new(endpoint, seeds, config).run().await
    }
}

fn load_tunables(path: Option<&Path>) -> anyhow::Result<ProtocolConfig> {
    match path {
        Some(path) => Ok(ProtocolConfig::try_load(path)?),
        None => Ok(ProtocolConfig::default()),
    }
}
