use clap::Parser;

use gossipnet::cli::PeerCmd;
use gossipnet::init_logging;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cmd = PeerCmd::parse();
    init_logging("peer", cmd.bind_port);

    cmd.execute().await
}
