use clap::Parser;

use gossipnet::cli::SeedCmd;
use gossipnet::init_logging;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cmd = SeedCmd::parse();
    init_logging("seed", cmd.bind_port);

    cmd.execute().await
}
