// CLASSIFICATION: COMMUNITY
// Filename: main.rs v0.1
// Author: Lukas Bower
// Date Modified: 2026-07-27

use clap::Parser;
use cohesix_net9p::{NetConfig, NetServer};

/// Export the host TCP/UDP stack as a Plan 9 style /net tree over 9P.
#[derive(Parser)]
#[command(about = "Serve the host network stack as a 9P file tree")]
struct Args {
    /// TCP port to serve 9P on
    #[arg(long, default_value_t = 564)]
    port: u16,
    /// Owning user reported for tree entries
    #[arg(long, default_value = "glenda")]
    owner: String,
    /// Owning group reported for tree entries
    #[arg(long, default_value = "glenda")]
    group: String,
}

fn main() -> anyhow::Result<()> {
    env_logger::init();
    let args = Args::parse();
    let server = NetServer::start(NetConfig {
        port: args.port,
        owner: args.owner,
        group: args.group,
    })?;
    server.join()
}
