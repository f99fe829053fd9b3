use clap::Parser;
use std::path::PathBuf;
use syncboard_http::serve;
use syncboard_replication::config::parse_peers;
use syncboard_replication::{NodeConfig, NodeRole};

/// A replicated message board node.
///
/// Settings come from `{data_dir}/node.json` when present, otherwise from the
/// environment; flags given here override both.
#[derive(Parser)]
#[command(name = "syncboard")]
struct Cli {
    #[arg(long, env = "SYNCBOARD_DATA_DIR", default_value = "./data")]
    data_dir: PathBuf,
    #[arg(long, env = "SYNCBOARD_BIND_ADDR")]
    bind_addr: Option<String>,
    #[arg(long, env = "SYNCBOARD_NODE_ID")]
    node_id: Option<String>,
    /// master or slave
    #[arg(long, env = "SYNCBOARD_ROLE")]
    role: Option<NodeRole>,
    /// Comma-separated `id=url` pairs, e.g. `master=http://10.0.0.1:5000`
    #[arg(long, env = "SYNCBOARD_PEERS")]
    peers: Option<String>,
}

impl Cli {
    fn node_config(&self) -> Result<NodeConfig, Box<dyn std::error::Error>> {
        let mut config = NodeConfig::load_or_default(&self.data_dir);
        if let Some(node_id) = &self.node_id {
            config.node_id = node_id.clone();
        }
        if let Some(role) = self.role {
            config.role = role;
        }
        if let Some(bind_addr) = &self.bind_addr {
            config.bind_addr = bind_addr.clone();
        }
        if let Some(peers) = &self.peers {
            config.peers = parse_peers(peers)?;
        }
        Ok(config)
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let result = match cli.node_config() {
        Ok(config) => serve(&cli.data_dir, config).await,
        Err(e) => Err(e),
    };

    if let Err(e) = result {
        eprintln!("ERROR: {}", e);
        std::process::exit(1);
    }
}
