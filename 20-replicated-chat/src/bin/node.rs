//! Runs one member of a replicated chat cluster.
//!
//! Every node must be given the same ordered node list, either in a TOML file
//! or with repeated `--node` flags. The node blocks until every peer is up.
//!
//! ```bash
//! # Terminal 1
//! cargo run --bin node -- --id 0 \
//!   --node 127.0.0.1:40130 --node 127.0.0.1:40140 --node 127.0.0.1:40150
//!
//! # Terminal 2, 3: same with --id 1 and --id 2
//! ```

use std::path::PathBuf;
use std::thread;

use anyhow::{bail, Result};
use clap::{Parser, ValueHint};
use tracing::info;

use replicated_chat::config::{ClusterConfig, NodeAddress, NodeConfig};
use replicated_chat::node::Node;

#[derive(Parser, Debug)]
#[command(author, version, about = "Run a replicated chat node")]
struct Args {
    /// Index of this node in the cluster's node list
    #[arg(long)]
    id: usize,

    /// TOML cluster config
    #[arg(long, value_hint = ValueHint::FilePath, conflicts_with = "node")]
    config: Option<PathBuf>,

    /// Cluster member as host:base_port, repeated in cluster order
    #[arg(long, value_delimiter = ',')]
    node: Vec<NodeAddress>,

    /// Overrides the config's data directory
    #[arg(long, value_hint = ValueHint::DirPath)]
    data_dir: Option<PathBuf>,
}

fn init_tracing() {
    use tracing_subscriber::{fmt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = fmt().with_env_filter(filter).with_target(false).try_init();
}

fn cluster_config(args: &Args) -> Result<ClusterConfig> {
    let mut cluster = match (&args.config, args.node.is_empty()) {
        (Some(path), _) => ClusterConfig::load(path)?,
        (None, false) => ClusterConfig::new(args.node.clone(), "data")?,
        (None, true) => bail!("pass --config or at least one --node"),
    };
    if let Some(dir) = &args.data_dir {
        cluster.data_dir = dir.clone();
    }
    Ok(cluster)
}

fn main() -> Result<()> {
    init_tracing();

    let args = Args::parse();
    let config = NodeConfig::new(args.id, cluster_config(&args)?)?;
    info!(
        machine_id = config.machine_id,
        nodes = config.cluster.len(),
        data_dir = %config.cluster.data_dir.display(),
        "starting node"
    );
    let node = Node::start(config)?;
    info!(client_addr = %node.client_addr(), "serving clients");

    loop {
        thread::park();
    }
}
