/// ringmend CLI - run a repair node.
///
/// Usage:
///   ringmend serve [--bind <addr>] [--join <addr>] [--method <m>]
///     - Start a ring node with the anti-entropy repair engine
///   ringmend seed --count <n>
///     - Start a node pre-filled with synthetic entries (for demos)
use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use ringmend::network::DEFAULT_PORT;
use ringmend::{NodeConfig, ReconMethod, RepairConfig, RepairNode, RingKey};
use serde_json::json;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::signal;

#[derive(Parser)]
#[command(name = "ringmend", version, about = "Anti-entropy replica repair node")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Start a repair node.
    Serve(ServeArgs),
    /// Start a repair node pre-filled with synthetic entries.
    Seed {
        #[command(flatten)]
        serve: ServeArgs,
        /// Number of synthetic entries to store.
        #[arg(long, default_value_t = 1000)]
        count: u64,
    },
}

#[derive(clap::Args)]
struct ServeArgs {
    /// Address to bind for repair traffic.
    #[arg(long, default_value_t = SocketAddr::from(([0, 0, 0, 0], DEFAULT_PORT)))]
    bind: SocketAddr,

    /// Address of an existing node to join.
    #[arg(long)]
    join: Option<SocketAddr>,

    /// Ring position (random if omitted).
    #[arg(long)]
    position: Option<RingKey>,

    /// Reconciliation method: bloom, merkle_tree, or art.
    #[arg(long, default_value = "bloom")]
    method: ReconMethod,

    /// Seconds between repair triggers.
    #[arg(long, default_value_t = 60)]
    trigger_interval: u64,

    /// Probability (0-100) that a trigger starts a session.
    #[arg(long, default_value_t = 33)]
    trigger_probability: u8,

    /// Bloom filter false-positive rate.
    #[arg(long, default_value_t = 0.01)]
    bloom_fpr: f64,

    /// Upper bound on items summarised per round.
    #[arg(long, default_value_t = 100_000)]
    max_items: usize,
}

impl ServeArgs {
    fn node_config(&self) -> NodeConfig {
        let repair = RepairConfig::new()
            .method(self.method)
            .bloom_fpr(self.bloom_fpr)
            .max_items(self.max_items)
            .trigger_interval(Duration::from_secs(self.trigger_interval))
            .trigger_probability(self.trigger_probability);
        let mut config = NodeConfig::new().bind_addr(self.bind).repair(repair);
        if let Some(join) = self.join {
            config = config.join(join);
        }
        if let Some(position) = self.position {
            config = config.position(position);
        }
        config
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    ringmend::init_logging();
    let cli = Cli::parse();

    match cli.command {
        Command::Serve(args) => run_node(args, 0).await,
        Command::Seed { serve, count } => run_node(serve, count).await,
    }
}

async fn run_node(args: ServeArgs, seed_count: u64) -> Result<()> {
    let node = RepairNode::new(args.node_config()).context("invalid configuration")?;
    node.start().await.context("failed to start node")?;

    for i in 0..seed_count {
        let key = (i as u128).wrapping_mul(0x9e37_79b9_7f4a_7c15) & (ringmend::QUADRANT_SPAN - 1);
        node.put(key, json!({ "seq": i }), 1);
    }

    let addr = node.actual_addr().await.context("node has no address")?;
    println!("ringmend node {} listening on {}", node.node_id(), addr);
    if seed_count > 0 {
        println!("seeded {} entries", seed_count);
    }

    signal::ctrl_c().await.context("failed to wait for ctrl-c")?;
    println!("shutting down");
    node.stop().await.context("failed to stop node")?;
    Ok(())
}
