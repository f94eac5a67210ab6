use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use devrp::rules::{Rule, RuleSet};
use devrp::Limits;
use tokio::signal;
use tracing::info;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Port forwards as src:dest pairs, like: 8080:80,2222:22
    #[arg(short = 'p', long = "forward", required = true, value_delimiter = ',')]
    forwards: Vec<Rule>,

    /// Maximum concurrent connections per forward
    #[arg(long, default_value_t = 1024)]
    max_connections: usize,

    /// Close a connection after this many seconds without traffic
    #[arg(long, value_name = "SECS")]
    idle_timeout: Option<u64>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    let args = Args::parse();
    let rules = RuleSet::new(args.forwards)?;
    let limits = Limits {
        max_connections: args.max_connections,
        idle_timeout: args.idle_timeout.map(Duration::from_secs),
    };

    for rule in rules.iter() {
        info!("forwarding port {} to {}", rule.source, rule.destination);
    }

    devrp::run(rules, limits, signal::ctrl_c()).await;

    Ok(())
}
