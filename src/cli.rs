use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "pollwork")]
#[command(about = "Queue worker with retries, idempotency and a circuit breaker", long_about = None)]
pub struct Cli {
    /// Configuration file (defaults to $POLLWORK_CONFIG or config/pollwork.toml)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the worker against an in-memory queue seeded with demo messages
    Run(RunArgs),
    /// Print the effective configuration as TOML
    Config,
}

#[derive(clap::Args, Debug)]
pub struct RunArgs {
    /// Number of demo messages to enqueue
    #[arg(long, default_value_t = 100)]
    pub messages: u64,

    /// Fail every K-th handler call (0 never fails)
    #[arg(long, default_value_t = 0)]
    pub fail_every: u64,

    /// Simulated handler latency in milliseconds
    #[arg(long, default_value_t = 50)]
    pub latency: u64,

    /// Order each batch by the payload `priority` field
    #[arg(long)]
    pub prioritize: bool,

    /// Stop once the queue is drained instead of waiting for Ctrl+C
    #[arg(long)]
    pub until_idle: bool,
}
