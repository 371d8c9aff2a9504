mod app;
mod cli;

use clap::Parser;
use cli::{Cli, Commands};
use pollwork::config::Config;
use pollwork::observability;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let cli = Cli::parse();

    let config = match cli.config {
        Some(path) => Config::load_from_path(path)?,
        None => Config::load()?,
    };
    observability::init_tracing(&config.telemetry);

    match cli.command {
        Commands::Run(args) => app::run(config, args).await?,
        Commands::Config => app::print_config(&config)?,
    }

    Ok(())
}
