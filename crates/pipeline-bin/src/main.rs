//! Order Pipeline - producer and consumer services for order audit delivery.

mod app;

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use pipeline_config_and_utils::{init_logging, Config};

/// Order pipeline command-line interface.
#[derive(Parser)]
#[command(name = "order-pipeline")]
#[command(about = "Transactional outbox/inbox delivery of order audit events")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file (JSON). Missing file means defaults.
    #[arg(short, long, global = true, env = "ORDER_PIPELINE_CONFIG")]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error). Overrides the config file.
    #[arg(short, long, global = true)]
    log_level: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the producer service (outbox relay)
    Producer,
    /// Run the consumer service (message intake and inbox relay)
    Consumer,
    /// Create a batch of orders from a JSON file
    Submit {
        /// File holding a JSON array of orders
        #[arg(short, long)]
        file: PathBuf,
    },
    /// Show queue depths and dead letters
    Status,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut config = Config::load(cli.config.as_deref())?;
    if let Some(level) = cli.log_level {
        config.log_level = level;
    }
    init_logging(&config.log_level, config.log_format);

    match cli.command {
        Commands::Producer => app::run_producer(config).await?,
        Commands::Consumer => app::run_consumer(config).await?,
        Commands::Submit { file } => app::submit_orders(config, &file).await?,
        Commands::Status => app::show_status(config).await?,
    }

    Ok(())
}
