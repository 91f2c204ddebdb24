//! Cosci CLI entry point.

use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use cosci::cli::{commands, Cli, Commands};

#[tokio::main]
async fn main() {
    // Inspection commands print to stdout; diagnostics go to stderr.
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();
    let config_path = cli.config.as_deref();

    let result = match cli.command {
        Commands::Config => commands::config::execute(config_path, cli.json),
        Commands::Status { checkpoint } => {
            commands::status::execute(config_path, checkpoint, cli.json).await
        }
        Commands::Standings { checkpoint, limit } => {
            commands::standings::execute(config_path, checkpoint, limit, cli.json).await
        }
    };

    if let Err(err) = result {
        cosci::cli::handle_error(err, cli.json);
    }
}
