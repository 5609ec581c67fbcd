use clap::Parser;

mod cli;
mod commands;
mod output;

use cli::{Cli, Commands};
use output::Output;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let out = Output::new(cli.json);

    let result = match cli.command {
        Commands::Environments { command } => commands::environments::run(command, &out).await,
        Commands::Container { command } => commands::container::run(command, &out).await,
        Commands::Config { command } => commands::config::run(command, &out).await,
        Commands::Certificates { command } => commands::certificates::run(command, &out).await,
    };

    if let Err(err) = result {
        out.error(&err);
        std::process::exit(err.exit_code());
    }
}
