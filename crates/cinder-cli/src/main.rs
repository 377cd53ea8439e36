//! Cinder CLI entrypoint.

use clap::Parser;
use tracing_subscriber::EnvFilter;

mod commands;
mod handlers;
mod queue;

use commands::Commands;

#[derive(Parser)]
#[command(name = "cinder")]
#[command(author, version, about = "Cinder decision service", long_about = None)]
struct Cli {
    /// Show more logging output
    #[arg(short, long, global = true, conflicts_with = "quiet")]
    verbose: bool,

    /// Show less logging output
    #[arg(short, long, global = true)]
    quiet: bool,

    #[command(subcommand)]
    command: Commands,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let level = if cli.verbose {
        "debug"
    } else if cli.quiet {
        "warn"
    } else {
        "info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level)))
        .with_target(false)
        // keep stdout clean for the emitted task stream
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Commands::Decide(args) => handlers::decide(args)?,
        Commands::Ci(args) => handlers::ci(args)?,
        Commands::Check(args) => handlers::check(args)?,
    }

    Ok(())
}
