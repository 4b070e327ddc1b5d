use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use minewarden_cli::commands::{check, run, status};
use minewarden_cli::config;

/// minewarden - Stratum pool client with failover and economic pause
#[derive(Parser)]
#[command(name = "minewarden")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Verbose mode (-v, -vv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Config file path
    #[arg(short, long, global = true, env = "MINEWARDEN_CONFIG")]
    config: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Connect to the configured pools and mine
    Run(run::RunArgs),

    /// Validate configuration and wallet
    Check(check::CheckArgs),

    /// Show the status of a running miner
    Status(status::StatusArgs),
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // RUST_LOG wins over -v
    let log_level = match cli.verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));

    // stdout belongs to the hash engine bridge
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_thread_ids(false)
        .with_line_number(cli.verbose > 1)
        .init();

    if let Some(config_path) = &cli.config {
        config::set_config_path(config_path);
    }
    let config_path = config::get_config_path();

    match cli.command {
        Commands::Run(args) => run::execute(args, &config_path).await?,
        Commands::Check(args) => check::execute(args, &config_path).await?,
        Commands::Status(args) => status::execute(args).await?,
    }

    Ok(())
}
