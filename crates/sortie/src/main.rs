//! Sortie - tool-calling agent for your terminal

use clap::{Parser, Subcommand};
use tracing::error;
use tracing_subscriber::EnvFilter;

mod commands;

use commands::{init_command, run_command, status_command, RunOptions};

/// Sortie - tool-calling agent for your terminal
#[derive(Parser)]
#[command(name = "sortie")]
#[command(about = "◆ A tool-calling agent that runs shell work to completion")]
#[command(version = env!("CARGO_PKG_VERSION"))]
struct Cli {
    /// Verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize config and workspace
    Init,
    /// Run the agent on a task
    Run {
        /// Task to run; starts an interactive prompt when omitted
        #[arg(short, long)]
        message: Option<String>,
        /// Model override
        #[arg(long)]
        model: Option<String>,
        /// Iteration budget override
        #[arg(long)]
        max_iterations: Option<u32>,
    },
    /// Show system status
    Status,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "warn" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .with_writer(std::io::stderr)
        .init();

    let result = match cli.command {
        Commands::Init => init_command().await,
        Commands::Run {
            message,
            model,
            max_iterations,
        } => {
            run_command(RunOptions {
                message,
                model,
                max_iterations,
            })
            .await
        }
        Commands::Status => status_command().await,
    };

    if let Err(e) = result {
        error!("{:#}", e);
        eprintln!("✗ {:#}", e);
        std::process::exit(1);
    }
}
