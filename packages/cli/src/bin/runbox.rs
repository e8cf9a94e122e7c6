// ABOUTME: Entry point for the runbox command line tool
// ABOUTME: Parses arguments, loads configuration, and dispatches subcommands

use clap::{Parser, Subcommand};
use colored::*;
use std::process;

use runbox_config::EngineSettings;

mod cli;

use cli::run::RunArgs;

#[derive(Parser)]
#[command(name = "runbox")]
#[command(about = "Runbox - run untrusted code in isolated sandboxes")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Execute a source file and print the execution record as JSON
    Run(RunArgs),
    /// List the container language profiles
    Languages,
    /// Remove containers left behind by interrupted executions
    Sweep,
}

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    if let Err(e) = handle_command(cli.command).await {
        eprintln!("{} {:#}", "Error:".red().bold(), e);
        process::exit(1);
    }
}

async fn handle_command(command: Commands) -> anyhow::Result<()> {
    let settings = EngineSettings::from_env()?;

    match command {
        Commands::Run(args) => cli::run::run_command(args, settings).await,
        Commands::Languages => cli::languages::languages_command(&settings),
        Commands::Sweep => cli::sweep::sweep_command().await,
    }
}
