// ABOUTME: csbx binary entry point: argument parsing, logging setup and command dispatch
// ABOUTME: Results go to stdout, diagnostics and logs to stderr

use anyhow::Context;
use clap::{ArgAction, Parser, Subcommand};
use colored::*;
use csbx_sandbox::{EngineChoice, SandboxClient, SandboxSettings};
use std::process;
use tracing::debug;
use tracing_subscriber::EnvFilter;

mod cli;

use cli::exec::{ExecArgs, ProcessCommands};
use cli::files::FilesCommands;
use cli::sandbox::{CreateArgs, SandboxCommands};

#[derive(Parser)]
#[command(name = "csbx")]
#[command(about = "Local container sandboxes for safe code execution")]
#[command(version)]
struct Cli {
    /// Use Podman even if Docker is available
    #[arg(long, global = true, conflicts_with = "docker")]
    podman: bool,

    /// Use Docker even if Podman is available
    #[arg(long, global = true)]
    docker: bool,

    /// Log engine calls to stderr (-vv for everything)
    #[arg(short, long, global = true, action = ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create a sandbox and print its ID
    Init(CreateArgs),
    /// Sandbox lifecycle management
    #[command(subcommand)]
    Sandbox(SandboxCommands),
    /// File operations inside a sandbox
    #[command(subcommand)]
    Files(FilesCommands),
    /// Run a command inside a sandbox
    Exec(ExecArgs),
    #[command(flatten)]
    Process(ProcessCommands),
}

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    if let Err(e) = run(cli).await {
        eprintln!("{} {:#}", "Error:".red().bold(), e);
        process::exit(1);
    }
}

fn init_tracing(verbose: u8) {
    let filter = match verbose {
        0 => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        1 => EnvFilter::new("csbx_sandbox=debug,csbx=debug,warn"),
        _ => EnvFilter::new("debug"),
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let mut settings = SandboxSettings::from_env().context("invalid configuration")?;
    if cli.podman {
        settings = settings.with_engine(EngineChoice::Podman);
    } else if cli.docker {
        settings = settings.with_engine(EngineChoice::Docker);
    }

    let client = SandboxClient::connect(settings).await?;
    debug!(engine = %client.engine().kind(), "Connected to container engine");

    match cli.command {
        Commands::Init(args) => cli::sandbox::init(&client, args).await,
        Commands::Sandbox(command) => command.execute(&client).await,
        Commands::Files(command) => command.execute(&client).await,
        Commands::Exec(args) => cli::exec::exec(&client, args).await,
        Commands::Process(command) => command.execute(&client).await,
    }
}
