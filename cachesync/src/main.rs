mod commands;
mod formatting;

use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing::Level;
use tracing_subscriber::EnvFilter;

use commands::{parse_env, CacheSpec, Context};

#[derive(Parser)]
#[command(name = "cachesync")]
#[command(version)]
#[command(about = "Persist build cache directories in an OCI registry")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file [default: <config dir>/cachesync/config.toml]
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Pipeline namespace for remote keys [default: current directory name]
    #[arg(long, global = true)]
    pipeline: Option<String>,

    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[arg(short, long, action, global = true)]
    quiet: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the remote address of a cache key
    Address {
        key: String,
        /// Qualify the key with a platform, e.g. linux/amd64
        #[arg(long)]
        platform: Option<String>,
    },
    /// Check whether a cache key exists remotely
    Probe {
        key: String,
        #[arg(long)]
        platform: Option<String>,
    },
    /// Replace the contents of a directory with a remote cache
    Pull {
        key: String,
        dir: PathBuf,
        #[arg(long)]
        platform: Option<String>,
    },
    /// Upload the contents of a directory as a remote cache
    Push {
        key: String,
        dir: PathBuf,
        #[arg(long)]
        platform: Option<String>,
    },
    /// Run a command with remote-backed cache volumes
    Run {
        /// Cache to mount, PATH=KEY[,platform][,force][,expand][,dir][,owner=UID:GID]
        #[arg(long = "cache", value_name = "SPEC")]
        caches: Vec<CacheSpec>,
        /// Environment variable of the command, NAME=VALUE
        #[arg(short, long, value_parser = parse_env)]
        env: Vec<(String, String)>,
        /// Engine state directory [default: <cache dir>/cachesync]
        #[arg(long)]
        state: Option<PathBuf>,
        /// Keep the step filesystem after the run
        #[arg(long, action)]
        keep: bool,
        #[arg(last = true, required = true)]
        command: Vec<String>,
    },
    /// Show the effective configuration
    Config,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_level = if cli.quiet {
        Level::ERROR
    } else {
        match cli.verbose {
            0 => Level::WARN,
            1 => Level::INFO,
            2 => Level::DEBUG,
            _ => Level::TRACE,
        }
    };

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(log_level.as_str().to_ascii_lowercase()));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let ctx = Context::load(cli.config, cli.pipeline, cli.quiet)?;

    match cli.command {
        Commands::Address { key, platform } => commands::cmd_address(&ctx, key, platform)?,
        Commands::Probe { key, platform } => commands::cmd_probe(&ctx, key, platform)?,
        Commands::Pull { key, dir, platform } => commands::cmd_pull(&ctx, key, dir, platform)?,
        Commands::Push { key, dir, platform } => commands::cmd_push(&ctx, key, dir, platform)?,
        Commands::Run {
            caches,
            env,
            state,
            keep,
            command,
        } => commands::cmd_run(&ctx, caches, env, state, keep, command)?,
        Commands::Config => commands::cmd_config(&ctx)?,
    }

    Ok(())
}
