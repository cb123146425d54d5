use std::path::PathBuf;

use clap::{Parser, Subcommand};

mod commands;

#[derive(Parser)]
#[command(
    name = "connpool",
    about = "connpool: host-keyed connection pools with live statistics",
    version,
    propagate_version = true,
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Warm the pools described by a config file and print one stats document.
    Stats {
        /// Path to connpool.toml
        #[arg(short, long, default_value = "connpool.toml")]
        config: PathBuf,
        /// Runtime parameter override, e.g. `--set minSize=15`. Repeatable.
        #[arg(long = "set", value_name = "NAME=VALUE")]
        set: Vec<String>,
        /// How long to let warm-up establishments land before reading stats.
        #[arg(long, default_value_t = 500)]
        settle_ms: u64,
        /// Print single-line JSON instead of pretty JSON.
        #[arg(long)]
        compact: bool,
    },
    /// Run the pools with the refresher and log stats until Ctrl-C.
    Watch {
        /// Path to connpool.toml
        #[arg(short, long, default_value = "connpool.toml")]
        config: PathBuf,
        /// Runtime parameter override, e.g. `--set refreshRequirementMS=1000`.
        #[arg(long = "set", value_name = "NAME=VALUE")]
        set: Vec<String>,
        /// Seconds between stats log lines.
        #[arg(long, default_value_t = 10)]
        interval_secs: u64,
    },
    /// Write a starter connpool.toml for one replica set.
    Init {
        /// Output path
        #[arg(short, long, default_value = "connpool.toml")]
        output: PathBuf,
        /// Replica set name
        #[arg(long, default_value = "rs0")]
        group: String,
        /// Member hosts (`host:port`)
        #[arg(required = true)]
        hosts: Vec<String>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .or_else(|_| tracing_subscriber::EnvFilter::try_new("info,connpool=debug"))?,
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Stats {
            config,
            set,
            settle_ms,
            compact,
        } => commands::stats::stats(&config, &set, settle_ms, compact).await,
        Commands::Watch {
            config,
            set,
            interval_secs,
        } => commands::watch::watch(&config, &set, interval_secs).await,
        Commands::Init {
            output,
            group,
            hosts,
        } => commands::init(&output, &group, &hosts),
    }
}
