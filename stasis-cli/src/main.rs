// SPDX-License-Identifier: Apache-2.0
// Copyright 2026 Stasis Contributors

//! Stasis CLI
//!
//! Command-line interface for the stasis checkpoint/restore coordinator.

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use stasis_core::{ConfigLoader, StasisResult};

mod commands;

/// Stasis - checkpoint/restore orchestration for Linux processes
#[derive(Parser)]
#[command(name = "stasis")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Configuration file path
    #[arg(short, long, default_value = "stasis.yaml")]
    pub config: String,

    /// Enable verbose logging
    #[arg(short, long)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Checkpoint a running process tree into a snapshot archive.
    ///
    /// Captures the process's open writable files alongside the engine
    /// image set, records the result in the job index, and uploads the
    /// archive when a remote store is configured.
    Dump {
        /// PID of the process tree to checkpoint
        #[arg(short, long)]
        pid: i32,

        /// Job the checkpoint belongs to
        #[arg(short, long)]
        job: String,

        /// Directory to write the archive to (defaults to the configured
        /// checkpoint directory)
        #[arg(short, long)]
        dir: Option<PathBuf>,

        /// Co-checkpoint GPU state through the GPU agent
        #[arg(long)]
        gpu: bool,
    },

    /// Restore a process from a snapshot archive.
    ///
    /// With only a job id, restores that job's latest checkpoint; an
    /// explicit path or remote URI overrides it.
    Restore {
        /// Job whose latest checkpoint should be restored
        #[arg(short, long)]
        job: Option<String>,

        /// Archive path or remote checkpoint URI
        #[arg(short, long)]
        path: Option<String>,
    },

    /// Start a task under a shell and print its PID.
    Run {
        /// Command line to run
        task: String,
    },

    /// List recorded checkpoints for a job.
    Ps {
        /// Job to list
        job: String,
    },

    /// Probe the checkpoint engine and print its version.
    Check,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let log_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt().with_env_filter(log_level).init();

    let code = match run(cli).await {
        Ok(()) => 0,
        Err(e) => {
            tracing::error!(error = %e, "operation failed");
            e.exit_code()
        }
    };
    std::process::exit(code);
}

async fn run(cli: Cli) -> StasisResult<()> {
    let config = ConfigLoader::load_or_default(&cli.config)?;

    match cli.command {
        Commands::Dump { pid, job, dir, gpu } => {
            commands::dump::execute(config, pid, &job, dir, gpu).await
        }
        Commands::Restore { job, path } => commands::restore::execute(config, job, path).await,
        Commands::Run { task } => commands::run::execute(config, &task),
        Commands::Ps { job } => commands::ps::execute(config, &job),
        Commands::Check => commands::check::execute(config),
    }
}
