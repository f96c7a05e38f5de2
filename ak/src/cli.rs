//! CLI command definitions

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// AgentKit - host-resident orchestration runtime for AI agents
#[derive(Parser)]
#[command(
    name = "ak",
    about = "Orchestrates long-lived AI agent tasks on this machine",
    version
)]
pub struct Cli {
    /// Path to config file
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Command,
}

/// CLI subcommands
#[derive(Subcommand)]
pub enum Command {
    /// Run the daemon in the foreground
    Serve,

    /// Submit a task to a running daemon
    Submit {
        /// The task prompt
        prompt: String,

        /// Runner: embedded, external-cli, or auto
        #[arg(short, long, default_value = "auto")]
        runner: String,

        /// Priority: low, normal, or high
        #[arg(short, long, default_value = "normal")]
        priority: String,

        /// Daemon base URL
        #[arg(long, default_value = "http://127.0.0.1:7431")]
        server: String,
    },

    /// Show one task (or all tasks) from a running daemon
    Status {
        /// Task id; omit to list everything
        task_id: Option<String>,

        /// Daemon base URL
        #[arg(long, default_value = "http://127.0.0.1:7431")]
        server: String,
    },

    /// Cancel a task on a running daemon
    Cancel {
        task_id: String,

        /// Daemon base URL
        #[arg(long, default_value = "http://127.0.0.1:7431")]
        server: String,
    },

    /// Sweep idle terminal worktrees on a running daemon
    Gc {
        /// Override the configured idle age in seconds
        #[arg(long)]
        older_than_secs: Option<u64>,

        /// Daemon base URL
        #[arg(long, default_value = "http://127.0.0.1:7431")]
        server: String,
    },

    /// List or resolve pending approvals on a running daemon
    Approvals {
        /// Approve this request id
        #[arg(long, conflicts_with = "deny")]
        approve: Option<String>,

        /// Deny this request id
        #[arg(long)]
        deny: Option<String>,

        /// Daemon base URL
        #[arg(long, default_value = "http://127.0.0.1:7431")]
        server: String,
    },
}
