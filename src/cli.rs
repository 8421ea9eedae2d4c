//! CLI definitions for jobmill.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// jobmill CLI.
#[derive(Parser)]
#[command(name = "jobmill")]
#[command(about = "Durable background job engine")]
#[command(version)]
pub(crate) struct Cli {
    /// Configuration file path
    #[arg(short, long, default_value = "config/jobmill.toml", global = true, env = "JOBMILL_CONFIG")]
    pub config: PathBuf,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand)]
pub(crate) enum Commands {
    /// Run workers, scheduler and dashboard in the foreground (default)
    Run {
        /// Dashboard host (overrides the config file)
        #[arg(long)]
        host: Option<String>,

        /// Dashboard port (overrides the config file)
        #[arg(long)]
        port: Option<u16>,

        /// Number of workers (overrides the config file)
        #[arg(long)]
        workers: Option<usize>,
    },

    /// Enqueue a job for immediate execution
    Enqueue {
        #[command(flatten)]
        target: Target,
    },

    /// Schedule a job to run after a delay
    Schedule {
        #[command(flatten)]
        target: Target,

        /// Delay in seconds
        #[arg(long)]
        delay_secs: u64,
    },

    /// Add a job that runs once its parent succeeds
    Continue {
        /// Parent job id
        parent: String,

        #[command(flatten)]
        target: Target,
    },

    /// Recurring job management
    Recurring {
        #[command(subcommand)]
        action: RecurringAction,
    },

    /// Job inspection and operator actions
    Jobs {
        #[command(subcommand)]
        action: JobsAction,
    },

    /// Show per-state and per-queue counts
    Stats {
        /// Output format (table, json)
        #[arg(long, default_value = "table")]
        format: String,
    },
}

/// Operation to invoke and its arguments.
#[derive(clap::Args)]
pub(crate) struct Target {
    /// Operation as `capability.operation`
    pub operation: String,

    /// Arguments as a JSON object
    #[arg(long, default_value = "{}")]
    pub args: String,

    /// Queue (defaults to the operation's registered queue, then `default`)
    #[arg(long)]
    pub queue: Option<String>,
}

#[derive(Subcommand)]
pub(crate) enum RecurringAction {
    /// Add or update a recurring job
    Add {
        /// Recurring job id
        id: String,

        /// Cron expression, e.g. "*/5 * * * *" or "@hourly"
        cron: String,

        #[command(flatten)]
        target: Target,

        /// `UTC` or a fixed offset such as `+05:30`
        #[arg(long, default_value = "UTC")]
        timezone: String,
    },

    /// List recurring jobs
    List {
        /// Output format (table, json)
        #[arg(long, default_value = "table")]
        format: String,
    },

    /// Remove a recurring job
    Remove {
        /// Recurring job id
        id: String,
    },

    /// Enqueue a recurring job now, leaving its schedule untouched
    Trigger {
        /// Recurring job id
        id: String,
    },
}

#[derive(Subcommand)]
pub(crate) enum JobsAction {
    /// List jobs, most recently updated first
    List {
        /// Filter by state (scheduled, awaiting, enqueued, processing, succeeded, failed, deleted)
        #[arg(long)]
        state: Option<String>,

        /// Filter by queue
        #[arg(long)]
        queue: Option<String>,

        #[arg(long, default_value_t = 1)]
        page: u32,

        #[arg(long, default_value_t = 20)]
        per_page: u32,

        /// Output format (table, json)
        #[arg(long, default_value = "table")]
        format: String,
    },

    /// Show a job with its state history
    Show {
        /// Job id
        id: String,
    },

    /// Put a failed or scheduled job back on its queue
    Requeue {
        /// Job id
        id: String,
    },

    /// Delete a job
    Delete {
        /// Job id
        id: String,
    },
}
