//! jobmill - durable background job engine
//!
//! Main entry point for the jobmill CLI and engine process.

mod cli;
mod cmd_jobs;
mod cmd_recurring;
mod demo;
mod engine;
mod server;

use clap::Parser;

use jobmill_config::ConfigLoader;

use crate::cli::{Cli, Commands};
use crate::engine::Engine;
use crate::server::{init_tracing, run_engine};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let mut config = ConfigLoader::load_or_default(&cli.config)?;
    init_tracing(&config.logging.resolved_dir(), config.logging.json)?;

    let command = cli.command.unwrap_or(Commands::Run {
        host: None,
        port: None,
        workers: None,
    });

    match command {
        Commands::Run {
            host,
            port,
            workers,
        } => {
            if let Some(host) = host {
                config.server.host = host;
            }
            if let Some(port) = port {
                config.server.port = port;
            }
            if let Some(workers) = workers {
                config.worker.count = workers;
            }
            run_engine(config).await
        }
        Commands::Enqueue { target } => {
            let engine = Engine::build(&config).await?;
            cmd_jobs::enqueue(&engine, &target).await
        }
        Commands::Schedule { target, delay_secs } => {
            let engine = Engine::build(&config).await?;
            cmd_jobs::schedule(&engine, &target, delay_secs).await
        }
        Commands::Continue { parent, target } => {
            let engine = Engine::build(&config).await?;
            cmd_jobs::continue_with(&engine, &parent, &target).await
        }
        Commands::Recurring { action } => {
            let engine = Engine::build(&config).await?;
            cmd_recurring::handle_recurring_command(&engine, action).await
        }
        Commands::Jobs { action } => {
            let engine = Engine::build(&config).await?;
            cmd_jobs::handle_jobs_command(&engine, action).await
        }
        Commands::Stats { format } => {
            let engine = Engine::build(&config).await?;
            cmd_jobs::stats(&engine, &format).await
        }
    }
}
