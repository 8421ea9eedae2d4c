//! Tracing setup and the long-running `run` command.

use std::path::Path;
use std::sync::Arc;

use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use jobmill_config::{Config, ConfigValidator};
use jobmill_dashboard::{DashboardConfig, DashboardServer};
use jobmill_scheduler::Scheduler;
use jobmill_workqueue::WorkerPool;

use crate::engine::{Engine, register_recurring, scheduler_config, worker_config};

/// Initialize tracing with console and daily-rotated file output.
pub(crate) fn init_tracing(log_dir: &Path, json: bool) -> Result<(), Box<dyn std::error::Error>> {
    std::fs::create_dir_all(log_dir)?;

    let file_appender = RollingFileAppender::builder()
        .rotation(Rotation::DAILY)
        .filename_prefix("jobmill")
        .filename_suffix("log")
        .max_log_files(30)
        .build(log_dir)?;

    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    // Dropping the guard stops the background writer.
    static GUARD: std::sync::OnceLock<tracing_appender::non_blocking::WorkerGuard> =
        std::sync::OnceLock::new();
    let _ = GUARD.set(guard);

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let (text_file, json_file) = if json {
        (None, Some(fmt::layer().json().with_writer(non_blocking)))
    } else {
        (
            Some(fmt::layer().with_writer(non_blocking).with_ansi(false)),
            None,
        )
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt::layer().with_target(true).with_ansi(true))
        .with(text_file)
        .with(json_file)
        .init();

    Ok(())
}

/// Run workers, scheduler and dashboard until Ctrl-C.
pub(crate) async fn run_engine(config: Config) -> Result<(), Box<dyn std::error::Error>> {
    info!("Starting jobmill v{}", env!("CARGO_PKG_VERSION"));

    let warnings = ConfigValidator::validate(&config)?.into_result()?;
    for warning in warnings {
        warn!("Config {}: {}", warning.path, warning.message);
    }

    let engine = Engine::build(&config).await?;
    register_recurring(&engine.client, &config.recurring).await?;

    let shutdown = CancellationToken::new();
    let mut tasks = JoinSet::new();

    let pool = Arc::new(WorkerPool::new(engine.state.clone(), worker_config(&config)));
    tasks.spawn(pool.clone().run(shutdown.clone()));

    if config.scheduler.enabled {
        let scheduler = Arc::new(Scheduler::new(
            engine.state.clone(),
            scheduler_config(&config),
        ));
        tasks.spawn(scheduler.run(shutdown.clone()));
    } else {
        info!("Scheduler disabled; delayed and recurring jobs will not fire from this process");
    }

    if config.server.enabled {
        let server = DashboardServer::new(
            DashboardConfig::new(config.server.host.clone(), config.server.port),
            Arc::new(engine.dashboard()),
        );
        let token = shutdown.clone();
        tasks.spawn(async move {
            if let Err(e) = server.run(token).await {
                error!("Dashboard server failed: {}", e);
            }
        });
    }

    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received");
    shutdown.cancel();

    while let Some(result) = tasks.join_next().await {
        if let Err(e) = result {
            error!("Engine task ended abnormally: {}", e);
        }
    }

    info!("jobmill stopped ({:?})", pool.stats());
    Ok(())
}
