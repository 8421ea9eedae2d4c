//! Demo capabilities registered by the binary.

use std::time::Duration;

use serde::Deserialize;
use serde_json::{Value, json};
use tracing::{error, info, warn};

use jobmill_core::CapabilityRegistry;
use jobmill_protocols::{JobContext, JobError};

#[derive(Debug, Deserialize)]
struct Simple {
    message: String,
}

#[derive(Debug, Deserialize)]
struct WithRetry {
    /// Attempt number of the first run; later runs count up from it.
    #[serde(default = "first_attempt")]
    attempt_number: u32,
}

fn first_attempt() -> u32 {
    1
}

#[derive(Debug, Deserialize)]
struct LongRunning {
    duration_secs: u64,
}

#[derive(Debug, Deserialize)]
struct ProcessData {
    data: String,
}

#[derive(Debug, Deserialize)]
struct SendEmail {
    recipient: String,
    subject: String,
}

/// Register the `demo.*` and `echo.echo` operations.
pub(crate) fn register_demo_capabilities(registry: &CapabilityRegistry) -> Result<(), JobError> {
    registry.register("demo", "simple", simple)?;
    registry.register("demo", "with_retry", with_retry)?;
    registry.register("demo", "long_running", long_running)?;
    registry.register("demo", "process_data", process_data)?;
    registry.register("demo", "send_email", send_email)?;
    registry.register("echo", "echo", echo)?;
    Ok(())
}

async fn simple(args: Simple, ctx: JobContext) -> Result<(), JobError> {
    info!("[simple] job {} executing: {}", ctx.job_id, args.message);
    tokio::time::sleep(Duration::from_secs(1)).await;
    info!("[simple] job {} completed", ctx.job_id);
    Ok(())
}

async fn with_retry(args: WithRetry, ctx: JobContext) -> Result<u32, JobError> {
    let attempt = args.attempt_number.saturating_add(ctx.attempt.saturating_sub(1));
    warn!("[with_retry] job {} attempt #{}", ctx.job_id, attempt);

    if attempt < 3 {
        error!("[with_retry] simulating failure on attempt #{}", attempt);
        return Err(JobError::Payload(format!(
            "Simulated failure on attempt {}",
            attempt
        )));
    }

    tokio::time::sleep(Duration::from_millis(500)).await;
    info!("[with_retry] job {} succeeded on attempt #{}", ctx.job_id, attempt);
    Ok(attempt)
}

async fn long_running(args: LongRunning, ctx: JobContext) -> Result<u64, JobError> {
    info!(
        "[long_running] job {} running for {} seconds",
        ctx.job_id, args.duration_secs
    );

    for elapsed in 1..=args.duration_secs {
        tokio::select! {
            _ = ctx.cancellation.cancelled() => {
                warn!("[long_running] job {} cancelled after {}s", ctx.job_id, elapsed - 1);
                return Err(JobError::Cancelled);
            }
            _ = tokio::time::sleep(Duration::from_secs(1)) => {}
        }
        ctx.heartbeat().await?;
        info!(
            "[long_running] progress: {}/{} seconds elapsed",
            elapsed, args.duration_secs
        );
    }

    info!("[long_running] job {} completed", ctx.job_id);
    Ok(args.duration_secs)
}

async fn process_data(args: ProcessData, ctx: JobContext) -> Result<String, JobError> {
    info!("[process_data] job {} received: {}", ctx.job_id, args.data);
    tokio::time::sleep(Duration::from_secs(2)).await;

    let processed = args.data.to_uppercase();
    info!("[process_data] processed: {}", processed);

    tokio::time::sleep(Duration::from_secs(1)).await;
    ctx.check_cancelled()?;
    info!("[process_data] job {} persisted", ctx.job_id);
    Ok(processed)
}

async fn send_email(args: SendEmail, ctx: JobContext) -> Result<Value, JobError> {
    info!(
        "[send_email] job {} to: {}, subject: {}",
        ctx.job_id, args.recipient, args.subject
    );
    tokio::time::sleep(Duration::from_millis(1500)).await;
    info!("[send_email] job {} sent", ctx.job_id);
    Ok(json!({ "recipient": args.recipient, "subject": args.subject }))
}

async fn echo(args: Simple, _ctx: JobContext) -> Result<String, JobError> {
    Ok(args.message)
}
