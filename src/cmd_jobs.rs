//! Job submission and inspection subcommands.

use std::time::Duration;

use serde_json::Value;

use jobmill_core::EnqueueOptions;
use jobmill_dashboard::Dashboard;
use jobmill_protocols::{Invocation, JobId, JobRecord, Page, StateName};

use crate::cli::{JobsAction, Target};
use crate::engine::Engine;

type CmdResult = Result<(), Box<dyn std::error::Error>>;

/// Split `capability.operation` and parse the JSON arguments.
pub(crate) fn parse_target(target: &Target) -> Result<(Invocation, EnqueueOptions), Box<dyn std::error::Error>> {
    let (capability, operation) = target
        .operation
        .split_once('.')
        .filter(|(c, o)| !c.is_empty() && !o.is_empty())
        .ok_or_else(|| {
            format!(
                "operation must be `capability.operation`, got {:?}",
                target.operation
            )
        })?;
    let args: Value = serde_json::from_str(&target.args)
        .map_err(|e| format!("--args is not valid JSON: {}", e))?;
    let options = EnqueueOptions {
        queue: target.queue.clone(),
        ..Default::default()
    };
    Ok((Invocation::new(capability, operation, args), options))
}

pub(crate) fn parse_job_id(id: &str) -> Result<JobId, Box<dyn std::error::Error>> {
    id.parse()
        .map_err(|e| format!("invalid job id {:?}: {}", id, e).into())
}

pub(crate) async fn enqueue(engine: &Engine, target: &Target) -> CmdResult {
    let (invocation, options) = parse_target(target)?;
    let id = engine.client.enqueue_invocation(&invocation, options).await?;
    println!("Enqueued {} as {}", invocation.display_name(), id);
    Ok(())
}

pub(crate) async fn schedule(engine: &Engine, target: &Target, delay_secs: u64) -> CmdResult {
    let (invocation, options) = parse_target(target)?;
    let id = engine
        .client
        .schedule(&invocation, Duration::from_secs(delay_secs), options)
        .await?;
    println!(
        "Scheduled {} as {} to run in {}s",
        invocation.display_name(),
        id,
        delay_secs
    );
    Ok(())
}

pub(crate) async fn continue_with(engine: &Engine, parent: &str, target: &Target) -> CmdResult {
    let parent = parse_job_id(parent)?;
    let (invocation, options) = parse_target(target)?;
    let id = engine
        .client
        .continue_with(&parent, &invocation, options)
        .await?;
    println!(
        "Added {} as {}, waiting for {}",
        invocation.display_name(),
        id,
        parent
    );
    Ok(())
}

/// Handle `jobs` subcommands.
pub(crate) async fn handle_jobs_command(engine: &Engine, action: JobsAction) -> CmdResult {
    let dashboard = engine.dashboard();
    match action {
        JobsAction::List {
            state,
            queue,
            page,
            per_page,
            format,
        } => jobs_list(&dashboard, state, queue, page, per_page, &format).await,
        JobsAction::Show { id } => {
            let record = dashboard.get_job(&parse_job_id(&id)?).await?;
            print_job(&record)
        }
        JobsAction::Requeue { id } => {
            let record = dashboard.requeue(&parse_job_id(&id)?).await?;
            println!("Job {} requeued on {}", record.id, record.queue);
            Ok(())
        }
        JobsAction::Delete { id } => {
            let record = dashboard.delete(&parse_job_id(&id)?).await?;
            println!("Job {} deleted", record.id);
            Ok(())
        }
    }
}

async fn jobs_list(
    dashboard: &Dashboard,
    state: Option<String>,
    queue: Option<String>,
    page: u32,
    per_page: u32,
    format: &str,
) -> CmdResult {
    let state = state
        .as_deref()
        .map(str::parse::<StateName>)
        .transpose()?;
    let listing = dashboard
        .list_jobs(state, queue.as_deref(), Page::new(page, per_page))
        .await?;

    if format == "json" {
        println!("{}", serde_json::to_string_pretty(&listing)?);
        return Ok(());
    }

    if listing.jobs.is_empty() {
        println!("No jobs found.");
        return Ok(());
    }

    println!(
        "{:<36}  {:<24} {:<12} {:<11} {:>8}  {}",
        "ID", "NAME", "QUEUE", "STATE", "ATTEMPTS", "UPDATED"
    );
    println!("{}", "-".repeat(120));
    for job in &listing.jobs {
        println!(
            "{:<36}  {:<24} {:<12} {:<11} {:>8}  {}",
            job.id,
            job.display_name,
            job.queue,
            job.state.as_str(),
            job.attempts,
            job.updated_at.format("%Y-%m-%d %H:%M:%S")
        );
    }
    println!(
        "\nPage {} ({} per page), {} jobs total",
        listing.page, listing.per_page, listing.total
    );
    Ok(())
}

fn print_job(record: &JobRecord) -> CmdResult {
    println!("Job {}", record.id);
    println!("  Operation: {}", record.display_name);
    println!("  Queue:     {}", record.queue);
    println!("  State:     {}", record.state_name());
    println!("  Attempts:  {}", record.attempts);
    println!("  Created:   {}", record.created_at);
    if let Some(parent) = &record.parent {
        println!("  Parent:    {}", parent);
    }
    if !record.continuations.is_empty() {
        let children: Vec<String> = record.continuations.iter().map(JobId::to_string).collect();
        println!("  Continuations: {}", children.join(", "));
    }
    if !record.parameters.is_empty() {
        println!("  Parameters: {}", serde_json::to_string(&record.parameters)?);
    }
    println!("  Arguments: {}", record.payload.to_text());

    println!("\nHistory:");
    for entry in &record.history {
        let mut detail = serde_json::to_value(&entry.state)?;
        if let Value::Object(map) = &mut detail {
            map.remove("state");
        }
        print!(
            "  {}  {:<11}",
            entry.recorded_at.format("%Y-%m-%d %H:%M:%S%.3f"),
            entry.state.name().as_str()
        );
        if detail.as_object().is_some_and(|m| !m.is_empty()) {
            print!(" {}", detail);
        }
        match &entry.reason {
            Some(reason) => println!(" ({})", reason),
            None => println!(),
        }
    }
    Ok(())
}

/// Print per-state and per-queue counts.
pub(crate) async fn stats(engine: &Engine, format: &str) -> CmdResult {
    let stats = engine.dashboard().stats().await?;

    if format == "json" {
        println!("{}", serde_json::to_string_pretty(&stats)?);
        return Ok(());
    }

    println!("{:<12} {:>8}", "STATE", "JOBS");
    println!("{}", "-".repeat(21));
    for (state, count) in &stats.states {
        println!("{:<12} {:>8}", state.as_str(), count);
    }
    println!("{:<12} {:>8}", "total", stats.total);

    println!("\n{:<20} {:>8}", "QUEUE", "READY");
    println!("{}", "-".repeat(29));
    for queue in &stats.queues {
        println!("{:<20} {:>8}", queue.name, queue.enqueued);
    }
    println!("\nRecurring jobs: {}", stats.recurring);
    Ok(())
}
