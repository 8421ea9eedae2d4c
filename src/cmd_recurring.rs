//! Recurring job subcommands.

use jobmill_core::RecurringOptions;

use crate::cli::RecurringAction;
use crate::cmd_jobs::parse_target;
use crate::engine::Engine;

/// Handle `recurring` subcommands.
pub(crate) async fn handle_recurring_command(
    engine: &Engine,
    action: RecurringAction,
) -> Result<(), Box<dyn std::error::Error>> {
    let dashboard = engine.dashboard();
    match action {
        RecurringAction::Add {
            id,
            cron,
            target,
            timezone,
        } => {
            let (invocation, options) = parse_target(&target)?;
            let options = RecurringOptions {
                queue: options.queue,
                timezone,
                ..Default::default()
            };
            let entry = engine
                .client
                .add_or_update_recurring(&id, &invocation, &cron, options)
                .await?;
            match entry.next_fire {
                Some(next) => println!("Recurring job {} saved, next run at {}", entry.id, next),
                None => println!("Recurring job {} saved, no future occurrence", entry.id),
            }
            Ok(())
        }
        RecurringAction::List { format } => {
            let entries = dashboard.list_recurring().await?;
            if format == "json" {
                println!("{}", serde_json::to_string_pretty(&entries)?);
                return Ok(());
            }
            if entries.is_empty() {
                println!("No recurring jobs.");
                return Ok(());
            }

            println!(
                "{:<24} {:<16} {:<8} {:<24} {:<20} {}",
                "ID", "CRON", "TZ", "OPERATION", "NEXT RUN", "LAST RUN"
            );
            println!("{}", "-".repeat(120));
            for entry in entries {
                let fmt = |at: Option<chrono::DateTime<chrono::Utc>>| {
                    at.map(|at| at.format("%Y-%m-%d %H:%M:%S").to_string())
                        .unwrap_or_else(|| "-".to_string())
                };
                println!(
                    "{:<24} {:<16} {:<8} {:<24} {:<20} {}",
                    entry.id,
                    entry.cron,
                    entry.timezone,
                    entry.display_name,
                    fmt(entry.next_fire),
                    fmt(entry.last_fired)
                );
                if let Some(error) = entry.last_error {
                    println!("{:<24} error: {}", "", error);
                }
            }
            Ok(())
        }
        RecurringAction::Remove { id } => {
            dashboard.remove_recurring(&id).await?;
            println!("Recurring job {} removed", id);
            Ok(())
        }
        RecurringAction::Trigger { id } => {
            let job_id = dashboard.trigger_recurring(&id).await?;
            println!("Recurring job {} triggered as {}", id, job_id);
            Ok(())
        }
    }
}
