//! `stepweave run`: execute a workflow file with the built-in handlers.
//!
//! Progress is streamed from the engine's event bus while the run is in
//! flight. Ctrl+C cancels the run and still prints the final report.

use std::collections::HashSet;
use std::path::Path;

use anyhow::{Context, Result, bail};
use comfy_table::{Cell, Color, ContentArrangement, Table, presets};
use console::style;
use serde_json::{Map, Value, json};
use tokio::sync::broadcast;
use uuid::Uuid;

use stepweave_core::config::{CONFIG_FILE_NAME, load_engine_config};
use stepweave_core::workflow::definition::load_workflow_file;
use stepweave_core::{RunOptions, WorkflowEngine, WorkflowExecution};
use stepweave_types::event::WorkflowEvent;
use stepweave_types::workflow::{StepExecutionRecord, StepStatus, WorkflowStatus};

use super::RunArgs;
use crate::builtins::register_builtins;

pub async fn run_workflow(
    args: RunArgs,
    config_path: Option<&Path>,
    json: bool,
    quiet: bool,
) -> Result<()> {
    let definition = load_workflow_file(&args.file)
        .with_context(|| format!("Failed to load workflow file {}", args.file.display()))?;
    let config = load_engine_config(config_path.unwrap_or(Path::new(CONFIG_FILE_NAME))).await;

    let engine = WorkflowEngine::new(config);
    register_builtins(engine.handlers());

    let inputs: Map<String, Value> = args.inputs.into_iter().collect();
    let options = args
        .vars
        .into_iter()
        .fold(RunOptions::default(), |options, (key, value)| {
            options.with_variable(key, value)
        });

    // Subscribe before starting so no early event is missed.
    let events = engine.subscribe();
    let handle = engine.start_with(definition, inputs, options)?;
    let run_id = handle.run_id();

    let follower = tokio::spawn(follow_events(
        engine.clone(),
        events,
        run_id,
        args.approve.into_iter().collect(),
        !json && !quiet,
    ));

    let wait = handle.wait();
    tokio::pin!(wait);
    let finished = tokio::select! {
        result = &mut wait => Some(result),
        Ok(()) = tokio::signal::ctrl_c() => None,
    };
    let execution = match finished {
        Some(result) => result?,
        None => {
            if !quiet {
                eprintln!("  {} Cancelling run {run_id}...", style("!").yellow().bold());
            }
            engine.cancel(run_id);
            wait.await?
        }
    };

    // The terminal event is already on the bus; let the follower drain it.
    if let Err(e) = follower.await {
        tracing::debug!(error = %e, "event follower ended abnormally");
    }

    if json {
        println!("{}", serde_json::to_string_pretty(&execution)?);
    } else if !quiet {
        print_report(&execution);
    }

    if !execution.is_success() {
        bail!(
            "workflow '{}' {}: {}",
            execution.workflow_id,
            execution.status,
            execution.error.as_deref().unwrap_or("no error recorded")
        );
    }
    Ok(())
}

/// Print progress for `run_id` until its terminal event, approving any
/// HUMAN step listed in `approve`.
async fn follow_events(
    engine: WorkflowEngine,
    mut events: broadcast::Receiver<WorkflowEvent>,
    run_id: Uuid,
    approve: HashSet<String>,
    print: bool,
) {
    loop {
        let event = match events.recv().await {
            Ok(event) => event,
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                tracing::warn!(skipped, "progress display fell behind the event bus");
                continue;
            }
            Err(broadcast::error::RecvError::Closed) => return,
        };
        if event.run_id() != run_id {
            continue;
        }

        if let WorkflowEvent::StepWaiting { step_id, .. } = &event {
            if approve.contains(step_id) {
                let mut outputs = Map::new();
                outputs.insert("approved".into(), json!(true));
                outputs.insert("approved_by".into(), json!("cli"));
                if let Err(e) = engine.resume(run_id, step_id, outputs) {
                    tracing::warn!(step_id = %step_id, error = %e, "auto-approval failed");
                }
            }
        }

        if print {
            if let Some(line) = progress_line(&event, &approve) {
                println!("{line}");
            }
        }

        if is_terminal(&event) {
            return;
        }
    }
}

fn is_terminal(event: &WorkflowEvent) -> bool {
    matches!(
        event,
        WorkflowEvent::WorkflowCompleted { .. }
            | WorkflowEvent::WorkflowFailed { .. }
            | WorkflowEvent::WorkflowError { .. }
            | WorkflowEvent::WorkflowCancelled { .. }
    )
}

/// Styled one-line rendering of a progress event.
fn progress_line(event: &WorkflowEvent, approve: &HashSet<String>) -> Option<String> {
    let line = match event {
        WorkflowEvent::WorkflowStarted {
            workflow_id,
            total_steps,
            run_id,
        } => format!(
            "  {} {} ({total_steps} steps, run {run_id})",
            style("▶").cyan().bold(),
            style(workflow_id).cyan()
        ),
        WorkflowEvent::StepStarted {
            step_id, step_kind, ..
        } => format!(
            "    {} {step_id} {}",
            style("·").dim(),
            style(format!("[{step_kind}]")).dim()
        ),
        WorkflowEvent::StepCompleted {
            step_id,
            duration_ms,
            ..
        } => format!(
            "    {} {step_id} {}",
            style("✓").green(),
            style(format!("{duration_ms}ms")).dim()
        ),
        WorkflowEvent::StepFailed { step_id, error, .. } => {
            format!("    {} {step_id}: {}", style("✗").red(), style(error).red())
        }
        WorkflowEvent::StepRetrying {
            step_id,
            attempt,
            delay_ms,
            error,
            ..
        } => format!(
            "    {} {step_id} attempt {attempt} failed ({error}), retrying in {delay_ms}ms",
            style("↻").yellow()
        ),
        WorkflowEvent::StepSkipped {
            step_id, reason, ..
        } => format!(
            "    {} {step_id} {}",
            style("-").dim(),
            style(format!("skipped: {reason}")).dim()
        ),
        WorkflowEvent::StepWaiting {
            step_id, prompt, ..
        } => {
            let note = if approve.contains(step_id) {
                "auto-approved".to_string()
            } else {
                "waiting for input (Ctrl+C to cancel)".to_string()
            };
            match prompt {
                Some(prompt) => format!("    {} {step_id}: {prompt} [{note}]", style("?").magenta()),
                None => format!("    {} {step_id} [{note}]", style("?").magenta()),
            }
        }
        // The final report covers terminal events.
        _ => return None,
    };
    Some(line)
}

fn print_report(execution: &WorkflowExecution) {
    println!();
    let mut table = Table::new();
    table
        .load_preset(presets::UTF8_FULL_CONDENSED)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(vec![
            Cell::new("Step").fg(Color::Cyan),
            Cell::new("Status").fg(Color::Cyan),
            Cell::new("Retries").fg(Color::Cyan),
            Cell::new("Duration").fg(Color::Cyan),
            Cell::new("Detail").fg(Color::Cyan),
        ]);

    // Definition order reads better than the record map's id order.
    for step in &execution.definition.steps {
        let Some(record) = execution.record(&step.id) else {
            continue;
        };
        table.add_row(vec![
            Cell::new(&record.step_id),
            status_cell(record.status),
            Cell::new(record.retry_count),
            Cell::new(
                record
                    .duration_ms()
                    .map_or_else(|| "-".to_string(), |ms| format!("{ms}ms")),
            ),
            Cell::new(record_detail(record)),
        ]);
    }
    println!("{table}");
    println!();

    let status = match execution.status {
        WorkflowStatus::Completed => style(execution.status.to_string()).green().bold(),
        WorkflowStatus::Cancelled => style(execution.status.to_string()).yellow().bold(),
        _ => style(execution.status.to_string()).red().bold(),
    };
    println!(
        "  {} {} in {}",
        style(&execution.workflow_id).cyan(),
        status,
        execution
            .duration_ms()
            .map_or_else(|| "-".to_string(), |ms| format!("{ms}ms"))
    );
    println!(
        "  {} completed, {} failed, {} skipped",
        execution.completed_steps.len(),
        execution.failed_steps.len(),
        execution.skipped_steps.len()
    );
    if let Some(error) = &execution.error {
        println!("  {} {error}", style("Error:").red().bold());
    }
    println!();
}

fn status_cell(status: StepStatus) -> Cell {
    let color = match status {
        StepStatus::Completed => Color::Green,
        StepStatus::Failed => Color::Red,
        StepStatus::Skipped => Color::DarkGrey,
        StepStatus::Running => Color::Yellow,
        StepStatus::Pending => Color::Reset,
    };
    Cell::new(status).fg(color)
}

const DETAIL_WIDTH: usize = 60;

/// Error for failed steps, otherwise a compact preview of the output.
fn record_detail(record: &StepExecutionRecord) -> String {
    if let Some(error) = &record.error {
        return error.clone();
    }
    let Some(output) = &record.output else {
        return "-".to_string();
    };
    let text = output.to_string();
    if text.chars().count() > DETAIL_WIDTH {
        let cut: String = text.chars().take(DETAIL_WIDTH - 1).collect();
        format!("{cut}…")
    } else {
        text
    }
}
