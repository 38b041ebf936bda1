//! Definition inspection subcommands: validate, plan and handlers.

use std::path::Path;

use anyhow::{Context, Result, bail};
use comfy_table::{Cell, Color, ContentArrangement, Table, presets};
use console::style;
use serde::Serialize;

use stepweave_core::workflow::dag::{group_by_level, transitive_dependencies, validate as validate_dag};
use stepweave_core::workflow::definition::{load_workflow_file, read_workflow_file};
use stepweave_types::workflow::{StepDefinition, WorkflowDefinition};

use crate::builtins::BUILTIN_HANDLERS;

/// Report every validation problem in a workflow file.
///
/// Exits with an error when the definition is invalid so scripts can gate on it.
pub fn validate(file: &Path, json: bool) -> Result<()> {
    let def = read_workflow_file(file)
        .with_context(|| format!("Failed to read workflow file {}", file.display()))?;
    let report = validate_dag(&def);

    if json {
        let out = serde_json::json!({
            "workflow_id": def.id,
            "valid": report.valid,
            "steps": def.steps.len(),
            "errors": report.errors.iter().map(ToString::to_string).collect::<Vec<_>>(),
        });
        println!("{}", serde_json::to_string_pretty(&out)?);
    } else if report.valid {
        println!();
        println!(
            "  {} Workflow '{}' is valid ({} steps)",
            style("✓").green().bold(),
            style(&def.id).cyan(),
            def.steps.len()
        );
        println!();
    } else {
        println!();
        println!(
            "  {} Workflow '{}' has {} problem(s):",
            style("✗").red().bold(),
            style(&def.id).cyan(),
            report.errors.len()
        );
        for issue in &report.errors {
            println!("    {} {issue}", style("-").dim());
        }
        println!();
    }

    if !report.valid {
        bail!("workflow '{}' is invalid", def.id);
    }
    Ok(())
}

/// One row of `plan` output.
#[derive(Debug, Serialize)]
struct PlanRow {
    level: usize,
    step_id: String,
    kind: String,
    children: usize,
    depends_on: Vec<String>,
    transitive: Vec<String>,
    conditions: Vec<String>,
}

fn plan_rows(def: &WorkflowDefinition) -> Result<Vec<PlanRow>> {
    let levels = group_by_level(&def.steps)?;
    let rows = levels
        .iter()
        .enumerate()
        .flat_map(|(level, steps)| steps.iter().map(move |step| (level, *step)))
        .map(|(level, step): (usize, &StepDefinition)| PlanRow {
            level,
            step_id: step.id.clone(),
            kind: step.kind().to_string(),
            children: step.config.children().len(),
            depends_on: step.depends_on.clone(),
            transitive: transitive_dependencies(&step.id, &def.steps)
                .into_iter()
                .map(str::to_string)
                .collect(),
            conditions: step.conditions.clone(),
        })
        .collect();
    Ok(rows)
}

/// Show the dependency levels of a workflow.
///
/// Levels are diagnostic only: the scheduler launches a step as soon as its
/// own dependencies finish, not level by level.
pub fn plan(file: &Path, json: bool) -> Result<()> {
    let def = load_workflow_file(file)
        .with_context(|| format!("Failed to load workflow file {}", file.display()))?;
    let rows = plan_rows(&def)?;

    if json {
        let out = serde_json::json!({
            "workflow_id": def.id,
            "max_parallel_steps": def.max_parallel_steps,
            "steps": rows,
        });
        println!("{}", serde_json::to_string_pretty(&out)?);
        return Ok(());
    }

    println!();
    println!(
        "  {} {} ({} steps, up to {} in parallel)",
        style("Plan:").bold(),
        style(&def.name).cyan(),
        def.steps.len(),
        def.max_parallel_steps
    );
    println!();

    let mut table = Table::new();
    table
        .load_preset(presets::UTF8_FULL_CONDENSED)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(vec![
            Cell::new("Level").fg(Color::Cyan),
            Cell::new("Step").fg(Color::Cyan),
            Cell::new("Kind").fg(Color::Cyan),
            Cell::new("Depends On").fg(Color::Cyan),
            Cell::new("All Upstream").fg(Color::Cyan),
            Cell::new("Conditions").fg(Color::Cyan),
        ]);

    for row in &rows {
        let kind = if row.children > 0 {
            format!("{} ({})", row.kind, row.children)
        } else {
            row.kind.clone()
        };
        table.add_row(vec![
            Cell::new(row.level),
            Cell::new(&row.step_id),
            Cell::new(kind),
            Cell::new(dash_if_empty(&row.depends_on)),
            Cell::new(dash_if_empty(&row.transitive)),
            Cell::new(dash_if_empty(&row.conditions)),
        ]);
    }

    println!("{table}");
    println!();
    Ok(())
}

/// List the handlers `stepweave run` registers.
pub fn list_handlers(json: bool) -> Result<()> {
    if json {
        let out: Vec<_> = BUILTIN_HANDLERS
            .iter()
            .map(|(name, description)| serde_json::json!({"name": name, "description": description}))
            .collect();
        println!("{}", serde_json::to_string_pretty(&out)?);
        return Ok(());
    }

    let mut table = Table::new();
    table
        .load_preset(presets::UTF8_FULL_CONDENSED)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(vec![
            Cell::new("Handler").fg(Color::Cyan),
            Cell::new("Description").fg(Color::Cyan),
        ]);
    for (name, description) in BUILTIN_HANDLERS {
        table.add_row(vec![Cell::new(name), Cell::new(description)]);
    }
    println!();
    println!("{table}");
    println!();
    Ok(())
}

fn dash_if_empty(items: &[String]) -> String {
    if items.is_empty() {
        "-".to_string()
    } else {
        items.join(", ")
    }
}
