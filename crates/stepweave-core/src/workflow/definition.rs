//! Workflow definition parsing, filesystem operations, and template instantiation.
//!
//! Converts between YAML/JSON files and the canonical `WorkflowDefinition`,
//! runs the dependency validator on everything it loads, and provides
//! discovery for workflow files on disk.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use stepweave_types::workflow::{StepConfig, StepDefinition, WorkflowDefinition};
use thiserror::Error;

use super::dag::{ValidationIssue, ValidationReport, validate};

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Errors that can occur while loading, saving or deriving definitions.
///
/// A validation report with a single issue is surfaced through the matching
/// specific variant; reports with several issues are kept whole in `Invalid`.
#[derive(Debug, Error)]
pub enum WorkflowError {
    /// YAML/JSON parse failure.
    #[error("parse error: {0}")]
    ParseError(String),

    /// Structural validation failure.
    #[error("validation error: {0}")]
    ValidationError(String),

    /// Filesystem I/O failure.
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    /// Dependency graph contains a cycle.
    #[error("cycle detected: {}", .0.join(" -> "))]
    CycleDetected(Vec<String>),

    /// A step references an unknown dependency.
    #[error("step '{step_id}' depends on unknown step '{dependency}'")]
    UnknownDependency { step_id: String, dependency: String },

    #[error("duplicate step ID: '{0}'")]
    DuplicateStep(String),

    #[error("invalid workflow definition: {0}")]
    Invalid(ValidationReport),
}

impl From<ValidationReport> for WorkflowError {
    fn from(report: ValidationReport) -> Self {
        if report.errors.len() != 1 {
            return WorkflowError::Invalid(report);
        }
        match &report.errors[0] {
            ValidationIssue::Cycle { path } => WorkflowError::CycleDetected(path.clone()),
            ValidationIssue::SelfDependency { step_id } => {
                WorkflowError::CycleDetected(vec![step_id.clone(), step_id.clone()])
            }
            ValidationIssue::UnknownDependency {
                step_id,
                dependency,
            } => WorkflowError::UnknownDependency {
                step_id: step_id.clone(),
                dependency: dependency.clone(),
            },
            ValidationIssue::DuplicateStep { step_id } => {
                WorkflowError::DuplicateStep(step_id.clone())
            }
            other => WorkflowError::ValidationError(other.to_string()),
        }
    }
}

/// Run the validator and turn an invalid report into an error.
pub fn validate_definition(def: &WorkflowDefinition) -> Result<(), WorkflowError> {
    let report = validate(def);
    if report.valid {
        Ok(())
    } else {
        Err(report.into())
    }
}

// ---------------------------------------------------------------------------
// Parsing
// ---------------------------------------------------------------------------

/// Parse a YAML string into a validated `WorkflowDefinition`.
pub fn parse_workflow_yaml(yaml: &str) -> Result<WorkflowDefinition, WorkflowError> {
    let def: WorkflowDefinition =
        serde_yaml_ng::from_str(yaml).map_err(|e| WorkflowError::ParseError(e.to_string()))?;
    validate_definition(&def)?;
    Ok(def)
}

/// Parse a JSON string into a validated `WorkflowDefinition`.
pub fn parse_workflow_json(json: &str) -> Result<WorkflowDefinition, WorkflowError> {
    let def: WorkflowDefinition =
        serde_json::from_str(json).map_err(|e| WorkflowError::ParseError(e.to_string()))?;
    validate_definition(&def)?;
    Ok(def)
}

/// Serialize a `WorkflowDefinition` to a YAML string.
pub fn serialize_workflow_yaml(def: &WorkflowDefinition) -> Result<String, WorkflowError> {
    serde_yaml_ng::to_string(def).map_err(|e| WorkflowError::ParseError(e.to_string()))
}

// ---------------------------------------------------------------------------
// Filesystem operations
// ---------------------------------------------------------------------------

fn is_json(path: &Path) -> bool {
    path.extension().is_some_and(|ext| ext == "json")
}

/// Read a definition from a YAML or `.json` file without validating it.
///
/// Useful for reporting every validation issue; use `load_workflow_file`
/// for anything that will be executed.
pub fn read_workflow_file(path: &Path) -> Result<WorkflowDefinition, WorkflowError> {
    let content = std::fs::read_to_string(path)?;
    if is_json(path) {
        serde_json::from_str(&content).map_err(|e| WorkflowError::ParseError(e.to_string()))
    } else {
        serde_yaml_ng::from_str(&content).map_err(|e| WorkflowError::ParseError(e.to_string()))
    }
}

/// Load and validate a workflow definition from a YAML or `.json` file.
pub fn load_workflow_file(path: &Path) -> Result<WorkflowDefinition, WorkflowError> {
    let def = read_workflow_file(path)?;
    validate_definition(&def)?;
    Ok(def)
}

/// Save a workflow definition, as JSON for `.json` paths and YAML otherwise.
///
/// Creates parent directories if they don't exist.
pub fn save_workflow_file(path: &Path, def: &WorkflowDefinition) -> Result<(), WorkflowError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let content = if is_json(path) {
        serde_json::to_string_pretty(def).map_err(|e| WorkflowError::ParseError(e.to_string()))?
    } else {
        serialize_workflow_yaml(def)?
    };
    std::fs::write(path, content)?;
    Ok(())
}

/// Discover all workflow YAML files under `base_dir`.
///
/// Scans for `.yaml` and `.yml` files recursively, sorted by path. Files that
/// fail to parse or validate are skipped with a warning.
pub fn discover_workflows(
    base_dir: &Path,
) -> Result<Vec<(PathBuf, WorkflowDefinition)>, WorkflowError> {
    let mut results = Vec::new();
    if !base_dir.exists() {
        return Ok(results);
    }
    discover_recursive(base_dir, &mut results)?;
    results.sort_by(|a, b| a.0.cmp(&b.0));
    Ok(results)
}

fn discover_recursive(
    dir: &Path,
    results: &mut Vec<(PathBuf, WorkflowDefinition)>,
) -> Result<(), WorkflowError> {
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        if path.is_dir() {
            discover_recursive(&path, results)?;
            continue;
        }
        let is_yaml = path
            .extension()
            .is_some_and(|ext| ext == "yaml" || ext == "yml");
        if !is_yaml {
            continue;
        }
        match load_workflow_file(&path) {
            Ok(def) => results.push((path, def)),
            Err(e) => tracing::warn!(?path, error = %e, "skipping unparseable workflow file"),
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Templates
// ---------------------------------------------------------------------------

/// Customisations applied on top of a template definition.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TemplateOverlay {
    pub id: Option<String>,
    pub name: Option<String>,
    pub description: Option<String>,
    /// Step id -> parameters shallow-merged over the step's own.
    pub step_parameters: BTreeMap<String, Map<String, Value>>,
    pub max_parallel_steps: Option<usize>,
    pub timeout_secs: Option<f64>,
    pub continue_on_error: Option<bool>,
}

/// Derive a fresh, validated definition from a template.
///
/// The template itself is never modified. Parameter overlays may target
/// nested steps; an overlay for an unknown step id is an error.
pub fn instantiate_template(
    template: &WorkflowDefinition,
    overlay: &TemplateOverlay,
) -> Result<WorkflowDefinition, WorkflowError> {
    let mut def = template.clone();

    if let Some(id) = &overlay.id {
        def.id = id.clone();
    }
    if let Some(name) = &overlay.name {
        def.name = name.clone();
    }
    if let Some(description) = &overlay.description {
        def.description = Some(description.clone());
    }
    if let Some(max) = overlay.max_parallel_steps {
        def.max_parallel_steps = max;
    }
    if let Some(secs) = overlay.timeout_secs {
        def.timeout_secs = Some(secs);
    }
    if let Some(enabled) = overlay.continue_on_error {
        def.continue_on_error = enabled;
    }

    for (step_id, parameters) in &overlay.step_parameters {
        let step = find_step_mut(&mut def.steps, step_id).ok_or_else(|| {
            WorkflowError::ValidationError(format!(
                "template overlay targets unknown step '{step_id}'"
            ))
        })?;
        for (key, value) in parameters {
            step.parameters.insert(key.clone(), value.clone());
        }
    }

    if def.id != template.id {
        def.metadata
            .insert("template_id".to_string(), Value::String(template.id.clone()));
    }

    validate_definition(&def)?;
    tracing::debug!(template = %template.id, workflow_id = %def.id, "instantiated workflow template");
    Ok(def)
}

fn find_step_mut<'a>(steps: &'a mut [StepDefinition], id: &str) -> Option<&'a mut StepDefinition> {
    for step in steps {
        if step.id == id {
            return Some(step);
        }
        let found = match &mut step.config {
            StepConfig::Parallel { steps, .. } => find_step_mut(steps, id),
            StepConfig::Loop { body, .. } => find_step_mut(std::slice::from_mut(body.as_mut()), id),
            _ => None,
        };
        if found.is_some() {
            return found;
        }
    }
    None
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
