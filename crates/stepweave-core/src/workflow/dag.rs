//! Dependency validation, cycle detection, and diagnostic level computation.
//!
//! Uses `petgraph` to model step dependencies as a directed graph (edge from
//! dependency to dependent). `validate` collects every structural problem in
//! one pass and never stops at the first; `compute_levels` groups steps by
//! depth for display. Levels never gate scheduling: the executor is
//! event-driven and launches a step the moment its own dependencies finish.

use std::collections::{HashMap, HashSet};
use std::fmt;

use petgraph::Direction;
use petgraph::algo::toposort;
use petgraph::graph::{DiGraph, NodeIndex};
use serde::Serialize;
use stepweave_types::workflow::{StepConfig, StepDefinition, WorkflowDefinition};
use thiserror::Error;

// ---------------------------------------------------------------------------
// Validation report
// ---------------------------------------------------------------------------

/// A single structural problem found in a definition.
#[derive(Debug, Clone, PartialEq, Serialize, Error)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ValidationIssue {
    #[error("workflow must have at least one step")]
    EmptyWorkflow,

    #[error("duplicate step ID: '{step_id}'")]
    DuplicateStep { step_id: String },

    #[error("step '{step_id}' depends on unknown step '{dependency}'")]
    UnknownDependency { step_id: String, dependency: String },

    #[error("cycle detected: step '{step_id}' depends on itself")]
    SelfDependency { step_id: String },

    #[error("cycle detected: {}", .path.join(" -> "))]
    Cycle { path: Vec<String> },

    #[error("max_parallel_steps must be >= 1")]
    InvalidParallelism,

    #[error("{scope} timeout must be a positive number of seconds, got {value}")]
    InvalidTimeout { scope: String, value: f64 },

    #[error("action step '{step_id}' has an empty handler name")]
    EmptyHandler { step_id: String },

    #[error("nested step '{step_id}' must not declare depends_on")]
    NestedDependency { step_id: String },

    #[error("delay step '{step_id}' has invalid delay {value}")]
    InvalidDelay { step_id: String, value: f64 },

    #[error("composite step '{step_id}' must allow at least one concurrent child")]
    InvalidConcurrency { step_id: String },
}

/// Outcome of `validate`: every issue found, in discovery order.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ValidationReport {
    pub valid: bool,
    pub errors: Vec<ValidationIssue>,
}

impl ValidationReport {
    fn from_issues(errors: Vec<ValidationIssue>) -> Self {
        Self {
            valid: errors.is_empty(),
            errors,
        }
    }

    /// Whether any issue is a cycle (including a self-dependency).
    pub fn has_cycle(&self) -> bool {
        self.errors.iter().any(|e| {
            matches!(
                e,
                ValidationIssue::Cycle { .. } | ValidationIssue::SelfDependency { .. }
            )
        })
    }
}

impl fmt::Display for ValidationReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.errors.is_empty() {
            return f.write_str("valid");
        }
        let messages: Vec<String> = self.errors.iter().map(ToString::to_string).collect();
        f.write_str(&messages.join("; "))
    }
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

/// Validate a definition, collecting every problem.
///
/// Checks:
/// - At least one step exists
/// - Step IDs are unique across the whole tree, nested steps included
/// - `depends_on` references point to existing top-level steps
/// - No step depends on itself and the graph has no cycles
/// - `max_parallel_steps >= 1`, every timeout is positive
/// - Action handlers are named, delays are non-negative
/// - Nested steps inside PARALLEL/LOOP do not declare `depends_on`
///
/// Condition strings are not inspected: a malformed condition evaluates to
/// false at run time.
pub fn validate(def: &WorkflowDefinition) -> ValidationReport {
    let mut issues = Vec::new();

    if def.steps.is_empty() {
        issues.push(ValidationIssue::EmptyWorkflow);
    }
    if def.max_parallel_steps < 1 {
        issues.push(ValidationIssue::InvalidParallelism);
    }
    if let Some(t) = def.timeout_secs {
        if !is_positive(t) {
            issues.push(ValidationIssue::InvalidTimeout {
                scope: "workflow".to_string(),
                value: t,
            });
        }
    }

    let mut seen_ids = HashSet::new();
    for step in &def.steps {
        check_step(step, false, &mut seen_ids, &mut issues);
    }

    let top_level: HashSet<&str> = def.steps.iter().map(|s| s.id.as_str()).collect();
    for step in &def.steps {
        for dep in &step.depends_on {
            if dep == &step.id {
                issues.push(ValidationIssue::SelfDependency {
                    step_id: step.id.clone(),
                });
            } else if !top_level.contains(dep.as_str()) {
                issues.push(ValidationIssue::UnknownDependency {
                    step_id: step.id.clone(),
                    dependency: dep.clone(),
                });
            }
        }
    }

    let graph = build_graph(&def.steps);
    for path in find_cycles(&graph) {
        issues.push(ValidationIssue::Cycle { path });
    }

    ValidationReport::from_issues(issues)
}

fn is_positive(value: f64) -> bool {
    value.is_finite() && value > 0.0
}

fn check_step(
    step: &StepDefinition,
    nested: bool,
    seen_ids: &mut HashSet<String>,
    issues: &mut Vec<ValidationIssue>,
) {
    if !seen_ids.insert(step.id.clone()) {
        issues.push(ValidationIssue::DuplicateStep {
            step_id: step.id.clone(),
        });
    }
    if nested && !step.depends_on.is_empty() {
        issues.push(ValidationIssue::NestedDependency {
            step_id: step.id.clone(),
        });
    }
    if let Some(t) = step.timeout_secs {
        if !is_positive(t) {
            issues.push(ValidationIssue::InvalidTimeout {
                scope: format!("step '{}'", step.id),
                value: t,
            });
        }
    }

    match &step.config {
        StepConfig::Action { handler } if handler.trim().is_empty() => {
            issues.push(ValidationIssue::EmptyHandler {
                step_id: step.id.clone(),
            });
        }
        StepConfig::Delay { delay_seconds }
            if !delay_seconds.is_finite() || *delay_seconds < 0.0 =>
        {
            issues.push(ValidationIssue::InvalidDelay {
                step_id: step.id.clone(),
                value: *delay_seconds,
            });
        }
        StepConfig::Parallel {
            steps,
            max_concurrency,
        } => {
            if *max_concurrency == Some(0) {
                issues.push(ValidationIssue::InvalidConcurrency {
                    step_id: step.id.clone(),
                });
            }
            for child in steps {
                check_step(child, true, seen_ids, issues);
            }
        }
        StepConfig::Loop { body, .. } => check_step(body, true, seen_ids, issues),
        _ => {}
    }
}

// ---------------------------------------------------------------------------
// Graph construction & cycle detection
// ---------------------------------------------------------------------------

/// Build the dependency graph over top-level steps.
///
/// Unknown dependencies and self-edges are left out; `validate` reports
/// them separately. Duplicate IDs map to their first occurrence.
fn build_graph(steps: &[StepDefinition]) -> DiGraph<&str, ()> {
    let mut graph = DiGraph::<&str, ()>::new();
    let mut id_to_idx: HashMap<&str, NodeIndex> = HashMap::new();
    for step in steps {
        id_to_idx
            .entry(step.id.as_str())
            .or_insert_with(|| graph.add_node(step.id.as_str()));
    }

    let mut seen_edges = HashSet::new();
    for step in steps {
        let to = id_to_idx[step.id.as_str()];
        for dep in &step.depends_on {
            if dep == &step.id {
                continue;
            }
            if let Some(&from) = id_to_idx.get(dep.as_str()) {
                if seen_edges.insert((from, to)) {
                    graph.add_edge(from, to, ());
                }
            }
        }
    }
    graph
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Color {
    White,
    Gray,
    Black,
}

/// Three-color DFS over the graph; every back edge yields one cycle path.
///
/// Iterative with an explicit stack of `(node, remaining neighbours)`, so
/// long dependency chains never grow the call stack.
fn find_cycles(graph: &DiGraph<&str, ()>) -> Vec<Vec<String>> {
    let mut color = vec![Color::White; graph.node_count()];
    let mut cycles = Vec::new();

    for root in graph.node_indices() {
        if color[root.index()] != Color::White {
            continue;
        }
        color[root.index()] = Color::Gray;
        let mut stack = vec![(root, graph.neighbors_directed(root, Direction::Outgoing))];

        while let Some((_, neighbours)) = stack.last_mut() {
            let Some(next) = neighbours.next() else {
                if let Some((done, _)) = stack.pop() {
                    color[done.index()] = Color::Black;
                }
                continue;
            };
            match color[next.index()] {
                Color::White => {
                    color[next.index()] = Color::Gray;
                    stack.push((next, graph.neighbors_directed(next, Direction::Outgoing)));
                }
                Color::Gray => {
                    let start = stack.iter().position(|(n, _)| *n == next).unwrap_or(0);
                    let mut cycle: Vec<String> =
                        stack[start..].iter().map(|(n, _)| graph[*n].to_string()).collect();
                    cycle.push(graph[next].to_string());
                    cycles.push(cycle);
                }
                Color::Black => {}
            }
        }
    }
    cycles
}

// ---------------------------------------------------------------------------
// Diagnostic levels
// ---------------------------------------------------------------------------

/// Compute each step's diagnostic level: 0 without dependencies, otherwise
/// one more than the deepest dependency.
///
/// Fails with the offending issue on an unknown dependency or a cycle.
pub fn compute_levels(steps: &[StepDefinition]) -> Result<HashMap<String, usize>, ValidationIssue> {
    let ids: HashSet<&str> = steps.iter().map(|s| s.id.as_str()).collect();
    for step in steps {
        for dep in &step.depends_on {
            if dep == &step.id {
                return Err(ValidationIssue::SelfDependency {
                    step_id: step.id.clone(),
                });
            }
            if !ids.contains(dep.as_str()) {
                return Err(ValidationIssue::UnknownDependency {
                    step_id: step.id.clone(),
                    dependency: dep.clone(),
                });
            }
        }
    }

    let step_map: HashMap<&str, &StepDefinition> =
        steps.iter().map(|s| (s.id.as_str(), s)).collect();
    let graph = build_graph(steps);
    let sorted = toposort(&graph, None).map_err(|cycle| ValidationIssue::Cycle {
        path: vec![graph[cycle.node_id()].to_string()],
    })?;

    let mut levels: HashMap<String, usize> = HashMap::new();
    for node_idx in sorted {
        let step = step_map[graph[node_idx]];
        let level = step
            .depends_on
            .iter()
            .map(|dep| levels.get(dep.as_str()).copied().unwrap_or(0) + 1)
            .max()
            .unwrap_or(0);
        levels.insert(step.id.clone(), level);
    }
    Ok(levels)
}

/// Group steps by diagnostic level, preserving definition order inside a level.
pub fn group_by_level<'a>(
    steps: &'a [StepDefinition],
) -> Result<Vec<Vec<&'a StepDefinition>>, ValidationIssue> {
    if steps.is_empty() {
        return Ok(vec![]);
    }
    let levels = compute_levels(steps)?;
    let max_level = levels.values().copied().max().unwrap_or(0);
    let mut groups: Vec<Vec<&StepDefinition>> = vec![vec![]; max_level + 1];
    for step in steps {
        groups[levels[&step.id]].push(step);
    }
    Ok(groups)
}

// ---------------------------------------------------------------------------
// Transitive dependency closure
// ---------------------------------------------------------------------------

/// Returns the transitive closure of all dependencies for a given step,
/// sorted by ID.
///
/// If `step_id` is not found, returns an empty vec.
pub fn transitive_dependencies<'a>(step_id: &str, steps: &'a [StepDefinition]) -> Vec<&'a str> {
    let step_map: HashMap<&str, &StepDefinition> =
        steps.iter().map(|s| (s.id.as_str(), s)).collect();

    let mut visited: HashSet<&str> = HashSet::new();
    let mut stack: Vec<&str> = match step_map.get(step_id) {
        Some(step) => step.depends_on.iter().map(String::as_str).collect(),
        None => return Vec::new(),
    };

    while let Some(current) = stack.pop() {
        if !visited.insert(current) {
            continue;
        }
        if let Some(step) = step_map.get(current) {
            stack.extend(step.depends_on.iter().map(String::as_str));
        }
    }

    let mut deps: Vec<&str> = visited.into_iter().collect();
    deps.sort_unstable();
    deps
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use stepweave_types::workflow::StepConfig;

    fn step(id: &str, depends_on: Vec<&str>) -> StepDefinition {
        StepDefinition::action(id, "noop").depends_on(depends_on)
    }

    fn workflow(steps: Vec<StepDefinition>) -> WorkflowDefinition {
        WorkflowDefinition::new("wf", "wf", steps)
    }

    // -----------------------------------------------------------------------
    // Validation
    // -----------------------------------------------------------------------

    #[test]
    fn test_acyclic_definition_is_valid() {
        let def = workflow(vec![
            step("a", vec![]),
            step("b", vec!["a"]),
            step("c", vec!["a", "b"]),
        ]);
        let report = validate(&def);
        assert!(report.valid, "unexpected issues: {report}");
        assert!(report.errors.is_empty());
    }

    #[test]
    fn test_two_step_cycle_reported() {
        let def = workflow(vec![step("a", vec!["b"]), step("b", vec!["a"])]);
        let report = validate(&def);
        assert!(!report.valid);
        assert!(report.has_cycle());
        assert!(report.to_string().contains("cycle detected"));
    }

    #[test]
    fn test_three_step_cycle_reports_path() {
        let def = workflow(vec![
            step("a", vec!["c"]),
            step("b", vec!["a"]),
            step("c", vec!["b"]),
        ]);
        let report = validate(&def);
        let cycle = report
            .errors
            .iter()
            .find_map(|e| match e {
                ValidationIssue::Cycle { path } => Some(path.clone()),
                _ => None,
            })
            .expect("cycle issue");
        assert_eq!(cycle.len(), 4, "closed path a->..->a: {cycle:?}");
        assert_eq!(cycle.first(), cycle.last());
    }

    fn chain(len: usize) -> Vec<StepDefinition> {
        (0..len)
            .map(|i| {
                let step = StepDefinition::action(format!("s{i}"), "noop");
                if i == 0 {
                    step
                } else {
                    step.depends_on([format!("s{}", i - 1)])
                }
            })
            .collect()
    }

    #[test]
    fn test_long_chain_validates_without_recursion() {
        let def = workflow(chain(20_000));
        let report = validate(&def);
        assert!(report.valid, "unexpected issues: {report}");

        let levels = compute_levels(&def.steps).unwrap();
        assert_eq!(levels["s19999"], 19_999);
    }

    #[test]
    fn test_long_cycle_reports_full_path() {
        let mut steps = chain(20_000);
        steps[0] = StepDefinition::action("s0", "noop").depends_on(["s19999"]);
        let report = validate(&workflow(steps));
        assert!(report.has_cycle());
        let cycle = report
            .errors
            .iter()
            .find_map(|e| match e {
                ValidationIssue::Cycle { path } => Some(path.clone()),
                _ => None,
            })
            .expect("cycle issue");
        assert_eq!(cycle.len(), 20_001);
        assert_eq!(cycle.first(), cycle.last());
    }

    #[test]
    fn test_self_dependency_is_a_cycle() {
        let def = workflow(vec![step("a", vec!["a"])]);
        let report = validate(&def);
        assert!(report.has_cycle());
        assert_eq!(
            report.errors,
            vec![ValidationIssue::SelfDependency {
                step_id: "a".into()
            }]
        );
    }

    #[test]
    fn test_collects_every_issue() {
        let mut def = workflow(vec![
            step("a", vec!["ghost"]),
            step("a", vec![]),
            StepDefinition::action("c", " "),
        ]);
        def.max_parallel_steps = 0;
        def.timeout_secs = Some(0.0);

        let report = validate(&def);
        assert!(!report.valid);
        assert!(report.errors.contains(&ValidationIssue::InvalidParallelism));
        assert!(report.errors.contains(&ValidationIssue::DuplicateStep {
            step_id: "a".into()
        }));
        assert!(report.errors.contains(&ValidationIssue::UnknownDependency {
            step_id: "a".into(),
            dependency: "ghost".into()
        }));
        assert!(report.errors.contains(&ValidationIssue::EmptyHandler {
            step_id: "c".into()
        }));
        assert!(
            report
                .errors
                .iter()
                .any(|e| matches!(e, ValidationIssue::InvalidTimeout { .. }))
        );
    }

    #[test]
    fn test_empty_workflow_invalid() {
        let report = validate(&workflow(vec![]));
        assert_eq!(report.errors, vec![ValidationIssue::EmptyWorkflow]);
    }

    #[test]
    fn test_nested_steps_checked() {
        let parallel = StepDefinition::new(
            "fan",
            StepConfig::Parallel {
                steps: vec![
                    StepDefinition::action("left", "noop"),
                    StepDefinition::action("fan", "noop").depends_on(["left"]),
                    StepDefinition::new("nap", StepConfig::Delay { delay_seconds: -1.0 }),
                ],
                max_concurrency: Some(0),
            },
        );
        let report = validate(&workflow(vec![parallel]));
        assert!(report.errors.contains(&ValidationIssue::DuplicateStep {
            step_id: "fan".into()
        }));
        assert!(report.errors.contains(&ValidationIssue::NestedDependency {
            step_id: "fan".into()
        }));
        assert!(report.errors.contains(&ValidationIssue::InvalidDelay {
            step_id: "nap".into(),
            value: -1.0
        }));
        assert!(report.errors.contains(&ValidationIssue::InvalidConcurrency {
            step_id: "fan".into()
        }));
    }

    #[test]
    fn test_malformed_condition_not_rejected() {
        let def = workflow(vec![step("a", vec![]).with_condition("variables.x >>> (")]);
        assert!(validate(&def).valid);
    }

    #[test]
    fn test_validate_is_idempotent() {
        let def = workflow(vec![step("a", vec!["b"]), step("b", vec!["a"])]);
        assert_eq!(validate(&def), validate(&def));
    }

    // -----------------------------------------------------------------------
    // Levels
    // -----------------------------------------------------------------------

    #[test]
    fn test_levels_diamond() {
        let steps = vec![
            step("a", vec![]),
            step("b", vec!["a"]),
            step("c", vec!["a"]),
            step("d", vec!["b", "c"]),
        ];
        let levels = compute_levels(&steps).unwrap();
        assert_eq!(levels["a"], 0);
        assert_eq!(levels["b"], 1);
        assert_eq!(levels["c"], 1);
        assert_eq!(levels["d"], 2);
    }

    #[test]
    fn test_levels_take_deepest_dependency() {
        // a -> b -> c, and d depends on both a and c
        let steps = vec![
            step("a", vec![]),
            step("b", vec!["a"]),
            step("c", vec!["b"]),
            step("d", vec!["a", "c"]),
        ];
        let levels = compute_levels(&steps).unwrap();
        assert_eq!(levels["d"], 3);
    }

    #[test]
    fn test_group_by_level_fork_join() {
        let steps = vec![
            step("a", vec![]),
            step("b", vec!["a"]),
            step("c", vec!["a"]),
            step("d", vec!["b"]),
            step("e", vec!["c"]),
            step("f", vec!["d", "e"]),
        ];
        let groups = group_by_level(&steps).unwrap();
        let ids: Vec<Vec<&str>> = groups
            .iter()
            .map(|g| g.iter().map(|s| s.id.as_str()).collect())
            .collect();
        assert_eq!(ids, vec![vec!["a"], vec!["b", "c"], vec!["d", "e"], vec!["f"]]);
    }

    #[test]
    fn test_levels_cycle_error() {
        let steps = vec![step("a", vec!["b"]), step("b", vec!["a"])];
        let err = compute_levels(&steps).unwrap_err();
        assert!(matches!(err, ValidationIssue::Cycle { .. }));
    }

    // -----------------------------------------------------------------------
    // Transitive dependencies
    // -----------------------------------------------------------------------

    #[test]
    fn test_transitive_dependencies_chain() {
        let steps = vec![
            step("a", vec![]),
            step("b", vec!["a"]),
            step("c", vec!["b"]),
            step("d", vec!["c"]),
        ];
        assert_eq!(transitive_dependencies("d", &steps), vec!["a", "b", "c"]);
        assert!(transitive_dependencies("a", &steps).is_empty());
        assert!(transitive_dependencies("nonexistent", &steps).is_empty());
    }
}
