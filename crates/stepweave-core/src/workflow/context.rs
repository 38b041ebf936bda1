//! Workflow execution context with dotted-path lookup and template resolution.
//!
//! `WorkflowContext` is the state that flows through a run: `variables`
//! (seeded per run, shared), `inputs` (fixed at run start), `outputs`
//! (accumulated from completed steps, merge-only) and run `metadata`.
//! Only the scheduler mutates it; step bodies get `Arc` snapshots.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use stepweave_types::workflow::{StepInputs, StepOutputs};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Paths
// ---------------------------------------------------------------------------

/// The three namespaces a path may address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Namespace {
    Variables,
    Inputs,
    Outputs,
}

impl Namespace {
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "variables" => Some(Namespace::Variables),
            "inputs" => Some(Namespace::Inputs),
            "outputs" => Some(Namespace::Outputs),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Namespace::Variables => "variables",
            Namespace::Inputs => "inputs",
            Namespace::Outputs => "outputs",
        }
    }
}

/// One step of a path below its namespace.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum PathSegment {
    Key(String),
    Index(usize),
}

impl fmt::Display for PathSegment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PathSegment::Key(k) => f.write_str(k),
            PathSegment::Index(i) => write!(f, "[{i}]"),
        }
    }
}

/// Split a dotted path (`rows.0.name`, `rows[0].name`) into segments.
///
/// Returns `None` for empty segments or unbalanced brackets.
pub fn parse_segments(path: &str) -> Option<Vec<PathSegment>> {
    let mut segments = Vec::new();
    if path.is_empty() {
        return Some(segments);
    }
    for part in path.split('.') {
        let (key, mut rest) = match part.find('[') {
            Some(pos) => (&part[..pos], &part[pos..]),
            None => (part, ""),
        };
        if key.is_empty() {
            return None;
        }
        segments.push(PathSegment::Key(key.to_string()));
        while let Some(stripped) = rest.strip_prefix('[') {
            let close = stripped.find(']')?;
            let index = stripped[..close].trim().parse::<usize>().ok()?;
            segments.push(PathSegment::Index(index));
            rest = &stripped[close + 1..];
        }
        if !rest.is_empty() {
            return None;
        }
    }
    Some(segments)
}

/// Walk `segments` down from `root`.
///
/// A key segment that parses as an integer also indexes arrays, so
/// `rows.0` and `rows[0]` are equivalent.
pub fn lookup_in<'a>(root: &'a Value, segments: &[PathSegment]) -> Option<&'a Value> {
    let mut current = root;
    for segment in segments {
        current = match (segment, current) {
            (PathSegment::Key(k), Value::Object(map)) => map.get(k)?,
            (PathSegment::Key(k), Value::Array(items)) => items.get(k.parse::<usize>().ok()?)?,
            (PathSegment::Index(i), Value::Array(items)) => items.get(*i)?,
            _ => return None,
        };
    }
    Some(current)
}

fn lookup_in_map<'a>(map: &'a Map<String, Value>, segments: &[PathSegment]) -> Option<&'a Value> {
    let (first, rest) = segments.split_first()?;
    let head = match first {
        PathSegment::Key(k) => map.get(k)?,
        PathSegment::Index(_) => return None,
    };
    lookup_in(head, rest)
}

// ---------------------------------------------------------------------------
// WorkflowContext
// ---------------------------------------------------------------------------

/// Run identity carried alongside the data namespaces.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextMetadata {
    pub run_id: Uuid,
    pub workflow_id: String,
}

/// Execution context of one workflow run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowContext {
    pub variables: Map<String, Value>,
    pub inputs: Map<String, Value>,
    pub outputs: Map<String, Value>,
    pub metadata: ContextMetadata,
}

impl WorkflowContext {
    /// Create the context for a new run.
    pub fn new(
        run_id: Uuid,
        workflow_id: impl Into<String>,
        inputs: Map<String, Value>,
        variables: Map<String, Value>,
    ) -> Self {
        Self {
            variables,
            inputs,
            outputs: Map::new(),
            metadata: ContextMetadata {
                run_id,
                workflow_id: workflow_id.into(),
            },
        }
    }

    pub fn run_id(&self) -> Uuid {
        self.metadata.run_id
    }

    fn namespace(&self, ns: Namespace) -> &Map<String, Value> {
        match ns {
            Namespace::Variables => &self.variables,
            Namespace::Inputs => &self.inputs,
            Namespace::Outputs => &self.outputs,
        }
    }

    /// Resolve already-parsed segments in a namespace.
    pub fn lookup_path(&self, ns: Namespace, segments: &[PathSegment]) -> Option<&Value> {
        if segments.is_empty() {
            return None;
        }
        lookup_in_map(self.namespace(ns), segments)
    }

    /// Resolve a full dotted path such as `outputs.fetch.rows[0]`.
    ///
    /// The first segment must name a namespace; anything else is `None`.
    pub fn lookup(&self, path: &str) -> Option<&Value> {
        let path = path.trim();
        let (ns, rest) = path.split_once('.')?;
        let ns = Namespace::from_name(ns)?;
        let segments = parse_segments(rest)?;
        self.lookup_path(ns, &segments)
    }

    // -----------------------------------------------------------------------
    // Template resolution
    // -----------------------------------------------------------------------

    /// Resolve `{{ namespace.path }}` placeholders inside a string.
    ///
    /// Unknown references are left as-is (not an error).
    pub fn resolve_template(&self, template: &str) -> String {
        let mut result = String::with_capacity(template.len());
        let mut rest = template;

        while let Some(start) = rest.find("{{") {
            let Some(end) = rest[start + 2..].find("}}") else {
                break;
            };
            let end = start + 2 + end;
            let expr = rest[start + 2..end].trim();

            result.push_str(&rest[..start]);
            match self.lookup(expr) {
                Some(value) => result.push_str(&value_to_string(value)),
                None => result.push_str(&rest[start..end + 2]),
            }
            rest = &rest[end + 2..];
        }
        result.push_str(rest);
        result
    }

    /// Resolve placeholders anywhere inside a JSON value.
    ///
    /// A string that is exactly one placeholder is replaced by the referenced
    /// value itself, keeping its JSON type.
    pub fn resolve_value(&self, value: &Value) -> Value {
        match value {
            Value::String(s) => {
                if let Some(expr) = whole_placeholder(s) {
                    if let Some(found) = self.lookup(expr) {
                        return found.clone();
                    }
                }
                Value::String(self.resolve_template(s))
            }
            Value::Array(items) => Value::Array(items.iter().map(|v| self.resolve_value(v)).collect()),
            Value::Object(map) => Value::Object(
                map.iter()
                    .map(|(k, v)| (k.clone(), self.resolve_value(v)))
                    .collect(),
            ),
            other => other.clone(),
        }
    }

    /// Resolve a step's `parameters` into its inputs.
    pub fn resolve_parameters(&self, parameters: &Map<String, Value>) -> StepInputs {
        parameters
            .iter()
            .map(|(k, v)| (k.clone(), self.resolve_value(v)))
            .collect()
    }

    // -----------------------------------------------------------------------
    // Output merge
    // -----------------------------------------------------------------------

    /// Merge a completed step's outputs into `outputs`.
    ///
    /// Without a mapping every key is merged verbatim (overwriting by key).
    /// With a mapping only the mapped paths are projected, under their
    /// context keys. Returns one warning per mapped path that was absent.
    pub fn merge_outputs(
        &mut self,
        outputs: &StepOutputs,
        mapping: &BTreeMap<String, String>,
    ) -> Vec<String> {
        if mapping.is_empty() {
            for (k, v) in outputs {
                self.outputs.insert(k.clone(), v.clone());
            }
            return Vec::new();
        }

        let mut warnings = Vec::new();
        for (context_key, path) in mapping {
            let found = parse_segments(path).and_then(|segments| lookup_in_map(outputs, &segments));
            match found {
                Some(value) => {
                    self.outputs.insert(context_key.clone(), value.clone());
                }
                None => warnings.push(format!(
                    "output mapping '{context_key}': path '{path}' not found in step output"
                )),
            }
        }
        warnings
    }

    /// Copy of this context with `loop_item` / `loop_index` set in `variables`.
    pub fn for_iteration(&self, item: Value, index: usize) -> Self {
        let mut scoped = self.clone();
        scoped.variables.insert("loop_item".to_string(), item);
        scoped.variables.insert("loop_index".to_string(), Value::from(index));
        scoped
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// The inner expression if `s` is a single `{{ ... }}` placeholder.
fn whole_placeholder(s: &str) -> Option<&str> {
    let inner = s.trim().strip_prefix("{{")?.strip_suffix("}}")?;
    if inner.contains("{{") || inner.contains("}}") {
        return None;
    }
    Some(inner.trim())
}

/// Convert a JSON value to a display string for template resolution.
pub fn value_to_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => "null".to_string(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        // For objects/arrays, return compact JSON
        _ => serde_json::to_string(value).unwrap_or_default(),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn obj(value: Value) -> Map<String, Value> {
        match value {
            Value::Object(map) => map,
            _ => panic!("expected object"),
        }
    }

    fn test_context() -> WorkflowContext {
        let mut ctx = WorkflowContext::new(
            Uuid::now_v7(),
            "report",
            obj(json!({ "region": "emea", "limit": 25 })),
            obj(json!({ "threshold": 10, "tags": ["a", "b"] })),
        );
        ctx.outputs = obj(json!({
            "rows": [{ "name": "alpha", "total": 3 }, { "name": "beta", "total": 7 }],
            "summary": { "count": 2 }
        }));
        ctx
    }

    // -----------------------------------------------------------------------
    // Lookup
    // -----------------------------------------------------------------------

    #[test]
    fn test_lookup_namespaces() {
        let ctx = test_context();
        assert_eq!(ctx.lookup("inputs.region"), Some(&json!("emea")));
        assert_eq!(ctx.lookup("variables.threshold"), Some(&json!(10)));
        assert_eq!(ctx.lookup("outputs.summary.count"), Some(&json!(2)));
    }

    #[test]
    fn test_lookup_array_index_forms() {
        let ctx = test_context();
        assert_eq!(ctx.lookup("outputs.rows.1.name"), Some(&json!("beta")));
        assert_eq!(ctx.lookup("outputs.rows[0].total"), Some(&json!(3)));
        assert_eq!(ctx.lookup("outputs.rows[5]"), None);
    }

    #[test]
    fn test_lookup_missing_or_unknown_namespace() {
        let ctx = test_context();
        assert_eq!(ctx.lookup("outputs.nothing.here"), None);
        assert_eq!(ctx.lookup("steps.fetch.output"), None);
        assert_eq!(ctx.lookup("variables"), None);
        assert_eq!(ctx.lookup("variables..x"), None);
    }

    // -----------------------------------------------------------------------
    // Template resolution
    // -----------------------------------------------------------------------

    #[test]
    fn test_resolve_embedded_templates() {
        let ctx = test_context();
        let result = ctx.resolve_template("Region {{ inputs.region }} limit {{inputs.limit}}");
        assert_eq!(result, "Region emea limit 25");
    }

    #[test]
    fn test_resolve_unknown_reference_left_asis() {
        let ctx = test_context();
        let result = ctx.resolve_template("value: {{ outputs.missing }}!");
        assert_eq!(result, "value: {{ outputs.missing }}!");
    }

    #[test]
    fn test_whole_placeholder_keeps_json_type() {
        let ctx = test_context();
        let params = obj(json!({
            "rows": "{{ outputs.rows }}",
            "limit": "{{ inputs.limit }}",
            "label": "top {{ inputs.limit }}",
            "nested": { "tags": ["{{ variables.tags }}"] },
            "raw": true
        }));
        let inputs = ctx.resolve_parameters(&params);
        assert!(inputs["rows"].is_array());
        assert_eq!(inputs["limit"], json!(25));
        assert_eq!(inputs["label"], json!("top 25"));
        assert_eq!(inputs["nested"]["tags"][0], json!(["a", "b"]));
        assert_eq!(inputs["raw"], json!(true));
    }

    // -----------------------------------------------------------------------
    // Output merge
    // -----------------------------------------------------------------------

    #[test]
    fn test_merge_verbatim_overwrites_by_key() {
        let mut ctx = test_context();
        let warnings = ctx.merge_outputs(
            &obj(json!({ "summary": "replaced", "fresh": 1 })),
            &BTreeMap::new(),
        );
        assert!(warnings.is_empty());
        assert_eq!(ctx.outputs["summary"], json!("replaced"));
        assert_eq!(ctx.outputs["fresh"], json!(1));
        assert!(ctx.outputs.contains_key("rows"), "merge never removes keys");
    }

    #[test]
    fn test_merge_with_mapping_projects_and_renames() {
        let mut ctx = test_context();
        let mut mapping = BTreeMap::new();
        mapping.insert("chart_url".to_string(), "chart.url".to_string());
        mapping.insert("first".to_string(), "items[0]".to_string());
        mapping.insert("absent".to_string(), "nope".to_string());

        let warnings = ctx.merge_outputs(
            &obj(json!({ "chart": { "url": "http://x" }, "items": [9, 8], "noise": 1 })),
            &mapping,
        );
        assert_eq!(ctx.outputs["chart_url"], json!("http://x"));
        assert_eq!(ctx.outputs["first"], json!(9));
        assert!(!ctx.outputs.contains_key("noise"));
        assert!(!ctx.outputs.contains_key("absent"));
        assert_eq!(warnings.len(), 1);
        assert!(warnings[0].contains("absent"));
    }

    #[test]
    fn test_for_iteration_does_not_touch_original() {
        let ctx = test_context();
        let scoped = ctx.for_iteration(json!("beta"), 1);
        assert_eq!(scoped.variables["loop_item"], json!("beta"));
        assert_eq!(scoped.variables["loop_index"], json!(1));
        assert!(!ctx.variables.contains_key("loop_item"));
    }

    #[test]
    fn test_parse_segments_rejects_garbage() {
        assert_eq!(parse_segments("a[x]"), None);
        assert_eq!(parse_segments("a[1"), None);
        assert_eq!(parse_segments("a.[1]"), None);
        assert_eq!(
            parse_segments("a[1][2].b"),
            Some(vec![
                PathSegment::Key("a".into()),
                PathSegment::Index(1),
                PathSegment::Index(2),
                PathSegment::Key("b".into()),
            ])
        );
    }
}
