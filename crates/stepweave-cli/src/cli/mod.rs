//! CLI command definitions for the `stepweave` binary.
//!
//! Uses clap derive macros for argument parsing.

pub mod run;
pub mod workflow;

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};
use serde_json::Value;

/// Validate, inspect and run DAG workflow files.
#[derive(Parser)]
#[command(name = "stepweave", version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Output machine-readable JSON instead of styled text.
    #[arg(long, global = true)]
    pub json: bool,

    /// Suppress all output except errors.
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// Detailed output (-v for debug, -vv for trace).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Export tracing spans through OpenTelemetry (stdout exporter).
    #[arg(long, global = true)]
    pub otel: bool,

    /// Engine configuration file (defaults to ./stepweave.toml when present).
    #[arg(long, global = true, env = "STEPWEAVE_CONFIG")]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Check a workflow file and report every structural problem.
    Validate {
        /// Path to the workflow YAML or JSON file.
        file: PathBuf,
    },

    /// Show the dependency levels of a workflow without running it.
    Plan {
        /// Path to the workflow YAML or JSON file.
        file: PathBuf,
    },

    /// Execute a workflow with the built-in handlers.
    Run(RunArgs),

    /// List the built-in handlers available to `run`.
    Handlers,
}

#[derive(Args)]
pub struct RunArgs {
    /// Path to the workflow YAML or JSON file.
    pub file: PathBuf,

    /// Workflow input as key=value. Values are parsed as JSON, falling back
    /// to a plain string. Repeatable.
    #[arg(short, long = "input", value_name = "KEY=VALUE", value_parser = parse_key_value)]
    pub inputs: Vec<(String, Value)>,

    /// Run variable as key=value, parsed like --input. Repeatable.
    #[arg(long = "var", value_name = "KEY=VALUE", value_parser = parse_key_value)]
    pub vars: Vec<(String, Value)>,

    /// Automatically approve the named human step when it starts waiting.
    /// Repeatable.
    #[arg(long, value_name = "STEP_ID")]
    pub approve: Vec<String>,
}

/// Parse a `key=value` argument.
///
/// `count=3` yields a number and `tags=["a","b"]` an array, while
/// `name=Alice` is not valid JSON and stays a string.
pub fn parse_key_value(raw: &str) -> Result<(String, Value), String> {
    let (key, value) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected KEY=VALUE, got '{raw}'"))?;
    let key = key.trim();
    if key.is_empty() {
        return Err(format!("empty key in '{raw}'"));
    }
    let value = serde_json::from_str(value).unwrap_or_else(|_| Value::String(value.to_string()));
    Ok((key.to_string(), value))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_key_value_json_and_string_fallback() {
        assert_eq!(parse_key_value("count=3").unwrap(), ("count".into(), json!(3)));
        assert_eq!(
            parse_key_value("tags=[\"a\",\"b\"]").unwrap(),
            ("tags".into(), json!(["a", "b"]))
        );
        assert_eq!(parse_key_value("flag=true").unwrap(), ("flag".into(), json!(true)));
        assert_eq!(
            parse_key_value("name=Alice").unwrap(),
            ("name".into(), json!("Alice"))
        );
    }

    #[test]
    fn test_parse_key_value_keeps_later_equals_in_value() {
        let (key, value) = parse_key_value("query=a=b").unwrap();
        assert_eq!(key, "query");
        assert_eq!(value, json!("a=b"));
    }

    #[test]
    fn test_parse_key_value_empty_value_is_empty_string() {
        assert_eq!(parse_key_value("note=").unwrap(), ("note".into(), json!("")));
    }

    #[test]
    fn test_parse_key_value_rejects_malformed() {
        assert!(parse_key_value("novalue").is_err());
        assert!(parse_key_value("=5").is_err());
    }

    #[test]
    fn test_cli_parses_run_arguments() {
        let cli = Cli::try_parse_from([
            "stepweave",
            "--json",
            "run",
            "flow.yaml",
            "-i",
            "region=eu",
            "--input",
            "limit=10",
            "--var",
            "env=prod",
            "--approve",
            "signoff",
        ])
        .unwrap();

        assert!(cli.json);
        let Commands::Run(args) = cli.command else {
            panic!("expected run command");
        };
        assert_eq!(args.file, PathBuf::from("flow.yaml"));
        assert_eq!(
            args.inputs,
            vec![("region".into(), json!("eu")), ("limit".into(), json!(10))]
        );
        assert_eq!(args.vars, vec![("env".into(), json!("prod"))]);
        assert_eq!(args.approve, vec!["signoff".to_string()]);
    }

    #[test]
    fn test_cli_verbosity_counts() {
        let cli = Cli::try_parse_from(["stepweave", "-vv", "plan", "flow.yaml"]).unwrap();
        assert_eq!(cli.verbose, 2);
        assert!(matches!(cli.command, Commands::Plan { .. }));
    }
}
