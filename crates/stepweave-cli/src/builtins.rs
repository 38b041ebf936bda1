//! Demonstration handlers registered by `stepweave run`.

use std::time::Duration;

use serde_json::{Value, json};
use stepweave_core::{HandlerCall, HandlerError, HandlerRegistry, handler_fn};
use stepweave_types::workflow::StepOutputs;

/// Name and one-line description of every built-in handler.
pub const BUILTIN_HANDLERS: &[(&str, &str)] = &[
    ("echo", "Return the step's inputs as its outputs"),
    ("fail", "Fail with `message`; retryable when `retryable: true`"),
    ("sleep", "Wait `seconds` (default 1), then return the inputs"),
];

pub fn register_builtins(registry: &HandlerRegistry) {
    registry.register("echo", handler_fn(echo));
    registry.register("fail", handler_fn(fail));
    registry.register("sleep", handler_fn(sleep));
}

async fn echo(call: HandlerCall) -> Result<StepOutputs, HandlerError> {
    Ok(call.inputs)
}

async fn fail(call: HandlerCall) -> Result<StepOutputs, HandlerError> {
    let message = call
        .inputs
        .get("message")
        .and_then(Value::as_str)
        .map(str::to_string)
        .unwrap_or_else(|| format!("step '{}' failed on request", call.step_id));
    let retryable = call
        .inputs
        .get("retryable")
        .and_then(Value::as_bool)
        .unwrap_or(false);

    Err(if retryable {
        HandlerError::retryable(message)
    } else {
        HandlerError::fatal(message)
    })
}

async fn sleep(call: HandlerCall) -> Result<StepOutputs, HandlerError> {
    let seconds = match call.inputs.get("seconds") {
        None => 1.0,
        Some(value) => parse_seconds(value)
            .ok_or_else(|| HandlerError::fatal(format!("invalid seconds: {value}")))?,
    };
    tokio::time::sleep(Duration::from_secs_f64(seconds)).await;

    let mut outputs = call.inputs;
    outputs.insert("slept_seconds".into(), json!(seconds));
    Ok(outputs)
}

/// Accepts numbers and numeric strings; template resolution may produce either.
fn parse_seconds(value: &Value) -> Option<f64> {
    let seconds = match value {
        Value::Number(n) => n.as_f64()?,
        Value::String(s) => s.trim().parse().ok()?,
        _ => return None,
    };
    (seconds.is_finite() && seconds >= 0.0).then_some(seconds)
}
