//! Pluggable ACTION handlers and the name-indexed registry that holds them.
//!
//! Follows the boxed-future pattern used for other async traits in this
//! crate:
//! 1. `StepHandler` is the ergonomic trait (RPITIT, not object-safe)
//! 2. `StepHandlerDyn` is the object-safe twin with boxed futures,
//!    blanket-implemented for every `StepHandler`
//! 3. `BoxStepHandler` wraps `Box<dyn StepHandlerDyn>` and delegates

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use dashmap::DashMap;
use stepweave_types::workflow::{StepDefinition, StepInputs, StepOutputs};

use super::context::WorkflowContext;

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Error returned by a step handler.
///
/// `retryable` decides whether the runner may try the step again under its
/// retry policy.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{message}")]
pub struct HandlerError {
    pub message: String,
    pub retryable: bool,
}

impl HandlerError {
    /// A transient failure; the step's retry policy applies.
    pub fn retryable(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: true,
        }
    }

    /// A permanent failure; the step fails without further attempts.
    pub fn fatal(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: false,
        }
    }
}

impl From<anyhow::Error> for HandlerError {
    fn from(err: anyhow::Error) -> Self {
        Self::retryable(format!("{err:#}"))
    }
}

// ---------------------------------------------------------------------------
// Handler traits
// ---------------------------------------------------------------------------

/// Business logic behind an ACTION step.
///
/// `context` is a read-only snapshot taken when the step started; `inputs`
/// are the step's parameters with placeholders already resolved.
pub trait StepHandler: Send + Sync {
    fn handle(
        &self,
        step: &StepDefinition,
        context: &WorkflowContext,
        inputs: &StepInputs,
    ) -> impl Future<Output = Result<StepOutputs, HandlerError>> + Send;
}

/// Object-safe version of [`StepHandler`] with boxed futures.
pub trait StepHandlerDyn: Send + Sync {
    fn handle_boxed<'a>(
        &'a self,
        step: &'a StepDefinition,
        context: &'a WorkflowContext,
        inputs: &'a StepInputs,
    ) -> Pin<Box<dyn Future<Output = Result<StepOutputs, HandlerError>> + Send + 'a>>;
}

impl<T: StepHandler> StepHandlerDyn for T {
    fn handle_boxed<'a>(
        &'a self,
        step: &'a StepDefinition,
        context: &'a WorkflowContext,
        inputs: &'a StepInputs,
    ) -> Pin<Box<dyn Future<Output = Result<StepOutputs, HandlerError>> + Send + 'a>> {
        Box::pin(self.handle(step, context, inputs))
    }
}

/// Type-erased step handler stored in the registry.
pub struct BoxStepHandler {
    inner: Box<dyn StepHandlerDyn>,
}

impl BoxStepHandler {
    pub fn new<T: StepHandler + 'static>(handler: T) -> Self {
        Self {
            inner: Box::new(handler),
        }
    }

    pub async fn handle(
        &self,
        step: &StepDefinition,
        context: &WorkflowContext,
        inputs: &StepInputs,
    ) -> Result<StepOutputs, HandlerError> {
        self.inner.handle_boxed(step, context, inputs).await
    }
}

impl fmt::Debug for BoxStepHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BoxStepHandler").finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// Closure adapter
// ---------------------------------------------------------------------------

/// Owned arguments handed to closure handlers.
#[derive(Debug, Clone)]
pub struct HandlerCall {
    pub step_id: String,
    pub context: WorkflowContext,
    pub inputs: StepInputs,
}

/// `StepHandler` backed by an async closure. Build with [`handler_fn`].
pub struct FnHandler<F> {
    f: F,
}

/// Adapt an async closure into a `StepHandler`.
///
/// ```ignore
/// registry.register("double", handler_fn(|call: HandlerCall| async move {
///     let n = call.inputs.get("n").and_then(Value::as_i64).unwrap_or(0);
///     let mut out = StepOutputs::new();
///     out.insert("n".into(), Value::from(n * 2));
///     Ok(out)
/// }));
/// ```
pub fn handler_fn<F, Fut>(f: F) -> FnHandler<F>
where
    F: Fn(HandlerCall) -> Fut + Send + Sync,
    Fut: Future<Output = Result<StepOutputs, HandlerError>> + Send,
{
    FnHandler { f }
}

impl<F, Fut> StepHandler for FnHandler<F>
where
    F: Fn(HandlerCall) -> Fut + Send + Sync,
    Fut: Future<Output = Result<StepOutputs, HandlerError>> + Send,
{
    fn handle(
        &self,
        step: &StepDefinition,
        context: &WorkflowContext,
        inputs: &StepInputs,
    ) -> impl Future<Output = Result<StepOutputs, HandlerError>> + Send {
        (self.f)(HandlerCall {
            step_id: step.id.clone(),
            context: context.clone(),
            inputs: inputs.clone(),
        })
    }
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

/// Name-indexed registry of ACTION handlers.
///
/// Cheap to clone and safe to mutate while runs are in flight. Registering
/// an existing name replaces the handler; steps resolve their handler once
/// when they start, so a replacement only affects steps started afterwards.
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    handlers: Arc<DashMap<String, Arc<BoxStepHandler>>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler under the given name, replacing any previous one.
    pub fn register<T: StepHandler + 'static>(&self, name: impl Into<String>, handler: T) {
        let name = name.into();
        if self
            .handlers
            .insert(name.clone(), Arc::new(BoxStepHandler::new(handler)))
            .is_some()
        {
            tracing::debug!(handler = %name, "replaced step handler");
        }
    }

    /// Remove a handler. Returns whether one was registered.
    pub fn unregister(&self, name: &str) -> bool {
        self.handlers.remove(name).is_some()
    }

    /// Look up a handler by name.
    pub fn get(&self, name: &str) -> Option<Arc<BoxStepHandler>> {
        self.handlers.get(name).map(|h| Arc::clone(h.value()))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.handlers.contains_key(name)
    }

    /// Registered handler names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.handlers.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }
}

impl fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("handlers", &self.names())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{Map, Value, json};
    use uuid::Uuid;

    struct Upper;

    impl StepHandler for Upper {
        async fn handle(
            &self,
            _step: &StepDefinition,
            _context: &WorkflowContext,
            inputs: &StepInputs,
        ) -> Result<StepOutputs, HandlerError> {
            let text = inputs
                .get("text")
                .and_then(Value::as_str)
                .ok_or_else(|| HandlerError::fatal("missing text"))?;
            let mut out = Map::new();
            out.insert("text".into(), json!(text.to_uppercase()));
            Ok(out)
        }
    }

    fn context() -> WorkflowContext {
        WorkflowContext::new(Uuid::now_v7(), "wf", Map::new(), Map::new())
    }

    #[tokio::test]
    async fn test_struct_handler_through_registry() {
        let registry = HandlerRegistry::new();
        registry.register("upper", Upper);

        let handler = registry.get("upper").unwrap();
        let step = StepDefinition::action("shout", "upper");
        let mut inputs = Map::new();
        inputs.insert("text".into(), json!("hi"));

        let out = handler.handle(&step, &context(), &inputs).await.unwrap();
        assert_eq!(out["text"], json!("HI"));

        let err = handler.handle(&step, &context(), &Map::new()).await.unwrap_err();
        assert!(!err.retryable);
    }

    #[tokio::test]
    async fn test_closure_handler_sees_call() {
        let registry = HandlerRegistry::new();
        registry.register(
            "echo_id",
            handler_fn(|call: HandlerCall| async move {
                let mut out = Map::new();
                out.insert("step".into(), json!(call.step_id));
                out.insert("run".into(), json!(call.context.run_id().to_string()));
                Ok(out)
            }),
        );

        let ctx = context();
        let step = StepDefinition::action("s1", "echo_id");
        let out = registry
            .get("echo_id")
            .unwrap()
            .handle(&step, &ctx, &Map::new())
            .await
            .unwrap();
        assert_eq!(out["step"], json!("s1"));
        assert_eq!(out["run"], json!(ctx.run_id().to_string()));
    }

    #[tokio::test]
    async fn test_register_replaces_last_writer_wins() {
        let registry = HandlerRegistry::new();
        registry.register(
            "h",
            handler_fn(|_| async { Err(HandlerError::retryable("old")) }),
        );
        let old = registry.get("h").unwrap();
        registry.register("h", handler_fn(|_| async { Ok(Map::new()) }));

        let step = StepDefinition::action("s", "h");
        assert!(registry.get("h").unwrap().handle(&step, &context(), &Map::new()).await.is_ok());
        // A previously resolved handler keeps working for its caller.
        assert!(old.handle(&step, &context(), &Map::new()).await.is_err());
        assert_eq!(registry.names(), vec!["h".to_string()]);
    }

    #[test]
    fn test_unregister_and_lookup_missing() {
        let registry = HandlerRegistry::new();
        registry.register("h", Upper);
        assert!(registry.contains("h"));
        assert!(registry.unregister("h"));
        assert!(!registry.unregister("h"));
        assert!(registry.get("h").is_none());
    }

    #[test]
    fn test_anyhow_conversion_is_retryable() {
        let err: HandlerError = anyhow::anyhow!("connection reset").into();
        assert!(err.retryable);
        assert_eq!(err.to_string(), "connection reset");
    }
}
