//! Transition handlers: pluggable hooks around nested starts, pause and resume.
//!
//! Every hook has a no-op default, so an implementation only overrides what
//! it needs. Hook errors are never fatal: the engine logs them and carries on
//! with the best value it has.

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;

use crate::errors::HandlerError;
use crate::nested::ProgressEntry;
use crate::phase::PhaseContext;

/// Everything known about a failed nested execution, offered to `on_failure`.
#[derive(Debug, Clone, Serialize)]
pub struct FailureContext {
    pub execution_id: String,
    pub parent_id: String,
    pub child_id: String,
    /// Input after every `before_start` rewrite
    pub input: Value,
    pub error: String,
    pub progress: Vec<ProgressEntry>,
}

#[async_trait]
pub trait TransitionHandler: Send + Sync {
    /// Name used in progress logs and warnings.
    fn name(&self) -> &str {
        "transition_handler"
    }

    /// Rewrite the input before a child starts.
    async fn before_start(&self, _child_id: &str, input: &Value) -> Result<Value, HandlerError> {
        Ok(input.clone())
    }

    /// Rewrite a child's result after it completes.
    async fn after_completion(
        &self,
        _child_id: &str,
        result: &Value,
    ) -> Result<Value, HandlerError> {
        Ok(result.clone())
    }

    /// Offer a recovery value for a failed child. `Ok(None)` means no recovery.
    async fn on_failure(
        &self,
        _child_id: &str,
        _error: &str,
        _context: &FailureContext,
    ) -> Result<Option<Value>, HandlerError> {
        Ok(None)
    }

    async fn on_pause(
        &self,
        _phase_id: &str,
        _reason: &str,
        _context: &PhaseContext,
    ) -> Result<(), HandlerError> {
        Ok(())
    }

    async fn on_resume(&self, _phase_id: &str, _context: &PhaseContext) -> Result<(), HandlerError> {
        Ok(())
    }
}

/// Handler that keeps every default.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopHandler;

#[async_trait]
impl TransitionHandler for NoopHandler {
    fn name(&self) -> &str {
        "noop"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_noop_handler_passes_values_through() {
        let handler = NoopHandler;
        let input = json!({"x": 1});
        assert_eq!(handler.before_start("c", &input).await.unwrap(), input);
        assert_eq!(handler.after_completion("c", &input).await.unwrap(), input);

        let context = FailureContext {
            execution_id: "e".into(),
            parent_id: "p".into(),
            child_id: "c".into(),
            input: json!({}),
            error: "boom".into(),
            progress: vec![],
        };
        assert!(handler.on_failure("c", "boom", &context).await.unwrap().is_none());
        assert_eq!(handler.name(), "noop");
    }
}
