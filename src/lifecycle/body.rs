//! Phase bodies: the injected work a phase runs once it is allowed to start.

use std::future::Future;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::{Value, json};

use crate::errors::BodyError;
use crate::phase::PhaseContext;

#[async_trait]
pub trait PhaseBody: Send + Sync {
    /// Run the phase. `ctx` is a snapshot taken when the phase entered RUNNING.
    async fn run(&self, ctx: &PhaseContext, input: Value) -> Result<Value, BodyError>;
}

/// Body used when no body is registered for a type: echoes its input along
/// with the phase identity.
#[derive(Debug, Default, Clone, Copy)]
pub struct EchoBody;

#[async_trait]
impl PhaseBody for EchoBody {
    async fn run(&self, ctx: &PhaseContext, input: Value) -> Result<Value, BodyError> {
        Ok(json!({
            "status": "success",
            "phase_id": ctx.id,
            "phase_type": ctx.type_key(),
            "output": input,
            "completed_at": Utc::now().to_rfc3339(),
        }))
    }
}

/// Adapter turning a closure into a body.
pub struct FnBody<F> {
    f: F,
}

impl<F, Fut> FnBody<F>
where
    F: Fn(PhaseContext, Value) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Value, BodyError>> + Send,
{
    pub fn new(f: F) -> Self {
        Self { f }
    }
}

#[async_trait]
impl<F, Fut> PhaseBody for FnBody<F>
where
    F: Fn(PhaseContext, Value) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Value, BodyError>> + Send,
{
    async fn run(&self, ctx: &PhaseContext, input: Value) -> Result<Value, BodyError> {
        (self.f)(ctx.clone(), input).await
    }
}
