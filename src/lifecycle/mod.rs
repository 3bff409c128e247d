//! Phase lifecycle: registry ownership, transitions, bodies and hooks.

pub mod body;
pub mod handler;
pub mod manager;

pub use body::{EchoBody, FnBody, PhaseBody};
pub use handler::{FailureContext, NoopHandler, TransitionHandler};
pub use manager::{ActivePhaseInfo, LifecycleManager, PhaseInfo, state_key};
