//! Phase data model: types, states and contexts.

pub mod context;
pub mod kind;
pub mod state;

pub use context::{
    ChildSummary, DeferredOutcome, PhaseContext, PhaseOutcome, PhaseSpec, PhaseStatus,
};
pub use kind::{BuiltinPhase, CustomPhaseType, PHASE_TYPE_PREFIX, PhaseType};
pub use state::PhaseState;
