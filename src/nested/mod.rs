//! Nested (parent -> child) phase executions.

pub mod coordinator;
pub mod execution;
pub mod timeouts;

pub use coordinator::{
    Assessment, NestedExecutionCoordinator, NestedRequest, SweepFinding, orphan_message,
};
pub use execution::{
    AlertLevel, ExecutionStatus, ExecutionSummary, NestedPhaseExecution, Priority, ProgressEntry,
};
pub use timeouts::resolve_timeout;
