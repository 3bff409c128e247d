//! Phase lifecycle orchestration: state machines, circuit breakers, nested
//! parent/child executions, a watchdog and checkpoints for trees of phases.

pub mod breaker;
pub mod checkpoint;
pub mod config;
pub mod coordinator;
pub mod errors;
pub mod lifecycle;
pub mod monitor;
pub mod nested;
pub mod phase;
pub mod registry;
pub mod services;
pub mod telemetry;

pub use breaker::{CircuitBreakerConfig, CircuitBreakerManager};
pub use checkpoint::{CheckpointManager, CheckpointRecord};
pub use config::CoordinatorConfig;
pub use coordinator::{CoordinatorInfo, PhaseCoordinator, PhaseTypeInfo, RegisteredTypes, TypeOrigin};
pub use errors::{BodyError, CoordinatorError, HandlerError, ServiceError};
pub use lifecycle::{LifecycleManager, PhaseBody, TransitionHandler};
pub use monitor::{HealthReport, HealthStatus, PhaseMonitor};
pub use nested::{NestedExecutionCoordinator, NestedRequest, Priority};
pub use phase::{BuiltinPhase, PhaseContext, PhaseOutcome, PhaseSpec, PhaseState, PhaseStatus, PhaseType};
pub use services::{InMemoryServices, Services};
