//! Phase watchdog and health reporting.

pub mod health;
pub mod watchdog;

pub use health::{HealthReport, HealthStatus, assess_health};
pub use watchdog::{PhaseMonitor, SweepReport, assess_execution, stalled_phases};
