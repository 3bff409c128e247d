//! Aggregate health report over phases and breakers.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::phase::{BuiltinPhase, PhaseContext, PhaseState};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum HealthStatus {
    Healthy,
    Warning,
    Degraded,
    Critical,
}

impl HealthStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            HealthStatus::Healthy => "HEALTHY",
            HealthStatus::Warning => "WARNING",
            HealthStatus::Degraded => "DEGRADED",
            HealthStatus::Critical => "CRITICAL",
        }
    }
}

impl fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthReport {
    pub status: HealthStatus,
    pub description: String,
    pub state_counts: BTreeMap<String, usize>,
    pub type_counts: BTreeMap<String, usize>,
    pub active_phases: usize,
    pub stalled_phases: usize,
    /// Open per-type breakers, sorted
    pub open_circuits: Vec<String>,
    pub transition_circuit_open: bool,
    pub timestamp: DateTime<Utc>,
}

impl HealthReport {
    pub fn is_healthy(&self) -> bool {
        self.status == HealthStatus::Healthy
    }
}

/// Counts for every state, zero-filled.
pub fn count_by_state(contexts: &[PhaseContext]) -> BTreeMap<String, usize> {
    let mut counts: BTreeMap<String, usize> = PhaseState::ALL
        .iter()
        .map(|state| (state.as_str().to_string(), 0))
        .collect();
    for ctx in contexts {
        *counts.entry(ctx.state.as_str().to_string()).or_default() += 1;
    }
    counts
}

/// Counts per type key; built-in keys are always present.
pub fn count_by_type(contexts: &[PhaseContext]) -> BTreeMap<String, usize> {
    let mut counts: BTreeMap<String, usize> = BuiltinPhase::ALL
        .iter()
        .map(|kind| (kind.as_str().to_string(), 0))
        .collect();
    for ctx in contexts {
        *counts.entry(ctx.type_key().to_string()).or_default() += 1;
    }
    counts
}

/// Derive the overall status.
///
/// FAILED phases make it CRITICAL, ABORTED ones DEGRADED; stalled phases
/// and open breakers only lift a HEALTHY report to WARNING.
pub fn assess_health(
    contexts: &[PhaseContext],
    active_phases: usize,
    stalled_phases: usize,
    open_circuits: Vec<String>,
    transition_circuit_open: bool,
    now: DateTime<Utc>,
) -> HealthReport {
    let state_counts = count_by_state(contexts);
    let type_counts = count_by_type(contexts);
    let failed = state_counts
        .get(PhaseState::Failed.as_str())
        .copied()
        .unwrap_or(0);
    let aborted = state_counts
        .get(PhaseState::Aborted.as_str())
        .copied()
        .unwrap_or(0);

    let mut status = HealthStatus::Healthy;
    let mut details = Vec::new();

    if failed > 0 {
        status = HealthStatus::Critical;
        details.push(format!("{} phases in FAILED state", failed));
    }
    if aborted > 0 {
        if status != HealthStatus::Critical {
            status = HealthStatus::Degraded;
        }
        details.push(format!("{} phases in ABORTED state", aborted));
    }
    if stalled_phases > 0 {
        if status == HealthStatus::Healthy {
            status = HealthStatus::Warning;
        }
        details.push(format!("{} phases appear to be stalled", stalled_phases));
    }
    if !open_circuits.is_empty() {
        if status == HealthStatus::Healthy {
            status = HealthStatus::Warning;
        }
        details.push(format!(
            "Circuit breakers open for phases: {}",
            open_circuits.join(", ")
        ));
    }
    if transition_circuit_open {
        if status == HealthStatus::Healthy {
            status = HealthStatus::Warning;
        }
        details.push("Transition circuit breaker is open".to_string());
    }

    HealthReport {
        status,
        description: if details.is_empty() {
            "All phases healthy".to_string()
        } else {
            details.join("; ")
        },
        state_counts,
        type_counts,
        active_phases,
        stalled_phases,
        open_circuits,
        transition_circuit_open,
        timestamp: now,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx(id: &str, state: PhaseState) -> PhaseContext {
        let mut ctx = PhaseContext::new(id, BuiltinPhase::One.into());
        ctx.state = state;
        ctx
    }

    #[test]
    fn test_healthy_when_nothing_wrong() {
        let report = assess_health(&[ctx("a", PhaseState::Completed)], 0, 0, vec![], false, Utc::now());
        assert!(report.is_healthy());
        assert_eq!(report.description, "All phases healthy");
        assert_eq!(report.state_counts["COMPLETED"], 1);
        assert_eq!(report.state_counts["RUNNING"], 0);
        assert_eq!(report.type_counts["phase_one"], 1);
        assert_eq!(report.type_counts["phase_four"], 0);
    }

    #[test]
    fn test_failed_beats_everything() {
        let contexts = [ctx("a", PhaseState::Failed), ctx("b", PhaseState::Aborted)];
        let report = assess_health(&contexts, 0, 2, vec!["phase_one".into()], true, Utc::now());
        assert_eq!(report.status, HealthStatus::Critical);
        assert!(report.description.contains("1 phases in FAILED state"));
        assert!(report.description.contains("Transition circuit breaker is open"));
    }

    #[test]
    fn test_aborted_is_degraded() {
        let report = assess_health(&[ctx("a", PhaseState::Aborted)], 0, 1, vec![], false, Utc::now());
        assert_eq!(report.status, HealthStatus::Degraded);
    }

    #[test]
    fn test_open_breaker_is_warning() {
        let report = assess_health(&[], 0, 0, vec!["phase_two".into()], false, Utc::now());
        assert_eq!(report.status, HealthStatus::Warning);
        assert_eq!(report.description, "Circuit breakers open for phases: phase_two");

        let report = assess_health(&[], 0, 0, vec![], true, Utc::now());
        assert_eq!(report.status, HealthStatus::Warning);
    }
}
