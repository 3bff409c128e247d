//! Background watchdog: stall detection, execution alerts and orphaning,
//! cardinality metrics.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::json;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::health::{HealthReport, assess_health, count_by_state, count_by_type};
use crate::breaker::TRANSITION_BREAKER;
use crate::config::MonitorConfig;
use crate::lifecycle::LifecycleManager;
use crate::nested::{
    AlertLevel, Assessment, NestedExecutionCoordinator, NestedPhaseExecution, SweepFinding,
};
use crate::phase::{PhaseContext, PhaseState};
use crate::services::{EventKind, EventPriority};

/// What one sweep saw and did.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SweepReport {
    pub stalled: Vec<String>,
    pub alerts: usize,
    pub orphaned: Vec<String>,
    pub active_phases: usize,
}

/// Grade one pending execution against the thresholds.
///
/// Past the timeout it expires. Above the critical share it alerts only if
/// idle longer than `critical_idle`; above the warning share only if idle
/// longer than `warning_idle`.
pub fn assess_execution(
    record: &NestedPhaseExecution,
    now: DateTime<Utc>,
    config: &MonitorConfig,
) -> Assessment {
    let elapsed = record.elapsed_secs(now);
    let timeout = record.timeout_secs as f64;
    if elapsed > timeout {
        return Assessment::Expired;
    }
    let percent = if timeout > 0.0 {
        elapsed / timeout * 100.0
    } else {
        100.0
    };
    let idle = record.idle_secs(now);

    if percent > f64::from(config.critical_percent) {
        if idle > config.critical_idle_secs as f64 {
            return Assessment::Alert {
                level: AlertLevel::Critical,
                percent,
            };
        }
    } else if percent > f64::from(config.warning_percent)
        && idle > config.warning_idle_secs as f64
    {
        return Assessment::Alert {
            level: AlertLevel::Warning,
            percent,
        };
    }
    Assessment::Quiet
}

/// RUNNING phases whose body started more than `threshold_secs` ago.
pub fn stalled_phases(contexts: &[PhaseContext], now: DateTime<Utc>, threshold_secs: u64) -> Vec<String> {
    contexts
        .iter()
        .filter(|ctx| ctx.state == PhaseState::Running)
        .filter(|ctx| {
            ctx.started_at
                .is_some_and(|started| (now - started).num_seconds() > threshold_secs as i64)
        })
        .map(|ctx| ctx.id.clone())
        .collect()
}

struct Running {
    token: CancellationToken,
    handle: JoinHandle<()>,
}

#[derive(Clone)]
pub struct PhaseMonitor {
    lifecycle: LifecycleManager,
    nested: NestedExecutionCoordinator,
    config: Arc<MonitorConfig>,
    running: Arc<Mutex<Option<Running>>>,
}

impl PhaseMonitor {
    pub fn new(
        lifecycle: LifecycleManager,
        nested: NestedExecutionCoordinator,
        config: MonitorConfig,
    ) -> Self {
        Self {
            lifecycle,
            nested,
            config: Arc::new(config),
            running: Arc::new(Mutex::new(None)),
        }
    }

    pub fn config(&self) -> &MonitorConfig {
        &self.config
    }

    pub async fn sweep(&self) -> SweepReport {
        self.sweep_at(Utc::now()).await
    }

    /// One watchdog iteration against an explicit clock.
    pub async fn sweep_at(&self, now: DateTime<Utc>) -> SweepReport {
        let services = self.lifecycle.services();
        let contexts = self.lifecycle.contexts().await;

        let stalled = stalled_phases(&contexts, now, self.config.stall_threshold_secs);
        for id in &stalled {
            let phase_type = contexts
                .iter()
                .find(|ctx| &ctx.id == id)
                .map(|ctx| ctx.type_key().to_string())
                .unwrap_or_else(|| "unknown".to_string());
            warn!(phase_id = %id, phase_type = %phase_type, "phase appears to be stalled");
            services
                .metric(
                    "phase_coordinator:stalled_phase",
                    1.0,
                    Some(json!({
                        "phase_id": id,
                        "phase_type": phase_type,
                        "stalled_since": now.to_rfc3339(),
                    })),
                )
                .await;
            services
                .emit(
                    EventKind::StateChanged,
                    json!({
                        "event": "stalled",
                        "resource_id": format!("phase:{}", id),
                        "state": "stalled",
                        "timestamp": now.to_rfc3339(),
                    }),
                    EventPriority::Normal,
                )
                .await;
        }

        let active_phases = self.lifecycle.active_phases().await.len();
        self.record_cardinality(&contexts, active_phases, now).await;

        let config = self.config.clone();
        let findings = self
            .nested
            .sweep_pending(now, move |record, at| assess_execution(record, at, &config))
            .await;

        let mut report = SweepReport {
            stalled,
            active_phases,
            ..Default::default()
        };
        for finding in findings {
            match finding {
                SweepFinding::Alert {
                    execution,
                    level,
                    percent,
                } => {
                    report.alerts += 1;
                    self.raise_alert(&execution, level, percent, now).await;
                }
                SweepFinding::Orphaned { execution } => {
                    self.announce_orphan(&execution, now).await;
                    report.orphaned.push(execution.execution_id);
                }
            }
        }
        report
    }

    async fn record_cardinality(&self, contexts: &[PhaseContext], active: usize, now: DateTime<Utc>) {
        let services = self.lifecycle.services();
        let metadata = json!({"timestamp": now.to_rfc3339()});
        for (state, count) in count_by_state(contexts) {
            services
                .metric(
                    &format!("phase_coordinator:phases_by_state:{}", state),
                    count as f64,
                    Some(metadata.clone()),
                )
                .await;
        }
        for (phase_type, count) in count_by_type(contexts) {
            services
                .metric(
                    &format!("phase_coordinator:phases_by_type:{}", phase_type),
                    count as f64,
                    Some(metadata.clone()),
                )
                .await;
        }
        services
            .metric("phase_coordinator:active_phases", active as f64, Some(metadata))
            .await;
    }

    async fn raise_alert(
        &self,
        execution: &NestedPhaseExecution,
        level: AlertLevel,
        percent: f64,
        now: DateTime<Utc>,
    ) {
        match level {
            AlertLevel::Critical => warn!(
                execution_id = %execution.execution_id,
                parent_id = %execution.parent_id,
                child_id = %execution.child_id,
                percent = %format!("{:.1}", percent),
                "execution nearing timeout"
            ),
            AlertLevel::Warning => info!(
                execution_id = %execution.execution_id,
                parent_id = %execution.parent_id,
                child_id = %execution.child_id,
                percent = %format!("{:.1}", percent),
                "long-running execution"
            ),
        }
        self.lifecycle
            .services()
            .emit(
                EventKind::AlertCreated,
                json!({
                    "event": "execution_warning",
                    "resource_id": format!("nested_execution:{}", execution.execution_id),
                    "alert_type": "execution_warning",
                    "severity": level.as_str(),
                    "message": format!("Execution has been running for {:.1}% of timeout", percent),
                    "parent_phase": execution.parent_id,
                    "child_phase": execution.child_id,
                    "execution_time_seconds": execution.elapsed_secs(now),
                    "timeout_seconds": execution.timeout_secs,
                    "timestamp": now.to_rfc3339(),
                }),
                EventPriority::Normal,
            )
            .await;
    }

    async fn announce_orphan(&self, execution: &NestedPhaseExecution, now: DateTime<Utc>) {
        let message = execution.error.clone().unwrap_or_default();
        warn!(
            execution_id = %execution.execution_id,
            parent_id = %execution.parent_id,
            child_id = %execution.child_id,
            "orphaned nested execution"
        );
        self.lifecycle
            .services()
            .emit(
                EventKind::ErrorOccurred,
                json!({
                    "event": "orphaned",
                    "resource_id": format!("nested_execution:{}", execution.execution_id),
                    "error": message,
                    "error_type": "orphaned_execution",
                    "parent_phase": execution.parent_id,
                    "child_phase": execution.child_id,
                    "execution_details": {
                        "start_time": execution.started_at.to_rfc3339(),
                        "end_time": now.to_rfc3339(),
                        "duration_seconds": execution.elapsed_secs(now),
                        "health_checks": execution.health_checks.len(),
                        "progress_updates": execution.progress,
                    },
                    "timestamp": now.to_rfc3339(),
                }),
                EventPriority::High,
            )
            .await;
    }

    /// Aggregate health over every phase and breaker.
    pub async fn health(&self) -> HealthReport {
        let now = Utc::now();
        let contexts = self.lifecycle.contexts().await;
        let stalled = stalled_phases(&contexts, now, self.config.stall_threshold_secs).len();
        let active = self.lifecycle.active_phases().await.len();
        let mut open = self.lifecycle.breakers().open_breakers().await;
        let transition_open = open.iter().any(|key| key == TRANSITION_BREAKER);
        open.retain(|key| key != TRANSITION_BREAKER);
        assess_health(&contexts, active, stalled, open, transition_open, now)
    }

    /// Spawn the sweep loop. Returns false if it is already running.
    pub async fn start(&self) -> bool {
        let mut running = self.running.lock().await;
        if running.is_some() {
            return false;
        }
        let token = CancellationToken::new();
        let monitor = self.clone();
        let loop_token = token.clone();
        let handle = tokio::spawn(async move { monitor.run(loop_token).await });
        *running = Some(Running { token, handle });
        info!(interval_secs = self.config.interval_secs, "phase monitoring started");
        true
    }

    /// Cancel the loop and wait for it. Returns false if it was not running.
    pub async fn stop(&self) -> bool {
        let Some(Running { token, handle }) = self.running.lock().await.take() else {
            return false;
        };
        token.cancel();
        if let Err(e) = handle.await {
            error!(error = %e, "monitor task ended abnormally");
        }
        info!("phase monitoring stopped");
        true
    }

    pub async fn is_running(&self) -> bool {
        self.running.lock().await.is_some()
    }

    async fn run(self, token: CancellationToken) {
        loop {
            if token.is_cancelled() {
                break;
            }
            // Each sweep runs on its own task so a panic inside it is contained.
            let monitor = self.clone();
            let delay = match tokio::spawn(async move { monitor.sweep().await }).await {
                Ok(report) => {
                    debug!(
                        stalled = report.stalled.len(),
                        alerts = report.alerts,
                        orphaned = report.orphaned.len(),
                        "monitor sweep finished"
                    );
                    self.config.interval()
                }
                Err(e) => {
                    error!(error = %e, "monitor sweep failed");
                    self.config.error_backoff()
                }
            };
            tokio::select! {
                _ = token.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::breaker::CircuitBreakerManager;
    use crate::config::CoordinatorConfig;
    use crate::lifecycle::FnBody;
    use crate::monitor::HealthStatus;
    use crate::nested::{ExecutionStatus, NestedRequest, Priority};
    use crate::phase::PhaseSpec;
    use crate::registry::TypeRegistry;
    use crate::services::InMemoryServices;
    use serde_json::Value;
    use std::time::Duration;
    use tokio::sync::Notify;

    struct Fixture {
        lifecycle: LifecycleManager,
        nested: NestedExecutionCoordinator,
        monitor: PhaseMonitor,
        mem: InMemoryServices,
        started: Arc<Notify>,
        gate: Arc<Notify>,
    }

    async fn fixture() -> Fixture {
        let mem = InMemoryServices::new();
        let types = TypeRegistry::new();
        let config = CoordinatorConfig::default();
        let breakers = Arc::new(CircuitBreakerManager::new(
            &config,
            types.clone(),
            mem.services(),
        ));
        let lifecycle = LifecycleManager::new(types, breakers, mem.services());
        let nested = NestedExecutionCoordinator::new(lifecycle.clone(), config.nested.clone());
        let monitor = PhaseMonitor::new(lifecycle.clone(), nested.clone(), config.monitor.clone());

        let started = Arc::new(Notify::new());
        let gate = Arc::new(Notify::new());
        let (body_started, body_gate) = (started.clone(), gate.clone());
        lifecycle
            .register_body(
                "phase_two",
                Arc::new(FnBody::new(move |_ctx: PhaseContext, _input: Value| {
                    let started = body_started.clone();
                    let gate = body_gate.clone();
                    async move {
                        started.notify_one();
                        gate.notified().await;
                        Ok(json!({"finished": true}))
                    }
                })),
            )
            .await;

        Fixture {
            lifecycle,
            nested,
            monitor,
            mem,
            started,
            gate,
        }
    }

    fn record_started(secs_ago: i64, idle_secs: i64, timeout_secs: u64) -> (NestedPhaseExecution, DateTime<Utc>) {
        let now = Utc::now();
        let mut record = NestedPhaseExecution::new("e", "p", "c", timeout_secs, Priority::Normal);
        record.started_at = now - chrono::Duration::seconds(secs_ago);
        record.last_activity = now - chrono::Duration::seconds(idle_secs);
        (record, now)
    }

    #[test]
    fn test_assess_execution_thresholds() {
        let config = MonitorConfig::default();

        let (record, now) = record_started(100, 0, 3600);
        assert_eq!(assess_execution(&record, now, &config), Assessment::Quiet);

        // 55% elapsed, idle 31 minutes
        let (record, now) = record_started(1980, 1860, 3600);
        assert!(matches!(
            assess_execution(&record, now, &config),
            Assessment::Alert { level: AlertLevel::Warning, .. }
        ));

        // 55% elapsed but recently active
        let (record, now) = record_started(1980, 60, 3600);
        assert_eq!(assess_execution(&record, now, &config), Assessment::Quiet);

        // 80% elapsed, idle 16 minutes
        let (record, now) = record_started(2880, 960, 3600);
        assert!(matches!(
            assess_execution(&record, now, &config),
            Assessment::Alert { level: AlertLevel::Critical, .. }
        ));

        // 80% elapsed, idle 10 minutes: no alert at either level
        let (record, now) = record_started(2880, 600, 3600);
        assert_eq!(assess_execution(&record, now, &config), Assessment::Quiet);

        let (record, now) = record_started(3601, 0, 3600);
        assert_eq!(assess_execution(&record, now, &config), Assessment::Expired);
    }

    #[tokio::test]
    async fn test_sweep_flags_stalled_running_phase() {
        let f = fixture().await;
        f.lifecycle
            .initialize(PhaseSpec::new("slow", "phase_two"))
            .await
            .unwrap();
        let runner = f.lifecycle.clone();
        let handle = tokio::spawn(async move { runner.start("slow", json!({})).await });
        f.started.notified().await;

        let report = f.monitor.sweep_at(Utc::now()).await;
        assert!(report.stalled.is_empty());
        assert_eq!(report.active_phases, 1);

        let later = Utc::now() + chrono::Duration::hours(2);
        let report = f.monitor.sweep_at(later).await;
        assert_eq!(report.stalled, vec!["slow".to_string()]);
        assert_eq!(f.mem.metrics.count("phase_coordinator:stalled_phase").await, 1);
        assert_eq!(
            f.mem
                .metrics
                .last("phase_coordinator:phases_by_state:RUNNING")
                .await
                .unwrap()
                .value,
            1.0
        );
        assert_eq!(f.mem.events.events_named("stalled").await.len(), 1);

        // Stalled is a signal only.
        assert_eq!(f.lifecycle.context("slow").await.unwrap().state, PhaseState::Running);
        f.gate.notify_one();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_sweep_orphans_expired_execution_once() {
        let f = fixture().await;
        f.lifecycle
            .initialize(PhaseSpec::new("parent", "phase_one"))
            .await
            .unwrap();
        f.lifecycle
            .initialize(PhaseSpec::new("child", "phase_two").with_parent("parent"))
            .await
            .unwrap();

        let nested = f.nested.clone();
        let caller = tokio::spawn(async move {
            nested
                .coordinate(NestedRequest::new("parent", "child", json!({})).with_timeout(120))
                .await
        });
        f.started.notified().await;

        let later = Utc::now() + chrono::Duration::seconds(121);
        let report = f.monitor.sweep_at(later).await;
        assert_eq!(report.orphaned.len(), 1);
        let report = f.monitor.sweep_at(later + chrono::Duration::seconds(60)).await;
        assert!(report.orphaned.is_empty());

        let orphan_events = f.mem.events.events_named("orphaned").await;
        assert_eq!(orphan_events.len(), 1);
        assert_eq!(orphan_events[0].priority, EventPriority::High);
        assert_eq!(orphan_events[0].payload["error_type"], "orphaned_execution");

        let err = caller.await.unwrap().unwrap_err();
        assert_eq!(err.status_token(), "orphaned");
        let record = &f.nested.executions().await[0];
        assert_eq!(record.status, ExecutionStatus::Failed);
        assert!(
            record
                .error
                .as_deref()
                .unwrap()
                .starts_with("Execution orphaned - timed out after 2 minutes. Health checks: 1")
        );
        f.gate.notify_one();
    }

    #[tokio::test]
    async fn test_health_reports_open_transition_breaker() {
        let f = fixture().await;
        assert!(f.monitor.health().await.is_healthy());

        f.lifecycle.breakers().transition().await.trip();
        let report = f.monitor.health().await;
        assert!(report.transition_circuit_open);
        assert!(report.open_circuits.is_empty());
        assert_eq!(report.status, HealthStatus::Warning);
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_stop_loop() {
        let f = fixture().await;
        assert!(f.monitor.start().await);
        assert!(!f.monitor.start().await);
        assert!(f.monitor.is_running().await);

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(f.mem.metrics.count("phase_coordinator:active_phases").await >= 1);

        assert!(f.monitor.stop().await);
        assert!(!f.monitor.stop().await);
        assert!(!f.monitor.is_running().await);
    }
}
