//! Nested execution records.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    High,
    #[default]
    Normal,
    Low,
}

impl Priority {
    pub fn as_str(&self) -> &'static str {
        match self {
            Priority::High => "high",
            Priority::Normal => "normal",
            Priority::Low => "low",
        }
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Priority {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "high" => Ok(Priority::High),
            "normal" => Ok(Priority::Normal),
            "low" => Ok(Priority::Low),
            other => Err(format!("unknown priority '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionStatus {
    Pending,
    Completed,
    Failed,
    Recovered,
}

impl ExecutionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionStatus::Pending => "pending",
            ExecutionStatus::Completed => "completed",
            ExecutionStatus::Failed => "failed",
            ExecutionStatus::Recovered => "recovered",
        }
    }

    pub fn is_final(&self) -> bool {
        !matches!(self, ExecutionStatus::Pending)
    }
}

impl fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Alert raised by the watchdog for a slow, idle execution. Ordered by
/// severity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum AlertLevel {
    Warning,
    Critical,
}

impl AlertLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertLevel::Warning => "WARNING",
            AlertLevel::Critical => "CRITICAL",
        }
    }
}

/// One step of an execution's progress log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressEntry {
    pub step: String,
    pub status: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub details: Map<String, Value>,
}

impl ProgressEntry {
    pub fn new(step: impl Into<String>, status: impl Into<String>) -> Self {
        Self {
            step: step.into(),
            status: status.into(),
            timestamp: Utc::now(),
            details: Map::new(),
        }
    }

    pub fn with(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.details.insert(key.to_string(), value.into());
        self
    }
}

/// Bookkeeping for one parent-initiated child start.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NestedPhaseExecution {
    pub execution_id: String,
    pub parent_id: String,
    pub child_id: String,
    pub status: ExecutionStatus,
    pub priority: Priority,
    pub timeout_secs: u64,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
    pub last_activity: DateTime<Utc>,
    /// Append-only, in execution order
    pub progress: Vec<ProgressEntry>,
    #[serde(default)]
    pub health_checks: Vec<DateTime<Utc>>,
    /// Highest alert raised so far
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alert_level: Option<AlertLevel>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
}

impl NestedPhaseExecution {
    pub fn new(
        execution_id: impl Into<String>,
        parent_id: impl Into<String>,
        child_id: impl Into<String>,
        timeout_secs: u64,
        priority: Priority,
    ) -> Self {
        let now = Utc::now();
        Self {
            execution_id: execution_id.into(),
            parent_id: parent_id.into(),
            child_id: child_id.into(),
            status: ExecutionStatus::Pending,
            priority,
            timeout_secs,
            started_at: now,
            ended_at: None,
            last_activity: now,
            progress: vec![ProgressEntry::new("initialization", "started")],
            health_checks: Vec::new(),
            alert_level: None,
            result: None,
            error: None,
            metadata: None,
        }
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn is_pending(&self) -> bool {
        self.status == ExecutionStatus::Pending
    }

    /// Append a progress entry and bump the activity clock.
    pub fn record(&mut self, entry: ProgressEntry) {
        self.last_activity = entry.timestamp.max(self.last_activity);
        self.progress.push(entry);
    }

    /// Seconds since the execution started, never negative.
    pub fn elapsed_secs(&self, now: DateTime<Utc>) -> f64 {
        ((now - self.started_at).num_milliseconds().max(0) as f64) / 1000.0
    }

    pub fn idle_secs(&self, now: DateTime<Utc>) -> f64 {
        ((now - self.last_activity).num_milliseconds().max(0) as f64) / 1000.0
    }

    /// Move out of `pending`. Returns false if already finalized.
    pub fn finalize(
        &mut self,
        status: ExecutionStatus,
        result: Option<Value>,
        error: Option<String>,
        now: DateTime<Utc>,
    ) -> bool {
        if !self.is_pending() || !status.is_final() {
            return false;
        }
        self.status = status;
        self.result = result;
        self.error = error;
        self.ended_at = Some(now);
        true
    }
}

/// Execution counts by status.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionSummary {
    pub total: usize,
    pub pending: usize,
    pub completed: usize,
    pub failed: usize,
    pub recovered: usize,
}

impl ExecutionSummary {
    pub fn count(&mut self, status: ExecutionStatus) {
        self.total += 1;
        match status {
            ExecutionStatus::Pending => self.pending += 1,
            ExecutionStatus::Completed => self.completed += 1,
            ExecutionStatus::Failed => self.failed += 1,
            ExecutionStatus::Recovered => self.recovered += 1,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_priority_parse() {
        assert_eq!("HIGH".parse::<Priority>().unwrap(), Priority::High);
        assert!("urgent".parse::<Priority>().is_err());
        assert_eq!(Priority::default(), Priority::Normal);
    }

    #[test]
    fn test_finalize_only_once() {
        let mut exec = NestedPhaseExecution::new("e1", "p", "c", 60, Priority::Normal);
        assert_eq!(exec.progress.len(), 1);
        let now = Utc::now();
        assert!(exec.finalize(ExecutionStatus::Failed, None, Some("orphaned".into()), now));
        assert!(!exec.finalize(ExecutionStatus::Completed, Some(json!(1)), None, now));
        assert_eq!(exec.status, ExecutionStatus::Failed);
        assert_eq!(exec.error.as_deref(), Some("orphaned"));
    }

    #[test]
    fn test_record_bumps_activity() {
        let mut exec = NestedPhaseExecution::new("e1", "p", "c", 60, Priority::Low);
        let before = exec.last_activity;
        exec.record(ProgressEntry::new("handler_1", "completed").with("handler", "audit"));
        assert!(exec.last_activity >= before);
        assert_eq!(exec.progress[1].details["handler"], "audit");
    }

    #[test]
    fn test_alert_levels_are_ordered() {
        assert!(AlertLevel::Critical > AlertLevel::Warning);
        assert!(Some(AlertLevel::Warning) > None);
    }
}
