//! Phase context, initialization specs, start outcomes and status snapshots.

use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::kind::{CustomPhaseType, PhaseType};
use super::state::PhaseState;

/// Full record of one phase, owned by the lifecycle manager's registry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhaseContext {
    pub id: String,
    pub phase_type: PhaseType,
    pub state: PhaseState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent: Option<String>,
    #[serde(default)]
    pub children: BTreeSet<String>,
    #[serde(default)]
    pub dependencies: BTreeSet<String>,
    #[serde(default)]
    pub config: Value,
    #[serde(default)]
    pub metrics: BTreeMap<String, Value>,
    /// Checkpoint ids in creation order
    #[serde(default)]
    pub checkpoints: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default)]
    pub metadata: BTreeMap<String, Value>,
    /// Body outcome that arrived while the phase was paused; applied on resume.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deferred: Option<DeferredOutcome>,
}

impl PhaseContext {
    pub fn new(id: impl Into<String>, phase_type: PhaseType) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            phase_type,
            state: PhaseState::Initializing,
            parent: None,
            children: BTreeSet::new(),
            dependencies: BTreeSet::new(),
            config: Value::Object(Default::default()),
            metrics: BTreeMap::new(),
            checkpoints: Vec::new(),
            created_at: now,
            updated_at: now,
            started_at: None,
            completed_at: None,
            error: None,
            result: None,
            metadata: BTreeMap::new(),
            deferred: None,
        }
    }

    pub fn type_key(&self) -> &str {
        self.phase_type.key()
    }

    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }

    /// Time spent since the body started, up to completion or `now`.
    pub fn elapsed(&self, now: DateTime<Utc>) -> Option<Duration> {
        let started = self.started_at?;
        let end = self.completed_at.unwrap_or(now);
        (end - started).to_std().ok()
    }
}

/// Outcome of a body that finished while its phase was paused.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeferredOutcome {
    pub succeeded: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<String>,
    pub finished_at: DateTime<Utc>,
}

/// Everything needed to initialize a phase.
#[derive(Debug, Clone, Default)]
pub struct PhaseSpec {
    pub id: String,
    pub phase_type: String,
    pub config: Value,
    pub parent: Option<String>,
    pub dependencies: Vec<String>,
    pub metadata: BTreeMap<String, Value>,
}

impl PhaseSpec {
    pub fn new(id: impl Into<String>, phase_type: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            phase_type: phase_type.into(),
            config: Value::Object(Default::default()),
            ..Default::default()
        }
    }

    pub fn with_config(mut self, config: Value) -> Self {
        self.config = config;
        self
    }

    pub fn with_parent(mut self, parent: impl Into<String>) -> Self {
        self.parent = Some(parent.into());
        self
    }

    pub fn with_dependencies<I, S>(mut self, deps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.dependencies.extend(deps.into_iter().map(Into::into));
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    /// Declared dependencies plus any listed under `config["dependencies"]`.
    pub fn all_dependencies(&self) -> BTreeSet<String> {
        let mut deps: BTreeSet<String> = self.dependencies.iter().cloned().collect();
        if let Some(listed) = self.config.get("dependencies").and_then(Value::as_array) {
            deps.extend(listed.iter().filter_map(Value::as_str).map(str::to_string));
        }
        deps
    }

    /// Handler names listed under `config["handlers"]`.
    pub fn handler_names(&self) -> Vec<String> {
        self.config
            .get("handlers")
            .and_then(Value::as_array)
            .map(|names| {
                names
                    .iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default()
    }
}

/// Structured result of `start`. A failed body is an outcome, not an error.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhaseOutcome {
    pub phase_id: String,
    pub state: PhaseState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

impl PhaseOutcome {
    pub fn from_context(ctx: &PhaseContext) -> Self {
        Self {
            phase_id: ctx.id.clone(),
            state: ctx.state,
            result: ctx.result.clone(),
            error: ctx.error.clone(),
            started_at: ctx.started_at,
            completed_at: ctx.completed_at,
        }
    }

    pub fn is_success(&self) -> bool {
        self.state == PhaseState::Completed
    }

    pub fn is_failure(&self) -> bool {
        self.state == PhaseState::Failed
    }
}

/// Recursive summary of a child phase inside a status snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChildSummary {
    pub id: String,
    pub phase_type: String,
    pub state: PhaseState,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<ChildSummary>,
}

/// Deep snapshot returned by `status`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhaseStatus {
    pub id: String,
    pub phase_type: String,
    pub state: PhaseState,
    pub parent: Option<String>,
    pub children: Vec<ChildSummary>,
    pub dependencies: Vec<String>,
    pub custom_type: Option<CustomPhaseType>,
    pub inheritance_chain: Vec<String>,
    pub config: Value,
    pub metrics: BTreeMap<String, Value>,
    pub metadata: BTreeMap<String, Value>,
    pub checkpoints: Vec<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
    pub elapsed_seconds: Option<f64>,
    pub error: Option<String>,
    pub result: Option<Value>,
}

impl PhaseStatus {
    pub fn is_custom_type(&self) -> bool {
        self.custom_type.is_some()
    }
}
