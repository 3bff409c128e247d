//! Phase type model: a fixed set of built-in kinds plus runtime-registered
//! custom types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Prefix every phase type key (built-in or custom) must carry.
pub const PHASE_TYPE_PREFIX: &str = "phase_";

/// Built-in phase kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BuiltinPhase {
    #[serde(rename = "phase_zero")]
    Zero,
    #[serde(rename = "phase_one")]
    One,
    #[serde(rename = "phase_two")]
    Two,
    #[serde(rename = "phase_three")]
    Three,
    #[serde(rename = "phase_four")]
    Four,
}

impl BuiltinPhase {
    pub const ALL: [BuiltinPhase; 5] = [
        BuiltinPhase::Zero,
        BuiltinPhase::One,
        BuiltinPhase::Two,
        BuiltinPhase::Three,
        BuiltinPhase::Four,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            BuiltinPhase::Zero => "phase_zero",
            BuiltinPhase::One => "phase_one",
            BuiltinPhase::Two => "phase_two",
            BuiltinPhase::Three => "phase_three",
            BuiltinPhase::Four => "phase_four",
        }
    }

    /// Look up a built-in kind by its key (case-insensitive).
    pub fn from_key(key: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|kind| kind.as_str().eq_ignore_ascii_case(key))
    }

    pub fn is_builtin_key(key: &str) -> bool {
        Self::from_key(key).is_some()
    }
}

impl std::fmt::Display for BuiltinPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A runtime-registered phase type.
///
/// `parent_type` is descriptive: it feeds the inheritance chain used for
/// introspection and for configuration fallback (breaker configs, nested
/// timeouts). It never changes how a phase behaves.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CustomPhaseType {
    pub id: String,
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_type: Option<String>,
    #[serde(default)]
    pub config: Value,
    pub registered_at: DateTime<Utc>,
}

impl CustomPhaseType {
    pub fn new(id: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            description: description.into(),
            parent_type: None,
            config: Value::Object(Default::default()),
            registered_at: Utc::now(),
        }
    }

    pub fn with_parent(mut self, parent_type: impl Into<String>) -> Self {
        self.parent_type = Some(parent_type.into());
        self
    }

    pub fn with_config(mut self, config: Value) -> Self {
        self.config = config;
        self
    }
}

/// Type of a phase: one of the built-in kinds or a custom registration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum PhaseType {
    Builtin(BuiltinPhase),
    Custom(CustomPhaseType),
}

impl PhaseType {
    /// Registry key of this type (`phase_one`, `phase_custom_eval`, ...).
    pub fn key(&self) -> &str {
        match self {
            PhaseType::Builtin(kind) => kind.as_str(),
            PhaseType::Custom(custom) => &custom.id,
        }
    }

    pub fn is_custom(&self) -> bool {
        matches!(self, PhaseType::Custom(_))
    }

    pub fn as_custom(&self) -> Option<&CustomPhaseType> {
        match self {
            PhaseType::Custom(custom) => Some(custom),
            PhaseType::Builtin(_) => None,
        }
    }
}

impl From<BuiltinPhase> for PhaseType {
    fn from(kind: BuiltinPhase) -> Self {
        PhaseType::Builtin(kind)
    }
}

impl std::fmt::Display for PhaseType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.key())
    }
}
