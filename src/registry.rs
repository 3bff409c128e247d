//! Custom phase type registry.
//!
//! A cheap-to-clone handle around a lock-guarded table. Every component that
//! needs to resolve type keys receives the same handle at construction.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use chrono::Utc;
use serde_json::Value;
use tokio::sync::RwLock;

use crate::errors::CoordinatorError;
use crate::phase::{BuiltinPhase, CustomPhaseType, PHASE_TYPE_PREFIX, PhaseType};

/// Result of a `register` call.
#[derive(Debug, Clone, PartialEq)]
pub enum Registration {
    Created(CustomPhaseType),
    Updated(CustomPhaseType),
}

impl Registration {
    pub fn phase_type(&self) -> &CustomPhaseType {
        match self {
            Registration::Created(t) | Registration::Updated(t) => t,
        }
    }
}

#[derive(Clone, Default)]
pub struct TypeRegistry {
    types: Arc<RwLock<HashMap<String, CustomPhaseType>>>,
}

impl TypeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Resolve a type key to a built-in kind or a registered custom type.
    pub async fn resolve(&self, key: &str) -> Result<PhaseType, CoordinatorError> {
        let key = key.trim();
        if key.is_empty() {
            return Err(CoordinatorError::InvalidPhaseType {
                phase_type: key.to_string(),
                reason: "phase type must not be empty".into(),
            });
        }
        if let Some(kind) = BuiltinPhase::from_key(key) {
            return Ok(PhaseType::Builtin(kind));
        }
        self.types
            .read()
            .await
            .get(key)
            .cloned()
            .map(PhaseType::Custom)
            .ok_or_else(|| CoordinatorError::UnknownPhaseType {
                phase_type: key.to_string(),
            })
    }

    pub async fn get(&self, id: &str) -> Option<CustomPhaseType> {
        self.types.read().await.get(id).cloned()
    }

    pub async fn contains(&self, id: &str) -> bool {
        self.types.read().await.contains_key(id)
    }

    /// All custom types, sorted by id.
    pub async fn list(&self) -> Vec<CustomPhaseType> {
        let mut types: Vec<_> = self.types.read().await.values().cloned().collect();
        types.sort_by(|a, b| a.id.cmp(&b.id));
        types
    }

    /// Register (or update) a custom type.
    ///
    /// The id must carry the `phase_` prefix and must not shadow a built-in.
    /// A declared parent must resolve and must not lead back to `id`.
    pub async fn register(
        &self,
        id: &str,
        description: &str,
        parent_type: Option<&str>,
        config: Value,
    ) -> Result<Registration, CoordinatorError> {
        let id = id.trim();
        let invalid = |reason: String| CoordinatorError::InvalidPhaseType {
            phase_type: id.to_string(),
            reason,
        };

        if !id.starts_with(PHASE_TYPE_PREFIX) || id.len() == PHASE_TYPE_PREFIX.len() {
            return Err(invalid(format!(
                "custom type ids must start with '{}' followed by a name",
                PHASE_TYPE_PREFIX
            )));
        }
        if BuiltinPhase::is_builtin_key(id) {
            return Err(invalid("id collides with a built-in phase type".into()));
        }

        let mut types = self.types.write().await;

        if let Some(parent) = parent_type {
            if parent == id {
                return Err(invalid("a type cannot be its own parent".into()));
            }
            if !BuiltinPhase::is_builtin_key(parent) && !types.contains_key(parent) {
                return Err(invalid(format!("parent type '{}' is not registered", parent)));
            }
            if chain_of(&types, parent).iter().any(|ancestor| ancestor == id) {
                return Err(invalid(format!(
                    "parent type '{}' would create an inheritance cycle",
                    parent
                )));
            }
        }

        let custom = CustomPhaseType {
            id: id.to_string(),
            description: description.to_string(),
            parent_type: parent_type.map(str::to_string),
            config: if config.is_null() {
                Value::Object(Default::default())
            } else {
                config
            },
            registered_at: Utc::now(),
        };

        let registration = if types.contains_key(id) {
            Registration::Updated(custom.clone())
        } else {
            Registration::Created(custom.clone())
        };
        types.insert(id.to_string(), custom);
        Ok(registration)
    }

    /// Re-insert a type exactly as recorded (used by checkpoint rollback).
    pub async fn restore(&self, custom: CustomPhaseType) {
        self.types.write().await.insert(custom.id.clone(), custom);
    }

    pub async fn unregister(&self, id: &str) -> Option<CustomPhaseType> {
        self.types.write().await.remove(id)
    }

    /// Ancestors of `key`, nearest first, ending at a built-in (or at the
    /// first unresolvable link). Built-in keys have an empty chain.
    pub async fn inheritance_chain(&self, key: &str) -> Vec<String> {
        let types = self.types.read().await;
        match types.get(key).and_then(|t| t.parent_type.as_deref()) {
            Some(parent) => chain_of(&types, parent),
            None => Vec::new(),
        }
    }

    /// `custom id -> inheritance chain` for every registered type.
    pub async fn inheritance_map(&self) -> BTreeMap<String, Vec<String>> {
        let types = self.types.read().await;
        types
            .values()
            .map(|t| {
                let chain = match t.parent_type.as_deref() {
                    Some(parent) => chain_of(&types, parent),
                    None => Vec::new(),
                };
                (t.id.clone(), chain)
            })
            .collect()
    }
}

/// `start` followed by its ancestors. Stops at a built-in, an unknown key,
/// or a repeated key.
fn chain_of(types: &HashMap<String, CustomPhaseType>, start: &str) -> Vec<String> {
    let mut chain = Vec::new();
    let mut seen = HashSet::new();
    let mut current = Some(start.to_string());

    while let Some(key) = current.take() {
        if !seen.insert(key.clone()) {
            break;
        }
        chain.push(key.clone());
        if BuiltinPhase::is_builtin_key(&key) {
            break;
        }
        current = types.get(&key).and_then(|t| t.parent_type.clone());
    }
    chain
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_resolve_builtin_and_custom() {
        let registry = TypeRegistry::new();
        assert!(matches!(
            registry.resolve("phase_one").await,
            Ok(PhaseType::Builtin(BuiltinPhase::One))
        ));
        assert!(matches!(
            registry.resolve("phase_custom").await,
            Err(CoordinatorError::UnknownPhaseType { .. })
        ));
        assert!(matches!(
            registry.resolve("  ").await,
            Err(CoordinatorError::InvalidPhaseType { .. })
        ));

        registry
            .register("phase_custom", "custom", None, json!({}))
            .await
            .unwrap();
        let resolved = registry.resolve("phase_custom").await.unwrap();
        assert!(resolved.is_custom());
    }

    #[tokio::test]
    async fn test_register_rejects_bad_ids() {
        let registry = TypeRegistry::new();
        for id in ["custom_eval", "phase_", "phase_two"] {
            let err = registry.register(id, "", None, Value::Null).await.unwrap_err();
            assert!(matches!(err, CoordinatorError::InvalidPhaseType { .. }), "{id}");
        }
        let err = registry
            .register("phase_eval", "", Some("phase_missing"), Value::Null)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("phase_missing"));
    }

    #[tokio::test]
    async fn test_reregistration_updates() {
        let registry = TypeRegistry::new();
        let first = registry
            .register("phase_eval", "v1", None, json!({}))
            .await
            .unwrap();
        assert!(matches!(first, Registration::Created(_)));

        let second = registry
            .register("phase_eval", "v2", Some("phase_one"), json!({"k": 1}))
            .await
            .unwrap();
        assert!(matches!(second, Registration::Updated(_)));
        let stored = registry.get("phase_eval").await.unwrap();
        assert_eq!(stored.description, "v2");
        assert_eq!(stored.config["k"], 1);
    }

    #[tokio::test]
    async fn test_inheritance_chain_walks_to_builtin() {
        let registry = TypeRegistry::new();
        registry
            .register("phase_custom_eval", "eval", Some("phase_two"), Value::Null)
            .await
            .unwrap();
        registry
            .register("phase_deep", "deep", Some("phase_custom_eval"), Value::Null)
            .await
            .unwrap();

        assert_eq!(
            registry.inheritance_chain("phase_custom_eval").await,
            vec!["phase_two".to_string()]
        );
        assert_eq!(
            registry.inheritance_chain("phase_deep").await,
            vec!["phase_custom_eval".to_string(), "phase_two".to_string()]
        );
        assert!(registry.inheritance_chain("phase_two").await.is_empty());

        let map = registry.inheritance_map().await;
        assert_eq!(map.len(), 2);
    }

    #[tokio::test]
    async fn test_register_rejects_cycles() {
        let registry = TypeRegistry::new();
        registry.register("phase_a", "a", None, Value::Null).await.unwrap();
        registry
            .register("phase_b", "b", Some("phase_a"), Value::Null)
            .await
            .unwrap();

        let err = registry
            .register("phase_a", "a", Some("phase_b"), Value::Null)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("cycle"));
        // The failed update leaves the original registration intact.
        assert!(registry.get("phase_a").await.unwrap().parent_type.is_none());
    }
}
