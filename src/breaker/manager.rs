//! Breaker registry: one breaker per phase type plus the dedicated
//! `transition` breaker guarding nested child starts.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use serde::Serialize;
use serde_json::json;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use super::circuit::{BreakerState, CircuitBreaker, CircuitBreakerConfig};
use crate::config::CoordinatorConfig;
use crate::errors::CoordinatorError;
use crate::phase::BuiltinPhase;
use crate::registry::TypeRegistry;
use crate::services::{Services, StateKind};

/// Key of the breaker guarding nested transitions.
pub const TRANSITION_BREAKER: &str = "transition";

/// State store key holding every breaker config.
pub const BREAKER_CONFIG_KEY: &str = "phase_coordinator:circuit_breaker_configs";

/// Breaker used when a key has no breaker of its own.
const FALLBACK_BREAKER: &str = "phase_one";

/// Point-in-time view of one breaker.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BreakerSnapshot {
    pub key: String,
    pub state: BreakerState,
    pub config: CircuitBreakerConfig,
    pub failure_count: usize,
}

pub struct CircuitBreakerManager {
    breakers: RwLock<HashMap<String, Arc<CircuitBreaker>>>,
    /// Configured values, including overrides for breakers not yet created
    configs: RwLock<BTreeMap<String, CircuitBreakerConfig>>,
    types: TypeRegistry,
    services: Services,
}

impl CircuitBreakerManager {
    pub fn new(config: &CoordinatorConfig, types: TypeRegistry, services: Services) -> Self {
        let configs = config.breaker_configs();
        let breakers = configs
            .iter()
            .filter(|(key, _)| is_fixed_key(key))
            .map(|(key, cfg)| (key.clone(), Arc::new(CircuitBreaker::new(key.clone(), *cfg))))
            .collect();
        Self {
            breakers: RwLock::new(breakers),
            configs: RwLock::new(configs),
            types,
            services,
        }
    }

    /// Apply configs persisted in the state store. Returns how many were applied.
    pub async fn load_configs(&self) -> usize {
        let Some(stored) = self.services.load(BREAKER_CONFIG_KEY).await else {
            return 0;
        };
        let parsed: BTreeMap<String, CircuitBreakerConfig> = match serde_json::from_value(stored) {
            Ok(parsed) => parsed,
            Err(e) => {
                warn!(error = %e, "ignoring malformed stored breaker configs");
                return 0;
            }
        };

        let mut applied = 0;
        let mut configs = self.configs.write().await;
        let breakers = self.breakers.read().await;
        for (key, cfg) in parsed {
            if let Err(reason) = cfg.validate() {
                warn!(breaker = %key, %reason, "skipping invalid stored breaker config");
                continue;
            }
            if let Some(breaker) = breakers.get(&key) {
                breaker.update_config(cfg);
            }
            configs.insert(key, cfg);
            applied += 1;
        }
        debug!(applied, "loaded breaker configs");
        applied
    }

    /// Persist every known config.
    pub async fn save_configs(&self) -> bool {
        let configs = self.configs.read().await.clone();
        let value = match serde_json::to_value(&configs) {
            Ok(value) => value,
            Err(e) => {
                warn!(error = %e, "failed to serialize breaker configs");
                return false;
            }
        };
        self.services
            .persist(
                BREAKER_CONFIG_KEY,
                value,
                StateKind::Configuration,
                Some(json!({"type": "circuit_breaker_configs"})),
            )
            .await
    }

    /// Breaker for `key`. Registered custom types get one on first use; keys
    /// with no breaker (e.g. a custom type mid-registration) share the
    /// `phase_one` breaker.
    pub async fn breaker_for(&self, key: &str) -> Arc<CircuitBreaker> {
        if let Some(breaker) = self.breakers.read().await.get(key) {
            return breaker.clone();
        }
        if let Some(breaker) = self.ensure_breaker(key).await {
            return breaker;
        }
        debug!(breaker = %key, "no breaker for key, using fallback");
        self.get_or_create(FALLBACK_BREAKER).await
    }

    pub async fn transition(&self) -> Arc<CircuitBreaker> {
        self.get_or_create(TRANSITION_BREAKER).await
    }

    /// Create the breaker for a registered custom type if it does not exist.
    ///
    /// Config resolution: an explicit entry for the key, else the nearest
    /// ancestor in the inheritance chain with one, else the baseline.
    pub async fn ensure_breaker(&self, key: &str) -> Option<Arc<CircuitBreaker>> {
        if !is_fixed_key(key) && !self.types.contains(key).await {
            return None;
        }
        let chain = self.types.inheritance_chain(key).await;
        let cfg = {
            let configs = self.configs.read().await;
            std::iter::once(key)
                .chain(chain.iter().map(String::as_str))
                .find_map(|k| configs.get(k).copied())
                .unwrap_or_default()
        };

        let mut breakers = self.breakers.write().await;
        let breaker = breakers
            .entry(key.to_string())
            .or_insert_with(|| {
                info!(breaker = %key, threshold = cfg.failure_threshold, "created circuit breaker");
                Arc::new(CircuitBreaker::new(key, cfg))
            })
            .clone();
        Some(breaker)
    }

    async fn get_or_create(&self, key: &str) -> Arc<CircuitBreaker> {
        if let Some(breaker) = self.breakers.read().await.get(key) {
            return breaker.clone();
        }
        let cfg = self
            .configs
            .read()
            .await
            .get(key)
            .copied()
            .unwrap_or_else(|| CircuitBreakerConfig::default_for(key));
        self.breakers
            .write()
            .await
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(CircuitBreaker::new(key, cfg)))
            .clone()
    }

    /// Hot-swap the config of `key` and persist all configs.
    ///
    /// Accepts `transition`, built-in keys and registered custom types.
    pub async fn update_config(
        &self,
        key: &str,
        cfg: CircuitBreakerConfig,
    ) -> Result<(), CoordinatorError> {
        if !is_fixed_key(key) && !self.types.contains(key).await {
            return Err(CoordinatorError::UnknownPhaseType {
                phase_type: key.to_string(),
            });
        }
        cfg.validate()
            .map_err(|reason| CoordinatorError::Config(format!("breaker {}: {}", key, reason)))?;

        self.configs.write().await.insert(key.to_string(), cfg);
        match self.breakers.read().await.get(key) {
            Some(breaker) => breaker.update_config(cfg),
            None => debug!(breaker = %key, "config stored for breaker not yet created"),
        }
        // Custom breakers are created eagerly so the new config is live.
        if !is_fixed_key(key) {
            self.ensure_breaker(key).await;
        }

        info!(
            breaker = %key,
            threshold = cfg.failure_threshold,
            recovery_secs = cfg.recovery_timeout_secs,
            window_secs = cfg.failure_window_secs,
            "updated circuit breaker config"
        );
        if !self.save_configs().await {
            warn!(breaker = %key, "breaker config applied but not persisted");
        }
        Ok(())
    }

    /// Drop a custom type's breaker and config.
    pub async fn remove(&self, key: &str) {
        if is_fixed_key(key) {
            return;
        }
        self.breakers.write().await.remove(key);
        self.configs.write().await.remove(key);
    }

    pub async fn config_for(&self, key: &str) -> Option<CircuitBreakerConfig> {
        if let Some(breaker) = self.breakers.read().await.get(key) {
            return Some(breaker.config());
        }
        self.configs.read().await.get(key).copied()
    }

    /// Keys of breakers currently open, sorted.
    pub async fn open_breakers(&self) -> Vec<String> {
        let mut open: Vec<String> = self
            .breakers
            .read()
            .await
            .iter()
            .filter(|(_, b)| b.is_open())
            .map(|(k, _)| k.clone())
            .collect();
        open.sort();
        open
    }

    pub async fn snapshot(&self) -> Vec<BreakerSnapshot> {
        let mut snapshots: Vec<BreakerSnapshot> = self
            .breakers
            .read()
            .await
            .iter()
            .map(|(key, b)| BreakerSnapshot {
                key: key.clone(),
                state: b.state(),
                config: b.config(),
                failure_count: b.failure_count(),
            })
            .collect();
        snapshots.sort_by(|a, b| a.key.cmp(&b.key));
        snapshots
    }
}

fn is_fixed_key(key: &str) -> bool {
    key == TRANSITION_BREAKER || BuiltinPhase::is_builtin_key(key)
}
