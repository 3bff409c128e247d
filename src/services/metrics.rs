//! Metrics recorder. Observational only.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::Mutex;

use crate::errors::ServiceError;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricSample {
    pub name: String,
    pub value: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
    pub recorded_at: DateTime<Utc>,
}

#[async_trait]
pub trait MetricsRecorder: Send + Sync {
    async fn record_metric(
        &self,
        name: &str,
        value: f64,
        metadata: Option<Value>,
    ) -> Result<(), ServiceError>;
}

/// Keeps every sample in memory.
#[derive(Default)]
pub struct InMemoryMetrics {
    samples: Mutex<Vec<MetricSample>>,
}

impl InMemoryMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn samples(&self) -> Vec<MetricSample> {
        self.samples.lock().await.clone()
    }

    pub async fn values(&self, name: &str) -> Vec<f64> {
        self.samples
            .lock()
            .await
            .iter()
            .filter(|s| s.name == name)
            .map(|s| s.value)
            .collect()
    }

    pub async fn count(&self, name: &str) -> usize {
        self.values(name).await.len()
    }

    pub async fn last(&self, name: &str) -> Option<MetricSample> {
        self.samples
            .lock()
            .await
            .iter()
            .rev()
            .find(|s| s.name == name)
            .cloned()
    }
}

#[async_trait]
impl MetricsRecorder for InMemoryMetrics {
    async fn record_metric(
        &self,
        name: &str,
        value: f64,
        metadata: Option<Value>,
    ) -> Result<(), ServiceError> {
        self.samples.lock().await.push(MetricSample {
            name: name.to_string(),
            value,
            metadata,
            recorded_at: Utc::now(),
        });
        Ok(())
    }
}
