//! Collaborator interfaces (§6): the two seams the control plane depends on
//! but does not implement itself - durable config storage and metrics
//! export. Production deployments plug in a real `ConfigStore`/`MetricsSink`;
//! tests use the in-memory mocks below.

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::error::CoreResult;
use crate::models::ModelConfig;
use crate::scheduler::ScheduleDecision;
use crate::models::LifecycleEvent;
use crate::telemetry::MetricsStore;

/// Durable storage for `ModelConfig`s, independent of in-memory registry
/// state. The control plane calls this on `register`/`update`/`remove` so
/// configuration survives a restart; `load_all` seeds the registry at boot.
#[async_trait]
pub trait ConfigStore: Send + Sync {
    async fn save(&self, config: &ModelConfig) -> CoreResult<()>;
    async fn load_all(&self) -> CoreResult<Vec<ModelConfig>>;
    async fn delete(&self, model_id: &crate::models::ModelId) -> CoreResult<()>;
}

/// Metrics/event export sink. Implementations must not block the caller for
/// long - the control plane calls these inline with scheduling decisions and
/// lifecycle transitions.
pub trait MetricsSink: Send + Sync {
    fn record_lifecycle_event(&self, event: &LifecycleEvent);
    fn record_schedule_decision(&self, decision: &ScheduleDecision);
    fn record_request(&self, model_id: &str, response_time_ms: u64, failed: bool);
}

/// In-memory `ConfigStore` used by tests and as a default when no durable
/// backing store is configured.
#[derive(Default)]
pub struct MockConfigStore {
    configs: Mutex<Vec<ModelConfig>>,
}

impl MockConfigStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ConfigStore for MockConfigStore {
    async fn save(&self, config: &ModelConfig) -> CoreResult<()> {
        let mut configs = self.configs.lock();
        configs.retain(|c| c.id != config.id);
        configs.push(config.clone());
        Ok(())
    }

    async fn load_all(&self) -> CoreResult<Vec<ModelConfig>> {
        Ok(self.configs.lock().clone())
    }

    async fn delete(&self, model_id: &crate::models::ModelId) -> CoreResult<()> {
        self.configs.lock().retain(|c| &c.id != model_id);
        Ok(())
    }
}

/// In-memory `MetricsSink` used by tests; records counts only.
#[derive(Default)]
pub struct MockMetricsSink {
    pub lifecycle_events: Mutex<Vec<LifecycleEvent>>,
    pub schedule_decisions: Mutex<Vec<ScheduleDecision>>,
    pub requests: Mutex<Vec<(String, u64, bool)>>,
}

impl MockMetricsSink {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }
}

impl MetricsSink for MockMetricsSink {
    fn record_lifecycle_event(&self, event: &LifecycleEvent) {
        self.lifecycle_events.lock().push(event.clone());
    }

    fn record_schedule_decision(&self, decision: &ScheduleDecision) {
        self.schedule_decisions.lock().push(decision.clone());
    }

    fn record_request(&self, model_id: &str, response_time_ms: u64, failed: bool) {
        self.requests.lock().push((model_id.to_string(), response_time_ms, failed));
    }
}

/// Production `MetricsSink`: records into the in-process `MetricsStore` (for
/// a debug/introspection snapshot) and the global `metrics` facade, so
/// whatever exporter a deployment installs (Prometheus, StatsD, ...) picks
/// these up without this crate depending on any one of them directly.
pub struct StoreMetricsSink {
    store: Arc<MetricsStore>,
}

impl StoreMetricsSink {
    pub fn new() -> Arc<Self> {
        Arc::new(Self { store: Arc::new(MetricsStore::new()) })
    }

    /// The underlying store, for a debug endpoint to snapshot.
    pub fn store(&self) -> &Arc<MetricsStore> {
        &self.store
    }
}

impl MetricsSink for StoreMetricsSink {
    fn record_lifecycle_event(&self, event: &LifecycleEvent) {
        let state = format!("{:?}", event.to);
        self.store.increment_counter(&format!("lifecycle_transitions.{state}"), 1);
        metrics::counter!("gg_ctrl_lifecycle_transitions_total", "state" => state).increment(1);
    }

    fn record_schedule_decision(&self, decision: &ScheduleDecision) {
        let outcome = format!("{:?}", decision.outcome);
        self.store.increment_counter(&format!("schedule_decisions.{outcome}"), 1);
        metrics::counter!("gg_ctrl_schedule_decisions_total", "outcome" => outcome).increment(1);
    }

    fn record_request(&self, model_id: &str, response_time_ms: u64, failed: bool) {
        self.store.record_histogram("request_response_time_ms", response_time_ms as f64);
        metrics::histogram!("gg_ctrl_request_duration_ms", "model_id" => model_id.to_string())
            .record(response_time_ms as f64);
        if failed {
            self.store.increment_counter("requests_failed", 1);
            metrics::counter!("gg_ctrl_requests_failed_total", "model_id" => model_id.to_string()).increment(1);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::config::{Framework, ProcessEngineParams};
    use crate::models::ModelId;

    #[tokio::test]
    async fn mock_config_store_round_trips() {
        let store = MockConfigStore::new();
        let config = ModelConfig::new_for_test(
            "a".into(),
            "a".into(),
            Framework::Process(ProcessEngineParams::default()),
            "models/a.gguf".into(),
            5,
            vec![],
        );
        store.save(&config).await.unwrap();
        assert_eq!(store.load_all().await.unwrap().len(), 1);
        store.delete(&ModelId::new("a")).await.unwrap();
        assert!(store.load_all().await.unwrap().is_empty());
    }

    #[test]
    fn store_metrics_sink_records_requests() {
        let sink = StoreMetricsSink::new();
        sink.record_request("model-a", 120, false);
        sink.record_request("model-a", 80, true);
        let snapshot = sink.store().snapshot();
        assert_eq!(snapshot.counters.get("requests_failed"), Some(&1));
        let hist = snapshot.histograms.get("request_response_time_ms").unwrap();
        assert_eq!(hist.count, 2);
    }
}
