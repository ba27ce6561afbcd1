//! Metric and alert emission.

use parking_lot::Mutex;

/// Sink for metrics and operator alerts.
pub trait Telemetry: Send + Sync {
    fn emit_metric(&self, name: &str, value: f64, tags: &[String]);

    fn emit_alert(&self, message: &str);
}

/// Emits metrics and alerts as tracing events.
///
/// Metrics go to target `runmon::metrics` at info, alerts to
/// `runmon::alerts` at error, so subscribers can route them separately.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingTelemetry;

impl Telemetry for TracingTelemetry {
    fn emit_metric(&self, name: &str, value: f64, tags: &[String]) {
        tracing::info!(target: "runmon::metrics", metric = name, value, tags = ?tags);
    }

    fn emit_alert(&self, message: &str) {
        tracing::error!(target: "runmon::alerts", "{}", message);
    }
}

/// A metric captured by [`RecordingTelemetry`].
#[derive(Debug, Clone, PartialEq)]
pub struct MetricEvent {
    pub name: String,
    pub value: f64,
    pub tags: Vec<String>,
}

/// Keeps every event in memory (for tests and dry runs).
#[derive(Debug, Default)]
pub struct RecordingTelemetry {
    metrics: Mutex<Vec<MetricEvent>>,
    alerts: Mutex<Vec<String>>,
}

impl RecordingTelemetry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn metrics(&self) -> Vec<MetricEvent> {
        self.metrics.lock().clone()
    }

    pub fn alerts(&self) -> Vec<String> {
        self.alerts.lock().clone()
    }

    pub fn metrics_named(&self, name: &str) -> Vec<MetricEvent> {
        self.metrics
            .lock()
            .iter()
            .filter(|m| m.name == name)
            .cloned()
            .collect()
    }
}

impl Telemetry for RecordingTelemetry {
    fn emit_metric(&self, name: &str, value: f64, tags: &[String]) {
        self.metrics.lock().push(MetricEvent {
            name: name.to_string(),
            value,
            tags: tags.to_vec(),
        });
    }

    fn emit_alert(&self, message: &str) {
        self.alerts.lock().push(message.to_string());
    }
}
