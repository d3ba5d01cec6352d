//! Metric emission helpers.
//!
//! Metrics go through a pluggable sink; the default emits structured
//! tracing events under the `metrics` target. Tests install a capturing
//! sink.

use std::sync::{Arc, OnceLock, RwLock};
use std::time::Duration;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum MetricValue {
    Counter(u64),
    Gauge(u64),
    Histogram(u64),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MetricEvent {
    pub name: &'static str,
    pub value: MetricValue,
}

pub trait MetricSink: Send + Sync {
    fn record(&self, event: MetricEvent);
}

struct TracingSink;

impl MetricSink for TracingSink {
    fn record(&self, event: MetricEvent) {
        let value = match event.value {
            MetricValue::Counter(v) | MetricValue::Gauge(v) | MetricValue::Histogram(v) => v,
        };
        tracing::info!(target: "metrics", metric = event.name, value);
    }
}

static METRIC_SINK: OnceLock<RwLock<Arc<dyn MetricSink>>> = OnceLock::new();

fn sink() -> Arc<dyn MetricSink> {
    let lock = METRIC_SINK.get_or_init(|| RwLock::new(Arc::new(TracingSink)));
    match lock.read() {
        Ok(guard) => guard.clone(),
        Err(_) => Arc::new(TracingSink),
    }
}

pub fn set_sink(new_sink: Arc<dyn MetricSink>) {
    let lock = METRIC_SINK.get_or_init(|| RwLock::new(Arc::new(TracingSink)));
    if let Ok(mut guard) = lock.write() {
        *guard = new_sink;
    }
}

fn emit(name: &'static str, value: MetricValue) {
    sink().record(MetricEvent { name, value });
}

fn duration_ms(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

pub fn apply_ok(duration: Duration) {
    emit("apply_ok", MetricValue::Counter(1));
    emit(
        "apply_duration",
        MetricValue::Histogram(duration_ms(duration)),
    );
}

pub fn apply_err(duration: Duration) {
    emit("apply_err", MetricValue::Counter(1));
    emit(
        "apply_duration",
        MetricValue::Histogram(duration_ms(duration)),
    );
}

/// A publish found no live subscribers; the event was dropped on purpose.
pub fn events_dropped_no_subscribers() {
    emit("events_dropped_no_subscribers", MetricValue::Counter(1));
}

/// A subscriber's queue overflowed and its oldest event was evicted.
pub fn subscriber_lagged() {
    emit("subscriber_lagged", MetricValue::Counter(1));
}

pub fn set_active_subscriptions(count: usize) {
    emit("active_subscriptions", MetricValue::Gauge(count as u64));
}

pub fn auth_rejected() {
    emit("auth_rejected", MetricValue::Counter(1));
}
