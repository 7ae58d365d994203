//! Minimal metrics emission helpers.
//!
//! Counters and gauges are emitted through a process-wide [`MetricSink`]. The
//! default sink forwards to `tracing`; a test sink can be installed to capture
//! emissions. The core never depends on a metrics runtime.

use std::sync::{Arc, OnceLock, RwLock};

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum MetricValue {
    Counter(u64),
    Gauge(u64),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MetricEvent {
    pub name: &'static str,
    pub value: MetricValue,
    pub labels: Vec<(&'static str, String)>,
}

pub trait MetricSink: Send + Sync {
    fn record(&self, event: MetricEvent);
}

struct TracingSink;

impl MetricSink for TracingSink {
    fn record(&self, event: MetricEvent) {
        tracing::debug!(
            target: "metrics",
            metric = event.name,
            value = ?event.value,
            labels = ?event.labels
        );
    }
}

static METRIC_SINK: OnceLock<RwLock<Arc<dyn MetricSink>>> = OnceLock::new();

fn sink() -> Arc<dyn MetricSink> {
    METRIC_SINK
        .get_or_init(|| RwLock::new(Arc::new(TracingSink)))
        .read()
        .unwrap_or_else(|err| err.into_inner())
        .clone()
}

/// Replace the process-wide sink. Returns the previous one.
pub fn set_sink(new: Arc<dyn MetricSink>) -> Arc<dyn MetricSink> {
    let lock = METRIC_SINK.get_or_init(|| RwLock::new(Arc::new(TracingSink)));
    let mut guard = lock.write().unwrap_or_else(|err| err.into_inner());
    std::mem::replace(&mut *guard, new)
}

pub fn counter(name: &'static str, value: u64, labels: Vec<(&'static str, String)>) {
    sink().record(MetricEvent {
        name,
        value: MetricValue::Counter(value),
        labels,
    });
}

pub fn gauge(name: &'static str, value: u64, labels: Vec<(&'static str, String)>) {
    sink().record(MetricEvent {
        name,
        value: MetricValue::Gauge(value),
        labels,
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct Capture(Mutex<Vec<MetricEvent>>);

    impl MetricSink for Capture {
        fn record(&self, event: MetricEvent) {
            self.0.lock().unwrap().push(event);
        }
    }

    #[test]
    fn captured_events_round_trip() {
        let capture = Arc::new(Capture(Mutex::new(Vec::new())));
        let prev = set_sink(capture.clone());
        counter("wal_segments_sealed", 1, vec![("node", "a".to_string())]);
        set_sink(prev);

        let events = capture.0.lock().unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].name, "wal_segments_sealed");
        assert_eq!(events[0].value, MetricValue::Counter(1));
    }
}
