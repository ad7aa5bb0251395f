use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicI64, Ordering};

use chrono::Utc;
use parking_lot::RwLock;
use serde::Serialize;

/// Metric names recorded by the relay.
pub mod names {
    /// Upstream TCP connections accepted. Label: `category`.
    pub const CONNECTIONS_ACCEPTED: &str = "upstream.connections.total";
    /// Upstream TCP connections currently open. Label: `category`.
    pub const CONNECTIONS_ACTIVE: &str = "upstream.connections.active";
    /// Bytes read from upstream. Label: `category`.
    pub const BYTES_RECEIVED: &str = "upstream.bytes.total";
    /// Frames parsed from the stream. Label: `category`.
    pub const FRAMES_DECODED: &str = "frames.decoded.total";
    /// Fragments that failed to parse. Label: `category`.
    pub const FRAMES_DROPPED: &str = "frames.dropped.total";
    /// Envelopes published to the hub. Label: `type`.
    pub const MESSAGES_PUBLISHED: &str = "hub.published.total";
    /// Per-subscriber deliveries that were enqueued.
    pub const DELIVERIES_SENT: &str = "hub.deliveries.sent";
    /// Per-subscriber deliveries skipped because the channel was not ready.
    pub const DELIVERIES_SKIPPED: &str = "hub.deliveries.skipped";
    /// Subscribers currently registered.
    pub const SUBSCRIBERS_ACTIVE: &str = "hub.subscribers.active";
}

#[derive(Clone, Copy, Debug, Hash, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum MetricType {
    Counter,
    Gauge,
}

/// One metric value at the time of a snapshot.
#[derive(Clone, Debug, Serialize)]
pub struct MetricSample {
    pub name: String,
    pub value: f64,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
    pub metric_type: MetricType,
}

/// Every metric at one instant, ordered by name then labels.
#[derive(Clone, Debug, Serialize)]
pub struct MetricsSnapshot {
    pub timestamp: String,
    pub samples: Vec<MetricSample>,
}

fn label_map(labels: &[(&str, &str)]) -> BTreeMap<String, String> {
    labels
        .iter()
        .map(|(k, v)| ((*k).to_owned(), (*v).to_owned()))
        .collect()
}

/// Counters and gauges live in separate key spaces even if names collide.
#[derive(Clone, Debug, Hash, PartialEq, Eq)]
struct MetricKey {
    kind: MetricType,
    name: String,
    labels: BTreeMap<String, String>,
}

impl MetricKey {
    fn new(kind: MetricType, name: &str, labels: &[(&str, &str)]) -> Self {
        Self {
            kind,
            name: name.to_owned(),
            labels: label_map(labels),
        }
    }
}

/// Lock-light in-memory metrics, shared as `Arc<MetricsRecorder>`.
///
/// The map lock is only taken for writing the first time a name/label
/// combination is seen; updates after that are a read lock plus an atomic op.
#[derive(Default)]
pub struct MetricsRecorder {
    cells: RwLock<HashMap<MetricKey, AtomicI64>>,
}

impl MetricsRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    fn update(&self, key: MetricKey, apply: impl FnOnce(&AtomicI64)) {
        if let Some(cell) = self.cells.read().get(&key) {
            apply(cell);
            return;
        }
        let mut cells = self.cells.write();
        apply(cells.entry(key).or_default());
    }

    fn read(&self, key: &MetricKey) -> i64 {
        self.cells
            .read()
            .get(key)
            .map_or(0, |cell| cell.load(Ordering::Relaxed))
    }

    pub fn counter_inc(&self, name: &str, labels: &[(&str, &str)], n: u64) {
        let n = i64::try_from(n).unwrap_or(i64::MAX);
        self.update(MetricKey::new(MetricType::Counter, name, labels), |cell| {
            cell.fetch_add(n, Ordering::Relaxed);
        });
    }

    pub fn counter_get(&self, name: &str, labels: &[(&str, &str)]) -> u64 {
        let value = self.read(&MetricKey::new(MetricType::Counter, name, labels));
        u64::try_from(value).unwrap_or(0)
    }

    /// Move a gauge up or down.
    pub fn gauge_add(&self, name: &str, labels: &[(&str, &str)], delta: i64) {
        self.update(MetricKey::new(MetricType::Gauge, name, labels), |cell| {
            cell.fetch_add(delta, Ordering::Relaxed);
        });
    }

    pub fn gauge_get(&self, name: &str, labels: &[(&str, &str)]) -> i64 {
        self.read(&MetricKey::new(MetricType::Gauge, name, labels))
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let mut samples: Vec<MetricSample> = self
            .cells
            .read()
            .iter()
            .map(|(key, cell)| MetricSample {
                name: key.name.clone(),
                value: cell.load(Ordering::Relaxed) as f64,
                labels: key.labels.clone(),
                metric_type: key.kind,
            })
            .collect();
        samples.sort_by(|a, b| a.name.cmp(&b.name).then_with(|| a.labels.cmp(&b.labels)));

        MetricsSnapshot {
            timestamp: Utc::now().to_rfc3339(),
            samples,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    impl MetricsSnapshot {
        fn get(&self, name: &str, labels: &[(&str, &str)]) -> Option<f64> {
            let labels = label_map(labels);
            self.samples
                .iter()
                .find(|s| s.name == name && s.labels == labels)
                .map(|s| s.value)
        }
    }

    #[test]
    fn counter_basic() {
        let recorder = MetricsRecorder::new();
        recorder.counter_inc(names::FRAMES_DECODED, &[("category", "tracking")], 1);
        recorder.counter_inc(names::FRAMES_DECODED, &[("category", "tracking")], 1);
        recorder.counter_inc(names::FRAMES_DECODED, &[("category", "potential")], 1);

        assert_eq!(
            recorder.counter_get(names::FRAMES_DECODED, &[("category", "tracking")]),
            2
        );
        assert_eq!(
            recorder.counter_get(names::FRAMES_DECODED, &[("category", "potential")]),
            1
        );
        assert_eq!(recorder.counter_get(names::FRAMES_DROPPED, &[]), 0);
    }

    #[test]
    fn gauge_moves_both_ways() {
        let recorder = MetricsRecorder::new();
        recorder.gauge_add(names::SUBSCRIBERS_ACTIVE, &[], 5);
        recorder.gauge_add(names::SUBSCRIBERS_ACTIVE, &[], -3);
        assert_eq!(recorder.gauge_get(names::SUBSCRIBERS_ACTIVE, &[]), 2);

        recorder.gauge_add(names::SUBSCRIBERS_ACTIVE, &[], -2);
        assert_eq!(recorder.gauge_get(names::SUBSCRIBERS_ACTIVE, &[]), 0);
    }

    #[test]
    fn counter_and_gauge_with_same_name_are_distinct() {
        let recorder = MetricsRecorder::new();
        recorder.counter_inc("shared", &[], 4);
        recorder.gauge_add("shared", &[], -1);
        assert_eq!(recorder.counter_get("shared", &[]), 4);
        assert_eq!(recorder.gauge_get("shared", &[]), -1);
        assert_eq!(recorder.snapshot().samples.len(), 2);
    }

    #[test]
    fn label_order_does_not_matter() {
        let recorder = MetricsRecorder::new();
        recorder.counter_inc("x", &[("a", "1"), ("b", "2")], 3);
        assert_eq!(recorder.counter_get("x", &[("b", "2"), ("a", "1")]), 3);
    }

    #[test]
    fn snapshot_contains_all_metrics() {
        let recorder = MetricsRecorder::new();
        recorder.counter_inc(names::MESSAGES_PUBLISHED, &[("type", "status")], 4);
        recorder.gauge_add(names::CONNECTIONS_ACTIVE, &[("category", "tracking")], 1);

        let snapshot = recorder.snapshot();
        assert_eq!(snapshot.samples.len(), 2);
        assert_eq!(
            snapshot.get(names::MESSAGES_PUBLISHED, &[("type", "status")]),
            Some(4.0)
        );
        assert_eq!(
            snapshot.get(names::CONNECTIONS_ACTIVE, &[("category", "tracking")]),
            Some(1.0)
        );
        assert_eq!(snapshot.get(names::CONNECTIONS_ACTIVE, &[]), None);
    }

    #[test]
    fn snapshot_serializes() {
        let recorder = MetricsRecorder::new();
        recorder.counter_inc(names::DELIVERIES_SENT, &[], 7);
        let json = serde_json::to_value(recorder.snapshot()).unwrap();
        assert_eq!(json["samples"][0]["name"], names::DELIVERIES_SENT);
        assert_eq!(json["samples"][0]["metric_type"], "counter");
        assert!(json["samples"][0].get("labels").is_none());
    }
}
