use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::RwLock;
use serde::Serialize;

/// Counter key: name + sorted labels.
#[derive(Clone, Debug, Hash, PartialEq, Eq, PartialOrd, Ord)]
struct CounterKey {
    name: String,
    labels: Vec<(String, String)>,
}

impl CounterKey {
    fn new(name: &str, labels: &[(&str, &str)]) -> Self {
        let mut sorted: Vec<(String, String)> = labels
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        sorted.sort();
        Self {
            name: name.to_string(),
            labels: sorted,
        }
    }

    fn render(&self) -> String {
        if self.labels.is_empty() {
            return self.name.clone();
        }
        let labels: Vec<String> = self
            .labels
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect();
        format!("{}{{{}}}", self.name, labels.join(","))
    }
}

/// In-memory, label-keyed monotonic counters for sync diagnostics
/// (events seen, events dropped by reason, resyncs, reconnects).
#[derive(Default)]
pub struct SyncCounters {
    counters: RwLock<HashMap<CounterKey, AtomicU64>>,
}

/// Point-in-time copy of every counter, keyed `name{label=value,...}`.
#[derive(Clone, Debug, Default, Serialize)]
pub struct CountersSnapshot {
    pub counters: BTreeMap<String, u64>,
}

impl CountersSnapshot {
    pub fn get(&self, rendered: &str) -> u64 {
        self.counters.get(rendered).copied().unwrap_or(0)
    }
}

impl SyncCounters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inc(&self, name: &str, labels: &[(&str, &str)]) {
        self.add(name, labels, 1);
    }

    pub fn add(&self, name: &str, labels: &[(&str, &str)], n: u64) {
        let key = CounterKey::new(name, labels);
        {
            let counters = self.counters.read();
            if let Some(c) = counters.get(&key) {
                c.fetch_add(n, Ordering::Relaxed);
                return;
            }
        }
        self.counters
            .write()
            .entry(key)
            .or_insert_with(|| AtomicU64::new(0))
            .fetch_add(n, Ordering::Relaxed);
    }

    pub fn get(&self, name: &str, labels: &[(&str, &str)]) -> u64 {
        self.counters
            .read()
            .get(&CounterKey::new(name, labels))
            .map_or(0, |c| c.load(Ordering::Relaxed))
    }

    pub fn snapshot(&self) -> CountersSnapshot {
        let counters = self
            .counters
            .read()
            .iter()
            .map(|(k, v)| (k.render(), v.load(Ordering::Relaxed)))
            .collect();
        CountersSnapshot { counters }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counts_by_name_and_labels() {
        let c = SyncCounters::new();
        c.inc("events_dropped", &[("reason", "trimmed")]);
        c.inc("events_dropped", &[("reason", "trimmed")]);
        c.inc("events_dropped", &[("reason", "shrink")]);
        assert_eq!(c.get("events_dropped", &[("reason", "trimmed")]), 2);
        assert_eq!(c.get("events_dropped", &[("reason", "shrink")]), 1);
        assert_eq!(c.get("events_dropped", &[]), 0);
    }

    #[test]
    fn label_order_is_irrelevant() {
        let c = SyncCounters::new();
        c.add("x", &[("a", "1"), ("b", "2")], 3);
        assert_eq!(c.get("x", &[("b", "2"), ("a", "1")]), 3);
    }

    #[test]
    fn snapshot_renders_keys() {
        let c = SyncCounters::new();
        c.inc("resyncs", &[]);
        c.inc("events", &[("type", "message.updated")]);
        let snap = c.snapshot();
        assert_eq!(snap.get("resyncs"), 1);
        assert_eq!(snap.get("events{type=message.updated}"), 1);
        let json = serde_json::to_value(&snap).unwrap();
        assert_eq!(json["counters"]["resyncs"], 1);
    }
}
