//! Extracts a configured subset of counters as most-recent-value node
//! state, and tags those counters so the execution manager does not also
//! attach them to executions as function-local measurements.

use rustc_hash::{FxHashMap, FxHashSet};

use trace_model::{CounterId, Timestamp};

use crate::counter_manager::CounterManager;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WatchedValue {
    pub value: i64,
    pub timestamp: Timestamp,
}

#[derive(Debug, Default)]
pub struct MonitoringView {
    /// (counter-name, field-name) pairs from configuration.
    watchlist: Vec<(String, String)>,
    prefix_wildcard: Option<String>,
    watched_ids: FxHashSet<CounterId>,
    state: FxHashMap<String, WatchedValue>,
}

impl MonitoringView {
    pub fn new(watchlist: Vec<(String, String)>, prefix_wildcard: Option<String>) -> Self {
        MonitoringView {
            watchlist,
            prefix_wildcard,
            watched_ids: FxHashSet::default(),
            state: FxHashMap::default(),
        }
    }

    /// Re-resolve watched counter names to ids; call after the Counter
    /// Manager's name table grows (new counters appear over the stream's
    /// lifetime).
    pub fn refresh_watched_ids(&mut self, counters: &CounterManager) {
        self.watched_ids.clear();
        for (counter_name, _field) in &self.watchlist {
            if let Some(id) = counters.id_for_name(counter_name) {
                self.watched_ids.insert(id);
            }
        }
        if let Some(prefix) = &self.prefix_wildcard {
            for (_name, id) in counters.all_names().filter(|(name, _)| name.starts_with(prefix.as_str())) {
                self.watched_ids.insert(id);
            }
        }
    }

    pub fn is_monitoring_only(&self, counter_id: CounterId) -> bool {
        self.watched_ids.contains(&counter_id)
    }

    /// Scan the Counter Manager's latest sample per watched counter and
    /// record it under its configured field name.
    pub fn scan(&mut self, counters: &CounterManager) {
        for (counter_name, field_name) in self.watchlist.clone() {
            let Some(id) = counters.id_for_name(&counter_name) else {
                continue;
            };
            if let Some((ts, value)) = counters.latest(id) {
                self.state.insert(field_name, WatchedValue { value, timestamp: ts });
            }
        }
        // Prefix-matched counters that aren't also explicit watchlist entries
        // report under their own counter name as field name.
        if let Some(prefix) = self.prefix_wildcard.clone() {
            for &id in &self.watched_ids {
                let Some(name) = counters.name_for_id(id) else {
                    continue;
                };
                if !name.starts_with(&prefix) || self.watchlist.iter().any(|(n, _)| n == name) {
                    continue;
                }
                if let Some((ts, value)) = counters.latest(id) {
                    self.state.insert(name.to_string(), WatchedValue { value, timestamp: ts });
                }
            }
        }
    }

    pub fn snapshot(&self) -> &FxHashMap<String, WatchedValue> {
        &self.state
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scan_picks_up_latest_sample_per_watched_counter() {
        let mut counters = CounterManager::new();
        counters.register_name(1, "mem_bytes".to_string());
        counters.record(1, 100, 1000);
        counters.record(1, 200, 2000);

        let mut view = MonitoringView::new(vec![("mem_bytes".to_string(), "memory".to_string())], None);
        view.refresh_watched_ids(&counters);
        view.scan(&counters);

        assert!(view.is_monitoring_only(1));
        assert_eq!(
            view.snapshot().get("memory"),
            Some(&WatchedValue {
                value: 2000,
                timestamp: 200
            })
        );
    }
}
