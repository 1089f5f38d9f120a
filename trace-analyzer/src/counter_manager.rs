//! Per-counter time-ordered sample deques, flushed once per step, plus the
//! counter-name <-> id mapping sourced from the attribute stream.

use std::collections::VecDeque;

use rustc_hash::FxHashMap;

use trace_model::{CounterId, Timestamp};

#[derive(Debug, Default)]
pub struct CounterManager {
    name_to_id: FxHashMap<String, CounterId>,
    id_to_name: FxHashMap<CounterId, String>,
    series: FxHashMap<CounterId, VecDeque<(Timestamp, i64)>>,
}

impl CounterManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_name(&mut self, counter_id: CounterId, name: String) {
        self.name_to_id.insert(name.clone(), counter_id);
        self.id_to_name.insert(counter_id, name);
    }

    pub fn id_for_name(&self, name: &str) -> Option<CounterId> {
        self.name_to_id.get(name).copied()
    }

    pub fn name_for_id(&self, counter_id: CounterId) -> Option<&str> {
        self.id_to_name.get(&counter_id).map(|s| s.as_str())
    }

    pub fn all_names(&self) -> impl Iterator<Item = (&str, CounterId)> {
        self.name_to_id.iter().map(|(name, id)| (name.as_str(), *id))
    }

    pub fn record(&mut self, counter_id: CounterId, timestamp: Timestamp, value: i64) {
        self.series.entry(counter_id).or_default().push_back((timestamp, value));
    }

    pub fn latest(&self, counter_id: CounterId) -> Option<(Timestamp, i64)> {
        self.series.get(&counter_id).and_then(|d| d.back().copied())
    }

    /// Return and clear every counter's accumulated samples for this step.
    pub fn flush_step(&mut self) -> FxHashMap<CounterId, Vec<(Timestamp, i64)>> {
        let mut out = FxHashMap::default();
        for (id, deque) in self.series.iter_mut() {
            if !deque.is_empty() {
                out.insert(*id, deque.drain(..).collect());
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flush_step_clears_series() {
        let mut mgr = CounterManager::new();
        mgr.register_name(1, "heap_bytes".to_string());
        mgr.record(1, 100, 10);
        mgr.record(1, 110, 20);

        let flushed = mgr.flush_step();
        assert_eq!(flushed[&1], vec![(100, 10), (110, 20)]);
        assert!(mgr.flush_step().is_empty());
    }

    #[test]
    fn latest_tracks_most_recent_sample() {
        let mut mgr = CounterManager::new();
        mgr.record(1, 100, 10);
        mgr.record(1, 110, 20);
        assert_eq!(mgr.latest(1), Some((110, 20)));
    }
}
