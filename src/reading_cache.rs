use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Utc};

use crate::db::models::Reading;

/// Bounded in-memory store of recent `Reading`s keyed by `(circuit_id, timestamp)`.
///
/// The cache is owned by a single aggregator and mutated only under its state
/// lock, so it carries no synchronisation of its own. The per-circuit index
/// is a derived view: `merge` and `prune` leave it untouched until the caller
/// runs `rebuild_index`, which keeps fetch → merge → prune → rebuild an
/// explicit sequence.
#[derive(Debug, Clone, Default)]
pub struct ReadingCache {
    entries: BTreeMap<(String, DateTime<Utc>), Reading>,
    by_circuit: HashMap<String, Vec<Reading>>,
}

impl ReadingCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop everything and load `readings` as the new contents. The index is rebuilt.
    pub fn replace(&mut self, readings: impl IntoIterator<Item = Reading>) {
        self.entries.clear();
        self.merge(readings);
        self.rebuild_index();
    }

    /// Insert `readings`, overwriting any cached reading with the same key.
    ///
    /// Returns the number of keys that were not cached before.
    pub fn merge(&mut self, readings: impl IntoIterator<Item = Reading>) -> usize {
        let mut added = 0;
        for r in readings {
            if self.entries.insert((r.circuit_id.clone(), r.timestamp), r).is_none() {
                added += 1;
            }
        }
        added
    }

    /// Evict every reading with `timestamp <= cutoff`. Returns how many were evicted.
    pub fn prune(&mut self, cutoff: DateTime<Utc>) -> usize {
        let before = self.entries.len();
        self.entries.retain(|(_, ts), _| *ts > cutoff);
        before - self.entries.len()
    }

    /// Regroup the cached readings by circuit, ascending by timestamp.
    pub fn rebuild_index(&mut self) {
        self.by_circuit.clear();
        // BTreeMap iteration is ordered by (circuit_id, timestamp).
        for ((circuit_id, _), reading) in &self.entries {
            self.by_circuit
                .entry(circuit_id.clone())
                .or_default()
                .push(reading.clone());
        }
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.by_circuit.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// All cached readings ordered by `(circuit_id, timestamp)`.
    pub fn all(&self) -> impl Iterator<Item = &Reading> {
        self.entries.values()
    }

    /// Indexed readings for one circuit, ascending by timestamp.
    pub fn circuit(&self, circuit_id: &str) -> &[Reading] {
        self.by_circuit
            .get(circuit_id)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    #[cfg(test)]
    pub fn get(&self, circuit_id: &str, timestamp: DateTime<Utc>) -> Option<&Reading> {
        self.entries.get(&(circuit_id.to_owned(), timestamp))
    }

    /// Most recent indexed reading across `circuit_ids`.
    pub fn latest<'a>(&'a self, circuit_ids: &[String]) -> Option<&'a Reading> {
        circuit_ids
            .iter()
            .filter_map(|id| self.circuit(id).last())
            .max_by_key(|r| r.timestamp)
    }

    /// Timestamp of the oldest cached reading.
    pub fn oldest(&self) -> Option<DateTime<Utc>> {
        self.entries.keys().map(|(_, ts)| *ts).min()
    }
}
