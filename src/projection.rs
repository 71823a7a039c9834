//! Filtered view of the aggregation store.
//!
//! [`project`] is the definition: a stable filter of the store snapshot.
//! [`Projection`] maintains the same result incrementally. It remembers the
//! positions of matching records, so a single ingest costs one filter
//! evaluation and only a criteria change re-evaluates every record.

use crate::filter::FilterCriteria;
use crate::store::{AggregationStore, Ingested, ScannedPeripheral};

/// Records of `snapshot` matching `criteria`, in snapshot order.
pub fn project(snapshot: &[ScannedPeripheral], criteria: &FilterCriteria) -> Vec<ScannedPeripheral> {
    snapshot
        .iter()
        .filter(|peripheral| criteria.matches(&peripheral.latest))
        .cloned()
        .collect()
}

/// Incrementally maintained [`project`] result for one store.
#[derive(Debug, Default)]
pub struct Projection {
    criteria: FilterCriteria,
    /// Ascending positions of matching records in the store
    matching: Vec<usize>,
    /// Store revision `matching` reflects
    revision: u64,
}

impl Projection {
    pub fn new(criteria: FilterCriteria) -> Self {
        Projection {
            criteria,
            matching: Vec::new(),
            revision: 0,
        }
    }

    pub fn criteria(&self) -> &FilterCriteria {
        &self.criteria
    }

    /// Replace the criteria. Returns false, without re-evaluating anything,
    /// when `criteria` equals the current snapshot.
    pub fn set_criteria(&mut self, criteria: FilterCriteria, store: &AggregationStore) -> bool {
        if criteria == self.criteria {
            return false;
        }
        self.criteria = criteria;
        self.rebuild(store);
        true
    }

    /// Re-evaluate every record.
    pub fn rebuild(&mut self, store: &AggregationStore) {
        self.matching = store
            .snapshot()
            .iter()
            .enumerate()
            .filter(|(_, peripheral)| self.criteria.matches(&peripheral.latest))
            .map(|(position, _)| position)
            .collect();
        self.revision = store.revision();
    }

    /// Account for one ingest that produced `change`. Falls back to a full
    /// rebuild if the store changed in ways this projection has not seen.
    pub fn apply(&mut self, change: Ingested, store: &AggregationStore) {
        if self.revision + 1 != store.revision() {
            self.rebuild(store);
            return;
        }
        self.revision = store.revision();

        let position = change.position();
        let passes = self.criteria.matches(&store.snapshot()[position].latest);
        let slot = match self.matching.last() {
            // Inserts always land at the end of the store.
            Some(&last) if last < position => Err(self.matching.len()),
            None => Err(0),
            _ => self.matching.binary_search(&position),
        };

        match (slot, passes) {
            (Err(index), true) => self.matching.insert(index, position),
            (Ok(index), false) => {
                self.matching.remove(index);
            }
            _ => {}
        }
    }

    /// Matching records in store order.
    pub fn collect(&self, store: &AggregationStore) -> Vec<ScannedPeripheral> {
        let snapshot = store.snapshot();
        self.matching
            .iter()
            .filter_map(|&position| snapshot.get(position).cloned())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.matching.len()
    }

    pub fn is_empty(&self) -> bool {
        self.matching.is_empty()
    }

    /// Whether this projection reflects the store's current contents.
    pub fn is_current(&self, store: &AggregationStore) -> bool {
        self.revision == store.revision()
    }
}
