//! Aggregation of observations into one record per peripheral.
//!
//! The store keeps the latest observation of every peripheral seen since the
//! last [`AggregationStore::clear`], in first-seen order. A re-sighting
//! replaces the record's data in place and never moves it, so a list built
//! from the store does not jump around while a scan is running.

use crate::observation::Observation;
use crate::peripheral_id::PeripheralId;
use std::collections::HashMap;
use std::time::Instant;
use uuid::Uuid;

/// Lookup of presentation info (icon, label, ...) for a service UUID.
///
/// Implemented by the presentation layer; the core only asks for the first
/// advertised service that has info.
pub trait ServiceLookup {
    type Info;

    fn service_info(&self, uuid: &Uuid) -> Option<Self::Info>;
}

/// One discovered peripheral.
#[derive(Debug, Clone, PartialEq)]
pub struct ScannedPeripheral {
    /// Most recent observation of the peripheral
    pub latest: Observation,
    /// When the peripheral was first seen in the current session
    pub first_seen: Instant,
}

impl ScannedPeripheral {
    pub fn id(&self) -> &PeripheralId {
        &self.latest.id
    }

    pub fn name(&self) -> Option<&str> {
        self.latest.name()
    }

    pub fn rssi(&self) -> i16 {
        self.latest.rssi
    }

    /// Info for the first advertised service known to `lookup`.
    pub fn service_info<L: ServiceLookup>(&self, lookup: &L) -> Option<L::Info> {
        self.latest
            .advertising_data
            .service_uuids()
            .iter()
            .find_map(|uuid| lookup.service_info(uuid))
    }
}

/// What an [`AggregationStore::ingest`] did, with the record's position.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ingested {
    /// A new peripheral, appended at this position
    Inserted(usize),
    /// A known peripheral, updated in place at this position
    Updated(usize),
}

impl Ingested {
    pub fn position(self) -> usize {
        match self {
            Ingested::Inserted(position) | Ingested::Updated(position) => position,
        }
    }
}

/// Insertion-ordered map from peripheral identifier to its latest record.
///
/// Not synchronised: the scan session owns the store and is its only
/// writer.
#[derive(Debug, Default)]
pub struct AggregationStore {
    records: Vec<ScannedPeripheral>,
    /// Position of each identifier in `records`
    positions: HashMap<PeripheralId, usize>,
    /// Bumped by every `ingest` and `clear`
    revision: u64,
}

impl AggregationStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Merge one observation: append a new peripheral or replace the latest
    /// observation of a known one without changing its position.
    pub fn ingest(&mut self, observation: Observation) -> Ingested {
        self.revision += 1;

        if let Some(&position) = self.positions.get(&observation.id) {
            self.records[position].latest = observation;
            return Ingested::Updated(position);
        }

        let position = self.records.len();
        self.positions.insert(observation.id.clone(), position);
        self.records.push(ScannedPeripheral {
            first_seen: observation.timestamp,
            latest: observation,
        });
        Ingested::Inserted(position)
    }

    /// Drop all records.
    pub fn clear(&mut self) {
        self.revision += 1;
        self.records.clear();
        self.positions.clear();
    }

    /// All records in first-seen order, regardless of any filter.
    pub fn snapshot(&self) -> &[ScannedPeripheral] {
        &self.records
    }

    pub fn get(&self, id: &PeripheralId) -> Option<&ScannedPeripheral> {
        self.positions.get(id).map(|&position| &self.records[position])
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Counter that changes whenever the contents may have changed.
    pub fn revision(&self) -> u64 {
        self.revision
    }
}
