//! Filter criteria for scan results.
//!
//! [`FilterCriteria`] is an immutable snapshot of what the user wants to
//! see. Changing a filter means building a new snapshot and handing it to
//! the session, never mutating one in place.

use crate::observation::Observation;
use std::collections::BTreeSet;
use uuid::Uuid;

/// RSSI floor applied by [`FilterCriteria::nearby_only`], in dBm.
pub const NEARBY_RSSI: i16 = -50;

/// User-configurable filter snapshot. The default matches everything.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct FilterCriteria {
    /// Case-insensitive substring the advertised name must contain.
    /// An empty string is no constraint.
    pub name: Option<String>,
    /// Services that must all be advertised
    pub services: BTreeSet<Uuid>,
    /// Minimum RSSI in dBm
    pub min_rssi: Option<i16>,
    /// Only peripherals at or above [`NEARBY_RSSI`]
    pub nearby_only: bool,
    /// Only peripherals advertising a name
    pub only_with_name: bool,
}

impl FilterCriteria {
    /// Criteria that match every observation.
    pub fn all() -> Self {
        Self::default()
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_service(mut self, uuid: Uuid) -> Self {
        self.services.insert(uuid);
        self
    }

    pub fn with_min_rssi(mut self, rssi: i16) -> Self {
        self.min_rssi = Some(rssi);
        self
    }

    pub fn nearby_only(mut self) -> Self {
        self.nearby_only = true;
        self
    }

    pub fn only_with_name(mut self) -> Self {
        self.only_with_name = true;
        self
    }

    /// The stricter of `min_rssi` and the nearby floor.
    pub fn rssi_floor(&self) -> Option<i16> {
        let nearby = self.nearby_only.then_some(NEARBY_RSSI);
        self.min_rssi.max(nearby)
    }

    /// True when no constraint is active.
    pub fn is_unconstrained(&self) -> bool {
        self.rssi_floor().is_none()
            && !self.only_with_name
            && self.name_needle().is_none()
            && self.services.is_empty()
    }

    fn name_needle(&self) -> Option<&str> {
        self.name.as_deref().filter(|name| !name.is_empty())
    }

    /// Evaluate one observation. Constraints are ANDed and checked
    /// cheapest first: RSSI, name presence, name substring, services.
    ///
    /// ```
    /// use ble_scanner::filter::FilterCriteria;
    /// # use ble_scanner::advertising::AdvertisingDataBuilder;
    /// # use ble_scanner::{Observation, Sighting};
    /// # let payload = AdvertisingDataBuilder::new().complete_name("Nordic HRM").build();
    /// # let observation = Observation::from(Sighting::new("AA:BB:CC:DD:EE:FF".parse().unwrap(), -60, payload));
    ///
    /// let criteria = FilterCriteria::all().with_name("hrm").with_min_rssi(-70);
    /// assert!(criteria.matches(&observation));
    /// assert!(!FilterCriteria::all().nearby_only().matches(&observation));
    /// ```
    pub fn matches(&self, observation: &Observation) -> bool {
        if let Some(floor) = self.rssi_floor()
            && observation.rssi < floor
        {
            return false;
        }

        let name = observation.name();
        if self.only_with_name && name.is_none() {
            return false;
        }

        if let Some(needle) = self.name_needle() {
            let Some(name) = name else {
                return false;
            };
            if !name.to_lowercase().contains(&needle.to_lowercase()) {
                return false;
            }
        }

        let data = &observation.advertising_data;
        self.services.iter().all(|uuid| data.has_service(uuid))
    }
}

/// Free-function form of [`FilterCriteria::matches`].
pub fn matches(observation: &Observation, criteria: &FilterCriteria) -> bool {
    criteria.matches(observation)
}
