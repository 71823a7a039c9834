//! `ble-scanner` library.
//!
//! Aggregates BLE advertisements into one record per peripheral, filters
//! them with user criteria and keeps the result ordered by first sighting.
//!
//! The binary (`src/main.rs`) is responsible for CLI parsing and process exit codes.
//! The core “business logic” lives in [`crate::session`] and
//! [`crate::controller`] where it can be tested deterministically with an
//! injected scanner; [`crate::app`] drives it for the command line.

pub mod advertising;
pub mod app;
pub mod controller;
pub mod filter;
pub mod observation;
pub mod output;
pub mod peripheral_id;
pub mod projection;
pub mod scanner;
pub mod session;
pub mod store;

#[cfg(test)]
mod test_utils;

// Re-export commonly used types at the crate root
pub use advertising::AdvertisingData;
pub use controller::{ControlError, ScanController, ScanHandle};
pub use filter::{FilterCriteria, NEARBY_RSSI};
pub use observation::Observation;
pub use output::OutputFormatter;
pub use peripheral_id::PeripheralId;
pub use projection::{Projection, project};
pub use scanner::{Backend, PlatformEvent, ScanError, Scanner, Sighting};
pub use session::{ErrorCause, ScanSession, ScanSessionState, SessionSnapshot};
pub use store::{AggregationStore, ScannedPeripheral, ServiceLookup};
