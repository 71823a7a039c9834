//! Platform scanning seam.
//!
//! A [`Scanner`] turns "start scanning" into a stream of [`PlatformEvent`]s.
//! Dropping the receiver is how a scan is stopped: the backend tasks notice
//! the closed channel and shut the radio scan down.

#[cfg(feature = "bluer")]
pub mod bluer;

#[cfg(feature = "hci")]
pub mod hci;

use crate::observation::{Phy, PrimaryPhy};
use crate::peripheral_id::PeripheralId;
use crate::session::ErrorCause;
use std::future::Future;
use std::io;
use std::pin::Pin;
use std::time::Instant;
use thiserror::Error;
use tokio::sync::mpsc;

/// Error type for scanner operations.
#[derive(Error, Debug)]
pub enum ScanError {
    /// Bluetooth/adapter related error
    #[error("Bluetooth error: {0}")]
    Bluetooth(String),
    #[error("Bluetooth adapter is powered off")]
    AdapterDisabled,
    #[error("Permission denied, scanning requires CAP_NET_RAW/CAP_NET_ADMIN or bluetoothd access")]
    PermissionDenied,
    /// Backend not available (not compiled in)
    #[allow(dead_code)]
    #[error("Backend '{0}' not available (not compiled in)")]
    BackendNotAvailable(String),
}

impl ScanError {
    /// The session-level cause this error is reported as.
    pub fn cause(&self) -> ErrorCause {
        match self {
            ScanError::AdapterDisabled => ErrorCause::BluetoothDisabled,
            ScanError::PermissionDenied => ErrorCause::PermissionDenied,
            other => ErrorCause::Platform(other.to_string()),
        }
    }
}

impl From<io::Error> for ScanError {
    fn from(err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::PermissionDenied => ScanError::PermissionDenied,
            _ => ScanError::Bluetooth(err.to_string()),
        }
    }
}

/// An undecoded advertisement as reported by a backend.
#[derive(Debug, Clone, PartialEq)]
pub struct Sighting {
    pub id: PeripheralId,
    /// Signal strength in dBm
    pub rssi: i16,
    /// TX power reported out of band, if the platform knows it
    pub tx_power: Option<i8>,
    pub connectable: bool,
    /// Raw advertising data (AD structures)
    pub payload: Vec<u8>,
    pub primary_phy: PrimaryPhy,
    pub secondary_phy: Option<Phy>,
    pub timestamp: Instant,
}

impl Sighting {
    /// A connectable legacy advertisement received now.
    pub fn new(id: PeripheralId, rssi: i16, payload: Vec<u8>) -> Self {
        Sighting {
            id,
            rssi,
            tx_power: None,
            connectable: true,
            payload,
            primary_phy: PrimaryPhy::Le1M,
            secondary_phy: None,
            timestamp: Instant::now(),
        }
    }
}

/// What a running platform scan reports.
#[derive(Debug, Clone, PartialEq)]
pub enum PlatformEvent {
    Sighting(Sighting),
    /// The scan cannot continue; no further events follow.
    Failed(ErrorCause),
}

/// Channel buffer size for platform events.
pub const EVENT_CHANNEL_BUFFER_SIZE: usize = 100;

/// Available scanner backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum Backend {
    /// BlueZ D-Bus backend (requires bluetoothd daemon)
    #[cfg(feature = "bluer")]
    Bluer,
    /// Raw HCI socket backend (direct kernel access, no daemon required)
    #[cfg(feature = "hci")]
    Hci,
}

impl Default for Backend {
    fn default() -> Self {
        #[cfg(feature = "bluer")]
        return Backend::Bluer;
        #[cfg(all(feature = "hci", not(feature = "bluer")))]
        return Backend::Hci;
        #[cfg(not(any(feature = "bluer", feature = "hci")))]
        compile_error!("At least one backend feature must be enabled");
    }
}

impl std::fmt::Display for Backend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            #[cfg(feature = "bluer")]
            Backend::Bluer => write!(f, "bluer"),
            #[cfg(feature = "hci")]
            Backend::Hci => write!(f, "hci"),
            #[cfg(not(any(feature = "bluer", feature = "hci")))]
            _ => unreachable!("Backend enum has no variants when no backend features are enabled"),
        }
    }
}

impl std::str::FromStr for Backend {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            #[cfg(feature = "bluer")]
            "bluer" | "bluez" => Ok(Backend::Bluer),
            #[cfg(feature = "hci")]
            "hci" | "raw" => Ok(Backend::Hci),
            _ => Err(format!("Unknown backend: {}", s)),
        }
    }
}

/// Start a platform scan with the given backend.
pub async fn start_scan(backend: Backend) -> Result<mpsc::Receiver<PlatformEvent>, ScanError> {
    match backend {
        #[cfg(feature = "bluer")]
        Backend::Bluer => bluer::start_scan().await,
        #[cfg(feature = "hci")]
        Backend::Hci => hci::start_scan().await,
    }
}

/// Future returned by [`Scanner::start_scan`].
pub type ScanFuture<'a> =
    Pin<Box<dyn Future<Output = Result<mpsc::Receiver<PlatformEvent>, ScanError>> + Send + 'a>>;

/// Scanner abstraction to enable deterministic unit tests without Bluetooth hardware.
///
/// Each call starts a new platform scan. The scan runs until the returned
/// receiver is dropped.
pub trait Scanner: Send + Sync {
    fn start_scan(&self) -> ScanFuture<'_>;
}

/// Real scanner implementation that delegates to the compiled-in backends.
#[derive(Debug, Default, Clone, Copy)]
pub struct RealScanner {
    pub backend: Backend,
}

impl RealScanner {
    pub fn new(backend: Backend) -> Self {
        RealScanner { backend }
    }
}

impl Scanner for RealScanner {
    fn start_scan(&self) -> ScanFuture<'_> {
        let backend = self.backend;
        Box::pin(async move { start_scan(backend).await })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::TEST_ID;
    use std::str::FromStr;

    #[test]
    fn test_sighting_defaults() {
        let sighting = Sighting::new(TEST_ID.parse().unwrap(), -42, vec![0x02, 0x01, 0x06]);
        assert!(sighting.connectable);
        assert_eq!(sighting.primary_phy, PrimaryPhy::Le1M);
        assert_eq!(sighting.secondary_phy, None);
        assert_eq!(sighting.tx_power, None);
    }

    #[test]
    fn test_scan_error_display() {
        let err = ScanError::Bluetooth("No default adapter".to_string());
        assert_eq!(format!("{}", err), "Bluetooth error: No default adapter");
        assert_eq!(
            ScanError::BackendNotAvailable("hci".into()).to_string(),
            "Backend 'hci' not available (not compiled in)"
        );
    }

    #[test]
    fn test_scan_error_cause() {
        assert_eq!(ScanError::AdapterDisabled.cause(), ErrorCause::BluetoothDisabled);
        assert_eq!(ScanError::PermissionDenied.cause(), ErrorCause::PermissionDenied);
        assert_eq!(
            ScanError::Bluetooth("boom".into()).cause(),
            ErrorCause::Platform("Bluetooth error: boom".into())
        );
    }

    #[test]
    fn test_scan_error_from_io() {
        let denied = io::Error::from(io::ErrorKind::PermissionDenied);
        assert!(matches!(ScanError::from(denied), ScanError::PermissionDenied));

        let other = io::Error::other("socket closed");
        assert!(matches!(ScanError::from(other), ScanError::Bluetooth(msg) if msg == "socket closed"));
    }

    #[cfg(all(feature = "bluer", feature = "hci"))]
    #[test]
    fn test_backend_from_str() {
        assert_eq!(Backend::from_str("bluer").unwrap(), Backend::Bluer);
        assert_eq!(Backend::from_str("BlueZ").unwrap(), Backend::Bluer);
        assert_eq!(Backend::from_str("hci").unwrap(), Backend::Hci);
        assert_eq!(Backend::from_str("raw").unwrap(), Backend::Hci);
        assert!(Backend::from_str("invalid").is_err());
    }

    #[cfg(all(feature = "bluer", feature = "hci"))]
    #[test]
    fn test_backend_display() {
        assert_eq!(format!("{}", Backend::Bluer), "bluer");
        assert_eq!(format!("{}", Backend::Hci), "hci");
    }
}
