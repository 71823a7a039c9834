//! BlueZ D-Bus backend.
//!
//! This backend uses the `bluer` crate to communicate with the BlueZ daemon
//! via D-Bus. It requires the `bluetoothd` daemon to be running.
//!
//! BlueZ does not hand out raw advertising payloads. The backend reads the
//! device properties BlueZ parsed from the advertisement and encodes them
//! back into AD structures, so both backends feed the same decoder.

use super::{EVENT_CHANNEL_BUFFER_SIZE, PlatformEvent, ScanError, Sighting};
use crate::advertising::AdvertisingDataBuilder;
use crate::session::ErrorCause;
use bluer::{
    Adapter, AdapterEvent, AdapterProperty, Address, DiscoveryFilter, DiscoveryTransport, Session,
};
use futures::StreamExt;
use log::{debug, info, warn};
use std::collections::{BTreeMap, BTreeSet};
use tokio::sync::mpsc;
use uuid::Uuid;

impl From<bluer::Error> for ScanError {
    fn from(err: bluer::Error) -> Self {
        match err.kind {
            bluer::ErrorKind::NotAuthorized | bluer::ErrorKind::NotPermitted => {
                ScanError::PermissionDenied
            }
            bluer::ErrorKind::NotReady => ScanError::AdapterDisabled,
            _ => ScanError::Bluetooth(err.to_string()),
        }
    }
}

/// Start LE discovery on the default adapter.
///
/// Every advertisement BlueZ reports (including re-sightings, since duplicate
/// filtering is disabled) is sent as a [`PlatformEvent::Sighting`]. Powering
/// the adapter off ends the scan with [`ErrorCause::BluetoothDisabled`].
/// Dropping the receiver stops discovery.
pub async fn start_scan() -> Result<mpsc::Receiver<PlatformEvent>, ScanError> {
    let session = Session::new().await?;
    let adapter = session.default_adapter().await?;
    if !adapter.is_powered().await? {
        return Err(ScanError::AdapterDisabled);
    }

    let filter = DiscoveryFilter {
        transport: DiscoveryTransport::Le,
        duplicate_data: true,
        ..Default::default()
    };
    adapter.set_discovery_filter(filter).await?;

    let mut discovery = Box::pin(adapter.discover_devices_with_changes().await?);
    let mut adapter_events = Box::pin(adapter.events().await?);
    info!("discovering on adapter {}", adapter.name());

    let (tx, rx) = mpsc::channel(EVENT_CHANNEL_BUFFER_SIZE);

    // Spawn a task that owns all Bluetooth state and runs the event loop
    tokio::spawn(async move {
        let _session = session;

        loop {
            tokio::select! {
                _ = tx.closed() => break,
                event = discovery.next() => match event {
                    Some(AdapterEvent::DeviceAdded(address)) => {
                        match read_sighting(&adapter, address).await {
                            Ok(Some(sighting)) => {
                                if tx.send(PlatformEvent::Sighting(sighting)).await.is_err() {
                                    break;
                                }
                            }
                            Ok(None) => {}
                            Err(e) => debug!("skipping {address}: {e}"),
                        }
                    }
                    Some(_) => {}
                    None => {
                        warn!("BlueZ discovery stream ended");
                        break;
                    }
                },
                event = adapter_events.next() => match event {
                    Some(AdapterEvent::PropertyChanged(AdapterProperty::Powered(false))) => {
                        warn!("adapter {} powered off", adapter.name());
                        let _ = tx.send(PlatformEvent::Failed(ErrorCause::BluetoothDisabled)).await;
                        break;
                    }
                    Some(_) => {}
                    None => break,
                },
            }
        }
        // Dropping the discovery stream stops discovery.
        debug!("BlueZ scan task finished");
    });

    Ok(rx)
}

/// Advertisement contents as parsed by BlueZ.
#[derive(Debug, Default)]
struct DeviceProperties {
    name: Option<String>,
    uuids: BTreeSet<Uuid>,
    manufacturer_data: BTreeMap<u16, Vec<u8>>,
    service_data: BTreeMap<Uuid, Vec<u8>>,
    tx_power: Option<i8>,
}

impl DeviceProperties {
    /// Re-encode as AD structures, in a stable order.
    fn to_payload(&self) -> Vec<u8> {
        let mut builder = AdvertisingDataBuilder::new();
        if let Some(name) = &self.name {
            builder = builder.complete_name(name);
        }
        if !self.uuids.is_empty() {
            builder = builder.service_uuids(self.uuids.iter().copied());
        }
        if let Some(tx_power) = self.tx_power {
            builder = builder.tx_power(tx_power);
        }
        for (company_id, data) in &self.manufacturer_data {
            builder = builder.manufacturer_data(*company_id, data);
        }
        for (uuid, data) in &self.service_data {
            builder = builder.service_data(*uuid, data);
        }
        builder.build()
    }
}

/// Read the current properties of a device. Devices without an RSSI are
/// cached entries BlueZ has not heard in this discovery, not sightings.
async fn read_sighting(adapter: &Adapter, address: Address) -> Result<Option<Sighting>, ScanError> {
    let device = adapter.device(address)?;
    let Some(rssi) = device.rssi().await? else {
        return Ok(None);
    };

    let properties = DeviceProperties {
        name: device.name().await?,
        uuids: device.uuids().await?.unwrap_or_default().into_iter().collect(),
        manufacturer_data: device
            .manufacturer_data()
            .await?
            .unwrap_or_default()
            .into_iter()
            .collect(),
        service_data: device.service_data().await?.unwrap_or_default().into_iter().collect(),
        tx_power: device
            .tx_power()
            .await?
            .and_then(|dbm| i8::try_from(dbm).ok()),
    };

    let mut sighting = Sighting::new(address.into(), rssi, properties.to_payload());
    sighting.tx_power = properties.tx_power;
    Ok(Some(sighting))
}
