//! Plain-text output formatter.

use crate::advertising::short_uuid;
use crate::output::OutputFormatter;
use crate::store::{ScannedPeripheral, ServiceLookup};
use uuid::Uuid;

const NORDIC_UART_SERVICE: Uuid = Uuid::from_u128(0x6e40_0001_b5a3_f393_e0a9_e50e_24dc_ca9e);

/// Labels for a handful of well-known services.
#[derive(Debug, Default, Clone, Copy)]
pub struct KnownServices;

impl ServiceLookup for KnownServices {
    type Info = &'static str;

    fn service_info(&self, uuid: &Uuid) -> Option<&'static str> {
        if *uuid == NORDIC_UART_SERVICE {
            return Some("Nordic UART");
        }
        let label = match short_uuid(uuid)? {
            0x1800 => "Generic Access",
            0x180A => "Device Information",
            0x180D => "Heart Rate",
            0x180F => "Battery",
            0x1809 => "Health Thermometer",
            0x1816 => "Cycling Speed and Cadence",
            0x181A => "Environmental Sensing",
            0x1827 => "Mesh Provisioning",
            0x1828 => "Mesh Proxy",
            0xFE59 => "Nordic DFU",
            0xFEAA => "Eddystone",
            _ => return None,
        };
        Some(label)
    }
}

/// One line per peripheral: address, RSSI, name and first known service.
///
/// ```text
/// AA:BB:CC:DD:EE:FF   -60 dBm  Nordic HRM [Heart Rate]
/// ```
#[derive(Debug, Default, Clone, Copy)]
pub struct TextFormatter {
    services: KnownServices,
}

impl TextFormatter {
    pub fn new() -> Self {
        Self::default()
    }
}

impl OutputFormatter for TextFormatter {
    fn format(&self, peripheral: &ScannedPeripheral) -> String {
        let mut line = format!(
            "{}  {:>4} dBm  {}",
            peripheral.id(),
            peripheral.rssi(),
            peripheral.name().unwrap_or("(unnamed)")
        );
        if let Some(service) = peripheral.service_info(&self.services) {
            line.push_str(&format!(" [{service}]"));
        }
        line
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::advertising::{AdvertisingDataBuilder, uuid_from_u16};
    use crate::store::AggregationStore;
    use crate::test_utils::{TEST_ID, named_observation, observation_from, unnamed_observation};

    fn peripheral(observation: crate::observation::Observation) -> ScannedPeripheral {
        let mut store = AggregationStore::new();
        store.ingest(observation);
        store.snapshot()[0].clone()
    }

    #[test]
    fn test_known_services() {
        assert_eq!(KnownServices.service_info(&uuid_from_u16(0x180D)), Some("Heart Rate"));
        assert_eq!(KnownServices.service_info(&uuid_from_u16(0xFEAA)), Some("Eddystone"));
        assert_eq!(
            KnownServices.service_info(&NORDIC_UART_SERVICE),
            Some("Nordic UART")
        );
        assert_eq!(KnownServices.service_info(&uuid_from_u16(0x1234)), None);
        assert_eq!(KnownServices.service_info(&Uuid::nil()), None);
    }

    #[test]
    fn test_format_named_peripheral_with_service() {
        let payload = AdvertisingDataBuilder::new()
            .complete_name("Nordic HRM")
            .service_uuids([uuid_from_u16(0x180D)])
            .build();
        let line = TextFormatter::new().format(&peripheral(observation_from(TEST_ID, -60, payload)));
        assert_eq!(line, "AA:BB:CC:DD:EE:FF   -60 dBm  Nordic HRM [Heart Rate]");
    }

    #[test]
    fn test_format_named_peripheral() {
        let line = TextFormatter::new().format(&peripheral(named_observation(TEST_ID, -7, "Thingy")));
        assert_eq!(line, "AA:BB:CC:DD:EE:FF    -7 dBm  Thingy");
    }

    #[test]
    fn test_format_unnamed_peripheral() {
        let line = TextFormatter::new().format(&peripheral(unnamed_observation(TEST_ID, -100)));
        assert_eq!(line, "AA:BB:CC:DD:EE:FF  -100 dBm  (unnamed)");
    }
}
