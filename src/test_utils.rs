use crate::advertising::AdvertisingDataBuilder;
use crate::observation::Observation;
use crate::scanner::Sighting;
use uuid::Uuid;

/// A stable peripheral identifier for unit tests.
pub const TEST_ID: &str = "AA:BB:CC:DD:EE:FF";

/// Build a connectable legacy-advertising `Sighting` received now.
pub fn sighting(id: &str, rssi: i16, payload: Vec<u8>) -> Sighting {
    Sighting::new(id.parse().expect("valid test id"), rssi, payload)
}

pub fn observation_from(id: &str, rssi: i16, payload: Vec<u8>) -> Observation {
    sighting(id, rssi, payload).into()
}

pub fn named_observation(id: &str, rssi: i16, name: &str) -> Observation {
    observation_from(id, rssi, AdvertisingDataBuilder::new().complete_name(name).build())
}

/// An observation whose payload only carries flags.
pub fn unnamed_observation(id: &str, rssi: i16) -> Observation {
    observation_from(id, rssi, AdvertisingDataBuilder::new().flags(0x06).build())
}

pub fn observation_with_services(id: &str, rssi: i16, services: &[Uuid]) -> Observation {
    let payload = AdvertisingDataBuilder::new()
        .service_uuids(services.iter().copied())
        .build();
    observation_from(id, rssi, payload)
}
