//! A single decoded radio sighting of a peripheral.

use crate::advertising::AdvertisingData;
use crate::peripheral_id::PeripheralId;
use crate::scanner::Sighting;
use std::fmt;
use std::time::Instant;

/// PHY an advertisement was received on (primary advertising channel).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PrimaryPhy {
    /// LE 1M, used by all legacy advertising
    #[default]
    Le1M,
    /// LE Coded (long range)
    LeCoded,
}

/// PHY of the auxiliary packets of an extended advertisement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phy {
    Le1M,
    Le2M,
    LeCoded,
}

impl fmt::Display for PrimaryPhy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PrimaryPhy::Le1M => write!(f, "LE 1M"),
            PrimaryPhy::LeCoded => write!(f, "LE Coded"),
        }
    }
}

impl fmt::Display for Phy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Phy::Le1M => write!(f, "LE 1M"),
            Phy::Le2M => write!(f, "LE 2M"),
            Phy::LeCoded => write!(f, "LE Coded"),
        }
    }
}

/// One advertisement from one peripheral at one point in time.
///
/// Built from a platform [`Sighting`] by decoding its payload; immutable
/// afterwards.
#[derive(Debug, Clone, PartialEq)]
pub struct Observation {
    /// Identity of the advertising peripheral
    pub id: PeripheralId,
    /// Received signal strength in dBm
    pub rssi: i16,
    /// TX power in dBm, as reported by the platform or advertised in the payload
    pub tx_power: Option<i8>,
    /// Whether the advertisement accepts connections
    pub connectable: bool,
    /// Decoded advertising payload
    pub advertising_data: AdvertisingData,
    pub primary_phy: PrimaryPhy,
    /// Secondary PHY, only present for extended advertising
    pub secondary_phy: Option<Phy>,
    /// Monotonic time the sighting was received
    pub timestamp: Instant,
}

impl Observation {
    /// Advertised local name, if any.
    pub fn name(&self) -> Option<&str> {
        self.advertising_data.name()
    }
}

impl From<Sighting> for Observation {
    fn from(sighting: Sighting) -> Self {
        let advertising_data = AdvertisingData::decode(&sighting.payload);
        Observation {
            id: sighting.id,
            rssi: sighting.rssi,
            tx_power: sighting.tx_power.or(advertising_data.tx_power()),
            connectable: sighting.connectable,
            advertising_data,
            primary_phy: sighting.primary_phy,
            secondary_phy: sighting.secondary_phy,
            timestamp: sighting.timestamp,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::advertising::AdvertisingDataBuilder;
    use crate::test_utils::{TEST_ID, sighting};

    #[test]
    fn test_from_sighting_decodes_payload() {
        let payload = AdvertisingDataBuilder::new()
            .complete_name("Nordic_Beacon")
            .tx_power(-7)
            .build();
        let observation = Observation::from(sighting(TEST_ID, -60, payload));

        assert_eq!(observation.name(), Some("Nordic_Beacon"));
        assert_eq!(observation.rssi, -60);
        assert_eq!(observation.tx_power, Some(-7));
    }

    #[test]
    fn test_platform_tx_power_wins() {
        let payload = AdvertisingDataBuilder::new().tx_power(-7).build();
        let mut s = sighting(TEST_ID, -60, payload);
        s.tx_power = Some(4);
        assert_eq!(Observation::from(s).tx_power, Some(4));
    }

    #[test]
    fn test_undecodable_payload_still_observed() {
        let observation = Observation::from(sighting(TEST_ID, -80, vec![0x7F, 0x01]));
        assert_eq!(observation.id.as_str(), TEST_ID);
        assert_eq!(observation.name(), None);
        assert_eq!(observation.advertising_data.raw(), &[0x7F, 0x01]);
    }

    #[test]
    fn test_phy_display() {
        assert_eq!(PrimaryPhy::default().to_string(), "LE 1M");
        assert_eq!(Phy::LeCoded.to_string(), "LE Coded");
    }
}
