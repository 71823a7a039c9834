//! Advertising payload decoding.
//!
//! A BLE advertising payload is a sequence of length-type-value records
//! ("AD structures"): one length byte covering the type byte and the body,
//! one AD type byte, then the body. Decoding is best effort. Records that are
//! malformed for their type are skipped one by one, and decoding never fails:
//! a payload without any recognised record still yields a valid, empty
//! [`AdvertisingData`].

use log::debug;
use uuid::Uuid;

/// The Bluetooth base UUID `00000000-0000-1000-8000-00805F9B34FB`.
///
/// 16- and 32-bit service UUIDs are aliases for this UUID with the short
/// value placed in the top 32 bits.
pub const BLUETOOTH_BASE_UUID: u128 = 0x0000_0000_0000_1000_8000_0080_5F9B_34FB;

// AD types (Bluetooth Assigned Numbers, section 2.3)
const AD_FLAGS: u8 = 0x01;
const AD_INCOMPLETE_UUID16: u8 = 0x02;
const AD_COMPLETE_UUID16: u8 = 0x03;
const AD_INCOMPLETE_UUID32: u8 = 0x04;
const AD_COMPLETE_UUID32: u8 = 0x05;
const AD_INCOMPLETE_UUID128: u8 = 0x06;
const AD_COMPLETE_UUID128: u8 = 0x07;
const AD_SHORTENED_NAME: u8 = 0x08;
const AD_COMPLETE_NAME: u8 = 0x09;
const AD_TX_POWER: u8 = 0x0A;
const AD_SERVICE_DATA_UUID16: u8 = 0x16;
const AD_SERVICE_DATA_UUID32: u8 = 0x20;
const AD_SERVICE_DATA_UUID128: u8 = 0x21;
const AD_MANUFACTURER_DATA: u8 = 0xFF;

/// Expand a 16-bit assigned number into a full UUID.
///
/// ```
/// use ble_scanner::advertising::uuid_from_u16;
///
/// let heart_rate = uuid_from_u16(0x180D);
/// assert_eq!(heart_rate.to_string(), "0000180d-0000-1000-8000-00805f9b34fb");
/// ```
pub fn uuid_from_u16(short: u16) -> Uuid {
    uuid_from_u32(u32::from(short))
}

/// Expand a 32-bit assigned number into a full UUID.
pub fn uuid_from_u32(short: u32) -> Uuid {
    Uuid::from_u128(BLUETOOTH_BASE_UUID | (u128::from(short) << 96))
}

/// The 16-bit alias of `uuid`, if it is derived from the base UUID.
pub fn short_uuid(uuid: &Uuid) -> Option<u16> {
    let value = uuid.as_u128();
    let base = value & !(u128::from(u32::MAX) << 96);
    let short = value >> 96;
    (base == BLUETOOTH_BASE_UUID && short <= u128::from(u16::MAX)).then_some(short as u16)
}

/// Little-endian UUID of 2, 4 or 16 bytes as found in AD records.
fn uuid_from_le(bytes: &[u8]) -> Option<Uuid> {
    match bytes.len() {
        2 => Some(uuid_from_u16(u16::from_le_bytes(bytes.try_into().ok()?))),
        4 => Some(uuid_from_u32(u32::from_le_bytes(bytes.try_into().ok()?))),
        16 => Some(Uuid::from_u128(u128::from_le_bytes(bytes.try_into().ok()?))),
        _ => None,
    }
}

/// One manufacturer specific data block (AD type 0xFF).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManufacturerData {
    /// Bluetooth SIG company identifier
    pub company_id: u16,
    /// Payload after the company identifier
    pub data: Vec<u8>,
}

/// One service data block (AD types 0x16, 0x20, 0x21).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceData {
    pub uuid: Uuid,
    pub data: Vec<u8>,
}

/// Structured view of an advertising payload.
///
/// A pure function of the raw bytes: construct it with
/// [`AdvertisingData::decode`], there are no setters.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct AdvertisingData {
    raw: Vec<u8>,
    flags: Option<u8>,
    name: Option<String>,
    service_uuids: Vec<Uuid>,
    service_data: Vec<ServiceData>,
    manufacturer_data: Vec<ManufacturerData>,
    tx_power: Option<i8>,
}

impl AdvertisingData {
    /// Decode a raw advertising payload.
    ///
    /// The complete local name wins over a shortened one regardless of
    /// record order. Service UUIDs keep the order of their first appearance
    /// and are listed once.
    pub fn decode(raw: &[u8]) -> Self {
        let mut decoded = AdvertisingData {
            raw: raw.to_vec(),
            ..Default::default()
        };
        let mut shortened_name = None;

        for (ad_type, body) in Records::new(raw) {
            if let Err(reason) = decoded.apply(ad_type, body, &mut shortened_name) {
                debug!("skipping AD record 0x{ad_type:02X}: {reason}");
            }
        }

        if decoded.name.is_none() {
            decoded.name = shortened_name;
        }
        decoded
    }

    fn apply(
        &mut self,
        ad_type: u8,
        body: &[u8],
        shortened_name: &mut Option<String>,
    ) -> Result<(), &'static str> {
        match ad_type {
            AD_FLAGS => {
                let [flags] = body else {
                    return Err("flags must be a single byte");
                };
                self.flags = Some(*flags);
            }
            AD_INCOMPLETE_UUID16 | AD_COMPLETE_UUID16 => self.push_uuids(body, 2)?,
            AD_INCOMPLETE_UUID32 | AD_COMPLETE_UUID32 => self.push_uuids(body, 4)?,
            AD_INCOMPLETE_UUID128 | AD_COMPLETE_UUID128 => self.push_uuids(body, 16)?,
            AD_SHORTENED_NAME => *shortened_name = Some(decode_name(body)?),
            AD_COMPLETE_NAME => self.name = Some(decode_name(body)?),
            AD_TX_POWER => {
                let [power] = body else {
                    return Err("tx power must be a single byte");
                };
                self.tx_power = Some(*power as i8);
            }
            AD_SERVICE_DATA_UUID16 => self.push_service_data(body, 2)?,
            AD_SERVICE_DATA_UUID32 => self.push_service_data(body, 4)?,
            AD_SERVICE_DATA_UUID128 => self.push_service_data(body, 16)?,
            AD_MANUFACTURER_DATA => {
                let [lo, hi, data @ ..] = body else {
                    return Err("manufacturer data shorter than company id");
                };
                self.manufacturer_data.push(ManufacturerData {
                    company_id: u16::from_le_bytes([*lo, *hi]),
                    data: data.to_vec(),
                });
            }
            _ => {}
        }
        Ok(())
    }

    fn push_uuids(&mut self, body: &[u8], width: usize) -> Result<(), &'static str> {
        if body.len() % width != 0 {
            return Err("service uuid list has a partial entry");
        }
        for uuid in body.chunks_exact(width).filter_map(uuid_from_le) {
            if !self.service_uuids.contains(&uuid) {
                self.service_uuids.push(uuid);
            }
        }
        Ok(())
    }

    fn push_service_data(&mut self, body: &[u8], width: usize) -> Result<(), &'static str> {
        if body.len() < width {
            return Err("service data shorter than its uuid");
        }
        let (uuid, data) = body.split_at(width);
        let uuid = uuid_from_le(uuid).ok_or("service data uuid has an invalid width")?;
        self.service_data.push(ServiceData {
            uuid,
            data: data.to_vec(),
        });
        Ok(())
    }

    /// The payload exactly as received.
    pub fn raw(&self) -> &[u8] {
        &self.raw
    }

    pub fn flags(&self) -> Option<u8> {
        self.flags
    }

    /// Local name, complete if advertised, otherwise shortened.
    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    /// Advertised service UUIDs in order of first appearance.
    pub fn service_uuids(&self) -> &[Uuid] {
        &self.service_uuids
    }

    pub fn has_service(&self, uuid: &Uuid) -> bool {
        self.service_uuids.contains(uuid)
    }

    pub fn service_data(&self) -> &[ServiceData] {
        &self.service_data
    }

    pub fn manufacturer_data(&self) -> &[ManufacturerData] {
        &self.manufacturer_data
    }

    /// Payload of the first manufacturer data block with `company_id`.
    pub fn manufacturer_data_for(&self, company_id: u16) -> Option<&[u8]> {
        self.manufacturer_data
            .iter()
            .find(|block| block.company_id == company_id)
            .map(|block| block.data.as_slice())
    }

    /// Advertised TX power level in dBm.
    pub fn tx_power(&self) -> Option<i8> {
        self.tx_power
    }
}

fn decode_name(body: &[u8]) -> Result<String, &'static str> {
    // Some firmware pads the name field with NULs.
    let name = String::from_utf8_lossy(body);
    let name = name.trim_end_matches('\0');
    if name.is_empty() {
        return Err("empty name");
    }
    Ok(name.to_string())
}

/// Iterator over `(ad_type, body)` pairs of a payload.
struct Records<'a> {
    data: &'a [u8],
}

impl<'a> Records<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data }
    }
}

impl<'a> Iterator for Records<'a> {
    type Item = (u8, &'a [u8]);

    fn next(&mut self) -> Option<Self::Item> {
        let data = self.data;
        let [len, rest @ ..] = data else {
            return None;
        };
        let len = *len as usize;

        // A zero length marks the end of the significant part.
        if len == 0 {
            self.data = &[];
            return None;
        }
        // Nothing to resynchronise on after a record that overruns the buffer.
        if len > rest.len() {
            debug!("truncated AD record: length {len}, {} bytes left", rest.len());
            self.data = &[];
            return None;
        }

        let (record, remaining) = rest.split_at(len);
        self.data = remaining;
        let (ad_type, body) = record.split_first()?;
        Some((*ad_type, body))
    }
}

/// Encoder for advertising payloads.
///
/// Used where a platform hands out already-parsed advertisement properties
/// and a payload has to be rebuilt, and for composing payloads in tests.
///
/// ```
/// use ble_scanner::advertising::{AdvertisingData, AdvertisingDataBuilder, uuid_from_u16};
///
/// let raw = AdvertisingDataBuilder::new()
///     .complete_name("Nordic HRM")
///     .service_uuids([uuid_from_u16(0x180D)])
///     .build();
///
/// let decoded = AdvertisingData::decode(&raw);
/// assert_eq!(decoded.name(), Some("Nordic HRM"));
/// assert!(decoded.has_service(&uuid_from_u16(0x180D)));
/// ```
#[derive(Debug, Clone, Default)]
pub struct AdvertisingDataBuilder {
    bytes: Vec<u8>,
}

impl AdvertisingDataBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a record verbatim. Bodies longer than an AD length byte can
    /// describe are truncated.
    pub fn record(mut self, ad_type: u8, body: &[u8]) -> Self {
        let body = &body[..body.len().min(usize::from(u8::MAX) - 1)];
        self.bytes.push((body.len() + 1) as u8);
        self.bytes.push(ad_type);
        self.bytes.extend_from_slice(body);
        self
    }

    pub fn flags(self, flags: u8) -> Self {
        self.record(AD_FLAGS, &[flags])
    }

    pub fn complete_name(self, name: &str) -> Self {
        self.record(AD_COMPLETE_NAME, name.as_bytes())
    }

    pub fn shortened_name(self, name: &str) -> Self {
        self.record(AD_SHORTENED_NAME, name.as_bytes())
    }

    /// Complete service UUID lists: one 16-bit list for UUIDs derived from
    /// the base UUID, one 128-bit list for the rest.
    pub fn service_uuids(mut self, uuids: impl IntoIterator<Item = Uuid>) -> Self {
        let mut short = Vec::new();
        let mut long = Vec::new();
        for uuid in uuids {
            match short_uuid(&uuid) {
                Some(alias) => short.extend_from_slice(&alias.to_le_bytes()),
                None => long.extend_from_slice(&uuid.as_u128().to_le_bytes()),
            }
        }
        if !short.is_empty() {
            self = self.record(AD_COMPLETE_UUID16, &short);
        }
        if !long.is_empty() {
            self = self.record(AD_COMPLETE_UUID128, &long);
        }
        self
    }

    pub fn tx_power(self, dbm: i8) -> Self {
        self.record(AD_TX_POWER, &[dbm as u8])
    }

    pub fn manufacturer_data(self, company_id: u16, data: &[u8]) -> Self {
        let mut body = company_id.to_le_bytes().to_vec();
        body.extend_from_slice(data);
        self.record(AD_MANUFACTURER_DATA, &body)
    }

    pub fn service_data(self, uuid: Uuid, data: &[u8]) -> Self {
        let (ad_type, mut body) = match short_uuid(&uuid) {
            Some(alias) => (AD_SERVICE_DATA_UUID16, alias.to_le_bytes().to_vec()),
            None => (
                AD_SERVICE_DATA_UUID128,
                uuid.as_u128().to_le_bytes().to_vec(),
            ),
        };
        body.extend_from_slice(data);
        self.record(ad_type, &body)
    }

    pub fn build(self) -> Vec<u8> {
        self.bytes
    }
}
