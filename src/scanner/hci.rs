//! Raw HCI socket backend.
//!
//! This backend uses raw Linux HCI sockets to scan for BLE advertisements
//! without requiring the BlueZ daemon. It requires CAP_NET_RAW and
//! CAP_NET_ADMIN capabilities or root privileges.

use super::{EVENT_CHANNEL_BUFFER_SIZE, PlatformEvent, ScanError, Sighting};
use crate::observation::{Phy, PrimaryPhy};
use libc::{AF_BLUETOOTH, SOCK_CLOEXEC, SOCK_RAW, c_int, c_void, sockaddr, socklen_t};
use log::{debug, info, warn};
use std::io;
use std::mem;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use tokio::io::unix::AsyncFd;
use tokio::sync::mpsc;

// HCI protocol constants
const BTPROTO_HCI: c_int = 1;
const SOL_HCI: c_int = 0;
const HCI_FILTER: c_int = 2;
const HCI_CHANNEL_RAW: u16 = 0;

/// hci0
const HCI_DEV_ID: u16 = 0;
const HCI_MAX_EVENT_SIZE: usize = 260;

// HCI packet types
const HCI_COMMAND_PKT: u8 = 0x01;
const HCI_EVENT_PKT: u8 = 0x04;

// HCI events
const EVT_LE_META_EVENT: u8 = 0x3E;

// LE Meta event sub-events
const EVT_LE_ADVERTISING_REPORT: u8 = 0x02;
const EVT_LE_EXTENDED_ADVERTISING_REPORT: u8 = 0x0D;

// HCI commands
const OGF_LE_CTL: u16 = 0x08;
const OCF_LE_SET_SCAN_PARAMETERS: u16 = 0x000B;
const OCF_LE_SET_SCAN_ENABLE: u16 = 0x000C;

const LE_SCAN_PASSIVE: u8 = 0x00;
const LE_PUBLIC_ADDRESS: u8 = 0x00;
const FILTER_POLICY_ACCEPT_ALL: u8 = 0x00;

// Legacy advertising report event types
const ADV_IND: u8 = 0x00;
const ADV_DIRECT_IND: u8 = 0x01;

/// RSSI and TX power value meaning "not available"
const NOT_AVAILABLE: i8 = 127;

/// HCI socket address structure
#[repr(C)]
struct SockaddrHci {
    hci_family: u16,
    hci_dev: u16,
    hci_channel: u16,
}

/// HCI filter structure for raw sockets
#[repr(C)]
struct HciFilter {
    type_mask: u32,
    event_mask: [u32; 2],
    opcode: u16,
}

impl HciFilter {
    fn new() -> Self {
        Self {
            type_mask: 0,
            event_mask: [0, 0],
            opcode: 0,
        }
    }

    fn set_ptype(&mut self, ptype: u8) {
        self.type_mask |= 1 << (ptype as u32);
    }

    fn set_event(&mut self, event: u8) {
        let bit = event as usize;
        self.event_mask[bit / 32] |= 1 << (bit % 32);
    }
}

/// LE Set Scan Parameters command
struct LeSetScanParameters {
    scan_type: u8,
    /// In 0.625ms units
    interval: u16,
    /// In 0.625ms units
    window: u16,
    own_address_type: u8,
    filter_policy: u8,
}

impl LeSetScanParameters {
    fn to_bytes(&self) -> [u8; 7] {
        let interval = self.interval.to_le_bytes();
        let window = self.window.to_le_bytes();
        [
            self.scan_type,
            interval[0],
            interval[1],
            window[0],
            window[1],
            self.own_address_type,
            self.filter_policy,
        ]
    }
}

/// Create an HCI command packet
fn hci_command_packet(ogf: u16, ocf: u16, params: &[u8]) -> Vec<u8> {
    let opcode = (ogf << 10) | ocf;
    let mut packet = Vec::with_capacity(4 + params.len());
    packet.push(HCI_COMMAND_PKT);
    packet.extend_from_slice(&opcode.to_le_bytes());
    packet.push(params.len() as u8);
    packet.extend_from_slice(params);
    packet
}

/// Map an OS error from the HCI socket to a scan error.
fn scan_error(context: &str, err: io::Error) -> ScanError {
    match err.raw_os_error() {
        Some(libc::EPERM | libc::EACCES) => ScanError::PermissionDenied,
        Some(libc::ENETDOWN) => ScanError::AdapterDisabled,
        _ => ScanError::Bluetooth(format!("Failed to {context}: {err}")),
    }
}

/// Non-blocking raw HCI socket bound to one controller.
struct HciSocket(OwnedFd);

impl HciSocket {
    fn open(dev_id: u16) -> Result<Self, ScanError> {
        // nix doesn't support BTPROTO_HCI, so use libc directly.
        // SOCK_NONBLOCK is required for AsyncFd to work properly
        let fd = unsafe {
            libc::socket(
                AF_BLUETOOTH,
                SOCK_RAW | SOCK_CLOEXEC | libc::SOCK_NONBLOCK,
                BTPROTO_HCI,
            )
        };
        if fd < 0 {
            return Err(scan_error("create HCI socket", io::Error::last_os_error()));
        }
        let socket = HciSocket(unsafe { OwnedFd::from_raw_fd(fd) });

        let addr = SockaddrHci {
            hci_family: AF_BLUETOOTH as u16,
            hci_dev: dev_id,
            hci_channel: HCI_CHANNEL_RAW,
        };
        let ret = unsafe {
            libc::bind(
                socket.as_raw_fd(),
                &addr as *const SockaddrHci as *const sockaddr,
                mem::size_of::<SockaddrHci>() as socklen_t,
            )
        };
        if ret < 0 {
            return Err(scan_error("bind HCI socket", io::Error::last_os_error()));
        }

        Ok(socket)
    }

    fn set_filter(&self, filter: &HciFilter) -> Result<(), ScanError> {
        let ret = unsafe {
            libc::setsockopt(
                self.as_raw_fd(),
                SOL_HCI,
                HCI_FILTER,
                filter as *const HciFilter as *const c_void,
                mem::size_of::<HciFilter>() as socklen_t,
            )
        };
        if ret < 0 {
            return Err(scan_error("set HCI filter", io::Error::last_os_error()));
        }
        Ok(())
    }

    fn send_command(&self, ocf: u16, params: &[u8]) -> Result<(), ScanError> {
        let packet = hci_command_packet(OGF_LE_CTL, ocf, params);
        let ret = unsafe {
            libc::write(
                self.as_raw_fd(),
                packet.as_ptr() as *const c_void,
                packet.len(),
            )
        };
        if ret < 0 {
            return Err(scan_error("send HCI command", io::Error::last_os_error()));
        }
        Ok(())
    }

    /// Passive scan, 10ms interval and window, duplicates reported.
    fn start_le_scan(&self) -> Result<(), ScanError> {
        let params = LeSetScanParameters {
            scan_type: LE_SCAN_PASSIVE,
            interval: 0x0010,
            window: 0x0010,
            own_address_type: LE_PUBLIC_ADDRESS,
            filter_policy: FILTER_POLICY_ACCEPT_ALL,
        };
        self.send_command(OCF_LE_SET_SCAN_PARAMETERS, &params.to_bytes())?;
        self.set_scan_enable(true)
    }

    fn set_scan_enable(&self, enable: bool) -> Result<(), ScanError> {
        // Second byte: don't filter duplicates
        self.send_command(OCF_LE_SET_SCAN_ENABLE, &[u8::from(enable), 0x00])
    }

    fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        let ret = unsafe { libc::read(self.as_raw_fd(), buf.as_mut_ptr() as *mut c_void, buf.len()) };
        if ret < 0 {
            Err(io::Error::last_os_error())
        } else {
            Ok(ret as usize)
        }
    }
}

impl AsRawFd for HciSocket {
    fn as_raw_fd(&self) -> RawFd {
        self.0.as_raw_fd()
    }
}

/// Bounds-checked reader over event parameters.
struct Reader<'a> {
    data: &'a [u8],
}

impl<'a> Reader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Reader { data }
    }

    fn take(&mut self, n: usize) -> Option<&'a [u8]> {
        if self.data.len() < n {
            return None;
        }
        let (head, tail) = self.data.split_at(n);
        self.data = tail;
        Some(head)
    }

    fn u8(&mut self) -> Option<u8> {
        self.take(1).map(|bytes| bytes[0])
    }

    fn i8(&mut self) -> Option<i8> {
        self.u8().map(|byte| byte as i8)
    }

    fn u16(&mut self) -> Option<u16> {
        self.take(2).map(|bytes| u16::from_le_bytes([bytes[0], bytes[1]]))
    }

    /// Device address; HCI sends it least significant byte first.
    fn address(&mut self) -> Option<[u8; 6]> {
        let mut address = [0u8; 6];
        address.copy_from_slice(self.take(6)?);
        address.reverse();
        Some(address)
    }
}

/// Extract every sighting from one HCI event packet.
fn parse_event(packet: &[u8]) -> Vec<Sighting> {
    match packet {
        [HCI_EVENT_PKT, EVT_LE_META_EVENT, _, EVT_LE_ADVERTISING_REPORT, params @ ..] => {
            parse_reports(params, read_legacy_report)
        }
        [HCI_EVENT_PKT, EVT_LE_META_EVENT, _, EVT_LE_EXTENDED_ADVERTISING_REPORT, params @ ..] => {
            parse_reports(params, read_extended_report)
        }
        _ => Vec::new(),
    }
}

fn parse_reports(
    params: &[u8],
    read_report: fn(&mut Reader<'_>) -> Option<Option<Sighting>>,
) -> Vec<Sighting> {
    let mut reader = Reader::new(params);
    let Some(count) = reader.u8() else {
        return Vec::new();
    };

    let mut sightings = Vec::with_capacity(count as usize);
    for _ in 0..count {
        match read_report(&mut reader) {
            Some(Some(sighting)) => sightings.push(sighting),
            Some(None) => {}
            None => {
                debug!("truncated advertising report");
                break;
            }
        }
    }
    sightings
}

/// One LE Advertising Report entry. `None` when truncated, `Some(None)`
/// when the report carries no usable sighting.
fn read_legacy_report(reader: &mut Reader<'_>) -> Option<Option<Sighting>> {
    let event_type = reader.u8()?;
    let _address_type = reader.u8()?;
    let address = reader.address()?;
    let len = reader.u8()? as usize;
    let data = reader.take(len)?;
    let rssi = reader.i8()?;

    if rssi == NOT_AVAILABLE {
        return Some(None);
    }
    let mut sighting = Sighting::new(address.into(), rssi.into(), data.to_vec());
    sighting.connectable = matches!(event_type, ADV_IND | ADV_DIRECT_IND);
    Some(Some(sighting))
}

/// One LE Extended Advertising Report entry. Fragments of a chained
/// advertisement are dropped.
fn read_extended_report(reader: &mut Reader<'_>) -> Option<Option<Sighting>> {
    let event_type = reader.u16()?;
    let _address_type = reader.u8()?;
    let address = reader.address()?;
    let primary_phy = reader.u8()?;
    let secondary_phy = reader.u8()?;
    let _sid = reader.u8()?;
    let tx_power = reader.i8()?;
    let rssi = reader.i8()?;
    let _periodic_interval = reader.u16()?;
    let _direct_address_type = reader.u8()?;
    let _direct_address = reader.take(6)?;
    let len = reader.u8()? as usize;
    let data = reader.take(len)?;

    let complete = (event_type >> 5) & 0b11 == 0;
    if rssi == NOT_AVAILABLE || !complete {
        return Some(None);
    }

    let mut sighting = Sighting::new(address.into(), rssi.into(), data.to_vec());
    sighting.connectable = event_type & 0x0001 != 0;
    sighting.tx_power = (tx_power != NOT_AVAILABLE).then_some(tx_power);
    sighting.primary_phy = match primary_phy {
        0x03 => PrimaryPhy::LeCoded,
        _ => PrimaryPhy::Le1M,
    };
    sighting.secondary_phy = match secondary_phy {
        0x01 => Some(Phy::Le1M),
        0x02 => Some(Phy::Le2M),
        0x03 => Some(Phy::LeCoded),
        _ => None,
    };
    Some(Some(sighting))
}

/// Start a passive LE scan on hci0 using raw HCI sockets.
///
/// # Requirements
/// - CAP_NET_RAW and CAP_NET_ADMIN capabilities or root privileges
/// - An available HCI device (typically hci0)
pub async fn start_scan() -> Result<mpsc::Receiver<PlatformEvent>, ScanError> {
    let socket = HciSocket::open(HCI_DEV_ID)?;

    let mut filter = HciFilter::new();
    filter.set_ptype(HCI_EVENT_PKT);
    filter.set_event(EVT_LE_META_EVENT);
    socket.set_filter(&filter)?;
    socket.start_le_scan()?;
    info!("scanning on hci{HCI_DEV_ID}");

    let socket = AsyncFd::new(socket)?;
    let (tx, rx) = mpsc::channel(EVENT_CHANNEL_BUFFER_SIZE);
    tokio::spawn(read_events(socket, tx));

    Ok(rx)
}

/// Forward advertising reports until the receiver is dropped or the
/// socket fails, then disable scanning.
async fn read_events(socket: AsyncFd<HciSocket>, tx: mpsc::Sender<PlatformEvent>) {
    let mut buf = [0u8; HCI_MAX_EVENT_SIZE];

    'scan: loop {
        let mut guard = tokio::select! {
            _ = tx.closed() => break,
            ready = socket.readable() => match ready {
                Ok(guard) => guard,
                Err(e) => {
                    let err = scan_error("poll HCI socket", e);
                    warn!("{err}");
                    let _ = tx.send(PlatformEvent::Failed(err.cause())).await;
                    break;
                }
            },
        };

        // Drain all available packets before waiting again
        loop {
            let n = match guard.try_io(|inner| inner.get_ref().read(&mut buf)) {
                Ok(Ok(n)) if n > 0 => n,
                Ok(Ok(_)) => break,
                Ok(Err(e)) => {
                    let err = scan_error("read HCI socket", e);
                    warn!("{err}");
                    let _ = tx.send(PlatformEvent::Failed(err.cause())).await;
                    break 'scan;
                }
                Err(_would_block) => break,
            };

            for sighting in parse_event(&buf[..n]) {
                if tx.send(PlatformEvent::Sighting(sighting)).await.is_err() {
                    break 'scan;
                }
            }
        }
    }

    if let Err(e) = socket.get_ref().set_scan_enable(false) {
        debug!("could not disable scanning: {e}");
    }
    debug!("HCI scan task finished");
}
