//! This is the lowest-level module. It is responsible for scanning the USB bus
//! to find an FTDI MPSSE adapter, switching it into MPSSE mode, and reading and
//! writing raw bytes to it over the bulk endpoints using `rusb`.

use std::time::Duration;
use thiserror::Error;
use rusb::{Device, DeviceHandle, Context, UsbContext};
use crate::buffer::Transport;
use crate::mpsse::Command;

#[derive(Error, Debug)]
pub enum Error {
    #[error("specified probe not found.")]
    NotFound,
    #[error("no FTDI probes found.")]
    NoProbesFound,
    #[error("multiple FTDI probes found, select a specific probe.")]
    MultipleProbesFound,
    #[error("MPSSE sync failed for opcode 0x{opcode:02X}, got {response:02X?}.")]
    SyncFailed { opcode: u8, response: Vec<u8> },
    #[error("USB error")]
    USB(#[from] rusb::Error),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

pub const FTDI_VID: u16 = 0x0403;
pub const FTDI_PIDS: &[u16] = &[0x6001, 0x6010, 0x6011, 0x6014];

/// bcdDevice of the FT2232C-based boards which need the high GPIO byte set up.
pub const BCD_HIGH_GPIO: u16 = 0x0700;

const SIO_RESET_REQUEST: u8 = 0x00;
const SIO_SET_BAUDRATE_REQUEST: u8 = 0x03;
const SIO_SET_LATENCY_TIMER_REQUEST: u8 = 0x09;
const SIO_SET_BITMODE_REQUEST: u8 = 0x0B;
const SIO_RESET_SIO: u16 = 0;
const SIO_RESET_PURGE_RX: u16 = 1;
const SIO_RESET_PURGE_TX: u16 = 2;
const BITMODE_RESET: u16 = 0x0000;
const BITMODE_MPSSE: u16 = 0x0200;
const LATENCY: u16 = 255;

/// Serial baud rate programmed before entering MPSSE mode, where it is unused.
const BAUD_RATE: u32 = 9600;

/// Reference clock for the serial baud rate divisor.
const BAUD_CLOCK: u32 = 12_000_000;

/// Encoding of the fractional part of the baud divisor, indexed by eighths.
const BAUD_FRACTION: [u32; 8] = [0, 3, 2, 4, 1, 5, 6, 7];

/// Size of each bulk IN request.
const READ_CHUNK: usize = 4096;

/// Number of consecutive status-only reads before a read gives up.
const READ_POLLS: usize = 64;

/// Number of status bytes at the start of each bulk IN packet.
const STATUS_BYTES: usize = 2;

const CONTROL_TIMEOUT: Duration = Duration::from_millis(5000);
const BULK_TIMEOUT: Duration = Duration::from_millis(5000);
const POLL_TIMEOUT: Duration = Duration::from_millis(100);

/// Which channel of a multi-channel FTDI chip to use.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Interface {
    A,
    B,
}

impl Interface {
    pub fn from_index(index: u8) -> Option<Self> {
        match index {
            0 => Some(Interface::A),
            1 => Some(Interface::B),
            _ => None,
        }
    }

    fn number(&self) -> u8 {
        match self {
            Interface::A => 0,
            Interface::B => 1,
        }
    }

    /// wIndex used by vendor control requests for this channel.
    fn index(&self) -> u16 {
        self.number() as u16 + 1
    }

    fn out_ep(&self) -> u8 {
        match self {
            Interface::A => 0x02,
            Interface::B => 0x04,
        }
    }

    fn in_ep(&self) -> u8 {
        match self {
            Interface::A => 0x81,
            Interface::B => 0x83,
        }
    }
}

/// Handle to an open FTDI adapter in MPSSE mode.
pub struct Probe {
    handle: DeviceHandle<Context>,
    interface: Interface,
    max_packet_size: usize,
    bcd_device: u16,
}

impl Probe {
    /// Attempt to open an adapter, optionally selected by serial number.
    ///
    /// Fails if zero or more than one matching adapter is detected.
    pub fn new(serial: Option<&str>, interface: Interface) -> Result<Probe> {
        log::debug!("Attempting to open probe, serial {:?}, interface {:?}", serial, interface);
        let probes: Vec<ProbeInfo> = ProbeInfo::list().into_iter()
                                                      .filter(|p| p.matches(serial))
                                                      .collect();
        if probes.is_empty() {
            match serial {
                Some(_) => Err(Error::NotFound),
                None => Err(Error::NoProbesFound),
            }
        } else if probes.len() > 1 {
            Err(Error::MultipleProbesFound)
        } else {
            probes[0].open(interface)
        }
    }

    /// bcdDevice of the underlying USB device.
    pub fn bcd_device(&self) -> u16 {
        self.bcd_device
    }

    /// Whether this adapter needs the high GPIO byte initialised.
    pub fn needs_high_gpio(&self) -> bool {
        self.bcd_device == BCD_HIGH_GPIO
    }

    /// Open a specific device, configure it for MPSSE and synchronise.
    fn from_device(device: Device<Context>, interface: Interface) -> Result<Probe> {
        log::trace!("Attempting to open FTDI device: {:?}", device);
        let desc = device.device_descriptor()?;
        let mut handle = device.open()?;
        if let Err(e) = handle.set_auto_detach_kernel_driver(true) {
            log::debug!("Could not enable kernel driver auto-detach: {}", e);
        }

        let config = device.config_descriptor(0)?;
        if desc.num_configurations() > 0 && handle.active_configuration()? != config.number() {
            handle.set_active_configuration(config.number())?;
        }
        handle.claim_interface(interface.number())?;

        let max_packet_size = config.interfaces()
            .find(|i| i.number() == interface.number())
            .and_then(|i| i.descriptors().next())
            .and_then(|d| d.endpoint_descriptors()
                           .find(|ep| ep.address() == interface.in_ep())
                           .map(|ep| ep.max_packet_size() as usize))
            .unwrap_or(64);

        let mut probe = Probe {
            handle,
            interface,
            max_packet_size,
            bcd_device: bcd_from_version(desc.device_version()),
        };
        probe.configure()?;
        probe.sync()?;
        log::debug!("Opened probe, max packet size {}", probe.max_packet_size);
        Ok(probe)
    }

    fn control(&self, request: u8, value: u16) -> Result<()> {
        self.control_indexed(request, value, 0)
    }

    /// Vendor request with extra bits in the high byte of wIndex.
    fn control_indexed(&self, request: u8, value: u16, index_high: u16) -> Result<()> {
        let request_type = rusb::request_type(rusb::Direction::Out,
                                              rusb::RequestType::Vendor,
                                              rusb::Recipient::Device);
        let index = (index_high & 0xFF00) | self.interface.index();
        self.handle.write_control(request_type, request, value, index, &[], CONTROL_TIMEOUT)?;
        Ok(())
    }

    /// Reset the channel and switch it into MPSSE mode.
    fn configure(&self) -> Result<()> {
        log::trace!("Configuring MPSSE mode");
        self.control(SIO_RESET_REQUEST, SIO_RESET_SIO)?;
        let (value, index_high) = baud_divisor(BAUD_RATE);
        self.control_indexed(SIO_SET_BAUDRATE_REQUEST, value, index_high)?;
        self.control(SIO_SET_LATENCY_TIMER_REQUEST, LATENCY)?;
        self.control(SIO_SET_BITMODE_REQUEST, BITMODE_RESET)?;
        self.control(SIO_SET_BITMODE_REQUEST, BITMODE_MPSSE)?;
        self.control(SIO_RESET_REQUEST, SIO_RESET_PURGE_RX)?;
        self.control(SIO_RESET_REQUEST, SIO_RESET_PURGE_TX)?;
        Ok(())
    }

    /// Send bad opcodes and check the MPSSE engine reports each one back.
    fn sync(&mut self) -> Result<()> {
        for &opcode in &[0xAAu8, 0xAA, 0xAA, 0xAA, 0xAB] {
            let mut data = vec![opcode];
            data.extend_from_slice(Command::send_immediate().as_bytes());
            self.write_bulk(&data)?;
            let response = self.read_bulk(2)?;
            if response != [0xFA, opcode] {
                log::error!("MPSSE sync failed: sent 0x{:02X}, got {:02X?}", opcode, response);
                return Err(Error::SyncFailed { opcode, response });
            }
        }
        Ok(())
    }

    /// Write all of `data` to the adapter.
    pub fn write_bulk(&self, data: &[u8]) -> Result<usize> {
        log::trace!("TX: {:02X?}", data);
        Ok(self.handle.write_bulk(self.interface.out_ep(), data, BULK_TIMEOUT)?)
    }

    /// Read up to `len` bytes of MPSSE reply, with status bytes removed.
    ///
    /// Gives up after a bounded number of reads which return only status
    /// bytes, in which case fewer than `len` bytes are returned.
    pub fn read_bulk(&self, len: usize) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(len);
        let mut buf = vec![0u8; READ_CHUNK];
        let mut empty = 0;
        while out.len() < len && empty < READ_POLLS {
            let n = match self.handle.read_bulk(self.interface.in_ep(), &mut buf, POLL_TIMEOUT) {
                Ok(n) => n,
                Err(rusb::Error::Timeout) => 0,
                Err(e) => return Err(e.into()),
            };
            let data = strip_status(&buf[..n], self.max_packet_size);
            if data.is_empty() {
                empty += 1;
                continue;
            }
            empty = 0;
            out.extend_from_slice(&data);
        }
        if out.len() > len {
            log::warn!("Adapter sent {} bytes, expected {}", out.len(), len);
        }
        log::trace!("RX: {:02X?}", out);
        Ok(out)
    }
}

impl Transport for Probe {
    fn write(&mut self, data: &[u8]) -> anyhow::Result<usize> {
        Ok(self.write_bulk(data)?)
    }

    fn read(&mut self, len: usize) -> anyhow::Result<Vec<u8>> {
        Ok(self.read_bulk(len)?)
    }
}

/// Remove the two modem status bytes which start every bulk IN packet.
fn strip_status(data: &[u8], max_packet_size: usize) -> Vec<u8> {
    data.chunks(max_packet_size.max(STATUS_BYTES + 1))
        .filter(|c| c.len() > STATUS_BYTES)
        .flat_map(|c| c[STATUS_BYTES..].iter().copied())
        .collect()
}

fn bcd_from_version(version: rusb::Version) -> u16 {
    ((version.major() as u16) << 8)
        | ((version.minor() as u16 & 0xF) << 4)
        | (version.sub_minor() as u16 & 0xF)
}

/// Encode a serial baud rate as the (wValue, wIndex high byte) pair of the
/// set-baud-rate request: an integer divisor with a 3-bit coded fraction.
fn baud_divisor(baud: u32) -> (u16, u16) {
    let divisor = BAUD_CLOCK * 8 / baud;
    let encoded = (divisor >> 3) | (BAUD_FRACTION[(divisor & 7) as usize] << 14);
    (((encoded | 0x20000) & 0xFFFF) as u16, ((encoded >> 8) & 0xFF00) as u16)
}

/// Metadata about an FTDI adapter.
///
/// Used to enumerate available probes and to select one to open.
#[derive(Clone, Debug)]
pub struct ProbeInfo {
    pub manufacturer: Option<String>,
    pub name: Option<String>,
    pub vid: u16,
    pub pid: u16,
    pub sn: Option<String>,
    pub bcd_device: u16,
    bus: u8,
    address: u8,
}

impl ProbeInfo {
    /// Find all connected FTDI adapters.
    pub fn list() -> Vec<Self> {
        log::trace!("Searching for FTDI probes");
        match Context::new().and_then(|ctx| ctx.devices()) {
            Ok(devices) => devices.iter().filter_map(|d| Self::from_device(&d)).collect(),
            Err(_) => vec![],
        }
    }

    /// Attempt to open the Probe corresponding to this ProbeInfo.
    pub fn open(&self, interface: Interface) -> Result<Probe> {
        log::trace!("Opening probe: {}", self);
        let devices = Context::new().and_then(|ctx| ctx.devices())?;
        for device in devices.iter() {
            if device.bus_number() == self.bus && device.address() == self.address {
                return Probe::from_device(device, interface);
            }
        }
        Err(Error::NotFound)
    }

    /// Whether this adapter has the requested serial number, if any.
    pub fn matches(&self, serial: Option<&str>) -> bool {
        match serial {
            None => true,
            Some(sn) => self.sn.as_deref() == Some(sn),
        }
    }

    /// Create a ProbeInfo from an rusb Device if it is a supported FTDI chip.
    fn from_device(device: &Device<Context>) -> Option<ProbeInfo> {
        let desc = device.device_descriptor().ok()?;
        if desc.vendor_id() != FTDI_VID || !FTDI_PIDS.contains(&desc.product_id()) {
            return None;
        }
        let timeout = Duration::from_millis(100);
        let (manufacturer, name, sn) = match device.open() {
            Ok(handle) => match handle.read_languages(timeout).ok().and_then(|l| l.get(0).cloned()) {
                Some(language) => (
                    handle.read_manufacturer_string(language, &desc, timeout).ok(),
                    handle.read_product_string(language, &desc, timeout).ok(),
                    handle.read_serial_number_string(language, &desc, timeout).ok(),
                ),
                None => (None, None, None),
            },
            Err(e) => {
                log::debug!("Could not open {:?} to read strings: {}", device, e);
                (None, None, None)
            },
        };
        Some(Self {
            manufacturer,
            name,
            vid: desc.vendor_id(),
            pid: desc.product_id(),
            sn,
            bcd_device: bcd_from_version(desc.device_version()),
            bus: device.bus_number(),
            address: device.address(),
        })
    }
}

impl std::fmt::Display for ProbeInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let manufacturer = self.manufacturer.clone().unwrap_or_else(|| "Unknown".to_owned());
        let name = self.name.clone().unwrap_or_else(|| "Unknown".to_owned());
        let sn = self.sn.clone().unwrap_or_else(|| "".to_owned());
        write!(f, "{:04x}:{:04x}:{} {} {} bcdDevice {:04x}",
               self.vid, self.pid, sn, manufacturer, name, self.bcd_device)
    }
}
