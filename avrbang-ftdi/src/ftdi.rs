// Copyright 2025 the avrbang authors
// Dual licensed under the Apache 2.0 and MIT licenses.

//! USB transport for FT232R/FT245R chips.
//!
//! Speaks the FTDI vendor protocol directly over `nusb`: SIO control
//! requests for chip configuration and bulk transfers for data, with the
//! two modem-status bytes stripped from every inbound packet.

use std::collections::VecDeque;
use std::time::Duration;

use futures_lite::future::block_on;
use num_enum::IntoPrimitive;
use nusb::transfer::{Control, ControlType, Recipient, RequestBuffer};
use nusb::Speed;

use crate::{Error, Port, Result};

const SIO_RESET_REQUEST: u8 = 0x00;
const SIO_SET_BAUDRATE_REQUEST: u8 = 0x03;
const SIO_SET_LATENCY_TIMER_REQUEST: u8 = 0x09;
const SIO_SET_BITMODE_REQUEST: u8 = 0x0B;
const SIO_READ_PINS_REQUEST: u8 = 0x0C;

const SIO_RESET_SIO: u16 = 0;
const SIO_RESET_PURGE_RX: u16 = 1;
const SIO_RESET_PURGE_TX: u16 = 2;

/// FT232R/FT245R expose a single interface; the FTDI protocol numbers it 1.
const INTERFACE_INDEX: u16 = 1;

/// Base clock feeding the baud-rate generator, after the fixed /16 prescale.
const BAUD_CLOCK: u32 = 48_000_000 / 16;

const CONTROL_TIMEOUT: Duration = Duration::from_secs(1);

#[repr(u8)]
#[derive(Clone, Copy, PartialEq, Eq, Debug, IntoPrimitive)]
pub enum BitMode {
    Reset = 0x00,
    Bitbang = 0x01,
    Mpsse = 0x02,
    SyncBb = 0x04,
    Mcu = 0x08,
    Opto = 0x10,
    Cbus = 0x20,
    SyncFf = 0x40,
}

/// USB identity filters used when opening a device.
#[derive(Debug, Clone)]
pub struct UsbId {
    pub vendor: u16,
    pub product: u16,
    /// Match the product string exactly when set.
    pub description: Option<String>,
    /// Match the serial number exactly when set.
    pub serial: Option<String>,
}

impl Default for UsbId {
    fn default() -> Self {
        UsbId {
            vendor: 0x0403,
            product: 0x6001,
            description: None,
            serial: None,
        }
    }
}

/// Device selector parsed from a `usb:...` port name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PortAddr {
    /// First device matching the [`UsbId`] filters.
    First,
    /// `ft<N>`: zero-based index among matching devices.
    Index(usize),
    /// An eight-character device serial number.
    Serial(String),
}

impl PortAddr {
    /// Parse a port name of the form `usb:<id>`.
    ///
    /// `<id>` may be empty (first device), `ft<N>` (device index), or an
    /// eight-character serial number. An eight-character string that does
    /// not match `ft[0-9]+` is always a serial, so serials starting with
    /// "ft" stay reachable.
    pub fn parse(port: &str) -> Result<Self> {
        let invalid = || Error::InvalidPort(port.to_string());
        let id = if port == "usb" {
            ""
        } else {
            port.strip_prefix("usb:").ok_or_else(invalid)?
        };

        if id.is_empty() {
            return Ok(PortAddr::First);
        }
        if let Some(digits) = id.strip_prefix("ft") {
            if !digits.is_empty() && digits.bytes().all(|b| b.is_ascii_digit()) {
                return Ok(PortAddr::Index(digits.parse().map_err(|_| invalid())?));
            }
        }
        if id.len() == 8 {
            return Ok(PortAddr::Serial(id.to_string()));
        }
        Err(invalid())
    }
}

/// An open FT232R/FT245R device.
pub struct FtdiContext {
    interface: nusb::Interface,
    max_packet_size: usize,
    /// Set while any bit-bang mode is active; the baud-rate generator then
    /// runs at four times the programmed rate.
    bitbang: bool,
    /// Inbound data that arrived beyond what the last read asked for.
    spill: VecDeque<u8>,
}

impl FtdiContext {
    /// Find and open the device selected by `id` and `addr`.
    pub fn open(id: &UsbId, addr: &PortAddr) -> Result<Self> {
        let mut index = 0usize;
        let mut found = None;
        for info in nusb::list_devices()? {
            if info.vendor_id() != id.vendor || info.product_id() != id.product {
                continue;
            }
            if let Some(want) = id.description.as_deref() {
                if info.product_string() != Some(want) {
                    continue;
                }
            }
            if let Some(want) = id.serial.as_deref() {
                if info.serial_number() != Some(want) {
                    continue;
                }
            }
            let hit = match addr {
                PortAddr::First => true,
                PortAddr::Index(n) => {
                    let hit = index == *n;
                    index += 1;
                    hit
                }
                PortAddr::Serial(s) => info.serial_number() == Some(s.as_str()),
            };
            if hit {
                found = Some(info);
                break;
            }
        }
        let info = found.ok_or(Error::NotFound)?;
        let speed = info.speed();
        let device = info.open()?;

        #[cfg(target_os = "linux")]
        let interface = device.detach_and_claim_interface(0)?;
        #[cfg(not(target_os = "linux"))]
        let interface = device.claim_interface(0)?;

        let max_packet_size = match speed {
            Some(Speed::High | Speed::Super | Speed::SuperPlus) => 512,
            _ => 64,
        };

        let mut ctx = FtdiContext {
            interface,
            max_packet_size,
            bitbang: false,
            spill: VecDeque::new(),
        };
        ctx.usb_reset()?;
        ctx.purge_buffers()?;
        Ok(ctx)
    }

    pub fn usb_reset(&mut self) -> Result<()> {
        self.sio_write(SIO_RESET_REQUEST, SIO_RESET_SIO, INTERFACE_INDEX)
    }

    fn sio_write(&mut self, request: u8, value: u16, index: u16) -> Result<()> {
        self.interface
            .control_out_blocking(
                Control {
                    control_type: ControlType::Vendor,
                    recipient: Recipient::Device,
                    request,
                    value,
                    index,
                },
                &[],
                CONTROL_TIMEOUT,
            )
            .map_err(std::io::Error::from)?;
        Ok(())
    }
}

impl Port for FtdiContext {
    fn write_data(&mut self, data: &[u8]) -> Result<usize> {
        let mut written = 0;
        for chunk in data.chunks(self.max_packet_size) {
            block_on(self.interface.bulk_out(0x02, chunk.to_vec()))
                .into_result()
                .map_err(std::io::Error::from)?;
            written += chunk.len();
        }
        log::trace!("wrote {written} bytes");
        Ok(written)
    }

    fn read_data(&mut self, buf: &mut [u8]) -> Result<usize> {
        if self.spill.is_empty() && !buf.is_empty() {
            let packet = block_on(
                self.interface
                    .bulk_in(0x81, RequestBuffer::new(self.max_packet_size)),
            )
            .into_result()
            .map_err(std::io::Error::from)?;
            // every inbound packet leads with two modem-status bytes
            if packet.len() > 2 {
                self.spill.extend(&packet[2..]);
            }
        }
        let n = buf.len().min(self.spill.len());
        for slot in &mut buf[..n] {
            *slot = self.spill.pop_front().unwrap_or_default();
        }
        log::trace!("read {n} bytes");
        Ok(n)
    }

    fn set_bitmode(&mut self, ddr: u8, mode: BitMode) -> Result<()> {
        self.sio_write(
            SIO_SET_BITMODE_REQUEST,
            u16::from_le_bytes([ddr, mode.into()]),
            INTERFACE_INDEX,
        )?;
        self.bitbang = mode != BitMode::Reset;
        Ok(())
    }

    fn set_baud_rate(&mut self, baud: u32) -> Result<()> {
        if baud == 0 {
            return Err(Error::BadBaud(baud));
        }
        // the generator clocks bit-bang modes four times per baud period
        let effective = if self.bitbang {
            baud.saturating_mul(4)
        } else {
            baud
        };
        let (value, index) = encode_divisor(effective);
        self.sio_write(SIO_SET_BAUDRATE_REQUEST, value, index)
    }

    fn set_latency_timer(&mut self, ms: u8) -> Result<()> {
        self.sio_write(SIO_SET_LATENCY_TIMER_REQUEST, ms as u16, INTERFACE_INDEX)
    }

    fn read_pins(&mut self) -> Result<u8> {
        let mut pins = [0u8; 1];
        self.interface
            .control_in_blocking(
                Control {
                    control_type: ControlType::Vendor,
                    recipient: Recipient::Device,
                    request: SIO_READ_PINS_REQUEST,
                    value: 0,
                    index: INTERFACE_INDEX,
                },
                &mut pins,
                CONTROL_TIMEOUT,
            )
            .map_err(std::io::Error::from)?;
        Ok(pins[0])
    }

    fn purge_buffers(&mut self) -> Result<()> {
        self.sio_write(SIO_RESET_REQUEST, SIO_RESET_PURGE_RX, INTERFACE_INDEX)?;
        self.sio_write(SIO_RESET_REQUEST, SIO_RESET_PURGE_TX, INTERFACE_INDEX)?;
        self.spill.clear();
        Ok(())
    }
}

/// Encode a baud rate into the divisor `value`/`index` pair of the
/// SET_BAUDRATE request (3 MHz base, 3-bit sub-integer fraction).
fn encode_divisor(baud: u32) -> (u16, u16) {
    const FRAC_CODE: [u32; 8] = [0, 3, 2, 4, 1, 5, 6, 7];

    let encoded: u32 = if baud >= BAUD_CLOCK {
        0
    } else if baud >= BAUD_CLOCK * 2 / 3 {
        1
    } else if baud >= BAUD_CLOCK / 2 {
        2
    } else {
        // work in 1/16ths of the divisor: 3 fraction bits plus one for rounding
        let divisor16 = (BAUD_CLOCK * 16) / baud;
        let best = (divisor16 / 2 + (divisor16 & 1)).min(0x1FFFF);
        (best >> 3) | (FRAC_CODE[(best & 7) as usize] << 14)
    };
    ((encoded & 0xFFFF) as u16, (encoded >> 16) as u16)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_index_names() {
        assert_eq!(PortAddr::parse("usb:ft0").unwrap(), PortAddr::Index(0));
        assert_eq!(PortAddr::parse("usb:ft12").unwrap(), PortAddr::Index(12));
    }

    #[test]
    fn parses_serial_names() {
        assert_eq!(
            PortAddr::parse("usb:A1B2C3D4").unwrap(),
            PortAddr::Serial("A1B2C3D4".to_string())
        );
        // eight characters beginning with "ft" but not ft<N> is a serial
        assert_eq!(
            PortAddr::parse("usb:ftX123AB").unwrap(),
            PortAddr::Serial("ftX123AB".to_string())
        );
        // ...but a pure ft<N> of eight characters is an index
        assert_eq!(
            PortAddr::parse("usb:ft101234").unwrap(),
            PortAddr::Index(101234)
        );
    }

    #[test]
    fn parses_empty_as_first() {
        assert_eq!(PortAddr::parse("usb").unwrap(), PortAddr::First);
        assert_eq!(PortAddr::parse("usb:").unwrap(), PortAddr::First);
    }

    #[test]
    fn rejects_malformed_names() {
        assert!(matches!(
            PortAddr::parse("com1"),
            Err(Error::InvalidPort(_))
        ));
        assert!(matches!(
            PortAddr::parse("usb:xyz"),
            Err(Error::InvalidPort(_))
        ));
        assert!(matches!(
            PortAddr::parse("usb:ftabc"),
            Err(Error::InvalidPort(_))
        ));
    }

    #[test]
    fn encodes_classic_divisors() {
        // 9600 baud is the canonical reference point for the encoding
        assert_eq!(encode_divisor(9600), (0x4138, 0));
        // the three special-cased top rates
        assert_eq!(encode_divisor(3_000_000), (0, 0));
        assert_eq!(encode_divisor(2_000_000), (1, 0));
        assert_eq!(encode_divisor(1_500_000), (2, 0));
    }

    #[test]
    fn encodes_default_bit_clock() {
        // 150 kHz / 4, then x4 again in bit-bang mode: an even divisor of 20
        let (value, index) = encode_divisor(150_000);
        assert_eq!((value, index), (20, 0));
    }
}
