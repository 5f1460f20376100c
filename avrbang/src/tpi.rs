// Copyright 2025 the avrbang authors
// Dual licensed under the Apache 2.0 and MIT licenses.

//! TPI: the single-wire framed protocol of the smallest AVR parts.
//!
//! Frames carry a start bit (0), eight data bits LSB-first, an even
//! parity bit and two stop bits (1). SDO and SDI are bridged through a
//! resistor, so the receive side holds the line high while sampling and
//! hunts for the target's start bit in the sampled window.

use avrbang_ftdi::pins::PinMap;
use num_enum::IntoPrimitive;

use crate::isp::{push_sck_idle, CYCLES};
use crate::part::{Memory, Part};
use crate::{Error, Link, Result};

pub const TPI_CMD_SLD: u8 = 0x20;
pub const TPI_CMD_SLD_PI: u8 = 0x24;
pub const TPI_CMD_SIN: u8 = 0x10;
pub const TPI_CMD_SOUT: u8 = 0x90;
pub const TPI_CMD_SST: u8 = 0x60;
pub const TPI_CMD_SST_PI: u8 = 0x64;
pub const TPI_CMD_SSTPR: u8 = 0x68;
pub const TPI_CMD_SLDCS: u8 = 0x80;
pub const TPI_CMD_SSTCS: u8 = 0xC0;
pub const TPI_CMD_SKEY: u8 = 0xE0;

/// TPI control/status registers reachable through SLDCS/SSTCS.
#[derive(Debug, Clone, Copy, IntoPrimitive)]
#[repr(u8)]
pub enum CtrlReg {
    Tpisr = 0x00,
    Tpipcr = 0x02,
    Tpiir = 0x0F,
}

/// Value the identification register must read back.
pub const TPI_IDENT_CODE: u8 = 0x80;

/// TPIPCR guard-time value removing all extra idle bits.
pub const TPIPCR_GT_0B: u8 = 0x07;

pub const TPISR_NVMEN: u8 = 0x02;

/// NVM controller I/O registers in TPI data space.
pub const NVMCSR: u8 = 0x32;
pub const NVMCMD: u8 = 0x33;

pub const NVMCSR_BSY: u8 = 0x80;

pub const NVMCMD_NO_OPERATION: u8 = 0x00;
pub const NVMCMD_CHIP_ERASE: u8 = 0x10;
pub const NVMCMD_SECTION_ERASE: u8 = 0x14;
pub const NVMCMD_WORD_WRITE: u8 = 0x1D;

/// Key material following the SKEY instruction.
pub const SKEY_BYTES: [u8; 8] = [0xFF, 0x88, 0xD8, 0xCD, 0x45, 0xAB, 0x89, 0x12];

/// Fold a 6-bit I/O address into a SIN/SOUT instruction byte.
pub const fn sio_addr(reg: u8) -> u8 {
    ((reg & 0x30) << 1) | (reg & 0x0F)
}

/// Cycles sampled while hunting for an inbound frame: up to four bits of
/// skew plus the twelve frame bits.
pub(crate) const RX_CYCLES: usize = 16;

fn push_bit(pins: &PinMap, out: &mut u8, buf: &mut Vec<u8>, bit: bool) {
    *out = pins.sdo.apply(*out, bit);
    *out = pins.sck.apply(*out, false);
    buf.push(*out);
    *out = pins.sck.apply(*out, true);
    buf.push(*out);
}

/// Append one transmit frame for `byte`.
pub(crate) fn tx_frame(pins: &PinMap, out: &mut u8, buf: &mut Vec<u8>, byte: u8) {
    let mut parity = false;
    push_bit(pins, out, buf, false);
    for i in 0..8 {
        let bit = byte & (1 << i) != 0;
        parity ^= bit;
        push_bit(pins, out, buf, bit);
    }
    push_bit(pins, out, buf, parity);
    push_bit(pins, out, buf, true);
    push_bit(pins, out, buf, true);
}

/// Hold the line released (high) for the whole receive window, with a
/// trailing byte so the final cycle's sample lands inside the echo.
pub(crate) fn rx_preamble(pins: &PinMap, out: &mut u8, buf: &mut Vec<u8>) {
    for _ in 0..RX_CYCLES {
        push_bit(pins, out, buf, true);
    }
    push_sck_idle(pins, out, buf);
}

/// Collect the sampled SDI bit of each receive cycle, LSB-first.
///
/// Echoes lag the outputs by one byte, so the level present at cycle
/// `c`'s rising edge shows up at index `2c + 2` of the echo stream,
/// the same convention `isp::extract_data` uses.
pub(crate) fn sample_window(pins: &PinMap, echo: &[u8]) -> u16 {
    let mut window = 0u16;
    for cycle in 0..RX_CYCLES {
        if pins.sdi.extract(echo[cycle * CYCLES + CYCLES]) {
            window |= 1 << cycle;
        }
    }
    window
}

/// Decode one frame out of a sampled window.
pub(crate) fn decode_frame(window: u16) -> Result<u8> {
    // hunt for the start bit; the line idles high
    let mut pos = 0;
    while pos < 16 && window & (1 << pos) != 0 {
        pos += 1;
    }
    if pos >= 4 {
        return Err(Error::TpiFraming);
    }
    pos += 1;

    let mut byte = 0u8;
    let mut parity = 0u16;
    for i in 0..8 {
        let bit = window >> pos & 1;
        byte |= (bit as u8) << i;
        parity ^= bit;
        pos += 1;
    }
    if window >> pos & 1 != parity {
        return Err(Error::TpiParity);
    }
    pos += 1;
    if window >> pos & 1 == 0 || window >> (pos + 1) & 1 == 0 {
        return Err(Error::TpiFraming);
    }
    Ok(byte)
}

/// Point the TPI pointer register at `mem[addr]` and latch `nvmcmd` into
/// the NVM command register.
pub fn setup_rw<L: Link + ?Sized>(link: &mut L, mem: &Memory, addr: u32, nvmcmd: u8) -> Result<()> {
    let ptr = mem.offset + addr;
    let cmd = [
        TPI_CMD_SSTPR,
        (ptr & 0xFF) as u8,
        TPI_CMD_SSTPR | 1,
        (ptr >> 8 & 0xFF) as u8,
        TPI_CMD_SOUT | sio_addr(NVMCMD),
        nvmcmd,
    ];
    link.cmd_tpi(&cmd, &mut [])
}

/// Wait for the NVM controller to go idle.
pub fn poll_nvmbsy<L: Link + ?Sized>(link: &mut L) -> Result<()> {
    let mut csr = [0u8; 1];
    for _ in 0..512 {
        link.cmd_tpi(&[TPI_CMD_SIN | sio_addr(NVMCSR)], &mut csr)?;
        if csr[0] & NVMCSR_BSY == 0 {
            return Ok(());
        }
    }
    Err(Error::TpiNvmBusy)
}

/// Unlock NVM programming: send the key, then poll for NVMEN.
pub fn program_enable<L: Link + ?Sized>(link: &mut L, part: &Part) -> Result<()> {
    log::debug!("enabling TPI NVM programming on {}", part.desc);
    let mut skey = [0u8; 9];
    skey[0] = TPI_CMD_SKEY;
    skey[1..].copy_from_slice(&SKEY_BYTES);
    link.cmd_tpi(&skey, &mut [])?;

    let mut status = [0u8; 1];
    for _ in 0..10 {
        link.cmd_tpi(&[TPI_CMD_SLDCS | u8::from(CtrlReg::Tpisr)], &mut status)?;
        if status[0] & TPISR_NVMEN != 0 {
            return Ok(());
        }
    }
    Err(Error::TpiNvmEnable)
}

/// Erase the whole chip: point at the high byte of the first flash word
/// and fire a dummy write with CHIP_ERASE latched.
pub fn chip_erase<L: Link + ?Sized>(link: &mut L, flash_offset: u32) -> Result<()> {
    poll_nvmbsy(link)?;
    let ptr = flash_offset | 1;
    let cmd = [
        TPI_CMD_SSTPR,
        (ptr & 0xFF) as u8,
        TPI_CMD_SSTPR | 1,
        (ptr >> 8 & 0xFF) as u8,
        TPI_CMD_SOUT | sio_addr(NVMCMD),
        NVMCMD_CHIP_ERASE,
        TPI_CMD_SST,
        0xFF,
    ];
    link.cmd_tpi(&cmd, &mut [])?;
    poll_nvmbsy(link)
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Logical line levels a transmit frame drives, one per cycle.
    fn driven_bits(pins: &PinMap, frame: &[u8]) -> Vec<bool> {
        frame
            .chunks(CYCLES)
            .map(|pair| pins.sdo.extract(pair[0]))
            .collect()
    }

    /// Frame bits for `value` as the encoder puts them on the wire.
    fn tx_bits(pins: &PinMap, value: u8) -> Vec<bool> {
        let mut out = 0u8;
        let mut frame = Vec::new();
        tx_frame(pins, &mut out, &mut frame, value);
        driven_bits(pins, &frame)
    }

    /// Echo of a receive window with the chip's one-byte lag applied
    /// while a target drives `bits`, advancing one bit per rising edge.
    /// The line idles high once the bits run out.
    fn lagged_echo(pins: &PinMap, stream: &[u8], bits: &[bool]) -> Vec<u8> {
        let mut level = true;
        let mut next = 0usize;
        let mut prev = 0u8;
        stream
            .iter()
            .map(|&byte| {
                let echoed = pins.sdi.apply(prev, level);
                if !pins.sck.extract(prev) && pins.sck.extract(byte) {
                    level = bits.get(next).copied().unwrap_or(true);
                    next += 1;
                }
                prev = byte;
                echoed
            })
            .collect()
    }

    /// Full receive path: sample a target replaying `bits` through the
    /// lagged echo, then decode.
    fn receive(pins: &PinMap, bits: &[bool]) -> Result<u8> {
        let mut out = 0u8;
        let mut window = Vec::new();
        rx_preamble(pins, &mut out, &mut window);
        let echo = lagged_echo(pins, &window, bits);
        decode_frame(sample_window(pins, &echo))
    }

    #[test]
    fn every_byte_roundtrips_over_the_wire() {
        let pins = PinMap::default();
        for value in 0..=255u8 {
            let bits = tx_bits(&pins, value);
            assert_eq!(receive(&pins, &bits).unwrap(), value, "value {value:#04x}");
        }
    }

    #[test]
    fn single_bit_flips_never_decode_silently() {
        let pins = PinMap::default();
        for value in 0..=255u8 {
            let bits = tx_bits(&pins, value);
            for flip in 0..bits.len() {
                let mut corrupted = bits.clone();
                corrupted[flip] = !corrupted[flip];
                match receive(&pins, &corrupted) {
                    Err(Error::TpiParity) | Err(Error::TpiFraming) => {}
                    Ok(got) => panic!(
                        "frame for {value:#04x} with bit {flip} flipped decoded as {got:#04x}"
                    ),
                    Err(e) => panic!("unexpected error {e}"),
                }
            }
        }
    }

    #[test]
    fn skewed_start_bit_is_found() {
        let pins = PinMap::default();
        for skew in 0..4 {
            let mut bits = vec![true; skew];
            bits.extend(tx_bits(&pins, 0x6B));
            assert_eq!(receive(&pins, &bits).unwrap(), 0x6B, "skew {skew}");
        }
    }

    #[test]
    fn missing_start_bit_is_a_framing_error() {
        let pins = PinMap::default();
        // a mute target leaves the line idling high
        assert!(matches!(receive(&pins, &[]), Err(Error::TpiFraming)));
        // a start bit four cycles late is one too many
        let mut bits = vec![true; 4];
        bits.extend(tx_bits(&pins, 0x6B));
        assert!(matches!(receive(&pins, &bits), Err(Error::TpiFraming)));
    }

    #[test]
    fn bad_stop_bits_are_framing_errors() {
        let pins = PinMap::default();
        for stop in [10, 11] {
            let mut bits = tx_bits(&pins, 0x00);
            bits[stop] = false;
            assert!(matches!(receive(&pins, &bits), Err(Error::TpiFraming)));
        }
    }

    #[test]
    fn parity_follows_the_data_bits() {
        let pins = PinMap::default();
        // start bit, eight data bits, then the parity bit at index 9
        assert!(!tx_bits(&pins, 0x00)[9]);
        assert!(tx_bits(&pins, 0x01)[9]);
        assert!(!tx_bits(&pins, 0x03)[9]);
    }

    #[test]
    fn sio_addresses_fold_around_the_gap() {
        assert_eq!(sio_addr(NVMCMD), 0x63);
        assert_eq!(sio_addr(NVMCSR), 0x62);
        assert_eq!(sio_addr(0x0F), 0x0F);
    }
}
