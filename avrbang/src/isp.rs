// Copyright 2025 the avrbang authors
// Dual licensed under the Apache 2.0 and MIT licenses.

//! ISP bit codec: expands MCU bytes into synchronous bit-bang slot
//! sequences and recovers sampled SDI bits from the echo stream.
//!
//! Each MCU clock cycle takes [`CYCLES`] slots: slot 0 presents SDO with
//! SCK low, slot 1 raises SCK. Because the chip samples the bus one
//! byte behind its output, the level clocked in at the rising edge of
//! cycle `k` shows up in echo byte `2k + 2`; the trailing byte appended
//! after a command exists so the final bit's sample has somewhere to
//! land.

use avrbang_ftdi::pins::PinMap;

/// Bit-bang slots per MCU clock cycle.
pub const CYCLES: usize = 2;

/// Host bytes for one 4-byte serial instruction.
pub const CMD_SIZE: usize = 4 * 8 * CYCLES;

/// Largest run of host bytes issued as a single fragment.
pub const FRAGMENT_SIZE: usize = 8 * CMD_SIZE;

/// Serialize one MCU byte MSB-first, updating the output shadow as each
/// slot is produced.
pub(crate) fn set_data(pins: &PinMap, out: &mut u8, buf: &mut Vec<u8>, data: u8) {
    for i in (0..8).rev() {
        let bit = data & (1 << i) != 0;
        *out = pins.sdo.apply(*out, bit);
        *out = pins.sck.apply(*out, false);
        buf.push(*out);
        *out = pins.sck.apply(*out, true);
        buf.push(*out);
    }
}

/// Recover MCU byte `word` from an echo stream, sampling SDI just after
/// each rising SCK edge.
pub(crate) fn extract_data(pins: &PinMap, stream: &[u8], word: usize) -> u8 {
    let base = word * 8 * CYCLES;
    let mut data = 0u8;
    for cycle in 0..8 {
        data <<= 1;
        if pins.sdi.extract(stream[base + cycle * CYCLES + CYCLES]) {
            data |= 1;
        }
    }
    data
}

/// Duplicate the final slot so the next fragment's samples stay aligned.
pub(crate) fn push_stretch(buf: &mut Vec<u8>) {
    if let Some(&last) = buf.last() {
        buf.push(last);
    }
}

/// Return SCK to its idle-low state; used to close the last fragment of
/// a stream.
pub(crate) fn push_sck_idle(pins: &PinMap, out: &mut u8, buf: &mut Vec<u8>) {
    *out = pins.sck.apply(*out, false);
    buf.push(*out);
}
