// Copyright 2025 the avrbang authors
// Dual licensed under the Apache 2.0 and MIT licenses.

//! Part and memory descriptions: the 32-bit serial-programming opcode
//! templates and the helpers that splice values, addresses and data
//! bytes into them.

use crate::{Error, Result};

/// Index into a part's or memory's opcode table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(usize)]
pub enum OpKind {
    Read,
    Write,
    ReadLo,
    ReadHi,
    WriteLo,
    WriteHi,
    LoadPageLo,
    LoadPageHi,
    LoadExtAddr,
    WritePage,
    ChipErase,
    PgmEnable,
}

pub(crate) const NUM_OPS: usize = 12;

impl OpKind {
    pub fn name(self) -> &'static str {
        match self {
            OpKind::Read => "read",
            OpKind::Write => "write",
            OpKind::ReadLo => "read_lo",
            OpKind::ReadHi => "read_hi",
            OpKind::WriteLo => "write_lo",
            OpKind::WriteHi => "write_hi",
            OpKind::LoadPageLo => "loadpage_lo",
            OpKind::LoadPageHi => "loadpage_hi",
            OpKind::LoadExtAddr => "load_ext_addr",
            OpKind::WritePage => "writepage",
            OpKind::ChipErase => "chip_erase",
            OpKind::PgmEnable => "pgm_enable",
        }
    }
}

/// Role of one bit within a 32-bit serial command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmdBit {
    /// Fixed 0/1.
    Value(bool),
    /// Don't care; transmitted as 0.
    Ignore,
    /// Carries address bit `n`.
    Address(u8),
    /// Carries input-data bit `n`.
    Input(u8),
    /// The response carries output-data bit `n` here.
    Output(u8),
}

/// A 32-bit serial-programming instruction template.
///
/// Bit index 31 is the MSB of the first command byte, matching the way
/// datasheets print the instructions left to right.
#[derive(Debug, Clone, Copy)]
pub struct Opcode {
    bits: [CmdBit; 32],
}

impl Opcode {
    /// Parse a bit-pattern string such as
    /// `"0100.0000.000x.xxxx.xxaa.aaaa.iiii.iiii"`.
    ///
    /// Separators (dots, commas, whitespace) are ignored. `0`/`1` are
    /// fixed bits, `x` is don't-care, `a`/`i`/`o` are address, input and
    /// output bits numbered high-to-low in order of appearance. A
    /// standalone `a<N>` token pins an address bit to bit `N` explicitly,
    /// for instructions like the extended-address load whose operand
    /// starts above bit 7.
    pub fn parse(pattern: &str) -> Result<Opcode> {
        let bad = || Error::OpcodePattern(pattern.to_string());

        let mut specs: Vec<CmdBit> = Vec::with_capacity(32);
        for token in pattern.split(|c: char| c == '.' || c == ',' || c.is_whitespace()) {
            if token.is_empty() {
                continue;
            }
            if token.len() > 1 && token.starts_with('a') && token[1..].bytes().all(|b| b.is_ascii_digit()) {
                let n: u8 = token[1..].parse().map_err(|_| bad())?;
                specs.push(CmdBit::Address(n));
                continue;
            }
            for c in token.chars() {
                specs.push(match c {
                    '0' => CmdBit::Value(false),
                    '1' => CmdBit::Value(true),
                    'x' => CmdBit::Ignore,
                    'a' => CmdBit::Address(u8::MAX),
                    'i' => CmdBit::Input(u8::MAX),
                    'o' => CmdBit::Output(u8::MAX),
                    _ => return Err(bad()),
                });
            }
        }
        if specs.len() != 32 {
            return Err(bad());
        }

        // auto-numbered operand bits count down from their population size
        let mut addr_n = specs
            .iter()
            .filter(|s| matches!(**s, CmdBit::Address(u8::MAX)))
            .count() as u8;
        let mut input_n = specs
            .iter()
            .filter(|s| matches!(**s, CmdBit::Input(u8::MAX)))
            .count() as u8;
        let mut output_n = specs
            .iter()
            .filter(|s| matches!(**s, CmdBit::Output(u8::MAX)))
            .count() as u8;
        for spec in specs.iter_mut() {
            match *spec {
                CmdBit::Address(u8::MAX) => {
                    addr_n -= 1;
                    *spec = CmdBit::Address(addr_n);
                }
                CmdBit::Input(u8::MAX) => {
                    input_n -= 1;
                    *spec = CmdBit::Input(input_n);
                }
                CmdBit::Output(u8::MAX) => {
                    output_n -= 1;
                    *spec = CmdBit::Output(output_n);
                }
                _ => {}
            }
        }

        let mut bits = [CmdBit::Ignore; 32];
        for (pos, spec) in specs.into_iter().enumerate() {
            bits[31 - pos] = spec;
        }
        Ok(Opcode { bits })
    }

    fn for_each_bit(&self, mut f: impl FnMut(usize, usize, CmdBit)) {
        for i in 0..32 {
            let byte = 3 - i / 8;
            let mask_bit = i % 8;
            f(byte, mask_bit, self.bits[i]);
        }
    }

    /// Write the fixed bits of the template into `cmd`.
    pub fn set_bits(&self, cmd: &mut [u8; 4]) {
        self.for_each_bit(|byte, bit, spec| match spec {
            CmdBit::Value(true) => cmd[byte] |= 1 << bit,
            CmdBit::Value(false) | CmdBit::Ignore => cmd[byte] &= !(1 << bit),
            _ => {}
        });
    }

    /// Splice `addr` into the address bits of `cmd`.
    pub fn set_addr(&self, cmd: &mut [u8; 4], addr: u32) {
        self.for_each_bit(|byte, bit, spec| {
            if let CmdBit::Address(n) = spec {
                if addr >> n & 1 != 0 {
                    cmd[byte] |= 1 << bit;
                } else {
                    cmd[byte] &= !(1 << bit);
                }
            }
        });
    }

    /// Splice a data byte into the input bits of `cmd`.
    pub fn set_input(&self, cmd: &mut [u8; 4], data: u8) {
        self.for_each_bit(|byte, bit, spec| {
            if let CmdBit::Input(n) = spec {
                if data >> n & 1 != 0 {
                    cmd[byte] |= 1 << bit;
                } else {
                    cmd[byte] &= !(1 << bit);
                }
            }
        });
    }

    /// Collect the output bits of a response into a data byte.
    pub fn get_output(&self, res: &[u8; 4]) -> u8 {
        let mut data = 0u8;
        self.for_each_bit(|byte, bit, spec| {
            if let CmdBit::Output(n) = spec {
                if res[byte] >> bit & 1 != 0 {
                    data |= 1 << n;
                }
            }
        });
        data
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemKind {
    Flash,
    Eeprom,
    Signature,
    Fuse,
    Lock,
}

/// One memory of a part, together with the image buffer operations read
/// into and write out of.
#[derive(Debug, Clone)]
pub struct Memory {
    pub kind: MemKind,
    pub size: usize,
    pub page_size: usize,
    pub paged: bool,
    /// Data-space offset of this memory on TPI parts.
    pub offset: u32,
    pub max_write_delay_us: u64,
    pub buf: Vec<u8>,
    ops: [Option<Opcode>; NUM_OPS],
}

impl Memory {
    pub fn new(kind: MemKind, size: usize, page_size: usize) -> Self {
        Memory {
            kind,
            size,
            page_size,
            paged: page_size > 1,
            offset: 0,
            max_write_delay_us: 4500,
            buf: vec![0xFF; size],
            ops: [None; NUM_OPS],
        }
    }

    pub fn set_op(&mut self, kind: OpKind, op: Opcode) {
        self.ops[kind as usize] = Some(op);
    }

    pub fn op(&self, kind: OpKind) -> Option<&Opcode> {
        self.ops[kind as usize].as_ref()
    }

    pub(crate) fn op_or_err(&self, part: &Part, kind: OpKind) -> Result<&Opcode> {
        self.op(kind).ok_or_else(|| Error::MissingOpcode {
            part: part.desc.clone(),
            op: kind.name(),
        })
    }
}

/// Static description of a target microcontroller, as far as this
/// back-end needs one.
#[derive(Debug, Clone)]
pub struct Part {
    pub desc: String,
    pub has_tpi: bool,
    /// 1-based index of the program-enable poll byte within the response.
    pub pollindex: usize,
    pub pollvalue: u8,
    pub chip_erase_delay_us: u64,
    /// Data-space offset of flash on TPI parts; the erase pointer
    /// targets the high byte of the first word.
    pub flash_offset: u32,
    ops: [Option<Opcode>; NUM_OPS],
}

impl Part {
    pub fn new(desc: impl Into<String>) -> Self {
        Part {
            desc: desc.into(),
            has_tpi: false,
            pollindex: 3,
            pollvalue: 0x53,
            chip_erase_delay_us: 9000,
            flash_offset: 0x4000,
            ops: [None; NUM_OPS],
        }
    }

    pub fn set_op(&mut self, kind: OpKind, op: Opcode) {
        self.ops[kind as usize] = Some(op);
    }

    pub fn op(&self, kind: OpKind) -> Option<&Opcode> {
        self.ops[kind as usize].as_ref()
    }

    pub(crate) fn op_or_err(&self, kind: OpKind) -> Result<&Opcode> {
        self.op(kind).ok_or_else(|| Error::MissingOpcode {
            part: self.desc.clone(),
            op: kind.name(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fixed_bits_assemble_msb_first() {
        let op = Opcode::parse("1010.1100.0101.0011.xxxx.xxxx.xxxx.xxxx").unwrap();
        let mut cmd = [0u8; 4];
        op.set_bits(&mut cmd);
        assert_eq!(cmd, [0xAC, 0x53, 0x00, 0x00]);
    }

    #[test]
    fn address_bits_autonumber_high_to_low() {
        let op = Opcode::parse("0100.0000.000x.xxxx.xxaa.aaaa.iiii.iiii").unwrap();
        let mut cmd = [0u8; 4];
        op.set_bits(&mut cmd);
        op.set_addr(&mut cmd, 0x2A);
        op.set_input(&mut cmd, 0x5A);
        assert_eq!(cmd, [0x40, 0x00, 0x2A, 0x5A]);
        // high address bits beyond the field are masked off
        op.set_addr(&mut cmd, 0xFFC1);
        assert_eq!(cmd[2], 0x01);
    }

    #[test]
    fn explicit_address_bits_reach_high_positions() {
        let op = Opcode::parse(
            "0100.1101.0000.0000 a23 a22 a21 a20 a19 a18 a17 a16 0000.0000",
        )
        .unwrap();
        let mut cmd = [0u8; 4];
        op.set_bits(&mut cmd);
        op.set_addr(&mut cmd, 0x12_0000);
        assert_eq!(cmd, [0x4D, 0x00, 0x12, 0x00]);
    }

    #[test]
    fn output_bits_collect_from_response() {
        let op = Opcode::parse("0010.0000.aaaa.aaaa.aaaa.aaaa.oooo.oooo").unwrap();
        let res = [0x20, 0x12, 0x34, 0xC3];
        assert_eq!(op.get_output(&res), 0xC3);
    }

    #[test]
    fn rejects_short_and_junk_patterns() {
        assert!(Opcode::parse("1010.1100").is_err());
        assert!(Opcode::parse("1010.1100.0101.0011.xxxx.xxxx.xxxx.xxxz").is_err());
    }

    #[test]
    fn missing_opcode_names_part_and_op() {
        let part = Part::new("testpart");
        let mem = Memory::new(MemKind::Flash, 256, 64);
        let err = mem.op_or_err(&part, OpKind::LoadPageHi).unwrap_err();
        let text = err.to_string();
        assert!(text.contains("testpart"));
        assert!(text.contains("loadpage_hi"));
    }
}
