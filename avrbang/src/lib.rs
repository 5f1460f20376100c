// Copyright 2025 the avrbang authors
// Dual licensed under the Apache 2.0 and MIT licenses.

//! AVR programmer back-end driving the SPI-like ISP protocol and the
//! single-wire TPI protocol through an FT232R/FT245R in synchronous
//! bit-bang mode.

pub mod avr;
pub mod ft245r;
pub mod isp;
pub mod pager;
pub mod part;
pub mod tpi;

pub use ft245r::{Config, Ft245r};

use part::{MemKind, Memory, Part};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Ftdi(#[from] avrbang_ftdi::Error),

    #[error("program enable: target not responding after {tries} attempts")]
    ProgramEnable { tries: u32 },

    #[error("part {part} lacks the {op} opcode")]
    MissingOpcode { part: String, op: &'static str },

    #[error("TPI framing error")]
    TpiFraming,

    #[error("TPI parity error")]
    TpiParity,

    #[error("TPI identification mismatch: expected 0x80, got {0:#04x}")]
    TpiIdent(u8),

    /// TPI runs over a single wire, so SDO and SDI must be bridged
    /// (typically through a 1 kOhm resistor).
    #[error("SDO->SDI loopback broken; bridge the data lines for TPI")]
    TpiLoopback,

    #[error("TPI NVM interface did not enable")]
    TpiNvmEnable,

    #[error("TPI NVM controller stuck busy")]
    TpiNvmBusy,

    /// Paged access is not implemented for this memory; callers may fall
    /// back to byte-level access.
    #[error("unsupported memory {0:?} for paged access")]
    UnsupportedMemory(MemKind),

    #[error("invalid opcode pattern {0:?}")]
    OpcodePattern(String),
}

pub type Result<T> = core::result::Result<T, Error>;

/// The two command primitives everything above the bit codecs is built
/// on: a four-byte ISP exchange and a framed TPI exchange.
pub trait Link {
    fn cmd(&mut self, cmd: &[u8; 4]) -> Result<[u8; 4]>;

    /// Transmit `cmd` as TPI frames, then receive `res.len()` frames,
    /// stopping at the first receive error.
    fn cmd_tpi(&mut self, cmd: &[u8], res: &mut [u8]) -> Result<()>;
}

/// The blocking programmer contract consumed by a host application.
pub trait Programmer: Link {
    fn initialize(&mut self, part: &Part) -> Result<()>;
    fn display(&self);
    fn enable(&mut self) -> Result<()>;
    fn disable(&mut self) -> Result<()>;
    fn program_enable(&mut self, part: &Part) -> Result<()>;
    fn chip_erase(&mut self, part: &Part) -> Result<()>;
    fn powerup(&mut self) -> Result<()>;
    fn powerdown(&mut self) -> Result<()>;

    fn read_byte(&mut self, part: &Part, mem: &Memory, addr: u32) -> Result<u8>;
    fn write_byte(&mut self, part: &Part, mem: &Memory, addr: u32, value: u8) -> Result<()>;

    /// Program `n_bytes` of `mem` starting at `addr` from its buffer.
    /// Returns the number of bytes written.
    fn paged_write(
        &mut self,
        part: &Part,
        mem: &mut Memory,
        page_size: usize,
        addr: u32,
        n_bytes: usize,
    ) -> Result<usize>;

    /// Read `n_bytes` of `mem` starting at `addr` into its buffer.
    /// Returns the number of bytes read.
    fn paged_load(
        &mut self,
        part: &Part,
        mem: &mut Memory,
        page_size: usize,
        addr: u32,
        n_bytes: usize,
    ) -> Result<usize>;

    fn rdy_led(&mut self, on: bool) -> Result<()>;
    fn err_led(&mut self, on: bool) -> Result<()>;
    fn pgm_led(&mut self, on: bool) -> Result<()>;
    fn vfy_led(&mut self, on: bool) -> Result<()>;

    /// Release the target and flush the chip; the USB handle itself is
    /// released on drop.
    fn close(&mut self) -> Result<()>;
}
