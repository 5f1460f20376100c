// Copyright 2025 the avrbang authors
// Dual licensed under the Apache 2.0 and MIT licenses.

pub mod channel;
pub mod ftdi;
pub mod pins;

pub use ftdi::{BitMode, FtdiContext, PortAddr, UsbId};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// An error reported by the operating system while talking to the
    /// device. It may mean the device was unplugged, that another driver
    /// holds it, or that the current user lacks permission to access it.
    #[error("USB transport error: {0}")]
    Usb(#[from] std::io::Error),

    #[error("no matching FTDI device found")]
    NotFound,

    #[error("invalid port name {0:?}: use ft[0-9]+ or serial number")]
    InvalidPort(String),

    #[error("short write: {written} of {requested} bytes accepted")]
    ShortWrite { written: usize, requested: usize },

    /// A read was requested with no bytes in flight to satisfy it. The
    /// synchronous bit-bang engine returns one sample per written byte,
    /// so this means the host-side bookkeeping lost sync with the chip.
    #[error("sample stream exhausted: no bytes outstanding")]
    Starved,

    #[error("baud rate {0} out of range")]
    BadBaud(u32),
}

pub type Result<T> = core::result::Result<T, Error>;

/// Raw device operations the bit-bang engine needs from an FTDI chip.
///
/// [`ftdi::FtdiContext`] implements this over USB; tests substitute
/// scripted implementations.
pub trait Port {
    /// Write raw bytes to the chip. Anything short of `data.len()` is an
    /// error at this level; partial progress is reported for diagnostics.
    fn write_data(&mut self, data: &[u8]) -> Result<usize>;

    /// Read up to `buf.len()` bytes. Short reads, including zero-length
    /// ones, are normal: the caller loops.
    fn read_data(&mut self, buf: &mut [u8]) -> Result<usize>;

    fn set_bitmode(&mut self, ddr: u8, mode: BitMode) -> Result<()>;
    fn set_baud_rate(&mut self, baud: u32) -> Result<()>;
    fn set_latency_timer(&mut self, ms: u8) -> Result<()>;

    /// Sample the instantaneous state of the eight data pins.
    fn read_pins(&mut self) -> Result<u8>;

    /// Discard both on-chip FIFOs.
    fn purge_buffers(&mut self) -> Result<()>;
}
