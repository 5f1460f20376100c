// Copyright 2025 the avrbang authors
// Dual licensed under the Apache 2.0 and MIT licenses.

//! Buffered duplex channel over a synchronous bit-bang port.
//!
//! In synchronous bit-bang mode the chip returns exactly one sample byte
//! for every byte written, and it stops accepting writes once its small
//! return FIFO fills. The channel stages outbound bytes, caps the number
//! in flight at [`FIFO_CHUNK`], and harvests samples into a host-side
//! ring so the producer never deadlocks against its own echo.

use std::thread;
use std::time::Duration;

use crate::ftdi::BitMode;
use crate::{Error, Port, Result};

/// Smallest return-FIFO capacity across supported chip revisions; writes
/// beyond this many unharvested bytes would overflow the chip.
pub const FIFO_CHUNK: usize = 128;

/// Host-side sample ring capacity.
pub const RX_CAPACITY: usize = 8192;

struct TxBuffer {
    buf: [u8; FIFO_CHUNK],
    len: usize,
}

struct RxRing {
    buf: Box<[u8; RX_CAPACITY]>,
    len: usize,
    rd: usize,
    wr: usize,
    /// Bytes written to the chip and not yet read back.
    pending: usize,
    /// Echo bytes the next receive must read and throw away.
    discard: usize,
}

impl RxRing {
    fn push(&mut self, byte: u8) {
        debug_assert!(self.len < RX_CAPACITY);
        self.buf[self.wr] = byte;
        self.wr = (self.wr + 1) % RX_CAPACITY;
        self.len += 1;
    }

    fn pop(&mut self) -> Option<u8> {
        if self.len == 0 {
            return None;
        }
        let byte = self.buf[self.rd];
        self.rd = (self.rd + 1) % RX_CAPACITY;
        self.len -= 1;
        Some(byte)
    }

    fn purge(&mut self) {
        self.len = 0;
        self.rd = 0;
        self.wr = 0;
        self.pending = 0;
        self.discard = 0;
    }
}

pub struct Channel<P: Port> {
    port: P,
    tx: TxBuffer,
    rx: RxRing,
    /// Copies emitted per logical byte; 1 unless the variable-pulse-width
    /// workaround is in effect.
    baud_multiplier: usize,
}

impl<P: Port> Channel<P> {
    pub fn new(port: P) -> Self {
        Channel {
            port,
            tx: TxBuffer {
                buf: [0; FIFO_CHUNK],
                len: 0,
            },
            rx: RxRing {
                buf: Box::new([0; RX_CAPACITY]),
                len: 0,
                rd: 0,
                wr: 0,
                pending: 0,
                discard: 0,
            },
            baud_multiplier: 1,
        }
    }

    pub fn port_mut(&mut self) -> &mut P {
        &mut self.port
    }

    pub fn into_port(self) -> P {
        self.port
    }

    pub fn set_baud_multiplier(&mut self, multiplier: usize) {
        self.baud_multiplier = multiplier.max(1);
    }

    pub fn baud_multiplier(&self) -> usize {
        self.baud_multiplier
    }

    /// Stage bytes for transmission, flushing whenever the staging buffer
    /// fills. With `discard` set the matching echo bytes are marked to be
    /// dropped by the next receive.
    pub fn send(&mut self, data: &[u8], discard: bool) -> Result<()> {
        for &byte in data {
            for _ in 0..self.baud_multiplier {
                self.tx.buf[self.tx.len] = byte;
                self.tx.len += 1;
                if discard {
                    self.rx.discard += 1;
                }
                if self.tx.len == FIFO_CHUNK {
                    self.flush()?;
                }
            }
        }
        Ok(())
    }

    /// Push all staged bytes to the chip, harvesting echo bytes whenever
    /// the in-flight count would exceed the chip's return FIFO.
    pub fn flush(&mut self) -> Result<()> {
        let mut off = 0;
        while off < self.tx.len {
            let avail = FIFO_CHUNK - self.rx.pending;
            if avail == 0 {
                self.fill()?;
                continue;
            }
            let n = avail.min(self.tx.len - off);
            let written = self.port.write_data(&self.tx.buf[off..off + n])?;
            if written != n {
                return Err(Error::ShortWrite {
                    written,
                    requested: n,
                });
            }
            self.rx.pending += n;
            off += n;
        }
        self.tx.len = 0;
        Ok(())
    }

    /// Harvest one batch of echo bytes into the ring. Returns the number
    /// of bytes moved; zero is normal when the chip has nothing ready yet.
    fn fill(&mut self) -> Result<usize> {
        if self.rx.pending == 0 {
            return Ok(0);
        }
        let mut scratch = [0u8; FIFO_CHUNK];
        let want = self.rx.pending.min(FIFO_CHUNK);
        let got = self.port.read_data(&mut scratch[..want])?;
        self.rx.pending -= got;
        for &byte in &scratch[..got] {
            self.rx.push(byte);
        }
        Ok(got)
    }

    fn next_byte(&mut self) -> Result<u8> {
        loop {
            if let Some(byte) = self.rx.pop() {
                return Ok(byte);
            }
            if self.fill()? == 0 && self.rx.pending == 0 {
                return Err(Error::Starved);
            }
        }
    }

    /// Flush all staged writes, drop the marked echo bytes, then return
    /// the next `buf.len()` sample bytes. Only the first of each
    /// multiplied copy is kept.
    pub fn recv(&mut self, buf: &mut [u8]) -> Result<()> {
        self.flush()?;
        self.fill()?;
        while self.rx.discard > 0 {
            self.next_byte()?;
            self.rx.discard -= 1;
        }
        for slot in buf.iter_mut() {
            *slot = self.next_byte()?;
            for _ in 1..self.baud_multiplier {
                self.next_byte()?;
            }
        }
        Ok(())
    }

    /// Reset the chip's internal buffer by cycling the bit mode, then
    /// forget everything held locally.
    pub fn drain(&mut self, ddr: u8) -> Result<()> {
        self.tx.len = 0;
        self.port.set_bitmode(ddr, BitMode::Reset)?;
        self.port.set_bitmode(ddr, BitMode::SyncBb)?;
        self.port.purge_buffers()?;
        self.rx.purge();
        Ok(())
    }

    /// Flush, then sleep. Pin changes only take effect on the wire once
    /// flushed, so every timed wait goes through here.
    pub fn usleep(&mut self, micros: u64) -> Result<()> {
        self.flush()?;
        thread::sleep(Duration::from_micros(micros));
        Ok(())
    }

    #[cfg(test)]
    fn state(&self) -> (usize, usize, usize) {
        (self.tx.len, self.rx.pending, self.rx.discard)
    }

    #[cfg(test)]
    fn ring_consistent(&self) -> bool {
        self.rx.len == (self.rx.wr + RX_CAPACITY - self.rx.rd) % RX_CAPACITY
            || (self.rx.len == RX_CAPACITY && self.rx.wr == self.rx.rd)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;

    /// A chip that echoes written bytes back verbatim, with configurable
    /// read-batch size to exercise short reads.
    struct LoopbackPort {
        echo: VecDeque<u8>,
        read_chunk: usize,
        max_outstanding: usize,
    }

    impl LoopbackPort {
        fn new(read_chunk: usize) -> Self {
            LoopbackPort {
                echo: VecDeque::new(),
                read_chunk,
                max_outstanding: 0,
            }
        }
    }

    impl Port for LoopbackPort {
        fn write_data(&mut self, data: &[u8]) -> Result<usize> {
            self.echo.extend(data);
            self.max_outstanding = self.max_outstanding.max(self.echo.len());
            Ok(data.len())
        }

        fn read_data(&mut self, buf: &mut [u8]) -> Result<usize> {
            let n = buf.len().min(self.echo.len()).min(self.read_chunk);
            for slot in &mut buf[..n] {
                *slot = self.echo.pop_front().unwrap();
            }
            Ok(n)
        }

        fn set_bitmode(&mut self, _ddr: u8, _mode: BitMode) -> Result<()> {
            Ok(())
        }

        fn set_baud_rate(&mut self, _baud: u32) -> Result<()> {
            Ok(())
        }

        fn set_latency_timer(&mut self, _ms: u8) -> Result<()> {
            Ok(())
        }

        fn read_pins(&mut self) -> Result<u8> {
            Ok(0)
        }

        fn purge_buffers(&mut self) -> Result<()> {
            self.echo.clear();
            Ok(())
        }
    }

    #[test]
    fn echoes_sent_bytes_in_order() {
        let mut ch = Channel::new(LoopbackPort::new(17));
        let data: Vec<u8> = (0..=255).cycle().take(1000).map(|b| b as u8).collect();
        ch.send(&data, false).unwrap();
        let mut back = vec![0u8; data.len()];
        ch.recv(&mut back).unwrap();
        assert_eq!(back, data);
        assert!(ch.ring_consistent());
        assert_eq!(ch.state(), (0, 0, 0));
    }

    #[test]
    fn discarded_echo_is_dropped() {
        let mut ch = Channel::new(LoopbackPort::new(64));
        ch.send(&[0xAA, 0x55, 0x12], true).unwrap();
        ch.recv(&mut []).unwrap();
        let (tx_len, pending, discard) = ch.state();
        assert_eq!((tx_len, pending, discard), (0, 0, 0));
        // the ring holds nothing: a follow-up byte round-trips cleanly
        ch.send(&[0x7E], false).unwrap();
        let mut back = [0u8; 1];
        ch.recv(&mut back).unwrap();
        assert_eq!(back, [0x7E]);
    }

    #[test]
    fn pending_never_exceeds_fifo_chunk() {
        let mut ch = Channel::new(LoopbackPort::new(11));
        for block in (0..4096u32).collect::<Vec<_>>().chunks(200) {
            let bytes: Vec<u8> = block.iter().map(|b| *b as u8).collect();
            ch.send(&bytes, true).unwrap();
            ch.flush().unwrap();
            let (_, pending, _) = ch.state();
            assert!(pending <= FIFO_CHUNK);
        }
        ch.recv(&mut []).unwrap();
        assert_eq!(ch.state(), (0, 0, 0));
    }

    #[test]
    fn rx_fifo_pressure_bounded_by_chunk() {
        // 4096 discarded bytes: no flush step may leave more than
        // FIFO_CHUNK outstanding on the chip
        let mut ch = Channel::new(LoopbackPort::new(23));
        let data = vec![0x5Au8; 4096];
        ch.send(&data, true).unwrap();
        ch.recv(&mut []).unwrap();
        assert!(ch.port_mut().max_outstanding <= FIFO_CHUNK);
        assert_eq!(ch.state(), (0, 0, 0));
        assert!(ch.ring_consistent());
    }

    #[test]
    fn baud_multiplier_replicates_and_dedups() {
        let mut ch = Channel::new(LoopbackPort::new(64));
        ch.set_baud_multiplier(3);
        ch.send(&[0x11, 0x22], false).unwrap();
        ch.flush().unwrap();
        let (_, pending, _) = ch.state();
        assert_eq!(pending, 6);
        let mut back = [0u8; 2];
        ch.recv(&mut back).unwrap();
        assert_eq!(back, [0x11, 0x22]);
        assert_eq!(ch.state(), (0, 0, 0));
    }

    #[test]
    fn multiplied_discards_cover_every_copy() {
        let mut ch = Channel::new(LoopbackPort::new(64));
        ch.set_baud_multiplier(2);
        ch.send(&[0xF0], true).unwrap();
        let (_, _, discard) = ch.state();
        assert_eq!(discard, 2);
        ch.recv(&mut []).unwrap();
        assert_eq!(ch.state(), (0, 0, 0));
    }

    #[test]
    fn starved_read_is_an_error() {
        let mut ch = Channel::new(LoopbackPort::new(64));
        let mut back = [0u8; 1];
        assert!(matches!(ch.recv(&mut back), Err(Error::Starved)));
    }

    #[test]
    fn drain_resets_all_state() {
        let mut ch = Channel::new(LoopbackPort::new(64));
        ch.send(&[1, 2, 3, 4], true).unwrap();
        ch.flush().unwrap();
        ch.drain(0x0B).unwrap();
        assert_eq!(ch.state(), (0, 0, 0));
        assert!(ch.ring_consistent());
    }
}
