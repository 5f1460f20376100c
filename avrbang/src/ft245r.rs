// Copyright 2025 the avrbang authors
// Dual licensed under the Apache 2.0 and MIT licenses.

//! The FT245R programmer session: pin control, the programming-mode
//! entry sequence, the ISP/TPI command primitives and the pipelined
//! paged flash engine.

use avrbang_ftdi::channel::Channel;
use avrbang_ftdi::ftdi::{BitMode, FtdiContext, PortAddr, UsbId};
use avrbang_ftdi::pins::{PinDef, PinMap};
use avrbang_ftdi::Port;

use crate::pager::{RequestQueue, REQ_OUTSTANDINGS};
use crate::part::{MemKind, Memory, OpKind, Opcode, Part};
use crate::{avr, isp, tpi, Error, Link, Programmer, Result};

/// Default bit clock, chosen to suit targets running from the internal
/// 1 MHz RC oscillator on every chip revision.
pub const DEFAULT_BIT_CLOCK: u32 = 150_000;

/// Fastest rate the chip can toggle its outputs in bit-bang mode.
const MAX_TOGGLE_RATE: u32 = 3_000_000;

const PROGRAM_ENABLE_ATTEMPTS: u32 = 4;

#[derive(Debug, Clone)]
pub struct Config {
    pub usb: UsbId,
    pub pins: PinMap,
    /// Bit clock in Hz; wins over `bit_period`.
    pub bit_clock_hz: Option<u32>,
    /// Bit clock as seconds per bit.
    pub bit_period: Option<f64>,
    /// Demote otherwise-fatal wiring checks to warnings.
    pub ovsigck: bool,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            usb: UsbId::default(),
            pins: PinMap::default(),
            bit_clock_hz: None,
            bit_period: None,
            ovsigck: false,
        }
    }
}

impl Config {
    fn rate(&self) -> u32 {
        if let Some(hz) = self.bit_clock_hz {
            return hz;
        }
        if let Some(period) = self.bit_period {
            if period > 0.0 {
                return (1.0 / period) as u32;
            }
        }
        DEFAULT_BIT_CLOCK
    }
}

/// One open programmer session. All state lives here; nothing is shared.
pub struct Ft245r<P: Port> {
    ch: Channel<P>,
    pins: PinMap,
    ddr: u8,
    /// Shadow of the byte currently driven onto the data bus. Every pin
    /// update rewrites the whole byte through this shadow.
    out: u8,
    ovsigck: bool,
}

impl Ft245r<FtdiContext> {
    /// Open the device named by `port` (`usb:<serial>`, `usb:ft<N>`, or
    /// `usb:` for the first match) and bring it into bit-bang state.
    pub fn open(port: &str, config: Config) -> Result<Self> {
        let addr = PortAddr::parse(port)?;
        let ctx = FtdiContext::open(&config.usb, &addr)?;
        Self::with_port(ctx, config)
    }
}

impl<P: Port> Ft245r<P> {
    /// Configure an already-open port for synchronous bit-bang and set up
    /// the session. Mainly useful for driving the programmer over a
    /// scripted port.
    pub fn with_port(mut port: P, config: Config) -> Result<Self> {
        let ddr = config.pins.ddr();
        port.set_latency_timer(1)?;
        port.set_bitmode(ddr, BitMode::SyncBb)?;

        let rate = config.rate();
        let (chip_rate, multiplier) = if cfg!(feature = "variable-pulse-width-workaround") {
            (
                MAX_TOGGLE_RATE,
                MAX_TOGGLE_RATE.div_ceil(rate.max(1)) as usize,
            )
        } else {
            (rate, 1)
        };
        // the chip multiplies bit-bang rates by four internally
        port.set_baud_rate(chip_rate / 4)?;
        log::debug!("bit clock {rate} Hz, multiplier {multiplier}");

        let mut ch = Channel::new(port);
        ch.set_baud_multiplier(multiplier);

        let mut out = 0u8;
        for pin in config.pins.outputs() {
            out = pin.apply(out, false);
        }
        let mut session = Ft245r {
            ch,
            pins: config.pins,
            ddr,
            out,
            ovsigck: config.ovsigck,
        };
        // settle every output at its logical-low wire level
        session.ch.send(&[out], true)?;
        session.ch.recv(&mut [])?;
        Ok(session)
    }

    pub fn pin_map(&self) -> &PinMap {
        &self.pins
    }

    fn set_pin(&mut self, pin: PinDef, level: bool) -> Result<()> {
        self.out = pin.apply(self.out, level);
        let byte = self.out;
        self.ch.send(&[byte], true).map_err(Error::from)
    }

    fn get_pin(&mut self, pin: PinDef) -> Result<bool> {
        self.ch.flush()?;
        let sampled = self.ch.port_mut().read_pins()?;
        Ok(pin.extract(sampled))
    }

    fn usleep(&mut self, micros: u64) -> Result<()> {
        self.ch.usleep(micros).map_err(Error::from)
    }

    /// TPI entry: check the data-line bridge, wake the interface, drop
    /// the guard bits, verify the identification register and unlock NVM
    /// programming.
    fn initialize_tpi(&mut self, part: &Part) -> Result<()> {
        let mut bridged = true;
        for level in [false, true] {
            self.set_pin(self.pins.sdo, level)?;
            if self.get_pin(self.pins.sdi)? != level {
                bridged = false;
            }
        }
        if !bridged {
            if self.ovsigck {
                log::warn!("SDO->SDI loopback broken; continuing anyway");
            } else {
                return Err(Error::TpiLoopback);
            }
        }

        // hold TPIDATA high for 16 clock cycles to enable the interface
        let mut buf = Vec::with_capacity(2 * tpi::RX_CYCLES + 1);
        tpi::rx_preamble(&self.pins, &mut self.out, &mut buf);
        self.ch.send(&buf, true)?;
        self.ch.recv(&mut [])?;

        // remove the extra guard bits
        self.cmd_tpi(
            &[
                tpi::TPI_CMD_SSTCS | u8::from(tpi::CtrlReg::Tpipcr),
                tpi::TPIPCR_GT_0B,
            ],
            &mut [],
        )?;

        let mut ident = [0u8; 1];
        self.cmd_tpi(&[tpi::TPI_CMD_SLDCS | u8::from(tpi::CtrlReg::Tpiir)], &mut ident)?;
        if ident[0] != tpi::TPI_IDENT_CODE {
            return Err(Error::TpiIdent(ident[0]));
        }

        tpi::program_enable(self, part)
    }

    fn tpi_rx(&mut self) -> Result<u8> {
        let mut buf = Vec::with_capacity(2 * tpi::RX_CYCLES + 1);
        tpi::rx_preamble(&self.pins, &mut self.out, &mut buf);
        self.ch.send(&buf, false)?;
        let mut echo = vec![0u8; buf.len()];
        self.ch.recv(&mut echo)?;
        tpi::decode_frame(tpi::sample_window(&self.pins, &echo))
    }

    fn load_ext_addr(&mut self, op: &Opcode, addr: u32) -> Result<()> {
        let mut cmd = [0u8; 4];
        op.set_bits(&mut cmd);
        op.set_addr(&mut cmd, addr >> 1);
        self.cmd(&cmd)?;
        Ok(())
    }

    /// Retire the oldest outstanding fragment: receive its echo and, for
    /// reads, scatter the recovered bytes into the memory image.
    fn retire_one(&mut self, queue: &mut RequestQueue, mem: &mut Memory) -> Result<bool> {
        let req = match queue.pop() {
            Some(req) => req,
            None => return Ok(false),
        };
        let mut echo = vec![0u8; req.bytes];
        self.ch.recv(&mut echo)?;
        for j in 0..req.n {
            mem.buf[req.addr as usize + j] = isp::extract_data(&self.pins, &echo, j * 4 + 3);
        }
        Ok(true)
    }

    fn paged_write_flash(
        &mut self,
        part: &Part,
        mem: &mut Memory,
        page_size: usize,
        base: u32,
        n_bytes: usize,
    ) -> Result<usize> {
        let lo = *mem.op_or_err(part, OpKind::LoadPageLo)?;
        let hi = *mem.op_or_err(part, OpKind::LoadPageHi)?;
        if let Some(op) = mem.op(OpKind::LoadExtAddr).copied() {
            self.load_ext_addr(&op, base)?;
        }
        let page_size = page_size as u32;

        let mut queue = RequestQueue::new();
        let mut frag = Vec::with_capacity(isp::FRAGMENT_SIZE + 1);
        let mut i = 0usize;
        while i < n_bytes {
            let frag_start = base + i as u32;
            frag.clear();
            let mut page_done = false;
            loop {
                let addr = base + i as u32;
                let op = if addr & 1 == 0 { &lo } else { &hi };
                let mut cmd = [0u8; 4];
                op.set_bits(&mut cmd);
                op.set_addr(&mut cmd, addr >> 1);
                op.set_input(&mut cmd, mem.buf[addr as usize]);
                for &b in &cmd {
                    isp::set_data(&self.pins, &mut self.out, &mut frag, b);
                }
                i += 1;
                if page_size > 0 && (addr + 1) % page_size == 0 {
                    page_done = true;
                    break;
                }
                if i >= n_bytes || frag.len() >= isp::FRAGMENT_SIZE {
                    break;
                }
            }
            let closing = page_done || i >= n_bytes;
            if closing {
                isp::push_sck_idle(&self.pins, &mut self.out, &mut frag);
            } else {
                isp::push_stretch(&mut frag);
            }
            self.ch.send(&frag, false)?;
            queue.push(frag_start, frag.len(), 0);
            if queue.len() > REQ_OUTSTANDINGS {
                self.retire_one(&mut queue, mem)?;
            }
            if closing {
                while self.retire_one(&mut queue, mem)? {}
                let last_addr = base + i as u32 - 1;
                let page_addr = if page_size > 0 {
                    last_addr & !(page_size - 1)
                } else {
                    frag_start
                };
                avr::write_page(self, part, mem, page_addr)?;
            }
        }
        Ok(n_bytes)
    }

    fn paged_load_flash(
        &mut self,
        part: &Part,
        mem: &mut Memory,
        base: u32,
        n_bytes: usize,
    ) -> Result<usize> {
        let lo = *mem.op_or_err(part, OpKind::ReadLo)?;
        let hi = *mem.op_or_err(part, OpKind::ReadHi)?;
        if let Some(op) = mem.op(OpKind::LoadExtAddr).copied() {
            self.load_ext_addr(&op, base)?;
        }

        let mut queue = RequestQueue::new();
        let mut frag = Vec::with_capacity(isp::FRAGMENT_SIZE + 1);
        let mut i = 0usize;
        while i < n_bytes {
            let frag_start = base + i as u32;
            frag.clear();
            let mut count = 0usize;
            loop {
                let addr = base + i as u32;
                let op = if addr & 1 == 0 { &lo } else { &hi };
                let mut cmd = [0u8; 4];
                op.set_bits(&mut cmd);
                op.set_addr(&mut cmd, addr >> 1);
                for &b in &cmd {
                    isp::set_data(&self.pins, &mut self.out, &mut frag, b);
                }
                i += 1;
                count += 1;
                if i >= n_bytes || frag.len() >= isp::FRAGMENT_SIZE {
                    break;
                }
            }
            if i >= n_bytes {
                isp::push_sck_idle(&self.pins, &mut self.out, &mut frag);
            } else {
                isp::push_stretch(&mut frag);
            }
            self.ch.send(&frag, false)?;
            queue.push(frag_start, frag.len(), count);
            if queue.len() > REQ_OUTSTANDINGS {
                self.retire_one(&mut queue, mem)?;
            }
        }
        while self.retire_one(&mut queue, mem)? {}
        Ok(n_bytes)
    }

    fn paged_write_gen(
        &mut self,
        part: &Part,
        mem: &mut Memory,
        base: u32,
        n_bytes: usize,
    ) -> Result<usize> {
        for k in 0..n_bytes {
            let addr = base + k as u32;
            let value = mem.buf[addr as usize];
            avr::write_byte_default(self, part, mem, addr, value)?;
        }
        Ok(n_bytes)
    }

    fn paged_load_gen(
        &mut self,
        part: &Part,
        mem: &mut Memory,
        base: u32,
        n_bytes: usize,
    ) -> Result<usize> {
        for k in 0..n_bytes {
            let addr = base + k as u32;
            let value = avr::read_byte_default(self, part, mem, addr)?;
            mem.buf[addr as usize] = value;
        }
        Ok(n_bytes)
    }
}

impl<P: Port> Link for Ft245r<P> {
    fn cmd(&mut self, cmd: &[u8; 4]) -> Result<[u8; 4]> {
        let mut buf = Vec::with_capacity(isp::CMD_SIZE + 1);
        for &b in cmd {
            isp::set_data(&self.pins, &mut self.out, &mut buf, b);
        }
        isp::push_sck_idle(&self.pins, &mut self.out, &mut buf);
        self.ch.send(&buf, false)?;
        let mut echo = vec![0u8; buf.len()];
        self.ch.recv(&mut echo)?;
        let mut res = [0u8; 4];
        for (i, slot) in res.iter_mut().enumerate() {
            *slot = isp::extract_data(&self.pins, &echo, i);
        }
        log::trace!("cmd {cmd:02x?} -> {res:02x?}");
        Ok(res)
    }

    fn cmd_tpi(&mut self, cmd: &[u8], res: &mut [u8]) -> Result<()> {
        for &byte in cmd {
            let mut buf = Vec::with_capacity(2 * 12);
            tpi::tx_frame(&self.pins, &mut self.out, &mut buf, byte);
            self.ch.send(&buf, true)?;
        }
        for slot in res.iter_mut() {
            *slot = self.tpi_rx()?;
        }
        // settle: flush anything staged and swallow the transmit echoes
        self.ch.recv(&mut [])?;
        Ok(())
    }
}

impl<P: Port> Programmer for Ft245r<P> {
    /// Power the target and pulse it into programming mode.
    fn initialize(&mut self, part: &Part) -> Result<()> {
        self.set_pin(self.pins.sck, false)?;
        self.powerup()?;
        self.usleep(100)?;

        self.set_pin(self.pins.reset, false)?;
        self.usleep(5_000)?;
        self.set_pin(self.pins.reset, true)?;
        self.usleep(5_000)?;
        self.set_pin(self.pins.reset, false)?;
        self.usleep(20_000)?;

        if part.has_tpi {
            self.initialize_tpi(part)
        } else {
            self.program_enable(part)
        }
    }

    fn display(&self) {
        log::info!("pin assignment:\n{}", self.pins);
    }

    fn enable(&mut self) -> Result<()> {
        self.set_pin(self.pins.buff, true)
    }

    fn disable(&mut self) -> Result<()> {
        self.set_pin(self.pins.buff, false)
    }

    fn program_enable(&mut self, part: &Part) -> Result<()> {
        let op = *part.op_or_err(OpKind::PgmEnable)?;
        let mut cmd = [0u8; 4];
        op.set_bits(&mut cmd);
        for attempt in 1..=PROGRAM_ENABLE_ATTEMPTS {
            let res = self.cmd(&cmd)?;
            let polled = part
                .pollindex
                .checked_sub(1)
                .and_then(|i| res.get(i))
                .is_some_and(|&b| b == part.pollvalue);
            if polled {
                return Ok(());
            }
            log::debug!("program enable attempt {attempt} got {res:02x?}");
            if attempt < PROGRAM_ENABLE_ATTEMPTS {
                // a short reset pulse resynchronises the target
                self.set_pin(self.pins.reset, true)?;
                self.usleep(20)?;
                self.set_pin(self.pins.reset, false)?;
            }
        }
        self.ch.drain(self.ddr)?;
        Err(Error::ProgramEnable {
            tries: PROGRAM_ENABLE_ATTEMPTS,
        })
    }

    fn chip_erase(&mut self, part: &Part) -> Result<()> {
        if part.has_tpi {
            return tpi::chip_erase(self, part.flash_offset);
        }
        let op = *part.op_or_err(OpKind::ChipErase)?;
        let mut cmd = [0u8; 4];
        op.set_bits(&mut cmd);
        self.cmd(&cmd)?;
        self.usleep(part.chip_erase_delay_us)
    }

    fn powerup(&mut self) -> Result<()> {
        self.set_pin(self.pins.vcc, true)
    }

    fn powerdown(&mut self) -> Result<()> {
        self.set_pin(self.pins.vcc, false)
    }

    fn read_byte(&mut self, part: &Part, mem: &Memory, addr: u32) -> Result<u8> {
        avr::read_byte_default(self, part, mem, addr)
    }

    fn write_byte(&mut self, part: &Part, mem: &Memory, addr: u32, value: u8) -> Result<()> {
        avr::write_byte_default(self, part, mem, addr, value)
    }

    fn paged_write(
        &mut self,
        part: &Part,
        mem: &mut Memory,
        page_size: usize,
        addr: u32,
        n_bytes: usize,
    ) -> Result<usize> {
        if n_bytes == 0 {
            return Ok(0);
        }
        match mem.kind {
            MemKind::Flash if !part.has_tpi => {
                self.paged_write_flash(part, mem, page_size, addr, n_bytes)
            }
            MemKind::Eeprom | MemKind::Flash => self.paged_write_gen(part, mem, addr, n_bytes),
            kind => Err(Error::UnsupportedMemory(kind)),
        }
    }

    fn paged_load(
        &mut self,
        part: &Part,
        mem: &mut Memory,
        _page_size: usize,
        addr: u32,
        n_bytes: usize,
    ) -> Result<usize> {
        if n_bytes == 0 {
            return Ok(0);
        }
        match mem.kind {
            MemKind::Flash if !part.has_tpi => self.paged_load_flash(part, mem, addr, n_bytes),
            MemKind::Eeprom | MemKind::Flash => self.paged_load_gen(part, mem, addr, n_bytes),
            kind => Err(Error::UnsupportedMemory(kind)),
        }
    }

    fn rdy_led(&mut self, on: bool) -> Result<()> {
        self.set_pin(self.pins.rdy_led, on)
    }

    fn err_led(&mut self, on: bool) -> Result<()> {
        self.set_pin(self.pins.err_led, on)
    }

    fn pgm_led(&mut self, on: bool) -> Result<()> {
        self.set_pin(self.pins.pgm_led, on)
    }

    fn vfy_led(&mut self, on: bool) -> Result<()> {
        self.set_pin(self.pins.vfy_led, on)
    }

    /// Flush the chip with a bit-mode reset round-trip; dropping the
    /// session then releases the USB handle.
    fn close(&mut self) -> Result<()> {
        self.ch.flush()?;
        self.ch.port_mut().set_bitmode(0, BitMode::Reset)?;
        Ok(())
    }
}
