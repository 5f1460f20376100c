// Copyright 2025 the avrbang authors
// Dual licensed under the Apache 2.0 and MIT licenses.

//! Byte-level default programming primitives, built on [`Link`]. These
//! are the slow paths the paged engine falls back to for EEPROM and for
//! TPI parts, and the building blocks of `read_byte`/`write_byte`.

use std::thread;
use std::time::Duration;

use crate::part::{MemKind, Memory, OpKind, Part};
use crate::{tpi, Link, Result};

fn sleep_us(us: u64) {
    thread::sleep(Duration::from_micros(us));
}

/// Read one byte of `mem` through the part's opcode table.
pub fn read_byte_default<L: Link + ?Sized>(
    link: &mut L,
    part: &Part,
    mem: &Memory,
    addr: u32,
) -> Result<u8> {
    if part.has_tpi {
        tpi::poll_nvmbsy(link)?;
        tpi::setup_rw(link, mem, addr, tpi::NVMCMD_NO_OPERATION)?;
        let mut value = [0u8; 1];
        link.cmd_tpi(&[tpi::TPI_CMD_SLD], &mut value)?;
        return Ok(value[0]);
    }

    let (op, addr) = if mem.kind == MemKind::Flash && mem.op(OpKind::ReadLo).is_some() {
        if addr & 1 == 0 {
            (mem.op_or_err(part, OpKind::ReadLo)?, addr >> 1)
        } else {
            (mem.op_or_err(part, OpKind::ReadHi)?, addr >> 1)
        }
    } else {
        (mem.op_or_err(part, OpKind::Read)?, addr)
    };

    let mut cmd = [0u8; 4];
    op.set_bits(&mut cmd);
    op.set_addr(&mut cmd, addr);
    let res = link.cmd(&cmd)?;
    Ok(op.get_output(&res))
}

/// Write one byte of `mem` through the part's opcode table.
pub fn write_byte_default<L: Link + ?Sized>(
    link: &mut L,
    part: &Part,
    mem: &Memory,
    addr: u32,
    data: u8,
) -> Result<()> {
    if part.has_tpi {
        tpi::poll_nvmbsy(link)?;
        tpi::setup_rw(link, mem, addr & !1, tpi::NVMCMD_WORD_WRITE)?;
        // words program as a unit; the untouched half stays erased
        let word = if addr & 1 == 0 {
            [data, 0xFF]
        } else {
            [0xFF, data]
        };
        link.cmd_tpi(&[tpi::TPI_CMD_SST_PI, word[0]], &mut [])?;
        link.cmd_tpi(&[tpi::TPI_CMD_SST_PI, word[1]], &mut [])?;
        return tpi::poll_nvmbsy(link);
    }

    let (op, addr) = if mem.kind == MemKind::Flash && mem.op(OpKind::WriteLo).is_some() {
        if addr & 1 == 0 {
            (mem.op_or_err(part, OpKind::WriteLo)?, addr >> 1)
        } else {
            (mem.op_or_err(part, OpKind::WriteHi)?, addr >> 1)
        }
    } else {
        (mem.op_or_err(part, OpKind::Write)?, addr)
    };

    let mut cmd = [0u8; 4];
    op.set_bits(&mut cmd);
    op.set_addr(&mut cmd, addr);
    op.set_input(&mut cmd, data);
    link.cmd(&cmd)?;
    sleep_us(mem.max_write_delay_us);
    Ok(())
}

/// Commit the loaded page buffer at `addr` (the page's base byte
/// address).
pub fn write_page<L: Link + ?Sized>(
    link: &mut L,
    part: &Part,
    mem: &Memory,
    addr: u32,
) -> Result<()> {
    let op = mem.op_or_err(part, OpKind::WritePage)?;
    let addr = if mem.kind == MemKind::Flash {
        addr >> 1
    } else {
        addr
    };
    let mut cmd = [0u8; 4];
    op.set_bits(&mut cmd);
    op.set_addr(&mut cmd, addr);
    link.cmd(&cmd)?;
    sleep_us(mem.max_write_delay_us);
    Ok(())
}
