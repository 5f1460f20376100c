//! Logical programmer pins mapped onto the eight FTDI data-bus bits.

use core::fmt;

/// One logical pin: a single-bit mask within DBUS0..7 plus an optional
/// inversion between logical level and wire level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PinDef {
    mask: u8,
    invert: bool,
}

impl PinDef {
    pub const fn bit(n: u8) -> Self {
        assert!(n < 8, "only DBUS0..7 are valid pin targets");
        PinDef {
            mask: 1 << n,
            invert: false,
        }
    }

    pub const fn bit_inverted(n: u8) -> Self {
        assert!(n < 8, "only DBUS0..7 are valid pin targets");
        PinDef {
            mask: 1 << n,
            invert: true,
        }
    }

    /// A pin the adapter does not wire up; writes are no-ops.
    pub const fn unused() -> Self {
        PinDef {
            mask: 0,
            invert: false,
        }
    }

    pub fn is_wired(&self) -> bool {
        self.mask != 0
    }

    pub fn mask(&self) -> u8 {
        self.mask
    }

    pub fn is_inverted(&self) -> bool {
        self.invert
    }

    /// Recompute an output byte with this pin set to `level`.
    pub fn apply(&self, byte: u8, level: bool) -> u8 {
        if level != self.invert {
            byte | self.mask
        } else {
            byte & !self.mask
        }
    }

    /// Logical level of this pin within a sampled byte.
    pub fn extract(&self, byte: u8) -> bool {
        ((byte & self.mask) != 0) != self.invert
    }
}

/// Pin assignment for one adapter. SDI is the only input; everything
/// else drives the bus.
#[derive(Debug, Clone)]
pub struct PinMap {
    pub sck: PinDef,
    pub sdo: PinDef,
    pub sdi: PinDef,
    pub reset: PinDef,
    pub buff: PinDef,
    pub vcc: PinDef,
    pub rdy_led: PinDef,
    pub err_led: PinDef,
    pub pgm_led: PinDef,
    pub vfy_led: PinDef,
}

impl Default for PinMap {
    /// The common FT232R adapter wiring: SCK on TXD, SDI on RXD, SDO on
    /// RTS, RESET on DTR.
    fn default() -> Self {
        PinMap {
            sck: PinDef::bit(0),
            sdi: PinDef::bit(1),
            sdo: PinDef::bit(2),
            reset: PinDef::bit(4),
            buff: PinDef::unused(),
            vcc: PinDef::unused(),
            rdy_led: PinDef::unused(),
            err_led: PinDef::unused(),
            pgm_led: PinDef::unused(),
            vfy_led: PinDef::unused(),
        }
    }
}

impl PinMap {
    pub fn outputs(&self) -> [PinDef; 9] {
        [
            self.sck,
            self.sdo,
            self.reset,
            self.buff,
            self.vcc,
            self.rdy_led,
            self.err_led,
            self.pgm_led,
            self.vfy_led,
        ]
    }

    /// Direction register: 1 = output. The union of every output mask.
    pub fn ddr(&self) -> u8 {
        self.outputs().iter().fold(0, |ddr, pin| ddr | pin.mask())
    }
}

impl fmt::Display for PinMap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let rows = [
            ("sck", &self.sck),
            ("sdo", &self.sdo),
            ("sdi", &self.sdi),
            ("reset", &self.reset),
            ("buff", &self.buff),
            ("vcc", &self.vcc),
            ("rdy led", &self.rdy_led),
            ("err led", &self.err_led),
            ("pgm led", &self.pgm_led),
            ("vfy led", &self.vfy_led),
        ];
        for (name, pin) in rows {
            if !pin.is_wired() {
                continue;
            }
            let bit = pin.mask().trailing_zeros();
            let inverted = if pin.is_inverted() { " (inverted)" } else { "" };
            writeln!(f, "  {name:<8} = DBUS{bit}{inverted}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn apply_and_extract_honour_inversion() {
        let plain = PinDef::bit(3);
        let inverted = PinDef::bit_inverted(3);

        assert_eq!(plain.apply(0x00, true), 0x08);
        assert_eq!(plain.apply(0xFF, false), 0xF7);
        assert_eq!(inverted.apply(0x00, true), 0x00);
        assert_eq!(inverted.apply(0x00, false), 0x08);

        assert!(plain.extract(0x08));
        assert!(!plain.extract(0x00));
        assert!(!inverted.extract(0x08));
        assert!(inverted.extract(0x00));
    }

    #[test]
    fn unused_pin_is_inert() {
        let pin = PinDef::unused();
        assert_eq!(pin.apply(0xA5, true), 0xA5);
        assert_eq!(pin.apply(0xA5, false), 0xA5);
        assert!(!pin.is_wired());
    }

    #[test]
    fn ddr_covers_outputs_only() {
        let pins = PinMap::default();
        let ddr = pins.ddr();
        assert_eq!(ddr & pins.sdi.mask(), 0);
        assert_ne!(ddr & pins.sck.mask(), 0);
        assert_ne!(ddr & pins.sdo.mask(), 0);
        assert_ne!(ddr & pins.reset.mask(), 0);
    }

    #[test]
    fn display_lists_wired_pins() {
        let text = PinMap::default().to_string();
        assert!(text.contains("sck"));
        assert!(text.contains("DBUS0"));
        assert!(!text.contains("vcc"));
    }
}
