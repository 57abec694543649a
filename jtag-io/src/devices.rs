//! MPSSE GPIO presets for a handful of common FT2232H-class JTAG adapters.
//!
//! These set the idle levels/directions of the low and high GPIO bytes at
//! device init; they do not affect TMS/TDI/TDO/TCK, which MPSSE always drives
//! on the dedicated low-byte pins 0-3.

#[rustfmt::skip]
mod consts {
    use super::Info;

    pub const GENERIC:  Info = Info { dbus_data: 0x00, dbus_en: 0x10, cbus_data: 0x00, cbus_en: 0x00 };
    pub const FTDIJTAG: Info = Info { dbus_data: 0x00, dbus_en: 0x10, cbus_data: 0x00, cbus_en: 0x00 };
    pub const NEXSYS4:  Info = Info { dbus_data: 0xe8, dbus_en: 0xeb, cbus_data: 0x00, cbus_en: 0x60 };
}
pub use consts::*;

#[derive(Debug, Clone, Copy)]
pub struct Info {
    pub dbus_data: u8,
    pub dbus_en: u8,
    pub cbus_data: u8,
    pub cbus_en: u8,
}

impl Default for Info {
    fn default() -> Self {
        GENERIC
    }
}
