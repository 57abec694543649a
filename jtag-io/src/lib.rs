pub mod devices;
pub mod ftdi;
pub mod jtag;
mod utils;

pub use crate::utils::{Hex, ShortHex, SpaceHex};

/// Abstract interface to a physical JTAG adapter, driven by a CSVF player.
///
/// Implementations are free to batch and flush to their transport however
/// they like; callers only see the effects in program order.
pub trait JtagDriver {
    type Error: std::error::Error + Send + Sync + 'static;

    /// Clock `count` bits of `tms_pattern`, LSB first, into TMS while holding
    /// TDI stable. Each clock is a TCK rising-then-falling edge.
    fn clock_fsm(&mut self, tms_pattern: u32, count: u8) -> Result<(), Self::Error>;

    /// Shift `num_bits` bits into TDI, LSB first within each byte, bytes
    /// consumed low-index first. Captures TDO into `tdo_out` when present.
    /// Raises TMS on the final bit when `is_last`.
    fn shift(
        &mut self,
        num_bits: u32,
        tdi: &[u8],
        tdo_out: Option<&mut [u8]>,
        is_last: bool,
    ) -> Result<(), Self::Error>;

    /// Hold TMS low and TDI unchanged, pulse TCK `n` times.
    fn clocks(&mut self, n: u32) -> Result<(), Self::Error>;
}
