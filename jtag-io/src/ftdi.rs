pub use ftdi_mpsse::MpsseCmdExecutor;
use tracing::{debug, instrument};

use crate::{JtagDriver, SpaceHex, devices};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("FTDI transfer failed")]
    Ftdi(#[from] ::ftdi::Error),
    #[error("data length {0} exceeds the MPSSE per-command limit")]
    TooLong(usize),
}

pub struct Device {
    dev: ::ftdi::Device,
    /// The final bit of a deferred shift, held for the next `clock_fsm` call:
    /// in real JTAG electrical behavior the last data bit and the TMS
    /// transition out of Shift-DR/IR are clocked on the same edge.
    last: Option<bool>,
    cmd_buf: Vec<u8>,
}

// `::ftdi::Device` wraps a `*mut ffi::ftdi_context` with no thread-affine
// state; sending `&mut Device` across threads is safe.
unsafe impl Send for Device {}

impl Device {
    pub fn new(mut dev: ::ftdi::Device, info: &devices::Info) -> Result<Self, Error> {
        dev.init(&Default::default())?;
        let init_cmd = [
            MpsseCommand::SetDataBitsLowbyte as u8,
            info.dbus_data,
            info.dbus_en,
            MpsseCommand::SetClockFrequency as u8,
            0x03,
            0x00,
            MpsseCommand::SetDataBitsHighbyte as u8,
            info.cbus_data,
            info.cbus_en,
        ];
        dev.send(&init_cmd)?;

        Ok(Self {
            dev,
            last: None,
            cmd_buf: Vec::new(),
        })
    }
}

#[rustfmt::skip]
mod flags {
    pub const WRITE_NEG : u8 = 0x01;   // Write TDI/DO on negative TCK/SK edge
    pub const BITMODE   : u8 = 0x02;   // Write bits, not bytes
    pub const READ_NEG  : u8 = 0x04;   // Sample TDO/DI on negative TCK/SK edge
    pub const LSB       : u8 = 0x08;   // LSB first
    pub const DO_WRITE  : u8 = 0x10;   // Write TDI/DO
    pub const DO_READ   : u8 = 0x20;   // Read TDO/DI
    pub const WRITE_TMS : u8 = 0x40;   // Write TMS/CS
}
use flags::*;

#[repr(u8)]
#[non_exhaustive]
#[allow(dead_code)]
enum MpsseCommand {
    SetDataBitsLowbyte = 0x80,
    GetDataBitsLowbyte = 0x81,
    SetDataBitsHighbyte = 0x82,
    GetDataBitsHighbyte = 0x83,
    EnableLoopback = 0x84,
    DisableLoopback = 0x85,
    SetClockFrequency = 0x86,
    SendImmediate = 0x87,
    DisableClockDivide = 0x8A,
    EnableClockDivide = 0x8B,
}

const MAX_READ_WRITE_LEN: usize = u16::MAX as usize + 1;

fn assert_data_len(len: usize) -> Result<u16, Error> {
    if len == 0 || len > MAX_READ_WRITE_LEN {
        return Err(Error::TooLong(len));
    }
    Ok((len - 1) as u16)
}

impl Device {
    fn push_bytes(&mut self, flags: u8, data: &[u8]) -> Result<(), Error> {
        let len = assert_data_len(data.len())?;
        self.cmd_buf.push(flags);
        self.cmd_buf.push(len as u8);
        self.cmd_buf.push((len >> 8) as u8);
        self.cmd_buf.extend_from_slice(data);
        Ok(())
    }

    fn push_bits(&mut self, flags: u8, data: u8, count: u8) {
        assert!((1..=8).contains(&count), "bit count out of MPSSE range");
        self.cmd_buf.push(flags | BITMODE);
        self.cmd_buf.push(count - 1);
        self.cmd_buf.push(data);
    }

    /// Append `SendImmediate`, transfer, and return exactly `read_len` bytes.
    fn xfer(&mut self, read_len: usize) -> Result<Vec<u8>, Error> {
        self.cmd_buf.push(MpsseCommand::SendImmediate as u8);
        debug!(
            write_len = self.cmd_buf.len(),
            read_len,
            data = %SpaceHex(&self.cmd_buf),
        );
        let mut out = vec![0u8; read_len];
        self.dev.xfer(&self.cmd_buf, &mut out)?;
        self.cmd_buf.clear();
        Ok(out)
    }
}

impl JtagDriver for Device {
    type Error = Error;

    #[instrument(skip_all)]
    fn clock_fsm(&mut self, tms_pattern: u32, count: u8) -> Result<(), Error> {
        assert!(
            (1..=7).contains(&count),
            "MPSSE clocks at most 7 TMS bits per command"
        );
        let tdi = self.last.take().unwrap_or(false);
        debug!(tms_pattern, count, tdi);

        let tdi_bit = if tdi { 0x80 } else { 0x00 };
        let pattern = (tms_pattern as u8) & ((1u8 << count) - 1);

        self.cmd_buf.push(WRITE_TMS | LSB | BITMODE | WRITE_NEG);
        self.cmd_buf.push(count - 1);
        self.cmd_buf.push(tdi_bit | pattern);
        self.xfer(0)?;
        Ok(())
    }

    #[instrument(skip_all)]
    fn shift(
        &mut self,
        num_bits: u32,
        tdi: &[u8],
        tdo_out: Option<&mut [u8]>,
        is_last: bool,
    ) -> Result<(), Error> {
        assert!(self.last.is_none());
        debug!(num_bits, is_last, data = %SpaceHex(tdi));

        let reading = tdo_out.is_some();
        let rw_flags = DO_WRITE | LSB | WRITE_NEG | if reading { DO_READ | READ_NEG } else { 0 };

        let full_bytes = (num_bits / 8) as usize;
        let rem_bits = (num_bits % 8) as u8;

        // The very last bit, when `is_last`, is deferred to the following
        // `clock_fsm` call rather than clocked here.
        let (body_bytes, tail_bits) = if rem_bits == 0 {
            if is_last && full_bytes > 0 {
                (full_bytes - 1, 7)
            } else {
                (full_bytes, 0)
            }
        } else if is_last {
            (full_bytes, rem_bits - 1)
        } else {
            (full_bytes, rem_bits)
        };

        if body_bytes > 0 {
            self.push_bytes(rw_flags, &tdi[..body_bytes])?;
        }
        let tail_byte = tdi.get(body_bytes).copied().unwrap_or(0);
        if tail_bits > 0 {
            self.push_bits(rw_flags, tail_byte, tail_bits);
        }

        let read_len = body_bytes + usize::from(tail_bits > 0);
        let read = self.xfer(read_len)?;

        if let Some(out) = tdo_out {
            out[..body_bytes].copy_from_slice(&read[..body_bytes]);
            if tail_bits > 0 {
                // Bits clocked LSB-first land left-justified in the MPSSE
                // reply; shift down so bit 0 of the output byte is the first
                // bit shifted.
                out[body_bytes] = read[body_bytes] >> (8 - tail_bits);
            }
        }

        if is_last {
            let bit_index = tail_bits; // 0-indexed position of the deferred bit
            self.last = Some((tail_byte >> bit_index) & 1 != 0);
        }
        Ok(())
    }

    #[instrument(skip_all)]
    fn clocks(&mut self, n: u32) -> Result<(), Error> {
        debug!(n);
        let mut remaining = n;
        while remaining > 0 {
            let chunk = remaining.min(MAX_READ_WRITE_LEN as u32);
            // "Clock for n cycles with no data transfer", TMS/TDI untouched;
            // the length field, like the byte commands above, is count - 1.
            self.cmd_buf.push(0x8F);
            let len = assert_data_len(chunk as usize)?;
            self.cmd_buf.push(len as u8);
            self.cmd_buf.push((len >> 8) as u8);
            self.xfer(0)?;
            remaining -= chunk;
        }
        Ok(())
    }
}
