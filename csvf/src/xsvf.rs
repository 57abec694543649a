//! XSVF → intermediate CSVF transformer (§4.2).

use crate::bytestream::ByteStream;
use crate::error::{Error, Result};
use tracing::trace;

#[rustfmt::skip]
pub(crate) mod opcode {
    pub const XCOMPLETE:    u8 = 0x00;
    pub const XTDOMASK:     u8 = 0x01;
    pub const XSIR:         u8 = 0x02;
    pub const XRUNTEST:     u8 = 0x04;
    pub const XREPEAT:      u8 = 0x07;
    pub const XSDRSIZE:     u8 = 0x08;
    pub const XSDRTDO:      u8 = 0x09;
    pub const XSDRB:        u8 = 0x0C;
    pub const XSDRC:        u8 = 0x0D;
    pub const XSDRE:        u8 = 0x0E;
    pub const XSTATE:       u8 = 0x12;
    pub const XENDIR:       u8 = 0x13;
    pub const XENDDR:       u8 = 0x14;
}
use opcode::*;

/// ⌈bits/8⌉
fn bits_to_bytes(bits: u32) -> u32 {
    bits.div_ceil(8)
}

/// Compile-time buffer limit from §3 invariant 5: 128 bytes ⇒ 1024-bit max register width.
pub const CSVF_BUF_SIZE: u32 = 128;

fn check_size(num_bytes: u32) -> Result<()> {
    if num_bytes > CSVF_BUF_SIZE {
        return Err(Error::UnsupportedSize {
            bits: num_bytes * 8,
            max_bits: CSVF_BUF_SIZE * 8,
        });
    }
    Ok(())
}

fn emit_size(out: &mut Vec<u8>, size: u32) {
    out.push(XSDRSIZE);
    out.extend_from_slice(&size.to_be_bytes());
}

/// Read `num_bytes` bytes and append them to `out` in reverse order.
fn swap_bytes(input: &mut ByteStream, num_bytes: u32, out: &mut Vec<u8>) {
    let start = out.len();
    for _ in 0..num_bytes {
        out.push(input.u8());
    }
    out[start..].reverse();
}

/// Transform an XSVF byte stream into an uncompressed intermediate CSVF
/// stream. Returns the CSVF bytes and the largest per-shift payload size (in
/// bytes) seen, so callers can size fixed buffers.
pub fn xsvf_to_csvf(xsvf_bytes: &[u8]) -> Result<(Vec<u8>, u32)> {
    let mut input = ByteStream::new(xsvf_bytes);
    let mut out = Vec::new();
    let mut max_buf_size = 0u32;

    let mut new_size = 0u32;
    let mut cur_size = 0u32;
    let mut tot_size = 0u32;
    let mut tot_offset = 0usize;

    loop {
        let op = input.u8();
        if op == XCOMPLETE {
            break;
        }
        trace!(opcode = op, "xsvf opcode");
        match op {
            XTDOMASK => {
                if new_size != cur_size {
                    cur_size = new_size;
                    emit_size(&mut out, cur_size);
                }
                let num_bytes = bits_to_bytes(cur_size);
                check_size(num_bytes)?;
                max_buf_size = max_buf_size.max(num_bytes);
                out.push(XTDOMASK);
                swap_bytes(&mut input, num_bytes, &mut out);
            }
            XSDRTDO => {
                if new_size != cur_size {
                    cur_size = new_size;
                    emit_size(&mut out, cur_size);
                }
                let num_bytes = bits_to_bytes(cur_size);
                check_size(num_bytes)?;
                max_buf_size = max_buf_size.max(num_bytes);
                out.push(XSDRTDO);
                swap_bytes(&mut input, 2 * num_bytes, &mut out);
            }
            XREPEAT => {
                input.u8();
            }
            XRUNTEST => {
                out.push(XRUNTEST);
                let value = input.u32_be();
                out.extend_from_slice(&value.to_be_bytes());
            }
            XSIR => {
                out.push(XSIR);
                let bit_count = input.u8();
                out.push(bit_count);
                swap_bytes(&mut input, bits_to_bytes(bit_count as u32), &mut out);
            }
            XSDRSIZE => {
                new_size = input.u32_be();
            }
            XSDRB => {
                cur_size = new_size;
                emit_size(&mut out, cur_size);
                tot_size = cur_size;
                tot_offset = out.len() - 4;
                let num_bytes = bits_to_bytes(cur_size);
                check_size(num_bytes)?;
                max_buf_size = max_buf_size.max(num_bytes);
                out.push(XSDRB);
                swap_bytes(&mut input, num_bytes, &mut out);
            }
            XSDRC => {
                if new_size != cur_size {
                    cur_size = new_size;
                }
                tot_size += cur_size;
                out[tot_offset..tot_offset + 4].copy_from_slice(&tot_size.to_be_bytes());
                let num_bytes = bits_to_bytes(cur_size);
                check_size(num_bytes)?;
                max_buf_size = max_buf_size.max(num_bytes);
                swap_bytes(&mut input, num_bytes, &mut out);
            }
            XSDRE => {
                cur_size = new_size;
                emit_size(&mut out, cur_size);
                let num_bytes = bits_to_bytes(cur_size);
                check_size(num_bytes)?;
                max_buf_size = max_buf_size.max(num_bytes);
                out.push(XSDRE);
                swap_bytes(&mut input, num_bytes, &mut out);
            }
            XSTATE => {
                input.u8();
            }
            XENDIR | XENDDR => {
                let state = input.u8();
                if state != 0 {
                    return Err(Error::UnsupportedData(format!(
                        "{} {state}",
                        if op == XENDIR { "XENDIR" } else { "XENDDR" }
                    )));
                }
            }
            other => return Err(Error::UnsupportedCommand(other)),
        }
    }

    out.push(XCOMPLETE);
    Ok((out, max_buf_size))
}

#[cfg(test)]
mod tests {
    use super::*;

    // S2
    #[test]
    fn byte_swap_example_s2() {
        let input = [
            XSDRSIZE, 0x00, 0x00, 0x00, 0x20, XTDOMASK, 0x01, 0x02, 0x03, 0x04, XCOMPLETE,
        ];
        let (out, max_buf) = xsvf_to_csvf(&input).unwrap();
        assert_eq!(
            out,
            vec![XSDRSIZE, 0x00, 0x00, 0x00, 0x20, XTDOMASK, 0x04, 0x03, 0x02, 0x01, XCOMPLETE]
        );
        assert_eq!(max_buf, 4);
    }

    #[test]
    fn xsdrsize_deduplicated_across_identical_shifts() {
        let input = [
            XSDRSIZE, 0, 0, 0, 8, XSDRTDO, 0xAA, 0xAA, XSDRTDO, 0xBB, 0xBB, XCOMPLETE,
        ];
        let (out, _) = xsvf_to_csvf(&input).unwrap();
        // only one XSDRSIZE, even though two shifts use the same width
        assert_eq!(out.iter().filter(|&&b| b == XSDRSIZE).count(), 1);
    }

    #[test]
    fn xendir_nonzero_fails() {
        let input = [XENDIR, 0x01, XCOMPLETE];
        assert!(matches!(
            xsvf_to_csvf(&input),
            Err(Error::UnsupportedData(_))
        ));
    }

    #[test]
    fn unknown_opcode_fails() {
        let input = [0xF0, XCOMPLETE];
        assert!(matches!(
            xsvf_to_csvf(&input),
            Err(Error::UnsupportedCommand(0xF0))
        ));
    }

    #[test]
    fn oversized_register_fails() {
        let mut input = vec![XSDRSIZE];
        input.extend((CSVF_BUF_SIZE * 8 + 8).to_be_bytes());
        input.push(XSDRB);
        input.extend(vec![0u8; CSVF_BUF_SIZE as usize + 1]);
        input.push(XCOMPLETE);
        assert!(matches!(
            xsvf_to_csvf(&input),
            Err(Error::UnsupportedSize { .. })
        ));
    }

    #[test]
    fn sdrb_sdrc_sdre_accumulate_size() {
        let input = [
            XSDRSIZE, 0, 0, 0, 8, XSDRB, 0x11, XSDRC, 0x22, XSDRE, 0x33, XCOMPLETE,
        ];
        let (out, _) = xsvf_to_csvf(&input).unwrap();
        // the XSDRB's size field is rewritten to 16 once XSDRC has contributed
        // its 8 bits; XSDRE then emits its own, separate, fresh XSDRSIZE.
        let size_pos = out.iter().position(|&b| b == XSDRB).unwrap() - 4;
        let size = u32::from_be_bytes(out[size_pos..size_pos + 4].try_into().unwrap());
        assert_eq!(size, 16);
        assert!(out.contains(&XSDRE));
    }
}
