//! SVF lexer/parser and command assembler (§4.3).
//!
//! Tokenizes SVF statements (`RUNTEST`, `HDR`/`HIR`/`SDR`/`SIR`/`TDR`/`TIR`),
//! tracks the head/body/tail shift-register state for the data and
//! instruction paths, and assembles a `Vec<Command>` which is then run
//! through [`crate::command::hoist_runtest`] and [`crate::command::serialize`].

use crate::command::Command;
use crate::error::{Error, Result};

const CSVF_BUF_SIZE: u32 = crate::xsvf::CSVF_BUF_SIZE;

fn bits_to_bytes(bits: u32) -> u32 {
    bits.div_ceil(8)
}

fn check_size(bits: u32) -> Result<()> {
    if bits_to_bytes(bits) > CSVF_BUF_SIZE {
        return Err(Error::UnsupportedSize {
            bits,
            max_bits: CSVF_BUF_SIZE * 8,
        });
    }
    Ok(())
}

/// One shift register's remembered state. `tdi`/`mask` persist across lines
/// of the same bit length; `tdo` resets to all zeros on every line ("The TDI
/// parameter must be explicitly specified for the first command or when the
/// length changes" — TDO has no such carry-over).
#[derive(Default, Clone)]
struct BitStore {
    num_bits: u32,
    tdi: Vec<u8>,
    tdo: Vec<u8>,
    mask: Vec<u8>,
}

impl BitStore {
    fn update(
        &mut self,
        new_length: u32,
        tdi: Option<&str>,
        tdo: Option<&str>,
        mask: Option<&str>,
    ) -> Result<()> {
        self.tdo = vec![0u8; bits_to_bytes(new_length) as usize];
        if self.num_bits != new_length {
            self.tdi = vec![0u8; bits_to_bytes(new_length) as usize];
            self.mask = vec![0xFFu8; bits_to_bytes(new_length) as usize];
        }
        self.num_bits = new_length;
        if let Some(hex) = tdi {
            self.tdi = read_hex_bytes(hex)?;
        }
        if let Some(hex) = tdo {
            self.tdo = read_hex_bytes(hex)?;
        }
        if let Some(hex) = mask {
            self.mask = read_hex_bytes(hex)?;
        }
        Ok(())
    }
}

#[derive(Default)]
struct ParseContext {
    data_head: BitStore,
    data_body: BitStore,
    data_tail: BitStore,
    insn_head: BitStore,
    insn_body: BitStore,
    insn_tail: BitStore,
    cur_length: u32,
    cur_mask_buf: Vec<u8>,
    mask_written: bool,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Op {
    Head,
    Tail,
    Body,
}

/// Parse a run of hex digit pairs into bytes, most-significant byte first.
fn read_hex_bytes(digits: &str) -> Result<Vec<u8>> {
    hex::decode(digits)
        .map_err(|e| Error::SvfParse(format!("bad hex field \"{digits}\": {e}")))
}

/// `shiftLeft`: shift `buf` (holding `num_bits` significant bits) left by
/// `shift_count` bits, growing the buffer as needed.
fn shift_left(buf: &[u8], num_bits: u32, shift_count: u32) -> Vec<u8> {
    let shift_bytes = (shift_count >> 3) as usize;
    let shift_bits = shift_count & 7;
    let mut result = buf.to_vec();

    if shift_bits != 0 {
        let at = |i: usize| -> u32 { buf.get(i).copied().unwrap_or(0) as u32 };
        let mut insignificant = num_bits & 7;
        if insignificant != 0 {
            insignificant = 8 - insignificant;
        }
        let n = buf.len();
        let mut newbuf = Vec::with_capacity(n + 1);
        let mut accum = at(0);
        let mut p = 0usize;
        if p < n {
            accum = (accum >> (8 - shift_bits)) & 0xFFFF;
            if shift_bits > insignificant {
                newbuf.push((accum & 0xFF) as u8);
            }
            accum = ((at(p) << 8) | at(p + 1)) & 0xFFFF;
            p += 1;
            while p < n {
                accum = (accum >> (8 - shift_bits)) & 0xFFFF;
                newbuf.push((accum & 0xFF) as u8);
                accum = ((at(p) << 8) | at(p + 1)) & 0xFFFF;
                p += 1;
            }
        }
        accum &= 0xFF00;
        accum = (accum >> (8 - shift_bits)) & 0xFFFF;
        newbuf.push((accum & 0xFF) as u8);
        result = newbuf;
    }

    if shift_bytes != 0 {
        result.extend(std::iter::repeat(0u8).take(shift_bytes));
    }
    result
}

/// Concatenate `head` (high-order) ∥ `body` ∥ `tail` (low-order) the way the
/// original `headTail()` does: MSB-first, with `head` shifted up to sit
/// above `body` and `tail` shifted down to sit below it. This is the
/// function `svf2csvf.c`'s own unit test (`testShift`/S1) checks directly —
/// its `0DE385C127` literal is *this* function's output, not yet byte-swapped
/// for the wire.
fn head_tail_msb_first(
    head_bits: u32,
    head: &[u8],
    body_bits: u32,
    body: &[u8],
    tail_bits: u32,
    tail: &[u8],
) -> Vec<u8> {
    if head_bits == 0 && tail_bits == 0 {
        return body.to_vec();
    }

    let mut data = shift_left(body, body_bits, head_bits);
    let data_bits = body_bits + head_bits;

    let dst_start = data.len() - head.len();
    for (d, s) in data[dst_start..].iter_mut().zip(head) {
        *d |= *s;
    }

    if tail_bits != 0 {
        let tail_shift = data_bits & 7;
        let tail_shifted = if tail_shift != 0 {
            shift_left(tail, tail_bits, tail_shift)
        } else {
            tail.to_vec()
        };
        let data_bits = data_bits + tail_bits;

        let mut bytes_from_tail = tail_shifted.len();
        let total_bytes = bits_to_bytes(data_bits) as usize;
        let mut newbuf = Vec::with_capacity(total_bytes);
        if total_bytes == data.len() + bytes_from_tail {
            newbuf.extend_from_slice(&tail_shifted);
            newbuf.push(data[0]);
        } else if total_bytes + 1 == data.len() + bytes_from_tail {
            bytes_from_tail -= 1;
            newbuf.extend_from_slice(&tail_shifted[..bytes_from_tail]);
            newbuf.push(tail_shifted[bytes_from_tail] | data[0]);
        } else {
            unreachable!("head/tail concatenation length mismatch");
        }
        newbuf.extend_from_slice(&data[1..]);
        data = newbuf;
    }

    data
}

/// Concatenate `head` ∥ `body` ∥ `tail` and byte-reverse the result, matching
/// `appendSwapped(headTail(...))`: every emitted shift payload — this one,
/// the headless case (a no-op `headTail`, so a plain reversal), and the XSVF
/// transformer's own `swap_bytes` — agrees on the same least-significant-
/// byte-first wire convention the player consumes.
fn concat_head_body_tail(
    head_bits: u32,
    head: &[u8],
    body_bits: u32,
    body: &[u8],
    tail_bits: u32,
    tail: &[u8],
) -> Vec<u8> {
    let mut data = head_tail_msb_first(head_bits, head, body_bits, body, tail_bits, tail);
    data.reverse();
    data
}

fn parse_number(s: &str) -> Result<(f64, &str)> {
    let end = s
        .find(|c: char| !(c.is_ascii_digit() || matches!(c, '.' | '-' | '+' | 'e' | 'E')))
        .unwrap_or(s.len());
    if end == 0 {
        return Err(Error::SvfParse(format!("expected a number in \"{s}\"")));
    }
    let value: f64 = s[..end]
        .parse()
        .map_err(|_| Error::SvfParse(format!("bad number: \"{}\"", &s[..end])))?;
    Ok((value, &s[end..]))
}

const RUNTEST_USAGE: &str =
    "RUNTEST must be of the form \"RUNTEST [IDLE] <number> TCK|SEC [<number> TCK|SEC] [ENDSTATE IDLE]\"";

/// Parse a `RUNTEST` statement's tail (after the `RUNTEST` keyword) into a
/// microsecond/clock count. Two counts may be given (e.g. a minimum TCK count
/// and a minimum SEC count); the larger, after unit conversion, wins.
fn parse_runtest(rest: &str) -> Result<u32> {
    let mut p = rest.trim_start();
    if let Some(r) = p.strip_prefix("IDLE") {
        p = r.trim_start();
    }

    let (mut count1, rem) = parse_number(p)?;
    p = rem.trim_start();
    p = if let Some(r) = p.strip_prefix("TCK") {
        r.trim_start()
    } else if let Some(r) = p.strip_prefix("SEC") {
        count1 *= 1_000_000.0;
        r.trim_start()
    } else {
        return Err(Error::SvfParse(RUNTEST_USAGE.into()));
    };

    if let Ok((mut count2, rem2)) = parse_number(p) {
        let mut rem2 = rem2.trim_start();
        if let Some(r) = rem2.strip_prefix("TCK") {
            rem2 = r.trim_start();
        } else if let Some(r) = rem2.strip_prefix("SEC") {
            count2 *= 1_000_000.0;
            rem2 = r.trim_start();
        }
        if count2 > count1 {
            count1 = count2;
        }
        p = rem2;
    }

    if let Some(r) = p.strip_prefix("ENDSTATE IDLE") {
        p = r;
    }
    p = p.trim_start();

    if !p.is_empty() {
        return Err(Error::SvfParse(RUNTEST_USAGE.into()));
    }
    Ok(count1 as u32)
}

/// Extract a `NAME (<hex>)` field, left-padding an odd digit count with a
/// leading zero nibble, and return the remaining text after the `)`.
fn extract_hex_field<'a>(stmt: &str, rest: &'a str, name: &str) -> Result<(String, &'a str)> {
    let rest = rest.trim_start();
    let inner = rest.strip_prefix('(').ok_or_else(|| {
        Error::SvfParse(format!("\"{stmt}\": expected {name} (<hex>)"))
    })?;
    let close = inner
        .find(')')
        .ok_or_else(|| Error::SvfParse(format!("\"{stmt}\": unterminated {name} (<hex>)")))?;
    let mut digits = inner[..close].to_string();
    if digits.len() % 2 != 0 {
        digits.insert(0, '0');
    }
    Ok((digits, &inner[close + 1..]))
}

fn parse_register_line(
    cxt: &mut ParseContext,
    stmt: &str,
    commands: &mut Vec<Command>,
    max_buf_size: &mut u32,
) -> Result<()> {
    let bytes = stmt.as_bytes();
    let is_data_reg = bytes[1] == b'D';
    let op = match bytes[0] {
        b'H' => Op::Head,
        b'T' => Op::Tail,
        _ => Op::Body,
    };

    let mut p = stmt[3..].trim_start();
    let digits_end = p.find(|c: char| !c.is_ascii_digit()).unwrap_or(p.len());
    if digits_end == 0 {
        return Err(Error::SvfParse(format!("\"{stmt}\": missing register length")));
    }
    let length: u32 = p[..digits_end]
        .parse()
        .map_err(|_| Error::SvfParse(format!("\"{stmt}\": bad register length")))?;
    p = p[digits_end..].trim_start();

    let mut tdi = None;
    let mut tdo = None;
    let mut mask = None;

    while !p.is_empty() {
        if let Some(rest) = p.strip_prefix("TDI") {
            let (field, rest) = extract_hex_field(stmt, rest, "TDI")?;
            tdi = Some(field);
            p = rest;
        } else if let Some(rest) = p.strip_prefix("SMASK") {
            // SMASK identifies which TDI bits the caller cares about driving;
            // the player has no concept of "don't drive this bit", so it's
            // parsed (to stay in lock-step with the field scanner) and
            // otherwise unused, matching the original assembler.
            let (_field, rest) = extract_hex_field(stmt, rest, "SMASK")?;
            p = rest;
        } else if let Some(rest) = p.strip_prefix("TDO") {
            let (field, rest) = extract_hex_field(stmt, rest, "TDO")?;
            tdo = Some(field);
            p = rest;
        } else if let Some(rest) = p.strip_prefix("MASK") {
            let (field, rest) = extract_hex_field(stmt, rest, "MASK")?;
            mask = Some(field);
            p = rest;
        } else {
            return Err(Error::SvfParse(format!("junk in \"{stmt}\"")));
        }
        p = p.trim_start();
    }

    if is_data_reg {
        {
            let store = match op {
                Op::Head => &mut cxt.data_head,
                Op::Tail => &mut cxt.data_tail,
                Op::Body => &mut cxt.data_body,
            };
            store.update(length, tdi.as_deref(), tdo.as_deref(), mask.as_deref())?;
        }
        if op != Op::Body {
            return Ok(());
        }

        let total_bits = cxt.data_head.num_bits + cxt.data_body.num_bits + cxt.data_tail.num_bits;
        check_size(total_bits)?;
        if total_bits != cxt.cur_length {
            cxt.cur_length = total_bits;
            commands.push(Command::SdrSize(cxt.cur_length));
        }

        let combined_mask = concat_head_body_tail(
            cxt.data_head.num_bits,
            &cxt.data_head.mask,
            cxt.data_body.num_bits,
            &cxt.data_body.mask,
            cxt.data_tail.num_bits,
            &cxt.data_tail.mask,
        );
        let zero_mask = combined_mask.iter().all(|&b| b == 0);
        if combined_mask != cxt.cur_mask_buf {
            cxt.cur_mask_buf = combined_mask;
            cxt.mask_written = false;
        }
        if !zero_mask && tdo.is_some() && !cxt.mask_written {
            commands.push(Command::TdoMask(cxt.cur_mask_buf.clone()));
            cxt.mask_written = true;
        }

        let tdi_concat = concat_head_body_tail(
            cxt.data_head.num_bits,
            &cxt.data_head.tdi,
            cxt.data_body.num_bits,
            &cxt.data_body.tdi,
            cxt.data_tail.num_bits,
            &cxt.data_tail.tdi,
        );
        if zero_mask || tdo.is_none() {
            commands.push(Command::Sdr(tdi_concat));
        } else {
            let tdo_concat = concat_head_body_tail(
                cxt.data_head.num_bits,
                &cxt.data_head.tdo,
                cxt.data_body.num_bits,
                &cxt.data_body.tdo,
                cxt.data_tail.num_bits,
                &cxt.data_tail.tdo,
            );
            *max_buf_size = (*max_buf_size).max(tdo_concat.len() as u32);
            commands.push(Command::SdrTdo {
                tdi: tdi_concat,
                tdo: tdo_concat,
            });
        }
    } else {
        {
            let store = match op {
                Op::Head => &mut cxt.insn_head,
                Op::Tail => &mut cxt.insn_tail,
                Op::Body => &mut cxt.insn_body,
            };
            store.update(length, tdi.as_deref(), tdo.as_deref(), mask.as_deref())?;
        }
        if op != Op::Body {
            return Ok(());
        }

        let total_bits = cxt.insn_head.num_bits + cxt.insn_body.num_bits + cxt.insn_tail.num_bits;
        check_size(total_bits)?;
        let tdi_concat = concat_head_body_tail(
            cxt.insn_head.num_bits,
            &cxt.insn_head.tdi,
            cxt.insn_body.num_bits,
            &cxt.insn_body.tdi,
            cxt.insn_tail.num_bits,
            &cxt.insn_tail.tdi,
        );
        commands.push(Command::Sir {
            bits: total_bits as u8,
            tdi: tdi_concat,
        });
    }
    Ok(())
}

fn parse_line(
    cxt: &mut ParseContext,
    stmt: &str,
    commands: &mut Vec<Command>,
    max_buf_size: &mut u32,
) -> Result<()> {
    if let Some(rest) = stmt.strip_prefix("RUNTEST") {
        let micros = parse_runtest(rest)?;
        commands.push(Command::RunTest(micros));
        return Ok(());
    }

    let bytes = stmt.as_bytes();
    if bytes.len() >= 4
        && matches!(bytes[0], b'H' | b'S' | b'T')
        && matches!(bytes[1], b'I' | b'D')
        && bytes[2] == b'R'
        && matches!(bytes[3], b' ' | b'\t')
    {
        return parse_register_line(cxt, stmt, commands, max_buf_size);
    }

    Err(Error::SvfParse(format!("unrecognised command \"{stmt}\"")))
}

fn starts_with_at(bytes: &[u8], p: usize, pat: &[u8]) -> bool {
    bytes.len() >= p + pat.len() && &bytes[p..p + pat.len()] == pat
}

fn skip_to_eol(bytes: &[u8], mut p: usize) -> usize {
    let n = bytes.len();
    while p < n && bytes[p] != b'\n' && bytes[p] != b'\r' {
        p += 1;
    }
    p + 1
}

fn is_skipped_line(bytes: &[u8], p: usize) -> bool {
    bytes[p] == b'!'
        || starts_with_at(bytes, p, b"//")
        || starts_with_at(bytes, p, b"TRST")
        || starts_with_at(bytes, p, b"END")
        || starts_with_at(bytes, p, b"STATE")
        || starts_with_at(bytes, p, b"FREQ")
}

/// Split the raw SVF text into complete statements (everything up to a `;`,
/// possibly spanning several physical lines), skipping blank lines, comments
/// (`!`, `//`), and the directives this compiler doesn't act on (`TRST`,
/// `ENDIR`/`ENDDR`, `STATE`, `FREQ`).
fn split_statements(bytes: &[u8]) -> Vec<String> {
    let mut out = Vec::new();
    let mut acc: Vec<u8> = Vec::new();
    let n = bytes.len();
    let mut p = 0usize;

    while p < n {
        if bytes[p] == b'\n' || bytes[p] == b'\r' {
            p += 1;
        } else if is_skipped_line(bytes, p) {
            p = skip_to_eol(bytes, p);
        } else {
            while p < n && (bytes[p] == b' ' || bytes[p] == b'\t') {
                p += 1;
            }
            let start = p;
            while p < n && bytes[p] != b'\n' && bytes[p] != b'\r' && bytes[p] != b';' {
                p += 1;
            }
            let got_semicolon = p < n && bytes[p] == b';';
            let mut end = p;
            while end > start && matches!(bytes[end - 1], b' ' | b'\t') {
                end -= 1;
            }
            acc.extend_from_slice(&bytes[start..end]);
            p = skip_to_eol(bytes, p);
            if got_semicolon {
                out.push(String::from_utf8_lossy(&acc).into_owned());
                acc.clear();
            }
        }
    }
    out
}

/// Compile SVF source text into intermediate, uncompressed CSVF bytes.
/// Returns the bytes and the largest per-shift TDO buffer seen, so callers
/// can size fixed buffers.
pub fn svf_to_csvf(svf_bytes: &[u8]) -> Result<(Vec<u8>, u32)> {
    let mut cxt = ParseContext::default();
    let mut commands = Vec::new();
    let mut max_buf_size = 0u32;

    for stmt in split_statements(svf_bytes) {
        parse_line(&mut cxt, &stmt, &mut commands, &mut max_buf_size)?;
    }
    commands.push(Command::Complete);

    let commands = crate::command::hoist_runtest(commands);
    let bytes = crate::command::serialize(&commands);
    Ok((bytes, max_buf_size))
}

#[cfg(test)]
mod tests {
    use super::*;

    // S1, matching `testShift` in the original's own unit tests: this is the
    // pre-swap `headTail` intermediate, not yet byte-reversed for the wire.
    #[test]
    fn head_tail_msb_first_example_s1() {
        let out = head_tail_msb_first(1, &[0x01], 32, &[0xF1, 0xC2, 0xE0, 0x93], 3, &[0x06]);
        assert_eq!(out, vec![0x0D, 0xE3, 0x85, 0xC1, 0x27]);
    }

    // Same inputs as S1, through the public entry point: `appendSwapped`
    // always follows `headTail` in the original, so the emitted bytes are
    // the S1 intermediate reversed.
    #[test]
    fn head_tail_concatenation_example_s1() {
        let out = concat_head_body_tail(1, &[0x01], 32, &[0xF1, 0xC2, 0xE0, 0x93], 3, &[0x06]);
        assert_eq!(out, vec![0x27, 0xC1, 0x85, 0xE3, 0x0D]);
    }

    #[test]
    fn head_tail_is_plain_reverse_when_both_empty() {
        let out = concat_head_body_tail(0, &[], 16, &[0xAB, 0xCD], 0, &[]);
        assert_eq!(out, vec![0xCD, 0xAB]);
    }

    #[test]
    fn simple_sir_compiles_to_single_command() {
        let svf = b"SIR 8 TDI (AA);\n";
        let (bytes, _) = svf_to_csvf(svf).unwrap();
        assert_eq!(bytes[0], crate::xsvf::opcode::XRUNTEST);
        assert!(bytes.contains(&crate::xsvf::opcode::XSIR));
        assert_eq!(*bytes.last().unwrap(), crate::xsvf::opcode::XCOMPLETE);
    }

    #[test]
    fn sdr_without_tdo_emits_plain_xsdr() {
        let svf = b"SDR 8 TDI (FF);\n";
        let (bytes, _) = svf_to_csvf(svf).unwrap();
        assert!(bytes.contains(&crate::xsvf::opcode::XSDRE));
        assert!(!bytes.contains(&crate::xsvf::opcode::XSDRTDO));
    }

    #[test]
    fn sdr_with_nonzero_mask_and_tdo_emits_xsdrtdo() {
        let svf = b"SDR 8 TDI (FF) TDO (00) MASK (FF);\n";
        let (bytes, _) = svf_to_csvf(svf).unwrap();
        assert!(bytes.contains(&crate::xsvf::opcode::XTDOMASK));
        assert!(bytes.contains(&crate::xsvf::opcode::XSDRTDO));
    }

    #[test]
    fn comments_and_directives_are_skipped() {
        let svf = b"! a comment\n// also a comment\nTRST ON;\nSTATE IDLE;\nFREQ 1E6;\nSIR 8 TDI (01);\n";
        let (bytes, _) = svf_to_csvf(svf).unwrap();
        assert!(bytes.contains(&crate::xsvf::opcode::XSIR));
    }

    #[test]
    fn malformed_runtest_fails() {
        let svf = b"RUNTEST 100 FOO;\n";
        assert!(matches!(svf_to_csvf(svf), Err(Error::SvfParse(_))));
    }

    #[test]
    fn unrecognised_command_fails() {
        let svf = b"BOGUS 1 2 3;\n";
        assert!(matches!(svf_to_csvf(svf), Err(Error::SvfParse(_))));
    }

    #[test]
    fn runtest_in_seconds_converts_to_microseconds() {
        let svf = b"RUNTEST 1.5E-3 SEC;\nSIR 8 TDI (01);\n";
        let (bytes, _) = svf_to_csvf(svf).unwrap();
        // 1.5ms -> 1500us, hoisted to immediately precede the SIR block
        let pos = bytes
            .windows(5)
            .position(|w| w[0] == crate::xsvf::opcode::XRUNTEST && u32::from_be_bytes([w[1], w[2], w[3], w[4]]) == 1500)
            .unwrap();
        assert!(pos < bytes.iter().position(|&b| b == crate::xsvf::opcode::XSIR).unwrap());
    }

    #[test]
    fn runtest_persists_across_blocks_until_changed() {
        let svf = b"RUNTEST 100 TCK;\nSIR 8 TDI (01);\nSDR 8 TDI (02);\nRUNTEST 200 TCK;\nSDR 8 TDI (03);\n";
        let (bytes, _) = svf_to_csvf(svf).unwrap();
        let count = bytes
            .iter()
            .enumerate()
            .filter(|&(i, &b)| b == crate::xsvf::opcode::XRUNTEST && (i == 0 || bytes[i - 1] != 0))
            .count();
        assert!(count >= 2);
    }
}
