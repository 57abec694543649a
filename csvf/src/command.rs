//! Intermediate command representation sitting between the SVF assembler /
//! XSVF transformer and CSVF byte serialization (§4.3).
//!
//! Working with a `Vec<Command>` instead of a raw byte buffer lets the
//! XRUNTEST-hoisting canonicalization run as a pure, testable transform
//! rather than the pointer-indexing pass the format was originally
//! compiled with.

use crate::xsvf::opcode;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    RunTest(u32),
    SdrSize(u32),
    TdoMask(Vec<u8>),
    /// A shift with no TDO compare. The original format's bare `XSDR` opcode
    /// is never handled by the player's own dispatch, so this always
    /// serializes to `XSDRE` (a no-compare shift is indistinguishable from
    /// one that merely isn't followed by another shift of the same chain).
    Sdr(Vec<u8>),
    SdrTdo {
        tdi: Vec<u8>,
        tdo: Vec<u8>,
    },
    Sir {
        bits: u8,
        tdi: Vec<u8>,
    },
    State(u8),
    Complete,
}

impl Command {
    /// True for the three commands that mark the end of a shift block: the
    /// point after which an immediately-following `RUNTEST` line applies
    /// retroactively to everything since the previous shift block.
    fn ends_shift_block(&self) -> bool {
        matches!(self, Command::Sdr(_) | Command::SdrTdo { .. } | Command::Sir { .. })
    }
}

/// Hoist each block's effective run-test value (explicit trailing `RunTest`,
/// or an implicit zero when absent) to immediately precede that block,
/// deduplicating against whatever value is already in effect.
///
/// A "block" is the run of commands from just after the previous shift
/// command up to and including the next `Sdr`/`SdrTdo`/`Sir`. If the command
/// right after a block is a `RunTest`, that value governs the block and is
/// consumed; otherwise the block is governed by an implicit zero.
pub fn hoist_runtest(commands: Vec<Command>) -> Vec<Command> {
    let mut out = Vec::with_capacity(commands.len() + 4);
    let mut last_emitted: Option<u32> = None;
    let mut block: Vec<Command> = Vec::new();
    let mut iter = commands.into_iter().peekable();

    while let Some(cmd) = iter.next() {
        if cmd == Command::Complete {
            out.append(&mut block);
            out.push(Command::Complete);
            break;
        }

        let is_terminal = cmd.ends_shift_block();
        block.push(cmd);
        if !is_terminal {
            continue;
        }

        let effective = if let Some(Command::RunTest(_)) = iter.peek() {
            let Some(Command::RunTest(v)) = iter.next() else {
                unreachable!()
            };
            v
        } else {
            0
        };

        if last_emitted != Some(effective) {
            out.push(Command::RunTest(effective));
            last_emitted = Some(effective);
        }
        out.append(&mut block);
    }

    out
}

/// Serialize a canonicalized command stream into uncompressed CSVF bytes.
pub fn serialize(commands: &[Command]) -> Vec<u8> {
    let mut out = Vec::new();
    for cmd in commands {
        match cmd {
            Command::RunTest(us) => {
                out.push(opcode::XRUNTEST);
                out.extend_from_slice(&us.to_be_bytes());
            }
            Command::SdrSize(bits) => {
                out.push(opcode::XSDRSIZE);
                out.extend_from_slice(&bits.to_be_bytes());
            }
            Command::TdoMask(bytes) => {
                out.push(opcode::XTDOMASK);
                out.extend_from_slice(bytes);
            }
            Command::Sdr(tdi) => {
                out.push(opcode::XSDRE);
                out.extend_from_slice(tdi);
            }
            Command::SdrTdo { tdi, tdo } => {
                out.push(opcode::XSDRTDO);
                out.extend_from_slice(tdo);
                out.extend_from_slice(tdi);
            }
            Command::Sir { bits, tdi } => {
                out.push(opcode::XSIR);
                out.push(*bits);
                out.extend_from_slice(tdi);
            }
            Command::State(s) => {
                out.push(opcode::XSTATE);
                out.push(*s);
            }
            Command::Complete => out.push(opcode::XCOMPLETE),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn explicit_runtest_is_hoisted_before_its_block() {
        let input = vec![
            Command::Sir {
                bits: 8,
                tdi: vec![0xAA],
            },
            Command::RunTest(1000),
            Command::Complete,
        ];
        let out = hoist_runtest(input);
        assert_eq!(
            out,
            vec![
                Command::RunTest(1000),
                Command::Sir {
                    bits: 8,
                    tdi: vec![0xAA],
                },
                Command::Complete,
            ]
        );
    }

    #[test]
    fn implicit_zero_runtest_only_emitted_once() {
        let input = vec![
            Command::Sir {
                bits: 8,
                tdi: vec![0x01],
            },
            Command::Sdr(vec![0x02]),
            Command::Complete,
        ];
        let out = hoist_runtest(input);
        // both blocks share the implicit-zero runtest, so it's hoisted once
        assert_eq!(
            out,
            vec![
                Command::RunTest(0),
                Command::Sir {
                    bits: 8,
                    tdi: vec![0x01]
                },
                Command::Sdr(vec![0x02]),
                Command::Complete,
            ]
        );
    }

    #[test]
    fn runtest_not_reemitted_when_unchanged() {
        let input = vec![
            Command::Sir {
                bits: 8,
                tdi: vec![0x01],
            },
            Command::RunTest(500),
            Command::Sdr(vec![0x02]),
            Command::RunTest(500),
            Command::Complete,
        ];
        let out = hoist_runtest(input);
        assert_eq!(out.iter().filter(|c| matches!(c, Command::RunTest(_))).count(), 1);
        assert_eq!(out[0], Command::RunTest(500));
    }

    #[test]
    fn runtest_reemitted_when_value_changes() {
        let input = vec![
            Command::Sir {
                bits: 8,
                tdi: vec![0x01],
            },
            Command::RunTest(500),
            Command::Sdr(vec![0x02]),
            Command::RunTest(1000),
            Command::Complete,
        ];
        let out = hoist_runtest(input);
        let positions: Vec<u32> = out
            .iter()
            .filter_map(|c| match c {
                Command::RunTest(v) => Some(*v),
                _ => None,
            })
            .collect();
        assert_eq!(positions, vec![500, 1000]);
    }

    #[test]
    fn serialize_round_trip_shapes() {
        let cmds = vec![
            Command::SdrSize(8),
            Command::TdoMask(vec![0xFF]),
            Command::SdrTdo {
                tdi: vec![0xAA],
                tdo: vec![0x55],
            },
            Command::Complete,
        ];
        let bytes = serialize(&cmds);
        assert_eq!(
            bytes,
            vec![
                super::opcode::XSDRSIZE,
                0,
                0,
                0,
                8,
                super::opcode::XTDOMASK,
                0xFF,
                super::opcode::XSDRTDO,
                0x55,
                0xAA,
                super::opcode::XCOMPLETE,
            ]
        );
    }
}
