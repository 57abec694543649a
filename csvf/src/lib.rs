//! SVF/XSVF → CSVF compiler, compressor, and player (§2).
//!
//! Data flows from either an SVF text file ([`svf_to_csvf`]) or an XSVF
//! binary file ([`xsvf_to_csvf`]) into an intermediate, uncompressed CSVF
//! byte stream, which [`compress`] turns into the zero-run-elided format the
//! player's [`Decompressor`] consumes. [`play`] interprets the (compressed or
//! uncompressed, see [`codec::decompress_n`]) stream against a
//! [`jtag_io::JtagDriver`].

pub mod bytestream;
pub mod codec;
pub mod command;
pub mod error;
pub mod player;
pub mod svf;
pub mod xsvf;

pub use codec::{Decompressor, compress, decompress_n};
pub use command::Command;
pub use error::{Error, Result};
pub use player::play;
pub use svf::svf_to_csvf;
pub use xsvf::xsvf_to_csvf;
