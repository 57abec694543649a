use jtag_io::SpaceHex;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("SVF parse error: {0}")]
    SvfParse(String),

    #[error("unsupported XSVF command 0x{0:02X}")]
    UnsupportedCommand(u8),

    #[error("unsupported XSVF data: {0}")]
    UnsupportedData(String),

    #[error("xsdrsize {bits} bits exceeds the {max_bits}-bit buffer limit")]
    UnsupportedSize { bits: u32, max_bits: u32 },

    #[error("bad CSVF header byte 0x{0:02X}, expected 0x00")]
    HeaderError(u8),

    #[error("unknown CSVF command 0x{0:02X}")]
    UnknownCommand(u8),

    #[error("XSDRTDO compare mismatch\n  got:      {got}\n  mask:     {mask}\n  expected: {expected}")]
    Compare {
        got: String,
        mask: String,
        expected: String,
    },

    #[error("JTAG driver error")]
    DriverError(#[source] Box<dyn std::error::Error + Send + Sync + 'static>),

    #[error("internal error: {0}")]
    InternalError(String),
}

impl Error {
    pub(crate) fn compare(got: &[u8], mask: &[u8], expected: &[u8]) -> Self {
        Error::Compare {
            got: SpaceHex(got).to_string(),
            mask: SpaceHex(mask).to_string(),
            expected: SpaceHex(expected).to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
