use thiserror::Error;

/// Fatal problems found while parsing an iNES image. Nothing is installed
/// when one of these is returned.
#[derive(Debug, Error)]
pub enum CartridgeError {
    #[error("ROM is too small to contain an iNES header ({0} bytes)")]
    TooSmall(usize),
    #[error("invalid iNES header magic, expected NES<EOF>")]
    BadMagic,
    #[error("NES 2.0 headers are not supported")]
    Nes2Unsupported,
    #[error("unsupported iNES version bits in flags 7 (${0:02X})")]
    UnsupportedVersion(u8),
    #[error("mapper {0} is not supported")]
    UnsupportedMapper(u8),
    #[error("ROM truncated: expected {expected} {section} bytes but only {actual} remain")]
    Truncated {
        section: &'static str,
        expected: usize,
        actual: usize,
    },
    #[error("invalid PRG ROM: empty payload")]
    EmptyPrg,
}

#[derive(Debug, Error)]
pub enum StateError {
    #[error("save-state magic mismatch")]
    BadMagic,
    #[error("save-state version {found} is not supported (expected {expected})")]
    Version { found: u16, expected: u16 },
    #[error("save-state was taken with mapper {saved}, installed cartridge uses mapper {installed}")]
    MapperMismatch { saved: u8, installed: u8 },
    #[error("save-state CHR-RAM size {saved} does not match cartridge ({installed})")]
    ChrSizeMismatch { saved: usize, installed: usize },
    #[error("save-state field out of range: {0}")]
    Corrupt(&'static str),
    #[error("failed to encode save-state: {0}")]
    Encode(#[from] bincode::error::EncodeError),
    #[error("failed to decode save-state: {0}")]
    Decode(#[from] bincode::error::DecodeError),
}

#[derive(Debug, Error)]
pub enum EmulatorError {
    /// Host sequencing bug: the core was driven before a cartridge was inserted.
    #[error("no cartridge installed")]
    NoCartridge,
    #[error(transparent)]
    Cartridge(#[from] CartridgeError),
    #[error(transparent)]
    State(#[from] StateError),
}
