/// Errors of the bus protocol engine.
///
/// None of them is fatal: frames that fail to decode are dropped and counted,
/// an exhausted history arena only disables deduplication for one slot.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Frame shorter than the 3-byte header.
    #[error("frame too short: {len} bytes")]
    TooShort { len: usize },
    /// More bytes than the read buffer holds arrived without an idle gap.
    #[error("frame overflow: more than {capacity} bytes without a frame boundary")]
    FrameOverflow { capacity: usize },
    /// Outgoing frame does not fit into the write buffer.
    #[error("frame too long for write buffer: {len} bytes, capacity {capacity}")]
    FrameTooLong { len: usize, capacity: usize },
    #[error("CRC mismatch - calculated={calculated:02X} received={received:02X}")]
    CrcMismatch { calculated: u8, received: u8 },
    /// Not enough room left in the history arena for a new slot.
    #[error(
        "history exhausted for packet type {packet_type:#04X}: {required} bytes required, {available} available"
    )]
    HistoryExhausted {
        packet_type: u8,
        required: usize,
        available: usize,
    },
    #[error("packet type {0:#04X} does not accept commands")]
    UnsupportedCommand(u8),
    #[error("Value out of range: {value:#X} does not fit into {size} bytes")]
    RangeError { value: u32, size: usize },
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

impl Error {
    /// Single byte code reported by the legacy gateway firmware, if it had one.
    pub fn legacy_code(&self) -> Option<u8> {
        match self {
            Error::HistoryExhausted { .. } => Some(0x40),
            _ => None,
        }
    }
}

/// A specialized `Result` type for the engine.
pub type Result<T> = std::result::Result<T, Error>;
