use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Header bytes in front of every payload: source, address, packet type.
pub const HEADER_LENGTH: usize = 3;

/// First header byte of a request sent by the main controller.
pub const SOURCE_MAIN_CONTROLLER: u8 = 0x00;
/// First header byte of a response (heat pump or auxiliary controller).
pub const SOURCE_RESPONSE: u8 = 0x40;
// Bits other than the response bit mark traffic we do not recognize.
const SOURCE_MASK: u8 = 0xBF;

/// Address of the heat pump.
pub const ADDRESS_HEAT_PUMP: u8 = 0x00;

pub const PACKET_TYPE_CLAIM: u8 = 0x30;
pub const PACKET_TYPE_IDENTITY: u8 = 0x31;
pub const PACKET_TYPE_COUNTER: u8 = 0xB8;
pub const PACKET_TYPE_RESTART: u8 = 0x12;
pub const RESTART_PAYLOAD_BYTE: usize = 12;
pub const RESTART_FLAG: u8 = 0x20;
/// Temperature setpoints; the only family with command hysteresis.
pub const PACKET_TYPE_SETPOINT: u8 = 0x36;

/// Polls the main controller sends to an auxiliary controller.
pub const CONTROL_PACKETS: TypeRange = TypeRange {
    first: 0x30,
    last: 0x3E,
};

// Value size per control packet type 0x30..=0x3E, 0 = no write support.
const PARAM_VALUE_SIZE: [usize; 15] = [0, 0, 0, 0, 0, 1, 2, 3, 4, 4, 1, 2, 3, 4, 0];

/// Payload sizes of the data packets 0x10..=0x16, main controller then heat pump.
const DATA_PAYLOAD_SIZE: [[usize; 7]; 2] = [
    [20, 8, 15, 3, 15, 6, 16],
    [20, 20, 20, 16, 19, 9, 9],
];
const DATA_PAYLOAD_FIRST: u8 = 0x10;

/// Inclusive range of packet types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TypeRange {
    pub first: u8,
    pub last: u8,
}

impl TypeRange {
    pub const fn new(first: u8, last: u8) -> Self {
        Self { first, last }
    }

    pub fn contains(&self, packet_type: u8) -> bool {
        (self.first..=self.last).contains(&packet_type)
    }

    pub fn width(&self) -> usize {
        usize::from(self.last.saturating_sub(self.first)) + 1
    }

    pub fn is_subset_of(&self, other: &TypeRange) -> bool {
        other.contains(self.first) && other.contains(self.last)
    }
}

impl fmt::Display for TypeRange {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:02X}..={:02X}", self.first, self.last)
    }
}

/// Value size of a writable packet type, `None` if the type takes no commands.
pub fn param_value_size(packet_type: u8) -> Option<usize> {
    if !CONTROL_PACKETS.contains(packet_type) {
        return None;
    }
    match PARAM_VALUE_SIZE[usize::from(packet_type - CONTROL_PACKETS.first)] {
        0 => None,
        size => Some(size),
    }
}

/// Known payload size of a data packet, if the packet type is documented.
pub fn known_payload_size(source: Source, packet_type: u8) -> Option<usize> {
    let row = match source {
        Source::MainController => 0,
        Source::HeatPump => 1,
        Source::AuxiliaryController | Source::Unknown(_) => return None,
    };
    let column = usize::from(packet_type.checked_sub(DATA_PAYLOAD_FIRST)?);
    DATA_PAYLOAD_SIZE[row].get(column).copied()
}

/// CRC generator and feed. A generator of 0 disables checking and appending.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Crc {
    pub generator: u8,
    pub feed: u8,
}

impl Default for Crc {
    fn default() -> Self {
        Self {
            generator: 0xD9,
            feed: 0x00,
        }
    }
}

impl Crc {
    pub fn enabled(&self) -> bool {
        self.generator != 0
    }

    /// Shifts the bytes in LSB first.
    pub fn compute(&self, bytes: &[u8]) -> u8 {
        let mut crc = self.feed;
        for &byte in bytes {
            let mut c = byte;
            for _ in 0..8 {
                if (crc ^ c) & 0x01 != 0 {
                    crc = (crc >> 1) ^ self.generator;
                } else {
                    crc >>= 1;
                }
                c >>= 1;
            }
        }
        crc
    }

    /// Checks the trailing CRC byte and returns the frame without it.
    pub fn validate<'a>(&self, frame: &'a [u8]) -> Result<&'a [u8]> {
        if !self.enabled() {
            return Ok(frame);
        }
        let Some((&received, body)) = frame.split_last() else {
            return Err(Error::TooShort { len: 0 });
        };
        let calculated = self.compute(body);
        if calculated != received {
            log::warn!(
                "Invalid CRC - calculated={:02X} received={:02X} frame={:02X?}",
                calculated,
                received,
                frame
            );
            return Err(Error::CrcMismatch {
                calculated,
                received,
            });
        }
        Ok(body)
    }

    /// Returns `frame` with a CRC byte appended, refusing frames over `capacity`.
    pub fn seal(&self, frame: &[u8], capacity: usize) -> Result<Vec<u8>> {
        let len = frame.len() + usize::from(self.enabled());
        if len > capacity {
            return Err(Error::FrameTooLong { len, capacity });
        }
        let mut tx_buffer = Vec::with_capacity(len);
        tx_buffer.extend_from_slice(frame);
        if self.enabled() {
            tx_buffer.push(self.compute(frame));
        }
        Ok(tx_buffer)
    }
}

/// Origin of a packet, decoded once from the first two header bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Source {
    HeatPump,
    MainController,
    AuxiliaryController,
    /// First header byte with bits set we do not know.
    Unknown(u8),
}

impl Source {
    fn decode(source: u8, address: u8) -> Self {
        if source & SOURCE_MASK != 0 {
            Source::Unknown(source)
        } else if source == SOURCE_MAIN_CONTROLLER {
            Source::MainController
        } else if is_auxiliary_address(address) {
            Source::AuxiliaryController
        } else {
            Source::HeatPump
        }
    }

    pub fn header_byte(&self) -> u8 {
        match self {
            Source::MainController => SOURCE_MAIN_CONTROLLER,
            Source::HeatPump | Source::AuxiliaryController => SOURCE_RESPONSE,
            Source::Unknown(byte) => *byte,
        }
    }
}

/// Auxiliary controllers answer on addresses 0xF0 and up.
pub fn is_auxiliary_address(address: u8) -> bool {
    address >= 0xF0
}

/// A classified bus frame. The CRC byte is already stripped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub source: Source,
    pub address: u8,
    pub packet_type: u8,
    pub payload: Vec<u8>,
    pub crc_valid: bool,
}

impl Packet {
    /// Splits a frame (without CRC) into header fields and payload.
    pub fn classify(frame: &[u8]) -> Result<Self> {
        if frame.len() < HEADER_LENGTH {
            log::warn!("Frame too short - len={} frame={:02X?}", frame.len(), frame);
            return Err(Error::TooShort { len: frame.len() });
        }
        Ok(Self {
            source: Source::decode(frame[0], frame[1]),
            address: frame[1],
            packet_type: frame[2],
            payload: frame[HEADER_LENGTH..].to_vec(),
            crc_valid: true,
        })
    }

    pub fn new(source: Source, address: u8, packet_type: u8, payload: &[u8]) -> Self {
        Self {
            source,
            address,
            packet_type,
            payload: payload.to_vec(),
            crc_valid: true,
        }
    }

    /// Header followed by payload, without CRC.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(HEADER_LENGTH + self.payload.len());
        bytes.push(self.source.header_byte());
        bytes.push(self.address);
        bytes.push(self.packet_type);
        bytes.extend_from_slice(&self.payload);
        bytes
    }

    /// Main controller request to the auxiliary slot `address`.
    pub fn is_poll_for(&self, address: u8) -> bool {
        self.source == Source::MainController
            && self.address == address
            && CONTROL_PACKETS.contains(self.packet_type)
    }

    /// Heat pump signals a restart in packet 0x12.
    pub fn is_restart(&self) -> bool {
        self.source == Source::HeatPump
            && self.packet_type == PACKET_TYPE_RESTART
            && self
                .payload
                .get(RESTART_PAYLOAD_BYTE)
                .is_some_and(|byte| byte & RESTART_FLAG != 0)
    }
}

/// Parameter record inside a 0x35..=0x3D payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParamRecord {
    pub param: u16,
    pub value: u32,
}

const FILLER_PARAM: u16 = 0xFFFF;

/// Decodes the `param_lo param_hi value...` records, skipping filler.
pub fn decode_params(packet_type: u8, payload: &[u8]) -> Vec<ParamRecord> {
    let Some(size) = param_value_size(packet_type) else {
        return Vec::new();
    };
    payload
        .chunks_exact(2 + size)
        .filter_map(|record| {
            let param = u16::from_le_bytes([record[0], record[1]]);
            if param == FILLER_PARAM {
                return None;
            }
            let value = record[2..]
                .iter()
                .rev()
                .fold(0u32, |acc, b| (acc << 8) | u32::from(*b));
            Some(ParamRecord { param, value })
        })
        .collect()
}

/// Writes one record at the start of a 0xFF filled payload.
pub fn encode_param(packet_type: u8, record: ParamRecord, payload: &mut [u8]) -> Result<()> {
    let size = param_value_size(packet_type).ok_or(Error::UnsupportedCommand(packet_type))?;
    if payload.len() < 2 + size {
        return Err(Error::FrameTooLong {
            len: 2 + size,
            capacity: payload.len(),
        });
    }
    payload[..2].copy_from_slice(&record.param.to_le_bytes());
    payload[2..2 + size].copy_from_slice(&record.value.to_le_bytes()[..size]);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sealed(bytes: &[u8]) -> Vec<u8> {
        Crc::default().seal(bytes, 32).unwrap()
    }

    #[test]
    fn crc_round_trip() {
        let crc = Crc::default();
        for payload in [&[0x00, 0x00, 0x12][..], &[0x40, 0x00, 0x10, 1, 2, 3, 4, 5]] {
            let frame = sealed(payload);
            assert_eq!(crc.validate(&frame).unwrap(), payload);
        }
    }

    #[test]
    fn crc_detects_single_bit_flip() {
        let crc = Crc::default();
        let frame = sealed(&[0x40, 0x00, 0x12, 0x01, 0x20, 0xFE, 0x00]);
        for byte in 0..frame.len() {
            for bit in 0..8 {
                let mut corrupted = frame.clone();
                corrupted[byte] ^= 1 << bit;
                assert!(matches!(
                    crc.validate(&corrupted),
                    Err(Error::CrcMismatch { .. })
                ));
            }
        }
    }

    #[test]
    fn crc_disabled() {
        let crc = Crc {
            generator: 0,
            feed: 0,
        };
        let frame = crc.seal(&[0x00, 0x00, 0x10], 32).unwrap();
        assert_eq!(frame, vec![0x00, 0x00, 0x10]);
        assert_eq!(crc.validate(&frame).unwrap(), &frame[..]);
    }

    #[test]
    fn seal_refuses_oversized_frame() {
        let err = Crc::default().seal(&[0; 32], 32).unwrap_err();
        assert!(matches!(err, Error::FrameTooLong { len: 33, capacity: 32 }));
    }

    #[test]
    fn classify_sources() {
        let p = Packet::classify(&[0x00, 0x00, 0x10, 0xAA]).unwrap();
        assert_eq!(p.source, Source::MainController);
        assert_eq!(p.packet_type, 0x10);
        assert_eq!(p.payload, vec![0xAA]);

        let p = Packet::classify(&[0x40, 0x00, 0x10]).unwrap();
        assert_eq!(p.source, Source::HeatPump);
        assert!(p.payload.is_empty());

        let p = Packet::classify(&[0x40, 0xF0, 0x30]).unwrap();
        assert_eq!(p.source, Source::AuxiliaryController);

        let p = Packet::classify(&[0x80, 0x00, 0x10]).unwrap();
        assert_eq!(p.source, Source::Unknown(0x80));

        let p = Packet::classify(&[0x00, 0x00, 0xEE]).unwrap();
        assert_eq!(p.packet_type, 0xEE);
    }

    #[test]
    fn classify_too_short() {
        assert!(matches!(
            Packet::classify(&[0x00, 0x00]),
            Err(Error::TooShort { len: 2 })
        ));
    }

    #[test]
    fn restart_flag() {
        let mut payload = vec![0; 15];
        payload[RESTART_PAYLOAD_BYTE] = RESTART_FLAG;
        assert!(Packet::new(Source::HeatPump, 0x00, 0x12, &payload).is_restart());
        assert!(!Packet::new(Source::MainController, 0x00, 0x12, &payload).is_restart());
        assert!(!Packet::new(Source::HeatPump, 0x00, 0x12, &[0; 15]).is_restart());
    }

    #[test]
    fn param_records() {
        assert_eq!(param_value_size(0x35), Some(1));
        assert_eq!(param_value_size(0x36), Some(2));
        assert_eq!(param_value_size(0x30), None);
        assert_eq!(param_value_size(0x10), None);

        let mut payload = vec![0xFF; 12];
        encode_param(0x36, ParamRecord { param: 0x0003, value: 0x00D2 }, &mut payload).unwrap();
        assert_eq!(&payload[..4], &[0x03, 0x00, 0xD2, 0x00]);
        assert_eq!(
            decode_params(0x36, &payload),
            vec![ParamRecord {
                param: 0x0003,
                value: 0x00D2
            }]
        );
    }

    #[test]
    fn known_sizes_sum() {
        let total: usize = (0x10..=0x16)
            .map(|t| {
                known_payload_size(Source::MainController, t).unwrap()
                    + known_payload_size(Source::HeatPump, t).unwrap()
            })
            .sum();
        assert_eq!(total, 196);
        assert_eq!(known_payload_size(Source::HeatPump, 0x17), None);
    }
}
