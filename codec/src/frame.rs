//! Binary wire frames.
//!
//! Layout:
//!
//! ```text
//! +--------+------------+-------------+-----------------+----------+
//! | 0xAA   | command id | payload len | payload (0-255) | checksum |
//! +--------+------------+-------------+-----------------+----------+
//! ```
//!
//! The checksum is the sum of every preceding byte modulo 256.

use bytes::{BufMut, Bytes, BytesMut};

use crate::command::{CMD_ADJUST_SETTING, CMD_MOVE, Command};
use crate::error::{Error, Result};

/// First byte of every frame.
pub const FRAME_HEADER: u8 = 0xAA;

/// Largest payload the length byte can describe.
pub const MAX_PAYLOAD_LEN: usize = u8::MAX as usize;

/// Header, id, length and checksum bytes.
pub const FRAME_OVERHEAD: usize = 4;

/// A single encoded command frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    command_id: u8,
    payload: Bytes,
    checksum: u8,
}

impl Frame {
    /// Builds a frame, computing its checksum.
    pub fn new(command_id: u8, payload: impl Into<Bytes>) -> Result<Self> {
        let payload = payload.into();
        if payload.len() > MAX_PAYLOAD_LEN {
            return Err(Error::PayloadTooLarge(payload.len()));
        }
        let checksum = checksum(FRAME_HEADER, command_id, &payload);
        Ok(Self {
            command_id,
            payload,
            checksum,
        })
    }

    pub fn header(&self) -> u8 {
        FRAME_HEADER
    }

    pub fn command_id(&self) -> u8 {
        self.command_id
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    pub fn payload_len(&self) -> u8 {
        // Bounded by `new`.
        self.payload.len() as u8
    }

    pub fn checksum(&self) -> u8 {
        self.checksum
    }

    /// Total encoded size in bytes.
    pub fn encoded_len(&self) -> usize {
        FRAME_OVERHEAD + self.payload.len()
    }

    /// Serializes the frame for the serial link.
    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.encoded_len());
        buf.put_u8(FRAME_HEADER);
        buf.put_u8(self.command_id);
        buf.put_u8(self.payload_len());
        buf.put_slice(&self.payload);
        buf.put_u8(self.checksum);
        buf.freeze()
    }

    /// Decodes one frame from the start of `buf`.
    ///
    /// Returns the frame and the number of bytes consumed.
    pub fn decode(buf: &[u8]) -> Result<(Frame, usize)> {
        if buf.len() < FRAME_OVERHEAD - 1 {
            return Err(Error::Incomplete {
                needed: FRAME_OVERHEAD - buf.len(),
            });
        }
        if buf[0] != FRAME_HEADER {
            return Err(Error::InvalidHeader(buf[0]));
        }
        let command_id = buf[1];
        let len = buf[2] as usize;
        let total = FRAME_OVERHEAD + len;
        if buf.len() < total {
            return Err(Error::Incomplete {
                needed: total - buf.len(),
            });
        }

        let payload = Bytes::copy_from_slice(&buf[3..3 + len]);
        let got = buf[total - 1];
        let expected = checksum(FRAME_HEADER, command_id, &payload);
        if got != expected {
            return Err(Error::ChecksumMismatch { expected, got });
        }

        Ok((
            Frame {
                command_id,
                payload,
                checksum: got,
            },
            total,
        ))
    }
}

/// Additive checksum over header, id, length and payload.
pub fn checksum(header: u8, command_id: u8, payload: &[u8]) -> u8 {
    payload.iter().fold(
        header
            .wrapping_add(command_id)
            .wrapping_add(payload.len() as u8),
        |acc, b| acc.wrapping_add(*b),
    )
}

/// Encodes a command into a frame.
///
/// Pure: no I/O, no shared state.
pub fn encode(command: &Command) -> Result<Frame> {
    match command {
        Command::Move { direction, speed } => {
            Frame::new(CMD_MOVE, Bytes::from(vec![direction.code(), *speed]))
        }
        Command::AdjustSetting { value } => {
            Frame::new(CMD_ADJUST_SETTING, Bytes::copy_from_slice(&value.to_be_bytes()))
        }
        Command::Other { kind } => Err(Error::UnsupportedCommand(kind.clone())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::Direction;

    #[test]
    fn encode_move_forward() {
        let cmd = Command::parse(r#"{"type":"move","direction":"W","speed":50}"#).unwrap();
        let frame = encode(&cmd).unwrap();
        assert_eq!(&frame.to_bytes()[..], &[0xAA, 0x01, 0x02, 0x57, 0x32, 0x36]);
    }

    #[test]
    fn encode_adjust_big_endian() {
        let cmd = Command::parse(r#"{"type":"adjustKL","value":"300"}"#).unwrap();
        let frame = encode(&cmd).unwrap();
        assert_eq!(frame.command_id(), 0x02);
        assert_eq!(frame.payload(), &[0x01, 0x2C]);
        assert_eq!(frame.payload_len(), 2);
    }

    #[test]
    fn encode_unknown_direction_uses_sentinel() {
        let cmd = Command::Move {
            direction: Direction::from_symbol("Q"),
            speed: 10,
        };
        let frame = encode(&cmd).unwrap();
        assert_eq!(frame.payload(), &[0x00, 10]);
    }

    #[test]
    fn encode_unsupported() {
        let cmd = Command::Other {
            kind: "honk".into(),
        };
        assert_eq!(
            encode(&cmd),
            Err(Error::UnsupportedCommand("honk".to_string()))
        );
    }

    #[test]
    fn payload_limit() {
        assert!(Frame::new(0x10, vec![0u8; 255]).is_ok());
        assert_eq!(
            Frame::new(0x10, vec![0u8; 256]),
            Err(Error::PayloadTooLarge(256))
        );
    }

    #[test]
    fn checksum_wraps() {
        let frame = Frame::new(0xFF, vec![0xFF, 0xFF]).unwrap();
        let expected = (0xAAu32 + 0xFF + 0x02 + 0xFF + 0xFF) % 256;
        assert_eq!(frame.checksum() as u32, expected);
    }

    #[test]
    fn move_checksum_holds_for_every_speed_and_direction() {
        for symbol in ["W", "A", "S", "D", "X"] {
            for speed in 0..=255u8 {
                let cmd = Command::Move {
                    direction: Direction::from_symbol(symbol),
                    speed,
                };
                let bytes = encode(&cmd).unwrap().to_bytes();
                let (frame, used) = Frame::decode(&bytes).unwrap();
                assert_eq!(used, bytes.len());
                let sum: u32 = 0xAA
                    + frame.command_id() as u32
                    + frame.payload_len() as u32
                    + frame.payload().iter().map(|b| *b as u32).sum::<u32>();
                assert_eq!(frame.checksum() as u32, sum % 256);
            }
        }
    }

    #[test]
    fn decode_errors() {
        assert!(matches!(
            Frame::decode(&[0xAA]),
            Err(Error::Incomplete { .. })
        ));
        assert_eq!(
            Frame::decode(&[0xAB, 0x01, 0x00, 0xAC]),
            Err(Error::InvalidHeader(0xAB))
        );
        assert_eq!(
            Frame::decode(&[0xAA, 0x01, 0x02, 0x57]),
            Err(Error::Incomplete { needed: 2 })
        );
        assert_eq!(
            Frame::decode(&[0xAA, 0x01, 0x02, 0x57, 0x32, 0x21]),
            Err(Error::ChecksumMismatch {
                expected: 0x36,
                got: 0x21
            })
        );
    }

    #[test]
    fn decode_consumes_one_frame() {
        let mut stream = encode(&Command::AdjustSetting { value: 7 })
            .unwrap()
            .to_bytes()
            .to_vec();
        stream.extend_from_slice(&[0xAA, 0x01]);
        let (frame, used) = Frame::decode(&stream).unwrap();
        assert_eq!(frame.payload(), &[0x00, 0x07]);
        assert_eq!(used, 6);
    }
}
