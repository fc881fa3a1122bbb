//! Frame codec for the controller serial protocol
//!
//! Data frames are laid out as:
//!
//! ```text
//! +-----+-----+-----+------+-----------------+-----+
//! | SOF | LEN | DIR | FUNC | args[0..LEN-2]  | CHK |
//! +-----+-----+-----+------+-----------------+-----+
//! ```
//!
//! - `SOF` is the start-of-frame marker (0x01)
//! - `LEN` counts `DIR`, `FUNC` and the arguments
//! - `DIR` is 0x00 for requests and 0x01 for responses
//! - `CHK` is the XOR of every byte from `LEN` through the last argument
//!
//! Outside a data frame the link carries single control bytes: `ACK` (0x06),
//! `NAK` (0x15) and `CAN` (0x18).
//!
//! [`FrameReader`] accumulates raw reads and yields control bytes, complete
//! frames, and corruption events, resynchronizing on the next `SOF` after
//! any framing or checksum failure.

use bytes::{Buf, Bytes, BytesMut};
use thiserror::Error;
use tracing::{trace, warn};

use crate::config::{ACK, CAN, MAX_FRAME_PAYLOAD, NAK, SOF};
use crate::error::DriverError;
use crate::function::FunctionId;

/// Bytes surrounding the `LEN` counted region: SOF, LEN and CHK
const FRAME_OVERHEAD: usize = 3;

/// Smallest legal length byte (direction + function)
const MIN_LEN: u8 = 2;

/// Errors produced while decoding a single frame
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FrameError {
    /// Frame does not start with SOF
    #[error("missing start-of-frame marker, got 0x{0:02X}")]
    MissingStart(u8),

    /// Length byte cannot describe a frame
    #[error("invalid length byte {0}")]
    InvalidLength(u8),

    /// Buffer ends before the declared frame does
    #[error("truncated frame: need {need} bytes, have {have}")]
    Truncated {
        /// Bytes the length byte promises
        need: usize,
        /// Bytes available
        have: usize,
    },

    /// Computed checksum differs from the trailing byte
    #[error("checksum mismatch: expected 0x{expected:02X}, got 0x{actual:02X}")]
    Checksum {
        /// Checksum computed over the frame
        expected: u8,
        /// Checksum byte received
        actual: u8,
    },

    /// Direction byte is neither request nor response
    #[error("invalid direction byte 0x{0:02X}")]
    InvalidDirection(u8),

    /// Byte outside a frame that is not a control code
    #[error("unexpected byte 0x{0:02X} outside a frame")]
    UnexpectedByte(u8),

    /// Payload is empty (no function identifier)
    #[error("empty payload")]
    EmptyPayload,

    /// Payload exceeds the frame maximum
    #[error("payload of {size} bytes exceeds frame maximum of {max}")]
    PayloadTooLarge {
        /// Payload length
        size: usize,
        /// Maximum payload length
        max: usize,
    },
}

impl FrameError {
    /// Whether this is a checksum failure (answered with NAK)
    pub fn is_checksum(&self) -> bool {
        matches!(self, FrameError::Checksum { .. })
    }
}

impl From<FrameError> for DriverError {
    fn from(err: FrameError) -> Self {
        match err {
            FrameError::Checksum { expected, actual } => DriverError::Checksum { expected, actual },
            FrameError::PayloadTooLarge { size, max } => DriverError::PayloadTooLarge { size, max },
            FrameError::EmptyPayload => DriverError::InvalidArgument(err.to_string()),
            other => DriverError::Framing(other.to_string()),
        }
    }
}

/// Classification of a single byte seen outside a data frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlByte {
    /// Start of a data frame
    StartOfFrame,
    /// Previous frame accepted
    Ack,
    /// Previous frame rejected (checksum)
    Nak,
    /// Previous frame dropped (collision)
    Cancel,
    /// Anything else
    Unknown(u8),
}

impl ControlByte {
    /// Wire value
    pub fn as_u8(self) -> u8 {
        match self {
            ControlByte::StartOfFrame => SOF,
            ControlByte::Ack => ACK,
            ControlByte::Nak => NAK,
            ControlByte::Cancel => CAN,
            ControlByte::Unknown(b) => b,
        }
    }
}

/// Classify a byte received outside a data frame
pub fn classify(byte: u8) -> ControlByte {
    match byte {
        SOF => ControlByte::StartOfFrame,
        ACK => ControlByte::Ack,
        NAK => ControlByte::Nak,
        CAN => ControlByte::Cancel,
        other => ControlByte::Unknown(other),
    }
}

/// Direction of a data frame
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Direction {
    /// Unsolicited or host-originated request / controller callback
    Request = 0x00,
    /// Response to a host request
    Response = 0x01,
}

impl Direction {
    /// Parse a direction byte
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x00 => Some(Direction::Request),
            0x01 => Some(Direction::Response),
            _ => None,
        }
    }
}

/// A validated data frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Request or response
    pub direction: Direction,
    /// Function identifier byte
    pub function: u8,
    /// Arguments following the function identifier
    pub args: Bytes,
    /// Validated checksum
    pub checksum: u8,
}

impl Frame {
    /// Build a frame, computing its checksum
    pub fn new(direction: Direction, function: u8, args: impl Into<Bytes>) -> Self {
        let args = args.into();
        let len = (args.len() + MIN_LEN as usize) as u8;
        let checksum = checksum(
            [len, direction as u8, function]
                .iter()
                .chain(args.iter())
                .copied(),
        );
        Self {
            direction,
            function,
            args,
            checksum,
        }
    }

    /// Known function identifier, if any
    pub fn function_id(&self) -> Option<FunctionId> {
        FunctionId::from_u8(self.function)
    }

    /// Argument byte at `index`
    pub fn arg(&self, index: usize) -> Option<u8> {
        self.args.get(index).copied()
    }

    /// Serialize back to wire bytes
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut payload = Vec::with_capacity(self.args.len() + 1);
        payload.push(self.function);
        payload.extend_from_slice(&self.args);
        // Frames built through `new` or `decode` always fit
        encode(self.direction, &payload).unwrap_or_default()
    }
}

/// XOR of every byte in the run
pub fn checksum(bytes: impl IntoIterator<Item = u8>) -> u8 {
    bytes.into_iter().fold(0u8, |acc, b| acc ^ b)
}

/// Encode a payload (function identifier + arguments) as a data frame
pub fn encode(direction: Direction, payload: &[u8]) -> Result<Vec<u8>, FrameError> {
    if payload.is_empty() {
        return Err(FrameError::EmptyPayload);
    }
    if payload.len() > MAX_FRAME_PAYLOAD {
        return Err(FrameError::PayloadTooLarge {
            size: payload.len(),
            max: MAX_FRAME_PAYLOAD,
        });
    }

    let len = (payload.len() + 1) as u8;
    let mut frame = Vec::with_capacity(payload.len() + FRAME_OVERHEAD + 1);
    frame.push(SOF);
    frame.push(len);
    frame.push(direction as u8);
    frame.extend_from_slice(payload);
    frame.push(checksum(frame[1..].iter().copied()));
    Ok(frame)
}

/// Decode a complete data frame starting at its SOF byte
///
/// Trailing bytes after the declared frame are ignored.
pub fn decode(bytes: &[u8]) -> Result<Frame, FrameError> {
    let first = *bytes.first().ok_or(FrameError::Truncated { need: 1, have: 0 })?;
    if first != SOF {
        return Err(FrameError::MissingStart(first));
    }

    let len = *bytes.get(1).ok_or(FrameError::Truncated {
        need: 2,
        have: bytes.len(),
    })?;
    if len < MIN_LEN {
        return Err(FrameError::InvalidLength(len));
    }

    let total = len as usize + FRAME_OVERHEAD;
    if bytes.len() < total {
        return Err(FrameError::Truncated {
            need: total,
            have: bytes.len(),
        });
    }

    let body = &bytes[1..total - 1];
    let expected = checksum(body.iter().copied());
    let actual = bytes[total - 1];
    if expected != actual {
        return Err(FrameError::Checksum { expected, actual });
    }

    let direction = Direction::from_u8(body[1]).ok_or(FrameError::InvalidDirection(body[1]))?;

    Ok(Frame {
        direction,
        function: body[2],
        args: Bytes::copy_from_slice(&body[3..]),
        checksum: actual,
    })
}

/// Item produced by [`FrameReader`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    /// A single control byte (ACK/NAK/CAN)
    Control(ControlByte),
    /// A validated data frame
    Frame(Frame),
    /// A corrupt frame or stray byte; the reader is now resynchronizing
    Corrupt(FrameError),
    /// Bytes dropped while resynchronizing
    Discarded(usize),
}

/// Accumulates raw bytes and splits them into control bytes and frames
#[derive(Debug, Default)]
pub struct FrameReader {
    buffer: BytesMut,
    resyncing: bool,
}

impl FrameReader {
    /// Create an empty reader
    pub fn new() -> Self {
        Self {
            buffer: BytesMut::with_capacity(MAX_FRAME_PAYLOAD * 2),
            resyncing: false,
        }
    }

    /// Append bytes read from the transport
    pub fn push(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// Whether bytes are being discarded until the next SOF
    pub fn is_resyncing(&self) -> bool {
        self.resyncing
    }

    /// Whether part of a frame is buffered
    pub fn has_partial(&self) -> bool {
        !self.buffer.is_empty()
    }

    /// Bytes currently buffered
    pub fn buffered_len(&self) -> usize {
        self.buffer.len()
    }

    /// Drop a partial frame left behind by a quiet link
    ///
    /// A full read timeout passed without bytes, so the next byte starts a
    /// fresh frame. Returns the number of bytes dropped.
    pub fn abandon_partial(&mut self) -> usize {
        let dropped = self.buffer.len();
        self.buffer.clear();
        self.resyncing = false;
        dropped
    }

    /// Forget all buffered state
    pub fn reset(&mut self) {
        self.buffer.clear();
        self.resyncing = false;
    }

    /// Produce the next item, or `None` when more bytes are needed
    pub fn next_inbound(&mut self) -> Option<Inbound> {
        if self.resyncing {
            match self.buffer.iter().position(|&b| b == SOF) {
                Some(0) => {
                    self.resyncing = false;
                }
                Some(pos) => {
                    self.buffer.advance(pos);
                    self.resyncing = false;
                    trace!(discarded = pos, "Resynchronized on start of frame");
                    return Some(Inbound::Discarded(pos));
                }
                None => {
                    let discarded = self.buffer.len();
                    self.buffer.clear();
                    if discarded == 0 {
                        return None;
                    }
                    return Some(Inbound::Discarded(discarded));
                }
            }
        }

        let first = *self.buffer.first()?;
        match classify(first) {
            ControlByte::StartOfFrame => self.next_frame(),
            ControlByte::Unknown(b) => {
                warn!(byte = b, "Unexpected byte outside frame");
                self.resyncing = true;
                Some(Inbound::Corrupt(FrameError::UnexpectedByte(b)))
            }
            control => {
                self.buffer.advance(1);
                Some(Inbound::Control(control))
            }
        }
    }

    fn next_frame(&mut self) -> Option<Inbound> {
        let len = *self.buffer.get(1)?;
        if len < MIN_LEN {
            // Drop the SOF so the scan moves past this frame
            self.buffer.advance(1);
            self.resyncing = true;
            return Some(Inbound::Corrupt(FrameError::InvalidLength(len)));
        }

        let total = len as usize + FRAME_OVERHEAD;
        if self.buffer.len() < total {
            trace!(
                have = self.buffer.len(),
                need = total,
                "Waiting for complete frame"
            );
            return None;
        }

        let raw = self.buffer.split_to(total);
        match decode(&raw) {
            Ok(frame) => Some(Inbound::Frame(frame)),
            Err(err) => {
                self.resyncing = true;
                Some(Inbound::Corrupt(err))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_send_data_example_layout() {
        let frame = encode(Direction::Request, &[0x13, 0x01, 0x02, 0x03]).unwrap();
        assert_eq!(frame[0], SOF);
        assert_eq!(frame[1], 5);
        assert_eq!(frame[2], 0x00);
        assert_eq!(frame[3], 0x13);
        assert_eq!(&frame[4..7], &[0x01, 0x02, 0x03]);
        assert_eq!(frame[7], 5 ^ 0x00 ^ 0x13 ^ 0x01 ^ 0x02 ^ 0x03);
        assert_eq!(frame.len(), 8);
    }

    #[test]
    fn test_roundtrip_boundary_lengths() {
        for len in [1usize, 2, 64, MAX_FRAME_PAYLOAD] {
            let payload: Vec<u8> = (0..len).map(|i| (i * 7) as u8).collect();
            let bytes = encode(Direction::Response, &payload).unwrap();
            let frame = decode(&bytes).unwrap();
            assert_eq!(frame.direction, Direction::Response);
            assert_eq!(frame.function, payload[0]);
            assert_eq!(frame.args.as_ref(), &payload[1..]);
            assert_eq!(frame.to_bytes(), bytes);
        }
    }

    #[test]
    fn test_encode_rejects_oversized_payload() {
        let payload = vec![0u8; MAX_FRAME_PAYLOAD + 1];
        assert!(matches!(
            encode(Direction::Request, &payload),
            Err(FrameError::PayloadTooLarge { .. })
        ));
        assert_eq!(
            encode(Direction::Request, &[]),
            Err(FrameError::EmptyPayload)
        );
    }

    #[test]
    fn test_single_bit_flip_is_checksum_error() {
        let bytes = encode(Direction::Request, &[0x04, 0x00, 0x05, 0x03, 0x20, 0x03, 0xFF]).unwrap();
        // Flip every bit of every payload byte in turn
        for index in 3..bytes.len() - 1 {
            for bit in 0..8 {
                let mut corrupt = bytes.clone();
                corrupt[index] ^= 1 << bit;
                assert!(
                    decode(&corrupt).unwrap_err().is_checksum(),
                    "flip at byte {} bit {}",
                    index,
                    bit
                );
            }
        }
    }

    #[test]
    fn test_zero_length_is_framing_error() {
        assert_eq!(
            decode(&[SOF, 0x00, 0x00]),
            Err(FrameError::InvalidLength(0))
        );
    }

    #[test]
    fn test_classify() {
        assert_eq!(classify(0x01), ControlByte::StartOfFrame);
        assert_eq!(classify(0x06), ControlByte::Ack);
        assert_eq!(classify(0x15), ControlByte::Nak);
        assert_eq!(classify(0x18), ControlByte::Cancel);
        assert_eq!(classify(0x42), ControlByte::Unknown(0x42));
    }

    #[test]
    fn test_reader_splits_controls_and_frames() {
        let mut reader = FrameReader::new();
        let frame = encode(Direction::Response, &[0x15, 0x01]).unwrap();
        reader.push(&[ACK]);
        reader.push(&frame);
        reader.push(&[CAN]);

        assert_eq!(reader.next_inbound(), Some(Inbound::Control(ControlByte::Ack)));
        match reader.next_inbound() {
            Some(Inbound::Frame(f)) => assert_eq!(f.function, 0x15),
            other => panic!("expected frame, got {:?}", other),
        }
        assert_eq!(
            reader.next_inbound(),
            Some(Inbound::Control(ControlByte::Cancel))
        );
        assert_eq!(reader.next_inbound(), None);
    }

    #[test]
    fn test_reader_waits_for_partial_frame() {
        let mut reader = FrameReader::new();
        let frame = encode(Direction::Request, &[0x49, 0x84, 0x05]).unwrap();
        reader.push(&frame[..3]);
        assert_eq!(reader.next_inbound(), None);
        assert!(reader.has_partial());

        reader.push(&frame[3..]);
        assert!(matches!(reader.next_inbound(), Some(Inbound::Frame(_))));
        assert!(!reader.has_partial());
    }

    #[test]
    fn test_reader_resyncs_after_checksum_error() {
        let mut reader = FrameReader::new();
        let mut bad = encode(Direction::Request, &[0x04, 0x00, 0x02]).unwrap();
        let last = bad.len() - 1;
        bad[last] ^= 0xFF;
        let good = encode(Direction::Request, &[0x04, 0x00, 0x03]).unwrap();

        reader.push(&bad);
        reader.push(&[0x55, 0x66]);
        reader.push(&good);

        assert!(matches!(
            reader.next_inbound(),
            Some(Inbound::Corrupt(FrameError::Checksum { .. }))
        ));
        assert!(reader.is_resyncing());
        assert_eq!(reader.next_inbound(), Some(Inbound::Discarded(2)));
        assert!(!reader.is_resyncing());
        match reader.next_inbound() {
            Some(Inbound::Frame(f)) => assert_eq!(f.arg(1), Some(0x03)),
            other => panic!("expected frame, got {:?}", other),
        }
    }

    #[test]
    fn test_reader_zero_length_triggers_resync() {
        let mut reader = FrameReader::new();
        reader.push(&[SOF, 0x00, 0x77]);
        assert_eq!(
            reader.next_inbound(),
            Some(Inbound::Corrupt(FrameError::InvalidLength(0)))
        );
        assert!(reader.is_resyncing());
        assert_eq!(reader.next_inbound(), Some(Inbound::Discarded(2)));
        assert_eq!(reader.next_inbound(), None);
        assert!(reader.is_resyncing());
    }

    #[test]
    fn test_reader_unknown_byte_resyncs() {
        let mut reader = FrameReader::new();
        reader.push(&[0x99, ACK]);
        assert_eq!(
            reader.next_inbound(),
            Some(Inbound::Corrupt(FrameError::UnexpectedByte(0x99)))
        );
        // The ACK is discarded along with the stray byte
        assert_eq!(reader.next_inbound(), Some(Inbound::Discarded(2)));
    }

    #[test]
    fn test_abandon_partial_clears_resync() {
        let mut reader = FrameReader::new();
        reader.push(&[0x99, SOF, 0x05, 0x00]);
        assert!(matches!(reader.next_inbound(), Some(Inbound::Corrupt(_))));
        assert_eq!(reader.next_inbound(), Some(Inbound::Discarded(1)));
        assert_eq!(reader.next_inbound(), None);

        assert_eq!(reader.abandon_partial(), 3);
        assert!(!reader.is_resyncing());
        reader.push(&[ACK]);
        assert_eq!(
            reader.next_inbound(),
            Some(Inbound::Control(ControlByte::Ack))
        );
    }
}
