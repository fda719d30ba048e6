//! BioRadio binary frame codec.
//!
//! Every message exchanged with the device is one frame:
//!
//! ```text
//! [sync 0xF0] [header: cmd << 4 | len] [ext_len?] [payload ...]
//! ```
//!
//! The low nibble of the header carries the payload length inline for
//! payloads of 0-5 bytes. Longer payloads set the nibble to the sentinel `6`
//! and insert one explicit length byte after the header.
//!
//! There is no checksum in the protocol: frames are validated structurally
//! only, so bit errors inside a payload cannot be detected here.

use log::{debug, trace};

use crate::errors::{Result, TransportError};

// ============================================================================
// Constants
// ============================================================================

/// Marker byte that starts every frame.
pub const SYNC_BYTE: u8 = 0xF0;

/// Length nibble announcing that an explicit length byte follows the header.
pub const EXTENDED_LENGTH: u8 = 6;

/// Largest payload the single extended length byte can describe.
pub const MAX_PAYLOAD: usize = u8::MAX as usize;

/// Largest command value that fits in the header's high nibble.
pub const MAX_COMMAND: u8 = 0x0F;

// ============================================================================
// Data Types
// ============================================================================

/// How the payload length is carried on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LengthEncoding {
    /// Length (0-5) in the header's low nibble.
    Short,
    /// Sentinel nibble plus one explicit length byte.
    Extended,
}

impl LengthEncoding {
    /// Encoding an encoder picks for a payload of `len` bytes.
    pub fn for_len(len: usize) -> Self {
        if len < EXTENDED_LENGTH as usize {
            LengthEncoding::Short
        } else {
            LengthEncoding::Extended
        }
    }
}

/// One complete, self-delimited protocol unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Command/class from the header's high nibble (0-15).
    pub command: u8,
    pub length_encoding: LengthEncoding,
    pub payload: Vec<u8>,
}

impl Frame {
    pub fn new(command: u8, payload: Vec<u8>) -> Self {
        Self {
            command,
            length_encoding: LengthEncoding::for_len(payload.len()),
            payload,
        }
    }

    /// Number of bytes this frame occupies on the wire.
    pub fn wire_len(&self) -> usize {
        match self.length_encoding {
            LengthEncoding::Short => 2 + self.payload.len(),
            LengthEncoding::Extended => 3 + self.payload.len(),
        }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        encode(self.command, &self.payload)
    }
}

/// Outcome of scanning a receive buffer for the next frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParseResult {
    /// More bytes are needed before a frame can be delimited.
    Incomplete,
    /// A complete frame starting at offset 0; drop `consumed` bytes.
    Frame(Frame, usize),
    /// Leading noise; drop `consumed` bytes and parse again.
    Garbage(usize),
}

// ============================================================================
// Codec
// ============================================================================

/// Encode a request frame.
///
/// Payloads shorter than 6 bytes use the short form; anything longer uses
/// the extended form and is `payload.len() + 3` bytes on the wire.
pub fn encode(command: u8, payload: &[u8]) -> Result<Vec<u8>> {
    if command > MAX_COMMAND {
        return Err(TransportError::Protocol(format!(
            "command {command:#04X} does not fit in the header nibble"
        )));
    }
    if payload.len() > MAX_PAYLOAD {
        return Err(TransportError::Protocol(format!(
            "payload of {} bytes exceeds the {MAX_PAYLOAD}-byte frame limit",
            payload.len()
        )));
    }

    Ok(write_frame(command, payload))
}

/// Frame layout shared by `encode` and the constant commands; inputs are
/// already known to fit.
fn write_frame(command: u8, payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(payload.len() + 3);
    out.push(SYNC_BYTE);
    match LengthEncoding::for_len(payload.len()) {
        LengthEncoding::Short => {
            out.push((command << 4) | payload.len() as u8);
        }
        LengthEncoding::Extended => {
            out.push((command << 4) | EXTENDED_LENGTH);
            out.push(payload.len() as u8);
        }
    }
    out.extend_from_slice(payload);
    out
}

/// Try to delimit the next frame in `buffer`.
///
/// Never panics on malformed input. A buffer without any sync byte is all
/// noise and is reported as `Garbage(buffer.len())`. A header whose length
/// nibble is neither 0-5 nor the extended sentinel cannot start a frame, so
/// the false sync byte is reported as one byte of garbage and scanning
/// resumes at the next candidate.
pub fn try_parse(buffer: &[u8]) -> ParseResult {
    if buffer.is_empty() {
        return ParseResult::Incomplete;
    }

    let start = match buffer.iter().position(|&b| b == SYNC_BYTE) {
        Some(0) => 0,
        Some(pos) => return ParseResult::Garbage(pos),
        None => return ParseResult::Garbage(buffer.len()),
    };

    let Some(&header) = buffer.get(start + 1) else {
        return ParseResult::Incomplete;
    };
    let command = header >> 4;
    let nibble = header & 0x0F;

    let (encoding, data_start, data_len) = if nibble < EXTENDED_LENGTH {
        (LengthEncoding::Short, start + 2, nibble as usize)
    } else if nibble == EXTENDED_LENGTH {
        let Some(&ext) = buffer.get(start + 2) else {
            return ParseResult::Incomplete;
        };
        (LengthEncoding::Extended, start + 3, ext as usize)
    } else {
        trace!("length nibble {nibble} after sync byte, resynchronising");
        return ParseResult::Garbage(1);
    };

    let total = data_start + data_len;
    if buffer.len() < total {
        return ParseResult::Incomplete;
    }

    ParseResult::Frame(
        Frame {
            command,
            length_encoding: encoding,
            payload: buffer[data_start..total].to_vec(),
        },
        total,
    )
}

/// Decode a buffer that must hold exactly one frame.
pub fn decode(bytes: &[u8]) -> Result<Frame> {
    match try_parse(bytes) {
        ParseResult::Frame(frame, consumed) if consumed == bytes.len() => Ok(frame),
        ParseResult::Frame(_, consumed) => Err(TransportError::Protocol(format!(
            "{} trailing bytes after frame",
            bytes.len() - consumed
        ))),
        ParseResult::Incomplete => Err(TransportError::Protocol("incomplete frame".into())),
        ParseResult::Garbage(n) => Err(TransportError::Protocol(format!(
            "{n} bytes of noise before sync byte"
        ))),
    }
}

// ============================================================================
// Frame Assembler
// ============================================================================

/// Append-only receive buffer that yields frames as they become complete.
#[derive(Debug, Default)]
pub struct FrameAssembler {
    buffer: Vec<u8>,
    discarded: usize,
}

impl FrameAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, bytes: &[u8]) {
        self.buffer.extend_from_slice(bytes);
    }

    /// Pop the next complete frame, discarding any noise in front of it.
    pub fn next_frame(&mut self) -> Option<Frame> {
        loop {
            match try_parse(&self.buffer) {
                ParseResult::Incomplete => return None,
                ParseResult::Garbage(n) => {
                    debug!("discarding {} bytes: {:02X?}", n, &self.buffer[..n]);
                    self.discarded += n;
                    self.buffer.drain(..n);
                }
                ParseResult::Frame(frame, consumed) => {
                    self.buffer.drain(..consumed);
                    return Some(frame);
                }
            }
        }
    }

    /// Bytes buffered but not yet part of a complete frame.
    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    /// Total noise bytes dropped since creation.
    pub fn discarded(&self) -> usize {
        self.discarded
    }

    pub fn clear(&mut self) {
        self.buffer.clear();
    }
}

// ============================================================================
// Commands
// ============================================================================

/// A named, immutable request frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Command {
    pub name: &'static str,
    pub command: u8,
    pub payload: &'static [u8],
}

impl Command {
    pub const fn new(name: &'static str, command: u8, payload: &'static [u8]) -> Self {
        Self {
            name,
            command,
            payload,
        }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        write_frame(self.command & MAX_COMMAND, self.payload)
    }
}

pub const CMD_SET_MODE: u8 = 0x2;
pub const CMD_GET_MODE: u8 = 0x3;
pub const CMD_GET_GLOBAL: u8 = 0xF;

/// GetGlobal parameter id of the firmware/hardware version block.
pub const PARAM_FIRMWARE_VERSION: u8 = 0x00;

pub const MODE_IDLE: u8 = 0x00;
pub const MODE_ACQUIRE: u8 = 0x01;

pub const GET_FIRMWARE_VERSION: Command = Command::new(
    "GetGlobal FirmwareVersion",
    CMD_GET_GLOBAL,
    &[PARAM_FIRMWARE_VERSION],
);
pub const GET_MODE: Command = Command::new("GetMode", CMD_GET_MODE, &[]);
pub const SET_MODE_IDLE: Command = Command::new("SetMode Idle", CMD_SET_MODE, &[MODE_IDLE]);
pub const SET_MODE_ACQUIRE: Command =
    Command::new("SetMode Acquire", CMD_SET_MODE, &[MODE_ACQUIRE]);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_form_round_trips_for_every_inline_length() {
        for len in 0..6usize {
            let payload: Vec<u8> = (0..len as u8).map(|b| b.wrapping_mul(37)).collect();
            let bytes = encode(0x5, &payload).unwrap();
            assert_eq!(bytes.len(), payload.len() + 2);
            assert_eq!(bytes[1], 0x50 | len as u8);

            let frame = decode(&bytes).unwrap();
            assert_eq!(frame.command, 0x5);
            assert_eq!(frame.length_encoding, LengthEncoding::Short);
            assert_eq!(frame.payload, payload);
        }
    }

    #[test]
    fn extended_form_adds_length_byte() {
        for len in [6usize, 7, 64, 200, 255] {
            let payload = vec![0xAB; len];
            let bytes = encode(0xF, &payload).unwrap();
            assert_eq!(bytes.len(), len + 3);
            assert_eq!(bytes[1], 0xF6);
            assert_eq!(bytes[2] as usize, len);

            let frame = decode(&bytes).unwrap();
            assert_eq!(frame.length_encoding, LengthEncoding::Extended);
            assert_eq!(frame.payload.len(), len);
            assert_eq!(frame.wire_len(), bytes.len());
        }
    }

    #[test]
    fn encode_rejects_oversized_input() {
        assert!(encode(0x10, &[]).is_err());
        assert!(encode(0x1, &vec![0; 256]).is_err());
    }

    #[test]
    fn known_commands_match_device_bytes() {
        assert_eq!(GET_FIRMWARE_VERSION.to_bytes(), vec![0xF0, 0xF1, 0x00]);
        assert_eq!(GET_MODE.to_bytes(), vec![0xF0, 0x30]);
        assert_eq!(SET_MODE_IDLE.to_bytes(), vec![0xF0, 0x21, 0x00]);
        assert_eq!(SET_MODE_ACQUIRE.to_bytes(), vec![0xF0, 0x21, 0x01]);
        assert_eq!(
            GET_FIRMWARE_VERSION.to_bytes(),
            encode(CMD_GET_GLOBAL, &[PARAM_FIRMWARE_VERSION]).unwrap()
        );
    }

    #[test]
    fn trailing_bytes_are_left_for_the_next_call() {
        let mut buf = encode(0x3, &[0x01]).unwrap();
        let frame_len = buf.len();
        buf.extend_from_slice(&[0x11, 0x22]);

        match try_parse(&buf) {
            ParseResult::Frame(frame, consumed) => {
                assert_eq!(consumed, frame_len);
                assert_eq!(frame.payload, vec![0x01]);
                assert_eq!(&buf[consumed..], &[0x11, 0x22]);
            }
            other => panic!("expected frame, got {other:?}"),
        }
    }

    #[test]
    fn partial_frames_are_incomplete_until_all_bytes_arrive() {
        let bytes = encode(0x2, &[0x00, 0x01, 0x02]).unwrap();
        assert_eq!(try_parse(&bytes[..1]), ParseResult::Incomplete);
        assert_eq!(try_parse(&bytes[..2]), ParseResult::Incomplete);
        assert_eq!(try_parse(&bytes[..4]), ParseResult::Incomplete);
        assert!(matches!(try_parse(&bytes), ParseResult::Frame(_, 5)));

        let ext = encode(0xF, &[9; 10]).unwrap();
        assert_eq!(try_parse(&ext[..2]), ParseResult::Incomplete);
        assert_eq!(try_parse(&ext[..3]), ParseResult::Incomplete);
        assert_eq!(try_parse(&ext[..12]), ParseResult::Incomplete);
        assert!(matches!(try_parse(&ext), ParseResult::Frame(_, 13)));
    }

    #[test]
    fn leading_noise_is_reported_then_frame_follows() {
        let mut buf = vec![0x00, 0x13, 0x37];
        buf.extend(encode(0x3, &[]).unwrap());

        assert_eq!(try_parse(&buf), ParseResult::Garbage(3));
        match try_parse(&buf[3..]) {
            ParseResult::Frame(frame, consumed) => {
                assert_eq!(frame.command, 0x3);
                assert_eq!(consumed, 2);
            }
            other => panic!("expected frame, got {other:?}"),
        }
    }

    #[test]
    fn buffer_without_sync_is_all_noise() {
        assert_eq!(try_parse(&[]), ParseResult::Incomplete);
        assert_eq!(try_parse(&[0x01, 0x02]), ParseResult::Garbage(2));
    }

    #[test]
    fn impossible_length_nibble_drops_only_the_false_sync() {
        // 0xF9: nibble 9 can never start a frame.
        let buf = [SYNC_BYTE, 0xF9, SYNC_BYTE, 0x30];
        assert_eq!(try_parse(&buf), ParseResult::Garbage(1));
        assert_eq!(try_parse(&buf[1..]), ParseResult::Garbage(1));
        assert!(matches!(try_parse(&buf[2..]), ParseResult::Frame(_, 2)));
    }

    #[test]
    fn decode_rejects_anything_but_one_exact_frame() {
        assert!(decode(&[0xF0]).is_err());
        assert!(decode(&[0x00, 0xF0, 0x30]).is_err());
        assert!(decode(&[0xF0, 0x30, 0x00]).is_err());
    }

    #[test]
    fn assembler_builds_frames_across_pushes() {
        let mut first = vec![0xAA, 0xBB];
        first.extend(encode(0xF, &[0, 1, 2, 3, 4, 5, 6]).unwrap());
        let second = encode(0x2, &[0x01]).unwrap();

        let mut asm = FrameAssembler::new();
        asm.push(&first[..5]);
        assert!(asm.next_frame().is_none());
        asm.push(&first[5..]);
        asm.push(&second[..1]);

        let frame = asm.next_frame().unwrap();
        assert_eq!(frame.command, 0xF);
        assert_eq!(frame.payload, vec![0, 1, 2, 3, 4, 5, 6]);
        assert_eq!(asm.discarded(), 2);
        assert!(asm.next_frame().is_none());

        asm.push(&second[1..]);
        assert_eq!(asm.next_frame(), Some(Frame::new(0x2, vec![0x01])));
        assert!(asm.is_empty());
    }
}
