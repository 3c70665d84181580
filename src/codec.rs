//! Binary frame codec for the IPC socket.
//!
//! Every frame is an 8-byte header followed by the payload:
//!
//! ```text
//! +----------------+----------------+---------------------+
//! | opcode: u32 LE | length: u32 LE | payload (length B)  |
//! +----------------+----------------+---------------------+
//! ```
//!
//! [`decode`] works on whatever bytes are available and reports how many more
//! it needs instead of failing, so the read loop can feed it partial reads.
//! [`FrameDecoder`] wraps that in a growable buffer.

use crate::error::FrameError;

/// Size of the fixed frame header in bytes.
pub const HEADER_LEN: usize = 8;

/// Largest payload the decoder accepts (4 MiB).
///
/// Presence payloads are a few kilobytes at most; anything past this is
/// treated as a corrupt or hostile length prefix.
pub const MAX_PAYLOAD_LEN: u32 = 4 * 1024 * 1024;

/// Frame-level discriminant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum Opcode {
    /// Version/identity exchange, sent once by the client.
    Handshake = 0,
    /// Regular JSON command or event.
    Frame = 1,
    /// Connection is being closed; payload carries code and message.
    Close = 2,
    /// Keep-alive request.
    Ping = 3,
    /// Keep-alive response.
    Pong = 4,
}

impl Opcode {
    /// Numeric wire value.
    pub fn as_u32(self) -> u32 {
        self as u32
    }
}

impl TryFrom<u32> for Opcode {
    type Error = FrameError;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::Handshake),
            1 => Ok(Self::Frame),
            2 => Ok(Self::Close),
            3 => Ok(Self::Ping),
            4 => Ok(Self::Pong),
            other => Err(FrameError::UnknownOpcode(other)),
        }
    }
}

/// One length-prefixed unit of the wire protocol.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub opcode: Opcode,
    pub payload: Vec<u8>,
}

impl Frame {
    pub fn new(opcode: Opcode, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            opcode,
            payload: payload.into(),
        }
    }

    /// Encode this frame into header + payload bytes.
    ///
    /// # Errors
    ///
    /// Returns [`FrameError::PayloadTooLarge`] if the payload exceeds
    /// [`MAX_PAYLOAD_LEN`].
    pub fn encode(&self) -> Result<Vec<u8>, FrameError> {
        encode(self.opcode, &self.payload)
    }
}

/// Result of a successful [`decode`] call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decoded {
    /// A complete frame was decoded from the front of the buffer.
    Frame {
        frame: Frame,
        /// Number of bytes of the input the frame occupied.
        consumed: usize,
    },
    /// The buffer holds a prefix of a frame; this many more bytes are needed
    /// before the next decode attempt can make progress.
    NeedMore(usize),
}

/// Encode `opcode` and `payload` into a single wire buffer.
///
/// # Errors
///
/// Returns [`FrameError::PayloadTooLarge`] if `payload` exceeds
/// [`MAX_PAYLOAD_LEN`].
pub fn encode(opcode: Opcode, payload: &[u8]) -> Result<Vec<u8>, FrameError> {
    let len = u32::try_from(payload.len())
        .ok()
        .filter(|len| *len <= MAX_PAYLOAD_LEN)
        .ok_or(FrameError::PayloadTooLarge {
            len: u32::try_from(payload.len()).unwrap_or(u32::MAX),
            max: MAX_PAYLOAD_LEN,
        })?;

    let mut out = Vec::with_capacity(HEADER_LEN + payload.len());
    out.extend_from_slice(&opcode.as_u32().to_le_bytes());
    out.extend_from_slice(&len.to_le_bytes());
    out.extend_from_slice(payload);
    Ok(out)
}

/// Decode one frame from the front of `buf` using [`MAX_PAYLOAD_LEN`].
///
/// # Errors
///
/// Returns a [`FrameError`] when the header is complete but invalid. A short
/// buffer is never an error; it yields [`Decoded::NeedMore`].
pub fn decode(buf: &[u8]) -> Result<Decoded, FrameError> {
    decode_with_limit(buf, MAX_PAYLOAD_LEN)
}

/// Decode one frame from the front of `buf`, rejecting payloads over `max`.
///
/// # Errors
///
/// See [`decode`].
pub fn decode_with_limit(buf: &[u8], max: u32) -> Result<Decoded, FrameError> {
    let (Some(raw_opcode), Some(len)) = (read_u32_le(buf, 0), read_u32_le(buf, 4)) else {
        return Ok(Decoded::NeedMore(HEADER_LEN - buf.len()));
    };

    let opcode = Opcode::try_from(raw_opcode)?;
    if len > max {
        return Err(FrameError::PayloadTooLarge { len, max });
    }

    let total = HEADER_LEN + len as usize;
    match buf.get(HEADER_LEN..total) {
        Some(payload) => Ok(Decoded::Frame {
            frame: Frame::new(opcode, payload),
            consumed: total,
        }),
        None => Ok(Decoded::NeedMore(total - buf.len())),
    }
}

fn read_u32_le(buf: &[u8], at: usize) -> Option<u32> {
    let bytes: [u8; 4] = buf.get(at..at + 4)?.try_into().ok()?;
    Some(u32::from_le_bytes(bytes))
}

/// Incremental decoder fed with arbitrary chunks of the byte stream.
///
/// ```
/// use presence_ipc::codec::{encode, FrameDecoder, Opcode};
///
/// let wire = encode(Opcode::Frame, b"{}").unwrap();
/// let mut decoder = FrameDecoder::new();
///
/// decoder.extend(&wire[..3]);
/// assert!(decoder.next_frame().unwrap().is_none());
///
/// decoder.extend(&wire[3..]);
/// let frame = decoder.next_frame().unwrap().unwrap();
/// assert_eq!(frame.payload, b"{}");
/// ```
#[derive(Debug)]
pub struct FrameDecoder {
    buf: Vec<u8>,
    max_payload: u32,
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::with_max_payload(MAX_PAYLOAD_LEN)
    }

    pub fn with_max_payload(max_payload: u32) -> Self {
        Self {
            buf: Vec::new(),
            max_payload,
        }
    }

    /// Append freshly read bytes.
    pub fn extend(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Number of bytes buffered but not yet returned as frames.
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Pop the next complete frame, if one is buffered.
    ///
    /// # Errors
    ///
    /// Returns the [`FrameError`] for an invalid header. The decoder should
    /// be discarded afterwards; the stream cannot be resynchronized.
    pub fn next_frame(&mut self) -> Result<Option<Frame>, FrameError> {
        match decode_with_limit(&self.buf, self.max_payload)? {
            Decoded::Frame { frame, consumed } => {
                self.buf.drain(..consumed);
                Ok(Some(frame))
            }
            Decoded::NeedMore(_) => Ok(None),
        }
    }
}

#[cfg(test)]
#[allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::indexing_slicing
)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn header_layout_is_little_endian() {
        let wire = encode(Opcode::Close, b"abc").unwrap();
        assert_eq!(&wire[..4], &[2, 0, 0, 0]);
        assert_eq!(&wire[4..8], &[3, 0, 0, 0]);
        assert_eq!(&wire[8..], b"abc");
    }

    #[test]
    fn opcode_values_match_wire() {
        for (value, opcode) in [
            (0, Opcode::Handshake),
            (1, Opcode::Frame),
            (2, Opcode::Close),
            (3, Opcode::Ping),
            (4, Opcode::Pong),
        ] {
            assert_eq!(Opcode::try_from(value).unwrap(), opcode);
            assert_eq!(opcode.as_u32(), value);
        }
        assert_eq!(Opcode::try_from(5), Err(FrameError::UnknownOpcode(5)));
    }

    #[test]
    fn empty_buffer_needs_header() {
        assert_eq!(decode(&[]).unwrap(), Decoded::NeedMore(HEADER_LEN));
        assert_eq!(decode(&[1, 0, 0]).unwrap(), Decoded::NeedMore(5));
    }

    #[test]
    fn partial_payload_reports_remaining_bytes() {
        let wire = encode(Opcode::Frame, b"hello").unwrap();
        assert_eq!(decode(&wire[..10]).unwrap(), Decoded::NeedMore(3));
    }

    #[test]
    fn decode_reports_consumed_and_ignores_trailing_bytes() {
        let mut wire = encode(Opcode::Ping, b"xy").unwrap();
        wire.extend_from_slice(&[9, 9, 9]);
        match decode(&wire).unwrap() {
            Decoded::Frame { frame, consumed } => {
                assert_eq!(frame, Frame::new(Opcode::Ping, b"xy".to_vec()));
                assert_eq!(consumed, HEADER_LEN + 2);
            }
            Decoded::NeedMore(n) => panic!("expected frame, need {n} more"),
        }
    }

    #[test]
    fn unknown_opcode_is_malformed() {
        let mut wire = encode(Opcode::Frame, b"").unwrap();
        wire[0] = 7;
        assert_eq!(decode(&wire), Err(FrameError::UnknownOpcode(7)));
    }

    #[test]
    fn oversized_length_is_malformed_before_payload_arrives() {
        let mut header = Vec::new();
        header.extend_from_slice(&1u32.to_le_bytes());
        header.extend_from_slice(&(MAX_PAYLOAD_LEN + 1).to_le_bytes());
        assert_eq!(
            decode(&header),
            Err(FrameError::PayloadTooLarge {
                len: MAX_PAYLOAD_LEN + 1,
                max: MAX_PAYLOAD_LEN,
            })
        );
    }

    #[test]
    fn encode_rejects_oversized_payload() {
        let big = vec![0u8; MAX_PAYLOAD_LEN as usize + 1];
        assert!(matches!(
            encode(Opcode::Frame, &big),
            Err(FrameError::PayloadTooLarge { .. })
        ));
    }

    #[test]
    fn payload_at_limit_round_trips() {
        let payload = vec![0xAB; MAX_PAYLOAD_LEN as usize];
        let wire = encode(Opcode::Frame, &payload).unwrap();
        let mut decoder = FrameDecoder::new();
        decoder.extend(&wire);
        let frame = decoder.next_frame().unwrap().unwrap();
        assert_eq!(frame.payload.len(), payload.len());
        assert_eq!(decoder.buffered(), 0);
    }

    #[test]
    fn custom_limit_is_enforced() {
        let wire = encode(Opcode::Frame, &[0; 32]).unwrap();
        let mut decoder = FrameDecoder::with_max_payload(16);
        decoder.extend(&wire);
        assert!(matches!(
            decoder.next_frame(),
            Err(FrameError::PayloadTooLarge { len: 32, max: 16 })
        ));
    }

    fn arb_opcode() -> impl Strategy<Value = Opcode> {
        prop_oneof![
            Just(Opcode::Handshake),
            Just(Opcode::Frame),
            Just(Opcode::Close),
            Just(Opcode::Ping),
            Just(Opcode::Pong),
        ]
    }

    fn arb_frames() -> impl Strategy<Value = Vec<Frame>> {
        prop::collection::vec(
            (arb_opcode(), prop::collection::vec(any::<u8>(), 0..256))
                .prop_map(|(opcode, payload)| Frame::new(opcode, payload)),
            0..8,
        )
    }

    fn drain(decoder: &mut FrameDecoder, out: &mut Vec<Frame>) {
        while let Some(frame) = decoder.next_frame().unwrap() {
            out.push(frame);
        }
    }

    proptest! {
        #[test]
        fn encode_then_decode_returns_original(opcode in arb_opcode(), payload in prop::collection::vec(any::<u8>(), 0..4096)) {
            let wire = encode(opcode, &payload).unwrap();
            match decode(&wire).unwrap() {
                Decoded::Frame { frame, consumed } => {
                    prop_assert_eq!(frame.opcode, opcode);
                    prop_assert_eq!(frame.payload, payload);
                    prop_assert_eq!(consumed, wire.len());
                }
                Decoded::NeedMore(n) => prop_assert!(false, "needed {} more bytes", n),
            }
        }

        #[test]
        fn chunked_decode_matches_whole_decode(frames in arb_frames(), cuts in prop::collection::vec(1usize..64, 0..64)) {
            let mut wire = Vec::new();
            for frame in &frames {
                wire.extend(frame.encode().unwrap());
            }

            let mut whole = FrameDecoder::new();
            whole.extend(&wire);
            let mut expected = Vec::new();
            drain(&mut whole, &mut expected);
            prop_assert_eq!(&expected, &frames);

            let mut chunked = FrameDecoder::new();
            let mut actual = Vec::new();
            let mut rest = wire.as_slice();
            for cut in cuts {
                let (head, tail) = rest.split_at(cut.min(rest.len()));
                chunked.extend(head);
                drain(&mut chunked, &mut actual);
                rest = tail;
            }
            chunked.extend(rest);
            drain(&mut chunked, &mut actual);

            prop_assert_eq!(actual, expected);
            prop_assert_eq!(chunked.buffered(), 0);
        }
    }
}
