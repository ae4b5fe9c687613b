//! Length-prefixed frame codec.
//!
//! Every message on the control channel is one frame:
//!
//! ```text
//! ┌──────────────────────┬──────────────────────────────┐
//! │ 8 ASCII hex digits   │ payload (exactly N bytes)    │
//! │ N, e.g. "0000001f"   │                              │
//! └──────────────────────┴──────────────────────────────┘
//! ```
//!
//! There is no delimiter and no acknowledgement; frames may be pipelined
//! back to back. The header is fixed width, so payload bytes are never
//! reinterpreted as framing.

// ============================================================================
// Imports
// ============================================================================

use crate::error::{Error, Result};

// ============================================================================
// Constants
// ============================================================================

/// Length of the hexadecimal length header in bytes.
pub const HEADER_LEN: usize = 8;

/// Largest payload a header can describe.
pub const MAX_PAYLOAD_LEN: u32 = u32::MAX;

// ============================================================================
// Encoding
// ============================================================================

/// Encodes a payload into one frame.
///
/// # Errors
///
/// Returns [`Error::FrameTooLarge`] if the payload is longer than
/// [`MAX_PAYLOAD_LEN`].
pub fn encode(payload: &[u8]) -> Result<Vec<u8>> {
    let len = payload_len(payload.len())?;

    let mut frame = Vec::with_capacity(HEADER_LEN + payload.len());
    frame.extend_from_slice(&encode_header(len));
    frame.extend_from_slice(payload);
    Ok(frame)
}

/// Checks that a payload of `len` bytes fits the header.
///
/// # Errors
///
/// Returns [`Error::FrameTooLarge`] if `len` exceeds [`MAX_PAYLOAD_LEN`].
#[inline]
pub fn payload_len(len: usize) -> Result<u32> {
    u32::try_from(len).map_err(|_| Error::frame_too_large(len as u64, u64::from(MAX_PAYLOAD_LEN)))
}

/// Renders a payload length as the 8-digit lowercase hex header.
#[inline]
#[must_use]
pub fn encode_header(len: u32) -> [u8; HEADER_LEN] {
    let mut header = [0u8; HEADER_LEN];
    header.copy_from_slice(format!("{len:08x}").as_bytes());
    header
}

/// Parses an 8-digit hex header.
///
/// Both cases are accepted; signs, whitespace and prefixes are not.
///
/// # Errors
///
/// Returns [`Error::InvalidFrameHeader`] if any byte is not a hex digit.
pub fn parse_header(header: &[u8; HEADER_LEN]) -> Result<u32> {
    header.iter().try_fold(0u32, |acc, &byte| {
        let digit = (byte as char)
            .to_digit(16)
            .ok_or_else(|| Error::invalid_frame_header(header))?;
        Ok((acc << 4) | digit)
    })
}

// ============================================================================
// Decoding
// ============================================================================

/// Decodes every complete frame at the start of `buffer`.
///
/// Returns the payloads in order together with the undecoded remainder, which
/// the caller keeps and prepends to the next read.
///
/// # Errors
///
/// Returns [`Error::InvalidFrameHeader`] if a header is malformed.
pub fn decode(buffer: &[u8]) -> Result<(Vec<Vec<u8>>, &[u8])> {
    let mut frames = Vec::new();
    let mut rest = buffer;

    while let Some((payload, remainder)) = split_frame(rest, MAX_PAYLOAD_LEN)? {
        frames.push(payload.to_vec());
        rest = remainder;
    }

    Ok((frames, rest))
}

/// Splits one frame off the front of `buffer` if it is complete.
fn split_frame(buffer: &[u8], max_len: u32) -> Result<Option<(&[u8], &[u8])>> {
    let Some(header) = buffer.first_chunk::<HEADER_LEN>() else {
        return Ok(None);
    };

    let len = parse_header(header)?;
    if len > max_len {
        return Err(Error::frame_too_large(u64::from(len), u64::from(max_len)));
    }

    let body = &buffer[HEADER_LEN..];
    let len = len as usize;
    if body.len() < len {
        return Ok(None);
    }

    Ok(Some(body.split_at(len)))
}

// ============================================================================
// FrameDecoder
// ============================================================================

/// Incremental decoder owning the reassembly buffer of one stream.
///
/// Bytes are appended with [`feed`](Self::feed) as they arrive; complete
/// frames are pulled with [`next_frame`](Self::next_frame) in the order they
/// finished reassembly.
#[derive(Debug)]
pub struct FrameDecoder {
    /// Bytes received but not yet returned as frames.
    buffer: Vec<u8>,
    /// Offset of the first unconsumed byte.
    cursor: usize,
    /// Largest accepted payload.
    max_len: u32,
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new(MAX_PAYLOAD_LEN)
    }
}

impl FrameDecoder {
    /// Creates a decoder rejecting payloads longer than `max_len`.
    #[inline]
    #[must_use]
    pub fn new(max_len: u32) -> Self {
        Self {
            buffer: Vec::new(),
            cursor: 0,
            max_len,
        }
    }

    /// Changes the payload limit.
    ///
    /// Bytes already buffered are checked against the new limit by the next
    /// [`next_frame`](Self::next_frame).
    #[inline]
    pub fn set_max_len(&mut self, max_len: u32) {
        self.max_len = max_len;
    }

    /// Largest accepted payload.
    #[inline]
    #[must_use]
    pub fn max_len(&self) -> u32 {
        self.max_len
    }

    /// Appends freshly read bytes.
    pub fn feed(&mut self, chunk: &[u8]) {
        if self.cursor > 0 && self.cursor == self.buffer.len() {
            self.buffer.clear();
            self.cursor = 0;
        }
        self.buffer.extend_from_slice(chunk);
    }

    /// Pulls the next complete frame, if any.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidFrameHeader`] or [`Error::FrameTooLarge`]. The
    /// stream cannot be resynchronised after either.
    pub fn next_frame(&mut self) -> Result<Option<Vec<u8>>> {
        let pending = &self.buffer[self.cursor..];
        let Some((payload, _)) = split_frame(pending, self.max_len)? else {
            self.compact();
            return Ok(None);
        };

        let payload = payload.to_vec();
        self.cursor += HEADER_LEN + payload.len();
        Ok(Some(payload))
    }

    /// Number of buffered bytes not yet returned as frames.
    #[inline]
    #[must_use]
    pub fn buffered(&self) -> usize {
        self.buffer.len() - self.cursor
    }

    /// Moves the unconsumed tail to the front of the buffer.
    fn compact(&mut self) {
        if self.cursor > 0 {
            self.buffer.drain(..self.cursor);
            self.cursor = 0;
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    use proptest::prelude::*;

    #[test]
    fn test_encode_header_format() {
        assert_eq!(&encode_header(0), b"00000000");
        assert_eq!(&encode_header(31), b"0000001f");
        assert_eq!(&encode_header(u32::MAX), b"ffffffff");
    }

    #[test]
    fn test_parse_header_accepts_both_cases() {
        assert_eq!(parse_header(b"0000001F").expect("upper"), 31);
        assert_eq!(parse_header(b"ffffffff").expect("max"), u32::MAX);
    }

    #[test]
    fn test_parse_header_rejects_non_hex() {
        assert!(parse_header(b"0000001g").is_err());
        assert!(parse_header(b"+0000001").is_err());
        assert!(parse_header(b"       1").is_err());
    }

    #[test]
    fn test_encode_prefixes_length() {
        let frame = encode(b"guesttime").expect("encode");
        assert_eq!(frame, b"00000009guesttime");
    }

    #[test]
    fn test_empty_payload() {
        let frame = encode(b"").expect("encode");
        let (frames, rest) = decode(&frame).expect("decode");
        assert_eq!(frames, vec![Vec::<u8>::new()]);
        assert!(rest.is_empty());
    }

    #[test]
    fn test_decode_pipelined_frames() {
        let mut buffer = encode(b"time 2024-01-01 10:00:00").expect("encode");
        buffer.extend(encode(b"tzone VVRD").expect("encode"));
        buffer.extend_from_slice(b"0000");

        let (frames, rest) = decode(&buffer).expect("decode");
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0], b"time 2024-01-01 10:00:00");
        assert_eq!(frames[1], b"tzone VVRD");
        assert_eq!(rest, b"0000");
    }

    #[test]
    fn test_decode_incomplete_payload_returns_remainder() {
        let frame = encode(b"shellExecComplete 1 0  ").expect("encode");
        let (frames, rest) = decode(&frame[..12]).expect("decode");
        assert!(frames.is_empty());
        assert_eq!(rest, &frame[..12]);
    }

    #[test]
    fn test_decoder_rejects_oversized_frame() {
        let mut decoder = FrameDecoder::new(4);
        decoder.feed(b"00000005hello");
        let err = decoder.next_frame().expect_err("too large");
        assert!(matches!(err, Error::FrameTooLarge { len: 5, max: 4 }));
    }

    #[test]
    fn test_lowered_limit_applies_to_buffered_tail() {
        let mut wire = encode(b"register").expect("encode");
        wire.extend(encode(&[b'x'; 100]).expect("encode"));

        let mut decoder = FrameDecoder::new(1024);
        decoder.feed(&wire);
        assert_eq!(decoder.next_frame().expect("decode"), Some(b"register".to_vec()));

        decoder.set_max_len(64);
        assert_eq!(decoder.max_len(), 64);
        let err = decoder.next_frame().expect_err("too large");
        assert!(matches!(err, Error::FrameTooLarge { len: 100, max: 64 }));
    }

    #[cfg(target_pointer_width = "64")]
    #[test]
    fn test_payload_len_rejects_oversized() {
        assert_eq!(payload_len(31).expect("fits"), 31);
        assert_eq!(payload_len(u32::MAX as usize).expect("fits"), u32::MAX);
        let err = payload_len(u32::MAX as usize + 1).expect_err("too large");
        assert!(matches!(err, Error::FrameTooLarge { max, .. } if max == u64::from(u32::MAX)));
    }

    #[test]
    fn test_decoder_payload_with_embedded_header_bytes() {
        let payload = b"0000000400000004abcd";
        let mut decoder = FrameDecoder::default();
        decoder.feed(&encode(payload).expect("encode"));
        assert_eq!(decoder.next_frame().expect("decode"), Some(payload.to_vec()));
        assert_eq!(decoder.next_frame().expect("decode"), None);
        assert_eq!(decoder.buffered(), 0);
    }

    #[test]
    fn test_decoder_byte_at_a_time() {
        let mut wire = encode(b"initClean").expect("encode");
        wire.extend(encode(b"guesttzone").expect("encode"));

        let mut decoder = FrameDecoder::default();
        let mut frames = Vec::new();
        for byte in wire {
            decoder.feed(&[byte]);
            while let Some(frame) = decoder.next_frame().expect("decode") {
                frames.push(frame);
            }
        }

        assert_eq!(frames, vec![b"initClean".to_vec(), b"guesttzone".to_vec()]);
    }

    proptest! {
        #[test]
        fn prop_round_trip(payload in proptest::collection::vec(any::<u8>(), 0..4096)) {
            let frame = encode(&payload).expect("encode");
            let (frames, rest) = decode(&frame).expect("decode");
            prop_assert_eq!(frames, vec![payload]);
            prop_assert!(rest.is_empty());
        }

        #[test]
        fn prop_split_points_preserve_order(
            first in proptest::collection::vec(any::<u8>(), 0..256),
            second in proptest::collection::vec(any::<u8>(), 0..256),
            a in any::<prop::sample::Index>(),
            b in any::<prop::sample::Index>(),
        ) {
            let mut wire = encode(&first).expect("encode");
            wire.extend(encode(&second).expect("encode"));

            let mut cuts = [a.index(wire.len() + 1), b.index(wire.len() + 1)];
            cuts.sort_unstable();

            let mut decoder = FrameDecoder::default();
            let mut frames = Vec::new();
            for chunk in [&wire[..cuts[0]], &wire[cuts[0]..cuts[1]], &wire[cuts[1]..]] {
                decoder.feed(chunk);
                while let Some(frame) = decoder.next_frame().expect("decode") {
                    frames.push(frame);
                }
            }

            prop_assert_eq!(frames, vec![first, second]);
        }
    }
}
