//! Wire-format definitions for the transport envelope.
//!
//! Every message exchanged between an endpoint and the switch is a [`Frame`].
//! This module is responsible for:
//! - Defining the on-wire binary layout (magic, length, payload).
//! - Serialising a payload into a frame ready for transmission.
//! - Deserialising a raw byte slice back into a [`Frame`], returning errors
//!   for malformed or truncated input.
//! - Telling control frames apart from Ethernet frames.
//!
//! No I/O happens here; this is pure data transformation.  Stream
//! reassembly lives in [`crate::transport::FrameReader`].
//!
//! # Wire format
//!
//! All multi-byte integers are **big-endian**.
//!
//! ```text
//!  0               1               2               3
//!  0 1 2 3 4 5 6 7 0 1 2 3 4 5 6 7 0 1 2 3 4 5 6 7 0 1 2 3 4 5 6 7
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |         Magic (0xFFFF)        |        Payload Length         |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                        Payload ...                            |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! ```
//!
//! Total header size: [`HEADER_LEN`] = 4 bytes.

use crate::control::SIGIL_OFFSET;
use crate::error::ProtocolError;

/// Constant first two bytes of every frame.
pub const MAGIC: u16 = 0xFFFF;

/// Byte length of the fixed-size header on the wire.
pub const HEADER_LEN: usize = 4;

/// Largest payload a frame may carry (`u16::MAX - HEADER_LEN`).
pub const MAX_PAYLOAD: usize = 65_531;

// Byte offsets of each field within the serialised header.
const OFF_MAGIC: usize = 0;
const OFF_LENGTH: usize = 2;

/// A decoded frame.  `payload.len()` always equals the on-wire length field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub payload: Vec<u8>,
}

impl Frame {
    pub fn new(payload: impl Into<Vec<u8>>) -> Self {
        Self { payload: payload.into() }
    }

    /// Value of the length field.
    pub fn length(&self) -> u16 {
        self.payload.len() as u16
    }

    /// Bytes this frame occupies on the wire.
    pub fn wire_len(&self) -> usize {
        HEADER_LEN + self.payload.len()
    }

    pub fn is_control(&self) -> bool {
        is_control(&self.payload)
    }

    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        encode(&self.payload)
    }
}

/// Serialise `payload` into a newly allocated frame.
pub fn encode(payload: &[u8]) -> Result<Vec<u8>, ProtocolError> {
    let mut buf = vec![0u8; HEADER_LEN + payload.len()];
    encode_into(payload, &mut buf)?;
    Ok(buf)
}

/// Serialise `payload` into `buf`, returning the number of bytes written.
///
/// Fails with [`ProtocolError::BufferTooSmall`] carrying the required
/// capacity when `buf` cannot hold the whole frame.
pub fn encode_into(payload: &[u8], buf: &mut [u8]) -> Result<usize, ProtocolError> {
    if payload.len() > MAX_PAYLOAD {
        return Err(ProtocolError::FrameTooLarge(payload.len()));
    }
    let total = HEADER_LEN + payload.len();
    if buf.len() < total {
        return Err(ProtocolError::BufferTooSmall { required: total });
    }

    buf[OFF_MAGIC..OFF_MAGIC + 2].copy_from_slice(&MAGIC.to_be_bytes());
    buf[OFF_LENGTH..OFF_LENGTH + 2].copy_from_slice(&(payload.len() as u16).to_be_bytes());
    buf[HEADER_LEN..total].copy_from_slice(payload);
    Ok(total)
}

/// Validate a 4-byte header and return the declared payload length.
pub fn peek_length(header: &[u8]) -> Result<usize, ProtocolError> {
    if header.len() < HEADER_LEN {
        return Err(ProtocolError::FrameTooSmall {
            needed: HEADER_LEN,
            available: header.len(),
        });
    }
    let magic = u16::from_be_bytes([header[OFF_MAGIC], header[OFF_MAGIC + 1]]);
    if magic != MAGIC {
        return Err(ProtocolError::InvalidMagic(magic));
    }
    Ok(u16::from_be_bytes([header[OFF_LENGTH], header[OFF_LENGTH + 1]]) as usize)
}

/// Parse a [`Frame`] from the start of `buf`.
///
/// Returns [`Err`] if:
/// - `buf` is shorter than [`HEADER_LEN`] or than `HEADER_LEN + length`,
/// - the magic field is not [`MAGIC`].
///
/// Bytes past the declared length are ignored.
pub fn decode(buf: &[u8]) -> Result<Frame, ProtocolError> {
    let length = peek_length(buf)?;
    let needed = HEADER_LEN + length;
    if buf.len() < needed {
        return Err(ProtocolError::FrameTooSmall {
            needed,
            available: buf.len(),
        });
    }
    Ok(Frame {
        payload: buf[HEADER_LEN..needed].to_vec(),
    })
}

/// `true` when `payload` carries a control message rather than an Ethernet
/// frame: at least five bytes with a request/response sigil at the offset
/// the control prefix puts it.
pub fn is_control(payload: &[u8]) -> bool {
    payload.len() > SIGIL_OFFSET && matches!(payload[SIGIL_OFFSET], b'=' | b':')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_decode_roundtrip() {
        let payload = b"hello, segment".to_vec();
        let decoded = decode(&encode(&payload).unwrap()).unwrap();
        assert_eq!(decoded.payload, payload);
        assert_eq!(decoded.length() as usize, payload.len());
    }

    #[test]
    fn max_payload_roundtrip() {
        let payload = vec![0xA5u8; MAX_PAYLOAD];
        let bytes = encode(&payload).unwrap();
        assert_eq!(bytes.len(), HEADER_LEN + MAX_PAYLOAD);
        assert_eq!(decode(&bytes).unwrap().payload, payload);
    }

    #[test]
    fn empty_payload_roundtrip() {
        let bytes = encode(b"").unwrap();
        assert_eq!(bytes, vec![0xFF, 0xFF, 0x00, 0x00]);
        assert_eq!(decode(&bytes).unwrap().payload, Vec::<u8>::new());
    }

    #[test]
    fn header_is_big_endian() {
        let bytes = encode(&[0u8; 0x0102]).unwrap();
        assert_eq!(&bytes[..4], &[0xFF, 0xFF, 0x01, 0x02]);
    }

    #[test]
    fn oversized_payload_is_rejected() {
        let payload = vec![0u8; MAX_PAYLOAD + 1];
        assert_eq!(
            encode(&payload),
            Err(ProtocolError::FrameTooLarge(MAX_PAYLOAD + 1))
        );
    }

    #[test]
    fn encode_into_reports_required_capacity() {
        let mut buf = [0u8; 6];
        assert_eq!(
            encode_into(b"abcdef", &mut buf),
            Err(ProtocolError::BufferTooSmall { required: 10 })
        );
        let mut buf = [0u8; 16];
        assert_eq!(encode_into(b"abcdef", &mut buf), Ok(10));
        assert_eq!(&buf[4..10], b"abcdef");
    }

    #[test]
    fn decode_short_header_returns_error() {
        assert_eq!(
            decode(&[0xFF, 0xFF, 0x00]),
            Err(ProtocolError::FrameTooSmall { needed: 4, available: 3 })
        );
        assert!(matches!(decode(&[]), Err(ProtocolError::FrameTooSmall { .. })));
    }

    #[test]
    fn decode_truncated_payload_returns_error() {
        let mut bytes = encode(b"data").unwrap();
        bytes.pop();
        assert_eq!(
            decode(&bytes),
            Err(ProtocolError::FrameTooSmall { needed: 8, available: 7 })
        );
    }

    #[test]
    fn decode_bad_magic_regardless_of_content() {
        for first in [[0x00, 0x00], [0xFF, 0xFE], [0x7F, 0xFF]] {
            let mut bytes = encode(b"payload").unwrap();
            bytes[0] = first[0];
            bytes[1] = first[1];
            let magic = u16::from_be_bytes(first);
            assert_eq!(decode(&bytes), Err(ProtocolError::InvalidMagic(magic)));
        }
    }

    #[test]
    fn decode_ignores_trailing_bytes() {
        let mut bytes = encode(b"abc").unwrap();
        bytes.extend_from_slice(b"next frame");
        assert_eq!(decode(&bytes).unwrap().payload, b"abc");
    }

    #[test]
    fn control_classification() {
        assert!(is_control(b"ping= "));
        assert!(is_control(b"logi: ok"));
        assert!(is_control(b"abcd="));
        assert!(!is_control(b"abcd"));
        assert!(!is_control(&[0xFF; 14]));
        assert!(!is_control(b"ping- "));
    }
}
