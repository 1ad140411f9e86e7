//! QSFTP wire codec.
//!
//! Fixed 8-byte header `[version:1][type:1][flags:2][length:4]` followed by
//! `length` payload bytes and, iff the Signed flag is set, a 64-byte
//! Ed25519 signature over header ‖ payload. Length is network byte order.
//!
//! When Signed and Encrypted are both set the payload is sealed first and
//! the signature covers the ciphertext (encrypt-then-sign); receivers
//! verify before decrypting.

use crate::error::{Error, FormatError};
use crate::{FRAME_SIGNATURE_LEN, MAX_FRAME_PAYLOAD, PROTOCOL_VERSION};
use bytes::{Buf, BufMut, BytesMut};
use serde::{Deserialize, Serialize};
use tokio_util::codec::{Decoder, Encoder};

/// Size of the fixed frame header.
pub const HEADER_LEN: usize = 8;

/// QSFTP frame types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum FrameType {
    /// Handshake key-exchange messages
    Handshake = 0x01,
    /// Identity and attestation exchange
    Authentication = 0x02,
    /// File open/read/write/close/stat requests and responses
    FileOperation = 0x03,
    /// Chunked file data
    DataTransfer = 0x04,
    /// Key rotation, heartbeats, teardown
    Control = 0x05,
    /// Typed failure surfaced to the peer
    ErrorResponse = 0x06,
    /// Exported audit record
    AuditEvent = 0x07,
}

impl FrameType {
    pub fn name(self) -> &'static str {
        match self {
            FrameType::Handshake => "Handshake",
            FrameType::Authentication => "Authentication",
            FrameType::FileOperation => "FileOperation",
            FrameType::DataTransfer => "DataTransfer",
            FrameType::Control => "Control",
            FrameType::ErrorResponse => "ErrorResponse",
            FrameType::AuditEvent => "AuditEvent",
        }
    }
}

impl TryFrom<u8> for FrameType {
    type Error = FormatError;

    fn try_from(value: u8) -> std::result::Result<Self, FormatError> {
        match value {
            0x01 => Ok(FrameType::Handshake),
            0x02 => Ok(FrameType::Authentication),
            0x03 => Ok(FrameType::FileOperation),
            0x04 => Ok(FrameType::DataTransfer),
            0x05 => Ok(FrameType::Control),
            0x06 => Ok(FrameType::ErrorResponse),
            0x07 => Ok(FrameType::AuditEvent),
            other => Err(FormatError::UnknownType(other)),
        }
    }
}

/// Frame flag bitmask. The low byte carries the defined flag bits; the
/// high byte carries the key-rotation epoch of the protecting session key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct FrameFlags {
    /// Payload is AEAD-sealed under the session key
    pub encrypted: bool,
    /// A 64-byte signature trails the payload
    pub signed: bool,
    /// Payload is compressed
    pub compressed: bool,
    /// Payload is one chunk of a larger transfer
    pub chunked: bool,
    /// Last frame of a sequence
    pub final_frame: bool,
    /// Retransmission of a previously failed chunk
    pub retry: bool,
    /// High-priority delivery hint
    pub priority: bool,
    /// Reserved bit, must round-trip unchanged
    pub reserved: bool,
    /// Key-rotation epoch (mod 256) of the key protecting this frame
    pub key_epoch: u8,
}

impl From<u16> for FrameFlags {
    fn from(value: u16) -> Self {
        Self {
            encrypted: (value & 0x0001) != 0,
            signed: (value & 0x0002) != 0,
            compressed: (value & 0x0004) != 0,
            chunked: (value & 0x0008) != 0,
            final_frame: (value & 0x0010) != 0,
            retry: (value & 0x0020) != 0,
            priority: (value & 0x0040) != 0,
            reserved: (value & 0x0080) != 0,
            key_epoch: (value >> 8) as u8,
        }
    }
}

impl From<FrameFlags> for u16 {
    fn from(flags: FrameFlags) -> Self {
        let mut value = (flags.key_epoch as u16) << 8;
        if flags.encrypted { value |= 0x0001; }
        if flags.signed { value |= 0x0002; }
        if flags.compressed { value |= 0x0004; }
        if flags.chunked { value |= 0x0008; }
        if flags.final_frame { value |= 0x0010; }
        if flags.retry { value |= 0x0020; }
        if flags.priority { value |= 0x0040; }
        if flags.reserved { value |= 0x0080; }
        value
    }
}

/// The atomic wire unit. The length field is derived from the payload at
/// encode time, so the two can never disagree on the sending side.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub version: u8,
    pub frame_type: FrameType,
    pub flags: FrameFlags,
    pub payload: Vec<u8>,
    /// Present iff `flags.signed`.
    pub signature: Option<[u8; FRAME_SIGNATURE_LEN]>,
}

impl Frame {
    pub fn new(frame_type: FrameType, payload: Vec<u8>) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            frame_type,
            flags: FrameFlags::default(),
            payload,
            signature: None,
        }
    }

    /// Header bytes as they appear on the wire.
    fn header_bytes(&self) -> [u8; HEADER_LEN] {
        let mut header = [0u8; HEADER_LEN];
        header[0] = self.version;
        header[1] = self.frame_type as u8;
        header[2..4].copy_from_slice(&u16::from(self.flags).to_be_bytes());
        header[4..8].copy_from_slice(&(self.payload.len() as u32).to_be_bytes());
        header
    }

    /// Bytes covered by the frame signature: header ‖ payload.
    pub fn signing_input(&self) -> Vec<u8> {
        let mut input = Vec::with_capacity(HEADER_LEN + self.payload.len());
        input.extend_from_slice(&self.header_bytes());
        input.extend_from_slice(&self.payload);
        input
    }

    /// Attach a signature and set the Signed flag.
    pub fn with_signature(mut self, signature: [u8; FRAME_SIGNATURE_LEN]) -> Self {
        self.flags.signed = true;
        self.signature = Some(signature);
        self
    }

    /// Serialize to wire bytes.
    pub fn encode(&self) -> Result<Vec<u8>, FormatError> {
        if self.payload.len() > MAX_FRAME_PAYLOAD as usize {
            return Err(FormatError::PayloadTooLarge {
                length: self.payload.len() as u32,
                max: MAX_FRAME_PAYLOAD,
            });
        }
        let sig_len = if self.flags.signed { FRAME_SIGNATURE_LEN } else { 0 };
        let mut buffer = Vec::with_capacity(HEADER_LEN + self.payload.len() + sig_len);
        buffer.extend_from_slice(&self.header_bytes());
        buffer.extend_from_slice(&self.payload);
        if self.flags.signed {
            // Signed flag without a signature is a construction bug, not a
            // wire condition; refuse rather than emit an unverifiable frame.
            let sig = self.signature.ok_or(FormatError::LengthMismatch {
                declared: FRAME_SIGNATURE_LEN as u32,
                actual: 0,
            })?;
            buffer.extend_from_slice(&sig);
        }
        Ok(buffer)
    }

    /// Parse exactly one frame from `data`. The buffer must contain the
    /// whole frame and nothing else; use [`WireCodec`] for streams.
    pub fn decode(data: &[u8]) -> Result<Self, FormatError> {
        if data.len() < HEADER_LEN {
            return Err(FormatError::TooShort);
        }
        let (version, frame_type, flags, length) = parse_header(data)?;
        let sig_len = if flags.signed { FRAME_SIGNATURE_LEN } else { 0 };
        let total = HEADER_LEN + length as usize + sig_len;
        if data.len() < total {
            return Err(FormatError::TooShort);
        }
        if data.len() > total {
            return Err(FormatError::LengthMismatch {
                declared: length,
                actual: (data.len() - HEADER_LEN - sig_len) as u32,
            });
        }
        let payload = data[HEADER_LEN..HEADER_LEN + length as usize].to_vec();
        let signature = if flags.signed {
            let mut sig = [0u8; FRAME_SIGNATURE_LEN];
            sig.copy_from_slice(&data[HEADER_LEN + length as usize..total]);
            Some(sig)
        } else {
            None
        };
        Ok(Self { version, frame_type, flags, payload, signature })
    }
}

/// Validate the fixed header. Called with at least `HEADER_LEN` bytes; the
/// payload-length ceiling is enforced here, before any payload buffering.
fn parse_header(data: &[u8]) -> Result<(u8, FrameType, FrameFlags, u32), FormatError> {
    let version = data[0];
    if version != PROTOCOL_VERSION {
        return Err(FormatError::UnknownVersion(version));
    }
    let frame_type = FrameType::try_from(data[1])?;
    let flags = FrameFlags::from(u16::from_be_bytes([data[2], data[3]]));
    let length = u32::from_be_bytes([data[4], data[5], data[6], data[7]]);
    if length > MAX_FRAME_PAYLOAD {
        return Err(FormatError::PayloadTooLarge { length, max: MAX_FRAME_PAYLOAD });
    }
    Ok((version, frame_type, flags, length))
}

/// Streaming codec over byte transports, for use with `tokio_util` framing.
///
/// Incomplete input yields `Ok(None)`; structural violations are surfaced
/// as errors for the caller to classify (they are per-frame recoverable).
#[derive(Debug, Clone)]
pub struct WireCodec {
    max_payload: u32,
}

impl WireCodec {
    pub fn new() -> Self {
        Self { max_payload: MAX_FRAME_PAYLOAD }
    }

    pub fn with_max_payload(max_payload: u32) -> Self {
        Self { max_payload }
    }
}

impl Default for WireCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for WireCodec {
    type Item = Frame;
    type Error = Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>, Error> {
        if src.len() < HEADER_LEN {
            return Ok(None);
        }
        let (version, frame_type, flags, length) = parse_header(&src[..HEADER_LEN])?;
        if length > self.max_payload {
            return Err(FormatError::PayloadTooLarge { length, max: self.max_payload }.into());
        }
        let sig_len = if flags.signed { FRAME_SIGNATURE_LEN } else { 0 };
        let total = HEADER_LEN + length as usize + sig_len;
        if src.len() < total {
            src.reserve(total - src.len());
            return Ok(None);
        }
        src.advance(HEADER_LEN);
        let payload = src.split_to(length as usize).to_vec();
        let signature = if flags.signed {
            let sig_bytes = src.split_to(FRAME_SIGNATURE_LEN);
            let mut sig = [0u8; FRAME_SIGNATURE_LEN];
            sig.copy_from_slice(&sig_bytes);
            Some(sig)
        } else {
            None
        };
        Ok(Some(Frame { version, frame_type, flags, payload, signature }))
    }
}

impl Encoder<Frame> for WireCodec {
    type Error = Error;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> Result<(), Error> {
        let bytes = frame.encode()?;
        dst.reserve(bytes.len());
        dst.put_slice(&bytes);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_frame() -> Frame {
        let mut frame = Frame::new(FrameType::DataTransfer, b"chunk bytes".to_vec());
        frame.flags.encrypted = true;
        frame.flags.chunked = true;
        frame.flags.key_epoch = 3;
        frame
    }

    #[test]
    fn test_frame_type_codes() {
        assert_eq!(FrameType::Handshake as u8, 0x01);
        assert_eq!(FrameType::AuditEvent as u8, 0x07);
        assert!(matches!(FrameType::try_from(0x08), Err(FormatError::UnknownType(0x08))));
        assert!(matches!(FrameType::try_from(0x00), Err(FormatError::UnknownType(0x00))));
    }

    #[test]
    fn test_flags_round_trip() {
        let flags = FrameFlags {
            encrypted: true,
            signed: true,
            final_frame: true,
            retry: true,
            key_epoch: 0xAB,
            ..Default::default()
        };
        let raw: u16 = flags.into();
        assert_eq!(raw & 0x00FF, 0x0033);
        assert_eq!(FrameFlags::from(raw), flags);
    }

    #[test]
    fn test_encode_decode_round_trip() {
        let frame = sample_frame();
        let bytes = frame.encode().unwrap();
        assert_eq!(&bytes[4..8], &(frame.payload.len() as u32).to_be_bytes());
        let decoded = Frame::decode(&bytes).unwrap();
        assert_eq!(decoded, frame);
    }

    #[test]
    fn test_signed_frame_round_trip() {
        let frame = sample_frame().with_signature([7u8; FRAME_SIGNATURE_LEN]);
        let bytes = frame.encode().unwrap();
        let decoded = Frame::decode(&bytes).unwrap();
        assert_eq!(decoded.signature, Some([7u8; FRAME_SIGNATURE_LEN]));
        assert_eq!(decoded, frame);
    }

    #[test]
    fn test_too_short() {
        assert_eq!(Frame::decode(&[1, 1, 0]), Err(FormatError::TooShort));
        // Declared 16-byte payload, only 4 delivered.
        let mut bytes = Frame::new(FrameType::Control, vec![0u8; 16]).encode().unwrap();
        bytes.truncate(HEADER_LEN + 4);
        assert_eq!(Frame::decode(&bytes), Err(FormatError::TooShort));
    }

    #[test]
    fn test_length_mismatch_on_trailing_bytes() {
        let mut bytes = sample_frame().encode().unwrap();
        bytes.push(0xFF);
        assert!(matches!(Frame::decode(&bytes), Err(FormatError::LengthMismatch { .. })));
    }

    #[test]
    fn test_unknown_version_and_type() {
        let mut bytes = sample_frame().encode().unwrap();
        bytes[0] = 9;
        assert_eq!(Frame::decode(&bytes), Err(FormatError::UnknownVersion(9)));
        bytes[0] = PROTOCOL_VERSION;
        bytes[1] = 0x7F;
        assert_eq!(Frame::decode(&bytes), Err(FormatError::UnknownType(0x7F)));
    }

    #[test]
    fn test_oversize_rejected_before_buffering() {
        // Header declares a payload over the ceiling; no payload bytes follow.
        let mut header = [0u8; HEADER_LEN];
        header[0] = PROTOCOL_VERSION;
        header[1] = FrameType::DataTransfer as u8;
        header[4..8].copy_from_slice(&(MAX_FRAME_PAYLOAD + 1).to_be_bytes());
        assert!(matches!(
            Frame::decode(&header),
            Err(FormatError::PayloadTooLarge { .. })
        ));

        let mut codec = WireCodec::new();
        let mut buf = BytesMut::from(&header[..]);
        assert!(matches!(
            codec.decode(&mut buf),
            Err(Error::Format(FormatError::PayloadTooLarge { .. }))
        ));
    }

    #[test]
    fn test_streaming_decode_partial_then_complete() {
        let frame = sample_frame();
        let bytes = frame.encode().unwrap();
        let mut codec = WireCodec::new();
        let mut buf = BytesMut::new();

        buf.extend_from_slice(&bytes[..5]);
        assert!(codec.decode(&mut buf).unwrap().is_none());
        buf.extend_from_slice(&bytes[5..bytes.len() - 2]);
        assert!(codec.decode(&mut buf).unwrap().is_none());
        buf.extend_from_slice(&bytes[bytes.len() - 2..]);
        assert_eq!(codec.decode(&mut buf).unwrap(), Some(frame));
        assert!(buf.is_empty());
    }

    #[test]
    fn test_streaming_decode_back_to_back_frames() {
        let a = sample_frame();
        let b = Frame::new(FrameType::Control, vec![1, 2, 3]);
        let mut codec = WireCodec::new();
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&a.encode().unwrap());
        buf.extend_from_slice(&b.encode().unwrap());
        assert_eq!(codec.decode(&mut buf).unwrap(), Some(a));
        assert_eq!(codec.decode(&mut buf).unwrap(), Some(b));
        assert!(codec.decode(&mut buf).unwrap().is_none());
    }

    #[test]
    fn test_signing_input_covers_header_and_payload() {
        let frame = sample_frame();
        let input = frame.signing_input();
        let bytes = frame.encode().unwrap();
        assert_eq!(input, bytes[..HEADER_LEN + frame.payload.len()].to_vec());
    }
}
