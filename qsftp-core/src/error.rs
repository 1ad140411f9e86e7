//! Error types for the QSFTP protocol engine.
//!
//! The taxonomy follows the recovery model: format errors are per-frame
//! recoverable, handshake errors are session-fatal, integrity errors are
//! recoverable at chunk granularity, ledger errors are process-fatal.

use thiserror::Error;

/// Result type for QSFTP operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Malformed frame. Always recoverable: reject the single frame.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FormatError {
    /// Fewer bytes available than the fixed header, or the declared
    /// payload/signature has not fully arrived.
    #[error("frame too short")]
    TooShort,

    /// Received payload byte count does not match the declared length.
    #[error("payload length mismatch: declared {declared}, got {actual}")]
    LengthMismatch { declared: u32, actual: u32 },

    /// Type octet outside the defined range.
    #[error("unknown frame type: 0x{0:02x}")]
    UnknownType(u8),

    /// Unsupported protocol version octet.
    #[error("unknown protocol version: {0}")]
    UnknownVersion(u8),

    /// Declared payload length exceeds the anti-DoS ceiling. Rejected from
    /// the header alone, before any payload bytes are buffered.
    #[error("payload length {length} exceeds ceiling {max}")]
    PayloadTooLarge { length: u32, max: u32 },
}

/// Handshake failure. Always session-fatal; the state machine transitions
/// to `Aborted` and the connection is torn down.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HandshakeError {
    /// Peer offered no mutually supported cipher suite.
    #[error("no mutually supported cipher suite")]
    KexMismatch,

    /// Hardware attestation evidence failed verification.
    #[error("hardware attestation invalid")]
    AttestationInvalid,

    /// Hardware attestation evidence has expired.
    #[error("hardware attestation expired")]
    AttestationExpired,

    /// Finished MAC did not match the local transcript.
    #[error("transcript mismatch in Finished message")]
    TranscriptMismatch,

    /// No expected peer message within the handshake deadline.
    #[error("handshake timed out")]
    Timeout,

    /// A frame type with no defined transition for the current state.
    #[error("unexpected {frame_type} in handshake state {state}")]
    UnexpectedMessage { state: &'static str, frame_type: &'static str },
}

/// Data integrity failure during transfer.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum IntegrityError {
    /// A chunk's embedded hash does not match its data. Recoverable by
    /// re-requesting that index.
    #[error("chunk {index} hash mismatch")]
    ChunkMismatch { index: u64 },

    /// Cumulative hash over all verified chunks does not match the
    /// declared file commitment. Fatal for the transfer.
    #[error("cumulative transfer hash mismatch")]
    CumulativeMismatch,

    /// A chunk exhausted its retry budget; the whole transfer fails.
    #[error("chunk {index} failed after retry exhaustion")]
    RetriesExhausted { index: u64 },

    /// Chunk index outside [0, total_chunks).
    #[error("chunk index {index} out of range")]
    UnknownChunk { index: u64 },
}

/// Authorization denial. The session continues; only the operation fails.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AuthorizationError {
    #[error("access denied to {resource} for {action}: {reason}")]
    Denied { resource: String, action: String, reason: String },
}

/// Audit ledger failure. Process-fatal: the engine refuses to proceed with
/// unaudited operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LedgerError {
    /// Previous-hash of the record at `sequence` does not chain to its
    /// predecessor.
    #[error("audit chain broken at sequence {sequence}")]
    BrokenChain { sequence: u64 },

    /// Record signature failed verification.
    #[error("audit record {sequence} signature invalid")]
    BadSignature { sequence: u64 },

    /// Sequence numbers are not contiguous.
    #[error("audit sequence gap: expected {expected}, found {found}")]
    SequenceGap { expected: u64, found: u64 },

    /// Requested verification range is outside the ledger.
    #[error("verification range out of bounds")]
    RangeOutOfBounds,

    /// Record could not be serialized for hashing or signing.
    #[error("audit record serialization failed")]
    Serialize,
}

/// Typed failure from the primitive adapter.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CryptoError {
    #[error("key exchange failed: {0}")]
    Kem(String),

    #[error("signature operation failed: {0}")]
    Signature(String),

    #[error("AEAD operation failed: {0}")]
    Aead(String),

    #[error("key derivation failed: {0}")]
    Kdf(String),

    /// The adapter reports its key material is unusable. Process-fatal.
    #[error("key material corrupted")]
    KeyMaterialCorrupted,

    #[error("random generator failure")]
    Rng,
}

/// Top-level QSFTP error.
#[derive(Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Format(#[from] FormatError),

    #[error(transparent)]
    Handshake(#[from] HandshakeError),

    #[error(transparent)]
    Integrity(#[from] IntegrityError),

    #[error(transparent)]
    Authorization(#[from] AuthorizationError),

    #[error(transparent)]
    Ledger(#[from] LedgerError),

    #[error(transparent)]
    Crypto(#[from] CryptoError),

    /// Transport collaborator failure (stream reset, peer gone).
    #[error("transport error: {0}")]
    Transport(String),

    /// Hardware collaborator failure outside attestation semantics.
    #[error("hardware token error: {0}")]
    Hardware(String),

    /// File backend failure.
    #[error("file operation error: {0}")]
    File(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("operation timed out: {0}")]
    Timeout(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Transport(err.to_string())
    }
}

impl From<ring::error::Unspecified> for Error {
    fn from(_: ring::error::Unspecified) -> Self {
        Error::Crypto(CryptoError::Signature("ring operation failed".to_string()))
    }
}

impl From<ring::error::KeyRejected> for Error {
    fn from(err: ring::error::KeyRejected) -> Self {
        Error::Crypto(CryptoError::Signature(format!("key rejected: {err}")))
    }
}

impl From<postcard::Error> for Error {
    fn from(err: postcard::Error) -> Self {
        Error::Internal(format!("payload serialization: {err}"))
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Internal(format!("json serialization: {err}"))
    }
}
