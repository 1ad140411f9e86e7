//! QSFTP Core - Quantum-Safe File Transfer Protocol engine
//!
//! This crate implements the QSFTP session protocol: the handshake state
//! machine (hybrid post-quantum key exchange plus hardware attestation),
//! the authenticated wire framing layer, chunked data transfer with
//! per-chunk integrity, and the hash-chained audit ledger.
//!
//! The transport substrate, cryptographic primitives, hardware tokens and
//! authorization policy are consumed through narrow collaborator traits;
//! see [`transport`], [`primitives`], [`hardware`] and [`session`].

pub mod error;
pub mod hardware;
pub mod handshake;
pub mod ledger;
pub mod primitives;
pub mod recovery;
pub mod session;
pub mod suite;
pub mod transport;
pub mod wire;

// Re-export commonly used types
pub use error::{
    AuthorizationError, CryptoError, Error, FormatError, HandshakeError, IntegrityError,
    LedgerError, Result,
};
pub use handshake::{EstablishedSession, Handshake, HandshakeConfig, HandshakeState, HandshakeStep, Role};
pub use hardware::{AttestationEvidence, HardwareAuthenticator, HardwareClass, Identity, SoftToken};
pub use ledger::{AuditAction, AuditLedger, AuditOutcome, AuditRecord, RecordHandle};
pub use primitives::{CryptoProvider, SigningIdentity, SoftwareProvider};
pub use recovery::{FailureClass, RecoveryController, RetryDecision, RetryPolicy};
pub use session::{
    AllowAll, Authorizer, ChunkPayload, ControlMessage, DiskBackend, EngineEvent, EngineOutput,
    ErrorInfo, FileBackend, FileInfo, FileOperation, FileResponse, MemoryBackend, SessionEngine,
    SessionKeys, Transfer,
};
pub use suite::CipherSuite;
pub use transport::{FrameStream, MemoryTransport, TcpFrameStream, TcpTransport, Transport, TransportConfig};
pub use wire::{Frame, FrameFlags, FrameType, WireCodec};

/// QSFTP protocol version carried in every frame header.
pub const PROTOCOL_VERSION: u8 = 1;

/// Default chunk size for file transfers (64 KiB).
pub const DEFAULT_CHUNK_SIZE: usize = 64 * 1024;

/// Anti-DoS ceiling on a single frame payload (16 MiB). Frames declaring
/// more than this are rejected from the header alone, before buffering.
pub const MAX_FRAME_PAYLOAD: u32 = 16 * 1024 * 1024;

/// Default TCP port for the thin transport adapter.
pub const DEFAULT_PORT: u16 = 8443;

/// Handshake deadline: no expected peer message within this window aborts
/// the handshake.
pub const HANDSHAKE_TIMEOUT_SECS: u64 = 30;

/// Session key byte budget: a key never protects more than 1 GiB.
pub const KEY_BYTE_BUDGET: u64 = 1024 * 1024 * 1024;

/// Session key time budget: a key never lives longer than 1 hour.
pub const KEY_TIME_BUDGET_SECS: u64 = 3600;

/// Grace window during which frames under the previous key epoch are still
/// accepted after a rotation.
pub const ROTATION_GRACE_SECS: u64 = 10;

/// Maximum re-requests for a single chunk before the transfer fails.
pub const MAX_CHUNK_RETRIES: u32 = 3;

/// Ed25519 signature length; the only signature scheme carried in frames.
pub const FRAME_SIGNATURE_LEN: usize = 64;
