//! Established-session engine: authenticated file operations, chunked
//! transfers with per-chunk integrity, and session key rotation.
//!
//! Every post-handshake frame is AEAD-sealed under the session key and
//! Ed25519-signed (encrypt-then-sign; the signature covers the sealed
//! frame). The nonce travels explicitly at the front of the payload:
//! 4-byte key epoch followed by an 8-byte send counter, so a (key, nonce)
//! pair is never reused across rotations.
//!
//! Transfers are chunked. Each chunk carries its own hash; reassembly is
//! order-independent and the receiver re-requests only the chunks that
//! failed. The cumulative transfer hash is the XOR of per-chunk
//! commitments `H(index ‖ chunk_hash)`, which is invariant under arrival
//! order.

use crate::error::{CryptoError, Error, HandshakeError, IntegrityError, Result};
use crate::handshake::{EstablishedSession, Role};
use crate::hardware::Identity;
use crate::ledger::{AuditAction, AuditEvent, AuditLedger, AuditMetadata, AuditOutcome};
use crate::primitives::{CryptoProvider, SigningIdentity};
use crate::recovery::{RecoveryController, RetryDecision};
use crate::suite::CipherSuite;
use crate::wire::{Frame, FrameFlags, FrameType};
use crate::{
    DEFAULT_CHUNK_SIZE, KEY_BYTE_BUDGET, KEY_TIME_BUDGET_SECS, ROTATION_GRACE_SECS,
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use uuid::Uuid;
use zeroize::Zeroizing;

/// AEAD nonce length.
const NONCE_LEN: usize = 12;

// ---------------------------------------------------------------------------
// Session keys
// ---------------------------------------------------------------------------

/// Directional traffic keys for one session, with rotation budgets.
///
/// Keys are stored as initiator-to-responder / responder-to-initiator so
/// both sides derive identical rotation input; [`Role`] selects which
/// direction is "send". Rotation derives the next epoch from the current
/// keys plus a fresh peer-visible nonce; the retired receive keys stay
/// usable for a short grace window to absorb in-flight frames. Frame
/// signatures use the long-term identity key, so no signing key lives
/// here.
pub struct SessionKeys {
    role: Role,
    epoch: u32,
    c2s: Zeroizing<[u8; 32]>,
    s2c: Zeroizing<[u8; 32]>,
    send_counter: u64,
    bytes_protected: u64,
    byte_budget: u64,
    time_budget: Duration,
    epoch_started: Instant,
    previous: Option<RetiredEpoch>,
}

struct RetiredEpoch {
    epoch: u32,
    c2s: Zeroizing<[u8; 32]>,
    s2c: Zeroizing<[u8; 32]>,
    retired_at: Instant,
    grace: Duration,
}

impl SessionKeys {
    pub fn new(role: Role, c2s: Zeroizing<[u8; 32]>, s2c: Zeroizing<[u8; 32]>) -> Self {
        Self {
            role,
            epoch: 0,
            c2s,
            s2c,
            send_counter: 0,
            bytes_protected: 0,
            byte_budget: KEY_BYTE_BUDGET,
            time_budget: Duration::from_secs(KEY_TIME_BUDGET_SECS),
            epoch_started: Instant::now(),
            previous: None,
        }
    }

    /// Override the rotation budgets.
    pub fn with_budgets(mut self, byte_budget: u64, time_budget: Duration) -> Self {
        self.byte_budget = byte_budget;
        self.time_budget = time_budget;
        self
    }

    pub fn epoch(&self) -> u32 {
        self.epoch
    }

    /// The epoch as carried in frame flags (mod 256).
    pub fn wire_epoch(&self) -> u8 {
        self.epoch as u8
    }

    pub fn send_key(&self) -> &[u8; 32] {
        match self.role {
            Role::Initiator => &self.c2s,
            Role::Responder => &self.s2c,
        }
    }

    pub fn recv_key(&self) -> &[u8; 32] {
        match self.role {
            Role::Initiator => &self.s2c,
            Role::Responder => &self.c2s,
        }
    }

    /// Resolve the receive key for a frame's wire epoch. The previous
    /// epoch stays valid only inside the grace window.
    pub fn recv_key_for(&self, wire_epoch: u8) -> Option<&[u8; 32]> {
        if wire_epoch == self.wire_epoch() {
            return Some(self.recv_key());
        }
        let previous = self.previous.as_ref()?;
        if wire_epoch != previous.epoch as u8 || previous.retired_at.elapsed() > previous.grace {
            return None;
        }
        Some(match self.role {
            Role::Initiator => &previous.s2c,
            Role::Responder => &previous.c2s,
        })
    }

    /// Next send nonce: 4-byte epoch ‖ 8-byte counter, both big endian.
    pub fn next_nonce(&mut self) -> [u8; NONCE_LEN] {
        let mut nonce = [0u8; NONCE_LEN];
        nonce[..4].copy_from_slice(&self.epoch.to_be_bytes());
        nonce[4..].copy_from_slice(&self.send_counter.to_be_bytes());
        self.send_counter += 1;
        nonce
    }

    pub fn note_protected(&mut self, bytes: u64) {
        self.bytes_protected = self.bytes_protected.saturating_add(bytes);
    }

    /// Either budget exhausted means the key must rotate before protecting
    /// more data.
    pub fn needs_rotation(&self) -> bool {
        self.bytes_protected >= self.byte_budget || self.epoch_started.elapsed() >= self.time_budget
    }

    /// Derive the next epoch from the current keys and a shared nonce.
    /// Both sides call this with the same nonce and land on the same keys.
    pub fn rotate(&mut self, provider: &dyn CryptoProvider, nonce: &[u8; 32]) -> Result<()> {
        let next_epoch = self.epoch + 1;
        let mut ikm = Zeroizing::new(Vec::with_capacity(64));
        ikm.extend_from_slice(self.c2s.as_ref());
        ikm.extend_from_slice(self.s2c.as_ref());

        let mut info = Vec::with_capacity(19 + 4);
        info.extend_from_slice(b"qsftp v1 rotation ");
        info.extend_from_slice(&next_epoch.to_be_bytes());

        let mut okm = Zeroizing::new([0u8; 64]);
        provider.derive_key(&ikm, nonce, &info, okm.as_mut())?;

        let mut c2s = Zeroizing::new([0u8; 32]);
        let mut s2c = Zeroizing::new([0u8; 32]);
        c2s.copy_from_slice(&okm[..32]);
        s2c.copy_from_slice(&okm[32..]);

        self.previous = Some(RetiredEpoch {
            epoch: self.epoch,
            c2s: std::mem::replace(&mut self.c2s, c2s),
            s2c: std::mem::replace(&mut self.s2c, s2c),
            retired_at: Instant::now(),
            grace: Duration::from_secs(ROTATION_GRACE_SECS),
        });
        self.epoch = next_epoch;
        self.send_counter = 0;
        self.bytes_protected = 0;
        self.epoch_started = Instant::now();
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// File operations
// ---------------------------------------------------------------------------

/// Client-to-server file operation requests.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum FileOperation {
    /// Open `path`; `write` selects upload vs download intent.
    Open { path: String, write: bool },
    /// Stream the contents of an open handle to the requester.
    Read { handle: u32 },
    /// Announce an inbound chunk stream for an open handle. The receiver
    /// lays chunks out at `chunk_size` offsets, so the sender's size wins.
    Write { handle: u32, size: u64, chunk_count: u64, chunk_size: u32 },
    Close { handle: u32 },
    Stat { path: String },
}

impl FileOperation {
    fn action_name(&self) -> &'static str {
        match self {
            FileOperation::Open { write: true, .. } => "open-write",
            FileOperation::Open { .. } => "open",
            FileOperation::Read { .. } => "read",
            FileOperation::Write { .. } => "write",
            FileOperation::Close { .. } => "close",
            FileOperation::Stat { .. } => "stat",
        }
    }

    fn audit_action(&self) -> AuditAction {
        match self {
            FileOperation::Open { .. } => AuditAction::FileOpen,
            FileOperation::Read { .. } => AuditAction::FileRead,
            FileOperation::Write { .. } => AuditAction::FileWrite,
            FileOperation::Close { .. } => AuditAction::FileClose,
            FileOperation::Stat { .. } => AuditAction::FileStat,
        }
    }
}

/// Server-to-client file operation responses.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum FileResponse {
    Handle { handle: u32 },
    /// A chunk stream for `handle` follows this response.
    Stream { handle: u32, size: u64, chunk_count: u64, chunk_size: u32 },
    Stat { size: u64, modified: Option<i64> },
    Closed { handle: u32 },
}

/// One chunk of a transfer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkPayload {
    pub handle: u32,
    pub index: u64,
    pub count: u64,
    /// Hash of `data` under the session's negotiated hash.
    pub hash: [u8; 32],
    pub data: Vec<u8>,
}

/// Control-plane messages.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ControlMessage {
    /// Rotate session keys; both sides derive the next epoch from `nonce`.
    KeyRotation { nonce: [u8; 32] },
    /// Re-request the named chunks.
    ChunkNak { handle: u32, indices: Vec<u64> },
    /// Sender finished; `cumulative` commits to the whole transfer.
    TransferComplete { handle: u32, cumulative: [u8; 32] },
    Heartbeat,
    Teardown,
}

/// Typed failure surfaced to the peer in an ErrorResponse frame.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorInfo {
    pub kind: String,
    pub message: String,
    pub recoverable: bool,
}

// ---------------------------------------------------------------------------
// Collaborator traits
// ---------------------------------------------------------------------------

/// Per-operation authorization policy, consulted before any file access.
/// A denial is recoverable: the operation is refused and audited, the
/// session continues.
#[async_trait::async_trait]
pub trait Authorizer: Send + Sync {
    async fn authorize(&self, identity: &Identity, resource: &str, action: &str) -> Result<()>;
}

/// Policy that permits everything. Development and tests only.
pub struct AllowAll;

#[async_trait::async_trait]
impl Authorizer for AllowAll {
    async fn authorize(&self, _identity: &Identity, _resource: &str, _action: &str) -> Result<()> {
        Ok(())
    }
}

/// File metadata returned by [`FileBackend::stat`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileInfo {
    pub size: u64,
    /// Unix milliseconds, if the backend tracks it.
    pub modified: Option<i64>,
}

/// Storage behind the session engine. Handles are backend-assigned.
#[async_trait::async_trait]
pub trait FileBackend: Send + Sync {
    async fn open(&self, path: &str, write: bool) -> Result<u32>;
    async fn stat(&self, path: &str) -> Result<FileInfo>;
    async fn stat_handle(&self, handle: u32) -> Result<FileInfo>;
    async fn read_chunk(&self, handle: u32, index: u64, chunk_size: usize) -> Result<Vec<u8>>;
    async fn write_chunk(&self, handle: u32, index: u64, chunk_size: usize, data: &[u8]) -> Result<()>;
    async fn close(&self, handle: u32) -> Result<()>;
}

/// In-memory backend for tests and loopback use.
pub struct MemoryBackend {
    inner: Mutex<MemoryInner>,
}

#[derive(Default)]
struct MemoryInner {
    files: HashMap<String, Vec<u8>>,
    handles: HashMap<u32, String>,
    next_handle: u32,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self { inner: Mutex::new(MemoryInner { next_handle: 1, ..Default::default() }) }
    }

    /// Seed a file, for tests.
    pub fn insert(&self, path: impl Into<String>, data: Vec<u8>) -> Result<()> {
        self.lock()?.files.insert(path.into(), data);
        Ok(())
    }

    pub fn contents(&self, path: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.lock()?.files.get(path).cloned())
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, MemoryInner>> {
        self.inner
            .lock()
            .map_err(|_| Error::Internal("memory backend lock poisoned".to_string()))
    }
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl FileBackend for MemoryBackend {
    async fn open(&self, path: &str, write: bool) -> Result<u32> {
        let mut inner = self.lock()?;
        if !write && !inner.files.contains_key(path) {
            return Err(Error::File(format!("no such file: {path}")));
        }
        if write {
            // Same semantics as File::create: truncate any existing file.
            inner.files.insert(path.to_string(), Vec::new());
        }
        let handle = inner.next_handle;
        inner.next_handle += 1;
        inner.handles.insert(handle, path.to_string());
        Ok(handle)
    }

    async fn stat(&self, path: &str) -> Result<FileInfo> {
        let inner = self.lock()?;
        let data = inner
            .files
            .get(path)
            .ok_or_else(|| Error::File(format!("no such file: {path}")))?;
        Ok(FileInfo { size: data.len() as u64, modified: None })
    }

    async fn stat_handle(&self, handle: u32) -> Result<FileInfo> {
        let inner = self.lock()?;
        let path = inner
            .handles
            .get(&handle)
            .ok_or_else(|| Error::File(format!("stale handle: {handle}")))?;
        let data = inner
            .files
            .get(path)
            .ok_or_else(|| Error::File(format!("no such file: {path}")))?;
        Ok(FileInfo { size: data.len() as u64, modified: None })
    }

    async fn read_chunk(&self, handle: u32, index: u64, chunk_size: usize) -> Result<Vec<u8>> {
        let inner = self.lock()?;
        let path = inner
            .handles
            .get(&handle)
            .ok_or_else(|| Error::File(format!("stale handle: {handle}")))?;
        let data = inner
            .files
            .get(path)
            .ok_or_else(|| Error::File(format!("no such file: {path}")))?;
        let start = (index as usize).saturating_mul(chunk_size).min(data.len());
        let end = start.saturating_add(chunk_size).min(data.len());
        Ok(data[start..end].to_vec())
    }

    async fn write_chunk(&self, handle: u32, index: u64, chunk_size: usize, data: &[u8]) -> Result<()> {
        let mut inner = self.lock()?;
        let path = inner
            .handles
            .get(&handle)
            .ok_or_else(|| Error::File(format!("stale handle: {handle}")))?
            .clone();
        let file = inner.files.entry(path).or_default();
        let start = (index as usize).saturating_mul(chunk_size);
        if file.len() < start + data.len() {
            file.resize(start + data.len(), 0);
        }
        file[start..start + data.len()].copy_from_slice(data);
        Ok(())
    }

    async fn close(&self, handle: u32) -> Result<()> {
        self.lock()?.handles.remove(&handle);
        Ok(())
    }
}

/// Filesystem backend rooted at a directory. Remote paths are resolved
/// inside the root; absolute paths and parent components are refused.
pub struct DiskBackend {
    root: std::path::PathBuf,
    inner: Mutex<DiskInner>,
}

#[derive(Default)]
struct DiskInner {
    handles: HashMap<u32, std::path::PathBuf>,
    next_handle: u32,
}

impl DiskBackend {
    pub fn new(root: impl Into<std::path::PathBuf>) -> Self {
        Self {
            root: root.into(),
            inner: Mutex::new(DiskInner { next_handle: 1, ..Default::default() }),
        }
    }

    fn resolve(&self, path: &str) -> Result<std::path::PathBuf> {
        use std::path::Component;
        let relative = std::path::Path::new(path);
        if relative.components().any(|c| !matches!(c, Component::Normal(_))) {
            return Err(Error::File(format!("path escapes transfer root: {path}")));
        }
        Ok(self.root.join(relative))
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, DiskInner>> {
        self.inner
            .lock()
            .map_err(|_| Error::Internal("disk backend lock poisoned".to_string()))
    }

    fn handle_path(&self, handle: u32) -> Result<std::path::PathBuf> {
        self.lock()?
            .handles
            .get(&handle)
            .cloned()
            .ok_or_else(|| Error::File(format!("stale handle: {handle}")))
    }
}

async fn disk_info(path: &std::path::Path) -> Result<FileInfo> {
    let metadata = tokio::fs::metadata(path)
        .await
        .map_err(|e| Error::File(format!("{}: {e}", path.display())))?;
    let modified = metadata
        .modified()
        .ok()
        .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
        .map(|d| d.as_millis() as i64);
    Ok(FileInfo { size: metadata.len(), modified })
}

#[async_trait::async_trait]
impl FileBackend for DiskBackend {
    async fn open(&self, path: &str, write: bool) -> Result<u32> {
        let resolved = self.resolve(path)?;
        if write {
            if let Some(parent) = resolved.parent() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .map_err(|e| Error::File(format!("{}: {e}", parent.display())))?;
            }
            tokio::fs::File::create(&resolved)
                .await
                .map_err(|e| Error::File(format!("{}: {e}", resolved.display())))?;
        } else if !tokio::fs::try_exists(&resolved).await.unwrap_or(false) {
            return Err(Error::File(format!("no such file: {path}")));
        }
        let mut inner = self.lock()?;
        let handle = inner.next_handle;
        inner.next_handle += 1;
        inner.handles.insert(handle, resolved);
        Ok(handle)
    }

    async fn stat(&self, path: &str) -> Result<FileInfo> {
        disk_info(&self.resolve(path)?).await
    }

    async fn stat_handle(&self, handle: u32) -> Result<FileInfo> {
        disk_info(&self.handle_path(handle)?).await
    }

    async fn read_chunk(&self, handle: u32, index: u64, chunk_size: usize) -> Result<Vec<u8>> {
        use tokio::io::{AsyncReadExt, AsyncSeekExt};
        let path = self.handle_path(handle)?;
        let mut file = tokio::fs::File::open(&path)
            .await
            .map_err(|e| Error::File(format!("{}: {e}", path.display())))?;
        file.seek(std::io::SeekFrom::Start(index * chunk_size as u64)).await?;
        let mut buf = vec![0u8; chunk_size];
        let mut filled = 0;
        loop {
            let n = file.read(&mut buf[filled..]).await?;
            if n == 0 {
                break;
            }
            filled += n;
            if filled == buf.len() {
                break;
            }
        }
        buf.truncate(filled);
        Ok(buf)
    }

    async fn write_chunk(&self, handle: u32, index: u64, chunk_size: usize, data: &[u8]) -> Result<()> {
        use tokio::io::{AsyncSeekExt, AsyncWriteExt};
        let path = self.handle_path(handle)?;
        let mut file = tokio::fs::OpenOptions::new()
            .write(true)
            .create(true)
            .open(&path)
            .await
            .map_err(|e| Error::File(format!("{}: {e}", path.display())))?;
        file.seek(std::io::SeekFrom::Start(index * chunk_size as u64)).await?;
        file.write_all(data).await?;
        file.flush().await?;
        Ok(())
    }

    async fn close(&self, handle: u32) -> Result<()> {
        self.lock()?.handles.remove(&handle);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Transfer reassembly
// ---------------------------------------------------------------------------

/// Per-chunk commitment: `H(index ‖ chunk_hash)`. XORing these is the
/// order-independent cumulative transfer hash.
fn chunk_commitment(provider: &dyn CryptoProvider, suite: &CipherSuite, index: u64, hash: &[u8; 32]) -> [u8; 32] {
    let mut input = [0u8; 40];
    input[..8].copy_from_slice(&index.to_be_bytes());
    input[8..].copy_from_slice(hash);
    provider.hash(suite.hash, &input)
}

fn xor_into(acc: &mut [u8; 32], commitment: &[u8; 32]) {
    for (a, c) in acc.iter_mut().zip(commitment) {
        *a ^= c;
    }
}

/// Receiver-side reassembly state for one chunked transfer. Chunks arrive
/// in any order; duplicates with the same hash are idempotent.
pub struct Transfer {
    handle: u32,
    chunk_count: u64,
    verified: Vec<Option<[u8; 32]>>,
    received: u64,
    cumulative: [u8; 32],
    bytes: u64,
    started: Instant,
    /// Set once the peer announces completion; checked when the last
    /// outstanding chunk lands.
    expected_cumulative: Option<[u8; 32]>,
}

impl Transfer {
    pub fn new(handle: u32, chunk_count: u64) -> Self {
        Self {
            handle,
            chunk_count,
            verified: vec![None; chunk_count as usize],
            received: 0,
            cumulative: [0u8; 32],
            bytes: 0,
            started: Instant::now(),
            expected_cumulative: None,
        }
    }

    pub fn handle(&self) -> u32 {
        self.handle
    }

    /// Verify and record one chunk. The chunk's own hash must match its
    /// data; a mismatch is recoverable via re-request.
    pub fn accept_chunk(
        &mut self,
        provider: &dyn CryptoProvider,
        suite: &CipherSuite,
        index: u64,
        hash: &[u8; 32],
        data: &[u8],
    ) -> Result<()> {
        if index >= self.chunk_count {
            return Err(IntegrityError::UnknownChunk { index }.into());
        }
        let actual = provider.hash(suite.hash, data);
        if actual != *hash {
            return Err(IntegrityError::ChunkMismatch { index }.into());
        }
        match &self.verified[index as usize] {
            Some(existing) if existing == hash => Ok(()),
            Some(_) => Err(IntegrityError::ChunkMismatch { index }.into()),
            None => {
                self.verified[index as usize] = Some(*hash);
                self.received += 1;
                self.bytes += data.len() as u64;
                xor_into(&mut self.cumulative, &chunk_commitment(provider, suite, index, hash));
                Ok(())
            }
        }
    }

    pub fn is_complete(&self) -> bool {
        self.received == self.chunk_count
    }

    pub fn missing_indices(&self) -> Vec<u64> {
        self.verified
            .iter()
            .enumerate()
            .filter(|(_, v)| v.is_none())
            .map(|(i, _)| i as u64)
            .collect()
    }

    pub fn cumulative_hash(&self) -> [u8; 32] {
        self.cumulative
    }

    /// Final check against the sender's announced cumulative hash.
    pub fn verify_cumulative(&self, expected: &[u8; 32]) -> Result<()> {
        if !self.is_complete() || self.cumulative != *expected {
            return Err(IntegrityError::CumulativeMismatch.into());
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Session engine
// ---------------------------------------------------------------------------

/// Events surfaced to the engine's driver alongside reply frames.
#[derive(Debug)]
pub enum EngineEvent {
    Response(FileResponse),
    ChunkStored { handle: u32, index: u64 },
    TransferComplete { handle: u32, cumulative: [u8; 32], bytes: u64 },
    RotationApplied { epoch: u32 },
    PeerError(ErrorInfo),
    SessionClosed,
}

/// Output of feeding one frame into the engine.
#[derive(Default)]
pub struct EngineOutput {
    pub replies: Vec<Frame>,
    pub events: Vec<EngineEvent>,
}

impl EngineOutput {
    fn reply(frame: Frame) -> Self {
        Self { replies: vec![frame], events: Vec::new() }
    }

    fn event(event: EngineEvent) -> Self {
        Self { replies: Vec::new(), events: vec![event] }
    }
}

struct ReceiveState {
    transfer: Transfer,
    backend_handle: u32,
    resource: String,
    /// The sender's chunk size; chunk offsets are computed from it, not
    /// from this engine's own send-side setting.
    chunk_size: usize,
}

struct SendState {
    backend_handle: u32,
    chunk_count: u64,
    resource: String,
}

/// Drives one established session. The initiator issues file operations;
/// the responder serves them; both sides send and receive chunk streams
/// and control messages.
pub struct SessionEngine {
    session_id: Uuid,
    role: Role,
    suite: CipherSuite,
    keys: SessionKeys,
    peer: Identity,
    provider: Arc<dyn CryptoProvider>,
    signing: Arc<SigningIdentity>,
    ledger: Arc<AuditLedger>,
    authorizer: Arc<dyn Authorizer>,
    backend: Arc<dyn FileBackend>,
    recovery: RecoveryController,
    chunk_size: usize,
    receives: HashMap<u32, ReceiveState>,
    sends: HashMap<u32, SendState>,
    /// Paths bound to open wire handles, for audit resources.
    open_paths: HashMap<u32, String>,
    closed: bool,
}

impl SessionEngine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        established: EstablishedSession,
        role: Role,
        provider: Arc<dyn CryptoProvider>,
        signing: Arc<SigningIdentity>,
        ledger: Arc<AuditLedger>,
        authorizer: Arc<dyn Authorizer>,
        backend: Arc<dyn FileBackend>,
    ) -> Self {
        Self {
            session_id: established.session_id,
            role,
            suite: established.suite,
            keys: established.keys,
            peer: established.peer,
            provider,
            signing,
            ledger,
            authorizer,
            backend,
            recovery: RecoveryController::new(),
            chunk_size: DEFAULT_CHUNK_SIZE,
            receives: HashMap::new(),
            sends: HashMap::new(),
            open_paths: HashMap::new(),
            closed: false,
        }
    }

    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size;
        self
    }

    pub fn session_id(&self) -> Uuid {
        self.session_id
    }

    pub fn peer(&self) -> &Identity {
        &self.peer
    }

    pub fn suite(&self) -> CipherSuite {
        self.suite
    }

    pub fn keys(&self) -> &SessionKeys {
        &self.keys
    }

    pub fn keys_mut(&mut self) -> &mut SessionKeys {
        &mut self.keys
    }

    // ---- frame protection ----------------------------------------------

    /// Session-bound AAD: session id ‖ frame type ‖ key epoch.
    fn aad(&self, frame_type: FrameType, wire_epoch: u8) -> [u8; 18] {
        let mut aad = [0u8; 18];
        aad[..16].copy_from_slice(self.session_id.as_bytes());
        aad[16] = frame_type as u8;
        aad[17] = wire_epoch;
        aad
    }

    /// Seal and sign a plaintext into a protected frame.
    pub fn seal(
        &mut self,
        frame_type: FrameType,
        flags: FrameFlags,
        plaintext: &[u8],
    ) -> Result<Frame> {
        let wire_epoch = self.keys.wire_epoch();
        let nonce = self.keys.next_nonce();
        let aad = self.aad(frame_type, wire_epoch);
        let ciphertext =
            self.provider
                .aead_seal(self.suite.aead, self.keys.send_key(), &nonce, &aad, plaintext)?;

        let mut payload = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        payload.extend_from_slice(&nonce);
        payload.extend_from_slice(&ciphertext);

        let mut frame = Frame::new(frame_type, payload);
        frame.flags = flags;
        frame.flags.encrypted = true;
        frame.flags.signed = true;
        frame.flags.key_epoch = wire_epoch;

        let signature = self.provider.sign(&self.signing, &frame.signing_input())?;
        self.keys.note_protected(frame.payload.len() as u64);
        Ok(frame.with_signature(signature))
    }

    /// Verify and unseal a protected frame: signature first, then AEAD
    /// under the key for the frame's epoch.
    pub fn open(&self, frame: &Frame) -> Result<Vec<u8>> {
        if !frame.flags.signed || !frame.flags.encrypted {
            return Err(CryptoError::Aead("unprotected frame on established session".to_string()).into());
        }
        let signature = frame
            .signature
            .as_ref()
            .ok_or_else(|| CryptoError::Signature("missing signature".to_string()))?;
        self.provider
            .verify(&self.peer.verifying_key, &frame.signing_input(), signature)?;

        if frame.payload.len() < NONCE_LEN {
            return Err(CryptoError::Aead("payload shorter than nonce".to_string()).into());
        }
        let key = self
            .keys
            .recv_key_for(frame.flags.key_epoch)
            .ok_or_else(|| CryptoError::Aead(format!("unknown key epoch {}", frame.flags.key_epoch)))?;
        let mut nonce = [0u8; NONCE_LEN];
        nonce.copy_from_slice(&frame.payload[..NONCE_LEN]);
        let aad = self.aad(frame.frame_type, frame.flags.key_epoch);
        self.provider
            .aead_open(self.suite.aead, key, &nonce, &aad, &frame.payload[NONCE_LEN..])
    }

    // ---- initiator-side builders ---------------------------------------

    /// Build a sealed file operation request frame.
    pub fn request(&mut self, operation: &FileOperation) -> Result<Frame> {
        let payload = postcard::to_allocvec(operation)?;
        self.seal(FrameType::FileOperation, FrameFlags::default(), &payload)
    }

    /// Register an inbound chunk stream, writing to `dest_path` through
    /// the backend. `wire_handle` is the handle the peer will stamp on
    /// each chunk; `chunk_size` is the sender's announced chunk size.
    pub async fn begin_receive(
        &mut self,
        wire_handle: u32,
        dest_path: &str,
        chunk_count: u64,
        chunk_size: u32,
    ) -> Result<()> {
        let backend_handle = self.backend.open(dest_path, true).await?;
        self.receives.insert(
            wire_handle,
            ReceiveState {
                transfer: Transfer::new(wire_handle, chunk_count),
                backend_handle,
                resource: dest_path.to_string(),
                chunk_size: chunk_size as usize,
            },
        );
        Ok(())
    }

    /// Produce the full sealed chunk stream for an open backend handle,
    /// followed by the TransferComplete control frame.
    pub async fn send_file(&mut self, wire_handle: u32, backend_handle: u32, resource: &str) -> Result<Vec<Frame>> {
        let info = self.backend.stat_handle(backend_handle).await?;
        let chunk_count = chunk_count_for(info.size, self.chunk_size);
        self.sends.insert(
            wire_handle,
            SendState { backend_handle, chunk_count, resource: resource.to_string() },
        );

        let mut frames = Vec::with_capacity(chunk_count as usize + 1);
        let mut cumulative = [0u8; 32];
        for index in 0..chunk_count {
            let frame = self.chunk_frame(wire_handle, backend_handle, index, chunk_count, false).await?;
            frames.push(frame.0);
            xor_into(&mut cumulative, &chunk_commitment(&*self.provider, &self.suite, index, &frame.1));
        }

        self.audit(
            AuditAction::TransferComplete,
            AuditOutcome::Success,
            Some(resource),
            Some(AuditMetadata {
                file_size: Some(info.size),
                chunks: Some(chunk_count),
                duration_ms: None,
            }),
        )?;
        let control = ControlMessage::TransferComplete { handle: wire_handle, cumulative };
        let mut flags = FrameFlags::default();
        flags.final_frame = true;
        frames.push(self.seal(FrameType::Control, flags, &postcard::to_allocvec(&control)?)?);
        Ok(frames)
    }

    /// One sealed chunk frame; returns the frame and the chunk hash.
    async fn chunk_frame(
        &mut self,
        wire_handle: u32,
        backend_handle: u32,
        index: u64,
        count: u64,
        retry: bool,
    ) -> Result<(Frame, [u8; 32])> {
        let data = self.backend.read_chunk(backend_handle, index, self.chunk_size).await?;
        let hash = self.provider.hash(self.suite.hash, &data);
        let chunk = ChunkPayload { handle: wire_handle, index, count, hash, data };
        let mut flags = FrameFlags::default();
        flags.chunked = true;
        flags.retry = retry;
        flags.final_frame = index + 1 == count;
        let frame = self.seal(FrameType::DataTransfer, flags, &postcard::to_allocvec(&chunk)?)?;
        Ok((frame, hash))
    }

    /// Rotate session keys if a budget is exhausted. The returned control
    /// frame is sealed under the outgoing epoch and must be sent to the
    /// peer before any frame under the new epoch.
    pub fn maybe_rotate(&mut self) -> Result<Option<Frame>> {
        if !self.keys.needs_rotation() {
            return Ok(None);
        }
        let mut nonce = [0u8; 32];
        self.provider.random(&mut nonce)?;
        let control = ControlMessage::KeyRotation { nonce };
        let frame = self.seal(FrameType::Control, FrameFlags::default(), &postcard::to_allocvec(&control)?)?;
        self.keys.rotate(&*self.provider, &nonce)?;
        self.audit(AuditAction::KeyRotation, AuditOutcome::Success, None, None)?;
        tracing::info!(session = %self.session_id, epoch = self.keys.epoch(), "session keys rotated");
        Ok(Some(frame))
    }

    /// Build the teardown control frame and audit session end.
    pub fn teardown(&mut self) -> Result<Frame> {
        let frame = self.seal(
            FrameType::Control,
            FrameFlags::default(),
            &postcard::to_allocvec(&ControlMessage::Teardown)?,
        )?;
        self.close()?;
        Ok(frame)
    }

    /// Audit session end once. Idempotent.
    pub fn close(&mut self) -> Result<()> {
        if !self.closed {
            self.closed = true;
            self.audit(AuditAction::SessionEnd, AuditOutcome::Success, None, None)?;
        }
        Ok(())
    }

    // ---- dispatch -------------------------------------------------------

    /// Feed one peer frame. Replies are already sealed; errors escalate to
    /// the caller for classification.
    pub async fn handle_frame(&mut self, frame: Frame) -> Result<EngineOutput> {
        let plaintext = self.open(&frame)?;
        match frame.frame_type {
            FrameType::FileOperation => match self.role {
                Role::Responder => {
                    let operation: FileOperation = decode_payload(frame.frame_type, &plaintext)?;
                    self.serve_operation(operation).await
                }
                Role::Initiator => {
                    let response: FileResponse = decode_payload(frame.frame_type, &plaintext)?;
                    Ok(EngineOutput::event(EngineEvent::Response(response)))
                }
            },
            FrameType::DataTransfer => {
                let chunk: ChunkPayload = decode_payload(frame.frame_type, &plaintext)?;
                self.accept_chunk(chunk).await
            }
            FrameType::Control => {
                let control: ControlMessage = decode_payload(frame.frame_type, &plaintext)?;
                self.handle_control(control).await
            }
            FrameType::ErrorResponse => {
                let info: ErrorInfo = decode_payload(frame.frame_type, &plaintext)?;
                tracing::warn!(session = %self.session_id, kind = %info.kind, "peer reported error");
                Ok(EngineOutput::event(EngineEvent::PeerError(info)))
            }
            other => Err(HandshakeError::UnexpectedMessage {
                state: "SessionEstablished",
                frame_type: other.name(),
            }
            .into()),
        }
    }

    async fn serve_operation(&mut self, operation: FileOperation) -> Result<EngineOutput> {
        let resource = self.operation_resource(&operation);
        if let Err(denied) = self
            .authorizer
            .authorize(&self.peer, &resource, operation.action_name())
            .await
        {
            return self.deny(&operation, &resource, denied);
        }

        let result = self.apply_operation(&operation).await;
        match result {
            Ok(output) => {
                self.audit(operation.audit_action(), AuditOutcome::Success, Some(&resource), None)?;
                Ok(output)
            }
            Err(err) => {
                self.audit(operation.audit_action(), AuditOutcome::Failure, Some(&resource), None)?;
                let reply = self.error_frame(&err)?;
                tracing::warn!(session = %self.session_id, resource = %resource, error = %err, "operation failed");
                Ok(EngineOutput::reply(reply))
            }
        }
    }

    async fn apply_operation(&mut self, operation: &FileOperation) -> Result<EngineOutput> {
        match operation {
            FileOperation::Open { path, write } => {
                let handle = self.backend.open(path, *write).await?;
                self.open_paths.insert(handle, path.clone());
                let reply = self.response_frame(&FileResponse::Handle { handle })?;
                Ok(EngineOutput::reply(reply))
            }
            FileOperation::Read { handle } => {
                let resource = self
                    .open_paths
                    .get(handle)
                    .cloned()
                    .ok_or_else(|| Error::File(format!("stale handle: {handle}")))?;
                let info = self.backend.stat_handle(*handle).await?;
                let chunk_count = chunk_count_for(info.size, self.chunk_size);
                let mut replies = vec![self.response_frame(&FileResponse::Stream {
                    handle: *handle,
                    size: info.size,
                    chunk_count,
                    chunk_size: self.chunk_size as u32,
                })?];
                replies.extend(self.send_file(*handle, *handle, &resource).await?);
                Ok(EngineOutput { replies, events: Vec::new() })
            }
            FileOperation::Write { handle, size: _, chunk_count, chunk_size } => {
                let resource = self
                    .open_paths
                    .get(handle)
                    .cloned()
                    .ok_or_else(|| Error::File(format!("stale handle: {handle}")))?;
                self.receives.insert(
                    *handle,
                    ReceiveState {
                        transfer: Transfer::new(*handle, *chunk_count),
                        backend_handle: *handle,
                        resource,
                        chunk_size: *chunk_size as usize,
                    },
                );
                Ok(EngineOutput::default())
            }
            FileOperation::Close { handle } => {
                self.backend.close(*handle).await?;
                self.open_paths.remove(handle);
                let reply = self.response_frame(&FileResponse::Closed { handle: *handle })?;
                Ok(EngineOutput::reply(reply))
            }
            FileOperation::Stat { path } => {
                let info = self.backend.stat(path).await?;
                let reply = self.response_frame(&FileResponse::Stat {
                    size: info.size,
                    modified: info.modified,
                })?;
                Ok(EngineOutput::reply(reply))
            }
        }
    }

    /// Verify and store one inbound chunk. A hash mismatch triggers a
    /// bounded re-request; exhausting the retry budget aborts the transfer.
    async fn accept_chunk(&mut self, chunk: ChunkPayload) -> Result<EngineOutput> {
        let state = self
            .receives
            .get_mut(&chunk.handle)
            .ok_or(IntegrityError::UnknownChunk { index: chunk.index })?;

        match state.transfer.accept_chunk(&*self.provider, &self.suite, chunk.index, &chunk.hash, &chunk.data) {
            Ok(()) => {}
            Err(Error::Integrity(IntegrityError::ChunkMismatch { index })) => {
                let resource = state.resource.clone();
                return match self.recovery.on_chunk_failure(chunk.handle, index) {
                    RetryDecision::Retry { attempt, delay } => {
                        tracing::warn!(
                            session = %self.session_id,
                            handle = chunk.handle,
                            index,
                            attempt,
                            delay_ms = delay.as_millis() as u64,
                            "chunk hash mismatch, re-requesting"
                        );
                        let nak = ControlMessage::ChunkNak { handle: chunk.handle, indices: vec![index] };
                        let mut flags = FrameFlags::default();
                        flags.retry = true;
                        let reply = self.seal(FrameType::Control, flags, &postcard::to_allocvec(&nak)?)?;
                        Ok(EngineOutput::reply(reply))
                    }
                    RetryDecision::Fail => {
                        self.abort_transfer(chunk.handle, &resource)?;
                        Err(IntegrityError::RetriesExhausted { index }.into())
                    }
                };
            }
            Err(err) => return Err(err),
        }

        self.recovery.reset_chunk(chunk.handle, chunk.index);
        let (backend_handle, chunk_size) = (state.backend_handle, state.chunk_size);
        self.backend
            .write_chunk(backend_handle, chunk.index, chunk_size, &chunk.data)
            .await?;

        let mut output = EngineOutput::event(EngineEvent::ChunkStored {
            handle: chunk.handle,
            index: chunk.index,
        });
        // A retried chunk may have been the last outstanding one.
        if let Some(finished) = self.try_finalize(chunk.handle).await? {
            output.events.push(finished);
        }
        Ok(output)
    }

    async fn handle_control(&mut self, control: ControlMessage) -> Result<EngineOutput> {
        match control {
            ControlMessage::KeyRotation { nonce } => {
                self.keys.rotate(&*self.provider, &nonce)?;
                self.audit(AuditAction::KeyRotation, AuditOutcome::Success, None, None)?;
                tracing::info!(session = %self.session_id, epoch = self.keys.epoch(), "applied peer key rotation");
                Ok(EngineOutput::event(EngineEvent::RotationApplied { epoch: self.keys.epoch() }))
            }
            ControlMessage::ChunkNak { handle, indices } => {
                let send = self
                    .sends
                    .get(&handle)
                    .ok_or(IntegrityError::UnknownChunk { index: indices.first().copied().unwrap_or(0) })?;
                let (backend_handle, count) = (send.backend_handle, send.chunk_count);
                let mut replies = Vec::with_capacity(indices.len());
                for index in indices {
                    if index >= count {
                        return Err(IntegrityError::UnknownChunk { index }.into());
                    }
                    let (frame, _) = self.chunk_frame(handle, backend_handle, index, count, true).await?;
                    replies.push(frame);
                }
                Ok(EngineOutput { replies, events: Vec::new() })
            }
            ControlMessage::TransferComplete { handle, cumulative } => {
                let state = self
                    .receives
                    .get_mut(&handle)
                    .ok_or(IntegrityError::UnknownChunk { index: 0 })?;
                state.transfer.expected_cumulative = Some(cumulative);
                if !state.transfer.is_complete() {
                    let missing = state.transfer.missing_indices();
                    tracing::debug!(session = %self.session_id, handle, missing = missing.len(), "completion with gaps, re-requesting");
                    let nak = ControlMessage::ChunkNak { handle, indices: missing };
                    let mut flags = FrameFlags::default();
                    flags.retry = true;
                    let reply = self.seal(FrameType::Control, flags, &postcard::to_allocvec(&nak)?)?;
                    return Ok(EngineOutput::reply(reply));
                }
                match self.try_finalize(handle).await? {
                    Some(event) => Ok(EngineOutput::event(event)),
                    None => Ok(EngineOutput::default()),
                }
            }
            ControlMessage::Heartbeat => Ok(EngineOutput::default()),
            ControlMessage::Teardown => {
                self.close()?;
                Ok(EngineOutput::event(EngineEvent::SessionClosed))
            }
        }
    }

    /// Complete a receive if all chunks landed and the sender's cumulative
    /// hash is known. A cumulative mismatch is not per-chunk recoverable.
    async fn try_finalize(&mut self, handle: u32) -> Result<Option<EngineEvent>> {
        let ready = match self.receives.get(&handle) {
            Some(state) => state.transfer.is_complete() && state.transfer.expected_cumulative.is_some(),
            None => false,
        };
        if !ready {
            return Ok(None);
        }
        let state = self
            .receives
            .remove(&handle)
            .ok_or_else(|| Error::Internal("receive state vanished".to_string()))?;
        let expected = state
            .transfer
            .expected_cumulative
            .ok_or_else(|| Error::Internal("cumulative vanished".to_string()))?;

        if let Err(err) = state.transfer.verify_cumulative(&expected) {
            self.abort_transfer(handle, &state.resource)?;
            return Err(err);
        }

        self.backend.close(state.backend_handle).await?;
        self.recovery.clear_transfer(handle);
        self.audit(
            AuditAction::TransferComplete,
            AuditOutcome::Success,
            Some(&state.resource),
            Some(AuditMetadata {
                file_size: Some(state.transfer.bytes),
                chunks: Some(state.transfer.chunk_count),
                duration_ms: Some(state.transfer.started.elapsed().as_millis() as u64),
            }),
        )?;
        tracing::info!(session = %self.session_id, handle, bytes = state.transfer.bytes, "transfer complete");
        Ok(Some(EngineEvent::TransferComplete {
            handle,
            cumulative: state.transfer.cumulative_hash(),
            bytes: state.transfer.bytes,
        }))
    }

    fn abort_transfer(&mut self, handle: u32, resource: &str) -> Result<()> {
        self.receives.remove(&handle);
        self.recovery.clear_transfer(handle);
        self.audit(AuditAction::TransferAborted, AuditOutcome::Failure, Some(resource), None)
    }

    fn deny(&mut self, operation: &FileOperation, resource: &str, denied: Error) -> Result<EngineOutput> {
        self.audit(operation.audit_action(), AuditOutcome::Denied, Some(resource), None)?;
        tracing::warn!(
            session = %self.session_id,
            principal = %self.peer.principal,
            resource = %resource,
            action = operation.action_name(),
            "operation denied"
        );
        let reply = self.error_frame(&denied)?;
        Ok(EngineOutput::reply(reply))
    }

    fn operation_resource(&self, operation: &FileOperation) -> String {
        match operation {
            FileOperation::Open { path, .. } | FileOperation::Stat { path } => path.clone(),
            FileOperation::Read { handle }
            | FileOperation::Write { handle, .. }
            | FileOperation::Close { handle } => self
                .open_paths
                .get(handle)
                .cloned()
                .unwrap_or_else(|| format!("handle:{handle}")),
        }
    }

    fn response_frame(&mut self, response: &FileResponse) -> Result<Frame> {
        let payload = postcard::to_allocvec(response)?;
        self.seal(FrameType::FileOperation, FrameFlags::default(), &payload)
    }

    fn error_frame(&mut self, err: &Error) -> Result<Frame> {
        let info = ErrorInfo {
            kind: error_kind(err).to_string(),
            message: err.to_string(),
            recoverable: matches!(
                crate::recovery::classify(err),
                crate::recovery::FailureClass::Recoverable
            ),
        };
        self.seal(FrameType::ErrorResponse, FrameFlags::default(), &postcard::to_allocvec(&info)?)
    }

    fn audit(
        &self,
        action: AuditAction,
        outcome: AuditOutcome,
        resource: Option<&str>,
        metadata: Option<AuditMetadata>,
    ) -> Result<()> {
        let mut event = AuditEvent::new(action, outcome)
            .with_session(self.session_id)
            .with_user(self.peer.principal.clone())
            .with_hardware(self.peer.device_id.clone());
        if let Some(resource) = resource {
            event = event.with_resource(resource);
        }
        if let Some(metadata) = metadata {
            event = event.with_metadata(metadata);
        }
        self.ledger.append(event)?;
        Ok(())
    }
}

impl Drop for SessionEngine {
    fn drop(&mut self) {
        if !self.closed {
            self.closed = true;
            self.ledger.append_best_effort(
                AuditEvent::new(AuditAction::SessionEnd, AuditOutcome::Failure)
                    .with_session(self.session_id)
                    .with_user(self.peer.principal.clone()),
            );
        }
    }
}

fn error_kind(err: &Error) -> &'static str {
    match err {
        Error::Format(_) => "format",
        Error::Handshake(_) => "handshake",
        Error::Integrity(_) => "integrity",
        Error::Authorization(_) => "authorization",
        Error::Ledger(_) => "ledger",
        Error::Crypto(_) => "crypto",
        Error::Transport(_) => "transport",
        Error::Hardware(_) => "hardware",
        Error::File(_) => "file",
        Error::Config(_) => "config",
        Error::Timeout(_) => "timeout",
        Error::Internal(_) => "internal",
    }
}

/// Decode an authenticated peer payload. Garbage inside a frame that
/// passed signature and AEAD checks means a broken peer; treated as
/// session-fatal, not a process bug.
fn decode_payload<T: serde::de::DeserializeOwned>(frame_type: FrameType, bytes: &[u8]) -> Result<T> {
    postcard::from_bytes(bytes)
        .map_err(|_| Error::Transport(format!("malformed {} payload", frame_type.name())))
}

/// Number of chunks covering `size` bytes. An empty file is one empty
/// chunk so the transfer protocol still runs end to end.
pub fn chunk_count_for(size: u64, chunk_size: usize) -> u64 {
    if size == 0 {
        return 1;
    }
    size.div_ceil(chunk_size as u64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::AuthorizationError;
    use crate::hardware::HardwareClass;
    use crate::primitives::SoftwareProvider;

    fn test_keys(role: Role) -> SessionKeys {
        SessionKeys::new(role, Zeroizing::new([1u8; 32]), Zeroizing::new([2u8; 32]))
    }

    fn test_identity(signing: &SigningIdentity, principal: &str) -> Identity {
        Identity {
            principal: principal.to_string(),
            verifying_key: signing.public_key().to_vec(),
            hardware: HardwareClass::SecurityToken,
            device_id: format!("dev-{principal}"),
        }
    }

    struct Pair {
        client: SessionEngine,
        server: SessionEngine,
        server_backend: Arc<MemoryBackend>,
        ledger: Arc<AuditLedger>,
    }

    fn make_pair(authorizer: Arc<dyn Authorizer>) -> Pair {
        let provider: Arc<dyn CryptoProvider> = Arc::new(SoftwareProvider::new());
        let (ledger_signing, _) = SigningIdentity::generate().unwrap();
        let ledger = Arc::new(AuditLedger::new(provider.clone(), ledger_signing));

        let (client_signing, _) = SigningIdentity::generate().unwrap();
        let (server_signing, _) = SigningIdentity::generate().unwrap();
        let client_identity = test_identity(&client_signing, "alice");
        let server_identity = test_identity(&server_signing, "server");

        let session_id = Uuid::new_v4();
        let suite = CipherSuite::default();
        let client_backend = Arc::new(MemoryBackend::new());
        let server_backend = Arc::new(MemoryBackend::new());

        let client = SessionEngine::new(
            EstablishedSession {
                session_id,
                suite,
                keys: test_keys(Role::Initiator),
                peer: server_identity,
            },
            Role::Initiator,
            provider.clone(),
            Arc::new(client_signing),
            ledger.clone(),
            Arc::new(AllowAll),
            client_backend,
        )
        .with_chunk_size(8);

        let server = SessionEngine::new(
            EstablishedSession {
                session_id,
                suite,
                keys: test_keys(Role::Responder),
                peer: client_identity,
            },
            Role::Responder,
            provider,
            Arc::new(server_signing),
            ledger.clone(),
            authorizer,
            server_backend.clone(),
        )
        .with_chunk_size(8);

        Pair { client, server, server_backend, ledger }
    }

    struct DenyAll;

    #[async_trait::async_trait]
    impl Authorizer for DenyAll {
        async fn authorize(&self, _identity: &Identity, resource: &str, action: &str) -> Result<()> {
            Err(AuthorizationError::Denied {
                resource: resource.to_string(),
                action: action.to_string(),
                reason: "policy".to_string(),
            }
            .into())
        }
    }

    fn first_response(output: &EngineOutput) -> &FileResponse {
        for event in &output.events {
            if let EngineEvent::Response(response) = event {
                return response;
            }
        }
        panic!("no response event");
    }

    #[test]
    fn test_session_keys_directions_pair_up() {
        let client = test_keys(Role::Initiator);
        let server = test_keys(Role::Responder);
        assert_eq!(client.send_key(), server.recv_key());
        assert_eq!(client.recv_key(), server.send_key());
    }

    #[test]
    fn test_rotation_agrees_and_keeps_grace_window() {
        let provider = SoftwareProvider::new();
        let mut client = test_keys(Role::Initiator);
        let mut server = test_keys(Role::Responder);
        let old_recv = *server.recv_key();

        let nonce = [9u8; 32];
        client.rotate(&provider, &nonce).unwrap();
        server.rotate(&provider, &nonce).unwrap();

        assert_eq!(client.epoch(), 1);
        assert_eq!(client.send_key(), server.recv_key());
        assert_ne!(*client.send_key(), [1u8; 32]);
        // Previous epoch still resolvable inside the grace window.
        assert_eq!(server.recv_key_for(0), Some(&old_recv));
        assert_eq!(server.recv_key_for(1), Some(server.recv_key()));
        assert_eq!(server.recv_key_for(7), None);
    }

    #[test]
    fn test_nonces_never_repeat_across_rotation() {
        let provider = SoftwareProvider::new();
        let mut keys = test_keys(Role::Initiator);
        let first = keys.next_nonce();
        let second = keys.next_nonce();
        assert_ne!(first, second);

        keys.rotate(&provider, &[4u8; 32]).unwrap();
        let rotated = keys.next_nonce();
        // Counter resets but the epoch prefix differs.
        assert_ne!(rotated, first);
        assert_eq!(&rotated[..4], &1u32.to_be_bytes());
    }

    #[test]
    fn test_byte_budget_triggers_rotation() {
        let mut keys = test_keys(Role::Initiator).with_budgets(100, Duration::from_secs(3600));
        assert!(!keys.needs_rotation());
        keys.note_protected(100);
        assert!(keys.needs_rotation());
    }

    #[test]
    fn test_transfer_out_of_order_reassembly() {
        let provider = SoftwareProvider::new();
        let suite = CipherSuite::default();
        let chunks: Vec<&[u8]> = vec![b"aaaa", b"bbbb", b"cccc", b"dd"];
        let mut transfer = Transfer::new(1, 4);

        for index in [2u64, 0, 3] {
            let hash = provider.hash(suite.hash, chunks[index as usize]);
            transfer.accept_chunk(&provider, &suite, index, &hash, chunks[index as usize]).unwrap();
        }
        assert_eq!(transfer.missing_indices(), vec![1]);
        assert!(!transfer.is_complete());

        let hash = provider.hash(suite.hash, chunks[1]);
        transfer.accept_chunk(&provider, &suite, 1, &hash, chunks[1]).unwrap();
        assert!(transfer.is_complete());

        // Cumulative hash is arrival-order independent.
        let mut in_order = Transfer::new(1, 4);
        for (index, chunk) in chunks.iter().enumerate() {
            let hash = provider.hash(suite.hash, chunk);
            in_order.accept_chunk(&provider, &suite, index as u64, &hash, chunk).unwrap();
        }
        assert_eq!(transfer.cumulative_hash(), in_order.cumulative_hash());
        transfer.verify_cumulative(&in_order.cumulative_hash()).unwrap();
    }

    #[test]
    fn test_transfer_rejects_corrupt_and_unknown_chunks() {
        let provider = SoftwareProvider::new();
        let suite = CipherSuite::default();
        let mut transfer = Transfer::new(1, 2);

        let hash = provider.hash(suite.hash, b"good");
        let err = transfer.accept_chunk(&provider, &suite, 0, &hash, b"evil").unwrap_err();
        assert!(matches!(err, Error::Integrity(IntegrityError::ChunkMismatch { index: 0 })));

        let err = transfer.accept_chunk(&provider, &suite, 9, &hash, b"good").unwrap_err();
        assert!(matches!(err, Error::Integrity(IntegrityError::UnknownChunk { index: 9 })));

        // Mismatch leaves no partial state behind.
        assert_eq!(transfer.missing_indices(), vec![0, 1]);
    }

    #[tokio::test]
    async fn test_seal_open_round_trip_and_signature_check() {
        let Pair { mut client, server, .. } = make_pair(Arc::new(AllowAll));

        let frame = client.seal(FrameType::Control, FrameFlags::default(), b"ping").unwrap();
        assert!(frame.flags.encrypted && frame.flags.signed);
        assert_eq!(server.open(&frame).unwrap(), b"ping");

        let mut forged = frame.clone();
        forged.payload[NONCE_LEN + 1] ^= 1;
        assert!(server.open(&forged).is_err());
    }

    #[tokio::test]
    async fn test_upload_round_trip() {
        let Pair { mut client, mut server, server_backend, ledger } = make_pair(Arc::new(AllowAll));
        let data = b"the quick brown fox jumps over the lazy dog".to_vec();
        let src = Arc::new(MemoryBackend::new());
        src.insert("src.txt", data.clone()).unwrap();
        client.backend = src.clone();

        // Open for write.
        let open = client
            .request(&FileOperation::Open { path: "dst.txt".to_string(), write: true })
            .unwrap();
        let output = server.handle_frame(open).await.unwrap();
        let handle = match first_response(&client.handle_frame(output.replies[0].clone()).await.unwrap()) {
            FileResponse::Handle { handle } => *handle,
            other => panic!("unexpected response: {other:?}"),
        };

        // Announce, then stream chunks.
        let chunk_count = chunk_count_for(data.len() as u64, 8);
        let announce = client
            .request(&FileOperation::Write {
                handle,
                size: data.len() as u64,
                chunk_count,
                chunk_size: 8,
            })
            .unwrap();
        assert!(server.handle_frame(announce).await.unwrap().replies.is_empty());

        let src_handle = src.open("src.txt", false).await.unwrap();
        let frames = client.send_file(handle, src_handle, "src.txt").await.unwrap();

        let mut completed = false;
        for frame in frames {
            let output = server.handle_frame(frame).await.unwrap();
            assert!(output.replies.is_empty(), "no naks expected on clean stream");
            for event in output.events {
                if let EngineEvent::TransferComplete { bytes, .. } = event {
                    assert_eq!(bytes, data.len() as u64);
                    completed = true;
                }
            }
        }
        assert!(completed);
        assert_eq!(server_backend.contents("dst.txt").unwrap().unwrap(), data);

        let records = ledger.records();
        assert!(records.iter().any(|r| r.action == AuditAction::FileOpen));
        assert!(records.iter().any(|r| r.action == AuditAction::FileWrite));
        assert!(records
            .iter()
            .any(|r| r.action == AuditAction::TransferComplete
                && r.result == AuditOutcome::Success
                && r.metadata.chunks == Some(chunk_count)));
    }

    #[tokio::test]
    async fn test_receiver_honors_sender_chunk_size() {
        // The server prefers 16-byte chunks for its own sends; the client
        // streams 8-byte chunks. The announced size must win on the
        // receive path or every chunk past the first lands misplaced.
        let Pair { mut client, mut server, server_backend, .. } = make_pair(Arc::new(AllowAll));
        server.chunk_size = 16;
        let data: Vec<u8> = (0..40u8).collect(); // 5 chunks of 8
        let src = Arc::new(MemoryBackend::new());
        src.insert("src.bin", data.clone()).unwrap();
        client.backend = src.clone();

        let open = client
            .request(&FileOperation::Open { path: "dst.bin".to_string(), write: true })
            .unwrap();
        let output = server.handle_frame(open).await.unwrap();
        let handle = match first_response(&client.handle_frame(output.replies[0].clone()).await.unwrap()) {
            FileResponse::Handle { handle } => *handle,
            other => panic!("unexpected response: {other:?}"),
        };
        let announce = client
            .request(&FileOperation::Write {
                handle,
                size: data.len() as u64,
                chunk_count: 5,
                chunk_size: 8,
            })
            .unwrap();
        server.handle_frame(announce).await.unwrap();

        let src_handle = src.open("src.bin", false).await.unwrap();
        let mut completed = false;
        for frame in client.send_file(handle, src_handle, "src.bin").await.unwrap() {
            let output = server.handle_frame(frame).await.unwrap();
            assert!(output.replies.is_empty(), "no naks expected on clean stream");
            completed |= output
                .events
                .iter()
                .any(|e| matches!(e, EngineEvent::TransferComplete { .. }));
        }
        assert!(completed);
        assert_eq!(server_backend.contents("dst.bin").unwrap().unwrap(), data);
    }

    #[tokio::test]
    async fn test_corrupt_chunk_is_renegotiated_not_restarted() {
        let Pair { mut client, mut server, server_backend, .. } = make_pair(Arc::new(AllowAll));
        let data = vec![7u8; 80]; // 10 chunks of 8
        let src = Arc::new(MemoryBackend::new());
        src.insert("src.bin", data.clone()).unwrap();
        client.backend = src.clone();

        let open = client
            .request(&FileOperation::Open { path: "dst.bin".to_string(), write: true })
            .unwrap();
        let output = server.handle_frame(open).await.unwrap();
        let handle = match first_response(&client.handle_frame(output.replies[0].clone()).await.unwrap()) {
            FileResponse::Handle { handle } => *handle,
            other => panic!("unexpected response: {other:?}"),
        };
        let announce = client
            .request(&FileOperation::Write { handle, size: 80, chunk_count: 10, chunk_size: 8 })
            .unwrap();
        server.handle_frame(announce).await.unwrap();

        let src_handle = src.open("src.bin", false).await.unwrap();
        let mut frames = client.send_file(handle, src_handle, "src.bin").await.unwrap();

        // Corrupt chunk 4 in flight: rebuild it with flipped data but the
        // original hash claim.
        let flags = frames[4].flags;
        let plaintext = server.open(&frames[4]).unwrap();
        let mut chunk: ChunkPayload = postcard::from_bytes(&plaintext).unwrap();
        chunk.data[0] ^= 0xFF;
        frames[4] = client
            .seal(FrameType::DataTransfer, flags, &postcard::to_allocvec(&chunk).unwrap())
            .unwrap();

        let mut naks = Vec::new();
        for frame in frames {
            let output = server.handle_frame(frame).await.unwrap();
            naks.extend(output.replies);
        }
        // Re-requested on the mismatch, and again when the completion
        // announcement finds the gap. Both target only chunk 4.
        assert_eq!(naks.len(), 2);
        for nak in &naks {
            let control: ControlMessage = postcard::from_bytes(&client.open(nak).unwrap()).unwrap();
            assert!(matches!(control, ControlMessage::ChunkNak { ref indices, .. } if *indices == vec![4]));
        }
        let resend = client.handle_frame(naks[0].clone()).await.unwrap();
        assert_eq!(resend.replies.len(), 1);

        let output = server.handle_frame(resend.replies[0].clone()).await.unwrap();
        assert!(output
            .events
            .iter()
            .any(|e| matches!(e, EngineEvent::TransferComplete { .. })));
        assert_eq!(server_backend.contents("dst.bin").unwrap().unwrap(), data);
    }

    #[tokio::test]
    async fn test_denied_operation_keeps_session_alive() {
        let Pair { mut client, mut server, ledger, .. } = make_pair(Arc::new(DenyAll));

        let open = client
            .request(&FileOperation::Open { path: "secret.txt".to_string(), write: false })
            .unwrap();
        let output = server.handle_frame(open).await.unwrap();
        assert_eq!(output.replies.len(), 1);

        let client_output = client.handle_frame(output.replies[0].clone()).await.unwrap();
        assert!(client_output
            .events
            .iter()
            .any(|e| matches!(e, EngineEvent::PeerError(info) if info.kind == "authorization")));

        let records = ledger.records();
        assert!(records
            .iter()
            .any(|r| r.action == AuditAction::FileOpen && r.result == AuditOutcome::Denied));

        // Session still works after the denial.
        let ping = client.seal(FrameType::Control, FrameFlags::default(), b"ok").unwrap();
        assert_eq!(server.open(&ping).unwrap(), b"ok");
    }

    #[tokio::test]
    async fn test_key_rotation_in_band() {
        let Pair { mut client, mut server, ledger, .. } = make_pair(Arc::new(AllowAll));
        client.keys = test_keys(Role::Initiator).with_budgets(1, Duration::from_secs(3600));
        client.keys.note_protected(10);

        let rotation = client.maybe_rotate().unwrap().expect("rotation due");
        // Rotation frame travels under the old epoch.
        assert_eq!(rotation.flags.key_epoch, 0);
        let output = server.handle_frame(rotation).await.unwrap();
        assert!(output
            .events
            .iter()
            .any(|e| matches!(e, EngineEvent::RotationApplied { epoch: 1 })));

        // Traffic under the new epoch flows both ways.
        let frame = client.seal(FrameType::Control, FrameFlags::default(), b"fresh").unwrap();
        assert_eq!(frame.flags.key_epoch, 1);
        assert_eq!(server.open(&frame).unwrap(), b"fresh");
        let reply = server.seal(FrameType::Control, FrameFlags::default(), b"ack").unwrap();
        assert_eq!(client.open(&reply).unwrap(), b"ack");

        assert!(ledger.records().iter().any(|r| r.action == AuditAction::KeyRotation));
    }

    #[tokio::test]
    async fn test_disk_backend_round_trip_and_traversal_guard() {
        let root = std::env::temp_dir().join(format!("qsftp-test-{}", Uuid::new_v4()));
        let backend = DiskBackend::new(&root);
        assert!(backend.resolve("../escape").is_err());
        assert!(backend.resolve("/abs/path").is_err());

        let handle = backend.open("sub/file.bin", true).await.unwrap();
        backend.write_chunk(handle, 1, 4, b"bbbb").await.unwrap();
        backend.write_chunk(handle, 0, 4, b"aaaa").await.unwrap();
        assert_eq!(backend.stat_handle(handle).await.unwrap().size, 8);
        assert_eq!(backend.read_chunk(handle, 0, 4).await.unwrap(), b"aaaa");
        assert_eq!(backend.read_chunk(handle, 1, 4).await.unwrap(), b"bbbb");
        assert_eq!(backend.read_chunk(handle, 2, 4).await.unwrap(), Vec::<u8>::new());
        backend.close(handle).await.unwrap();
        assert!(backend.read_chunk(handle, 0, 4).await.is_err());
        tokio::fs::remove_dir_all(&root).await.ok();
    }

    #[tokio::test]
    async fn test_teardown_audits_session_end_once() {
        let Pair { mut client, mut server, ledger, .. } = make_pair(Arc::new(AllowAll));
        let teardown = client.teardown().unwrap();
        client.close().unwrap(); // idempotent
        let output = server.handle_frame(teardown).await.unwrap();
        assert!(output.events.iter().any(|e| matches!(e, EngineEvent::SessionClosed)));

        let ends = ledger
            .records()
            .iter()
            .filter(|r| r.action == AuditAction::SessionEnd)
            .count();
        assert_eq!(ends, 2); // one per side
    }
}
