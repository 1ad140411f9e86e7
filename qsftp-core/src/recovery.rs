//! Failure classification and bounded retry.
//!
//! Every error is placed into one of three classes, which decide how much
//! state is torn down: a recoverable failure affects only the frame or
//! chunk at hand, a session-fatal failure tears down the session, and a
//! fatal failure stops the process.

use crate::error::{CryptoError, Error, IntegrityError};
use crate::MAX_CHUNK_RETRIES;
use std::collections::HashMap;
use std::time::Duration;

/// How much state an error invalidates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureClass {
    /// Drop or retry the affected frame/chunk; the session continues.
    Recoverable,
    /// The session can no longer make progress; tear it down. Other
    /// sessions are unaffected.
    SessionFatal,
    /// Process integrity is in doubt (audit ledger unavailable, key
    /// material corrupted, broken configuration). Stop.
    Fatal,
}

/// Classify an error. Exhaustive over the error taxonomy so that adding a
/// variant forces a classification decision here.
pub fn classify(err: &Error) -> FailureClass {
    match err {
        // Malformed frames are dropped; the stream resynchronizes on the
        // next frame boundary.
        Error::Format(_) => FailureClass::Recoverable,
        Error::Handshake(_) => FailureClass::SessionFatal,
        Error::Integrity(integrity) => match integrity {
            IntegrityError::ChunkMismatch { .. } | IntegrityError::UnknownChunk { .. } => {
                FailureClass::Recoverable
            }
            IntegrityError::RetriesExhausted { .. } | IntegrityError::CumulativeMismatch => {
                FailureClass::SessionFatal
            }
        },
        // A refused operation is not a protocol failure.
        Error::Authorization(_) => FailureClass::Recoverable,
        // No audit trail, no service.
        Error::Ledger(_) => FailureClass::Fatal,
        Error::Crypto(crypto) => match crypto {
            // A frame that fails signature or AEAD verification is
            // indistinguishable from line noise; drop it.
            CryptoError::Signature(_) | CryptoError::Aead(_) => FailureClass::Recoverable,
            CryptoError::Kem(_) | CryptoError::Kdf(_) => FailureClass::SessionFatal,
            CryptoError::KeyMaterialCorrupted | CryptoError::Rng => FailureClass::Fatal,
        },
        Error::Transport(_) => FailureClass::SessionFatal,
        Error::Hardware(_) => FailureClass::SessionFatal,
        Error::File(_) => FailureClass::Recoverable,
        Error::Config(_) => FailureClass::Fatal,
        Error::Timeout(_) => FailureClass::SessionFatal,
        Error::Internal(_) => FailureClass::Fatal,
    }
}

/// Exponential backoff schedule for chunk re-requests.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    base: Duration,
    cap: Duration,
}

impl RetryPolicy {
    pub fn new(base: Duration, cap: Duration) -> Self {
        Self { base, cap }
    }

    /// Delay before the given attempt (1-based): base * 2^(attempt-1),
    /// capped.
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = 1u32 << attempt.saturating_sub(1).min(16);
        self.base.saturating_mul(factor).min(self.cap)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self { base: Duration::from_millis(100), cap: Duration::from_secs(5) }
    }
}

/// Verdict for one failed chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Re-request the chunk after `delay`.
    Retry { attempt: u32, delay: Duration },
    /// Retry budget exhausted; fail the transfer.
    Fail,
}

/// Tracks per-chunk retry budgets across the transfers of one session.
pub struct RecoveryController {
    policy: RetryPolicy,
    max_retries: u32,
    attempts: HashMap<(u32, u64), u32>,
}

impl RecoveryController {
    pub fn new() -> Self {
        Self::with_policy(RetryPolicy::default(), MAX_CHUNK_RETRIES)
    }

    pub fn with_policy(policy: RetryPolicy, max_retries: u32) -> Self {
        Self { policy, max_retries, attempts: HashMap::new() }
    }

    /// Record a failed chunk and decide whether it gets another attempt.
    pub fn on_chunk_failure(&mut self, handle: u32, index: u64) -> RetryDecision {
        let attempt = self.attempts.entry((handle, index)).or_insert(0);
        *attempt += 1;
        if *attempt > self.max_retries {
            return RetryDecision::Fail;
        }
        RetryDecision::Retry { attempt: *attempt, delay: self.policy.delay(*attempt) }
    }

    /// A chunk verified; its budget resets.
    pub fn reset_chunk(&mut self, handle: u32, index: u64) {
        self.attempts.remove(&(handle, index));
    }

    /// Forget all budgets for a finished or aborted transfer.
    pub fn clear_transfer(&mut self, handle: u32) {
        self.attempts.retain(|(h, _), _| *h != handle);
    }
}

impl Default for RecoveryController {
    fn default() -> Self {
        Self::new()
    }
}
