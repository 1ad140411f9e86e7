//! Tamper-evident audit ledger.
//!
//! Append is the only mutation. Every record carries the content hash of
//! its predecessor (record 0 chains from a fixed anchor) and an Ed25519
//! signature by the local signing identity, so any alteration of a past
//! record invalidates every hash after it. The append path is the single
//! serialization point for event ordering across all connections.

use crate::error::{Error, LedgerError, Result};
use crate::primitives::{CryptoProvider, SigningIdentity};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};
use uuid::Uuid;

/// Domain-separated anchor for the previous-hash of record 0.
pub fn anchor_hash() -> [u8; 32] {
    *blake3::hash(b"qsftp/audit-ledger/anchor/v1").as_bytes()
}

/// Protocol-visible event kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AuditAction {
    /// Transport stream opened for a new connection
    SessionStart,
    /// Hybrid key exchange completed
    KeyExchange,
    /// Peer identity and attestation verified
    Authentication,
    /// Finished messages exchanged, session keys live
    SessionEstablished,
    /// Handshake aborted before establishment
    HandshakeAborted,
    FileOpen,
    FileRead,
    FileWrite,
    FileClose,
    FileStat,
    TransferComplete,
    TransferAborted,
    KeyRotation,
    SessionEnd,
    /// Verification failure, denied operation, or other security-relevant
    /// anomaly
    SecurityEvent,
}

/// Outcome recorded with each event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AuditOutcome {
    Success,
    Failure,
    Denied,
}

/// Structured metadata of the exported record form.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditMetadata {
    pub file_size: Option<u64>,
    pub chunks: Option<u64>,
    pub duration_ms: Option<u64>,
}

/// Event input for [`AuditLedger::append`]; sequencing, chaining and
/// signing are the ledger's job.
#[derive(Debug, Clone)]
pub struct AuditEvent {
    pub action: AuditAction,
    pub result: AuditOutcome,
    pub session_id: Option<Uuid>,
    pub user_id: Option<String>,
    pub hardware_id: Option<String>,
    pub resource: Option<String>,
    pub metadata: AuditMetadata,
}

impl AuditEvent {
    pub fn new(action: AuditAction, result: AuditOutcome) -> Self {
        Self {
            action,
            result,
            session_id: None,
            user_id: None,
            hardware_id: None,
            resource: None,
            metadata: AuditMetadata::default(),
        }
    }

    pub fn with_session(mut self, session_id: Uuid) -> Self {
        self.session_id = Some(session_id);
        self
    }

    pub fn with_user(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    pub fn with_hardware(mut self, hardware_id: impl Into<String>) -> Self {
        self.hardware_id = Some(hardware_id.into());
        self
    }

    pub fn with_resource(mut self, resource: impl Into<String>) -> Self {
        self.resource = Some(resource.into());
        self
    }

    pub fn with_metadata(mut self, metadata: AuditMetadata) -> Self {
        self.metadata = metadata;
        self
    }
}

/// A chained, signed audit record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditRecord {
    pub sequence: u64,
    /// Unix milliseconds.
    pub timestamp: i64,
    pub event_id: Uuid,
    pub session_id: Option<Uuid>,
    pub user_id: Option<String>,
    pub hardware_id: Option<String>,
    pub action: AuditAction,
    pub resource: Option<String>,
    pub result: AuditOutcome,
    pub metadata: AuditMetadata,
    /// Content hash of the previous record; anchor for record 0.
    pub previous_hash: [u8; 32],
    /// Ed25519 signature over the record body (everything above).
    pub signature: Vec<u8>,
}

impl AuditRecord {
    /// Bytes the signature covers: the record with an empty signature.
    fn body_bytes(&self) -> Result<Vec<u8>> {
        let mut body = self.clone();
        body.signature = Vec::new();
        postcard::to_allocvec(&body).map_err(|_| LedgerError::Serialize.into())
    }

    /// Content hash over the full serialized record, signature included.
    /// This is what the next record's `previous_hash` commits to.
    pub fn content_hash(&self) -> Result<[u8; 32]> {
        let bytes = postcard::to_allocvec(self).map_err(|_| Error::from(LedgerError::Serialize))?;
        Ok(*blake3::hash(&bytes).as_bytes())
    }

    /// Exported JSON form. Chain fields ride along for offline verifiers.
    pub fn export(&self) -> serde_json::Value {
        serde_json::json!({
            "timestamp": self.timestamp,
            "event_id": self.event_id.to_string(),
            "session_id": self.session_id.map(|id| id.to_string()),
            "user_id": self.user_id,
            "hardware_id": self.hardware_id,
            "action": format!("{:?}", self.action),
            "resource": self.resource,
            "result": format!("{:?}", self.result),
            "signature": hex::encode(&self.signature),
            "metadata": {
                "file_size": self.metadata.file_size,
                "chunks": self.metadata.chunks,
                "duration_ms": self.metadata.duration_ms,
            },
            "sequence": self.sequence,
            "previous_hash": hex::encode(self.previous_hash),
        })
    }
}

/// Handle returned from a successful append.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordHandle {
    pub sequence: u64,
    pub content_hash: [u8; 32],
}

struct LedgerInner {
    records: Vec<AuditRecord>,
    head_hash: [u8; 32],
}

/// Process-wide append-only ledger. Shared across all connections; inject
/// an `Arc<AuditLedger>` into every component that appends.
pub struct AuditLedger {
    provider: Arc<dyn CryptoProvider>,
    signing: SigningIdentity,
    inner: Mutex<LedgerInner>,
}

impl AuditLedger {
    pub fn new(provider: Arc<dyn CryptoProvider>, signing: SigningIdentity) -> Self {
        Self {
            provider,
            signing,
            inner: Mutex::new(LedgerInner { records: Vec::new(), head_hash: anchor_hash() }),
        }
    }

    /// The verifying key records are signed under.
    pub fn verifying_key(&self) -> Vec<u8> {
        self.signing.public_key().to_vec()
    }

    /// Append one event. Sequence assignment, chaining and signing happen
    /// under a single lock, so concurrent appenders can never produce
    /// duplicate or out-of-order sequence numbers.
    pub fn append(&self, event: AuditEvent) -> Result<RecordHandle> {
        let mut inner = self
            .inner
            .lock()
            .map_err(|_| Error::Internal("audit ledger lock poisoned".to_string()))?;

        let mut record = AuditRecord {
            sequence: inner.records.len() as u64,
            timestamp: Utc::now().timestamp_millis(),
            event_id: Uuid::new_v4(),
            session_id: event.session_id,
            user_id: event.user_id,
            hardware_id: event.hardware_id,
            action: event.action,
            resource: event.resource,
            result: event.result,
            metadata: event.metadata,
            previous_hash: inner.head_hash,
            signature: Vec::new(),
        };
        let body = record.body_bytes()?;
        record.signature = self.provider.sign(&self.signing, &body)?.to_vec();

        let content_hash = record.content_hash()?;
        let handle = RecordHandle { sequence: record.sequence, content_hash };
        inner.head_hash = content_hash;
        inner.records.push(record);
        Ok(handle)
    }

    /// Final-write path for fatal teardown: failure is logged, never
    /// propagated, so teardown can proceed to release resources.
    pub fn append_best_effort(&self, event: AuditEvent) {
        if let Err(err) = self.append(event) {
            tracing::warn!(error = %err, "failed to write final audit record");
        }
    }

    /// Verify the chain over the inclusive sequence range `[from, to]`.
    /// Fails fast at the first break, naming the offending sequence.
    pub fn verify_chain(&self, from: u64, to: u64) -> Result<()> {
        let inner = self
            .inner
            .lock()
            .map_err(|_| Error::Internal("audit ledger lock poisoned".to_string()))?;
        verify_records(&inner.records, from, to, self.provider.as_ref(), self.signing.public_key())
    }

    pub fn len(&self) -> usize {
        self.inner.lock().map(|inner| inner.records.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Snapshot of the records, for export and tests.
    pub fn records(&self) -> Vec<AuditRecord> {
        self.inner.lock().map(|inner| inner.records.clone()).unwrap_or_default()
    }

    /// Exported JSON array of the full ledger.
    pub fn export(&self) -> serde_json::Value {
        serde_json::Value::Array(self.records().iter().map(AuditRecord::export).collect())
    }
}

/// Offline chain verification over a record slice, also used by the tools
/// binary against an exported ledger. `from`/`to` are inclusive sequence
/// numbers and must lie within the slice.
pub fn verify_records(
    records: &[AuditRecord],
    from: u64,
    to: u64,
    provider: &dyn CryptoProvider,
    verifying_key: &[u8],
) -> Result<()> {
    if from > to || to >= records.len() as u64 {
        return Err(LedgerError::RangeOutOfBounds.into());
    }
    for sequence in from..=to {
        let record = &records[sequence as usize];
        if record.sequence != sequence {
            return Err(LedgerError::SequenceGap { expected: sequence, found: record.sequence }.into());
        }
        let expected_prev = if sequence == 0 {
            anchor_hash()
        } else {
            records[sequence as usize - 1].content_hash()?
        };
        if record.previous_hash != expected_prev {
            return Err(LedgerError::BrokenChain { sequence }.into());
        }
        let body = {
            let mut body = record.clone();
            body.signature = Vec::new();
            postcard::to_allocvec(&body).map_err(|_| Error::from(LedgerError::Serialize))?
        };
        if provider.verify(verifying_key, &body, &record.signature).is_err() {
            return Err(LedgerError::BadSignature { sequence }.into());
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::primitives::SoftwareProvider;

    fn test_ledger() -> AuditLedger {
        let provider: Arc<dyn CryptoProvider> = Arc::new(SoftwareProvider::new());
        let (signing, _) = SigningIdentity::generate().unwrap();
        AuditLedger::new(provider, signing)
    }

    #[test]
    fn test_append_assigns_contiguous_sequences() {
        let ledger = test_ledger();
        for expected in 0..5u64 {
            let handle = ledger
                .append(AuditEvent::new(AuditAction::FileOpen, AuditOutcome::Success))
                .unwrap();
            assert_eq!(handle.sequence, expected);
        }
        ledger.verify_chain(0, 4).unwrap();
    }

    #[test]
    fn test_verify_chain_detects_tampering() {
        let ledger = test_ledger();
        for _ in 0..6 {
            ledger
                .append(AuditEvent::new(AuditAction::FileWrite, AuditOutcome::Success))
                .unwrap();
        }
        ledger.verify_chain(0, 5).unwrap();

        // Flip a byte in record 3 and re-verify offline.
        let mut records = ledger.records();
        records[3].resource = Some("forged".to_string());
        let provider = SoftwareProvider::new();
        let err = verify_records(&records, 0, 5, &provider, &ledger.verifying_key()).unwrap_err();
        match err {
            // The record's own signature breaks first; the next record's
            // previous-hash would break too.
            Error::Ledger(LedgerError::BadSignature { sequence }) => assert_eq!(sequence, 3),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_tampered_previous_hash_breaks_chain() {
        let ledger = test_ledger();
        for _ in 0..4 {
            ledger
                .append(AuditEvent::new(AuditAction::KeyRotation, AuditOutcome::Success))
                .unwrap();
        }
        let mut records = ledger.records();
        records[2].previous_hash = [0u8; 32];
        let provider = SoftwareProvider::new();
        let err = verify_records(&records, 0, 3, &provider, &ledger.verifying_key()).unwrap_err();
        assert!(matches!(err, Error::Ledger(LedgerError::BrokenChain { sequence: 2 })));
    }

    #[test]
    fn test_range_bounds() {
        let ledger = test_ledger();
        ledger
            .append(AuditEvent::new(AuditAction::SessionStart, AuditOutcome::Success))
            .unwrap();
        assert!(matches!(
            ledger.verify_chain(0, 7).unwrap_err(),
            Error::Ledger(LedgerError::RangeOutOfBounds)
        ));
    }

    #[test]
    fn test_concurrent_appends_stay_ordered() {
        let ledger = Arc::new(test_ledger());
        let mut handles = Vec::new();
        for _ in 0..8 {
            let ledger = ledger.clone();
            handles.push(std::thread::spawn(move || {
                for _ in 0..25 {
                    ledger
                        .append(AuditEvent::new(AuditAction::FileRead, AuditOutcome::Success))
                        .unwrap();
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }

        let records = ledger.records();
        assert_eq!(records.len(), 200);
        for (index, record) in records.iter().enumerate() {
            assert_eq!(record.sequence, index as u64);
        }
        ledger.verify_chain(0, 199).unwrap();
    }

    #[test]
    fn test_export_shape() {
        let ledger = test_ledger();
        let session = Uuid::new_v4();
        ledger
            .append(
                AuditEvent::new(AuditAction::TransferComplete, AuditOutcome::Success)
                    .with_session(session)
                    .with_user("alice")
                    .with_hardware("soft-security-token-alice")
                    .with_resource("/srv/files/report.pdf")
                    .with_metadata(AuditMetadata {
                        file_size: Some(640 * 1024),
                        chunks: Some(10),
                        duration_ms: Some(1200),
                    }),
            )
            .unwrap();

        let exported = ledger.export();
        let entry = &exported[0];
        assert_eq!(entry["user_id"], "alice");
        assert_eq!(entry["action"], "TransferComplete");
        assert_eq!(entry["result"], "Success");
        assert_eq!(entry["metadata"]["chunks"], 10);
        assert_eq!(entry["sequence"], 0);
        assert_eq!(entry["session_id"], session.to_string());
    }
}
