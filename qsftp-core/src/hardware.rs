//! Hardware-backed identity and attestation.
//!
//! Token drivers (TPM, security token, smart card) live outside this crate;
//! the engine depends only on the challenge/response and attestation
//! capabilities of [`HardwareAuthenticator`]. [`SoftToken`] is a
//! software-backed implementation for development and tests.

use crate::error::{Error, HandshakeError, Result};
use crate::primitives::{CryptoProvider, SigningIdentity};
use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

/// Hardware credential classes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HardwareClass {
    /// TPM 2.0
    Tpm,
    /// USB security token (PIV/FIDO class)
    SecurityToken,
    /// Smart card
    SmartCard,
}

impl HardwareClass {
    pub fn name(self) -> &'static str {
        match self {
            HardwareClass::Tpm => "tpm",
            HardwareClass::SecurityToken => "security-token",
            HardwareClass::SmartCard => "smart-card",
        }
    }
}

/// Hardware-signed evidence that a device and its key are genuine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttestationEvidence {
    pub class: HardwareClass,
    pub device_id: String,
    /// Device quote: measurement over the bound public key.
    pub quote: Vec<u8>,
    /// Signature over the quote by the device key.
    pub signature: Vec<u8>,
    pub certificate_chain: Vec<Vec<u8>>,
    /// Unix seconds.
    pub issued_at: u64,
    pub expires_at: u64,
}

/// A principal's hardware-backed credential. Immutable once bound to a
/// session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    pub principal: String,
    pub verifying_key: Vec<u8>,
    pub hardware: HardwareClass,
    pub device_id: String,
}

/// The only hardware capabilities the engine consumes.
#[async_trait::async_trait]
pub trait HardwareAuthenticator: Send + Sync {
    /// Sign a peer-supplied nonce with the device-resident key.
    async fn challenge(&self, nonce: &[u8]) -> Result<Vec<u8>>;

    /// Produce attestation evidence for the device and its key.
    async fn attestation(&self) -> Result<AttestationEvidence>;

    /// The identity this device vouches for.
    fn identity(&self) -> Identity;
}

/// Verifies peer attestation evidence and challenge responses.
pub struct AttestationVerifier {
    provider: std::sync::Arc<dyn CryptoProvider>,
}

impl AttestationVerifier {
    pub fn new(provider: std::sync::Arc<dyn CryptoProvider>) -> Self {
        Self { provider }
    }

    /// Check evidence freshness and quote signature. The quote must commit
    /// to the identity's verifying key, binding device to principal.
    pub fn verify_evidence(
        &self,
        identity: &Identity,
        evidence: &AttestationEvidence,
    ) -> Result<()> {
        let now = unix_now();
        if evidence.expires_at <= now {
            return Err(HandshakeError::AttestationExpired.into());
        }
        if evidence.class != identity.hardware || evidence.device_id != identity.device_id {
            return Err(HandshakeError::AttestationInvalid.into());
        }
        if !evidence.quote.ends_with(&identity.verifying_key) {
            return Err(HandshakeError::AttestationInvalid.into());
        }
        self.provider
            .verify(&identity.verifying_key, &evidence.quote, &evidence.signature)
            .map_err(|_| Error::Handshake(HandshakeError::AttestationInvalid))
    }

    /// Check a challenge response: signature over the nonce under the
    /// identity's verifying key.
    pub fn verify_challenge(
        &self,
        identity: &Identity,
        nonce: &[u8],
        response: &[u8],
    ) -> Result<()> {
        self.provider
            .verify(&identity.verifying_key, nonce, response)
            .map_err(|_| Error::Handshake(HandshakeError::AttestationInvalid))
    }
}

/// Software-backed token. The device key is an in-process Ed25519 key and
/// the quote is self-signed, which is exactly as trustworthy as it sounds;
/// real deployments supply a driver-backed authenticator.
pub struct SoftToken {
    identity: Identity,
    signing: std::sync::Arc<SigningIdentity>,
    provider: std::sync::Arc<dyn CryptoProvider>,
    evidence_ttl_secs: u64,
}

impl SoftToken {
    pub fn new(
        principal: impl Into<String>,
        class: HardwareClass,
        signing: std::sync::Arc<SigningIdentity>,
        provider: std::sync::Arc<dyn CryptoProvider>,
    ) -> Self {
        let principal = principal.into();
        let identity = Identity {
            device_id: format!("soft-{}-{}", class.name(), &principal),
            principal,
            verifying_key: signing.public_key().to_vec(),
            hardware: class,
        };
        Self { identity, signing, provider, evidence_ttl_secs: 600 }
    }

    /// Override the evidence lifetime; tests use this to produce expired
    /// evidence.
    pub fn with_evidence_ttl(mut self, ttl_secs: u64) -> Self {
        self.evidence_ttl_secs = ttl_secs;
        self
    }
}

#[async_trait::async_trait]
impl HardwareAuthenticator for SoftToken {
    async fn challenge(&self, nonce: &[u8]) -> Result<Vec<u8>> {
        let signature = self.provider.sign(&self.signing, nonce)?;
        Ok(signature.to_vec())
    }

    async fn attestation(&self) -> Result<AttestationEvidence> {
        let issued_at = unix_now();
        let mut quote = Vec::with_capacity(16 + self.identity.verifying_key.len());
        quote.extend_from_slice(self.identity.device_id.as_bytes());
        quote.extend_from_slice(&self.identity.verifying_key);
        let signature = self.provider.sign(&self.signing, &quote)?.to_vec();
        Ok(AttestationEvidence {
            class: self.identity.hardware,
            device_id: self.identity.device_id.clone(),
            quote,
            signature,
            certificate_chain: Vec::new(),
            issued_at,
            expires_at: issued_at + self.evidence_ttl_secs,
        })
    }

    fn identity(&self) -> Identity {
        self.identity.clone()
    }
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
