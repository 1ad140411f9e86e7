//! Negotiable cipher suites.
//!
//! Every key-exchange option is hybrid: a classical X25519 share combined
//! with an ML-KEM encapsulation, so compromise of one algorithm family
//! does not compromise the session.

use serde::{Deserialize, Serialize};

/// Hybrid key-exchange algorithms.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum KemAlgorithm {
    /// X25519 + ML-KEM-768 (default)
    HybridX25519MlKem768,
    /// X25519 + ML-KEM-1024 (paranoid mode)
    HybridX25519MlKem1024,
}

/// Signature algorithms for identities, frames and audit records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SignatureAlgorithm {
    Ed25519,
}

/// AEAD algorithms protecting session traffic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AeadAlgorithm {
    /// ChaCha20-Poly1305 (recommended)
    ChaCha20Poly1305,
    /// AES-256-GCM (hardware accelerated)
    Aes256Gcm,
}

/// Hash algorithms for chunk integrity and the handshake transcript.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HashAlgorithm {
    /// BLAKE3 (fast, recommended)
    Blake3,
    /// SHA3-256 (NIST standard)
    Sha3_256,
}

/// A complete negotiated suite.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CipherSuite {
    pub kem: KemAlgorithm,
    pub signature: SignatureAlgorithm,
    pub aead: AeadAlgorithm,
    pub hash: HashAlgorithm,
}

impl Default for CipherSuite {
    fn default() -> Self {
        Self {
            kem: KemAlgorithm::HybridX25519MlKem768,
            signature: SignatureAlgorithm::Ed25519,
            aead: AeadAlgorithm::ChaCha20Poly1305,
            hash: HashAlgorithm::Blake3,
        }
    }
}

impl CipherSuite {
    /// The paranoid-mode suite: larger KEM, NIST hash.
    pub fn paranoid() -> Self {
        Self {
            kem: KemAlgorithm::HybridX25519MlKem1024,
            signature: SignatureAlgorithm::Ed25519,
            aead: AeadAlgorithm::ChaCha20Poly1305,
            hash: HashAlgorithm::Sha3_256,
        }
    }

    /// All suites this build supports, in preference order.
    pub fn supported() -> Vec<CipherSuite> {
        vec![CipherSuite::default(), CipherSuite::paranoid()]
    }

    /// Pick the first locally supported suite the peer also offers.
    pub fn negotiate(local: &[CipherSuite], offered: &[CipherSuite]) -> Option<CipherSuite> {
        local.iter().find(|suite| offered.contains(suite)).copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_suite() {
        let suite = CipherSuite::default();
        assert_eq!(suite.kem, KemAlgorithm::HybridX25519MlKem768);
        assert_eq!(suite.aead, AeadAlgorithm::ChaCha20Poly1305);
        assert_eq!(suite.hash, HashAlgorithm::Blake3);
    }

    #[test]
    fn test_negotiate_prefers_local_order() {
        let local = CipherSuite::supported();
        let offered = vec![CipherSuite::paranoid(), CipherSuite::default()];
        assert_eq!(CipherSuite::negotiate(&local, &offered), Some(CipherSuite::default()));
    }

    #[test]
    fn test_negotiate_no_overlap() {
        let local = vec![CipherSuite::default()];
        let offered = vec![CipherSuite::paranoid()];
        assert_eq!(CipherSuite::negotiate(&local, &offered), None);
    }
}
