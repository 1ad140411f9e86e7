//! Primitive adapter: the narrow interface between the protocol engine and
//! the cryptographic backends.
//!
//! The engine never touches algorithm internals; everything flows through
//! [`CryptoProvider`]. [`SoftwareProvider`] is the default backend: X25519
//! and Ed25519 via ring, ML-KEM via the `ml-kem` crate, AEAD via
//! chacha20poly1305/aes-gcm, HKDF-SHA3-256 for key derivation.

use crate::error::{CryptoError, Error, Result};
use crate::suite::{AeadAlgorithm, HashAlgorithm, KemAlgorithm};
use crate::FRAME_SIGNATURE_LEN;
use hkdf::Hkdf;
use ml_kem::kem::{Decapsulate, Encapsulate, DecapsulationKey, EncapsulationKey};
use ml_kem::{Encoded, EncodedSizeUser, KemCore, MlKem1024, MlKem1024Params, MlKem768, MlKem768Params};
use rand::rngs::OsRng;
use ring::agreement;
use ring::rand::SecureRandom;
use ring::signature::KeyPair;
use sha3::Sha3_256;
use zeroize::Zeroizing;

/// X25519 public key length.
pub const X25519_PUBLIC_LEN: usize = 32;

/// ML-KEM-768 encapsulation key and ciphertext lengths.
const MLKEM768_EK_LEN: usize = 1184;
const MLKEM768_CT_LEN: usize = 1088;

/// ML-KEM-1024 encapsulation key and ciphertext lengths.
const MLKEM1024_EK_LEN: usize = 1568;
const MLKEM1024_CT_LEN: usize = 1568;

/// Both halves of a hybrid key-exchange secret. The session key is always
/// derived from the concatenation, never from either half alone.
pub struct HybridSecret {
    pub classical: Zeroizing<Vec<u8>>,
    pub post_quantum: Zeroizing<Vec<u8>>,
}

impl std::fmt::Debug for HybridSecret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Key material never reaches log or panic output.
        f.write_str("HybridSecret(..)")
    }
}

impl HybridSecret {
    /// classical ‖ post-quantum, the KDF input keying material.
    pub fn concat(&self) -> Zeroizing<Vec<u8>> {
        let mut ikm = Zeroizing::new(Vec::with_capacity(
            self.classical.len() + self.post_quantum.len(),
        ));
        ikm.extend_from_slice(&self.classical);
        ikm.extend_from_slice(&self.post_quantum);
        ikm
    }
}

enum PqDecapKey {
    MlKem768(DecapsulationKey<MlKem768Params>),
    MlKem1024(DecapsulationKey<MlKem1024Params>),
}

/// An ephemeral hybrid keypair held by the side awaiting encapsulation.
/// Consumed by decapsulation; the classical half is single-use by
/// construction (ring ephemeral agreement).
pub struct KemKeyPair {
    algorithm: KemAlgorithm,
    classical_private: agreement::EphemeralPrivateKey,
    pq_private: PqDecapKey,
    public_bytes: Vec<u8>,
}

impl KemKeyPair {
    pub fn algorithm(&self) -> KemAlgorithm {
        self.algorithm
    }

    /// The public blob sent to the peer: X25519 public ‖ ML-KEM
    /// encapsulation key.
    pub fn public_bytes(&self) -> &[u8] {
        &self.public_bytes
    }
}

/// Narrow interface to the cryptographic backends. Every method returns a
/// typed [`CryptoError`] on failure; the engine classifies from there.
pub trait CryptoProvider: Send + Sync {
    /// Generate an ephemeral hybrid keypair for the given algorithm.
    fn kem_keypair(&self, algorithm: KemAlgorithm) -> Result<KemKeyPair>;

    /// Encapsulate to a peer's public blob. Returns the ciphertext blob to
    /// send (our X25519 public ‖ ML-KEM ciphertext) and both shared-secret
    /// halves.
    fn kem_encapsulate(
        &self,
        algorithm: KemAlgorithm,
        peer_public: &[u8],
    ) -> Result<(Vec<u8>, HybridSecret)>;

    /// Decapsulate a peer ciphertext blob, consuming the keypair.
    fn kem_decapsulate(&self, keypair: KemKeyPair, ciphertext: &[u8]) -> Result<HybridSecret>;

    /// Ed25519 signature over `message`.
    fn sign(&self, identity: &SigningIdentity, message: &[u8]) -> Result<[u8; FRAME_SIGNATURE_LEN]>;

    /// Verify an Ed25519 signature. `Ok(())` means valid.
    fn verify(&self, public_key: &[u8], message: &[u8], signature: &[u8]) -> Result<()>;

    /// AEAD seal. Key is 32 bytes, nonce 12.
    fn aead_seal(
        &self,
        algorithm: AeadAlgorithm,
        key: &[u8],
        nonce: &[u8; 12],
        aad: &[u8],
        plaintext: &[u8],
    ) -> Result<Vec<u8>>;

    /// AEAD open. Fails with a typed error on any authentication failure.
    fn aead_open(
        &self,
        algorithm: AeadAlgorithm,
        key: &[u8],
        nonce: &[u8; 12],
        aad: &[u8],
        ciphertext: &[u8],
    ) -> Result<Vec<u8>>;

    /// 32-byte digest of `data`.
    fn hash(&self, algorithm: HashAlgorithm, data: &[u8]) -> [u8; 32];

    /// HKDF-SHA3-256 expand into `out`.
    fn derive_key(&self, ikm: &[u8], salt: &[u8], info: &[u8], out: &mut [u8]) -> Result<()>;

    /// Fill `out` with cryptographically secure random bytes.
    fn random(&self, out: &mut [u8]) -> Result<()>;
}

/// Local Ed25519 signing identity, used for frame signatures and audit
/// record signing.
pub struct SigningIdentity {
    keypair: ring::signature::Ed25519KeyPair,
    public_key: Vec<u8>,
}

impl SigningIdentity {
    /// Generate a fresh identity, returning it with its PKCS#8 document
    /// so callers can persist the key.
    pub fn generate() -> Result<(Self, Vec<u8>)> {
        let rng = ring::rand::SystemRandom::new();
        let pkcs8 = ring::signature::Ed25519KeyPair::generate_pkcs8(&rng)?;
        let identity = Self::from_pkcs8(pkcs8.as_ref())?;
        Ok((identity, pkcs8.as_ref().to_vec()))
    }

    pub fn from_pkcs8(pkcs8: &[u8]) -> Result<Self> {
        let keypair = ring::signature::Ed25519KeyPair::from_pkcs8(pkcs8)?;
        let public_key = keypair.public_key().as_ref().to_vec();
        Ok(Self { keypair, public_key })
    }

    pub fn public_key(&self) -> &[u8] {
        &self.public_key
    }
}

/// Default software-backed provider.
pub struct SoftwareProvider {
    rng: ring::rand::SystemRandom,
}

impl SoftwareProvider {
    pub fn new() -> Self {
        Self { rng: ring::rand::SystemRandom::new() }
    }
}

impl Default for SoftwareProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl CryptoProvider for SoftwareProvider {
    fn kem_keypair(&self, algorithm: KemAlgorithm) -> Result<KemKeyPair> {
        let classical_private =
            agreement::EphemeralPrivateKey::generate(&agreement::X25519, &self.rng)
                .map_err(|_| CryptoError::Kem("X25519 keygen failed".to_string()))?;
        let classical_public = classical_private
            .compute_public_key()
            .map_err(|_| CryptoError::Kem("X25519 public key failed".to_string()))?;

        let mut public_bytes = classical_public.as_ref().to_vec();
        let pq_private = match algorithm {
            KemAlgorithm::HybridX25519MlKem768 => {
                let (dk, ek) = MlKem768::generate(&mut OsRng);
                public_bytes.extend_from_slice(&ek.as_bytes());
                PqDecapKey::MlKem768(dk)
            }
            KemAlgorithm::HybridX25519MlKem1024 => {
                let (dk, ek) = MlKem1024::generate(&mut OsRng);
                public_bytes.extend_from_slice(&ek.as_bytes());
                PqDecapKey::MlKem1024(dk)
            }
        };

        Ok(KemKeyPair { algorithm, classical_private, pq_private, public_bytes })
    }

    fn kem_encapsulate(
        &self,
        algorithm: KemAlgorithm,
        peer_public: &[u8],
    ) -> Result<(Vec<u8>, HybridSecret)> {
        let ek_len = match algorithm {
            KemAlgorithm::HybridX25519MlKem768 => MLKEM768_EK_LEN,
            KemAlgorithm::HybridX25519MlKem1024 => MLKEM1024_EK_LEN,
        };
        if peer_public.len() != X25519_PUBLIC_LEN + ek_len {
            return Err(CryptoError::Kem(format!(
                "bad hybrid public length {}",
                peer_public.len()
            ))
            .into());
        }
        let (classical_peer, pq_peer) = peer_public.split_at(X25519_PUBLIC_LEN);

        // Classical half: fresh ephemeral, agree against the peer share.
        let our_private = agreement::EphemeralPrivateKey::generate(&agreement::X25519, &self.rng)
            .map_err(|_| CryptoError::Kem("X25519 keygen failed".to_string()))?;
        let our_public = our_private
            .compute_public_key()
            .map_err(|_| CryptoError::Kem("X25519 public key failed".to_string()))?;
        let classical = agreement::agree_ephemeral(
            our_private,
            &agreement::UnparsedPublicKey::new(&agreement::X25519, classical_peer),
            |secret| Zeroizing::new(secret.to_vec()),
        )
        .map_err(|_| CryptoError::Kem("X25519 agreement failed".to_string()))?;

        // Post-quantum half.
        let mut ciphertext = our_public.as_ref().to_vec();
        let post_quantum = match algorithm {
            KemAlgorithm::HybridX25519MlKem768 => {
                let encoded = Encoded::<EncapsulationKey<MlKem768Params>>::try_from(pq_peer)
                    .map_err(|_| CryptoError::Kem("bad ML-KEM-768 key".to_string()))?;
                let ek = EncapsulationKey::<MlKem768Params>::from_bytes(&encoded);
                let (ct, shared) = ek
                    .encapsulate(&mut OsRng)
                    .map_err(|_| CryptoError::Kem("ML-KEM-768 encapsulation failed".to_string()))?;
                ciphertext.extend_from_slice(&ct);
                Zeroizing::new(shared.to_vec())
            }
            KemAlgorithm::HybridX25519MlKem1024 => {
                let encoded = Encoded::<EncapsulationKey<MlKem1024Params>>::try_from(pq_peer)
                    .map_err(|_| CryptoError::Kem("bad ML-KEM-1024 key".to_string()))?;
                let ek = EncapsulationKey::<MlKem1024Params>::from_bytes(&encoded);
                let (ct, shared) = ek
                    .encapsulate(&mut OsRng)
                    .map_err(|_| CryptoError::Kem("ML-KEM-1024 encapsulation failed".to_string()))?;
                ciphertext.extend_from_slice(&ct);
                Zeroizing::new(shared.to_vec())
            }
        };

        Ok((ciphertext, HybridSecret { classical, post_quantum }))
    }

    fn kem_decapsulate(&self, keypair: KemKeyPair, ciphertext: &[u8]) -> Result<HybridSecret> {
        let ct_len = match keypair.algorithm {
            KemAlgorithm::HybridX25519MlKem768 => MLKEM768_CT_LEN,
            KemAlgorithm::HybridX25519MlKem1024 => MLKEM1024_CT_LEN,
        };
        if ciphertext.len() != X25519_PUBLIC_LEN + ct_len {
            return Err(CryptoError::Kem(format!(
                "bad hybrid ciphertext length {}",
                ciphertext.len()
            ))
            .into());
        }
        let (classical_peer, pq_ct) = ciphertext.split_at(X25519_PUBLIC_LEN);

        let classical = agreement::agree_ephemeral(
            keypair.classical_private,
            &agreement::UnparsedPublicKey::new(&agreement::X25519, classical_peer),
            |secret| Zeroizing::new(secret.to_vec()),
        )
        .map_err(|_| CryptoError::Kem("X25519 agreement failed".to_string()))?;

        let post_quantum = match keypair.pq_private {
            PqDecapKey::MlKem768(dk) => {
                let ct = ml_kem::Ciphertext::<MlKem768>::try_from(pq_ct)
                    .map_err(|_| CryptoError::Kem("bad ML-KEM-768 ciphertext".to_string()))?;
                let shared = dk
                    .decapsulate(&ct)
                    .map_err(|_| CryptoError::Kem("ML-KEM-768 decapsulation failed".to_string()))?;
                Zeroizing::new(shared.to_vec())
            }
            PqDecapKey::MlKem1024(dk) => {
                let ct = ml_kem::Ciphertext::<MlKem1024>::try_from(pq_ct)
                    .map_err(|_| CryptoError::Kem("bad ML-KEM-1024 ciphertext".to_string()))?;
                let shared = dk
                    .decapsulate(&ct)
                    .map_err(|_| CryptoError::Kem("ML-KEM-1024 decapsulation failed".to_string()))?;
                Zeroizing::new(shared.to_vec())
            }
        };

        Ok(HybridSecret { classical, post_quantum })
    }

    fn sign(&self, identity: &SigningIdentity, message: &[u8]) -> Result<[u8; FRAME_SIGNATURE_LEN]> {
        let signature = identity.keypair.sign(message);
        let mut out = [0u8; FRAME_SIGNATURE_LEN];
        out.copy_from_slice(signature.as_ref());
        Ok(out)
    }

    fn verify(&self, public_key: &[u8], message: &[u8], signature: &[u8]) -> Result<()> {
        ring::signature::UnparsedPublicKey::new(&ring::signature::ED25519, public_key)
            .verify(message, signature)
            .map_err(|_| {
                Error::Crypto(CryptoError::Signature("signature verification failed".to_string()))
            })
    }

    fn aead_seal(
        &self,
        algorithm: AeadAlgorithm,
        key: &[u8],
        nonce: &[u8; 12],
        aad: &[u8],
        plaintext: &[u8],
    ) -> Result<Vec<u8>> {
        use chacha20poly1305::aead::{Aead, KeyInit, Payload};
        match algorithm {
            AeadAlgorithm::ChaCha20Poly1305 => {
                use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};
                let cipher = ChaCha20Poly1305::new(Key::from_slice(key));
                cipher
                    .encrypt(Nonce::from_slice(nonce), Payload { msg: plaintext, aad })
                    .map_err(|_| CryptoError::Aead("seal failed".to_string()).into())
            }
            AeadAlgorithm::Aes256Gcm => {
                use aes_gcm::{Aes256Gcm, Key, Nonce};
                let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key));
                cipher
                    .encrypt(Nonce::from_slice(nonce), Payload { msg: plaintext, aad })
                    .map_err(|_| CryptoError::Aead("seal failed".to_string()).into())
            }
        }
    }

    fn aead_open(
        &self,
        algorithm: AeadAlgorithm,
        key: &[u8],
        nonce: &[u8; 12],
        aad: &[u8],
        ciphertext: &[u8],
    ) -> Result<Vec<u8>> {
        use chacha20poly1305::aead::{Aead, KeyInit, Payload};
        match algorithm {
            AeadAlgorithm::ChaCha20Poly1305 => {
                use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};
                let cipher = ChaCha20Poly1305::new(Key::from_slice(key));
                cipher
                    .decrypt(Nonce::from_slice(nonce), Payload { msg: ciphertext, aad })
                    .map_err(|_| CryptoError::Aead("open failed".to_string()).into())
            }
            AeadAlgorithm::Aes256Gcm => {
                use aes_gcm::{Aes256Gcm, Key, Nonce};
                let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key));
                cipher
                    .decrypt(Nonce::from_slice(nonce), Payload { msg: ciphertext, aad })
                    .map_err(|_| CryptoError::Aead("open failed".to_string()).into())
            }
        }
    }

    fn hash(&self, algorithm: HashAlgorithm, data: &[u8]) -> [u8; 32] {
        match algorithm {
            HashAlgorithm::Blake3 => *blake3::hash(data).as_bytes(),
            HashAlgorithm::Sha3_256 => {
                use sha3::Digest;
                let mut hasher = sha3::Sha3_256::new();
                hasher.update(data);
                hasher.finalize().into()
            }
        }
    }

    fn derive_key(&self, ikm: &[u8], salt: &[u8], info: &[u8], out: &mut [u8]) -> Result<()> {
        let hk = Hkdf::<Sha3_256>::new(Some(salt), ikm);
        hk.expand(info, out)
            .map_err(|_| CryptoError::Kdf("HKDF expand length invalid".to_string()).into())
    }

    fn random(&self, out: &mut [u8]) -> Result<()> {
        self.rng.fill(out).map_err(|_| CryptoError::Rng.into())
    }
}
