//! Handshake state machine.
//!
//! States: Idle → TransportEstablished → KeyExchanged →
//! HardwareAuthenticated → SessionEstablished, with a terminal `Aborted`
//! reachable from any non-terminal state on verification failure or
//! timeout.
//!
//! Message flow (initiator left, responder right):
//!
//! ```text
//! ClientHello  -->   random, offered suites, hybrid public, challenge
//!              <--   ServerHello: random, chosen suite, hybrid ciphertext, challenge
//! Auth         -->   identity + attestation + challenge response
//!              <--   Auth
//! Finished     -->   keyed hash over transcript
//!              <--   Finished
//! ```
//!
//! The state machine is sans-IO: [`Handshake::on_frame`] consumes one
//! decoded frame and returns frames to send. [`Handshake::run`] is the
//! async driver pumping a [`FrameStream`] under the handshake deadline.
//! Every state transition appends exactly one audit record before control
//! returns to the caller; a successful handshake appends four.

use crate::error::{Error, HandshakeError, Result};
use crate::hardware::{AttestationEvidence, AttestationVerifier, HardwareAuthenticator, Identity};
use crate::ledger::{AuditAction, AuditEvent, AuditLedger, AuditOutcome};
use crate::primitives::{CryptoProvider, KemKeyPair};
use crate::session::SessionKeys;
use crate::suite::CipherSuite;
use crate::transport::FrameStream;
use crate::wire::{Frame, FrameType};
use crate::HANDSHAKE_TIMEOUT_SECS;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use subtle::ConstantTimeEq;
use uuid::Uuid;
use zeroize::Zeroizing;

/// Which side of the handshake we drive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Initiator,
    Responder,
}

/// Handshake states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeState {
    Idle,
    TransportEstablished,
    KeyExchanged,
    HardwareAuthenticated,
    SessionEstablished,
    Aborted,
}

impl HandshakeState {
    pub fn name(self) -> &'static str {
        match self {
            HandshakeState::Idle => "Idle",
            HandshakeState::TransportEstablished => "TransportEstablished",
            HandshakeState::KeyExchanged => "KeyExchanged",
            HandshakeState::HardwareAuthenticated => "HardwareAuthenticated",
            HandshakeState::SessionEstablished => "SessionEstablished",
            HandshakeState::Aborted => "Aborted",
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct HelloPayload {
    /// Initiator-chosen session id; the responder adopts it. Both hellos
    /// are in the transcript, so tampering breaks the Finished check.
    session_id: Uuid,
    random: [u8; 32],
    /// Offered suites (initiator) or the single chosen suite (responder).
    suites: Vec<CipherSuite>,
    /// Hybrid public blob (initiator only).
    kem_public: Vec<u8>,
    /// Hybrid ciphertext blob (responder only).
    kem_ciphertext: Vec<u8>,
    /// Nonce the peer must sign in its Authentication message.
    challenge_nonce: [u8; 32],
}

#[derive(Debug, Serialize, Deserialize)]
struct AuthPayload {
    identity: Identity,
    evidence: AttestationEvidence,
    challenge_response: Vec<u8>,
}

#[derive(Debug, Serialize, Deserialize)]
struct FinishedPayload {
    transcript_mac: [u8; 32],
}

#[derive(Debug, Serialize, Deserialize)]
enum HandshakeMessage {
    Hello(HelloPayload),
    Finished(FinishedPayload),
}

/// Traffic secrets derived at key exchange. Direction keys are stored as
/// initiator-to-responder / responder-to-initiator so both sides derive
/// identical material.
struct HandshakeSecrets {
    c2s_key: Zeroizing<[u8; 32]>,
    s2c_key: Zeroizing<[u8; 32]>,
    initiator_finished: Zeroizing<[u8; 32]>,
    responder_finished: Zeroizing<[u8; 32]>,
}

/// Result of feeding one event into the state machine.
pub enum HandshakeStep {
    /// Frames to send; handshake continues.
    Reply(Vec<Frame>),
    /// Nothing to send; waiting on the peer.
    Pending,
    /// Handshake complete. `reply`, if present, must still be sent.
    Established { reply: Option<Frame>, session: EstablishedSession },
}

impl std::fmt::Debug for HandshakeStep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Established sessions carry key material; print shape only.
        match self {
            HandshakeStep::Reply(frames) => f.debug_tuple("Reply").field(&frames.len()).finish(),
            HandshakeStep::Pending => f.write_str("Pending"),
            HandshakeStep::Established { .. } => f.write_str("Established"),
        }
    }
}

/// Everything the session engine needs from a completed handshake.
pub struct EstablishedSession {
    pub session_id: Uuid,
    pub suite: CipherSuite,
    pub keys: SessionKeys,
    pub peer: Identity,
}

/// Handshake configuration.
#[derive(Debug, Clone)]
pub struct HandshakeConfig {
    pub timeout: Duration,
    pub offered_suites: Vec<CipherSuite>,
}

impl Default for HandshakeConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(HANDSHAKE_TIMEOUT_SECS),
            offered_suites: CipherSuite::supported(),
        }
    }
}

pub struct Handshake {
    role: Role,
    state: HandshakeState,
    config: HandshakeConfig,
    session_id: Uuid,
    provider: Arc<dyn CryptoProvider>,
    authenticator: Arc<dyn HardwareAuthenticator>,
    verifier: AttestationVerifier,
    ledger: Arc<AuditLedger>,
    transcript: blake3::Hasher,
    suite: Option<CipherSuite>,
    local_random: [u8; 32],
    peer_random: Option<[u8; 32]>,
    kem_keypair: Option<KemKeyPair>,
    /// Nonce we sent; the peer must sign it.
    local_challenge: [u8; 32],
    /// Nonce the peer sent; we must sign it.
    peer_challenge: Option<[u8; 32]>,
    secrets: Option<HandshakeSecrets>,
    peer_identity: Option<Identity>,
}

impl Handshake {
    pub fn new(
        role: Role,
        config: HandshakeConfig,
        provider: Arc<dyn CryptoProvider>,
        authenticator: Arc<dyn HardwareAuthenticator>,
        ledger: Arc<AuditLedger>,
    ) -> Self {
        let verifier = AttestationVerifier::new(provider.clone());
        Self {
            role,
            state: HandshakeState::Idle,
            config,
            session_id: Uuid::new_v4(),
            provider,
            authenticator,
            verifier,
            ledger,
            transcript: blake3::Hasher::new(),
            suite: None,
            local_random: [0u8; 32],
            peer_random: None,
            kem_keypair: None,
            local_challenge: [0u8; 32],
            peer_challenge: None,
            secrets: None,
            peer_identity: None,
        }
    }

    pub fn state(&self) -> HandshakeState {
        self.state
    }

    pub fn session_id(&self) -> Uuid {
        self.session_id
    }

    /// The external transport reported stream-open. Transitions
    /// Idle → TransportEstablished; the initiator's ClientHello comes back
    /// as a reply.
    pub fn on_transport_established(&mut self) -> Result<HandshakeStep> {
        if self.state != HandshakeState::Idle {
            return self.fail(HandshakeError::UnexpectedMessage {
                state: self.state.name(),
                frame_type: "transport-open",
            });
        }
        self.provider.random(&mut self.local_random)?;
        self.provider.random(&mut self.local_challenge)?;

        let reply = if self.role == Role::Initiator {
            let keypair = self.provider.kem_keypair(self.config.offered_suites[0].kem)?;
            let hello = HelloPayload {
                session_id: self.session_id,
                random: self.local_random,
                suites: self.config.offered_suites.clone(),
                kem_public: keypair.public_bytes().to_vec(),
                kem_ciphertext: Vec::new(),
                challenge_nonce: self.local_challenge,
            };
            self.kem_keypair = Some(keypair);
            let frame = self.handshake_frame(&HandshakeMessage::Hello(hello))?;
            // Both hellos enter the transcript on both sides.
            self.transcript.update(&frame.payload);
            vec![frame]
        } else {
            Vec::new()
        };

        self.transition(HandshakeState::TransportEstablished, AuditAction::SessionStart)?;
        if reply.is_empty() {
            Ok(HandshakeStep::Pending)
        } else {
            Ok(HandshakeStep::Reply(reply))
        }
    }

    /// Feed one peer frame. Undefined state/frame pairs abort.
    pub async fn on_frame(&mut self, frame: Frame) -> Result<HandshakeStep> {
        match (self.state, frame.frame_type, self.role) {
            (HandshakeState::TransportEstablished, FrameType::Handshake, Role::Responder) => {
                self.on_client_hello(frame).await
            }
            (HandshakeState::TransportEstablished, FrameType::Handshake, Role::Initiator) => {
                self.on_server_hello(frame).await
            }
            (HandshakeState::KeyExchanged, FrameType::Authentication, _) => {
                self.on_authentication(frame).await
            }
            (HandshakeState::HardwareAuthenticated, FrameType::Handshake, _) => {
                self.on_finished(frame)
            }
            (state, frame_type, _) => self.fail(HandshakeError::UnexpectedMessage {
                state: state.name(),
                frame_type: frame_type.name(),
            }),
        }
    }

    /// The handshake deadline elapsed with no expected peer message.
    pub fn on_timeout(&mut self) -> Result<HandshakeStep> {
        self.fail(HandshakeError::Timeout)
    }

    /// Drive the handshake to completion over a frame stream, bounded by
    /// the configured deadline.
    pub async fn run(mut self, stream: &mut dyn FrameStream) -> Result<EstablishedSession> {
        let deadline = tokio::time::Instant::now() + self.config.timeout;

        let mut step = self.on_transport_established()?;
        loop {
            match step {
                HandshakeStep::Reply(frames) => {
                    for frame in frames {
                        stream.send(frame).await?;
                    }
                }
                HandshakeStep::Pending => {}
                HandshakeStep::Established { reply, session } => {
                    if let Some(frame) = reply {
                        stream.send(frame).await?;
                    }
                    return Ok(session);
                }
            }

            let frame = match tokio::time::timeout_at(deadline, stream.receive()).await {
                Ok(received) => received?,
                Err(_) => {
                    self.on_timeout()?;
                    unreachable!("on_timeout always errors");
                }
            };
            step = self.on_frame(frame).await?;
        }
    }

    // ---- responder: ClientHello -> ServerHello -------------------------

    async fn on_client_hello(&mut self, frame: Frame) -> Result<HandshakeStep> {
        let hello = match self.parse_hello(&frame) {
            Ok(hello) => hello,
            Err(err) => return self.fail_with(err),
        };

        let suite = match CipherSuite::negotiate(&self.config.offered_suites, &hello.suites) {
            Some(suite) => suite,
            None => return self.fail(HandshakeError::KexMismatch),
        };

        self.transcript.update(&frame.payload);
        // The initiator names the session; all further audit records and
        // the session AEAD bind to this id on both sides.
        self.session_id = hello.session_id;
        self.peer_random = Some(hello.random);
        self.peer_challenge = Some(hello.challenge_nonce);
        self.suite = Some(suite);

        let encapsulation = self.provider.kem_encapsulate(suite.kem, &hello.kem_public);
        let (ciphertext, secret) = match encapsulation {
            Ok(result) => result,
            Err(_) => return self.fail(HandshakeError::KexMismatch),
        };

        self.provider.random(&mut self.local_random)?;
        self.provider.random(&mut self.local_challenge)?;
        let server_hello = HelloPayload {
            session_id: self.session_id,
            random: self.local_random,
            suites: vec![suite],
            kem_public: Vec::new(),
            kem_ciphertext: ciphertext,
            challenge_nonce: self.local_challenge,
        };
        let reply = self.handshake_frame(&HandshakeMessage::Hello(server_hello))?;
        self.transcript.update(&reply.payload);

        self.derive_secrets(&secret.concat())?;
        self.transition(HandshakeState::KeyExchanged, AuditAction::KeyExchange)?;
        Ok(HandshakeStep::Reply(vec![reply]))
    }

    // ---- initiator: ServerHello -> Authentication ----------------------

    async fn on_server_hello(&mut self, frame: Frame) -> Result<HandshakeStep> {
        let hello = match self.parse_hello(&frame) {
            Ok(hello) => hello,
            Err(err) => return self.fail_with(err),
        };

        // The chosen suite must be one we offered.
        let suite = match hello.suites.first().copied() {
            Some(suite) if self.config.offered_suites.contains(&suite) => suite,
            _ => return self.fail(HandshakeError::KexMismatch),
        };
        // The public blob we sent was for our preferred KEM; a peer picking
        // a different KEM cannot have encapsulated to it.
        if suite.kem != self.config.offered_suites[0].kem {
            return self.fail(HandshakeError::KexMismatch);
        }

        self.transcript.update(&frame.payload);
        self.peer_random = Some(hello.random);
        self.peer_challenge = Some(hello.challenge_nonce);
        self.suite = Some(suite);

        let keypair = match self.kem_keypair.take() {
            Some(keypair) => keypair,
            None => return self.fail_with(Error::Internal("kem keypair missing".to_string())),
        };
        let secret = match self.provider.kem_decapsulate(keypair, &hello.kem_ciphertext) {
            Ok(secret) => secret,
            Err(_) => return self.fail(HandshakeError::KexMismatch),
        };

        self.derive_secrets(&secret.concat())?;
        self.transition(HandshakeState::KeyExchanged, AuditAction::KeyExchange)?;

        let auth = self.build_authentication().await?;
        Ok(HandshakeStep::Reply(vec![auth]))
    }

    // ---- both: Authentication ------------------------------------------

    async fn on_authentication(&mut self, frame: Frame) -> Result<HandshakeStep> {
        let auth: AuthPayload = match postcard::from_bytes(&frame.payload) {
            Ok(auth) => auth,
            Err(_) => {
                return self.fail(HandshakeError::UnexpectedMessage {
                    state: self.state.name(),
                    frame_type: "malformed Authentication",
                })
            }
        };

        if let Err(err) = self.verifier.verify_evidence(&auth.identity, &auth.evidence) {
            return self.fail_with(err);
        }
        if let Err(err) =
            self.verifier
                .verify_challenge(&auth.identity, &self.local_challenge, &auth.challenge_response)
        {
            return self.fail_with(err);
        }

        self.transcript.update(&frame.payload);
        self.peer_identity = Some(auth.identity);
        self.transition(HandshakeState::HardwareAuthenticated, AuditAction::Authentication)?;

        match self.role {
            Role::Responder => {
                // Reply with our own credential; the initiator sends
                // Finished next.
                let reply = self.build_authentication().await?;
                Ok(HandshakeStep::Reply(vec![reply]))
            }
            Role::Initiator => {
                let finished = self.build_finished()?;
                Ok(HandshakeStep::Reply(vec![finished]))
            }
        }
    }

    // ---- both: Finished -------------------------------------------------

    fn on_finished(&mut self, frame: Frame) -> Result<HandshakeStep> {
        let message: HandshakeMessage = match postcard::from_bytes(&frame.payload) {
            Ok(message) => message,
            Err(_) => {
                return self.fail(HandshakeError::UnexpectedMessage {
                    state: self.state.name(),
                    frame_type: "malformed Finished",
                })
            }
        };
        let finished = match message {
            HandshakeMessage::Finished(finished) => finished,
            HandshakeMessage::Hello(_) => {
                return self.fail(HandshakeError::UnexpectedMessage {
                    state: self.state.name(),
                    frame_type: "Hello",
                })
            }
        };

        let expected = self.finished_mac(peer_role(self.role))?;
        if !bool::from(expected.ct_eq(&finished.transcript_mac)) {
            return self.fail(HandshakeError::TranscriptMismatch);
        }

        // Responder verifies the initiator's Finished, then sends its own.
        let reply = match self.role {
            Role::Responder => Some(self.build_finished()?),
            Role::Initiator => None,
        };

        self.transition(HandshakeState::SessionEstablished, AuditAction::SessionEstablished)?;
        let session = self.take_session()?;
        Ok(HandshakeStep::Established { reply, session })
    }

    // ---- internals ------------------------------------------------------

    fn parse_hello(&self, frame: &Frame) -> Result<HelloPayload> {
        let message: HandshakeMessage =
            postcard::from_bytes(&frame.payload).map_err(|_| {
                Error::Handshake(HandshakeError::UnexpectedMessage {
                    state: self.state.name(),
                    frame_type: "malformed Hello",
                })
            })?;
        match message {
            HandshakeMessage::Hello(hello) => Ok(hello),
            HandshakeMessage::Finished(_) => Err(HandshakeError::UnexpectedMessage {
                state: self.state.name(),
                frame_type: "Finished",
            }
            .into()),
        }
    }

    fn handshake_frame(&self, message: &HandshakeMessage) -> Result<Frame> {
        let payload = postcard::to_allocvec(message)?;
        Ok(Frame::new(FrameType::Handshake, payload))
    }

    async fn build_authentication(&mut self) -> Result<Frame> {
        let peer_challenge = self
            .peer_challenge
            .ok_or_else(|| Error::Internal("peer challenge missing".to_string()))?;
        let evidence = self.authenticator.attestation().await?;
        let challenge_response = self.authenticator.challenge(&peer_challenge).await?;
        let auth = AuthPayload {
            identity: self.authenticator.identity(),
            evidence,
            challenge_response,
        };
        let payload = postcard::to_allocvec(&auth)?;
        self.transcript.update(&payload);
        Ok(Frame::new(FrameType::Authentication, payload))
    }

    fn build_finished(&self) -> Result<Frame> {
        let transcript_mac = self.finished_mac(self.role)?;
        let payload =
            postcard::to_allocvec(&HandshakeMessage::Finished(FinishedPayload { transcript_mac }))?;
        Ok(Frame::new(FrameType::Handshake, payload))
    }

    /// Keyed hash over the running transcript under the given side's
    /// finished key.
    fn finished_mac(&self, side: Role) -> Result<[u8; 32]> {
        let secrets = self
            .secrets
            .as_ref()
            .ok_or_else(|| Error::Internal("finished before key exchange".to_string()))?;
        let key = match side {
            Role::Initiator => &secrets.initiator_finished,
            Role::Responder => &secrets.responder_finished,
        };
        let transcript_hash = self.transcript.finalize();
        Ok(*blake3::keyed_hash(key, transcript_hash.as_bytes()).as_bytes())
    }

    /// Derive the traffic and finished secrets from both shared-secret
    /// halves plus the transcript so far. Never from either secret alone:
    /// `ikm` is the concatenation produced by
    /// [`crate::primitives::HybridSecret`]. Frame signatures stay on the
    /// long-term identity key and are not part of this schedule.
    fn derive_secrets(&mut self, ikm: &[u8]) -> Result<()> {
        let peer_random = self
            .peer_random
            .ok_or_else(|| Error::Internal("peer random missing".to_string()))?;
        let (initiator_random, responder_random) = match self.role {
            Role::Initiator => (self.local_random, peer_random),
            Role::Responder => (peer_random, self.local_random),
        };
        let mut salt = Vec::with_capacity(64);
        salt.extend_from_slice(&initiator_random);
        salt.extend_from_slice(&responder_random);

        let transcript_hash = self.transcript.finalize();
        let mut info = Vec::with_capacity(20 + 32);
        info.extend_from_slice(b"qsftp v1 handshake");
        info.extend_from_slice(transcript_hash.as_bytes());

        let mut okm = Zeroizing::new([0u8; 128]);
        self.provider.derive_key(ikm, &salt, &info, okm.as_mut())?;

        let key = |offset: usize| {
            let mut out = Zeroizing::new([0u8; 32]);
            out.copy_from_slice(&okm[offset..offset + 32]);
            out
        };
        self.secrets = Some(HandshakeSecrets {
            c2s_key: key(0),
            s2c_key: key(32),
            initiator_finished: key(64),
            responder_finished: key(96),
        });
        Ok(())
    }

    fn take_session(&mut self) -> Result<EstablishedSession> {
        let secrets = self
            .secrets
            .take()
            .ok_or_else(|| Error::Internal("session keys missing".to_string()))?;
        let suite = self
            .suite
            .ok_or_else(|| Error::Internal("suite missing".to_string()))?;
        let peer = self
            .peer_identity
            .take()
            .ok_or_else(|| Error::Internal("peer identity missing".to_string()))?;
        let keys = SessionKeys::new(self.role, secrets.c2s_key, secrets.s2c_key);
        Ok(EstablishedSession { session_id: self.session_id, suite, keys, peer })
    }

    /// Append the single audit record for a state transition, then move.
    /// Logging is part of the transition's postcondition: if the ledger
    /// refuses the append, the transition does not happen and the error
    /// escalates (ledger failures are process-fatal).
    fn transition(&mut self, next: HandshakeState, action: AuditAction) -> Result<()> {
        let mut event = AuditEvent::new(action, AuditOutcome::Success)
            .with_session(self.session_id)
            .with_resource(next.name());
        if let Some(peer) = &self.peer_identity {
            event = event.with_user(peer.principal.clone()).with_hardware(peer.device_id.clone());
        }
        self.ledger.append(event)?;
        tracing::debug!(
            session = %self.session_id,
            from = self.state.name(),
            to = next.name(),
            "handshake transition"
        );
        self.state = next;
        Ok(())
    }

    fn fail(&mut self, err: HandshakeError) -> Result<HandshakeStep> {
        self.fail_with(err.into())
    }

    /// Abort: zeroize in-progress secrets, audit the transition, surface
    /// the error.
    fn fail_with(&mut self, err: Error) -> Result<HandshakeStep> {
        self.secrets = None;
        self.kem_keypair = None;
        if self.state != HandshakeState::Aborted {
            self.state = HandshakeState::Aborted;
            self.ledger.append_best_effort(
                AuditEvent::new(AuditAction::HandshakeAborted, AuditOutcome::Failure)
                    .with_session(self.session_id)
                    .with_resource(err.to_string()),
            );
        }
        tracing::warn!(session = %self.session_id, error = %err, "handshake aborted");
        Err(err)
    }
}

fn peer_role(role: Role) -> Role {
    match role {
        Role::Initiator => Role::Responder,
        Role::Responder => Role::Initiator,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::{HardwareClass, SoftToken};
    use crate::primitives::{SigningIdentity, SoftwareProvider};
    use crate::suite::CipherSuite;

    struct Harness {
        provider: Arc<dyn CryptoProvider>,
        ledger: Arc<AuditLedger>,
    }

    impl Harness {
        fn new() -> Self {
            let provider: Arc<dyn CryptoProvider> = Arc::new(SoftwareProvider::new());
            let (signing, _) = SigningIdentity::generate().unwrap();
            let ledger = Arc::new(AuditLedger::new(provider.clone(), signing));
            Self { provider, ledger }
        }

        fn handshake(&self, role: Role, principal: &str, config: HandshakeConfig) -> Handshake {
            let (signing, _) = SigningIdentity::generate().unwrap();
            let token = Arc::new(SoftToken::new(
                principal,
                HardwareClass::SecurityToken,
                Arc::new(signing),
                self.provider.clone(),
            ));
            Handshake::new(role, config, self.provider.clone(), token, self.ledger.clone())
        }
    }

    fn reply_frames(step: HandshakeStep) -> Vec<Frame> {
        match step {
            HandshakeStep::Reply(frames) => frames,
            HandshakeStep::Pending => Vec::new(),
            HandshakeStep::Established { .. } => panic!("unexpected establishment"),
        }
    }

    async fn complete(
        mut client: Handshake,
        mut server: Handshake,
    ) -> (EstablishedSession, EstablishedSession) {
        use std::collections::VecDeque;

        let mut to_server: VecDeque<Frame> =
            reply_frames(client.on_transport_established().unwrap()).into();
        assert!(matches!(server.on_transport_established().unwrap(), HandshakeStep::Pending));

        let mut to_client: VecDeque<Frame> = VecDeque::new();
        let mut client_session = None;
        let mut server_session = None;
        while client_session.is_none() || server_session.is_none() {
            if let Some(frame) = to_server.pop_front() {
                match server.on_frame(frame).await.unwrap() {
                    HandshakeStep::Reply(frames) => to_client.extend(frames),
                    HandshakeStep::Pending => {}
                    HandshakeStep::Established { reply, session } => {
                        to_client.extend(reply);
                        server_session = Some(session);
                    }
                }
            } else if let Some(frame) = to_client.pop_front() {
                match client.on_frame(frame).await.unwrap() {
                    HandshakeStep::Reply(frames) => to_server.extend(frames),
                    HandshakeStep::Pending => {}
                    HandshakeStep::Established { reply, session } => {
                        to_server.extend(reply);
                        client_session = Some(session);
                    }
                }
            } else {
                panic!("handshake stalled");
            }
        }
        (client_session.unwrap(), server_session.unwrap())
    }

    #[tokio::test]
    async fn test_full_handshake_reaches_established() {
        let harness = Harness::new();
        let client = harness.handshake(Role::Initiator, "alice", HandshakeConfig::default());
        let server = harness.handshake(Role::Responder, "server", HandshakeConfig::default());

        let (client_session, server_session) = complete(client, server).await;
        assert_eq!(client_session.suite, CipherSuite::default());
        assert_eq!(server_session.suite, CipherSuite::default());
        assert_eq!(client_session.peer.principal, "server");
        assert_eq!(server_session.peer.principal, "alice");

        // One record per transition past Idle, for each side.
        let records = harness.ledger.records();
        assert_eq!(records.len(), 8);
        let count = |action: AuditAction| records.iter().filter(|r| r.action == action).count();
        assert_eq!(count(AuditAction::SessionStart), 2);
        assert_eq!(count(AuditAction::KeyExchange), 2);
        assert_eq!(count(AuditAction::Authentication), 2);
        assert_eq!(count(AuditAction::SessionEstablished), 2);
        harness.ledger.verify_chain(0, 7).unwrap();
    }

    #[tokio::test]
    async fn test_traffic_keys_agree_across_roles() {
        let harness = Harness::new();
        let client = harness.handshake(Role::Initiator, "alice", HandshakeConfig::default());
        let server = harness.handshake(Role::Responder, "server", HandshakeConfig::default());
        let (client_session, server_session) = complete(client, server).await;

        assert_eq!(client_session.keys.send_key(), server_session.keys.recv_key());
        assert_eq!(client_session.keys.recv_key(), server_session.keys.send_key());
    }

    #[tokio::test]
    async fn test_peers_agree_on_session_id() {
        let harness = Harness::new();
        let client = harness.handshake(Role::Initiator, "alice", HandshakeConfig::default());
        let server = harness.handshake(Role::Responder, "server", HandshakeConfig::default());
        let (client_session, server_session) = complete(client, server).await;
        assert_eq!(client_session.session_id, server_session.session_id);
    }

    #[tokio::test]
    async fn test_kex_mismatch_aborts() {
        let harness = Harness::new();
        let client_config = HandshakeConfig {
            offered_suites: vec![CipherSuite::paranoid()],
            ..Default::default()
        };
        let server_config = HandshakeConfig {
            offered_suites: vec![CipherSuite::default()],
            ..Default::default()
        };
        let mut client = harness.handshake(Role::Initiator, "alice", client_config);
        let mut server = harness.handshake(Role::Responder, "server", server_config);

        let hello = reply_frames(client.on_transport_established().unwrap()).remove(0);
        server.on_transport_established().unwrap();
        let err = server.on_frame(hello).await.unwrap_err();
        assert!(matches!(err, Error::Handshake(HandshakeError::KexMismatch)));
        assert_eq!(server.state(), HandshakeState::Aborted);

        // Any further frame is rejected; Aborted is absorbing.
        let stray = Frame::new(FrameType::Handshake, vec![]);
        assert!(server.on_frame(stray).await.is_err());
        assert_eq!(server.state(), HandshakeState::Aborted);
    }

    #[tokio::test]
    async fn test_expired_attestation_aborts() {
        let harness = Harness::new();
        let mut client = harness.handshake(Role::Initiator, "alice", HandshakeConfig::default());
        let (signing, _) = SigningIdentity::generate().unwrap();
        let stale_token = Arc::new(
            SoftToken::new("mallory", HardwareClass::Tpm, Arc::new(signing), harness.provider.clone())
                .with_evidence_ttl(0),
        );
        let mut server = Handshake::new(
            Role::Responder,
            HandshakeConfig::default(),
            harness.provider.clone(),
            stale_token,
            harness.ledger.clone(),
        );

        let hello = reply_frames(client.on_transport_established().unwrap()).remove(0);
        server.on_transport_established().unwrap();
        let server_hello = reply_frames(server.on_frame(hello).await.unwrap()).remove(0);
        let client_auth = reply_frames(client.on_frame(server_hello).await.unwrap()).remove(0);
        // Server accepts the (valid) client credential, then replies with
        // its own expired evidence, which the client rejects.
        let server_auth = reply_frames(server.on_frame(client_auth).await.unwrap()).remove(0);
        let err = client.on_frame(server_auth).await.unwrap_err();
        assert!(matches!(err, Error::Handshake(HandshakeError::AttestationExpired)));
        assert_eq!(client.state(), HandshakeState::Aborted);
    }

    #[tokio::test]
    async fn test_unexpected_frame_aborts() {
        let harness = Harness::new();
        let mut server = harness.handshake(Role::Responder, "server", HandshakeConfig::default());
        server.on_transport_established().unwrap();

        let frame = Frame::new(FrameType::DataTransfer, vec![1, 2, 3]);
        let err = server.on_frame(frame).await.unwrap_err();
        assert!(matches!(err, Error::Handshake(HandshakeError::UnexpectedMessage { .. })));
        assert_eq!(server.state(), HandshakeState::Aborted);
    }

    #[tokio::test]
    async fn test_timeout_aborts() {
        let harness = Harness::new();
        let mut client = harness.handshake(Role::Initiator, "alice", HandshakeConfig::default());
        client.on_transport_established().unwrap();
        let err = client.on_timeout().unwrap_err();
        assert!(matches!(err, Error::Handshake(HandshakeError::Timeout)));
        assert_eq!(client.state(), HandshakeState::Aborted);
    }
}
