//! Handshake state machine.
//!
//! The engine does no I/O: it consumes one [`ControlPacket`] at a time and
//! says what to send back. The driver in `chat::session` moves the packets
//! over the wire.
//!
//! ## Flow
//!
//! 1. The acceptor opens with `verifyKey` if it already holds the peer's
//!    public key, otherwise with `keyRequest`.
//! 2. Each side proves or obtains the other's key, then sends `keysReady`.
//! 3. The first side to receive `keysReady` while ready itself sends a random
//!    16-byte session segment under the peer's key; the other side answers
//!    with its own segment. Both concatenate them in the same order.
//! 4. The side that completes the key second sends `sessionTest`; a matching
//!    `sessionResponse` makes both sides active.
//!
//! A packet that does not answer something this side sent fails the
//! handshake with a protocol error.

use rand::distributions::Alphanumeric;
use rand::rngs::OsRng;
use rand::Rng;
use tracing::debug;

use super::packet::ControlPacket;
use crate::chat::error::ChatError;
use crate::crypto::{decode_public_key_pem, KeyError, KeyKind, KeyStore};

/// Length of `verifyKey` and `sessionTest` challenge strings.
pub const CHALLENGE_LEN: usize = 26;

/// Which end of the TCP connection this peer is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Our outbound connect succeeded; we wait for the peer's first packet.
    Connector,
    /// We accepted the peer's connection and speak first.
    Acceptor,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Role::Connector => write!(f, "connector"),
            Role::Acceptor => write!(f, "acceptor"),
        }
    }
}

/// Handshake progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeState {
    Start,
    KeyRequestSent,
    KeyVerifySent,
    KeysReadyWait,
    SessionSegmentExchange,
    SessionTest,
    Active,
    Failed,
}

impl HandshakeState {
    /// No further control packets are accepted in this state.
    pub fn is_terminal(self) -> bool {
        matches!(self, HandshakeState::Active | HandshakeState::Failed)
    }
}

/// Outcome of feeding one packet to the engine.
#[derive(Debug)]
pub enum Step {
    /// Send this packet and keep reading.
    Send(ControlPacket),
    /// The session key is verified; send the packet, if any, and switch to
    /// session traffic.
    Established(Option<ControlPacket>),
    /// The handshake is over; send the packet, if any, then close.
    Failed {
        reply: Option<ControlPacket>,
        error: ChatError,
    },
}

/// Packets this side has sent that still shape what it will accept.
#[derive(Debug, Default, Clone, Copy)]
struct Sent {
    /// `keyRequest` is outstanding.
    key_request: bool,
    /// `verifyKey` is outstanding.
    challenge: bool,
    /// `key`, `verifyAnswer` or `keysReady`: the peer may now say `keysReady`.
    announcement: bool,
    /// Our session segment.
    segment: bool,
    /// `sessionTest`.
    test: bool,
}

/// One side of a handshake.
#[derive(Debug)]
pub struct Handshake {
    keys: KeyStore,
    role: Role,
    state: HandshakeState,
    /// The peer's key is verified or was delivered on request.
    keys_ready: bool,
    learned_peer_key: bool,
    sent: Sent,
}

impl Handshake {
    /// Create an engine. `keys` should carry an empty session key.
    pub fn new(keys: KeyStore, role: Role) -> Self {
        Self {
            keys,
            role,
            state: HandshakeState::Start,
            keys_ready: false,
            learned_peer_key: false,
            sent: Sent::default(),
        }
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn state(&self) -> HandshakeState {
        self.state
    }

    pub fn keys(&self) -> &KeyStore {
        &self.keys
    }

    /// Whether the peer's key arrived in a `key` packet during this handshake.
    pub fn learned_peer_key(&self) -> bool {
        self.learned_peer_key
    }

    /// Give back the key store, with the completed session key if active.
    pub fn into_keys(self) -> KeyStore {
        self.keys
    }

    /// The acceptor's opening packet.
    pub fn start(&mut self) -> Result<ControlPacket, ChatError> {
        if self.role != Role::Acceptor || self.state != HandshakeState::Start {
            return Err(ChatError::Protocol(format!(
                "{} cannot open the handshake in state {:?}",
                self.role, self.state
            )));
        }
        match self.request_peer_key() {
            Ok(packet) => Ok(packet),
            Err(e) => {
                self.state = HandshakeState::Failed;
                Err(e)
            }
        }
    }

    /// Open the handshake as a connector whose peer never spoke.
    ///
    /// Used when both ends dialled at once and each believes it connected
    /// to the other's listener.
    pub fn take_initiative(&mut self) -> Result<ControlPacket, ChatError> {
        if self.role != Role::Connector || self.state != HandshakeState::Start {
            return Err(ChatError::Protocol(format!(
                "{} cannot take the initiative in state {:?}",
                self.role, self.state
            )));
        }
        self.role = Role::Acceptor;
        self.start()
    }

    /// Consume one packet from the peer.
    pub fn handle(&mut self, packet: ControlPacket) -> Step {
        if self.state.is_terminal() {
            return Step::Failed {
                reply: None,
                error: ChatError::Protocol(format!(
                    "unexpected {} packet in state {:?}",
                    packet.name(),
                    self.state
                )),
            };
        }

        debug!(role = %self.role, state = ?self.state, packet = packet.name(), "handling control packet");

        match self.dispatch(packet) {
            Ok(step) => step,
            Err(error) => {
                self.state = HandshakeState::Failed;
                Step::Failed { reply: None, error }
            }
        }
    }

    fn dispatch(&mut self, packet: ControlPacket) -> Result<Step, ChatError> {
        if !self.accepts(&packet) {
            return Err(ChatError::Protocol(format!(
                "unexpected {} packet in state {:?}",
                packet.name(),
                self.state
            )));
        }

        match packet {
            ControlPacket::KeyRequest => {
                let key = self.keys.public_key_pem()?;
                self.sent.announcement = true;
                self.state = HandshakeState::KeysReadyWait;
                Ok(Step::Send(ControlPacket::Key { key }))
            }

            ControlPacket::Key { key } => {
                let peer = decode_public_key_pem(&key)
                    .map_err(|e| KeyError::ForeignKey(format!("peer sent an unusable key: {}", e)))?;
                self.keys.set_foreign_key(peer);
                self.learned_peer_key = true;
                self.sent.key_request = false;
                Ok(Step::Send(self.announce_ready()))
            }

            ControlPacket::VerifyKey { encrypt, value } => {
                let matches = self
                    .keys
                    .decrypt_with(KeyKind::Private, &encrypt)
                    .map(|plain| plain == value)
                    .unwrap_or(false);
                let reply = ControlPacket::VerifyAnswer { ans: matches };
                if matches {
                    self.sent.announcement = true;
                    self.state = HandshakeState::KeysReadyWait;
                    Ok(Step::Send(reply))
                } else {
                    self.state = HandshakeState::Failed;
                    Ok(Step::Failed {
                        reply: Some(reply),
                        error: ChatError::KeyMatch("peer's challenge was not encrypted to our key".to_string()),
                    })
                }
            }

            ControlPacket::VerifyAnswer { ans: true } => {
                self.sent.challenge = false;
                Ok(Step::Send(self.announce_ready()))
            }

            ControlPacket::VerifyAnswer { ans: false } => Err(ChatError::KeyMatch(
                "peer does not hold the private key for the configured foreign key".to_string(),
            )),

            ControlPacket::KeysReady => {
                if self.keys_ready {
                    let segment = self.keys.generate_session_segment().map_err(session_err)?;
                    let key = self.keys.encrypt_with(KeyKind::Foreign, &segment)?;
                    self.sent.segment = true;
                    self.state = HandshakeState::SessionSegmentExchange;
                    Ok(Step::Send(ControlPacket::SessionSegment { key }))
                } else {
                    Ok(Step::Send(self.request_peer_key()?))
                }
            }

            ControlPacket::SessionSegment { key } => {
                let segment = self.keys.decrypt_with(KeyKind::Private, &key).map_err(session_err)?;
                let complete = self.keys.set_session_segment(&segment).map_err(session_err)?;
                self.state = HandshakeState::SessionTest;

                if complete {
                    let value = challenge();
                    let encrypt = self.keys.encrypt_with(KeyKind::Session, &value)?;
                    self.sent.test = true;
                    Ok(Step::Send(ControlPacket::SessionTest { value, encrypt }))
                } else {
                    let own = self.keys.generate_session_segment().map_err(session_err)?;
                    let key = self.keys.encrypt_with(KeyKind::Foreign, &own)?;
                    self.sent.segment = true;
                    Ok(Step::Send(ControlPacket::SessionSegment { key }))
                }
            }

            ControlPacket::SessionTest { value, encrypt } => {
                if !self.keys.is_session_ready() {
                    return Err(ChatError::SessionKey(
                        "session test arrived before the session key was complete".to_string(),
                    ));
                }
                let matches = self
                    .keys
                    .decrypt_with(KeyKind::Session, &encrypt)
                    .map(|plain| plain == value)
                    .unwrap_or(false);
                let reply = ControlPacket::SessionResponse { value: matches };
                if matches {
                    self.state = HandshakeState::Active;
                    Ok(Step::Established(Some(reply)))
                } else {
                    self.state = HandshakeState::Failed;
                    Ok(Step::Failed {
                        reply: Some(reply),
                        error: ChatError::SessionKey("session test did not decrypt".to_string()),
                    })
                }
            }

            ControlPacket::SessionResponse { value: true } => {
                if !self.keys.is_session_ready() {
                    return Err(ChatError::SessionKey(
                        "peer confirmed a session key we do not have".to_string(),
                    ));
                }
                self.state = HandshakeState::Active;
                Ok(Step::Established(None))
            }

            ControlPacket::SessionResponse { value: false } => Err(ChatError::SessionKey(
                "peer could not decrypt the session test".to_string(),
            )),
        }
    }

    /// Whether `packet` can answer what this side has sent so far.
    ///
    /// `key` and `verifyAnswer` only count when we asked for them, so the
    /// peer's key is never taken as ready without the matching request.
    fn accepts(&self, packet: &ControlPacket) -> bool {
        let sent = &self.sent;
        match packet {
            ControlPacket::KeyRequest | ControlPacket::VerifyKey { .. } => !sent.segment,
            ControlPacket::Key { .. } => sent.key_request,
            ControlPacket::VerifyAnswer { .. } => sent.challenge,
            ControlPacket::KeysReady => sent.announcement && !sent.segment,
            ControlPacket::SessionSegment { .. } => self.keys_ready,
            // Completeness of the session key is checked when handling it.
            ControlPacket::SessionTest { .. } => !sent.test,
            ControlPacket::SessionResponse { .. } => sent.test,
        }
    }

    /// The peer's key is settled: mark it and tell the peer.
    fn announce_ready(&mut self) -> ControlPacket {
        self.keys_ready = true;
        self.sent.announcement = true;
        self.state = HandshakeState::KeysReadyWait;
        ControlPacket::KeysReady
    }

    /// `verifyKey` if the peer's key is known, `keyRequest` otherwise.
    fn request_peer_key(&mut self) -> Result<ControlPacket, ChatError> {
        if self.keys.has_foreign_key() {
            let value = challenge();
            let encrypt = self.keys.encrypt_with(KeyKind::Foreign, &value)?;
            self.sent.challenge = true;
            self.state = HandshakeState::KeyVerifySent;
            Ok(ControlPacket::VerifyKey { encrypt, value })
        } else {
            self.sent.key_request = true;
            self.state = HandshakeState::KeyRequestSent;
            Ok(ControlPacket::KeyRequest)
        }
    }
}

fn session_err(e: KeyError) -> ChatError {
    ChatError::SessionKey(e.to_string())
}

/// Fresh random alphanumeric challenge.
fn challenge() -> String {
    OsRng
        .sample_iter(&Alphanumeric)
        .take(CHALLENGE_LEN)
        .map(char::from)
        .collect()
}
