//! # Peerchat Chat Module
//!
//! Encrypted one-to-one chat between two peers that start the same program.
//!
//! ## Security Model
//!
//! - **RSA-2048 identities**, proven with an encrypted challenge when the
//!   peer's key is already known, exchanged in the clear otherwise
//! - **Session key** assembled from one random 16-byte segment per side,
//!   each sent encrypted to the other side's public key
//! - **AES-256-CTR** for session messages, restarting the keystream at a
//!   zero nonce for every message
//!
//! The CTR keystream restart means two messages under one session key
//! share keystream. This keeps the wire compatible with existing peers and
//! is not a confidentiality guarantee against a passive observer.

mod config;
mod error;
pub mod protocol;
mod session;
pub mod transport;

pub use config::{parse_peer, ChatConfig, Settings, DEFAULT_PORT, OPENING_TIMEOUT, SETTINGS_FILE};
pub use error::ChatError;
pub use protocol::{ControlPacket, Handshake, HandshakeState, Role};
pub use session::{negotiate, negotiate_within, open, Channel, ChatMessage};
