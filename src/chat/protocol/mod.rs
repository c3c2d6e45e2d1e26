//! Chat protocol types and operations.
//!
//! - **Control packets** exchanged as JSON before the session starts
//! - **Handshake engine** that turns received packets into replies

mod handshake;
mod packet;

pub use handshake::{Handshake, HandshakeState, Role, Step, CHALLENGE_LEN};
pub use packet::{ControlPacket, PacketStream};
