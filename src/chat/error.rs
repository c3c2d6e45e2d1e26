//! Chat error types.

use thiserror::Error;

use crate::crypto::KeyError;

/// Errors that can occur while establishing or using a chat channel.
#[derive(Error, Debug)]
pub enum ChatError {
    /// The peer failed the identity challenge, or we failed theirs.
    #[error("Key match error: {0}")]
    KeyMatch(String),

    /// The session key could not be assembled or did not verify.
    #[error("Session key error: {0}")]
    SessionKey(String),

    /// Name resolution, connect, bind or accept failed.
    #[error("Connection error: {0}")]
    Connection(String),

    /// Invalid combination of options or a missing callback.
    #[error("Configuration error: {0}")]
    Config(String),

    /// A packet or message could not be parsed or arrived out of turn.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// The peer closed the stream before the handshake finished.
    #[error("Connection closed by peer")]
    ConnectionClosed,

    /// Key loading or cryptographic failure.
    #[error(transparent)]
    Key(#[from] KeyError),

    /// I/O error.
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),
}

impl ChatError {
    /// Numeric code for the classic failure classes, as printed by the CLI.
    pub fn code(&self) -> Option<u16> {
        match self {
            ChatError::Key(KeyError::Directory(_)) => Some(100),
            ChatError::Key(KeyError::LocalKey(_)) => Some(101),
            ChatError::Key(KeyError::ForeignKey(_)) => Some(102),
            ChatError::KeyMatch(_) => Some(103),
            ChatError::SessionKey(_) => Some(104),
            _ => None,
        }
    }
}
