//! # Peerchat - encrypted peer-to-peer chat
//!
//! Two peers run the same program pointed at each other's address. One of
//! them ends up connecting and the other accepting; after that they are
//! equal.
//!
//! ## Overview
//!
//! - **Rendezvous**: try to connect out, otherwise listen on the local
//!   port and accept only the expected peer
//! - **Handshake**: prove or exchange RSA public keys, then build a
//!   32-byte session key from one random segment per side
//! - **Session**: JSON messages encrypted with AES-256-CTR, delivered to a
//!   callback
//!
//! ## Example Usage
//!
//! ```no_run
//! use peerchat::chat::{open, ChatConfig, ChatMessage};
//! use peerchat::crypto::KeyPaths;
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let config = ChatConfig::new("10.0.0.2", KeyPaths::default_location()?);
//! let keys = config.load_keys()?;
//!
//! let mut channel = open(
//!     &config,
//!     &keys,
//!     Some(|message: serde_json::Value| println!("peer: {}", message["text"])),
//!     || println!("peer left"),
//! )
//! .await?;
//!
//! channel.send(&ChatMessage::new("hello")).await?;
//! channel.close().await?;
//! # Ok(())
//! # }
//! ```

pub mod chat;
pub mod contacts;
pub mod crypto;

pub use chat::{ChatConfig, ChatError};
pub use crypto::{KeyError, KeyPair, KeyStore};
