//! Cryptographic operations for peerchat.
//!
//! This module provides:
//! - RSA identity key generation and PEM storage
//! - RSA encryption of short handshake values (OAEP and private-key padding)
//! - Session key assembly and AES-256-CTR message encryption
//! - A per-run key store tying them together

pub mod asymmetric;
pub mod keys;
pub mod keystore;
pub mod symmetric;

pub use asymmetric::{decrypt_oaep, encrypt_oaep, encrypt_private, recover_public};
pub use keys::{
    decode_private_key_pem, decode_public_key_pem, default_config_dir, encode_public_key_pem,
    ensure_directory, fingerprint, load_private_key, load_public_key, KeyError, KeyPair, KeyPaths,
    DEFAULT_KEY_BITS,
};
pub use keystore::{load_foreign_key, persist_foreign_key, KeyKind, KeyStore};
pub use symmetric::{SessionCipher, SessionKey, SEGMENT_HEX_LEN, SESSION_KEY_HEX_LEN};
