//! Key material for one run: identity, peer key and session key.
//!
//! The identity key pair is loaded (or generated) once and shared read-only.
//! The foreign key is either configured up front or learned during the
//! handshake. The session key accumulator belongs to a single connection
//! attempt; [`KeyStore::for_new_session`] hands out a store with a fresh one.

use std::fs;
use std::path::Path;
use std::sync::Arc;

use rsa::RsaPublicKey;
use tracing::debug;

use super::asymmetric::{
    decrypt_oaep, encrypt_oaep, encrypt_private, from_base64, recover_public, to_base64,
};
use super::keys::{decode_public_key_pem, encode_public_key_pem, ensure_directory, KeyError, KeyPair, KeyPaths};
use super::symmetric::{SessionCipher, SessionKey};
use crate::contacts::ForeignKeyProfiles;

/// Which key an encrypt/decrypt call goes through.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyKind {
    /// Own public key: OAEP encrypt, recover values made with the own private key.
    Public,
    /// Own private key: type-1 encrypt, OAEP decrypt.
    Private,
    /// Peer's public key: OAEP encrypt, recover values made with the peer's private key.
    Foreign,
    /// Completed AES-256-CTR session key.
    Session,
}

/// Key material owned by one peer process.
#[derive(Debug)]
pub struct KeyStore {
    identity: Arc<KeyPair>,
    foreign: Option<RsaPublicKey>,
    session: SessionKey,
}

impl KeyStore {
    /// Create a store around an identity key pair.
    pub fn new(identity: KeyPair) -> Self {
        Self {
            identity: Arc::new(identity),
            foreign: None,
            session: SessionKey::new(),
        }
    }

    /// Set a pre-configured foreign key.
    pub fn with_foreign_key(mut self, key: RsaPublicKey) -> Self {
        self.foreign = Some(key);
        self
    }

    /// Prepares the storage directory and obtains the identity key pair.
    ///
    /// With `temporary` a fresh pair is generated and nothing is read;
    /// otherwise the PEM files named by `paths` must exist.
    pub fn load_or_generate(paths: &KeyPaths, temporary: bool) -> Result<Self, KeyError> {
        ensure_directory(&paths.dir)?;

        let identity = if temporary {
            debug!("generating temporary identity key pair");
            KeyPair::generate()?
        } else {
            KeyPair::load_from_files(&paths.private, &paths.public)?
        };

        Ok(Self::new(identity))
    }

    /// Loads and sets the foreign key from `path`, optionally by profile name.
    pub fn load_foreign_key(&mut self, path: &Path, profile: Option<&str>) -> Result<(), KeyError> {
        self.foreign = Some(load_foreign_key(path, profile)?);
        Ok(())
    }

    /// Writes the identity key pair into the configured locations.
    pub fn persist_key_pair(&self, paths: &KeyPaths) -> Result<(), KeyError> {
        ensure_directory(&paths.dir)?;
        self.identity.save_to_files(&paths.private, &paths.public)
    }

    /// The identity key pair.
    pub fn identity(&self) -> &KeyPair {
        &self.identity
    }

    /// Own public key as PEM.
    pub fn public_key_pem(&self) -> Result<String, KeyError> {
        self.identity.public_key_pem()
    }

    /// The peer's public key, if known.
    pub fn foreign_key(&self) -> Option<&RsaPublicKey> {
        self.foreign.as_ref()
    }

    /// Whether the peer's public key is known.
    pub fn has_foreign_key(&self) -> bool {
        self.foreign.is_some()
    }

    /// Adopts a peer public key.
    pub fn set_foreign_key(&mut self, key: RsaPublicKey) {
        self.foreign = Some(key);
    }

    /// A store sharing identity and foreign key, with an empty session key.
    pub fn for_new_session(&self) -> Self {
        Self {
            identity: Arc::clone(&self.identity),
            foreign: self.foreign.clone(),
            session: SessionKey::new(),
        }
    }

    /// Encrypts text under the given key.
    ///
    /// RSA kinds return base64; the session kind returns hex.
    pub fn encrypt_with(&self, kind: KeyKind, plaintext: &str) -> Result<String, KeyError> {
        let bytes = plaintext.as_bytes();
        match kind {
            KeyKind::Public => Ok(to_base64(&encrypt_oaep(self.identity.public_key(), bytes)?)),
            KeyKind::Private => Ok(to_base64(&encrypt_private(self.identity.private_key(), bytes)?)),
            KeyKind::Foreign => Ok(to_base64(&encrypt_oaep(self.require_foreign()?, bytes)?)),
            KeyKind::Session => Ok(self.require_session()?.encrypt_to_hex(plaintext)),
        }
    }

    /// Decrypts text produced by [`encrypt_with`](Self::encrypt_with) on either side.
    pub fn decrypt_with(&self, kind: KeyKind, ciphertext: &str) -> Result<String, KeyError> {
        let plaintext = match kind {
            KeyKind::Public => recover_public(self.identity.public_key(), &from_base64(ciphertext)?)?,
            KeyKind::Private => decrypt_oaep(self.identity.private_key(), &from_base64(ciphertext)?)?,
            KeyKind::Foreign => recover_public(
                self.foreign
                    .as_ref()
                    .ok_or_else(|| KeyError::Decryption("foreign key is not set".to_string()))?,
                &from_base64(ciphertext)?,
            )?,
            KeyKind::Session => {
                let cipher = self
                    .session
                    .cipher()
                    .ok_or_else(|| KeyError::Decryption("session key is not complete".to_string()))?;
                return cipher.decrypt_hex(ciphertext);
            }
        };

        String::from_utf8(plaintext)
            .map_err(|_| KeyError::Decryption("plaintext is not valid UTF-8".to_string()))
    }

    /// Appends a peer segment; `true` once the session key is complete.
    pub fn set_session_segment(&mut self, segment: &str) -> Result<bool, KeyError> {
        self.session.push_segment(segment)
    }

    /// Generates and appends this side's segment, returning it for sending.
    pub fn generate_session_segment(&mut self) -> Result<String, KeyError> {
        self.session.generate_segment()
    }

    /// Whether the session key is complete.
    pub fn is_session_ready(&self) -> bool {
        self.session.is_complete()
    }

    /// Accumulated session key hex.
    pub fn session_key_hex(&self) -> &str {
        self.session.as_hex()
    }

    /// Moves the completed session cipher out of the store.
    pub fn take_session_cipher(&mut self) -> Option<SessionCipher> {
        self.session.take_cipher()
    }

    fn require_foreign(&self) -> Result<&RsaPublicKey, KeyError> {
        self.foreign
            .as_ref()
            .ok_or_else(|| KeyError::Crypto("foreign key is not set".to_string()))
    }

    fn require_session(&self) -> Result<&SessionCipher, KeyError> {
        self.session
            .cipher()
            .ok_or_else(|| KeyError::Crypto("session key is not complete".to_string()))
    }
}

/// Reads a foreign key: the whole file as PEM, or the `profile` entry of a
/// JSON map of profile names to PEM.
pub fn load_foreign_key(path: &Path, profile: Option<&str>) -> Result<RsaPublicKey, KeyError> {
    let foreign_err = |e: &dyn std::fmt::Display| KeyError::ForeignKey(format!("{}: {}", path.display(), e));

    let pem = match profile {
        Some(name) => {
            let profiles = ForeignKeyProfiles::load(path).map_err(|e| foreign_err(&e))?;
            profiles
                .get(name)
                .map(str::to_owned)
                .ok_or_else(|| KeyError::ForeignKey(format!("no key found for profile: {}", name)))?
        }
        None => fs::read_to_string(path).map_err(|e| foreign_err(&e))?,
    };

    decode_public_key_pem(&pem).map_err(|e| foreign_err(&e))
}

/// Writes a foreign key as a single PEM file, or upserts it into the
/// profile map at `path` when `profile` is given.
pub fn persist_foreign_key(key: &RsaPublicKey, path: &Path, profile: Option<&str>) -> Result<(), KeyError> {
    let pem = encode_public_key_pem(key)?;
    match profile {
        Some(name) => {
            let mut profiles = ForeignKeyProfiles::load_or_default(path)
                .map_err(|e| KeyError::ForeignKey(format!("{}: {}", path.display(), e)))?;
            profiles.upsert(name, pem);
            profiles
                .save(path)
                .map_err(|e| KeyError::ForeignKey(format!("{}: {}", path.display(), e)))
        }
        None => {
            fs::write(path, pem)?;
            Ok(())
        }
    }
}
