//! Key generation and management for peerchat.
//!
//! This module handles RSA key pair generation, PEM serialization and the
//! layout of the key storage directory (`~/.peerchat`).

use std::fs;
use std::path::{Path, PathBuf};

use rand::rngs::OsRng;
use rsa::pkcs1::{
    DecodeRsaPrivateKey, DecodeRsaPublicKey, EncodeRsaPrivateKey, EncodeRsaPublicKey, LineEnding,
};
use rsa::pkcs8::{DecodePrivateKey, DecodePublicKey};
use rsa::{RsaPrivateKey, RsaPublicKey};
use sha2::{Digest, Sha256};
use thiserror::Error;

/// Modulus size for generated identity keys.
pub const DEFAULT_KEY_BITS: usize = 2048;

/// Name of the storage directory under the home directory.
pub const CONFIG_DIR_NAME: &str = ".peerchat";

/// File names inside the storage directory.
pub const PRIVATE_KEY_FILE: &str = "priv_key";
pub const PUBLIC_KEY_FILE: &str = "pub_key";
pub const FOREIGN_KEY_FILE: &str = "foreign_keys";

/// Errors that can occur during key operations.
#[derive(Error, Debug)]
pub enum KeyError {
    /// The storage directory could not be created or is not a directory.
    #[error("Directory error: {0}")]
    Directory(String),

    /// Own private/public key could not be read or parsed.
    #[error("Local key error: {0}")]
    LocalKey(String),

    /// The peer's public key could not be read, parsed or found.
    #[error("Foreign key error: {0}")]
    ForeignKey(String),

    /// Key generation, encryption or a missing key for an operation.
    #[error("Crypto error: {0}")]
    Crypto(String),

    /// Ciphertext was malformed or did not decrypt under the key.
    #[error("Decryption error: {0}")]
    Decryption(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

/// An RSA identity key pair.
///
/// The public half is kept alongside the private key instead of being derived
/// from it, so a pair loaded from two files keeps whatever public key the
/// user supplied.
#[derive(Clone)]
pub struct KeyPair {
    private: RsaPrivateKey,
    public: RsaPublicKey,
}

impl std::fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Don't expose private key in debug output
        f.debug_struct("KeyPair")
            .field(
                "public",
                &fingerprint(&self.public).unwrap_or_else(|_| "<unencodable>".to_string()),
            )
            .field("private", &"[REDACTED]")
            .finish()
    }
}

impl KeyPair {
    /// Generates a new 2048-bit key pair.
    pub fn generate() -> Result<Self, KeyError> {
        Self::generate_with_bits(DEFAULT_KEY_BITS)
    }

    /// Generates a new key pair with the given modulus size.
    pub fn generate_with_bits(bits: usize) -> Result<Self, KeyError> {
        let private = RsaPrivateKey::new(&mut OsRng, bits)
            .map_err(|e| KeyError::Crypto(format!("key generation failed: {}", e)))?;
        Ok(Self::from_private(private))
    }

    /// Builds a key pair whose public half is derived from the private key.
    pub fn from_private(private: RsaPrivateKey) -> Self {
        let public = RsaPublicKey::from(&private);
        Self { private, public }
    }

    /// Builds a key pair from separately supplied halves.
    ///
    /// The halves are not checked against each other; a mismatch surfaces
    /// during the identity challenge of the handshake.
    pub fn from_parts(private: RsaPrivateKey, public: RsaPublicKey) -> Self {
        Self { private, public }
    }

    /// Returns the public key.
    pub fn public_key(&self) -> &RsaPublicKey {
        &self.public
    }

    /// Returns the private key.
    pub fn private_key(&self) -> &RsaPrivateKey {
        &self.private
    }

    /// Returns the public key as PKCS#1 PEM, the form sent to peers.
    pub fn public_key_pem(&self) -> Result<String, KeyError> {
        encode_public_key_pem(&self.public)
    }

    /// Saves the key pair as PEM files.
    pub fn save_to_files(&self, private_path: &Path, public_path: &Path) -> Result<(), KeyError> {
        let private_pem = self
            .private
            .to_pkcs1_pem(LineEnding::LF)
            .map_err(|e| KeyError::Crypto(format!("failed to encode private key: {}", e)))?;
        let public_pem = self.public_key_pem()?;

        fs::write(private_path, private_pem.as_bytes())?;
        fs::write(public_path, public_pem)?;

        // Set restrictive permissions on private key (Unix only)
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mut perms = fs::metadata(private_path)?.permissions();
            perms.set_mode(0o600);
            fs::set_permissions(private_path, perms)?;
        }

        Ok(())
    }

    /// Loads a key pair from PEM files.
    pub fn load_from_files(private_path: &Path, public_path: &Path) -> Result<Self, KeyError> {
        let private = load_private_key(private_path).map_err(|e| {
            KeyError::LocalKey(format!("{}: {}", private_path.display(), e))
        })?;
        let public = load_public_key(public_path).map_err(|e| {
            KeyError::LocalKey(format!("{}: {}", public_path.display(), e))
        })?;
        Ok(Self::from_parts(private, public))
    }
}

/// Locations of the key files used by one run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyPaths {
    /// Storage directory; created on first use.
    pub dir: PathBuf,
    /// Own private key (PEM).
    pub private: PathBuf,
    /// Own public key (PEM).
    pub public: PathBuf,
    /// Foreign key store: a single PEM or a JSON map of profile name to PEM.
    pub foreign: PathBuf,
}

impl KeyPaths {
    /// Default file names inside the given directory.
    pub fn in_dir(dir: impl Into<PathBuf>) -> Self {
        let dir = dir.into();
        Self {
            private: dir.join(PRIVATE_KEY_FILE),
            public: dir.join(PUBLIC_KEY_FILE),
            foreign: dir.join(FOREIGN_KEY_FILE),
            dir,
        }
    }

    /// Default file names inside `~/.peerchat`.
    pub fn default_location() -> Result<Self, KeyError> {
        Ok(Self::in_dir(default_config_dir()?))
    }

    /// Replace the defaults with any explicitly given paths.
    pub fn with_overrides(
        mut self,
        private: Option<PathBuf>,
        public: Option<PathBuf>,
        foreign: Option<PathBuf>,
    ) -> Self {
        if let Some(path) = private {
            self.private = path;
        }
        if let Some(path) = public {
            self.public = path;
        }
        if let Some(path) = foreign {
            self.foreign = path;
        }
        self
    }
}

/// Get the peerchat storage directory (`~/.peerchat`).
pub fn default_config_dir() -> Result<PathBuf, KeyError> {
    dirs::home_dir()
        .map(|home| home.join(CONFIG_DIR_NAME))
        .ok_or_else(|| KeyError::Directory("unable to determine home directory".to_string()))
}

/// Makes sure the storage directory exists.
///
/// A missing directory is created. An existing path that is not a directory
/// is an error and nothing is written.
pub fn ensure_directory(dir: &Path) -> Result<(), KeyError> {
    match fs::metadata(dir) {
        Ok(meta) if meta.is_dir() => Ok(()),
        Ok(_) => Err(KeyError::Directory(format!(
            "{} already exists and is not a directory",
            dir.display()
        ))),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => fs::create_dir_all(dir)
            .map_err(|e| KeyError::Directory(format!("failed to create {}: {}", dir.display(), e))),
        Err(e) => Err(KeyError::Directory(format!("{}: {}", dir.display(), e))),
    }
}

/// Encodes a public key as PKCS#1 PEM.
pub fn encode_public_key_pem(key: &RsaPublicKey) -> Result<String, KeyError> {
    key.to_pkcs1_pem(LineEnding::LF)
        .map_err(|e| KeyError::Crypto(format!("failed to encode public key: {}", e)))
}

/// Decodes a public key from PEM (PKCS#1 `RSA PUBLIC KEY` or SPKI `PUBLIC KEY`).
pub fn decode_public_key_pem(pem: &str) -> Result<RsaPublicKey, KeyError> {
    let pem = pem.trim();
    RsaPublicKey::from_pkcs1_pem(pem)
        .or_else(|_| RsaPublicKey::from_public_key_pem(pem))
        .map_err(|e| KeyError::Crypto(format!("invalid public key PEM: {}", e)))
}

/// Decodes a private key from PEM (PKCS#1 `RSA PRIVATE KEY` or PKCS#8 `PRIVATE KEY`).
pub fn decode_private_key_pem(pem: &str) -> Result<RsaPrivateKey, KeyError> {
    let pem = pem.trim();
    RsaPrivateKey::from_pkcs1_pem(pem)
        .or_else(|_| RsaPrivateKey::from_pkcs8_pem(pem))
        .map_err(|e| KeyError::Crypto(format!("invalid private key PEM: {}", e)))
}

/// Loads a public key from a PEM file.
pub fn load_public_key(path: &Path) -> Result<RsaPublicKey, KeyError> {
    let content = fs::read_to_string(path)?;
    decode_public_key_pem(&content)
}

/// Loads a private key from a PEM file.
pub fn load_private_key(path: &Path) -> Result<RsaPrivateKey, KeyError> {
    let content = fs::read_to_string(path)?;
    decode_private_key_pem(&content)
}

/// SHA-256 over the PKCS#1 DER encoding, as colon-separated hex.
pub fn fingerprint(key: &RsaPublicKey) -> Result<String, KeyError> {
    let der = key
        .to_pkcs1_der()
        .map_err(|e| KeyError::Crypto(format!("failed to encode public key: {}", e)))?;
    let hash = Sha256::digest(der.as_bytes());
    Ok(hash
        .iter()
        .map(|b| format!("{:02x}", b))
        .collect::<Vec<_>>()
        .join(":"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::test_keys;
    use tempfile::TempDir;

    #[test]
    fn test_public_key_pem_roundtrip() {
        let keypair = test_keys::alice();
        let pem = keypair.public_key_pem().unwrap();
        assert!(pem.starts_with("-----BEGIN RSA PUBLIC KEY-----"));

        let decoded = decode_public_key_pem(&pem).unwrap();
        assert_eq!(&decoded, keypair.public_key());
    }

    #[test]
    fn test_save_and_load_files() {
        let temp = TempDir::new().unwrap();
        let private_path = temp.path().join("priv_key");
        let public_path = temp.path().join("pub_key");

        let keypair = test_keys::alice();
        keypair.save_to_files(&private_path, &public_path).unwrap();

        let loaded = KeyPair::load_from_files(&private_path, &public_path).unwrap();
        assert_eq!(loaded.public_key(), keypair.public_key());
        assert_eq!(loaded.private_key(), keypair.private_key());

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = fs::metadata(&private_path).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o600);
        }
    }

    #[test]
    fn test_load_missing_file_is_local_key_error() {
        let temp = TempDir::new().unwrap();
        let result = KeyPair::load_from_files(
            &temp.path().join("nope"),
            &temp.path().join("nope.pub"),
        );
        assert!(matches!(result, Err(KeyError::LocalKey(_))));
    }

    #[test]
    fn test_load_garbage_is_local_key_error() {
        let temp = TempDir::new().unwrap();
        let private_path = temp.path().join("priv_key");
        let public_path = temp.path().join("pub_key");
        fs::write(&private_path, "not a key").unwrap();
        fs::write(&public_path, "not a key either").unwrap();

        let result = KeyPair::load_from_files(&private_path, &public_path);
        assert!(matches!(result, Err(KeyError::LocalKey(_))));
    }

    #[test]
    fn test_ensure_directory_creates_fresh_path() {
        let temp = TempDir::new().unwrap();
        let dir = temp.path().join("nested").join(".peerchat");

        ensure_directory(&dir).unwrap();
        assert!(dir.is_dir());

        // Second call is a no-op
        ensure_directory(&dir).unwrap();
    }

    #[test]
    fn test_ensure_directory_rejects_regular_file() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join(".peerchat");
        fs::write(&path, "occupied").unwrap();

        let result = ensure_directory(&path);
        assert!(matches!(result, Err(KeyError::Directory(_))));

        // The file is untouched
        assert!(path.is_file());
        assert_eq!(fs::read_to_string(&path).unwrap(), "occupied");
    }

    #[test]
    fn test_key_paths_overrides() {
        let paths = KeyPaths::in_dir("/tmp/pc").with_overrides(
            Some(PathBuf::from("/keys/id_rsa")),
            None,
            Some(PathBuf::from("/keys/bob.pub")),
        );
        assert_eq!(paths.private, PathBuf::from("/keys/id_rsa"));
        assert_eq!(paths.public, PathBuf::from("/tmp/pc/pub_key"));
        assert_eq!(paths.foreign, PathBuf::from("/keys/bob.pub"));
    }

    #[test]
    fn test_fingerprint_is_stable() {
        let keypair = test_keys::alice();
        let a = fingerprint(keypair.public_key()).unwrap();
        let b = fingerprint(keypair.public_key()).unwrap();
        assert_eq!(a, b);
        assert_eq!(a.split(':').count(), 32);
        assert_ne!(a, fingerprint(test_keys::bob().public_key()).unwrap());
    }
}
