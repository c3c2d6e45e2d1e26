//! Fingerprint command - display key fingerprints for verification.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::Args;
use rsa::RsaPublicKey;

use peerchat::crypto::{fingerprint, load_private_key, load_public_key, KeyPaths};

use super::{storage_dir, CommandExecutor};

/// Display a key's fingerprint for out-of-band verification.
///
/// Compare it with your peer over another channel (phone call, in person)
/// before trusting a key that was exchanged during a chat.
///
/// Accepts a public or private PEM file; defaults to your own public key.
#[derive(Args, Debug)]
pub struct FingerprintCommand {
    /// Path to the key file
    pub key_path: Option<PathBuf>,

    /// Storage directory (default: ~/.peerchat)
    #[arg(long)]
    pub dir: Option<PathBuf>,
}

impl CommandExecutor for FingerprintCommand {
    fn execute(&self) -> Result<()> {
        let path = match &self.key_path {
            Some(path) => path.clone(),
            None => KeyPaths::in_dir(storage_dir(self.dir.as_ref())?).public,
        };

        let key = load_any_public(&path)
            .with_context(|| format!("Failed to load key from {}", path.display()))?;

        println!("Key: {}", path.display());
        println!("SHA-256: {}", fingerprint(&key)?);
        Ok(())
    }
}

/// Public key from a public PEM, or derived from a private PEM.
fn load_any_public(path: &Path) -> Result<RsaPublicKey> {
    match load_public_key(path) {
        Ok(key) => Ok(key),
        Err(_) => Ok(RsaPublicKey::from(&load_private_key(path)?)),
    }
}
