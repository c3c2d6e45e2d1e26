//! Key generation command.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Args;

use peerchat::crypto::{ensure_directory, fingerprint, KeyPair, KeyPaths, KeyStore, DEFAULT_KEY_BITS};

use super::{storage_dir, CommandExecutor};

/// Generate an RSA identity key pair in the storage directory.
///
/// Chats started afterwards use this pair unless other keys are given.
/// An existing pair is replaced.
#[derive(Args, Debug)]
pub struct KeygenCommand {
    /// Storage directory (default: ~/.peerchat)
    #[arg(long)]
    pub dir: Option<PathBuf>,
}

impl CommandExecutor for KeygenCommand {
    fn execute(&self) -> Result<()> {
        let paths = KeyPaths::in_dir(storage_dir(self.dir.as_ref())?);
        ensure_directory(&paths.dir).context("Failed to prepare storage directory")?;

        if paths.private.exists() {
            println!("Replacing existing key pair in {}", paths.dir.display());
        }

        println!("Generating {}-bit RSA key pair...", DEFAULT_KEY_BITS);
        let keys = KeyStore::new(KeyPair::generate().context("Failed to generate key pair")?);
        keys.persist_key_pair(&paths).context("Failed to save key pair")?;

        println!("Key pair generated successfully:");
        println!("  Public key:  {}", paths.public.display());
        println!("  Private key: {}", paths.private.display());
        println!();
        println!("Fingerprint: {}", fingerprint(keys.identity().public_key())?);
        println!();
        println!("Share your public key with the people you chat with.");
        println!("Keep your private key secret and secure.");

        Ok(())
    }
}
