//! Import command - copy existing keys into the storage directory.

use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::Args;
use rsa::RsaPublicKey;

use peerchat::contacts::{ContactsError, ForeignKeyProfiles};
use peerchat::crypto::{
    ensure_directory, fingerprint, load_private_key, load_public_key, persist_foreign_key, KeyPair,
    KeyPaths,
};

use super::{storage_dir, CommandExecutor};

/// Import PEM keys so later chats use them by default.
///
/// Every key is parsed before anything is written. A private key imported
/// without `--pub` gets its public half derived.
#[derive(Args, Debug)]
pub struct ImportCommand {
    /// Your private key (PEM)
    #[arg(long = "priv")]
    pub private: Option<PathBuf>,

    /// Your public key (PEM)
    #[arg(long = "pub")]
    pub public: Option<PathBuf>,

    /// Your peer's public key (PEM)
    #[arg(long)]
    pub fpub: Option<PathBuf>,

    /// Store the peer's key under this profile name
    #[arg(long, requires = "fpub")]
    pub profile: Option<String>,

    /// Storage directory (default: ~/.peerchat)
    #[arg(long)]
    pub dir: Option<PathBuf>,
}

impl CommandExecutor for ImportCommand {
    fn execute(&self) -> Result<()> {
        if self.private.is_none() && self.public.is_none() && self.fpub.is_none() {
            bail!("Nothing to import: pass --priv, --pub or --fpub");
        }
        if self.public.is_some() && self.private.is_none() {
            bail!("--pub must be imported together with --priv");
        }

        let paths = KeyPaths::in_dir(storage_dir(self.dir.as_ref())?);

        let keypair = match &self.private {
            Some(private_path) => {
                let private = load_private_key(private_path)
                    .with_context(|| format!("Invalid private key: {}", private_path.display()))?;
                let keypair = match &self.public {
                    Some(public_path) => {
                        let public = load_public_key(public_path)
                            .with_context(|| format!("Invalid public key: {}", public_path.display()))?;
                        if RsaPublicKey::from(&private) != public {
                            bail!("The public key does not belong to the private key");
                        }
                        KeyPair::from_parts(private, public)
                    }
                    None => KeyPair::from_private(private),
                };
                Some(keypair)
            }
            None => None,
        };

        let foreign = match &self.fpub {
            Some(path) => Some(
                load_public_key(path).with_context(|| format!("Invalid foreign key: {}", path.display()))?,
            ),
            None => None,
        };

        if self.profile.is_some() {
            if let Err(ContactsError::SinglePemKey) = ForeignKeyProfiles::load_or_default(&paths.foreign) {
                bail!(
                    "{} holds a single foreign key, not a profile map; import without --profile or move it aside",
                    paths.foreign.display()
                );
            }
        }

        ensure_directory(&paths.dir).context("Failed to prepare storage directory")?;

        if let Some(keypair) = keypair {
            keypair
                .save_to_files(&paths.private, &paths.public)
                .context("Failed to save key pair")?;
            println!("Imported key pair:");
            println!("  Public key:  {}", paths.public.display());
            println!("  Private key: {}", paths.private.display());
            println!("  Fingerprint: {}", fingerprint(keypair.public_key())?);
        }

        if let Some(foreign) = foreign {
            persist_foreign_key(&foreign, &paths.foreign, self.profile.as_deref())
                .context("Failed to save foreign key")?;
            match &self.profile {
                Some(name) => println!("Imported foreign key as profile '{}':", name),
                None => println!("Imported foreign key:"),
            }
            println!("  Path:        {}", paths.foreign.display());
            println!("  Fingerprint: {}", fingerprint(&foreign)?);
        }

        Ok(())
    }
}
