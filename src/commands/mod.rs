//! Command module - Strategy pattern for CLI commands.
//!
//! Each command is a separate module implementing the `CommandExecutor` trait.

mod chat;
mod fingerprint;
mod import;
mod keygen;

pub use chat::ChatCommand;
pub use fingerprint::FingerprintCommand;
pub use import::ImportCommand;
pub use keygen::KeygenCommand;

use std::path::PathBuf;

use anyhow::{anyhow, Result};

use peerchat::chat::ChatError;
use peerchat::crypto::default_config_dir;

/// Trait for command execution - Strategy pattern.
///
/// Each command struct holds its parsed arguments and implements
/// this trait to define its execution logic.
pub trait CommandExecutor {
    /// Executes the command with its parsed arguments.
    fn execute(&self) -> Result<()>;
}

/// The storage directory: `--dir` if given, else `~/.peerchat`.
fn storage_dir(dir: Option<&PathBuf>) -> Result<PathBuf> {
    match dir {
        Some(dir) => Ok(dir.clone()),
        None => Ok(default_config_dir()?),
    }
}

/// Prefix the numeric code, if the error class has one.
fn coded(err: ChatError) -> anyhow::Error {
    match err.code() {
        Some(code) => anyhow!("[{}] {}", code, err),
        None => anyhow!(err),
    }
}
