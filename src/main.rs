//! Peerchat - encrypted peer-to-peer chat
//!
//! A CLI tool for one-to-one chat over a direct TCP connection, with RSA
//! identities and an AES session key agreed per chat.

mod commands;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use commands::{ChatCommand, CommandExecutor, FingerprintCommand, ImportCommand, KeygenCommand};

/// Peerchat - encrypted peer-to-peer chat
///
/// Both peers run `start-chat` with each other's address. Keys live in
/// ~/.peerchat unless given on the command line.
#[derive(Parser)]
#[command(name = "peerchat")]
#[command(version)]
#[command(about = "Encrypted peer-to-peer chat over TCP")]
#[command(long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start a chat with another peer
    StartChat(ChatCommand),

    /// Generate an RSA key pair in the storage directory
    KeyGen(KeygenCommand),

    /// Import PEM keys into the storage directory
    Import(ImportCommand),

    /// Show the SHA-256 fingerprint of a key
    Fingerprint(FingerprintCommand),
}

impl Commands {
    fn executor(&self) -> &dyn CommandExecutor {
        match self {
            Commands::StartChat(cmd) => cmd,
            Commands::KeyGen(cmd) => cmd,
            Commands::Import(cmd) => cmd,
            Commands::Fingerprint(cmd) => cmd,
        }
    }
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    cli.command.executor().execute()
}
