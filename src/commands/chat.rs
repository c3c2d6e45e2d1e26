//! Chat command for encrypted one-to-one messaging.
//!
//! Both peers run `start-chat` pointing at each other. Whoever starts
//! second connects to the one already waiting; there is no server.
//!
//! Lines typed on stdin are sent as `{"text": "..."}`. Empty lines are
//! skipped. End of input closes the chat.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Args;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::oneshot;

use peerchat::chat::{open, parse_peer, ChatConfig, ChatMessage, Settings};
use peerchat::crypto::{fingerprint, KeyPaths, KeyStore};

use super::{coded, storage_dir, CommandExecutor};

/// Start a chat with another peer.
#[derive(Args, Debug)]
pub struct ChatCommand {
    /// Peer address as HOST or HOST:PORT (default port 4567)
    pub address: String,

    /// Local port to listen on and connect from (default 4567)
    #[arg(long)]
    pub port: Option<u16>,

    /// Your private key (PEM)
    #[arg(long = "priv")]
    pub private: Option<PathBuf>,

    /// Your public key (PEM)
    #[arg(long = "pub")]
    pub public: Option<PathBuf>,

    /// Your peer's public key (PEM, or a profile map with --profile)
    #[arg(long)]
    pub fpub: Option<PathBuf>,

    /// Pick the peer's key from the profile map
    #[arg(long)]
    pub profile: Option<String>,

    /// Save the peer's public key here once the session is up
    #[arg(long)]
    pub save_fpub: Option<PathBuf>,

    /// Use a throwaway key pair for this chat only
    #[arg(long, conflicts_with_all = ["private", "public"])]
    pub temp_keys: bool,

    /// Storage directory (default: ~/.peerchat)
    #[arg(long)]
    pub dir: Option<PathBuf>,
}

impl CommandExecutor for ChatCommand {
    fn execute(&self) -> Result<()> {
        let dir = storage_dir(self.dir.as_ref())?;
        let settings = Settings::load(&dir).map_err(coded)?;
        let config = self.build_config(dir, &settings)?;
        config.validate().map_err(coded)?;

        if config.temporary_keys {
            println!("Generating temporary key pair...");
        }
        let keys = config.load_keys().map_err(coded)?;

        let rt = tokio::runtime::Runtime::new().context("Failed to create tokio runtime")?;
        let result = rt.block_on(run_chat(&config, &keys));
        // The stdin reader may still be blocked on a read.
        rt.shutdown_background();
        result
    }
}

impl ChatCommand {
    fn build_config(&self, dir: PathBuf, settings: &Settings) -> Result<ChatConfig> {
        let (host, remote_port) = parse_peer(&self.address, settings.remote_port).map_err(coded)?;
        let paths = KeyPaths::in_dir(dir).with_overrides(self.private.clone(), self.public.clone(), None);

        let mut config = ChatConfig::new(host, paths)
            .with_ports(self.port.unwrap_or(settings.local_port), remote_port);
        if let Some(fpub) = &self.fpub {
            config = config.with_foreign_key(fpub.clone());
        }
        config.profile = self.profile.clone().or_else(|| settings.profile.clone());
        config.temporary_keys = self.temp_keys;
        config.save_foreign_key = self.save_fpub.clone();

        Ok(config)
    }
}

async fn run_chat(config: &ChatConfig, keys: &KeyStore) -> Result<()> {
    println!(
        "Adding {}:{} to chat (local port {})",
        config.remote_address, config.remote_port, config.local_port
    );

    let (closed_tx, mut closed_rx) = oneshot::channel::<()>();
    let on_message = |message: Value| print_incoming(&message);
    let on_close = move || {
        let _ = closed_tx.send(());
    };

    let mut channel = open(config, keys, Some(on_message), on_close)
        .await
        .map_err(coded)?;

    println!("Secure session established. Type a message and press Enter.");
    if channel.learned_peer_key() {
        println!("Peer key fingerprint: {}", fingerprint(channel.peer_key())?);
    }

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            _ = &mut closed_rx => {
                println!("Peer disconnected...\nGoodbye.");
                return Ok(());
            }
            line = lines.next_line() => {
                match line.context("Failed to read from stdin")? {
                    Some(line) if line.trim().is_empty() => continue,
                    Some(line) => channel
                        .send(&ChatMessage::new(line))
                        .await
                        .map_err(coded)?,
                    None => {
                        let _ = channel.close().await;
                        return Ok(());
                    }
                }
            }
        }
    }
}

fn print_incoming(message: &Value) {
    match message.get("text").and_then(Value::as_str) {
        Some(text) => println!("\nMessage from peer: {}", text),
        None => println!("\nMessage from peer: {}", message),
    }
}
