//! Chat configuration.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use tracing::{debug, warn};

use crate::chat::error::ChatError;
use crate::crypto::{KeyPaths, KeyStore};

/// Port used for both ends when none is given.
pub const DEFAULT_PORT: u16 = 4567;

/// How long a connector waits for the acceptor's first packet.
pub const OPENING_TIMEOUT: Duration = Duration::from_secs(5);

/// Name of the optional settings file inside the storage directory.
pub const SETTINGS_FILE: &str = "config.toml";

/// Everything needed to open one chat channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatConfig {
    /// Host name or IP literal of the peer.
    pub remote_address: String,

    /// Port the peer listens on and dials from.
    pub remote_port: u16,

    /// Port we listen on and dial from.
    pub local_port: u16,

    /// Own key files, the foreign key store and their directory.
    pub key_paths: KeyPaths,

    /// `key_paths.foreign` was given explicitly rather than defaulted.
    pub foreign_key_explicit: bool,

    /// Select the foreign key from a JSON profile map.
    pub profile: Option<String>,

    /// Generate a throwaway identity instead of loading one.
    pub temporary_keys: bool,

    /// Where to persist the peer's key after a successful handshake.
    pub save_foreign_key: Option<PathBuf>,

    /// Silence from the peer, right after connecting, that ends the wait
    /// for its opening packet.
    pub opening_timeout: Duration,
}

impl ChatConfig {
    /// Configuration with default ports and no optional behavior.
    pub fn new(remote_address: impl Into<String>, key_paths: KeyPaths) -> Self {
        Self {
            remote_address: remote_address.into(),
            remote_port: DEFAULT_PORT,
            local_port: DEFAULT_PORT,
            key_paths,
            foreign_key_explicit: false,
            profile: None,
            temporary_keys: false,
            save_foreign_key: None,
            opening_timeout: OPENING_TIMEOUT,
        }
    }

    /// Set both ports.
    pub fn with_ports(mut self, local_port: u16, remote_port: u16) -> Self {
        self.local_port = local_port;
        self.remote_port = remote_port;
        self
    }

    /// Use an explicit foreign key file.
    pub fn with_foreign_key(mut self, path: impl Into<PathBuf>) -> Self {
        self.key_paths.foreign = path.into();
        self.foreign_key_explicit = true;
        self
    }

    /// Reject option combinations that cannot work.
    pub fn validate(&self) -> Result<(), ChatError> {
        if self.remote_address.trim().is_empty() {
            return Err(ChatError::Config("a remote address is required".to_string()));
        }
        if self.temporary_keys && self.foreign_key_explicit {
            return Err(ChatError::Config(
                "temporary keys cannot be combined with an explicit foreign key".to_string(),
            ));
        }
        Ok(())
    }

    /// Prepare the storage directory and load the key material for this run.
    ///
    /// An explicit foreign key path or a profile must load. The default
    /// foreign key file is optional: without it the peer's key is learned
    /// during the handshake. RSA generation with `temporary_keys` blocks.
    pub fn load_keys(&self) -> Result<KeyStore, ChatError> {
        self.validate()?;

        let mut keys = KeyStore::load_or_generate(&self.key_paths, self.temporary_keys)?;
        let foreign = &self.key_paths.foreign;

        if self.foreign_key_explicit || self.profile.is_some() {
            keys.load_foreign_key(foreign, self.profile.as_deref())?;
        } else if foreign.exists() {
            if let Err(e) = keys.load_foreign_key(foreign, None) {
                warn!(path = %foreign.display(), error = %e, "ignoring unreadable default foreign key");
            }
        } else {
            debug!(path = %foreign.display(), "no foreign key configured, will request it");
        }

        Ok(keys)
    }
}

/// Defaults read from `config.toml` in the storage directory.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct Settings {
    /// Local port when `--port` is not given.
    pub local_port: u16,

    /// Remote port when the address has none.
    pub remote_port: u16,

    /// Foreign key profile when `--profile` is not given.
    pub profile: Option<String>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            local_port: DEFAULT_PORT,
            remote_port: DEFAULT_PORT,
            profile: None,
        }
    }
}

impl Settings {
    /// Load settings from `dir/config.toml`; a missing file means defaults.
    pub fn load(dir: &Path) -> Result<Self, ChatError> {
        let path = dir.join(SETTINGS_FILE);
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = fs::read_to_string(&path)?;
        toml::from_str(&content)
            .map_err(|e| ChatError::Config(format!("{}: {}", path.display(), e)))
    }
}

/// Split `HOST[:PORT]`, bracketed IPv6 included.
pub fn parse_peer(input: &str, default_port: u16) -> Result<(String, u16), ChatError> {
    let input = input.trim();
    let bad_port = |p: &str| ChatError::Config(format!("invalid port '{}' in '{}'", p, input));

    let (host, port) = if let Some(rest) = input.strip_prefix('[') {
        let (host, after) = rest
            .split_once(']')
            .ok_or_else(|| ChatError::Config(format!("unterminated '[' in '{}'", input)))?;
        match after.strip_prefix(':') {
            Some(port) => (host, Some(port)),
            None if after.is_empty() => (host, None),
            None => return Err(ChatError::Config(format!("unexpected '{}' in '{}'", after, input))),
        }
    } else if input.matches(':').count() > 1 {
        // Bare IPv6 literal
        (input, None)
    } else {
        match input.split_once(':') {
            Some((host, port)) => (host, Some(port)),
            None => (input, None),
        }
    };

    if host.is_empty() {
        return Err(ChatError::Config("a remote address is required".to_string()));
    }

    let port = match port {
        Some(p) => p.parse::<u16>().map_err(|_| bad_port(p))?,
        None => default_port,
    };

    Ok((host.to_string(), port))
}
