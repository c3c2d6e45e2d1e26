//! Foreign key profiles for peerchat.
//!
//! Peers' public keys can be kept in one file as a JSON object mapping a
//! profile name to a PEM string, e.g. `{"alice": "-----BEGIN RSA PUBLIC KEY-----..."}`.
//! The default location is `~/.peerchat/foreign_keys`.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use thiserror::Error;

/// Errors that can occur when managing foreign key profiles.
#[derive(Error, Debug)]
pub enum ContactsError {
    #[error("file holds a single PEM key, not a profile map")]
    SinglePemKey,

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),
}

/// Profile name to PEM public key.
#[derive(Serialize, Deserialize, Debug, Default, Clone, PartialEq, Eq)]
#[serde(transparent)]
pub struct ForeignKeyProfiles {
    profiles: BTreeMap<String, String>,
}

impl ForeignKeyProfiles {
    /// Load a profile map from a JSON file.
    pub fn load(path: &Path) -> Result<Self, ContactsError> {
        let content = fs::read_to_string(path)?;
        Self::from_json(&content)
    }

    /// Load a profile map, or start an empty one if the file doesn't exist.
    pub fn load_or_default(path: &Path) -> Result<Self, ContactsError> {
        if !path.exists() {
            return Ok(Self::default());
        }
        Self::load(path)
    }

    /// Parse a profile map from JSON text.
    pub fn from_json(content: &str) -> Result<Self, ContactsError> {
        if content.trim_start().starts_with("-----BEGIN") {
            return Err(ContactsError::SinglePemKey);
        }
        Ok(serde_json::from_str(content)?)
    }

    /// Save the profile map as pretty JSON.
    pub fn save(&self, path: &Path) -> Result<(), ContactsError> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        let content = serde_json::to_string_pretty(self)?;
        fs::write(path, content)?;
        Ok(())
    }

    /// Get the PEM stored for a profile.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.profiles.get(name).map(String::as_str)
    }

    /// Insert or replace a profile's key.
    pub fn upsert(&mut self, name: &str, pem: String) {
        self.profiles.insert(name.to_string(), pem);
    }
}
