//! Session key assembly and the AES-256-CTR session cipher.
//!
//! The session key is built from two 16-byte segments, one contributed by
//! each peer, exchanged as 32 hex characters each and concatenated in
//! arrival order. Once 64 hex characters are present the key is fixed and
//! the cipher is derived.
//!
//! The cipher uses an all-zero nonce and restarts its keystream for every
//! message. Every message of a session is therefore XORed with the same
//! keystream, which leaks the XOR of any two plaintexts. This is the
//! established wire behaviour and is kept for compatibility.

use ctr::cipher::{generic_array::GenericArray, KeyIvInit, StreamCipher};
use rand::rngs::OsRng;
use rand::RngCore;
use zeroize::Zeroize;

use super::keys::KeyError;

/// Raw bytes contributed by one peer.
pub const SEGMENT_BYTES: usize = 16;

/// Hex length of one segment.
pub const SEGMENT_HEX_LEN: usize = SEGMENT_BYTES * 2;

/// Hex length of the complete AES-256 key.
pub const SESSION_KEY_HEX_LEN: usize = SEGMENT_HEX_LEN * 2;

/// Counter-mode nonce shared by every message.
const ZERO_NONCE: [u8; 16] = [0u8; 16];

type Aes256Ctr = ctr::Ctr128BE<aes::Aes256>;

/// Append-only accumulator for the two session key segments.
///
/// Private to one connection attempt; a reconnect starts from an empty one.
#[derive(Default)]
pub struct SessionKey {
    hex: String,
    cipher: Option<SessionCipher>,
}

impl std::fmt::Debug for SessionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionKey")
            .field("segments", &(self.hex.len() / SEGMENT_HEX_LEN))
            .field("complete", &self.is_complete())
            .finish()
    }
}

impl SessionKey {
    /// Create an empty accumulator.
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a segment received from the peer.
    ///
    /// Returns `true` exactly when this segment completes the key; the
    /// cipher is derived at that moment and never again.
    pub fn push_segment(&mut self, segment: &str) -> Result<bool, KeyError> {
        if segment.len() != SEGMENT_HEX_LEN || !segment.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(KeyError::Crypto(format!(
                "session segment must be {} hex characters",
                SEGMENT_HEX_LEN
            )));
        }
        if self.is_complete() {
            return Err(KeyError::Crypto("session key is already complete".to_string()));
        }

        self.hex.push_str(segment);
        if self.hex.len() < SESSION_KEY_HEX_LEN {
            return Ok(false);
        }

        self.cipher = Some(SessionCipher::from_hex(&self.hex)?);
        Ok(true)
    }

    /// Generates this side's segment, appends it and returns it for sending.
    pub fn generate_segment(&mut self) -> Result<String, KeyError> {
        let mut bytes = [0u8; SEGMENT_BYTES];
        OsRng
            .try_fill_bytes(&mut bytes)
            .map_err(|e| KeyError::Crypto(format!("random source failed: {}", e)))?;
        let segment = hex::encode(bytes);
        bytes.zeroize();

        self.push_segment(&segment)?;
        Ok(segment)
    }

    /// Whether both segments are present.
    pub fn is_complete(&self) -> bool {
        self.cipher.is_some()
    }

    /// The accumulated hex key material so far.
    pub fn as_hex(&self) -> &str {
        &self.hex
    }

    /// The derived cipher, once the key is complete.
    pub fn cipher(&self) -> Option<&SessionCipher> {
        self.cipher.as_ref()
    }

    /// Moves the derived cipher out of the accumulator.
    pub fn take_cipher(&mut self) -> Option<SessionCipher> {
        self.cipher.take()
    }
}

impl Drop for SessionKey {
    fn drop(&mut self) {
        self.hex.zeroize();
    }
}

/// AES-256-CTR with a zero nonce, keyed by a completed session key.
#[derive(Clone)]
pub struct SessionCipher {
    key: [u8; 32],
}

impl std::fmt::Debug for SessionCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionCipher").field("key", &"[REDACTED]").finish()
    }
}

impl SessionCipher {
    /// Create a cipher from raw key bytes.
    pub fn new(key: [u8; 32]) -> Self {
        Self { key }
    }

    /// Create a cipher from the 64-character hex session key.
    pub fn from_hex(key_hex: &str) -> Result<Self, KeyError> {
        let mut bytes = hex::decode(key_hex)
            .map_err(|e| KeyError::Crypto(format!("invalid session key: {}", e)))?;
        let key: Result<[u8; 32], _> = bytes.as_slice().try_into();
        bytes.zeroize();
        key.map(Self::new).map_err(|_| {
            KeyError::Crypto(format!(
                "session key must be {} hex characters",
                SESSION_KEY_HEX_LEN
            ))
        })
    }

    fn apply(&self, data: &mut [u8]) {
        let mut cipher = Aes256Ctr::new(
            GenericArray::from_slice(&self.key),
            GenericArray::from_slice(&ZERO_NONCE),
        );
        cipher.apply_keystream(data);
    }

    /// Encrypts one message from the start of the keystream.
    pub fn encrypt(&self, plaintext: &[u8]) -> Vec<u8> {
        let mut buffer = plaintext.to_vec();
        self.apply(&mut buffer);
        buffer
    }

    /// Decrypts one message from the start of the keystream.
    pub fn decrypt(&self, ciphertext: &[u8]) -> Vec<u8> {
        self.encrypt(ciphertext)
    }

    /// Encrypts text and returns lowercase hex, the session wire form.
    pub fn encrypt_to_hex(&self, plaintext: &str) -> String {
        hex::encode(self.encrypt(plaintext.as_bytes()))
    }

    /// Decrypts the hex wire form back to text.
    pub fn decrypt_hex(&self, ciphertext: &str) -> Result<String, KeyError> {
        let bytes = hex::decode(ciphertext.trim())
            .map_err(|e| KeyError::Decryption(format!("invalid ciphertext: {}", e)))?;
        String::from_utf8(self.decrypt(&bytes))
            .map_err(|_| KeyError::Decryption("plaintext is not valid UTF-8".to_string()))
    }
}

impl Drop for SessionCipher {
    fn drop(&mut self) {
        self.key.zeroize();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SEG_A: &str = "00112233445566778899aabbccddeeff";
    const SEG_B: &str = "ffeeddccbbaa99887766554433221100";

    #[test]
    fn test_two_segments_complete_the_key() {
        let mut key = SessionKey::new();
        assert!(!key.push_segment(SEG_A).unwrap());
        assert!(!key.is_complete());
        assert!(key.push_segment(SEG_B).unwrap());
        assert!(key.is_complete());
        assert_eq!(key.as_hex(), format!("{}{}", SEG_A, SEG_B));
    }

    #[test]
    fn test_arrival_order_decides_key() {
        let mut ab = SessionKey::new();
        ab.push_segment(SEG_A).unwrap();
        ab.push_segment(SEG_B).unwrap();

        let mut ba = SessionKey::new();
        ba.push_segment(SEG_B).unwrap();
        ba.push_segment(SEG_A).unwrap();

        assert_eq!(ab.as_hex().len(), SESSION_KEY_HEX_LEN);
        assert_eq!(ba.as_hex(), format!("{}{}", SEG_B, SEG_A));
        assert_ne!(ab.as_hex(), ba.as_hex());
    }

    #[test]
    fn test_third_segment_rejected() {
        let mut key = SessionKey::new();
        key.push_segment(SEG_A).unwrap();
        key.push_segment(SEG_B).unwrap();
        assert!(key.push_segment(SEG_A).is_err());
        assert_eq!(key.as_hex().len(), SESSION_KEY_HEX_LEN);
    }

    #[test]
    fn test_malformed_segment_rejected() {
        let mut key = SessionKey::new();
        assert!(key.push_segment("abc").is_err());
        assert!(key.push_segment(&"zz".repeat(16)).is_err());
        assert!(key.as_hex().is_empty());
    }

    #[test]
    fn test_generated_segment_is_appended() {
        let mut key = SessionKey::new();
        let segment = key.generate_segment().unwrap();
        assert_eq!(segment.len(), SEGMENT_HEX_LEN);
        assert_eq!(key.as_hex(), segment);

        assert!(key.push_segment(SEG_B).unwrap());
        assert_eq!(key.as_hex(), format!("{}{}", segment, SEG_B));
    }

    #[test]
    fn test_cipher_roundtrip_utf8() {
        let cipher = SessionCipher::from_hex(&format!("{}{}", SEG_A, SEG_B)).unwrap();
        for text in ["", "hello", "{\"text\":\"héllo wörld ✓\"}", "多字节"] {
            let encrypted = cipher.encrypt_to_hex(text);
            assert_eq!(cipher.decrypt_hex(&encrypted).unwrap(), text);
        }
    }

    #[test]
    fn test_keystream_restarts_per_message() {
        let cipher = SessionCipher::new([7u8; 32]);
        assert_eq!(cipher.encrypt(b"same"), cipher.encrypt(b"same"));
        assert_ne!(cipher.encrypt(b"same"), b"same".to_vec());
    }

    #[test]
    fn test_both_sides_derive_same_cipher() {
        let mut local = SessionKey::new();
        let mine = local.generate_segment().unwrap();

        let mut remote = SessionKey::new();
        remote.push_segment(&mine).unwrap();
        let theirs = remote.generate_segment().unwrap();
        local.push_segment(&theirs).unwrap();

        assert_eq!(local.as_hex(), remote.as_hex());
        let sealed = local.cipher().unwrap().encrypt_to_hex("ping");
        assert_eq!(remote.cipher().unwrap().decrypt_hex(&sealed).unwrap(), "ping");
    }

    #[test]
    fn test_decrypt_rejects_non_hex() {
        let cipher = SessionCipher::new([1u8; 32]);
        assert!(matches!(
            cipher.decrypt_hex("not hex"),
            Err(KeyError::Decryption(_))
        ));
    }
}
