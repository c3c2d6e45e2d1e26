//! RSA operations on identity keys.
//!
//! Two schemes are used, matching what the handshake needs:
//! - OAEP (SHA-256) for encrypting short values to a public key
//! - PKCS#1 v1.5 type-1 padding for "encrypting" with a private key, which
//!   anyone holding the public key can recover
//!
//! Both are limited to a single modulus-sized block. They carry challenge
//! strings and session key segments, never chat payloads.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use rand::rngs::OsRng;
use rsa::traits::PublicKeyParts;
use rsa::{BigUint, Oaep, Pkcs1v15Sign, RsaPrivateKey, RsaPublicKey};
use sha2::Sha256;

use super::keys::KeyError;

/// OAEP overhead for a SHA-256 digest: two hashes plus two bytes.
const OAEP_OVERHEAD: usize = 2 * 32 + 2;

/// PKCS#1 v1.5 overhead: `00 01`, at least eight `ff`, `00`.
const PKCS1_OVERHEAD: usize = 11;

/// Largest plaintext OAEP can encrypt under this key.
pub fn max_oaep_plaintext(key: &RsaPublicKey) -> usize {
    key.size().saturating_sub(OAEP_OVERHEAD)
}

/// Largest plaintext the private-key scheme can carry under this key.
pub fn max_private_plaintext(key: &RsaPublicKey) -> usize {
    key.size().saturating_sub(PKCS1_OVERHEAD)
}

/// Encrypts a short value to a public key with OAEP.
pub fn encrypt_oaep(key: &RsaPublicKey, plaintext: &[u8]) -> Result<Vec<u8>, KeyError> {
    let limit = max_oaep_plaintext(key);
    if plaintext.len() > limit {
        return Err(KeyError::Crypto(format!(
            "plaintext of {} bytes exceeds the {} byte RSA limit",
            plaintext.len(),
            limit
        )));
    }

    key.encrypt(&mut OsRng, Oaep::new::<Sha256>(), plaintext)
        .map_err(|e| KeyError::Crypto(format!("RSA encryption failed: {}", e)))
}

/// Decrypts an OAEP ciphertext with the private key.
pub fn decrypt_oaep(key: &RsaPrivateKey, ciphertext: &[u8]) -> Result<Vec<u8>, KeyError> {
    key.decrypt(Oaep::new::<Sha256>(), ciphertext)
        .map_err(|e| KeyError::Decryption(format!("RSA decryption failed: {}", e)))
}

/// Pads and raises a short value to the private exponent.
pub fn encrypt_private(key: &RsaPrivateKey, plaintext: &[u8]) -> Result<Vec<u8>, KeyError> {
    let limit = max_private_plaintext(&RsaPublicKey::from(key));
    if plaintext.len() > limit {
        return Err(KeyError::Crypto(format!(
            "plaintext of {} bytes exceeds the {} byte RSA limit",
            plaintext.len(),
            limit
        )));
    }

    key.sign(Pkcs1v15Sign::new_unprefixed(), plaintext)
        .map_err(|e| KeyError::Crypto(format!("RSA private encryption failed: {}", e)))
}

/// Recovers a value produced by [`encrypt_private`] using the public key.
pub fn recover_public(key: &RsaPublicKey, ciphertext: &[u8]) -> Result<Vec<u8>, KeyError> {
    let k = key.size();
    if ciphertext.len() != k {
        return Err(KeyError::Decryption(format!(
            "ciphertext is {} bytes, expected {}",
            ciphertext.len(),
            k
        )));
    }

    let c = BigUint::from_bytes_be(ciphertext);
    if &c >= key.n() {
        return Err(KeyError::Decryption("ciphertext out of range".to_string()));
    }

    let m = c.modpow(key.e(), key.n()).to_bytes_be();
    let mut em = vec![0u8; k - m.len()];
    em.extend_from_slice(&m);

    // EM = 00 || 01 || PS (ff..ff, at least 8) || 00 || M
    if em[0] != 0x00 || em[1] != 0x01 {
        return Err(KeyError::Decryption("invalid padding".to_string()));
    }
    let padding = em[2..].iter().take_while(|&&b| b == 0xff).count();
    let separator = 2 + padding;
    if padding < 8 || separator >= k || em[separator] != 0x00 {
        return Err(KeyError::Decryption("invalid padding".to_string()));
    }

    Ok(em[separator + 1..].to_vec())
}

/// Base64 text form used for RSA ciphertexts inside control packets.
pub fn to_base64(bytes: &[u8]) -> String {
    BASE64.encode(bytes)
}

/// Inverse of [`to_base64`].
pub fn from_base64(text: &str) -> Result<Vec<u8>, KeyError> {
    BASE64
        .decode(text.trim())
        .map_err(|e| KeyError::Decryption(format!("invalid base64: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::test_keys;

    #[test]
    fn test_oaep_roundtrip() {
        let kp = test_keys::alice();
        let plaintext = b"0123456789abcdef0123456789abcdef";

        let ciphertext = encrypt_oaep(kp.public_key(), plaintext).unwrap();
        assert_eq!(ciphertext.len(), 256);

        let decrypted = decrypt_oaep(kp.private_key(), &ciphertext).unwrap();
        assert_eq!(decrypted, plaintext);
    }

    #[test]
    fn test_oaep_at_modulus_limit() {
        let kp = test_keys::alice();
        let limit = max_oaep_plaintext(kp.public_key());
        assert_eq!(limit, 190);

        let plaintext = vec![0x5a; limit];
        let ciphertext = encrypt_oaep(kp.public_key(), &plaintext).unwrap();
        assert_eq!(decrypt_oaep(kp.private_key(), &ciphertext).unwrap(), plaintext);

        let too_long = vec![0x5a; limit + 1];
        assert!(matches!(
            encrypt_oaep(kp.public_key(), &too_long),
            Err(KeyError::Crypto(_))
        ));
    }

    #[test]
    fn test_oaep_wrong_key_fails() {
        let alice = test_keys::alice();
        let bob = test_keys::bob();

        let ciphertext = encrypt_oaep(alice.public_key(), b"for alice").unwrap();
        let result = decrypt_oaep(bob.private_key(), &ciphertext);

        assert!(matches!(result, Err(KeyError::Decryption(_))));
    }

    #[test]
    fn test_private_encrypt_public_recover() {
        let kp = test_keys::alice();
        let plaintext = b"signed by alice";

        let ciphertext = encrypt_private(kp.private_key(), plaintext).unwrap();
        let recovered = recover_public(kp.public_key(), &ciphertext).unwrap();

        assert_eq!(recovered, plaintext);
    }

    #[test]
    fn test_recover_with_wrong_key_fails() {
        let alice = test_keys::alice();
        let bob = test_keys::bob();

        let ciphertext = encrypt_private(alice.private_key(), b"signed by alice").unwrap();
        assert!(recover_public(bob.public_key(), &ciphertext).is_err());
    }

    #[test]
    fn test_recover_rejects_wrong_length() {
        let kp = test_keys::alice();
        assert!(matches!(
            recover_public(kp.public_key(), &[1, 2, 3]),
            Err(KeyError::Decryption(_))
        ));
    }

    #[test]
    fn test_base64_rejects_garbage() {
        assert!(from_base64("!!not base64!!").is_err());
        assert_eq!(from_base64(&to_base64(b"abc")).unwrap(), b"abc");
    }
}
