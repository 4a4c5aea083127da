//! Password-based note encryption.
//!
//! AES-256-GCM under a PBKDF2-SHA256 derived key. The ciphertext is a
//! self-describing envelope - `nk1:` followed by base64(salt || nonce ||
//! ciphertext) - so decryption needs only the envelope and the password.
//! Salt and nonce are random per call; encrypting the same plaintext twice
//! produces different envelopes.

use aes_gcm::aead::Aead;
use aes_gcm::{Aes256Gcm, KeyInit, Nonce};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use rand::RngCore;
use thiserror::Error;

const ENVELOPE_PREFIX: &str = "nk1:";
const SALT_LEN: usize = 16;
const NONCE_LEN: usize = 12;
const KEY_LEN: usize = 32;
const PBKDF2_ROUNDS: u32 = 120_000;

/// Errors from the encryption transform.
///
/// A wrong password, a truncated envelope, and input that was never
/// encrypted all surface as `DecryptionFailed`; callers treat every decrypt
/// failure identically.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum CryptoError {
    #[error("encryption failed")]
    EncryptionFailed,

    #[error("content could not be decrypted with the supplied password")]
    DecryptionFailed,
}

/// Whether content looks like a ciphertext envelope produced by [`encrypt`].
pub fn is_envelope(content: &str) -> bool {
    content.starts_with(ENVELOPE_PREFIX)
}

/// Encrypts plaintext under a password into a self-describing envelope.
pub fn encrypt(plaintext: &str, password: &str) -> Result<String, CryptoError> {
    let mut salt = [0u8; SALT_LEN];
    let mut nonce = [0u8; NONCE_LEN];
    let mut rng = rand::rng();
    rng.fill_bytes(&mut salt);
    rng.fill_bytes(&mut nonce);

    let key = derive_key(password, &salt);
    let cipher = Aes256Gcm::new_from_slice(&key).map_err(|_| CryptoError::EncryptionFailed)?;
    let ciphertext = cipher
        .encrypt(Nonce::from_slice(&nonce), plaintext.as_bytes())
        .map_err(|_| CryptoError::EncryptionFailed)?;

    let mut blob = Vec::with_capacity(SALT_LEN + NONCE_LEN + ciphertext.len());
    blob.extend_from_slice(&salt);
    blob.extend_from_slice(&nonce);
    blob.extend_from_slice(&ciphertext);

    Ok(format!("{}{}", ENVELOPE_PREFIX, BASE64.encode(blob)))
}

/// Decrypts an envelope produced by [`encrypt`].
pub fn decrypt(envelope: &str, password: &str) -> Result<String, CryptoError> {
    let encoded = envelope
        .strip_prefix(ENVELOPE_PREFIX)
        .ok_or(CryptoError::DecryptionFailed)?;
    let blob = BASE64
        .decode(encoded)
        .map_err(|_| CryptoError::DecryptionFailed)?;
    if blob.len() < SALT_LEN + NONCE_LEN {
        return Err(CryptoError::DecryptionFailed);
    }

    let (salt, rest) = blob.split_at(SALT_LEN);
    let (nonce, ciphertext) = rest.split_at(NONCE_LEN);

    let key = derive_key(password, salt);
    let cipher = Aes256Gcm::new_from_slice(&key).map_err(|_| CryptoError::DecryptionFailed)?;
    let plaintext = cipher
        .decrypt(Nonce::from_slice(nonce), ciphertext)
        .map_err(|_| CryptoError::DecryptionFailed)?;

    String::from_utf8(plaintext).map_err(|_| CryptoError::DecryptionFailed)
}

fn derive_key(password: &str, salt: &[u8]) -> [u8; KEY_LEN] {
    let mut key = [0u8; KEY_LEN];
    pbkdf2::pbkdf2_hmac::<sha2::Sha256>(password.as_bytes(), salt, PBKDF2_ROUNDS, &mut key);
    key
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_roundtrip() {
        let envelope = encrypt("meeting notes\nsecond line", "hunter2").unwrap();
        let plaintext = decrypt(&envelope, "hunter2").unwrap();
        assert_eq!(plaintext, "meeting notes\nsecond line");
    }

    #[test]
    fn test_roundtrip_empty_plaintext() {
        let envelope = encrypt("", "pw").unwrap();
        assert_eq!(decrypt(&envelope, "pw").unwrap(), "");
    }

    #[test]
    fn test_wrong_password_fails() {
        let envelope = encrypt("secret", "right").unwrap();
        assert_eq!(
            decrypt(&envelope, "wrong"),
            Err(CryptoError::DecryptionFailed)
        );
    }

    #[test]
    fn test_envelope_is_randomized() {
        let a = encrypt("same input", "pw").unwrap();
        let b = encrypt("same input", "pw").unwrap();
        assert_ne!(a, b);
        assert_eq!(decrypt(&a, "pw").unwrap(), decrypt(&b, "pw").unwrap());
    }

    #[test]
    fn test_plaintext_input_fails_decryption() {
        assert_eq!(
            decrypt("just some plain note", "pw"),
            Err(CryptoError::DecryptionFailed)
        );
    }

    #[test]
    fn test_truncated_envelope_fails() {
        let envelope = encrypt("secret", "pw").unwrap();
        let truncated = &envelope[..ENVELOPE_PREFIX.len() + 8];
        assert_eq!(decrypt(truncated, "pw"), Err(CryptoError::DecryptionFailed));
    }

    #[test]
    fn test_garbage_base64_fails() {
        assert_eq!(
            decrypt("nk1:!!!not-base64!!!", "pw"),
            Err(CryptoError::DecryptionFailed)
        );
    }

    #[test]
    fn test_is_envelope() {
        let envelope = encrypt("x", "pw").unwrap();
        assert!(is_envelope(&envelope));
        assert!(!is_envelope("plain text"));
    }

    #[test]
    fn test_unicode_content() {
        let content = "emoji 📝 and accents: café";
        let envelope = encrypt(content, "pässwörd").unwrap();
        assert_eq!(decrypt(&envelope, "pässwörd").unwrap(), content);
    }
}
