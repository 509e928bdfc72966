//! Symmetric storage of provisioning secrets and broker password hashing.
//!
//! All passwords persisted by the orchestrator (database, broker, bucket)
//! go through [`Vault::encrypt`] and come back through [`Vault::decrypt`].
//! The broker's own auth backend never sees those tokens; it consumes the
//! one-way PBKDF2 hash from [`Vault::hash_for_broker`] instead.

use aes_gcm::aead::rand_core::RngCore;
use aes_gcm::aead::{Aead, KeyInit, OsRng};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use pbkdf2::pbkdf2_hmac;
use rand::distributions::Alphanumeric;
use rand::Rng;
use sha2::Sha512;

use crate::config::Config;
use crate::error::{ProvisionError, Result};

/// PBKDF2 iteration count for broker password hashes.
const BROKER_HASH_ITERATIONS: u32 = 100_000;

/// Salt length in bytes for broker password hashes.
const BROKER_HASH_SALT_LEN: usize = 16;

/// Process-wide credential vault holding the symmetric key.
///
/// Construction fails if the configured key is absent or malformed;
/// there is deliberately no fallback to a generated key.
#[derive(Clone)]
pub struct Vault {
    key: [u8; 32],
}

impl std::fmt::Debug for Vault {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Never print key material.
        f.debug_struct("Vault").finish_non_exhaustive()
    }
}

impl Vault {
    /// Build a vault from the configured base64 key.
    pub fn from_config(cfg: &Config) -> Result<Self> {
        Self::from_base64_key(&cfg.vault_key_b64)
    }

    /// Build a vault from a base64-encoded 32-byte key.
    pub fn from_base64_key(encoded: &str) -> Result<Self> {
        // ---
        let bytes = STANDARD.decode(encoded.trim()).map_err(|e| {
            ProvisionError::Credential(format!("VAULT_ENCRYPTION_KEY is not valid base64: {e}"))
        })?;

        let key: [u8; 32] = bytes.try_into().map_err(|_| {
            ProvisionError::Credential("VAULT_ENCRYPTION_KEY must decode to 32 bytes".into())
        })?;

        Ok(Self { key })
    }

    /// Generate a cryptographically random alphanumeric secret.
    pub fn generate_secret(&self, length: usize) -> String {
        // ---
        rand::rngs::OsRng
            .sample_iter(&Alphanumeric)
            .take(length)
            .map(char::from)
            .collect()
    }

    /// Encrypt a plaintext secret for storage.
    ///
    /// Returns `base64(nonce || ciphertext || tag)`. An empty input maps
    /// to an empty output, not an error: absent credentials stay absent.
    pub fn encrypt(&self, plaintext: &str) -> Result<String> {
        // ---
        if plaintext.is_empty() {
            return Ok(String::new());
        }

        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&self.key));
        let mut nonce_bytes = [0u8; 12];
        OsRng.fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let ciphertext = cipher
            .encrypt(nonce, plaintext.as_bytes())
            .map_err(|e| ProvisionError::Credential(format!("AES-GCM encrypt: {e}")))?;

        let mut combined = nonce_bytes.to_vec();
        combined.extend_from_slice(&ciphertext);
        Ok(STANDARD.encode(combined))
    }

    /// Decrypt a stored secret token back to plaintext.
    ///
    /// `decrypt("") == ""` mirrors the encrypt side.
    pub fn decrypt(&self, token: &str) -> Result<String> {
        // ---
        if token.is_empty() {
            return Ok(String::new());
        }

        let combined = STANDARD
            .decode(token)
            .map_err(|e| ProvisionError::Credential(format!("base64 decode: {e}")))?;

        if combined.len() < 13 {
            return Err(ProvisionError::Credential("ciphertext too short".into()));
        }

        let (nonce_bytes, ciphertext) = combined.split_at(12);
        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&self.key));
        let nonce = Nonce::from_slice(nonce_bytes);

        let plaintext = cipher
            .decrypt(nonce, ciphertext)
            .map_err(|e| ProvisionError::Credential(format!("AES-GCM decrypt: {e}")))?;

        String::from_utf8(plaintext)
            .map_err(|e| ProvisionError::Credential(format!("decrypted secret not UTF-8: {e}")))
    }

    /// One-way broker-compatible password hash.
    ///
    /// Format: `PBKDF2$sha512$<iterations>$<salt_b64>$<dk_b64>`, the shape
    /// the broker's auth backend verifies against. Independent of
    /// [`Vault::encrypt`]; never reversed.
    pub fn hash_for_broker(&self, password: &str) -> String {
        // ---
        let mut salt = [0u8; BROKER_HASH_SALT_LEN];
        OsRng.fill_bytes(&mut salt);

        let mut derived = [0u8; 64];
        pbkdf2_hmac::<Sha512>(
            password.as_bytes(),
            &salt,
            BROKER_HASH_ITERATIONS,
            &mut derived,
        );

        format!(
            "PBKDF2$sha512${}${}${}",
            BROKER_HASH_ITERATIONS,
            STANDARD.encode(salt),
            STANDARD.encode(derived)
        )
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;

    fn test_vault() -> Vault {
        Vault {
            key: [42u8; 32],
        }
    }

    #[test]
    fn encrypt_decrypt_roundtrip() {
        let vault = test_vault();
        for secret in ["hunter2", "p@ss wörd", "x"] {
            let token = vault.encrypt(secret).unwrap();
            assert_ne!(token, secret);
            assert_eq!(vault.decrypt(&token).unwrap(), secret);
        }
    }

    #[test]
    fn empty_string_maps_to_empty() {
        let vault = test_vault();
        assert_eq!(vault.encrypt("").unwrap(), "");
        assert_eq!(vault.decrypt("").unwrap(), "");
    }

    #[test]
    fn wrong_key_fails_decrypt() {
        let vault = test_vault();
        let other = Vault { key: [99u8; 32] };
        let token = vault.encrypt("secret").unwrap();
        assert!(other.decrypt(&token).is_err());
    }

    #[test]
    fn malformed_token_is_credential_error() {
        let vault = test_vault();
        assert!(vault.decrypt("not-base64!!!").is_err());
        assert!(vault.decrypt(&STANDARD.encode([1u8; 4])).is_err());
    }

    #[test]
    fn key_must_be_32_bytes() {
        assert!(Vault::from_base64_key(&STANDARD.encode([1u8; 16])).is_err());
        assert!(Vault::from_base64_key("***").is_err());
        assert!(Vault::from_base64_key(&STANDARD.encode([1u8; 32])).is_ok());
    }

    #[test]
    fn generated_secrets_are_alphanumeric_and_sized() {
        let vault = test_vault();
        let secret = vault.generate_secret(24);
        assert_eq!(secret.len(), 24);
        assert!(secret.chars().all(|c| c.is_ascii_alphanumeric()));
        // Two draws should essentially never collide.
        assert_ne!(secret, vault.generate_secret(24));
    }

    #[test]
    fn broker_hash_has_expected_shape() {
        let vault = test_vault();
        let hash = vault.hash_for_broker("hunter2");
        let parts: Vec<&str> = hash.split('$').collect();
        assert_eq!(parts.len(), 5);
        assert_eq!(parts[0], "PBKDF2");
        assert_eq!(parts[1], "sha512");
        assert_eq!(parts[2], BROKER_HASH_ITERATIONS.to_string());
        assert!(STANDARD.decode(parts[3]).is_ok());
        assert_eq!(STANDARD.decode(parts[4]).unwrap().len(), 64);
    }

    #[test]
    fn broker_hash_is_salted() {
        let vault = test_vault();
        assert_ne!(
            vault.hash_for_broker("hunter2"),
            vault.hash_for_broker("hunter2")
        );
    }
}
