//! Credential Vault (§3, §4.3). Per-user AES-GCM wrap of opaque credential
//! maps keyed by backend id. Plaintext never touches the store layer —
//! `store::CredentialStore` only ever sees `iv`/`ciphertext` bytes.

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use anyhow::{Context, Result, bail};
use hmac::{Hmac, Mac};
use rand::RngCore;
use sha2::Sha256;
use std::collections::HashMap;

const NONCE_LEN: usize = 12;

/// Wraps/unwraps the opaque per-user credential map a backend consumes as
/// injected env vars (stdio) or headers (HTTP). The key is derived once per
/// user from their `vault_salt` plus the server master key; this module
/// takes the derived 32-byte key directly rather than doing derivation
/// itself, keeping the KDF choice a caller concern.
pub struct CredentialVault {
    master_key: [u8; 32],
}

impl CredentialVault {
    pub fn new(master_key: [u8; 32]) -> Self {
        Self { master_key }
    }

    /// Loads the vault master key with the same priority order `session.rs`
    /// uses for the HMAC secret: env var (hex) -> file at
    /// `{data_dir}/vault_master_key` (0600) -> generate and persist.
    pub fn load_or_create_master_key(data_dir: &std::path::Path) -> Result<[u8; 32]> {
        let path = data_dir.join("vault_master_key");

        if let Ok(hex) = std::env::var("VAULT_MASTER_KEY") {
            return decode_hex_32(&hex).context("VAULT_MASTER_KEY is not valid hex");
        }

        if path.exists() {
            let hex = std::fs::read_to_string(&path)
                .with_context(|| format!("reading {}", path.display()))?;
            return decode_hex_32(hex.trim())
                .with_context(|| format!("{} does not contain a valid key", path.display()));
        }

        let mut bytes = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut bytes);
        let hex = encode_hex(&bytes);
        std::fs::write(&path, &hex).with_context(|| format!("writing {}", path.display()))?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o600))?;
        }
        Ok(bytes)
    }

    fn cipher_for(&self, vault_salt: &str) -> Aes256Gcm {
        // Per-user key: HMAC-SHA256(master_key, vault_salt), so compromising
        // one user's derived key does not expose another's and the master
        // key is never used directly as an AES key.
        let mut mac = Hmac::<Sha256>::new_from_slice(&self.master_key)
            .expect("hmac accepts any key length");
        mac.update(vault_salt.as_bytes());
        let derived = mac.finalize().into_bytes();
        Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&derived))
    }

    pub fn encrypt(
        &self,
        vault_salt: &str,
        credentials: &HashMap<String, String>,
    ) -> Result<(Vec<u8>, Vec<u8>)> {
        let plaintext = serde_json::to_vec(credentials).context("serializing credential map")?;
        let cipher = self.cipher_for(vault_salt);

        let mut iv = vec![0u8; NONCE_LEN];
        rand::thread_rng().fill_bytes(&mut iv);
        let nonce = Nonce::from_slice(&iv);

        let ciphertext = cipher
            .encrypt(nonce, plaintext.as_ref())
            .map_err(|_| anyhow::anyhow!("credential encryption failed"))?;

        Ok((iv, ciphertext))
    }

    pub fn decrypt(
        &self,
        vault_salt: &str,
        iv: &[u8],
        ciphertext: &[u8],
    ) -> Result<HashMap<String, String>> {
        if iv.len() != NONCE_LEN {
            bail!("invalid nonce length");
        }
        let cipher = self.cipher_for(vault_salt);
        let nonce = Nonce::from_slice(iv);

        let plaintext = cipher
            .decrypt(nonce, ciphertext)
            .map_err(|_| anyhow::anyhow!("credential decryption failed"))?;

        serde_json::from_slice(&plaintext).context("deserializing credential map")
    }
}

fn encode_hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

fn decode_hex_32(s: &str) -> Result<[u8; 32]> {
    if s.len() % 2 != 0 {
        bail!("odd-length hex string");
    }
    let v: Result<Vec<u8>> = (0..s.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(&s[i..i + 2], 16).map_err(Into::into))
        .collect();
    v?.try_into()
        .map_err(|_| anyhow::anyhow!("key must be exactly 32 bytes"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn master_key_round_trips_through_file() {
        let dir = tempfile::tempdir().unwrap();
        let a = CredentialVault::load_or_create_master_key(dir.path()).unwrap();
        let b = CredentialVault::load_or_create_master_key(dir.path()).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn round_trip() {
        let vault = CredentialVault::new([7u8; 32]);
        let mut creds = HashMap::new();
        creds.insert("API_KEY".to_string(), "sk-test-123".to_string());

        let (iv, ct) = vault.encrypt("salt-user-1", &creds).unwrap();
        let decrypted = vault.decrypt("salt-user-1", &iv, &ct).unwrap();
        assert_eq!(decrypted, creds);
    }

    #[test]
    fn wrong_salt_fails() {
        let vault = CredentialVault::new([7u8; 32]);
        let mut creds = HashMap::new();
        creds.insert("API_KEY".to_string(), "sk-test-123".to_string());

        let (iv, ct) = vault.encrypt("salt-user-1", &creds).unwrap();
        assert!(vault.decrypt("salt-user-2", &iv, &ct).is_err());
    }
}
