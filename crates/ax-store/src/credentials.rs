//! Process-wide credential state.
//!
//! The only secrets the host holds: an upstream API key and/or an OAuth
//! bearer token. Workers never see either; the proxy reads them at request
//! time to replace the worker's placeholder.
//!
//! Resolution order: environment variables first, then the encrypted store
//! file in the data directory. The encrypted form is
//! `{salt, iv, tag, data}` hex fields, key derived with PBKDF2-SHA512 at
//! 100 000 iterations, payload sealed with AES-256-GCM (12-byte IV, 16-byte
//! tag, 16-byte salt).
//!
//! Secrets are never serialized, redacted from Debug output, and overwritten
//! with zeros on drop.

use std::collections::HashMap;
use std::path::Path;

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use pbkdf2::pbkdf2_hmac;
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::Sha512;
use tracing::info;

use crate::{Result, StoreError};

/// Environment variable carrying the upstream API key.
pub const ENV_API_KEY: &str = "AX_API_KEY";
/// Environment variable carrying the OAuth bearer token.
pub const ENV_OAUTH_TOKEN: &str = "AX_OAUTH_TOKEN";
/// Environment variable carrying the credential store passphrase.
pub const ENV_PASSPHRASE: &str = "AX_CREDENTIALS_PASSPHRASE";
/// File name of the encrypted store inside the data directory.
pub const STORE_FILE: &str = "credentials.enc";

const PBKDF2_ITERATIONS: u32 = 100_000;
const SALT_LEN: usize = 16;
const IV_LEN: usize = 12;
const TAG_LEN: usize = 16;

/// A secret string that zeroes itself on drop and redacts in Debug.
pub struct Secret(String);

impl Secret {
    pub fn new(value: String) -> Self {
        Self(value)
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl Drop for Secret {
    fn drop(&mut self) {
        // Best-effort scrub; NUL bytes keep the buffer valid UTF-8.
        unsafe { self.0.as_mut_vec().fill(0) };
    }
}

impl std::fmt::Debug for Secret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Secret([redacted])")
    }
}

/// Which credential the proxy will inject.
pub enum CredentialMode<'a> {
    /// API-key header mode, preferred when a key exists.
    ApiKey(&'a str),
    /// OAuth bearer mode.
    Bearer(&'a str),
}

impl CredentialMode<'_> {
    /// Label used in diagnostics; never the secret itself.
    pub fn label(&self) -> &'static str {
        match self {
            CredentialMode::ApiKey(_) => "api-key",
            CredentialMode::Bearer(_) => "oauth",
        }
    }
}

/// The process credential handle. Initialized once by the supervisor.
#[derive(Debug, Default)]
pub struct Credentials {
    api_key: Option<Secret>,
    oauth_token: Option<Secret>,
}

impl Credentials {
    /// Resolve from the environment only.
    pub fn from_env() -> Self {
        Self {
            api_key: std::env::var(ENV_API_KEY).ok().filter(|v| !v.is_empty()).map(Secret::new),
            oauth_token: std::env::var(ENV_OAUTH_TOKEN)
                .ok()
                .filter(|v| !v.is_empty())
                .map(Secret::new),
        }
    }

    /// Resolve from the environment, falling back to the encrypted store in
    /// `data_dir` when present. A store without a passphrase in the
    /// environment is an error: silently running credential-less would fail
    /// later and further from the cause.
    pub fn load(data_dir: &Path) -> Result<Self> {
        let mut creds = Self::from_env();
        if creds.api_key.is_some() || creds.oauth_token.is_some() {
            return Ok(creds);
        }

        let store_path = data_dir.join(STORE_FILE);
        if !store_path.exists() {
            return Ok(creds);
        }

        let passphrase =
            std::env::var(ENV_PASSPHRASE).map_err(|_| StoreError::MissingPassphrase)?;
        let blob: EncryptedBlob = serde_json::from_str(&std::fs::read_to_string(&store_path)?)?;
        let map = decrypt_map(&blob, passphrase.as_bytes())?;

        creds.api_key = map.get("api_key").cloned().map(Secret::new);
        creds.oauth_token = map.get("oauth_token").cloned().map(Secret::new);
        info!("credentials loaded from encrypted store");
        Ok(creds)
    }

    /// Construct directly, for tests and `configure`.
    pub fn from_parts(api_key: Option<String>, oauth_token: Option<String>) -> Self {
        Self {
            api_key: api_key.map(Secret::new),
            oauth_token: oauth_token.map(Secret::new),
        }
    }

    /// The mode the proxy should use: API key preferred, bearer otherwise,
    /// `None` when no credential exists (the proxy then fails closed).
    pub fn mode(&self) -> Option<CredentialMode<'_>> {
        if let Some(key) = &self.api_key {
            return Some(CredentialMode::ApiKey(key.expose()));
        }
        self.oauth_token
            .as_ref()
            .map(|t| Some(CredentialMode::Bearer(t.expose())))
            .unwrap_or(None)
    }

    pub fn is_empty(&self) -> bool {
        self.api_key.is_none() && self.oauth_token.is_none()
    }

    /// Drop both secrets now (zeroing happens in their Drop impls).
    pub fn zero(&mut self) {
        self.api_key = None;
        self.oauth_token = None;
    }
}

/// On-disk shape of the encrypted store. All fields hex.
#[derive(Debug, Serialize, Deserialize)]
pub struct EncryptedBlob {
    pub salt: String,
    pub iv: String,
    pub tag: String,
    pub data: String,
}

fn derive_key(passphrase: &[u8], salt: &[u8]) -> [u8; 32] {
    let mut key = [0u8; 32];
    pbkdf2_hmac::<Sha512>(passphrase, salt, PBKDF2_ITERATIONS, &mut key);
    key
}

/// Seal a credential map with a passphrase.
pub fn encrypt_map(map: &HashMap<String, String>, passphrase: &[u8]) -> Result<EncryptedBlob> {
    let mut salt = [0u8; SALT_LEN];
    let mut iv = [0u8; IV_LEN];
    OsRng.fill_bytes(&mut salt);
    OsRng.fill_bytes(&mut iv);

    let key = derive_key(passphrase, &salt);
    let cipher = Aes256Gcm::new_from_slice(&key)
        .map_err(|e| StoreError::Crypto(format!("cipher init: {e}")))?;

    let plaintext = serde_json::to_vec(map)?;
    let mut sealed = cipher
        .encrypt(Nonce::from_slice(&iv), plaintext.as_slice())
        .map_err(|e| StoreError::Crypto(format!("encrypt: {e}")))?;
    let tag = sealed.split_off(sealed.len() - TAG_LEN);

    Ok(EncryptedBlob {
        salt: hex::encode(salt),
        iv: hex::encode(iv),
        tag: hex::encode(tag),
        data: hex::encode(sealed),
    })
}

/// Open a sealed credential map. Fails on a wrong passphrase or any
/// tampering (the GCM tag covers both).
pub fn decrypt_map(blob: &EncryptedBlob, passphrase: &[u8]) -> Result<HashMap<String, String>> {
    let salt = hex::decode(&blob.salt).map_err(|e| StoreError::Crypto(e.to_string()))?;
    let iv = hex::decode(&blob.iv).map_err(|e| StoreError::Crypto(e.to_string()))?;
    let tag = hex::decode(&blob.tag).map_err(|e| StoreError::Crypto(e.to_string()))?;
    let mut data = hex::decode(&blob.data).map_err(|e| StoreError::Crypto(e.to_string()))?;

    if iv.len() != IV_LEN || tag.len() != TAG_LEN {
        return Err(StoreError::Crypto("malformed credential store".to_string()));
    }

    let key = derive_key(passphrase, &salt);
    let cipher = Aes256Gcm::new_from_slice(&key)
        .map_err(|e| StoreError::Crypto(format!("cipher init: {e}")))?;

    data.extend_from_slice(&tag);
    let plaintext = cipher
        .decrypt(Nonce::from_slice(&iv), data.as_slice())
        .map_err(|_| StoreError::Crypto("decryption failed (bad passphrase?)".to_string()))?;

    Ok(serde_json::from_slice(&plaintext)?)
}

/// Write a sealed store file for `configure`.
pub fn write_store(
    data_dir: &Path,
    map: &HashMap<String, String>,
    passphrase: &[u8],
) -> Result<()> {
    let blob = encrypt_map(map, passphrase)?;
    let path = data_dir.join(STORE_FILE);
    std::fs::write(&path, serde_json::to_string_pretty(&blob)?)?;
    info!(path = %path.display(), "credential store written");
    Ok(())
}
