#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **aegis-secrets** – AES-GCM-encrypted secret store for Aegis.
//!
//! Secrets live in the same transactional backend as everything else, each
//! row an AES-256-GCM envelope (random 96-bit nonce prefixed to the
//! ciphertext) tagged with the master-key version that sealed it. The
//! master key is rotatable in place: [`SecretVault::rotate`] re-encrypts
//! every row under the new key inside one transaction. Decryption happens
//! only inside this process, at the trust boundary.

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use chrono::Utc;
use rand::rngs::OsRng;
use rand::RngCore;
use sqlx::{Row, SqlitePool};

/// Nonce length for AES-GCM (96 bits).
const NONCE_LEN: usize = 12;

/// Errors surfaced by the vault.
#[derive(Debug, thiserror::Error)]
pub enum VaultError {
    /// The supplied master key is not 32 bytes.
    #[error("master key must be exactly 32 bytes")]
    BadKeyLength,
    /// The key could not be decoded from base64.
    #[error("master key is not valid base64: {0}")]
    BadKeyEncoding(#[from] base64::DecodeError),
    /// A row was sealed with a key version this vault does not hold.
    #[error("no key for version {0}")]
    UnknownKeyVersion(i64),
    /// The ciphertext failed authentication or is malformed.
    #[error("failed to open secret envelope")]
    OpenFailed,
    /// Backend failure.
    #[error(transparent)]
    Backend(#[from] sqlx::Error),
}

/// A versioned master key.
#[derive(Clone)]
pub struct MasterKey {
    version: i64,
    cipher: Aes256Gcm,
}

impl MasterKey {
    /// Build a key from raw bytes.
    pub fn new(version: i64, bytes: &[u8]) -> Result<Self, VaultError> {
        if bytes.len() != 32 {
            return Err(VaultError::BadKeyLength);
        }
        let key = Key::<Aes256Gcm>::from_slice(bytes);
        Ok(Self { version, cipher: Aes256Gcm::new(key) })
    }

    /// Build a key from a base64-encoded string (the env-flag format).
    pub fn from_base64(version: i64, encoded: &str) -> Result<Self, VaultError> {
        let bytes = BASE64.decode(encoded)?;
        Self::new(version, &bytes)
    }

    /// Generate a fresh random key.
    pub fn generate(version: i64) -> Self {
        let mut bytes = [0u8; 32];
        OsRng.fill_bytes(&mut bytes);
        Self::new(version, &bytes).expect("32 bytes is always a valid key")
    }

    /// This key's version tag.
    pub fn version(&self) -> i64 {
        self.version
    }

    fn seal(&self, plaintext: &[u8]) -> Result<Vec<u8>, VaultError> {
        let mut nonce_bytes = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);
        let ciphertext = self
            .cipher
            .encrypt(nonce, plaintext)
            .map_err(|_| VaultError::OpenFailed)?;
        let mut envelope = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        envelope.extend_from_slice(&nonce_bytes);
        envelope.extend_from_slice(&ciphertext);
        Ok(envelope)
    }

    fn open(&self, envelope: &[u8]) -> Result<Vec<u8>, VaultError> {
        if envelope.len() < NONCE_LEN {
            return Err(VaultError::OpenFailed);
        }
        let (nonce_bytes, ciphertext) = envelope.split_at(NONCE_LEN);
        let nonce = Nonce::from_slice(nonce_bytes);
        self.cipher
            .decrypt(nonce, ciphertext)
            .map_err(|_| VaultError::OpenFailed)
    }
}

//─────────────────────────────
//  The vault
//─────────────────────────────

/// Encrypted key/value secret store.
pub struct SecretVault {
    pool: SqlitePool,
    keys: Vec<MasterKey>,
    active: usize,
}

impl SecretVault {
    /// Build a vault over `pool` sealing with `active_key`, creating the
    /// secrets table.
    pub async fn new(pool: SqlitePool, active_key: MasterKey) -> Result<Self, VaultError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS secrets (
                name TEXT PRIMARY KEY,
                key_version INTEGER NOT NULL,
                envelope BLOB NOT NULL,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            ) STRICT
            "#,
        )
        .execute(&pool)
        .await?;
        Ok(Self { pool, keys: vec![active_key], active: 0 })
    }

    /// Make an older key available for opening rows sealed before a
    /// rotation finished.
    pub fn with_legacy_key(mut self, key: MasterKey) -> Self {
        self.keys.push(key);
        self
    }

    fn active_key(&self) -> &MasterKey {
        &self.keys[self.active]
    }

    fn key_for(&self, version: i64) -> Result<&MasterKey, VaultError> {
        self.keys
            .iter()
            .find(|key| key.version == version)
            .ok_or(VaultError::UnknownKeyVersion(version))
    }

    /// Insert or replace a secret.
    pub async fn put(&self, name: &str, value: &[u8]) -> Result<(), VaultError> {
        let envelope = self.active_key().seal(value)?;
        let now = Utc::now().to_rfc3339();
        sqlx::query(
            "INSERT INTO secrets (name, key_version, envelope, created_at, updated_at) \
             VALUES (?, ?, ?, ?, ?) \
             ON CONFLICT (name) DO UPDATE SET \
             key_version = excluded.key_version, envelope = excluded.envelope, \
             updated_at = excluded.updated_at",
        )
        .bind(name)
        .bind(self.active_key().version)
        .bind(envelope)
        .bind(&now)
        .bind(&now)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Fetch and decrypt a secret.
    pub async fn get(&self, name: &str) -> Result<Option<Vec<u8>>, VaultError> {
        let row = sqlx::query("SELECT key_version, envelope FROM secrets WHERE name = ?")
            .bind(name)
            .fetch_optional(&self.pool)
            .await?;
        let Some(row) = row else { return Ok(None) };
        let version: i64 = row.get("key_version");
        let envelope: Vec<u8> = row.get("envelope");
        let key = self.key_for(version)?;
        key.open(&envelope).map(Some)
    }

    /// Remove a secret. Removing an unknown name is a no-op.
    pub async fn delete(&self, name: &str) -> Result<(), VaultError> {
        sqlx::query("DELETE FROM secrets WHERE name = ?")
            .bind(name)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Rotate the master key in place: re-encrypt every row under
    /// `new_key` inside one transaction, then seal future writes with it.
    pub async fn rotate(&mut self, new_key: MasterKey) -> Result<(), VaultError> {
        let mut tx = self.pool.begin().await?;
        let rows = sqlx::query("SELECT name, key_version, envelope FROM secrets")
            .fetch_all(&mut *tx)
            .await?;
        let now = Utc::now().to_rfc3339();
        for row in rows {
            let name: String = row.get("name");
            let version: i64 = row.get("key_version");
            let envelope: Vec<u8> = row.get("envelope");
            let plaintext = self.key_for(version)?.open(&envelope)?;
            let resealed = new_key.seal(&plaintext)?;
            sqlx::query(
                "UPDATE secrets SET key_version = ?, envelope = ?, updated_at = ? \
                 WHERE name = ?",
            )
            .bind(new_key.version)
            .bind(resealed)
            .bind(&now)
            .bind(&name)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;

        self.keys.push(new_key);
        self.active = self.keys.len() - 1;
        Ok(())
    }
}
