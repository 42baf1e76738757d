//! Third-party OAuth credential decoding.
//!
//! Access and refresh tokens are stored AES-256-GCM encrypted in the
//! user-profile store. Key and nonce are derived deterministically from two
//! process-scoped secrets, so every replica of the pipeline can decrypt
//! tokens written by the web tier without any key exchange. This module
//! reads credentials and writes back exactly one thing: the
//! `refresh_invalidated` flag when an irrecoverable refresh error is seen.

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use base64::{Engine, engine::general_purpose::STANDARD as base64_engine};
use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use sqlx::{Pool, Postgres};
use tracing::warn;

use crate::config::SecretsConfig;

#[derive(Debug, thiserror::Error)]
pub enum CredentialError {
    #[error("no stored credential for {0}")]
    NotFound(String),
    /// The refresh grant was revoked; user action is required.
    #[error("credential for {0} is invalidated: re-authorization required")]
    Invalidated(String),
    #[error("token decryption failed: {0}")]
    Decrypt(String),
    #[error("token encryption failed: {0}")]
    Encrypt(String),
    #[error(transparent)]
    Store(#[from] sqlx::Error),
}

/// Decrypted, usable credential bundle for the owner's cloud account.
#[derive(Debug, Clone)]
pub struct GoogleCredential {
    pub access_token: String,
    pub refresh_token: String,
    pub expiry: Option<DateTime<Utc>>,
    /// `None` when scopes were not recorded at grant time. Consumers must
    /// then omit the scope parameter on refresh: the refresh token already
    /// encodes the original grant.
    pub scopes: Option<Vec<String>>,
    pub refresh_invalidated: bool,
}

impl GoogleCredential {
    pub fn is_access_token_expired(&self, now: DateTime<Utc>) -> bool {
        match self.expiry {
            Some(expiry) => expiry <= now,
            // Unknown expiry: treat as expired so we refresh before use.
            None => true,
        }
    }
}

/// Deterministic AES-256-GCM cipher derived from the two process secrets:
/// key = SHA-256(secret_key), nonce = SHA-256(secret_salt)[..12].
#[derive(Clone)]
pub struct TokenCipher {
    key: [u8; 32],
    nonce: [u8; 12],
}

impl TokenCipher {
    pub fn derive(secrets: &SecretsConfig) -> Self {
        Self::derive_from(&secrets.token_secret_key, &secrets.token_secret_salt)
    }

    pub fn derive_from(secret_key: &str, secret_salt: &str) -> Self {
        let key: [u8; 32] = Sha256::digest(secret_key.as_bytes()).into();
        let salt_digest: [u8; 32] = Sha256::digest(secret_salt.as_bytes()).into();
        let mut nonce = [0u8; 12];
        nonce.copy_from_slice(&salt_digest[..12]);
        Self { key, nonce }
    }

    /// Decrypt a base64 token ciphertext.
    pub fn decrypt(&self, encrypted: &str) -> Result<String, CredentialError> {
        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&self.key));
        let ciphertext = base64_engine
            .decode(encrypted)
            .map_err(|e| CredentialError::Decrypt(format!("invalid base64: {e}")))?;
        let plaintext = cipher
            .decrypt(Nonce::from_slice(&self.nonce), ciphertext.as_ref())
            .map_err(|_| CredentialError::Decrypt("AEAD verification failed".to_string()))?;
        String::from_utf8(plaintext)
            .map_err(|e| CredentialError::Decrypt(format!("not valid UTF-8: {e}")))
    }

    /// Encrypt a token to base64. The web tier writes tokens with the same
    /// derived cipher; kept here so both directions live next to each other.
    pub fn encrypt(&self, plaintext: &str) -> Result<String, CredentialError> {
        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&self.key));
        let ciphertext = cipher
            .encrypt(Nonce::from_slice(&self.nonce), plaintext.as_bytes())
            .map_err(|e| CredentialError::Encrypt(e.to_string()))?;
        Ok(base64_engine.encode(ciphertext))
    }
}

const GET_CREDENTIAL_QUERY: &str = r#"
    SELECT access_token_enc, refresh_token_enc, token_expiry, scopes, refresh_invalidated
    FROM user_credentials
    WHERE owner_email = $1
"#;

const MARK_INVALID_QUERY: &str = r#"
    UPDATE user_credentials SET
        refresh_invalidated = TRUE,
        updated_at = NOW()
    WHERE owner_email = $1
"#;

#[derive(Debug, sqlx::FromRow)]
struct CredentialRow {
    access_token_enc: String,
    refresh_token_enc: String,
    token_expiry: Option<DateTime<Utc>>,
    scopes: Option<Vec<String>>,
    refresh_invalidated: bool,
}

/// Reads encrypted credentials from the user-profile store and returns
/// usable bundles.
#[derive(Clone)]
pub struct CredentialDecoder {
    pool: Pool<Postgres>,
    cipher: TokenCipher,
}

impl CredentialDecoder {
    pub fn new(pool: Pool<Postgres>, cipher: TokenCipher) -> Self {
        Self { pool, cipher }
    }

    /// Fetch and decrypt the owner's Google credential. Fails fast with
    /// `Invalidated` when a previous run observed a revoked refresh grant.
    #[tracing::instrument(name = "credentials.get", skip(self), fields(owner = %owner_email))]
    pub async fn get_google_credential(
        &self,
        owner_email: &str,
    ) -> Result<GoogleCredential, CredentialError> {
        let row: Option<CredentialRow> = sqlx::query_as(GET_CREDENTIAL_QUERY)
            .bind(owner_email)
            .fetch_optional(&self.pool)
            .await?;
        let row = row.ok_or_else(|| CredentialError::NotFound(owner_email.to_string()))?;
        if row.refresh_invalidated {
            return Err(CredentialError::Invalidated(owner_email.to_string()));
        }
        Ok(GoogleCredential {
            access_token: self.cipher.decrypt(&row.access_token_enc)?,
            refresh_token: self.cipher.decrypt(&row.refresh_token_enc)?,
            expiry: row.token_expiry,
            scopes: row.scopes,
            refresh_invalidated: false,
        })
    }

    /// Record that the refresh grant is dead so subsequent runs fail fast
    /// instead of burning an executor attempt.
    #[tracing::instrument(name = "credentials.mark_invalid", skip(self), fields(owner = %owner_email))]
    pub async fn mark_invalid(&self, owner_email: &str, reason: &str) -> Result<(), CredentialError> {
        warn!(owner = %owner_email, reason, "Marking stored credential as invalidated");
        sqlx::query(MARK_INVALID_QUERY).bind(owner_email).execute(&self.pool).await?;
        Ok(())
    }
}
