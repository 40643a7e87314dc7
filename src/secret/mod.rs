//! Secret derivation.
//!
//! A [`SecretDeriver`] turns a candidate password into the opaque string kept
//! in the `password` column, and checks a candidate against a stored one.
//! Verification fails closed: anything that goes wrong while checking is a
//! mismatch.

mod argon;
mod cipher;
mod salted;

pub use argon::Argon2Deriver;
pub use cipher::CipherDeriver;
pub use salted::BcryptDeriver;

use crate::settings::{SecretSettings, Strategy};
use async_trait::async_trait;
use std::sync::Arc;

/// Errors raised while deriving a secret or building a deriver.
#[derive(Debug, thiserror::Error)]
pub enum SecretError {
    /// The hash function failed.
    #[error("hashing failed: {0}")]
    Hash(String),
    /// The cipher could not be built or used.
    #[error("cipher failed: {0}")]
    Cipher(String),
    /// The blocking worker running the derivation did not complete.
    #[error("derivation task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

/// Turns passwords into stored secrets and checks candidates against them.
#[async_trait]
pub trait SecretDeriver: Send + Sync {
    /// Derives the secret to store for `candidate`.
    async fn derive(&self, candidate: &str) -> Result<String, SecretError>;

    /// Returns true only when `candidate` matches `stored`.
    async fn verify(&self, candidate: &str, stored: &str) -> bool;
}

/// Builds the deriver selected by `secret.strategy`.
pub fn from_settings(settings: &SecretSettings) -> Result<Arc<dyn SecretDeriver>, SecretError> {
    let static_salt = settings.static_salt.clone();
    let deriver: Arc<dyn SecretDeriver> = match settings.strategy {
        Strategy::Bcrypt => Arc::new(BcryptDeriver::new(settings.bcrypt_cost, static_salt)),
        Strategy::Argon2 => Arc::new(Argon2Deriver::new(static_salt)),
        Strategy::AesCbc => {
            tracing::warn!(
                "aes-cbc uses a fixed key and IV, equal passwords produce equal secrets; \
                 prefer bcrypt"
            );
            if settings.static_salt.is_some() {
                tracing::warn!("secret.static_salt is ignored by aes-cbc");
            }
            let key = settings.cipher_key.as_deref().unwrap_or_default();
            let iv = settings.cipher_iv.as_deref().unwrap_or_default();
            Arc::new(CipherDeriver::from_base64(key, iv)?)
        }
    };
    Ok(deriver)
}

/// Appends the application wide salt, if any.
fn with_static_salt(candidate: &str, static_salt: Option<&str>) -> String {
    match static_salt {
        Some(salt) => format!("{}{}", candidate, salt),
        None => candidate.to_string(),
    }
}
