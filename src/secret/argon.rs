use super::{with_static_salt, SecretDeriver, SecretError};
use argon2::{
    password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString},
    Argon2,
};
use async_trait::async_trait;
use rand_core::OsRng;

/// Argon2id with a random salt per secret, stored as a PHC string.
#[derive(Debug, Clone, Default)]
pub struct Argon2Deriver {
    static_salt: Option<String>,
}

impl Argon2Deriver {
    /// Creates a deriver using the default argon2 parameters.
    pub fn new(static_salt: Option<String>) -> Argon2Deriver {
        Argon2Deriver { static_salt }
    }
}

#[async_trait]
impl SecretDeriver for Argon2Deriver {
    async fn derive(&self, candidate: &str) -> Result<String, SecretError> {
        let password = with_static_salt(candidate, self.static_salt.as_deref());
        tokio::task::spawn_blocking(move || {
            let salt = SaltString::generate(&mut OsRng);
            Argon2::default()
                .hash_password(password.as_bytes(), &salt)
                .map(|hash| hash.to_string())
                .map_err(|e| SecretError::Hash(e.to_string()))
        })
        .await?
    }

    async fn verify(&self, candidate: &str, stored: &str) -> bool {
        let password = with_static_salt(candidate, self.static_salt.as_deref());
        let stored = stored.to_string();
        tokio::task::spawn_blocking(move || {
            let parsed_hash = match PasswordHash::new(&stored) {
                Ok(hash) => hash,
                Err(e) => {
                    tracing::debug!("stored secret is not a PHC string: {}", e);
                    return false;
                }
            };
            Argon2::default()
                .verify_password(password.as_bytes(), &parsed_hash)
                .is_ok()
        })
        .await
        .unwrap_or(false)
    }
}
