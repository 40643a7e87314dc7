use super::{with_static_salt, SecretDeriver, SecretError};
use async_trait::async_trait;
use base64ct::{Base64, Encoding};
use sha2::{Digest, Sha256};

/// Salted bcrypt, optionally peppered with an application wide static salt.
///
/// Each call to `derive` draws a fresh bcrypt salt, so the same password
/// never yields the same secret twice. Hashing runs on the blocking pool.
///
/// bcrypt only reads the first 72 bytes of its input, so the salted
/// candidate is first reduced to a base64 SHA-256 digest (44 bytes).
#[derive(Debug, Clone)]
pub struct BcryptDeriver {
    cost: u32,
    static_salt: Option<String>,
}

impl BcryptDeriver {
    /// Creates a deriver with the given work factor.
    pub fn new(cost: u32, static_salt: Option<String>) -> BcryptDeriver {
        BcryptDeriver { cost, static_salt }
    }

    fn prehash(&self, candidate: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(with_static_salt(candidate, self.static_salt.as_deref()).as_bytes());
        Base64::encode_string(&hasher.finalize())
    }
}

#[async_trait]
impl SecretDeriver for BcryptDeriver {
    async fn derive(&self, candidate: &str) -> Result<String, SecretError> {
        let password = self.prehash(candidate);
        let cost = self.cost;
        tokio::task::spawn_blocking(move || {
            bcrypt::hash(password, cost).map_err(|e| SecretError::Hash(e.to_string()))
        })
        .await?
    }

    async fn verify(&self, candidate: &str, stored: &str) -> bool {
        let password = self.prehash(candidate);
        let stored = stored.to_string();
        let res = tokio::task::spawn_blocking(move || bcrypt::verify(password, &stored)).await;
        match res {
            Ok(Ok(matches)) => matches,
            Ok(Err(e)) => {
                tracing::debug!("stored secret is not a bcrypt hash: {}", e);
                false
            }
            Err(e) => {
                tracing::error!("bcrypt verification task failed: {}", e);
                false
            }
        }
    }
}
