use super::{SecretDeriver, SecretError};
use aes::cipher::{block_padding::Pkcs7, BlockEncryptMut, KeyIvInit};
use async_trait::async_trait;
use base64ct::{Base64, Encoding};
use subtle::ConstantTimeEq;

type Aes256CbcEnc = cbc::Encryptor<aes::Aes256>;

const KEY_LEN: usize = 32;
const IV_LEN: usize = 16;

/// Deterministic AES-256-CBC under a fixed key and IV.
///
/// Kept for tables that were populated this way. The same password always
/// produces the same secret, so equal passwords can be correlated across
/// accounts.
#[derive(Clone)]
pub struct CipherDeriver {
    key: [u8; KEY_LEN],
    iv: [u8; IV_LEN],
}

impl std::fmt::Debug for CipherDeriver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CipherDeriver").finish_non_exhaustive()
    }
}

impl CipherDeriver {
    /// Creates a deriver from raw key material.
    pub fn new(key: [u8; KEY_LEN], iv: [u8; IV_LEN]) -> CipherDeriver {
        CipherDeriver { key, iv }
    }

    /// Creates a deriver from base64 encoded key and IV.
    pub fn from_base64(key: &str, iv: &str) -> Result<CipherDeriver, SecretError> {
        let key = decode_exact::<KEY_LEN>("cipher_key", key)?;
        let iv = decode_exact::<IV_LEN>("cipher_iv", iv)?;
        Ok(CipherDeriver::new(key, iv))
    }

    fn encrypt(&self, candidate: &str) -> Result<String, SecretError> {
        let ciphertext = Aes256CbcEnc::new_from_slices(&self.key, &self.iv)
            .map_err(|e| SecretError::Cipher(e.to_string()))?
            .encrypt_padded_vec_mut::<Pkcs7>(candidate.as_bytes());
        Ok(Base64::encode_string(&ciphertext))
    }
}

fn decode_exact<const N: usize>(name: &str, encoded: &str) -> Result<[u8; N], SecretError> {
    let bytes = Base64::decode_vec(encoded)
        .map_err(|e| SecretError::Cipher(format!("{} is not valid base64: {}", name, e)))?;
    bytes.try_into().map_err(|bytes: Vec<u8>| {
        SecretError::Cipher(format!(
            "{} must be {} bytes, got {}",
            name,
            N,
            bytes.len()
        ))
    })
}

#[async_trait]
impl SecretDeriver for CipherDeriver {
    async fn derive(&self, candidate: &str) -> Result<String, SecretError> {
        self.encrypt(candidate)
    }

    async fn verify(&self, candidate: &str, stored: &str) -> bool {
        match self.encrypt(candidate) {
            Ok(expected) => {
                expected.len() == stored.len()
                    && bool::from(expected.as_bytes().ct_eq(stored.as_bytes()))
            }
            Err(e) => {
                tracing::error!("cannot encrypt candidate: {}", e);
                false
            }
        }
    }
}
