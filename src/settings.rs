/// This module is used to parse and read from configuration files for the
/// server.
use crate::secret::CipherDeriver;
use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::Path;

/// Errors raised while loading or validating the settings. Any of these is
/// fatal at startup.
#[derive(Debug, thiserror::Error)]
pub enum SettingsError {
    /// The configuration sources could not be read or deserialized.
    #[error("cannot load configuration: {0}")]
    Load(#[from] ConfigError),
    /// A required parameter is missing or has an invalid value.
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Which credential store backs the verifier.
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    /// A pooled Postgres connection.
    Postgres,
    /// An in-process table seeded from `auth.seed_users`. Development only.
    Memory,
}

fn default_backend() -> Backend {
    Backend::Postgres
}

/// This configuration object contains the database config.
#[derive(Debug, Deserialize, Clone)]
pub struct Database {
    /// Database url.
    #[serde(default)]
    pub url: String,
    /// Maximum number of connections to the database. Set to 1 for a single
    /// persistent connection.
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
    /// Connections kept open even when idle.
    #[serde(default)]
    pub min_connections: u32,
    /// How long to wait for a connection before giving up.
    #[serde(default = "default_acquire_timeout")]
    pub acquire_timeout_secs: u64,
    /// Idle connections are closed after this many seconds.
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout_secs: u64,
    /// Run the bundled migrations at startup.
    #[serde(default)]
    pub run_migrations: bool,
    /// Store backend.
    #[serde(default = "default_backend")]
    pub backend: Backend,
}

impl Default for Database {
    fn default() -> Self {
        Database {
            url: String::new(),
            max_connections: default_max_connections(),
            min_connections: 0,
            acquire_timeout_secs: default_acquire_timeout(),
            idle_timeout_secs: default_idle_timeout(),
            run_migrations: false,
            backend: default_backend(),
        }
    }
}

fn default_max_connections() -> u32 {
    10
}

fn default_acquire_timeout() -> u64 {
    5
}

fn default_idle_timeout() -> u64 {
    600
}

/// Secret derivation strategy.
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum Strategy {
    /// Salted bcrypt.
    Bcrypt,
    /// Argon2id PHC strings.
    Argon2,
    /// Deterministic AES-256-CBC under a fixed key and IV. Legacy only.
    AesCbc,
}

fn default_strategy() -> Strategy {
    Strategy::Bcrypt
}

fn default_bcrypt_cost() -> u32 {
    10
}

/// This configuration object contains the secret derivation config.
#[derive(Debug, Deserialize, Clone)]
pub struct SecretSettings {
    /// The derivation strategy.
    #[serde(default = "default_strategy")]
    pub strategy: Strategy,
    /// Work factor for bcrypt.
    #[serde(default = "default_bcrypt_cost")]
    pub bcrypt_cost: u32,
    /// Application wide salt appended to every password before hashing. Not
    /// allowed with `aes-cbc`.
    pub static_salt: Option<String>,
    /// Base64 encoded 32 byte key for `aes-cbc`.
    pub cipher_key: Option<String>,
    /// Base64 encoded 16 byte IV for `aes-cbc`.
    pub cipher_iv: Option<String>,
}

impl Default for SecretSettings {
    fn default() -> Self {
        SecretSettings {
            strategy: default_strategy(),
            bcrypt_cost: default_bcrypt_cost(),
            static_salt: None,
            cipher_key: None,
            cipher_iv: None,
        }
    }
}

/// A user created at startup by the memory backend.
#[derive(Debug, Deserialize, Clone)]
pub struct SeedUser {
    /// Username of the seeded record.
    pub username: String,
    /// Permissions token of the seeded record.
    pub permissions: String,
}

/// This configuration object contains the authentication config.
#[derive(Debug, Deserialize, Clone)]
pub struct Auth {
    /// Bind the first password presented for an account that has none.
    #[serde(default = "default_first_use")]
    pub first_use_provisioning: bool,
    /// Users loaded into the memory backend.
    #[serde(default)]
    pub seed_users: Vec<SeedUser>,
}

impl Default for Auth {
    fn default() -> Self {
        Auth {
            first_use_provisioning: default_first_use(),
            seed_users: vec![],
        }
    }
}

fn default_first_use() -> bool {
    true
}

/// The app wide settings
#[derive(Debug, Deserialize, Clone)]
pub struct BaseSettings {
    /// The address the HTTP API listens on.
    #[serde(default = "default_listen")]
    pub listen: SocketAddr,
    /// The rust log parameter. Describes how much logging is wanted.
    pub rust_log: Option<String>,
}

impl Default for BaseSettings {
    fn default() -> Self {
        BaseSettings {
            listen: default_listen(),
            rust_log: None,
        }
    }
}

fn default_listen() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 18032))
}

/// This structure contains all the config parameters of the app.
#[derive(Debug, Deserialize, Clone)]
pub struct Settings {
    /// Settings related to the database.
    #[serde(default)]
    pub database: Database,
    /// Secret derivation config.
    #[serde(default)]
    pub secret: SecretSettings,
    /// Authentication config.
    #[serde(default)]
    pub auth: Auth,
    /// The app-wide config.
    #[serde(default)]
    pub base: BaseSettings,
}

impl Settings {
    /// Creates a new configuration form config files and environment variables.
    pub fn new() -> Result<Self, SettingsError> {
        Settings::with_config_dir("config")
    }

    /// Same as [`Settings::new`] but reads `default` and `local` from `dir`.
    pub fn with_config_dir(dir: impl AsRef<Path>) -> Result<Self, SettingsError> {
        let dir = dir.as_ref();
        let s = Config::builder()
            .add_source(File::from(dir.join("default")))
            .add_source(File::with_name(".env").required(false))
            .add_source(File::from(dir.join("local")).required(false))
            .add_source(
                Environment::with_prefix("auth")
                    .prefix_separator("_")
                    .separator("__"),
            )
            .build()?;
        let settings: Settings = s.try_deserialize()?;
        settings.validate()?;
        Ok(settings)
    }

    /// Checks the parameters that deserialization alone cannot.
    pub fn validate(&self) -> Result<(), SettingsError> {
        if self.database.backend == Backend::Postgres && self.database.url.is_empty() {
            return Err(SettingsError::Invalid(
                "database.url is required for the postgres backend".into(),
            ));
        }
        if self.database.max_connections == 0 {
            return Err(SettingsError::Invalid(
                "database.max_connections must be at least 1".into(),
            ));
        }
        if self.database.min_connections > self.database.max_connections {
            return Err(SettingsError::Invalid(
                "database.min_connections exceeds database.max_connections".into(),
            ));
        }
        match self.secret.strategy {
            Strategy::Bcrypt if !(4..=31).contains(&self.secret.bcrypt_cost) => {
                Err(SettingsError::Invalid(format!(
                    "secret.bcrypt_cost must be between 4 and 31, got {}",
                    self.secret.bcrypt_cost
                )))
            }
            Strategy::AesCbc => {
                if self.secret.static_salt.is_some() {
                    return Err(SettingsError::Invalid(
                        "secret.static_salt is not used by aes-cbc, remove it".into(),
                    ));
                }
                if self.secret.cipher_key.is_none() || self.secret.cipher_iv.is_none() {
                    return Err(SettingsError::Invalid(
                        "secret.cipher_key and secret.cipher_iv are required for aes-cbc".into(),
                    ));
                }
                let key = self.secret.cipher_key.as_deref().unwrap_or_default();
                let iv = self.secret.cipher_iv.as_deref().unwrap_or_default();
                CipherDeriver::from_base64(key, iv)
                    .map(|_| ())
                    .map_err(|e| SettingsError::Invalid(e.to_string()))
            }
            _ => Ok(()),
        }
    }
}
