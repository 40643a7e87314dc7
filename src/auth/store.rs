use crate::settings::Database;
use async_trait::async_trait;
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::Row;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::Instrument;

const UNIQUE_VIOLATION: &str = "23505";

/// Errors raised by a credential store.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// The database could not be reached or the query failed.
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    /// A record with this username already exists.
    #[error("user {0} already exists")]
    Duplicate(String),
}

/// A row of the `users` table.
#[derive(Clone, PartialEq, Eq)]
pub struct UserRecord {
    /// Unique username.
    pub username: String,
    /// Derived secret, `None` until a password is bound.
    pub password: Option<String>,
    /// Opaque permissions token.
    pub permissions: String,
}

impl std::fmt::Debug for UserRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UserRecord")
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .field("permissions", &self.permissions)
            .finish()
    }
}

impl UserRecord {
    fn from_row(row: &PgRow) -> sqlx::Result<UserRecord> {
        Ok(UserRecord {
            username: row.try_get("username")?,
            password: row.try_get("password")?,
            permissions: row.try_get("permissions")?,
        })
    }
}

/// Access to the table holding usernames, secrets and permissions.
#[async_trait]
pub trait CredentialStore: Send + Sync {
    /// Fetches the record with exactly this username.
    async fn find(&self, username: &str) -> Result<Option<UserRecord>, StoreError>;

    /// Stores `secret` only if the record exists and has no secret yet.
    /// Returns whether the secret was written.
    async fn bind_secret_if_absent(&self, username: &str, secret: &str)
        -> Result<bool, StoreError>;

    /// Overwrites or clears the secret. Returns whether the record exists.
    async fn set_secret(&self, username: &str, secret: Option<&str>) -> Result<bool, StoreError>;

    /// Creates a record with no secret.
    async fn insert_user(&self, username: &str, permissions: &str) -> Result<(), StoreError>;

    /// Deletes a record. Returns whether it existed.
    async fn remove_user(&self, username: &str) -> Result<bool, StoreError>;

    /// Releases the underlying connections.
    async fn close(&self) {}
}

/// Postgres backed store sharing a bounded connection pool.
#[derive(Clone)]
pub struct PgCredentialStore {
    pool: PgPool,
}

fn query_span(operation: &'static str, statement: &'static str) -> tracing::Span {
    tracing::debug_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = operation,
        db.statement = statement
    )
}

impl PgCredentialStore {
    /// Wraps an existing pool.
    pub fn new(pool: PgPool) -> PgCredentialStore {
        PgCredentialStore { pool }
    }

    /// Opens the pool described by the database settings.
    pub async fn connect(database: &Database) -> Result<PgCredentialStore, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(database.max_connections)
            .min_connections(database.min_connections)
            .acquire_timeout(Duration::from_secs(database.acquire_timeout_secs))
            .idle_timeout(Duration::from_secs(database.idle_timeout_secs))
            .connect(&database.url)
            .await?;
        Ok(PgCredentialStore { pool })
    }

    /// Applies the bundled schema migrations.
    pub async fn migrate(&self) -> Result<(), sqlx::migrate::MigrateError> {
        sqlx::migrate!("database/migrations").run(&self.pool).await
    }
}

#[async_trait]
impl CredentialStore for PgCredentialStore {
    async fn find(&self, username: &str) -> Result<Option<UserRecord>, StoreError> {
        let query = "SELECT username, password, permissions FROM users WHERE username = $1";
        let row = sqlx::query(query)
            .bind(username)
            .fetch_optional(&self.pool)
            .instrument(query_span("SELECT", query))
            .await?;
        Ok(row.as_ref().map(UserRecord::from_row).transpose()?)
    }

    async fn bind_secret_if_absent(
        &self,
        username: &str,
        secret: &str,
    ) -> Result<bool, StoreError> {
        let query = r"
            UPDATE users SET password = $2
            WHERE username = $1 AND password IS NULL
        ";
        let res = sqlx::query(query)
            .bind(username)
            .bind(secret)
            .execute(&self.pool)
            .instrument(query_span("UPDATE", query))
            .await?;
        Ok(res.rows_affected() == 1)
    }

    async fn set_secret(&self, username: &str, secret: Option<&str>) -> Result<bool, StoreError> {
        let query = "UPDATE users SET password = $2 WHERE username = $1";
        let res = sqlx::query(query)
            .bind(username)
            .bind(secret)
            .execute(&self.pool)
            .instrument(query_span("UPDATE", query))
            .await?;
        Ok(res.rows_affected() == 1)
    }

    async fn insert_user(&self, username: &str, permissions: &str) -> Result<(), StoreError> {
        let query = "INSERT INTO users (username, permissions) VALUES ($1, $2)";
        sqlx::query(query)
            .bind(username)
            .bind(permissions)
            .execute(&self.pool)
            .instrument(query_span("INSERT", query))
            .await
            .map_err(|e| match e {
                sqlx::Error::Database(ref db) if db.code().as_deref() == Some(UNIQUE_VIOLATION) => {
                    StoreError::Duplicate(username.to_string())
                }
                e => StoreError::Database(e),
            })?;
        Ok(())
    }

    async fn remove_user(&self, username: &str) -> Result<bool, StoreError> {
        let query = "DELETE FROM users WHERE username = $1";
        let res = sqlx::query(query)
            .bind(username)
            .execute(&self.pool)
            .instrument(query_span("DELETE", query))
            .await?;
        Ok(res.rows_affected() == 1)
    }

    async fn close(&self) {
        self.pool.close().await;
    }
}

/// In-process store. Used for development mode and tests.
#[derive(Debug, Default)]
pub struct MemoryCredentialStore {
    users: RwLock<HashMap<String, UserRecord>>,
}

impl MemoryCredentialStore {
    /// Creates an empty store.
    pub fn new() -> MemoryCredentialStore {
        MemoryCredentialStore::default()
    }
}

#[async_trait]
impl CredentialStore for MemoryCredentialStore {
    async fn find(&self, username: &str) -> Result<Option<UserRecord>, StoreError> {
        Ok(self.users.read().await.get(username).cloned())
    }

    async fn bind_secret_if_absent(
        &self,
        username: &str,
        secret: &str,
    ) -> Result<bool, StoreError> {
        let mut users = self.users.write().await;
        match users.get_mut(username) {
            Some(record) if record.password.is_none() => {
                record.password = Some(secret.to_string());
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn set_secret(&self, username: &str, secret: Option<&str>) -> Result<bool, StoreError> {
        let mut users = self.users.write().await;
        match users.get_mut(username) {
            Some(record) => {
                record.password = secret.map(str::to_string);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn insert_user(&self, username: &str, permissions: &str) -> Result<(), StoreError> {
        let mut users = self.users.write().await;
        if users.contains_key(username) {
            return Err(StoreError::Duplicate(username.to_string()));
        }
        users.insert(
            username.to_string(),
            UserRecord {
                username: username.to_string(),
                password: None,
                permissions: permissions.to_string(),
            },
        );
        Ok(())
    }

    async fn remove_user(&self, username: &str) -> Result<bool, StoreError> {
        Ok(self.users.write().await.remove(username).is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn should_bind_secret_only_once() {
        let store = MemoryCredentialStore::new();
        store.insert_user("alice", "read").await.unwrap();
        assert!(store.bind_secret_if_absent("alice", "first").await.unwrap());
        assert!(!store.bind_secret_if_absent("alice", "second").await.unwrap());
        let record = store.find("alice").await.unwrap().unwrap();
        assert_eq!(record.password.as_deref(), Some("first"));
    }

    #[tokio::test]
    async fn should_not_bind_unknown_user() {
        let store = MemoryCredentialStore::new();
        assert!(!store.bind_secret_if_absent("bob", "x").await.unwrap());
        assert!(store.find("bob").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn should_refuse_duplicate_user() {
        let store = MemoryCredentialStore::new();
        store.insert_user("alice", "read").await.unwrap();
        let res = store.insert_user("alice", "read,write").await;
        assert!(matches!(res, Err(StoreError::Duplicate(name)) if name == "alice"));
    }

    #[tokio::test]
    async fn should_reset_and_remove() {
        let store = MemoryCredentialStore::new();
        store.insert_user("alice", "read").await.unwrap();
        assert!(store.set_secret("alice", Some("s")).await.unwrap());
        assert!(store.set_secret("alice", None).await.unwrap());
        assert!(store.find("alice").await.unwrap().unwrap().password.is_none());
        assert!(store.remove_user("alice").await.unwrap());
        assert!(!store.remove_user("alice").await.unwrap());
        assert!(!store.set_secret("alice", None).await.unwrap());
    }

    #[test]
    fn should_redact_secret_in_debug() {
        let record = UserRecord {
            username: "alice".into(),
            password: Some("$2b$10$secret".into()),
            permissions: "read".into(),
        };
        let printed = format!("{:?}", record);
        assert!(!printed.contains("secret"));
        assert!(printed.contains("<redacted>"));
    }
}
