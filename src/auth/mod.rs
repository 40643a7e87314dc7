/// Module containing the credential verification logic and its store.

mod handlers;
mod store;
mod verifier;

pub use handlers::{check_credentials, lookup_user, Credentials};
pub use store::{CredentialStore, MemoryCredentialStore, PgCredentialStore, StoreError, UserRecord};
pub use verifier::Verifier;

use serde::{Deserialize, Serialize};

/// What the host learns about a user: the name and the opaque permissions
/// token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserInfo {
    /// The username.
    pub username: String,
    /// Permissions token, interpreted by the host only.
    pub permissions: String,
}

/// Why a login was refused. Only ever logged, never shown to the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DenyReason {
    /// No record for the username.
    NoSuchUser,
    /// The password does not match the bound secret.
    BadPassword,
    /// The store or the secret derivation failed.
    InternalError,
}

impl std::fmt::Display for DenyReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let reason = match self {
            DenyReason::NoSuchUser => "no such user",
            DenyReason::BadPassword => "bad password",
            DenyReason::InternalError => "internal error",
        };
        f.write_str(reason)
    }
}

/// Result of an authentication attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthOutcome {
    /// Credentials accepted.
    Granted(UserInfo),
    /// Credentials refused.
    Denied(DenyReason),
}

impl AuthOutcome {
    /// The user info on success. Every denial looks the same from here.
    pub fn into_user_info(self) -> Option<UserInfo> {
        match self {
            AuthOutcome::Granted(info) => Some(info),
            AuthOutcome::Denied(_) => None,
        }
    }

    /// Whether the credentials were accepted.
    pub fn is_granted(&self) -> bool {
        matches!(self, AuthOutcome::Granted(_))
    }
}
