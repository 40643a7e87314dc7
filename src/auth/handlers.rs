use crate::auth::{UserInfo, Verifier};
use axum::{extract::Path, Extension, Json};
use serde::Deserialize;

/// Body of a login attempt.
#[derive(Deserialize)]
pub struct Credentials {
    /// Username to check.
    pub username: String,
    /// Candidate password.
    pub password: String,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .finish_non_exhaustive()
    }
}

/// `GET /users/:username`. Replies `null` for unknown users.
pub async fn lookup_user(
    Path(username): Path<String>,
    Extension(verifier): Extension<Verifier>,
) -> Json<Option<UserInfo>> {
    Json(verifier.users(&username).await)
}

/// `POST /authenticate`. Replies `null` on any denial.
pub async fn check_credentials(
    Extension(verifier): Extension<Verifier>,
    Json(credentials): Json<Credentials>,
) -> Json<Option<UserInfo>> {
    tracing::debug!("login attempt for {}", credentials.username);
    let outcome = verifier
        .authenticate(&credentials.username, &credentials.password)
        .await;
    Json(outcome.into_user_info())
}
