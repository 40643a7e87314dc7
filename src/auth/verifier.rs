use crate::auth::{AuthOutcome, CredentialStore, DenyReason, StoreError, UserInfo, UserRecord};
use crate::secret::{SecretDeriver, SecretError};
use rand::Rng;
use std::sync::Arc;
use tokio::sync::OnceCell;

const DECOY_PASSWORD_LEN: usize = 32;

#[derive(Debug, thiserror::Error)]
enum VerifyError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Secret(#[from] SecretError),
}

/// Checks credentials against the store and binds first-use passwords.
///
/// Cheap to clone: the store and the deriver are shared.
#[derive(Clone)]
pub struct Verifier {
    store: Arc<dyn CredentialStore>,
    deriver: Arc<dyn SecretDeriver>,
    first_use_provisioning: bool,
    // Secret of a random password, checked when the user does not exist so
    // that branch costs as much as a mismatch. Derived on first use.
    decoy: Arc<OnceCell<String>>,
}

impl Verifier {
    /// Creates a verifier over an opened store.
    pub fn new(
        store: Arc<dyn CredentialStore>,
        deriver: Arc<dyn SecretDeriver>,
        first_use_provisioning: bool,
    ) -> Verifier {
        Verifier {
            store,
            deriver,
            first_use_provisioning,
            decoy: Arc::new(OnceCell::new()),
        }
    }

    /// Looks up a user. Store faults are logged and read as "no such user".
    pub async fn users(&self, username: &str) -> Option<UserInfo> {
        match self.store.find(username).await {
            Ok(record) => record.map(user_info),
            Err(e) => {
                tracing::error!("lookup of user {} failed: {}", username, e);
                None
            }
        }
    }

    /// Verifies a username and password.
    ///
    /// An account without a secret gets `password` bound to it, when
    /// first-use provisioning is enabled. A bound secret is never replaced
    /// here.
    pub async fn authenticate(&self, username: &str, password: &str) -> AuthOutcome {
        let outcome = match self.decide(username, password).await {
            Ok(outcome) => outcome,
            Err(e) => {
                tracing::error!("authentication of {} failed: {}", username, e);
                AuthOutcome::Denied(DenyReason::InternalError)
            }
        };
        match &outcome {
            AuthOutcome::Granted(info) => {
                tracing::info!(
                    "user {} authenticated with permissions {}",
                    info.username,
                    info.permissions
                )
            }
            AuthOutcome::Denied(reason) => {
                tracing::warn!("authentication of {} denied: {}", username, reason)
            }
        }
        outcome
    }

    async fn decide(&self, username: &str, password: &str) -> Result<AuthOutcome, VerifyError> {
        let record = match self.store.find(username).await? {
            Some(record) => record,
            None => {
                self.burn_decoy(password).await;
                return Ok(AuthOutcome::Denied(DenyReason::NoSuchUser));
            }
        };

        match record.password.clone() {
            Some(stored) => Ok(self.check(record, password, &stored).await),
            None if !self.first_use_provisioning => {
                tracing::debug!("user {} has no password and provisioning is off", username);
                self.burn_decoy(password).await;
                Ok(AuthOutcome::Denied(DenyReason::BadPassword))
            }
            None => self.provision(record, password).await,
        }
    }

    async fn provision(
        &self,
        record: UserRecord,
        password: &str,
    ) -> Result<AuthOutcome, VerifyError> {
        let secret = self.deriver.derive(password).await?;
        if self
            .store
            .bind_secret_if_absent(&record.username, &secret)
            .await?
        {
            tracing::info!("bound first password for user {}", record.username);
            return Ok(AuthOutcome::Granted(user_info(record)));
        }

        // Someone else bound a secret between the read and the update.
        tracing::debug!("lost first-use race for user {}", record.username);
        match self.store.find(&record.username).await? {
            Some(current) => match current.password.clone() {
                Some(stored) => Ok(self.check(current, password, &stored).await),
                None => Ok(AuthOutcome::Denied(DenyReason::BadPassword)),
            },
            None => Ok(AuthOutcome::Denied(DenyReason::NoSuchUser)),
        }
    }

    async fn check(&self, record: UserRecord, password: &str, stored: &str) -> AuthOutcome {
        if self.deriver.verify(password, stored).await {
            AuthOutcome::Granted(user_info(record))
        } else {
            AuthOutcome::Denied(DenyReason::BadPassword)
        }
    }

    async fn burn_decoy(&self, password: &str) {
        let decoy = self
            .decoy
            .get_or_try_init(|| async {
                let random: String = rand::thread_rng()
                    .sample_iter(rand::distributions::Alphanumeric)
                    .take(DECOY_PASSWORD_LEN)
                    .map(char::from)
                    .collect();
                self.deriver.derive(&random).await
            })
            .await;
        match decoy {
            Ok(decoy) => {
                let _ = self.deriver.verify(password, decoy).await;
            }
            Err(e) => tracing::error!("cannot derive decoy secret, will retry: {}", e),
        }
    }
}

fn user_info(record: UserRecord) -> UserInfo {
    UserInfo {
        username: record.username,
        permissions: record.permissions,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::MemoryCredentialStore;
    use crate::secret::{BcryptDeriver, CipherDeriver};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct UnreachableStore;

    #[async_trait]
    impl CredentialStore for UnreachableStore {
        async fn find(&self, _: &str) -> Result<Option<UserRecord>, StoreError> {
            Err(StoreError::Database(sqlx::Error::PoolTimedOut))
        }

        async fn bind_secret_if_absent(&self, _: &str, _: &str) -> Result<bool, StoreError> {
            Err(StoreError::Database(sqlx::Error::PoolTimedOut))
        }

        async fn set_secret(&self, _: &str, _: Option<&str>) -> Result<bool, StoreError> {
            Err(StoreError::Database(sqlx::Error::PoolTimedOut))
        }

        async fn insert_user(&self, _: &str, _: &str) -> Result<(), StoreError> {
            Err(StoreError::Database(sqlx::Error::PoolTimedOut))
        }

        async fn remove_user(&self, _: &str) -> Result<bool, StoreError> {
            Err(StoreError::Database(sqlx::Error::PoolTimedOut))
        }
    }

    /// Reads fine, fails on every write.
    struct ReadOnlyStore(MemoryCredentialStore);

    #[async_trait]
    impl CredentialStore for ReadOnlyStore {
        async fn find(&self, username: &str) -> Result<Option<UserRecord>, StoreError> {
            self.0.find(username).await
        }

        async fn bind_secret_if_absent(&self, _: &str, _: &str) -> Result<bool, StoreError> {
            Err(StoreError::Database(sqlx::Error::PoolClosed))
        }

        async fn set_secret(&self, _: &str, _: Option<&str>) -> Result<bool, StoreError> {
            Err(StoreError::Database(sqlx::Error::PoolClosed))
        }

        async fn insert_user(&self, _: &str, _: &str) -> Result<(), StoreError> {
            Err(StoreError::Database(sqlx::Error::PoolClosed))
        }

        async fn remove_user(&self, _: &str) -> Result<bool, StoreError> {
            Err(StoreError::Database(sqlx::Error::PoolClosed))
        }
    }

    /// What another caller does to the record while this one is deriving.
    enum Rival {
        Binds(String),
        Removes,
        Resets,
    }

    /// Loses every conditional bind to `rival`.
    struct RacedStore {
        inner: MemoryCredentialStore,
        rival: Rival,
    }

    #[async_trait]
    impl CredentialStore for RacedStore {
        async fn find(&self, username: &str) -> Result<Option<UserRecord>, StoreError> {
            self.inner.find(username).await
        }

        async fn bind_secret_if_absent(
            &self,
            username: &str,
            _: &str,
        ) -> Result<bool, StoreError> {
            match &self.rival {
                Rival::Binds(secret) => {
                    self.inner.set_secret(username, Some(secret)).await?;
                }
                Rival::Removes => {
                    self.inner.remove_user(username).await?;
                }
                Rival::Resets => {
                    self.inner.set_secret(username, None).await?;
                }
            }
            Ok(false)
        }

        async fn set_secret(
            &self,
            username: &str,
            secret: Option<&str>,
        ) -> Result<bool, StoreError> {
            self.inner.set_secret(username, secret).await
        }

        async fn insert_user(&self, username: &str, permissions: &str) -> Result<(), StoreError> {
            self.inner.insert_user(username, permissions).await
        }

        async fn remove_user(&self, username: &str) -> Result<bool, StoreError> {
            self.inner.remove_user(username).await
        }
    }

    async fn raced(rival: Rival) -> Arc<RacedStore> {
        let inner = MemoryCredentialStore::new();
        inner.insert_user("alice", "read").await.unwrap();
        Arc::new(RacedStore { inner, rival })
    }

    /// Every derivation fails.
    #[derive(Default)]
    struct BrokenDeriver {
        derives: AtomicUsize,
    }

    #[async_trait]
    impl SecretDeriver for BrokenDeriver {
        async fn derive(&self, _: &str) -> Result<String, SecretError> {
            self.derives.fetch_add(1, Ordering::SeqCst);
            Err(SecretError::Hash("entropy exhausted".into()))
        }

        async fn verify(&self, _: &str, _: &str) -> bool {
            false
        }
    }

    async fn alice_store() -> Arc<MemoryCredentialStore> {
        let store = Arc::new(MemoryCredentialStore::new());
        store.insert_user("alice", "read").await.unwrap();
        store
    }

    fn bcrypt() -> Arc<dyn SecretDeriver> {
        Arc::new(BcryptDeriver::new(4, None))
    }

    fn alice() -> UserInfo {
        UserInfo {
            username: "alice".into(),
            permissions: "read".into(),
        }
    }

    #[tokio::test]
    async fn should_bind_first_password_and_reject_others() {
        let store = alice_store().await;
        let verifier = Verifier::new(store.clone(), bcrypt(), true);

        let outcome = verifier.authenticate("alice", "hunter2").await;
        assert_eq!(outcome, AuthOutcome::Granted(alice()));
        let secret = store.find("alice").await.unwrap().unwrap().password;
        assert!(secret.is_some());
        assert_ne!(secret.as_deref(), Some("hunter2"));

        let outcome = verifier.authenticate("alice", "wrong").await;
        assert_eq!(outcome, AuthOutcome::Denied(DenyReason::BadPassword));

        let outcome = verifier.authenticate("bob", "x").await;
        assert_eq!(outcome, AuthOutcome::Denied(DenyReason::NoSuchUser));
    }

    #[tokio::test]
    async fn should_not_mutate_bound_secret() {
        let store = alice_store().await;
        let verifier = Verifier::new(store.clone(), bcrypt(), true);
        assert!(verifier.authenticate("alice", "hunter2").await.is_granted());
        let bound = store.find("alice").await.unwrap().unwrap().password;

        for _ in 0..3 {
            let outcome = verifier.authenticate("alice", "hunter2").await;
            assert_eq!(outcome, AuthOutcome::Granted(alice()));
        }
        assert!(!verifier.authenticate("alice", "pw2").await.is_granted());
        assert_eq!(store.find("alice").await.unwrap().unwrap().password, bound);
    }

    #[tokio::test]
    async fn should_return_stored_permissions() {
        let store = Arc::new(MemoryCredentialStore::new());
        store.insert_user("carol", "read,write").await.unwrap();
        let deriver = bcrypt();
        let secret = deriver.derive("s3cret").await.unwrap();
        store.set_secret("carol", Some(&secret)).await.unwrap();

        let verifier = Verifier::new(store, deriver, true);
        let outcome = verifier.authenticate("carol", "s3cret").await;
        assert_eq!(
            outcome.into_user_info(),
            Some(UserInfo {
                username: "carol".into(),
                permissions: "read,write".into(),
            })
        );
    }

    #[tokio::test]
    async fn should_match_username_exactly() {
        let store = alice_store().await;
        let verifier = Verifier::new(store, bcrypt(), true);
        let outcome = verifier.authenticate("Alice", "hunter2").await;
        assert_eq!(outcome, AuthOutcome::Denied(DenyReason::NoSuchUser));
        assert!(verifier.users("Alice").await.is_none());
    }

    #[tokio::test]
    async fn should_accept_empty_first_password() {
        let store = alice_store().await;
        let verifier = Verifier::new(store, bcrypt(), true);
        assert!(verifier.authenticate("alice", "").await.is_granted());
        assert!(verifier.authenticate("alice", "").await.is_granted());
        assert!(!verifier.authenticate("alice", "x").await.is_granted());
    }

    #[tokio::test]
    async fn should_deny_unprovisioned_account_when_disabled() {
        let store = alice_store().await;
        let verifier = Verifier::new(store.clone(), bcrypt(), false);
        let outcome = verifier.authenticate("alice", "hunter2").await;
        assert_eq!(outcome, AuthOutcome::Denied(DenyReason::BadPassword));
        assert!(store.find("alice").await.unwrap().unwrap().password.is_none());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn should_bind_only_one_concurrent_first_password() {
        let store = alice_store().await;
        let verifier = Verifier::new(store.clone(), bcrypt(), true);

        let first = {
            let verifier = verifier.clone();
            tokio::spawn(async move { verifier.authenticate("alice", "pw1").await })
        };
        let second = {
            let verifier = verifier.clone();
            tokio::spawn(async move { verifier.authenticate("alice", "pw2").await })
        };
        let first = first.await.unwrap();
        let second = second.await.unwrap();

        assert_ne!(first.is_granted(), second.is_granted());
        let winner = if first.is_granted() { "pw1" } else { "pw2" };
        let loser = if first.is_granted() { &second } else { &first };
        assert_eq!(loser, &AuthOutcome::Denied(DenyReason::BadPassword));
        assert!(verifier.authenticate("alice", winner).await.is_granted());
    }

    #[tokio::test]
    async fn should_work_with_cipher_secrets() {
        let store = alice_store().await;
        let deriver: Arc<dyn SecretDeriver> = Arc::new(CipherDeriver::new([1; 32], [2; 16]));
        let verifier = Verifier::new(store.clone(), deriver.clone(), true);
        assert!(verifier.authenticate("alice", "hunter2").await.is_granted());
        let stored = store.find("alice").await.unwrap().unwrap().password.unwrap();
        assert_eq!(stored, deriver.derive("hunter2").await.unwrap());
        assert!(!verifier.authenticate("alice", "hunter3").await.is_granted());
    }

    #[tokio::test]
    async fn should_deny_when_store_is_unreachable() {
        let verifier = Verifier::new(Arc::new(UnreachableStore), bcrypt(), true);
        let outcome = verifier.authenticate("alice", "hunter2").await;
        assert_eq!(outcome, AuthOutcome::Denied(DenyReason::InternalError));
        assert!(verifier.users("alice").await.is_none());
    }

    #[tokio::test]
    async fn should_deny_when_binding_fails() {
        let inner = MemoryCredentialStore::new();
        inner.insert_user("alice", "read").await.unwrap();
        let verifier = Verifier::new(Arc::new(ReadOnlyStore(inner)), bcrypt(), true);
        let outcome = verifier.authenticate("alice", "hunter2").await;
        assert_eq!(outcome, AuthOutcome::Denied(DenyReason::InternalError));
    }

    #[tokio::test]
    async fn should_look_up_users() {
        let store = alice_store().await;
        let verifier = Verifier::new(store, bcrypt(), true);
        assert_eq!(verifier.users("alice").await, Some(alice()));
        assert_eq!(verifier.users("bob").await, None);
    }

    #[tokio::test]
    async fn should_verify_against_rival_secret_after_losing_bind() {
        let deriver = bcrypt();
        let rival_secret = deriver.derive("pw1").await.unwrap();

        let store = raced(Rival::Binds(rival_secret.clone())).await;
        let verifier = Verifier::new(store.clone(), deriver.clone(), true);
        assert_eq!(
            verifier.authenticate("alice", "pw1").await,
            AuthOutcome::Granted(alice())
        );
        let bound = store.find("alice").await.unwrap().unwrap().password;
        assert_eq!(bound, Some(rival_secret.clone()));

        let store = raced(Rival::Binds(rival_secret.clone())).await;
        let verifier = Verifier::new(store.clone(), deriver, true);
        assert_eq!(
            verifier.authenticate("alice", "pw2").await,
            AuthOutcome::Denied(DenyReason::BadPassword)
        );
        let bound = store.find("alice").await.unwrap().unwrap().password;
        assert_eq!(bound, Some(rival_secret));
    }

    #[tokio::test]
    async fn should_deny_when_record_vanishes_during_bind() {
        let verifier = Verifier::new(raced(Rival::Removes).await, bcrypt(), true);
        assert_eq!(
            verifier.authenticate("alice", "pw1").await,
            AuthOutcome::Denied(DenyReason::NoSuchUser)
        );
    }

    #[tokio::test]
    async fn should_deny_when_record_is_reset_during_bind() {
        let store = raced(Rival::Resets).await;
        let verifier = Verifier::new(store.clone(), bcrypt(), true);
        assert_eq!(
            verifier.authenticate("alice", "pw1").await,
            AuthOutcome::Denied(DenyReason::BadPassword)
        );
        assert!(store.find("alice").await.unwrap().unwrap().password.is_none());
    }

    #[tokio::test]
    async fn should_deny_when_derivation_fails() {
        let store = alice_store().await;
        let deriver = Arc::new(BrokenDeriver::default());
        let verifier = Verifier::new(store.clone(), deriver, true);
        assert_eq!(
            verifier.authenticate("alice", "hunter2").await,
            AuthOutcome::Denied(DenyReason::InternalError)
        );
        assert!(store.find("alice").await.unwrap().unwrap().password.is_none());
    }

    #[tokio::test]
    async fn should_retry_decoy_after_failed_derivation() {
        let deriver = Arc::new(BrokenDeriver::default());
        let verifier = Verifier::new(alice_store().await, deriver.clone(), true);
        for _ in 0..2 {
            assert_eq!(
                verifier.authenticate("bob", "x").await,
                AuthOutcome::Denied(DenyReason::NoSuchUser)
            );
        }
        assert_eq!(deriver.derives.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn should_derive_decoy_once() {
        let store = alice_store().await;
        let verifier = Verifier::new(store, bcrypt(), true);
        verifier.authenticate("bob", "x").await;
        verifier.authenticate("carol", "y").await;
        assert!(verifier.decoy.get().is_some());
    }

    #[tokio::test]
    async fn should_reject_long_password_differing_in_last_byte() {
        let store = alice_store().await;
        let deriver: Arc<dyn SecretDeriver> =
            Arc::new(BcryptDeriver::new(4, Some("pepper".into())));
        let verifier = Verifier::new(store, deriver, true);
        let base = "a".repeat(72);
        let bound = verifier.authenticate("alice", &format!("{}X", base)).await;
        assert!(bound.is_granted());
        assert_eq!(
            verifier.authenticate("alice", &format!("{}Y", base)).await,
            AuthOutcome::Denied(DenyReason::BadPassword)
        );
        assert_eq!(
            verifier.authenticate("alice", &base).await,
            AuthOutcome::Denied(DenyReason::BadPassword)
        );
    }
}
