use crate::auth::CredentialService;
use crate::errors::{Error, Result};
use crate::model::Account;
use crate::store::{AccountStore, SharedStore};
use argon2::password_hash::{
    rand_core::OsRng, Error as PasswordHashError, PasswordHash, PasswordHasher, PasswordVerifier,
    SaltString,
};
use argon2::Argon2;
use chrono::Utc;
use serde::Serialize;
use tracing::{info, warn};

/// Token handed back on successful register or login.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub token: String,
    pub user_id: String,
}

pub fn hash_password(password: &str) -> Result<String> {
    let salt = SaltString::generate(&mut OsRng);
    let hash = Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map_err(|e| Error::PasswordHash(e.to_string()))?;
    Ok(hash.to_string())
}

pub fn verify_password(expected_hash: &str, candidate: &str) -> Result<bool> {
    let parsed =
        PasswordHash::new(expected_hash).map_err(|e| Error::PasswordHash(e.to_string()))?;
    match Argon2::default().verify_password(candidate.as_bytes(), &parsed) {
        Ok(()) => Ok(true),
        Err(PasswordHashError::Password) => Ok(false),
        Err(e) => Err(Error::PasswordHash(e.to_string())),
    }
}

/// Registration and login on top of the account store.
pub struct AccountService {
    store: SharedStore,
    credentials: CredentialService,
}

impl AccountService {
    pub fn new(store: SharedStore, credentials: CredentialService) -> Self {
        Self { store, credentials }
    }

    pub fn credentials(&self) -> &CredentialService {
        &self.credentials
    }

    pub async fn register(&self, username: &str, password: &str) -> Result<Session> {
        if username.is_empty() || password.is_empty() {
            return Err(Error::BadRequest(
                "username and password are required".to_string(),
            ));
        }

        let account = Account {
            username: username.to_string(),
            credential_hash: hash_password(password)?,
            created_at: Utc::now(),
        };

        if !self.store.insert_account_if_absent(&account).await? {
            return Err(Error::Conflict(format!("account {}", username)));
        }

        info!("Account {} registered", username);
        self.session_for(username)
    }

    /// Unknown users and wrong passwords fail identically.
    pub async fn login(&self, username: &str, password: &str) -> Result<Session> {
        let denied = || Error::InvalidToken("invalid credentials".to_string());

        let account = self
            .store
            .find_account(username)
            .await?
            .ok_or_else(denied)?;

        if !verify_password(&account.credential_hash, password)? {
            warn!("Failed login for {}", username);
            return Err(denied());
        }

        self.session_for(&account.username)
    }

    fn session_for(&self, username: &str) -> Result<Session> {
        Ok(Session {
            token: self.credentials.issue(username)?,
            user_id: username.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryStore;
    use std::sync::Arc;

    fn service() -> AccountService {
        AccountService::new(
            Arc::new(MemoryStore::new()),
            CredentialService::new(Some("secret".to_string()), 24),
        )
    }

    #[test]
    fn test_password_hash_roundtrip() {
        let hash = hash_password("hunter2").unwrap();
        assert_ne!(hash, "hunter2");
        assert!(verify_password(&hash, "hunter2").unwrap());
        assert!(!verify_password(&hash, "hunter3").unwrap());
    }

    #[tokio::test]
    async fn test_register_then_login() {
        let service = service();
        let session = service.register("alice", "hunter2").await.unwrap();
        assert_eq!(session.user_id, "alice");
        assert_eq!(service.credentials().verify(&session.token).unwrap(), "alice");

        let session = service.login("alice", "hunter2").await.unwrap();
        assert_eq!(session.user_id, "alice");
    }

    #[tokio::test]
    async fn test_duplicate_username_conflicts() {
        let service = service();
        service.register("alice", "one").await.unwrap();
        let err = service.register("alice", "two").await.unwrap_err();
        assert!(matches!(err, Error::Conflict(_)));
    }

    #[tokio::test]
    async fn test_bad_credentials() {
        let service = service();
        service.register("alice", "hunter2").await.unwrap();

        assert!(matches!(
            service.login("alice", "wrong").await,
            Err(Error::InvalidToken(_))
        ));
        assert!(matches!(
            service.login("nobody", "hunter2").await,
            Err(Error::InvalidToken(_))
        ));
    }
}
