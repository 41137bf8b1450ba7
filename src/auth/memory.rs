use async_trait::async_trait;
use chrono::Utc;
use sha2::{ Digest, Sha256 };
use std::collections::HashMap;
use tokio::sync::RwLock;
use uuid::Uuid;

use super::{ validate_credentials, AuthError, AuthProvider };
use crate::models::user::{ Session, User };

struct Account {
    user: User,
    salt: String,
    password_hash: String,
}

#[derive(Default)]
struct Accounts {
    by_email: HashMap<String, Account>,
    // access token -> user id
    tokens: HashMap<String, String>,
}

/// Local accounts for tests and single-node runs.
#[derive(Default)]
pub struct MemoryAuth {
    accounts: RwLock<Accounts>,
}

fn hash_password(salt: &str, password: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(salt.as_bytes());
    hasher.update(password.as_bytes());
    hex::encode(hasher.finalize())
}

/// Replaces any token the user already holds.
fn issue_token(accounts: &mut Accounts, user: &User) -> Session {
    accounts.tokens.retain(|_, user_id| user_id != &user.id);
    let access_token = Uuid::new_v4().to_string();
    accounts.tokens.insert(access_token.clone(), user.id.clone());
    Session { access_token, user: user.clone() }
}

impl MemoryAuth {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl AuthProvider for MemoryAuth {
    async fn sign_up(&self, email: &str, password: &str) -> Result<Session, AuthError> {
        validate_credentials(email, password)?;
        let key = email.trim().to_lowercase();

        let mut accounts = self.accounts.write().await;
        if accounts.by_email.contains_key(&key) {
            return Err(AuthError::AlreadyRegistered);
        }

        let salt = Uuid::new_v4().simple().to_string();
        let user = User {
            id: Uuid::new_v4().to_string(),
            email: Some(key.clone()),
            created_at: Utc::now(),
        };
        let password_hash = hash_password(&salt, password);
        accounts.by_email.insert(key, Account { user: user.clone(), salt, password_hash });
        Ok(issue_token(&mut accounts, &user))
    }

    async fn sign_in(&self, email: &str, password: &str) -> Result<Session, AuthError> {
        let key = email.trim().to_lowercase();
        let mut accounts = self.accounts.write().await;
        let user = match accounts.by_email.get(&key) {
            Some(account) if hash_password(&account.salt, password) == account.password_hash =>
                account.user.clone(),
            _ => {
                return Err(AuthError::InvalidCredentials);
            }
        };
        Ok(issue_token(&mut accounts, &user))
    }

    async fn sign_out(&self, access_token: &str) -> Result<(), AuthError> {
        self.accounts.write().await.tokens.remove(access_token);
        Ok(())
    }

    async fn get_user(&self, access_token: &str) -> Result<User, AuthError> {
        let accounts = self.accounts.read().await;
        let user_id = accounts.tokens.get(access_token).ok_or(AuthError::InvalidToken)?;
        accounts.by_email
            .values()
            .find(|a| &a.user.id == user_id)
            .map(|a| a.user.clone())
            .ok_or(AuthError::InvalidToken)
    }
}
