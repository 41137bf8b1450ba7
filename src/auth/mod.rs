mod memory;
mod supabase;

pub use memory::MemoryAuth;
pub use supabase::SupabaseAuth;

use async_trait::async_trait;
use log::{ info, warn };
use std::error::Error;
use std::sync::Arc;
use thiserror::Error as ThisError;
use tokio::sync::RwLock;

use crate::cli::Args;
use crate::models::user::{ Caller, Session, User };
use crate::store::CopyStore;

pub const MIN_PASSWORD_LEN: usize = 6;

#[derive(Debug, ThisError)]
pub enum AuthError {
    #[error("Invalid login credentials")]
    InvalidCredentials,

    #[error("User already registered with this email")]
    AlreadyRegistered,

    #[error("Invalid or expired session")]
    InvalidToken,

    #[error("{0}")]
    Validation(String),

    #[error("auth backend error: {0}")]
    Backend(String),

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
}

pub(crate) fn validate_credentials(email: &str, password: &str) -> Result<(), AuthError> {
    if !email.contains('@') {
        return Err(AuthError::Validation("A valid email address is required".to_string()));
    }
    if password.chars().count() < MIN_PASSWORD_LEN {
        return Err(
            AuthError::Validation(
                format!("Password should be at least {} characters", MIN_PASSWORD_LEN)
            )
        );
    }
    Ok(())
}

/// Token part of an `Authorization: Bearer <token>` header value.
pub fn parse_bearer(value: &str) -> Option<&str> {
    let (scheme, token) = value.trim().split_once(' ')?;
    let token = token.trim();
    if !scheme.eq_ignore_ascii_case("bearer") || token.is_empty() {
        return None;
    }
    Some(token)
}

/// The hosted identity provider.
#[async_trait]
pub trait AuthProvider: Send + Sync {
    async fn sign_up(&self, email: &str, password: &str) -> Result<Session, AuthError>;

    async fn sign_in(&self, email: &str, password: &str) -> Result<Session, AuthError>;

    async fn sign_out(&self, access_token: &str) -> Result<(), AuthError>;

    /// Resolves an access token to its user.
    async fn get_user(&self, access_token: &str) -> Result<User, AuthError>;
}

/// Holds the signed-in session for one client and mirrors new users into the
/// public users table.
pub struct SessionContext {
    provider: Arc<dyn AuthProvider>,
    store: Arc<dyn CopyStore>,
    session: RwLock<Option<Session>>,
}

impl SessionContext {
    pub fn new(provider: Arc<dyn AuthProvider>, store: Arc<dyn CopyStore>) -> Self {
        Self { provider, store, session: RwLock::new(None) }
    }

    /// Restores a session from a bearer token, making sure the user row exists.
    pub async fn from_token(
        provider: Arc<dyn AuthProvider>,
        store: Arc<dyn CopyStore>,
        access_token: &str
    ) -> Result<Self, AuthError> {
        let user = provider.get_user(access_token).await?;
        let ctx = Self::new(provider, store);
        ctx.establish(Session {
            access_token: access_token.to_string(),
            user,
        }).await?;
        Ok(ctx)
    }

    pub async fn current_user(&self) -> Option<User> {
        self.session.read().await.as_ref().map(|s| s.user.clone())
    }

    pub async fn session(&self) -> Option<Session> {
        self.session.read().await.clone()
    }

    pub async fn caller(&self) -> Option<Caller> {
        self.session.read().await.as_ref().map(Caller::from)
    }

    pub async fn sign_in(&self, email: &str, password: &str) -> Result<User, AuthError> {
        let session = self.provider.sign_in(email, password).await?;
        self.establish(session).await
    }

    pub async fn sign_up(&self, email: &str, password: &str) -> Result<User, AuthError> {
        let session = self.provider.sign_up(email, password).await?;
        self.establish(session).await
    }

    pub async fn sign_out(&self) -> Result<(), AuthError> {
        let previous = self.session.write().await.take();
        if let Some(session) = previous {
            self.provider.sign_out(&session.access_token).await?;
            info!("User {} signed out", session.user.id);
        }
        Ok(())
    }

    async fn establish(&self, session: Session) -> Result<User, AuthError> {
        let caller = Caller::from(&session);
        self.store
            .ensure_user(&caller, &session.user).await
            .map_err(|e| {
                warn!("Failed to create user record for {}: {}", session.user.id, e);
                AuthError::Backend(
                    "Failed to create user record. Please try again or contact support.".to_string()
                )
            })?;
        let user = session.user.clone();
        *self.session.write().await = Some(session);
        Ok(user)
    }
}

pub fn create_auth_provider(args: &Args) -> Result<Arc<dyn AuthProvider>, Box<dyn Error + Send + Sync>> {
    match args.store_type.to_lowercase().as_str() {
        "memory" => Ok(Arc::new(MemoryAuth::new())),
        "supabase" => {
            let url = args.supabase_url
                .as_deref()
                .ok_or("SUPABASE_URL is required when STORE_TYPE=supabase")?;
            let anon_key = args.supabase_anon_key
                .as_deref()
                .ok_or("SUPABASE_ANON_KEY is required when STORE_TYPE=supabase")?;
            Ok(Arc::new(SupabaseAuth::new(url, anon_key)?))
        }
        other => Err(format!("Unsupported auth backend for store type: {}", other).into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    fn context() -> SessionContext {
        SessionContext::new(Arc::new(MemoryAuth::new()), Arc::new(MemoryStore::new()))
    }

    #[test]
    fn bearer_values() {
        assert_eq!(parse_bearer("Bearer abc"), Some("abc"));
        assert_eq!(parse_bearer("bearer   abc "), Some("abc"));
        assert_eq!(parse_bearer("Basic abc"), None);
        assert_eq!(parse_bearer("Bearer "), None);
        assert_eq!(parse_bearer("abc"), None);
    }

    #[tokio::test]
    async fn sign_up_sign_out_sign_in() {
        let ctx = context();
        assert!(ctx.current_user().await.is_none());

        let user = ctx.sign_up("ada@example.com", "secret-pass").await.unwrap();
        assert_eq!(ctx.current_user().await.unwrap().id, user.id);
        assert_eq!(ctx.caller().await.unwrap().user_id, user.id);

        ctx.sign_out().await.unwrap();
        assert!(ctx.current_user().await.is_none());
        // signing out twice is harmless
        ctx.sign_out().await.unwrap();

        let again = ctx.sign_in("ada@example.com", "secret-pass").await.unwrap();
        assert_eq!(again.id, user.id);
    }

    #[tokio::test]
    async fn failures_come_back_as_errors() {
        let ctx = context();
        ctx.sign_up("ada@example.com", "secret-pass").await.unwrap();
        ctx.sign_out().await.unwrap();

        assert!(matches!(ctx.sign_in("ada@example.com", "wrong-pass").await, Err(AuthError::InvalidCredentials)));
        assert!(
            matches!(ctx.sign_up("ADA@example.com", "secret-pass").await, Err(AuthError::AlreadyRegistered))
        );
        assert!(matches!(ctx.sign_up("bob@example.com", "123").await, Err(AuthError::Validation(_))));
        assert!(ctx.current_user().await.is_none());
    }

    #[tokio::test]
    async fn sign_in_mirrors_user_into_store() {
        let store = Arc::new(MemoryStore::new());
        let ctx = SessionContext::new(Arc::new(MemoryAuth::new()), store.clone());
        let user = ctx.sign_up("ada@example.com", "secret-pass").await.unwrap();
        let caller = ctx.caller().await.unwrap();
        assert_eq!(store.get_user(&caller, &user.id).await.unwrap().email, user.email);
    }

    #[tokio::test]
    async fn from_token_restores_the_session() {
        let provider: Arc<dyn AuthProvider> = Arc::new(MemoryAuth::new());
        let store: Arc<dyn CopyStore> = Arc::new(MemoryStore::new());
        let session = provider.sign_up("ada@example.com", "secret-pass").await.unwrap();

        let ctx = SessionContext::from_token(provider.clone(), store.clone(), &session.access_token)
            .await
            .unwrap();
        assert_eq!(ctx.current_user().await.unwrap().id, session.user.id);
        let caller = ctx.caller().await.unwrap();
        assert_eq!(caller.access_token.as_deref(), Some(session.access_token.as_str()));
        assert!(store.get_user(&caller, &session.user.id).await.is_ok());

        assert!(matches!(SessionContext::from_token(provider, store, "bogus").await, Err(AuthError::InvalidToken)));
    }
}
