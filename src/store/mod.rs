mod memory;
mod supabase;

pub use memory::MemoryStore;
pub use supabase::SupabaseStore;

use async_trait::async_trait;
use log::info;
use std::error::Error;
use std::sync::Arc;
use thiserror::Error as ThisError;

use crate::cli::Args;
use crate::models::chat::{ Chat, ChatUpdate, ChatWithMessages, Message, MessageRole };
use crate::models::profile::{ BusinessProfile, BusinessProfileUpdate, NewBusinessProfile };
use crate::models::user::{ Caller, User };

#[derive(Debug, ThisError)]
pub enum StoreError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("invalid input: {0}")]
    Validation(String),

    #[error("backend error: {0}")]
    Backend(String),

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Persistence for users, chats, messages and business profiles.
///
/// Every call carries the [`Caller`]; operations on a chat or profile owned by
/// somebody else fail with [`StoreError::PermissionDenied`] before anything is
/// written.
#[async_trait]
pub trait CopyStore: Send + Sync {
    async fn ensure_user(&self, caller: &Caller, user: &User) -> StoreResult<()>;

    async fn get_user(&self, caller: &Caller, user_id: &str) -> StoreResult<User>;

    /// Newest first.
    async fn list_chats(&self, caller: &Caller) -> StoreResult<Vec<Chat>>;

    /// Messages come back ordered by creation time.
    async fn get_chat(&self, caller: &Caller, chat_id: &str) -> StoreResult<ChatWithMessages>;

    async fn create_chat(
        &self,
        caller: &Caller,
        title: &str,
        framework_id: &str,
        business_profile_id: Option<&str>
    ) -> StoreResult<Chat>;

    async fn update_chat(
        &self,
        caller: &Caller,
        chat_id: &str,
        update: &ChatUpdate
    ) -> StoreResult<Chat>;

    async fn archive_chat(&self, caller: &Caller, chat_id: &str) -> StoreResult<()> {
        let update = ChatUpdate { archived: Some(true), ..Default::default() };
        self.update_chat(caller, chat_id, &update).await.map(|_| ())
    }

    /// Removes the chat together with its messages.
    async fn delete_chat(&self, caller: &Caller, chat_id: &str) -> StoreResult<()>;

    async fn add_message(
        &self,
        caller: &Caller,
        chat_id: &str,
        role: MessageRole,
        content: &str
    ) -> StoreResult<Message>;

    async fn get_chat_messages(&self, caller: &Caller, chat_id: &str) -> StoreResult<Vec<Message>>;

    /// Newest first.
    async fn list_profiles(&self, caller: &Caller) -> StoreResult<Vec<BusinessProfile>>;

    async fn get_profile(&self, caller: &Caller, profile_id: &str) -> StoreResult<BusinessProfile>;

    async fn get_default_profile(&self, caller: &Caller) -> StoreResult<Option<BusinessProfile>>;

    /// The first profile of a user is always the default.
    async fn create_profile(
        &self,
        caller: &Caller,
        profile: &NewBusinessProfile
    ) -> StoreResult<BusinessProfile>;

    async fn update_profile(
        &self,
        caller: &Caller,
        profile_id: &str,
        update: &BusinessProfileUpdate
    ) -> StoreResult<BusinessProfile>;

    /// Deleting the default hands the flag to one of the remaining profiles.
    async fn delete_profile(&self, caller: &Caller, profile_id: &str) -> StoreResult<()>;

    /// Unsets every other default first.
    async fn set_default_profile(&self, caller: &Caller, profile_id: &str) -> StoreResult<()>;
}

pub(crate) fn validate_profile_name(name: &str) -> StoreResult<()> {
    if name.trim().is_empty() {
        return Err(StoreError::Validation("Business name is required".to_string()));
    }
    Ok(())
}

pub fn create_store(args: &Args) -> Result<Arc<dyn CopyStore>, Box<dyn Error + Send + Sync>> {
    match args.store_type.to_lowercase().as_str() {
        "memory" => Ok(Arc::new(MemoryStore::new())),
        "supabase" => {
            let url = args.supabase_url
                .as_deref()
                .ok_or("SUPABASE_URL is required when STORE_TYPE=supabase")?;
            let anon_key = args.supabase_anon_key
                .as_deref()
                .ok_or("SUPABASE_ANON_KEY is required when STORE_TYPE=supabase")?;
            Ok(Arc::new(SupabaseStore::new(url, anon_key)?))
        }
        _ =>
            Err(
                Box::new(
                    std::io::Error::new(
                        std::io::ErrorKind::InvalidInput,
                        format!("Unsupported store type: {}", args.store_type)
                    )
                )
            ),
    }
}

pub fn initialize_store(args: &Args) -> Result<Arc<dyn CopyStore>, Box<dyn Error + Send + Sync>> {
    match &args.supabase_url {
        Some(url) if args.store_type.eq_ignore_ascii_case("supabase") => {
            info!("Chats and profiles will be stored in: supabase at {}", url);
        }
        _ => info!("Chats and profiles will be stored in: {}", args.store_type),
    }
    create_store(args)
}
