use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::RwLock;
use uuid::Uuid;

use super::{ validate_profile_name, CopyStore, StoreError, StoreResult };
use crate::models::chat::{ Chat, ChatUpdate, ChatWithMessages, Message, MessageRole };
use crate::models::profile::{ BusinessProfile, BusinessProfileUpdate, NewBusinessProfile };
use crate::models::user::{ Caller, User };

#[derive(Default)]
struct Tables {
    users: Vec<User>,
    chats: Vec<Chat>,
    messages: Vec<Message>,
    profiles: Vec<BusinessProfile>,
}

impl Tables {
    fn owned_chat_index(&self, caller: &Caller, chat_id: &str) -> StoreResult<usize> {
        let idx = self.chats
            .iter()
            .position(|c| c.id == chat_id)
            .ok_or_else(|| StoreError::NotFound(format!("chat {}", chat_id)))?;
        if self.chats[idx].user_id != caller.user_id {
            return Err(StoreError::PermissionDenied(format!("chat {} belongs to another user", chat_id)));
        }
        Ok(idx)
    }

    fn owned_profile_index(&self, caller: &Caller, profile_id: &str) -> StoreResult<usize> {
        let idx = self.profiles
            .iter()
            .position(|p| p.id == profile_id)
            .ok_or_else(|| StoreError::NotFound(format!("business profile {}", profile_id)))?;
        if self.profiles[idx].user_id != caller.user_id {
            return Err(
                StoreError::PermissionDenied(format!("business profile {} belongs to another user", profile_id))
            );
        }
        Ok(idx)
    }

    fn messages_for(&self, chat_id: &str) -> Vec<Message> {
        let mut messages: Vec<Message> = self.messages
            .iter()
            .filter(|m| m.chat_id == chat_id)
            .cloned()
            .collect();
        messages.sort_by_key(|m| m.created_at);
        messages
    }

    fn unset_defaults(&mut self, user_id: &str) {
        let now = Utc::now();
        for p in self.profiles.iter_mut().filter(|p| p.user_id == user_id && p.is_default) {
            p.is_default = false;
            p.updated_at = now;
        }
    }

    /// Newest-first positions of a user's profiles.
    fn profile_indices_newest_first(&self, user_id: &str) -> Vec<usize> {
        (0..self.profiles.len())
            .rev()
            .filter(|&i| self.profiles[i].user_id == user_id)
            .collect()
    }
}

/// Process-local store. Each call takes the table lock once, so the
/// multi-step default-profile rules are atomic here.
#[derive(Default)]
pub struct MemoryStore {
    tables: RwLock<Tables>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CopyStore for MemoryStore {
    async fn ensure_user(&self, _caller: &Caller, user: &User) -> StoreResult<()> {
        let mut tables = self.tables.write().await;
        if !tables.users.iter().any(|u| u.id == user.id) {
            tables.users.push(user.clone());
        }
        Ok(())
    }

    async fn get_user(&self, _caller: &Caller, user_id: &str) -> StoreResult<User> {
        let tables = self.tables.read().await;
        tables.users
            .iter()
            .find(|u| u.id == user_id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(format!("user {}", user_id)))
    }

    async fn list_chats(&self, caller: &Caller) -> StoreResult<Vec<Chat>> {
        let tables = self.tables.read().await;
        Ok(
            tables.chats
                .iter()
                .rev()
                .filter(|c| c.user_id == caller.user_id)
                .cloned()
                .collect()
        )
    }

    async fn get_chat(&self, caller: &Caller, chat_id: &str) -> StoreResult<ChatWithMessages> {
        let tables = self.tables.read().await;
        let idx = tables.owned_chat_index(caller, chat_id)?;
        Ok(ChatWithMessages {
            chat: tables.chats[idx].clone(),
            messages: tables.messages_for(chat_id),
        })
    }

    async fn create_chat(
        &self,
        caller: &Caller,
        title: &str,
        framework_id: &str,
        business_profile_id: Option<&str>
    ) -> StoreResult<Chat> {
        let mut tables = self.tables.write().await;
        if let Some(profile_id) = business_profile_id {
            tables.owned_profile_index(caller, profile_id)?;
        }
        let now = Utc::now();
        let chat = Chat {
            id: Uuid::new_v4().to_string(),
            user_id: caller.user_id.clone(),
            title: title.to_string(),
            framework: framework_id.to_string(),
            business_profile_id: business_profile_id.map(str::to_string),
            archived: false,
            created_at: now,
            updated_at: now,
        };
        tables.chats.push(chat.clone());
        Ok(chat)
    }

    async fn update_chat(
        &self,
        caller: &Caller,
        chat_id: &str,
        update: &ChatUpdate
    ) -> StoreResult<Chat> {
        let mut tables = self.tables.write().await;
        let idx = tables.owned_chat_index(caller, chat_id)?;
        if let Some(Some(profile_id)) = &update.business_profile_id {
            tables.owned_profile_index(caller, profile_id)?;
        }

        let chat = &mut tables.chats[idx];
        if let Some(title) = &update.title {
            chat.title = title.clone();
        }
        if let Some(framework) = &update.framework {
            chat.framework = framework.clone();
        }
        if let Some(profile_id) = &update.business_profile_id {
            chat.business_profile_id = profile_id.clone();
        }
        if let Some(archived) = update.archived {
            chat.archived = archived;
        }
        chat.updated_at = Utc::now();
        Ok(chat.clone())
    }

    async fn delete_chat(&self, caller: &Caller, chat_id: &str) -> StoreResult<()> {
        let mut tables = self.tables.write().await;
        let idx = tables.owned_chat_index(caller, chat_id)?;
        tables.messages.retain(|m| m.chat_id != chat_id);
        tables.chats.remove(idx);
        Ok(())
    }

    async fn add_message(
        &self,
        caller: &Caller,
        chat_id: &str,
        role: MessageRole,
        content: &str
    ) -> StoreResult<Message> {
        let mut tables = self.tables.write().await;
        tables
            .owned_chat_index(caller, chat_id)
            .map_err(|e| match e {
                StoreError::NotFound(_) | StoreError::PermissionDenied(_) =>
                    StoreError::PermissionDenied(
                        "You do not have permission to add messages to this chat".to_string()
                    ),
                other => other,
            })?;
        let message = Message {
            id: Uuid::new_v4().to_string(),
            chat_id: chat_id.to_string(),
            role,
            content: content.to_string(),
            created_at: Utc::now(),
        };
        tables.messages.push(message.clone());
        Ok(message)
    }

    async fn get_chat_messages(&self, caller: &Caller, chat_id: &str) -> StoreResult<Vec<Message>> {
        let tables = self.tables.read().await;
        tables.owned_chat_index(caller, chat_id)?;
        Ok(tables.messages_for(chat_id))
    }

    async fn list_profiles(&self, caller: &Caller) -> StoreResult<Vec<BusinessProfile>> {
        let tables = self.tables.read().await;
        Ok(
            tables
                .profile_indices_newest_first(&caller.user_id)
                .into_iter()
                .map(|i| tables.profiles[i].clone())
                .collect()
        )
    }

    async fn get_profile(&self, caller: &Caller, profile_id: &str) -> StoreResult<BusinessProfile> {
        let tables = self.tables.read().await;
        let idx = tables.owned_profile_index(caller, profile_id)?;
        Ok(tables.profiles[idx].clone())
    }

    async fn get_default_profile(&self, caller: &Caller) -> StoreResult<Option<BusinessProfile>> {
        let tables = self.tables.read().await;
        Ok(
            tables.profiles
                .iter()
                .find(|p| p.user_id == caller.user_id && p.is_default)
                .cloned()
        )
    }

    async fn create_profile(
        &self,
        caller: &Caller,
        profile: &NewBusinessProfile
    ) -> StoreResult<BusinessProfile> {
        validate_profile_name(&profile.name)?;
        let mut tables = self.tables.write().await;
        let is_first = !tables.profiles.iter().any(|p| p.user_id == caller.user_id);
        let is_default = is_first || profile.is_default;
        if is_default {
            tables.unset_defaults(&caller.user_id);
        }

        let now = Utc::now();
        let created = BusinessProfile {
            id: Uuid::new_v4().to_string(),
            user_id: caller.user_id.clone(),
            name: profile.name.trim().to_string(),
            industry: profile.industry.clone(),
            target_audience: profile.target_audience.clone(),
            unique_value_proposition: profile.unique_value_proposition.clone(),
            pain_points: profile.pain_points.clone(),
            brand_voice: profile.brand_voice.clone(),
            is_default,
            created_at: now,
            updated_at: now,
        };
        tables.profiles.push(created.clone());
        Ok(created)
    }

    async fn update_profile(
        &self,
        caller: &Caller,
        profile_id: &str,
        update: &BusinessProfileUpdate
    ) -> StoreResult<BusinessProfile> {
        if let Some(name) = &update.name {
            validate_profile_name(name)?;
        }
        let mut tables = self.tables.write().await;
        let idx = tables.owned_profile_index(caller, profile_id)?;
        if update.is_default == Some(true) {
            tables.unset_defaults(&caller.user_id);
        }

        let profile = &mut tables.profiles[idx];
        update.apply_to(profile);
        profile.updated_at = Utc::now();
        Ok(profile.clone())
    }

    async fn delete_profile(&self, caller: &Caller, profile_id: &str) -> StoreResult<()> {
        let mut tables = self.tables.write().await;
        let idx = tables.owned_profile_index(caller, profile_id)?;
        let removed = tables.profiles.remove(idx);

        if removed.is_default {
            if let Some(&next) = tables.profile_indices_newest_first(&caller.user_id).first() {
                let profile = &mut tables.profiles[next];
                profile.is_default = true;
                profile.updated_at = Utc::now();
            }
        }
        Ok(())
    }

    async fn set_default_profile(&self, caller: &Caller, profile_id: &str) -> StoreResult<()> {
        let mut tables = self.tables.write().await;
        let idx = tables.owned_profile_index(caller, profile_id)?;
        tables.unset_defaults(&caller.user_id);
        let profile = &mut tables.profiles[idx];
        profile.is_default = true;
        profile.updated_at = Utc::now();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn alice() -> Caller {
        Caller::new("alice")
    }

    fn bob() -> Caller {
        Caller::new("bob")
    }

    async fn default_count(store: &MemoryStore, caller: &Caller) -> usize {
        store
            .list_profiles(caller).await
            .unwrap()
            .iter()
            .filter(|p| p.is_default)
            .count()
    }

    #[tokio::test]
    async fn first_profile_becomes_default() {
        let store = MemoryStore::new();
        let first = store.create_profile(&alice(), &NewBusinessProfile::named("Aqua Co")).await.unwrap();
        assert!(first.is_default);

        let second = store.create_profile(&alice(), &NewBusinessProfile::named("Bottle Bros")).await.unwrap();
        assert!(!second.is_default);
        assert_eq!(store.get_default_profile(&alice()).await.unwrap().unwrap().id, first.id);
    }

    #[tokio::test]
    async fn profile_name_is_required() {
        let store = MemoryStore::new();
        let err = store.create_profile(&alice(), &NewBusinessProfile::named("   ")).await.unwrap_err();
        assert!(matches!(err, StoreError::Validation(_)));
    }

    #[tokio::test]
    async fn set_default_leaves_exactly_one() {
        let store = MemoryStore::new();
        let mut ids = Vec::new();
        for name in ["a", "b", "c", "d"] {
            ids.push(store.create_profile(&alice(), &NewBusinessProfile::named(name)).await.unwrap().id);
        }
        store.create_profile(&bob(), &NewBusinessProfile::named("bob's")).await.unwrap();

        for id in ids.iter().rev() {
            store.set_default_profile(&alice(), id).await.unwrap();
            assert_eq!(default_count(&store, &alice()).await, 1);
            assert_eq!(store.get_default_profile(&alice()).await.unwrap().unwrap().id, *id);
        }
        // other users keep their own default
        assert_eq!(default_count(&store, &bob()).await, 1);
    }

    #[tokio::test]
    async fn creating_a_default_profile_unsets_the_old_one() {
        let store = MemoryStore::new();
        store.create_profile(&alice(), &NewBusinessProfile::named("a")).await.unwrap();
        let mut req = NewBusinessProfile::named("b");
        req.is_default = true;
        let b = store.create_profile(&alice(), &req).await.unwrap();
        assert_eq!(default_count(&store, &alice()).await, 1);
        assert_eq!(store.get_default_profile(&alice()).await.unwrap().unwrap().id, b.id);
    }

    #[tokio::test]
    async fn update_to_default_unsets_others() {
        let store = MemoryStore::new();
        store.create_profile(&alice(), &NewBusinessProfile::named("a")).await.unwrap();
        let b = store.create_profile(&alice(), &NewBusinessProfile::named("b")).await.unwrap();
        let update = BusinessProfileUpdate {
            is_default: Some(true),
            brand_voice: Some("Bold".into()),
            ..Default::default()
        };
        let updated = store.update_profile(&alice(), &b.id, &update).await.unwrap();
        assert!(updated.is_default);
        assert_eq!(updated.brand_voice.as_deref(), Some("Bold"));
        assert_eq!(default_count(&store, &alice()).await, 1);
    }

    #[tokio::test]
    async fn deleting_default_promotes_a_remaining_profile() {
        let store = MemoryStore::new();
        let a = store.create_profile(&alice(), &NewBusinessProfile::named("a")).await.unwrap();
        store.create_profile(&alice(), &NewBusinessProfile::named("b")).await.unwrap();
        store.create_profile(&alice(), &NewBusinessProfile::named("c")).await.unwrap();

        store.delete_profile(&alice(), &a.id).await.unwrap();
        assert_eq!(store.list_profiles(&alice()).await.unwrap().len(), 2);
        assert_eq!(default_count(&store, &alice()).await, 1);
    }

    #[tokio::test]
    async fn deleting_last_profile_leaves_no_default() {
        let store = MemoryStore::new();
        let a = store.create_profile(&alice(), &NewBusinessProfile::named("a")).await.unwrap();
        store.delete_profile(&alice(), &a.id).await.unwrap();
        assert_eq!(default_count(&store, &alice()).await, 0);
        assert!(store.get_default_profile(&alice()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn deleting_non_default_keeps_default() {
        let store = MemoryStore::new();
        let a = store.create_profile(&alice(), &NewBusinessProfile::named("a")).await.unwrap();
        let b = store.create_profile(&alice(), &NewBusinessProfile::named("b")).await.unwrap();
        store.delete_profile(&alice(), &b.id).await.unwrap();
        assert_eq!(store.get_default_profile(&alice()).await.unwrap().unwrap().id, a.id);
    }

    #[tokio::test]
    async fn profiles_of_other_users_are_off_limits() {
        let store = MemoryStore::new();
        let a = store.create_profile(&alice(), &NewBusinessProfile::named("a")).await.unwrap();
        let err = store.set_default_profile(&bob(), &a.id).await.unwrap_err();
        assert!(matches!(err, StoreError::PermissionDenied(_)));
        let err = store.delete_profile(&bob(), &a.id).await.unwrap_err();
        assert!(matches!(err, StoreError::PermissionDenied(_)));
        assert_eq!(store.list_profiles(&alice()).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn messages_are_ordered_and_cascade_on_delete() {
        let store = MemoryStore::new();
        let chat = store.create_chat(&alice(), "Launch copy", "aida", None).await.unwrap();
        store.add_message(&alice(), &chat.id, MessageRole::User, "first").await.unwrap();
        store.add_message(&alice(), &chat.id, MessageRole::Assistant, "second").await.unwrap();

        let loaded = store.get_chat(&alice(), &chat.id).await.unwrap();
        let contents: Vec<_> = loaded.messages.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, ["first", "second"]);

        store.delete_chat(&alice(), &chat.id).await.unwrap();
        assert!(matches!(store.get_chat(&alice(), &chat.id).await, Err(StoreError::NotFound(_))));
        assert!(store.tables.read().await.messages.is_empty());
    }

    #[tokio::test]
    async fn add_message_to_foreign_chat_is_denied() {
        let store = MemoryStore::new();
        let chat = store.create_chat(&alice(), "mine", "aida", None).await.unwrap();
        let err = store.add_message(&bob(), &chat.id, MessageRole::User, "hi").await.unwrap_err();
        assert!(matches!(err, StoreError::PermissionDenied(_)));
        assert!(store.get_chat_messages(&alice(), &chat.id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn chats_list_newest_first_per_user() {
        let store = MemoryStore::new();
        let first = store.create_chat(&alice(), "one", "aida", None).await.unwrap();
        let second = store.create_chat(&alice(), "two", "pas", None).await.unwrap();
        store.create_chat(&bob(), "bob", "fab", None).await.unwrap();

        let ids: Vec<_> = store.list_chats(&alice()).await.unwrap().into_iter().map(|c| c.id).collect();
        assert_eq!(ids, vec![second.id, first.id]);
    }

    #[tokio::test]
    async fn update_and_archive_chat() {
        let store = MemoryStore::new();
        let profile = store.create_profile(&alice(), &NewBusinessProfile::named("a")).await.unwrap();
        let chat = store.create_chat(&alice(), "old", "aida", Some(&profile.id)).await.unwrap();

        let update = ChatUpdate {
            title: Some("new".into()),
            framework: Some("pas".into()),
            business_profile_id: Some(None),
            ..Default::default()
        };
        let updated = store.update_chat(&alice(), &chat.id, &update).await.unwrap();
        assert_eq!(updated.title, "new");
        assert_eq!(updated.framework, "pas");
        assert_eq!(updated.business_profile_id, None);

        store.archive_chat(&alice(), &chat.id).await.unwrap();
        assert!(store.get_chat(&alice(), &chat.id).await.unwrap().chat.archived);

        let err = store.archive_chat(&bob(), &chat.id).await.unwrap_err();
        assert!(matches!(err, StoreError::PermissionDenied(_)));
    }

    #[tokio::test]
    async fn chat_cannot_link_foreign_profile() {
        let store = MemoryStore::new();
        let bobs = store.create_profile(&bob(), &NewBusinessProfile::named("b")).await.unwrap();
        let err = store.create_chat(&alice(), "t", "aida", Some(&bobs.id)).await.unwrap_err();
        assert!(matches!(err, StoreError::PermissionDenied(_)));
        assert!(store.list_chats(&alice()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn ensure_user_is_idempotent() {
        let store = MemoryStore::new();
        let user = User { id: "alice".into(), email: Some("a@example.com".into()), created_at: Utc::now() };
        store.ensure_user(&alice(), &user).await.unwrap();
        store.ensure_user(&alice(), &user).await.unwrap();
        assert_eq!(store.tables.read().await.users.len(), 1);
        assert_eq!(store.get_user(&alice(), "alice").await.unwrap(), user);
    }
}
