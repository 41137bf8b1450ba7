use async_trait::async_trait;
use chrono::Utc;
use log::{ debug, error };
use reqwest::{ Client as HttpClient, Method, RequestBuilder, Response, StatusCode };
use serde::de::DeserializeOwned;
use serde_json::{ json, Value as JsonValue };
use url::Url;

use super::{ validate_profile_name, CopyStore, StoreError, StoreResult };
use crate::models::chat::{ Chat, ChatUpdate, ChatWithMessages, Message, MessageRole };
use crate::models::profile::{ BusinessProfile, BusinessProfileUpdate, NewBusinessProfile };
use crate::models::user::{ Caller, User };

const USERS: &str = "users";
const CHATS: &str = "chats";
const MESSAGES: &str = "messages";
const PROFILES: &str = "business_profiles";

/// Store backed by a Supabase project's PostgREST endpoint.
///
/// Requests carry the caller's access token so row level security applies;
/// ownership is also checked here so errors map onto [`StoreError`].
pub struct SupabaseStore {
    http: HttpClient,
    rest_url: Url,
    anon_key: String,
}

fn eq(value: &str) -> String {
    format!("eq.{}", value)
}

impl SupabaseStore {
    pub fn new(project_url: &str, anon_key: &str) -> Result<Self, StoreError> {
        let base = Url::parse(project_url).map_err(|e|
            StoreError::Backend(format!("Invalid Supabase URL '{}': {}", project_url, e))
        )?;
        let rest_url = base
            .join("rest/v1/")
            .map_err(|e| StoreError::Backend(format!("Invalid Supabase URL '{}': {}", project_url, e)))?;
        Ok(Self {
            http: HttpClient::new(),
            rest_url,
            anon_key: anon_key.to_string(),
        })
    }

    fn table_url(&self, table: &str, filters: &[(&str, String)]) -> StoreResult<Url> {
        let mut url = self.rest_url
            .join(table)
            .map_err(|e| StoreError::Backend(format!("Invalid table '{}': {}", table, e)))?;
        {
            let mut pairs = url.query_pairs_mut();
            for (key, value) in filters {
                pairs.append_pair(key, value);
            }
        }
        Ok(url)
    }

    fn request(
        &self,
        caller: &Caller,
        method: Method,
        table: &str,
        filters: &[(&str, String)]
    ) -> StoreResult<RequestBuilder> {
        let url = self.table_url(table, filters)?;
        debug!("Supabase {} {}", method, url);
        let token = caller.access_token.as_deref().unwrap_or(&self.anon_key);
        Ok(
            self.http
                .request(method, url)
                .header("apikey", &self.anon_key)
                .bearer_auth(token)
                .header("Prefer", "return=representation")
        )
    }

    async fn rows<T: DeserializeOwned>(resp: Response) -> StoreResult<Vec<T>> {
        let status = resp.status();
        if status.is_success() {
            if status == StatusCode::NO_CONTENT {
                return Ok(Vec::new());
            }
            return Ok(resp.json::<Vec<T>>().await?);
        }

        let body = resp.text().await.unwrap_or_default();
        match status {
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => Err(StoreError::PermissionDenied(body)),
            StatusCode::NOT_FOUND => Err(StoreError::NotFound(body)),
            _ => {
                error!("Supabase request failed with {}: {}", status, body);
                Err(StoreError::Backend(format!("Supabase returned {}", status)))
            }
        }
    }

    async fn select<T: DeserializeOwned>(
        &self,
        caller: &Caller,
        table: &str,
        filters: &[(&str, String)]
    ) -> StoreResult<Vec<T>> {
        let resp = self.request(caller, Method::GET, table, filters)?.send().await?;
        Self::rows(resp).await
    }

    async fn insert<T: DeserializeOwned>(
        &self,
        caller: &Caller,
        table: &str,
        body: &JsonValue
    ) -> StoreResult<T> {
        let resp = self.request(caller, Method::POST, table, &[])?.json(body).send().await?;
        Self::rows(resp).await?
            .into_iter()
            .next()
            .ok_or_else(|| StoreError::Backend(format!("No data returned when inserting into {}", table)))
    }

    async fn patch<T: DeserializeOwned>(
        &self,
        caller: &Caller,
        table: &str,
        filters: &[(&str, String)],
        body: &JsonValue
    ) -> StoreResult<Vec<T>> {
        let resp = self.request(caller, Method::PATCH, table, filters)?.json(body).send().await?;
        Self::rows(resp).await
    }

    async fn delete(&self, caller: &Caller, table: &str, filters: &[(&str, String)]) -> StoreResult<()> {
        let resp = self.request(caller, Method::DELETE, table, filters)?.send().await?;
        Self::rows::<JsonValue>(resp).await.map(|_| ())
    }

    async fn owned_chat(&self, caller: &Caller, chat_id: &str) -> StoreResult<Chat> {
        let chat = self
            .select::<Chat>(caller, CHATS, &[("id", eq(chat_id))]).await?
            .into_iter()
            .next()
            .ok_or_else(|| StoreError::NotFound(format!("chat {}", chat_id)))?;
        if chat.user_id != caller.user_id {
            return Err(StoreError::PermissionDenied(format!("chat {} belongs to another user", chat_id)));
        }
        Ok(chat)
    }

    async fn owned_profile(&self, caller: &Caller, profile_id: &str) -> StoreResult<BusinessProfile> {
        let profile = self
            .select::<BusinessProfile>(caller, PROFILES, &[("id", eq(profile_id))]).await?
            .into_iter()
            .next()
            .ok_or_else(|| StoreError::NotFound(format!("business profile {}", profile_id)))?;
        if profile.user_id != caller.user_id {
            return Err(
                StoreError::PermissionDenied(format!("business profile {} belongs to another user", profile_id))
            );
        }
        Ok(profile)
    }

    async fn unset_default_profiles(&self, caller: &Caller) -> StoreResult<()> {
        let filters = [
            ("user_id", eq(&caller.user_id)),
            ("is_default", "is.true".to_string()),
        ];
        let body = json!({ "is_default": false, "updated_at": Utc::now() });
        self.patch::<JsonValue>(caller, PROFILES, &filters, &body).await.map(|_| ())
    }

    async fn mark_default(&self, caller: &Caller, profile_id: &str) -> StoreResult<()> {
        let body = json!({ "is_default": true, "updated_at": Utc::now() });
        self.patch::<JsonValue>(caller, PROFILES, &[("id", eq(profile_id))], &body).await.map(|_| ())
    }
}

#[async_trait]
impl CopyStore for SupabaseStore {
    async fn ensure_user(&self, caller: &Caller, user: &User) -> StoreResult<()> {
        let existing: Vec<JsonValue> = self.select(
            caller,
            USERS,
            &[
                ("id", eq(&user.id)),
                ("select", "id".to_string()),
            ]
        ).await?;
        if existing.is_empty() {
            let body = json!({ "id": user.id, "email": user.email, "created_at": user.created_at });
            self.insert::<JsonValue>(caller, USERS, &body).await?;
        }
        Ok(())
    }

    async fn get_user(&self, caller: &Caller, user_id: &str) -> StoreResult<User> {
        self.select::<User>(caller, USERS, &[("id", eq(user_id))]).await?
            .into_iter()
            .next()
            .ok_or_else(|| StoreError::NotFound(format!("user {}", user_id)))
    }

    async fn list_chats(&self, caller: &Caller) -> StoreResult<Vec<Chat>> {
        self.select(
            caller,
            CHATS,
            &[
                ("user_id", eq(&caller.user_id)),
                ("order", "created_at.desc".to_string()),
            ]
        ).await
    }

    async fn get_chat(&self, caller: &Caller, chat_id: &str) -> StoreResult<ChatWithMessages> {
        let mut found = self
            .select::<ChatWithMessages>(
                caller,
                CHATS,
                &[
                    ("id", eq(chat_id)),
                    ("select", "*,messages(*)".to_string()),
                ]
            ).await?
            .into_iter()
            .next()
            .ok_or_else(|| StoreError::NotFound(format!("chat {}", chat_id)))?;
        if found.chat.user_id != caller.user_id {
            return Err(StoreError::PermissionDenied(format!("chat {} belongs to another user", chat_id)));
        }
        found.messages.sort_by_key(|m| m.created_at);
        Ok(found)
    }

    async fn create_chat(
        &self,
        caller: &Caller,
        title: &str,
        framework_id: &str,
        business_profile_id: Option<&str>
    ) -> StoreResult<Chat> {
        if let Some(profile_id) = business_profile_id {
            self.owned_profile(caller, profile_id).await?;
        }
        let body =
            json!({
            "title": title,
            "framework": framework_id,
            "business_profile_id": business_profile_id,
            "user_id": caller.user_id,
            "archived": false,
        });
        self.insert(caller, CHATS, &body).await
    }

    async fn update_chat(
        &self,
        caller: &Caller,
        chat_id: &str,
        update: &ChatUpdate
    ) -> StoreResult<Chat> {
        self.owned_chat(caller, chat_id).await?;
        if let Some(Some(profile_id)) = &update.business_profile_id {
            self.owned_profile(caller, profile_id).await?;
        }
        let mut body = serde_json::to_value(update)?;
        if let JsonValue::Object(map) = &mut body {
            map.insert("updated_at".to_string(), json!(Utc::now()));
        }
        let filters = [
            ("id", eq(chat_id)),
            ("user_id", eq(&caller.user_id)),
        ];
        self.patch::<Chat>(caller, CHATS, &filters, &body).await?
            .into_iter()
            .next()
            .ok_or_else(|| StoreError::NotFound(format!("chat {}", chat_id)))
    }

    async fn delete_chat(&self, caller: &Caller, chat_id: &str) -> StoreResult<()> {
        self.owned_chat(caller, chat_id).await?;
        self.delete(caller, MESSAGES, &[("chat_id", eq(chat_id))]).await?;
        self.delete(
            caller,
            CHATS,
            &[
                ("id", eq(chat_id)),
                ("user_id", eq(&caller.user_id)),
            ]
        ).await
    }

    async fn add_message(
        &self,
        caller: &Caller,
        chat_id: &str,
        role: MessageRole,
        content: &str
    ) -> StoreResult<Message> {
        let owned: Vec<JsonValue> = self.select(
            caller,
            CHATS,
            &[
                ("id", eq(chat_id)),
                ("user_id", eq(&caller.user_id)),
                ("select", "id".to_string()),
            ]
        ).await?;
        if owned.is_empty() {
            return Err(
                StoreError::PermissionDenied(
                    "You do not have permission to add messages to this chat".to_string()
                )
            );
        }
        let body = json!({ "chat_id": chat_id, "role": role, "content": content });
        self.insert(caller, MESSAGES, &body).await
    }

    async fn get_chat_messages(&self, caller: &Caller, chat_id: &str) -> StoreResult<Vec<Message>> {
        self.owned_chat(caller, chat_id).await?;
        self.select(
            caller,
            MESSAGES,
            &[
                ("chat_id", eq(chat_id)),
                ("order", "created_at.asc".to_string()),
            ]
        ).await
    }

    async fn list_profiles(&self, caller: &Caller) -> StoreResult<Vec<BusinessProfile>> {
        self.select(
            caller,
            PROFILES,
            &[
                ("user_id", eq(&caller.user_id)),
                ("order", "created_at.desc".to_string()),
            ]
        ).await
    }

    async fn get_profile(&self, caller: &Caller, profile_id: &str) -> StoreResult<BusinessProfile> {
        self.owned_profile(caller, profile_id).await
    }

    async fn get_default_profile(&self, caller: &Caller) -> StoreResult<Option<BusinessProfile>> {
        let rows: Vec<BusinessProfile> = self.select(
            caller,
            PROFILES,
            &[
                ("user_id", eq(&caller.user_id)),
                ("is_default", "is.true".to_string()),
                ("limit", "1".to_string()),
            ]
        ).await?;
        Ok(rows.into_iter().next())
    }

    async fn create_profile(
        &self,
        caller: &Caller,
        profile: &NewBusinessProfile
    ) -> StoreResult<BusinessProfile> {
        validate_profile_name(&profile.name)?;
        let existing = self.list_profiles(caller).await?;
        let is_default = existing.is_empty() || profile.is_default;
        if is_default {
            self.unset_default_profiles(caller).await?;
        }

        let mut body = serde_json::to_value(profile)?;
        if let JsonValue::Object(map) = &mut body {
            map.insert("name".to_string(), json!(profile.name.trim()));
            map.insert("user_id".to_string(), json!(caller.user_id));
            map.insert("is_default".to_string(), json!(is_default));
        }
        self.insert(caller, PROFILES, &body).await
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
        self.owned_profile(caller, profile_id).await?;
        if update.is_default == Some(true) {
            self.unset_default_profiles(caller).await?;
        }

        let mut body = serde_json::to_value(update)?;
        if let JsonValue::Object(map) = &mut body {
            map.insert("updated_at".to_string(), json!(Utc::now()));
        }
        self.patch::<BusinessProfile>(caller, PROFILES, &[("id", eq(profile_id))], &body).await?
            .into_iter()
            .next()
            .ok_or_else(|| StoreError::NotFound(format!("business profile {}", profile_id)))
    }

    async fn delete_profile(&self, caller: &Caller, profile_id: &str) -> StoreResult<()> {
        let doomed = self.owned_profile(caller, profile_id).await?;
        self.delete(caller, PROFILES, &[("id", eq(profile_id))]).await?;

        if doomed.is_default {
            if let Some(next) = self.list_profiles(caller).await?.into_iter().next() {
                self.mark_default(caller, &next.id).await?;
            }
        }
        Ok(())
    }

    async fn set_default_profile(&self, caller: &Caller, profile_id: &str) -> StoreResult<()> {
        self.owned_profile(caller, profile_id).await?;
        self.unset_default_profiles(caller).await?;
        self.mark_default(caller, profile_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Bytes;
    use axum::extract::{ Path, Query, State };
    use axum::routing::any;
    use axum::{ Json, Router };
    use std::collections::HashMap;
    use std::sync::{ Arc, Mutex };

    /// Just enough PostgREST to run the store against: `eq.`/`is.` filters,
    /// `order`, `limit` and the embedded `messages(*)` select.
    #[derive(Default)]
    struct Postgrest {
        tables: HashMap<String, Vec<JsonValue>>,
        log: Vec<String>,
        clock: u32,
    }

    type Shared = Arc<Mutex<Postgrest>>;

    fn row_matches(row: &JsonValue, params: &[(String, String)]) -> bool {
        params
            .iter()
            .filter(|(key, _)| !matches!(key.as_str(), "select" | "order" | "limit"))
            .all(|(key, filter)| {
                let field = &row[key.as_str()];
                match filter.split_once('.') {
                    Some(("eq", value)) =>
                        match field {
                            JsonValue::String(s) => s == value,
                            other => other.to_string() == value,
                        }
                    Some(("is", value)) => field.to_string() == value,
                    _ => false,
                }
            })
    }

    async fn handle(
        State(db): State<Shared>,
        method: Method,
        Path(table): Path<String>,
        Query(params): Query<Vec<(String, String)>>,
        body: Bytes
    ) -> Json<JsonValue> {
        let mut db = db.lock().unwrap();
        db.log.push(format!("{} {}", method, table));
        let body: JsonValue = if body.is_empty() { JsonValue::Null } else { serde_json::from_slice(&body).unwrap() };
        let param = |name: &str| params.iter().find(|(k, _)| k == name).map(|(_, v)| v.clone());

        match method.as_str() {
            "GET" => {
                let mut rows: Vec<JsonValue> = db.tables
                    .get(&table)
                    .cloned()
                    .unwrap_or_default()
                    .into_iter()
                    .filter(|r| row_matches(r, &params))
                    .collect();
                if let Some(order) = param("order") {
                    let (column, direction) = order.split_once('.').unwrap();
                    rows.sort_by(|a, b| a[column].as_str().cmp(&b[column].as_str()));
                    if direction == "desc" {
                        rows.reverse();
                    }
                }
                if let Some(limit) = param("limit") {
                    rows.truncate(limit.parse().unwrap());
                }
                if param("select").is_some_and(|s| s.contains("messages(*)")) {
                    let messages = db.tables.get(MESSAGES).cloned().unwrap_or_default();
                    for row in &mut rows {
                        let own: Vec<JsonValue> = messages
                            .iter()
                            .filter(|m| m["chat_id"] == row["id"])
                            .cloned()
                            .collect();
                        row["messages"] = JsonValue::Array(own);
                    }
                }
                Json(JsonValue::Array(rows))
            }
            "POST" => {
                db.clock += 1;
                let stamp = format!("2024-01-01T00:00:{:02}Z", db.clock);
                let mut row = body;
                row["id"] = json!(format!("{}-{}", table, db.clock));
                for field in ["created_at", "updated_at"] {
                    if row[field].is_null() {
                        row[field] = json!(stamp);
                    }
                }
                db.tables.entry(table).or_default().push(row.clone());
                Json(json!([row]))
            }
            "PATCH" => {
                let rows = db.tables.entry(table).or_default();
                let mut changed = Vec::new();
                for row in rows.iter_mut().filter(|r| row_matches(r, &params)) {
                    if let (Some(target), Some(patch)) = (row.as_object_mut(), body.as_object()) {
                        for (k, v) in patch {
                            target.insert(k.clone(), v.clone());
                        }
                    }
                    changed.push(row.clone());
                }
                Json(JsonValue::Array(changed))
            }
            "DELETE" => {
                let rows = db.tables.entry(table).or_default();
                let (gone, kept): (Vec<JsonValue>, Vec<JsonValue>) = rows
                    .drain(..)
                    .partition(|r| row_matches(r, &params));
                *rows = kept;
                Json(JsonValue::Array(gone))
            }
            _ => Json(JsonValue::Null),
        }
    }

    async fn fake_postgrest() -> (SupabaseStore, Shared) {
        let db: Shared = Arc::default();
        let app = Router::new().route("/rest/v1/{table}", any(handle)).with_state(db.clone());
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        (SupabaseStore::new(&format!("http://{}", addr), "anon").unwrap(), db)
    }

    fn take_log(db: &Shared) -> Vec<String> {
        std::mem::take(&mut db.lock().unwrap().log)
    }

    fn alice() -> Caller {
        Caller::with_token("alice", "token-a")
    }

    #[tokio::test]
    async fn first_profile_is_default_and_set_default_keeps_one() {
        let (store, db) = fake_postgrest().await;
        let caller = alice();

        let first = store.create_profile(&caller, &NewBusinessProfile::named(" Aqua Co ")).await.unwrap();
        assert!(first.is_default);
        assert_eq!(first.name, "Aqua Co");
        let second = store.create_profile(&caller, &NewBusinessProfile::named("Terra Ltd")).await.unwrap();
        assert!(!second.is_default);

        take_log(&db);
        store.set_default_profile(&caller, &second.id).await.unwrap();
        assert_eq!(take_log(&db), ["GET business_profiles", "PATCH business_profiles", "PATCH business_profiles"]);

        let defaults: Vec<BusinessProfile> = store
            .list_profiles(&caller).await
            .unwrap()
            .into_iter()
            .filter(|p| p.is_default)
            .collect();
        assert_eq!(defaults.len(), 1);
        assert_eq!(defaults[0].id, second.id);
        assert_eq!(store.get_default_profile(&caller).await.unwrap().map(|p| p.id), Some(second.id));
    }

    #[tokio::test]
    async fn deleting_the_default_promotes_the_newest() {
        let (store, _db) = fake_postgrest().await;
        let caller = alice();
        let mut ids = Vec::new();
        for name in ["A", "B", "C"] {
            ids.push(store.create_profile(&caller, &NewBusinessProfile::named(name)).await.unwrap().id);
        }

        store.delete_profile(&caller, &ids[0]).await.unwrap();
        let remaining = store.list_profiles(&caller).await.unwrap();
        assert_eq!(remaining.len(), 2);
        let defaults: Vec<&str> = remaining
            .iter()
            .filter(|p| p.is_default)
            .map(|p| p.id.as_str())
            .collect();
        assert_eq!(defaults, [ids[2].as_str()]);
    }

    #[tokio::test]
    async fn deleting_a_chat_deletes_its_messages_first() {
        let (store, db) = fake_postgrest().await;
        let caller = alice();
        let chat = store.create_chat(&caller, "Launch", "aida", None).await.unwrap();
        store.add_message(&caller, &chat.id, MessageRole::User, "hello").await.unwrap();
        store.add_message(&caller, &chat.id, MessageRole::Assistant, "# Attention").await.unwrap();
        assert_eq!(store.get_chat(&caller, &chat.id).await.unwrap().messages.len(), 2);

        take_log(&db);
        store.delete_chat(&caller, &chat.id).await.unwrap();
        assert_eq!(take_log(&db), ["GET chats", "DELETE messages", "DELETE chats"]);
        assert!(db.lock().unwrap().tables[MESSAGES].is_empty());
        assert!(matches!(store.get_chat(&caller, &chat.id).await, Err(StoreError::NotFound(_))));
    }

    #[tokio::test]
    async fn messages_cannot_be_added_to_another_users_chat() {
        let (store, db) = fake_postgrest().await;
        db.lock().unwrap().tables.entry(CHATS.to_string()).or_default().push(
            json!({
                "id": "chat-bob",
                "user_id": "bob",
                "title": "Bob's",
                "framework": "aida",
                "archived": false,
                "created_at": "2024-01-01T00:00:00Z",
            })
        );
        let caller = alice();

        let err = store.add_message(&caller, "chat-bob", MessageRole::User, "sneaky").await.unwrap_err();
        assert!(matches!(err, StoreError::PermissionDenied(_)));
        assert_eq!(take_log(&db), ["GET chats"]);
        assert!(!db.lock().unwrap().tables.contains_key(MESSAGES));
        assert!(matches!(store.get_chat(&caller, "chat-bob").await, Err(StoreError::PermissionDenied(_))));
    }

    #[test]
    fn table_urls_carry_postgrest_filters() {
        let store = SupabaseStore::new("https://demo.supabase.co", "anon").unwrap();
        let url = store
            .table_url(
                CHATS,
                &[
                    ("id", eq("c1")),
                    ("select", "*,messages(*)".to_string()),
                ]
            )
            .unwrap();
        assert_eq!(url.path(), "/rest/v1/chats");
        let pairs: Vec<(String, String)> = url.query_pairs().into_owned().collect();
        assert_eq!(pairs, vec![
            ("id".to_string(), "eq.c1".to_string()),
            ("select".to_string(), "*,messages(*)".to_string()),
        ]);
    }

    #[test]
    fn rejects_invalid_project_url() {
        assert!(matches!(SupabaseStore::new("not a url", "anon"), Err(StoreError::Backend(_))));
    }
}
