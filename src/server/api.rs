use axum::{
    extract::{ rejection::JsonRejection, FromRequestParts, Path, State },
    http::{ header::AUTHORIZATION, request::Parts, StatusCode },
    response::IntoResponse,
    routing::{ get, post },
    Json,
    Router,
};
use log::{ debug, error, info, warn };
use std::error::Error;
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::cors::{ Any, CorsLayer };

use super::error::ApiError;
use crate::auth::{ create_auth_provider, parse_bearer, AuthProvider, SessionContext };
use crate::cli::Args;
use crate::config::framework;
use crate::generation::{ create_generator, Generator, RemoteGenerator };
use crate::models::api::{
    AddMessageRequest,
    CreateChatRequest,
    EnvCheckResponse,
    FrameworkInfo,
    GenerateRequest,
    GenerateResponse,
};
use crate::models::chat::{ chat_title_from, Chat, ChatUpdate, ChatWithMessages, Message };
use crate::models::profile::{ BusinessProfile, BusinessProfileUpdate, NewBusinessProfile };
use crate::models::user::{ Caller, Credentials, Session, User };
use crate::store::{ initialize_store, CopyStore };

type ApiResult<T> = Result<T, ApiError>;

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn CopyStore>,
    pub auth: Arc<dyn AuthProvider>,
    pub generator: Arc<dyn Generator>,
    /// Key of the generation provider; only ever shown as a preview.
    pub llm_api_key: Option<String>,
    pub default_framework: String,
}

impl AppState {
    pub fn new(
        store: Arc<dyn CopyStore>,
        auth: Arc<dyn AuthProvider>,
        generator: Arc<dyn Generator>,
        llm_api_key: Option<String>
    ) -> Self {
        Self {
            store,
            auth,
            generator,
            llm_api_key,
            default_framework: framework::DEFAULT_FRAMEWORK_ID.to_string(),
        }
    }

    /// Wires the store, auth provider and generator selected by `args`.
    pub fn from_args(args: &Args) -> Result<Self, Box<dyn Error + Send + Sync>> {
        let store = initialize_store(args)?;
        let auth = create_auth_provider(args)?;
        let generator: Arc<dyn Generator> = match &args.generate_url {
            Some(url) => Arc::new(RemoteGenerator::new(url.clone())),
            None => create_generator(&args.llm_config()?)?,
        };
        Ok(Self::new(store, auth, generator, args.api_key()).with_default_framework(&args.default_framework))
    }

    pub fn with_default_framework(mut self, framework_id: &str) -> Self {
        self.default_framework = framework::legacy_convert(framework_id).to_string();
        self
    }
}

/// The signed-in user behind a request's bearer token.
pub struct AuthUser {
    pub user: User,
    pub caller: Caller,
}

impl FromRequestParts<AppState> for AuthUser {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, Self::Rejection> {
        let token = parts.headers
            .get(AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(parse_bearer)
            .ok_or_else(|| ApiError::Unauthorized("Missing bearer token".to_string()))?;
        let user = state.auth.get_user(token).await?;
        let caller = Caller::with_token(user.id.clone(), token);
        Ok(AuthUser { user, caller })
    }
}

pub fn router(state: AppState) -> Router {
    let cors = CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any);

    Router::new()
        .route("/api/generate", post(generate_handler))
        .route("/api/env-check", get(env_check_handler))
        .route("/api/frameworks", get(frameworks_handler))
        .route("/api/auth/signup", post(sign_up_handler))
        .route("/api/auth/signin", post(sign_in_handler))
        .route("/api/auth/signout", post(sign_out_handler))
        .route("/api/auth/user", get(current_user_handler))
        .route("/api/chats", get(list_chats_handler).post(create_chat_handler))
        .route(
            "/api/chats/{id}",
            get(get_chat_handler).patch(update_chat_handler).delete(delete_chat_handler)
        )
        .route("/api/chats/{id}/archive", post(archive_chat_handler))
        .route("/api/chats/{id}/messages", get(list_messages_handler).post(add_message_handler))
        .route("/api/profiles", get(list_profiles_handler).post(create_profile_handler))
        .route("/api/profiles/default", get(default_profile_handler))
        .route(
            "/api/profiles/{id}",
            get(get_profile_handler).patch(update_profile_handler).delete(delete_profile_handler)
        )
        .route("/api/profiles/{id}/default", post(set_default_profile_handler))
        .layer(cors)
        .with_state(state)
}

pub async fn start_http_server(
    http_port: u16,
    state: AppState,
    args: Args
) -> Result<(), Box<dyn Error + Send + Sync>> {
    let addr = format!("0.0.0.0:{}", http_port).parse::<SocketAddr>()?;
    info!("Starting HTTP API server on: http://{}", addr);

    let app = router(state);

    if let (true, Some(cert_path), Some(key_path)) = (args.enable_tls, &args.tls_cert_path, &args.tls_key_path) {
        let tls_config = axum_server::tls_rustls::RustlsConfig::from_pem_file(cert_path, key_path).await?;

        tokio::spawn(async move {
            let result = axum_server::bind_rustls(addr, tls_config).serve(app.into_make_service()).await;

            if let Err(e) = result {
                error!("HTTPS server error: {}", e);
            }
        });

        info!("HTTPS server started with TLS enabled");
    } else {
        tokio::spawn(async move {
            match tokio::net::TcpListener::bind(addr).await {
                Ok(listener) => {
                    if let Err(e) = axum::serve(listener, app.into_make_service()).await {
                        error!("HTTP server error: {}", e);
                    }
                }
                Err(e) => {
                    error!("Failed to bind HTTP server to {}: {}. Try a different port.", addr, e);
                }
            }
        });

        info!("HTTP server started");
    }

    Ok(())
}

async fn generate_handler(
    State(state): State<AppState>,
    body: Result<Json<GenerateRequest>, JsonRejection>
) -> ApiResult<Json<GenerateResponse>> {
    let Json(request) = body.map_err(|e| {
        warn!("Error parsing generate request: {}", e);
        ApiError::BadRequest("Invalid request".to_string())
    })?;
    debug!("Generate request for framework '{}'", request.framework);
    let content = state.generator.generate(&request).await?;
    Ok(Json(GenerateResponse { content }))
}

fn key_preview(key: &str) -> String {
    let chars: Vec<char> = key.chars().collect();
    let head: String = chars.iter().take(5).collect();
    let tail: String = chars[chars.len().saturating_sub(4)..].iter().collect();
    format!("{}...{}", head, tail)
}

async fn env_check_handler(State(state): State<AppState>) -> Json<EnvCheckResponse> {
    let key = state.llm_api_key.as_deref().filter(|k| !k.is_empty());
    Json(EnvCheckResponse {
        api_key_status: (if key.is_some() { "Key is present" } else { "Key is missing" }).to_string(),
        api_key_preview: key.map(key_preview),
    })
}

async fn frameworks_handler() -> Json<Vec<FrameworkInfo>> {
    let listing = framework::all()
        .iter()
        .map(|f| FrameworkInfo {
            id: f.id.to_string(),
            name: f.name.to_string(),
            description: f.description.to_string(),
            display_name: f.display_name(),
            sections: f.headings().map(str::to_string).collect(),
        })
        .collect();
    Json(listing)
}

async fn establish_session(
    state: &AppState,
    credentials: Credentials,
    sign_up: bool
) -> ApiResult<Json<Session>> {
    let ctx = SessionContext::new(state.auth.clone(), state.store.clone());
    let user = if sign_up {
        ctx.sign_up(&credentials.email, &credentials.password).await?
    } else {
        ctx.sign_in(&credentials.email, &credentials.password).await?
    };
    info!("User {} signed {}", user.id, if sign_up { "up" } else { "in" });
    let session = ctx.session().await.ok_or_else(|| ApiError::Internal("Session missing after sign-in".to_string()))?;
    Ok(Json(session))
}

async fn sign_up_handler(
    State(state): State<AppState>,
    Json(credentials): Json<Credentials>
) -> ApiResult<Json<Session>> {
    establish_session(&state, credentials, true).await
}

async fn sign_in_handler(
    State(state): State<AppState>,
    Json(credentials): Json<Credentials>
) -> ApiResult<Json<Session>> {
    establish_session(&state, credentials, false).await
}

async fn sign_out_handler(State(state): State<AppState>, auth: AuthUser) -> ApiResult<StatusCode> {
    if let Some(token) = auth.caller.access_token.as_deref() {
        state.auth.sign_out(token).await?;
    }
    info!("User {} signed out", auth.user.id);
    Ok(StatusCode::NO_CONTENT)
}

async fn current_user_handler(auth: AuthUser) -> Json<User> {
    Json(auth.user)
}

async fn list_chats_handler(State(state): State<AppState>, auth: AuthUser) -> ApiResult<Json<Vec<Chat>>> {
    Ok(Json(state.store.list_chats(&auth.caller).await?))
}

async fn create_chat_handler(
    State(state): State<AppState>,
    auth: AuthUser,
    Json(req): Json<CreateChatRequest>
) -> ApiResult<impl IntoResponse> {
    if req.title.trim().is_empty() {
        return Err(ApiError::BadRequest("Title is required".to_string()));
    }
    let title = chat_title_from(&req.title);
    let framework_id = match req.framework.as_deref() {
        Some(f) => framework::legacy_convert(f),
        None => framework::legacy_convert(&state.default_framework),
    };
    let chat = state.store.create_chat(
        &auth.caller,
        &title,
        framework_id,
        req.business_profile_id.as_deref()
    ).await?;
    Ok((StatusCode::CREATED, Json(chat)))
}

async fn get_chat_handler(
    State(state): State<AppState>,
    auth: AuthUser,
    Path(id): Path<String>
) -> ApiResult<Json<ChatWithMessages>> {
    Ok(Json(state.store.get_chat(&auth.caller, &id).await?))
}

async fn update_chat_handler(
    State(state): State<AppState>,
    auth: AuthUser,
    Path(id): Path<String>,
    Json(mut update): Json<ChatUpdate>
) -> ApiResult<Json<Chat>> {
    if update.is_empty() {
        return Err(ApiError::BadRequest("Nothing to update".to_string()));
    }
    if let Some(f) = update.framework.take() {
        update.framework = Some(framework::legacy_convert(&f).to_string());
    }
    Ok(Json(state.store.update_chat(&auth.caller, &id, &update).await?))
}

async fn delete_chat_handler(
    State(state): State<AppState>,
    auth: AuthUser,
    Path(id): Path<String>
) -> ApiResult<StatusCode> {
    state.store.delete_chat(&auth.caller, &id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn archive_chat_handler(
    State(state): State<AppState>,
    auth: AuthUser,
    Path(id): Path<String>
) -> ApiResult<StatusCode> {
    state.store.archive_chat(&auth.caller, &id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn list_messages_handler(
    State(state): State<AppState>,
    auth: AuthUser,
    Path(id): Path<String>
) -> ApiResult<Json<Vec<Message>>> {
    Ok(Json(state.store.get_chat_messages(&auth.caller, &id).await?))
}

async fn add_message_handler(
    State(state): State<AppState>,
    auth: AuthUser,
    Path(id): Path<String>,
    Json(req): Json<AddMessageRequest>
) -> ApiResult<impl IntoResponse> {
    if req.content.trim().is_empty() {
        return Err(ApiError::BadRequest("Message content is required".to_string()));
    }
    let message = state.store.add_message(&auth.caller, &id, req.role, &req.content).await?;
    Ok((StatusCode::CREATED, Json(message)))
}

async fn list_profiles_handler(
    State(state): State<AppState>,
    auth: AuthUser
) -> ApiResult<Json<Vec<BusinessProfile>>> {
    Ok(Json(state.store.list_profiles(&auth.caller).await?))
}

async fn create_profile_handler(
    State(state): State<AppState>,
    auth: AuthUser,
    Json(profile): Json<NewBusinessProfile>
) -> ApiResult<impl IntoResponse> {
    let created = state.store.create_profile(&auth.caller, &profile).await?;
    Ok((StatusCode::CREATED, Json(created)))
}

async fn default_profile_handler(
    State(state): State<AppState>,
    auth: AuthUser
) -> ApiResult<Json<Option<BusinessProfile>>> {
    Ok(Json(state.store.get_default_profile(&auth.caller).await?))
}

async fn get_profile_handler(
    State(state): State<AppState>,
    auth: AuthUser,
    Path(id): Path<String>
) -> ApiResult<Json<BusinessProfile>> {
    Ok(Json(state.store.get_profile(&auth.caller, &id).await?))
}

async fn update_profile_handler(
    State(state): State<AppState>,
    auth: AuthUser,
    Path(id): Path<String>,
    Json(update): Json<BusinessProfileUpdate>
) -> ApiResult<Json<BusinessProfile>> {
    Ok(Json(state.store.update_profile(&auth.caller, &id, &update).await?))
}

async fn delete_profile_handler(
    State(state): State<AppState>,
    auth: AuthUser,
    Path(id): Path<String>
) -> ApiResult<StatusCode> {
    state.store.delete_profile(&auth.caller, &id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn set_default_profile_handler(
    State(state): State<AppState>,
    auth: AuthUser,
    Path(id): Path<String>
) -> ApiResult<StatusCode> {
    state.store.set_default_profile(&auth.caller, &id).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn preview_shows_head_and_tail_only() {
        assert_eq!(key_preview("sk-1234567890abcdef"), "sk-12...cdef");
        assert_eq!(key_preview("abc"), "abc...abc");
    }
}
