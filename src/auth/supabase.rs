use async_trait::async_trait;
use log::{ debug, error };
use reqwest::{ Client as HttpClient, Response, StatusCode };
use serde::Deserialize;
use serde_json::{ json, Value as JsonValue };
use url::Url;

use super::{ validate_credentials, AuthError, AuthProvider };
use crate::models::user::{ Session, User };

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    user: User,
}

/// GoTrue client for a Supabase project.
pub struct SupabaseAuth {
    http: HttpClient,
    auth_url: Url,
    anon_key: String,
}

impl SupabaseAuth {
    pub fn new(project_url: &str, anon_key: &str) -> Result<Self, AuthError> {
        let auth_url = Url::parse(project_url)
            .and_then(|base| base.join("auth/v1/"))
            .map_err(|e| AuthError::Backend(format!("Invalid Supabase URL '{}': {}", project_url, e)))?;
        Ok(Self {
            http: HttpClient::new(),
            auth_url,
            anon_key: anon_key.to_string(),
        })
    }

    fn endpoint(&self, path: &str) -> Result<Url, AuthError> {
        self.auth_url
            .join(path)
            .map_err(|e| AuthError::Backend(format!("Invalid auth endpoint '{}': {}", path, e)))
    }

    async fn read_error(resp: Response) -> AuthError {
        let status = resp.status();
        let body: JsonValue = resp.json().await.unwrap_or(JsonValue::Null);
        let message = ["error_description", "msg", "message", "error"]
            .iter()
            .find_map(|k| body.get(k).and_then(|v| v.as_str()))
            .unwrap_or("")
            .to_string();
        debug!("GoTrue returned {}: {}", status, message);

        match status {
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => AuthError::InvalidToken,
            StatusCode::BAD_REQUEST if message.to_lowercase().contains("invalid login") => {
                AuthError::InvalidCredentials
            }
            StatusCode::BAD_REQUEST | StatusCode::UNPROCESSABLE_ENTITY => {
                if message.to_lowercase().contains("already registered") {
                    AuthError::AlreadyRegistered
                } else {
                    AuthError::Validation(message)
                }
            }
            _ => {
                error!("GoTrue request failed with {}: {}", status, message);
                AuthError::Backend(format!("Auth service returned {}", status))
            }
        }
    }
}

#[async_trait]
impl AuthProvider for SupabaseAuth {
    async fn sign_up(&self, email: &str, password: &str) -> Result<Session, AuthError> {
        validate_credentials(email, password)?;
        let resp = self.http
            .post(self.endpoint("signup")?)
            .header("apikey", &self.anon_key)
            .json(&json!({ "email": email, "password": password }))
            .send().await?;
        if !resp.status().is_success() {
            return Err(Self::read_error(resp).await);
        }

        let body: JsonValue = resp.json().await?;
        // With email confirmation enabled the user comes back bare, and an
        // existing address comes back with no identities.
        let user_json = body.get("user").unwrap_or(&body);
        let no_identities = user_json
            .get("identities")
            .and_then(|v| v.as_array())
            .map(|ids| ids.is_empty())
            .unwrap_or(false);
        if no_identities {
            return Err(AuthError::AlreadyRegistered);
        }

        match body.get("access_token").and_then(|v| v.as_str()) {
            Some(token) =>
                Ok(Session {
                    access_token: token.to_string(),
                    user: serde_json::from_value(user_json.clone()).map_err(|e|
                        AuthError::Backend(format!("Unexpected sign-up response: {}", e))
                    )?,
                }),
            None =>
                Err(
                    AuthError::Backend(
                        "Sign-up succeeded but no session was issued; confirm the email address first".to_string()
                    )
                ),
        }
    }

    async fn sign_in(&self, email: &str, password: &str) -> Result<Session, AuthError> {
        let mut url = self.endpoint("token")?;
        url.query_pairs_mut().append_pair("grant_type", "password");
        let resp = self.http
            .post(url)
            .header("apikey", &self.anon_key)
            .json(&json!({ "email": email, "password": password }))
            .send().await?;
        if !resp.status().is_success() {
            return Err(match Self::read_error(resp).await {
                AuthError::Validation(_) | AuthError::InvalidToken => AuthError::InvalidCredentials,
                other => other,
            });
        }
        let token: TokenResponse = resp.json().await?;
        Ok(Session { access_token: token.access_token, user: token.user })
    }

    async fn sign_out(&self, access_token: &str) -> Result<(), AuthError> {
        let resp = self.http
            .post(self.endpoint("logout")?)
            .header("apikey", &self.anon_key)
            .bearer_auth(access_token)
            .send().await?;
        match resp.status() {
            // already expired tokens are as good as signed out
            s if s.is_success() || s == StatusCode::UNAUTHORIZED => Ok(()),
            _ => Err(Self::read_error(resp).await),
        }
    }

    async fn get_user(&self, access_token: &str) -> Result<User, AuthError> {
        let resp = self.http
            .get(self.endpoint("user")?)
            .header("apikey", &self.anon_key)
            .bearer_auth(access_token)
            .send().await?;
        if !resp.status().is_success() {
            return Err(Self::read_error(resp).await);
        }
        Ok(resp.json::<User>().await?)
    }
}
