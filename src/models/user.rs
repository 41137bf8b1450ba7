use chrono::{ DateTime, Utc };
use serde::{ Serialize, Deserialize };

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct User {
    pub id: String,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub access_token: String,
    pub user: User,
}

/// Identity attached to every store call.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Caller {
    pub user_id: String,
    pub access_token: Option<String>,
}

impl Caller {
    pub fn new(user_id: impl Into<String>) -> Self {
        Self { user_id: user_id.into(), access_token: None }
    }

    pub fn with_token(user_id: impl Into<String>, token: impl Into<String>) -> Self {
        Self { user_id: user_id.into(), access_token: Some(token.into()) }
    }
}

impl From<&Session> for Caller {
    fn from(session: &Session) -> Self {
        Caller::with_token(session.user.id.clone(), session.access_token.clone())
    }
}

#[derive(Clone, Debug, Deserialize)]
pub struct Credentials {
    pub email: String,
    pub password: String,
}
