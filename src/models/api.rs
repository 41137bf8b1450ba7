use serde::{ Serialize, Deserialize };

use super::chat::{ MessageRole, PromptMessage };
use super::profile::ProfileContext;

/// Body of `POST /api/generate`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerateRequest {
    pub prompt: String,
    #[serde(default)]
    pub framework: String,
    #[serde(default)]
    pub business_profile: Option<ProfileContext>,
    #[serde(default)]
    pub previous_messages: Vec<PromptMessage>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct GenerateResponse {
    pub content: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateChatRequest {
    pub title: String,
    #[serde(default)]
    pub framework: Option<String>,
    #[serde(default)]
    pub business_profile_id: Option<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AddMessageRequest {
    pub role: MessageRole,
    pub content: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnvCheckResponse {
    pub api_key_status: String,
    pub api_key_preview: Option<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FrameworkInfo {
    pub id: String,
    pub name: String,
    pub description: String,
    pub display_name: String,
    pub sections: Vec<String>,
}
