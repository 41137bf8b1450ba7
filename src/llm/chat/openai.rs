use async_trait::async_trait;
use log::debug;
use reqwest::{ Client as HttpClient, header::{ HeaderMap, HeaderValue, CONTENT_TYPE, AUTHORIZATION } };
use serde::{ Deserialize, Serialize };
use std::error::Error as StdError;

use super::{ completions_url, ChatClient, CompletionResponse };
use crate::llm::LlmConfig;
use crate::models::chat::PromptMessage;

const DEFAULT_BASE_URL: &str = "https://api.openai.com";
const DEFAULT_MODEL: &str = "gpt-4o";

pub struct OpenAIChatClient {
    http: HttpClient,
    model: String,
    base_url: String,
    temperature: f32,
}

#[derive(Serialize, Deserialize)]
struct OpenAIMessage {
    role: String,
    content: String,
}

#[derive(Serialize)]
struct OpenAIChatRequest<'a> {
    model: &'a str,
    messages: Vec<OpenAIMessage>,
    temperature: f32,
}

#[derive(Deserialize)]
struct OpenAIResponse {
    choices: Vec<OpenAIChoice>,
}

#[derive(Deserialize)]
struct OpenAIChoice {
    message: OpenAIMessage,
}

/// Builds an HTTP client that sends `Authorization: Bearer <key>` on every call.
pub(super) fn bearer_http_client(api_key: &str) -> Result<HttpClient, Box<dyn StdError + Send + Sync>> {
    let mut headers = HeaderMap::new();
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    headers.insert(
        AUTHORIZATION,
        HeaderValue::from_str(&format!("Bearer {}", api_key))
            .map_err(|e| format!("Invalid API key format: {}", e))?
    );

    let http = HttpClient::builder()
        .default_headers(headers)
        .build()
        .map_err(|e| Box::new(e) as Box<dyn StdError + Send + Sync>)?;
    Ok(http)
}

/// One non-streaming call against an OpenAI-compatible chat completions endpoint.
pub(super) async fn chat_completion(
    http: &HttpClient,
    url: &str,
    model: &str,
    temperature: f32,
    messages: &[PromptMessage],
    provider: &str,
) -> Result<CompletionResponse, Box<dyn StdError + Send + Sync>> {
    let req = OpenAIChatRequest {
        model,
        messages: messages
            .iter()
            .map(|m| OpenAIMessage { role: m.role.clone(), content: m.content.clone() })
            .collect(),
        temperature,
    };
    debug!("{} request: {} messages to {}", provider, req.messages.len(), url);

    let resp = http
        .post(url)
        .json(&req)
        .send().await?
        .error_for_status()?
        .json::<OpenAIResponse>().await?;

    let content = resp.choices
        .into_iter()
        .next()
        .ok_or_else(|| format!("No response from {} API", provider))?
        .message.content;

    Ok(CompletionResponse { response: content })
}

impl OpenAIChatClient {
    pub fn new(
        api_key: String,
        model: Option<String>,
        base_url: Option<String>,
        temperature: f32,
    ) -> Result<Self, Box<dyn StdError + Send + Sync>> {
        Ok(Self {
            http: bearer_http_client(&api_key)?,
            model: model.unwrap_or_else(|| DEFAULT_MODEL.to_string()),
            base_url: base_url.unwrap_or_else(|| DEFAULT_BASE_URL.to_string()),
            temperature,
        })
    }

    pub fn from_config(config: &LlmConfig) -> Result<Self, Box<dyn StdError + Send + Sync>> {
        let api_key = config.api_key
            .clone()
            .ok_or_else(|| "OpenAI API key is required".to_string())?;

        Self::new(
            api_key,
            config.completion_model.clone(),
            config.base_url.clone(),
            config.temperature,
        )
    }
}

#[async_trait]
impl ChatClient for OpenAIChatClient {
    async fn complete(
        &self,
        messages: &[PromptMessage]
    ) -> Result<CompletionResponse, Box<dyn StdError + Send + Sync>> {
        let url = completions_url(&self.base_url);
        chat_completion(&self.http, &url, &self.model, self.temperature, messages, "OpenAI").await
    }

    fn get_model(&self) -> String {
        self.model.clone()
    }

    fn get_base_url(&self) -> Option<String> {
        Some(self.base_url.clone())
    }
}
