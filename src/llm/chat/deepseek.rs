use async_trait::async_trait;
use reqwest::Client as HttpClient;
use std::error::Error as StdError;

use super::openai::{ bearer_http_client, chat_completion };
use super::{ completions_url, ChatClient, CompletionResponse };
use crate::llm::LlmConfig;
use crate::models::chat::PromptMessage;

const DEFAULT_BASE_URL: &str = "https://api.deepseek.com";
const DEFAULT_MODEL: &str = "deepseek-chat";

/// DeepSeek speaks the OpenAI chat completions dialect.
pub struct DeepSeekChatClient {
    http: HttpClient,
    model: String,
    base_url: String,
    temperature: f32,
}

impl DeepSeekChatClient {
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
            .ok_or_else(|| "DeepSeek API key is required".to_string())?;

        Self::new(
            api_key,
            config.completion_model.clone(),
            config.base_url.clone(),
            config.temperature,
        )
    }
}

#[async_trait]
impl ChatClient for DeepSeekChatClient {
    async fn complete(
        &self,
        messages: &[PromptMessage]
    ) -> Result<CompletionResponse, Box<dyn StdError + Send + Sync>> {
        let url = completions_url(&self.base_url);
        chat_completion(&self.http, &url, &self.model, self.temperature, messages, "DeepSeek").await
    }

    fn get_model(&self) -> String {
        self.model.clone()
    }

    fn get_base_url(&self) -> Option<String> {
        Some(self.base_url.clone())
    }
}
