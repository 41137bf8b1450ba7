mod remote;

pub use remote::RemoteGenerator;

use async_trait::async_trait;
use log::{ debug, info, warn };
use std::error::Error;
use std::sync::Arc;
use thiserror::Error as ThisError;

use crate::config::framework;
use crate::llm::chat::{ new_client, ChatClient };
use crate::llm::LlmConfig;
use crate::models::api::GenerateRequest;
use crate::models::chat::PromptMessage;

#[derive(Debug, ThisError, PartialEq, Eq)]
pub enum GenerationError {
    #[error("Invalid request: {0}")]
    InvalidRequest(String),
}

/// Produces copy for one turn. Upstream trouble is absorbed into the
/// framework's fallback text; only a malformed request is an error.
#[async_trait]
pub trait Generator: Send + Sync {
    async fn generate(&self, request: &GenerateRequest) -> Result<String, GenerationError>;
}

pub(crate) fn validate(request: &GenerateRequest) -> Result<(), GenerationError> {
    if request.prompt.trim().is_empty() {
        return Err(GenerationError::InvalidRequest("prompt is required".to_string()));
    }
    Ok(())
}

/// `[system, ...previous, user]` for the chat-completion call.
pub fn build_messages(framework_id: &str, request: &GenerateRequest) -> Vec<PromptMessage> {
    let system = framework::system_prompt(framework_id, request.business_profile.as_ref());
    let mut messages = Vec::with_capacity(request.previous_messages.len() + 2);
    messages.push(PromptMessage::new("system", system));
    messages.extend(request.previous_messages.iter().cloned());
    messages.push(PromptMessage::new("user", request.prompt.clone()));
    messages
}

/// Generates in-process through a configured chat client.
pub struct CopyGenerator {
    client: Option<Arc<dyn ChatClient>>,
}

impl CopyGenerator {
    pub fn new(client: Option<Arc<dyn ChatClient>>) -> Self {
        Self { client }
    }

    /// Without an API key for a hosted provider every request gets the fallback.
    pub fn from_config(config: &LlmConfig) -> Self {
        match new_client(config) {
            Ok(client) => {
                info!("Copy generation uses {} model {}", config.llm_type, client.get_model());
                Self::new(Some(client))
            }
            Err(e) => {
                warn!("Chat client unavailable ({}), responses will use fallback copy", e);
                Self::new(None)
            }
        }
    }

    pub fn has_client(&self) -> bool {
        self.client.is_some()
    }
}

#[async_trait]
impl Generator for CopyGenerator {
    async fn generate(&self, request: &GenerateRequest) -> Result<String, GenerationError> {
        validate(request)?;
        let framework_id = framework::legacy_convert(&request.framework);

        let Some(client) = &self.client else {
            debug!("No chat client configured, returning fallback for {}", framework_id);
            return Ok(framework::mock_response(framework_id, &request.prompt));
        };

        let messages = build_messages(framework_id, request);
        match client.complete(&messages).await {
            Ok(completion) => Ok(completion.response),
            Err(e) => {
                warn!("Generation failed, using fallback copy: {}", e);
                Ok(framework::mock_response(framework_id, &request.prompt))
            }
        }
    }
}

pub fn create_generator(config: &LlmConfig) -> Result<Arc<dyn Generator>, Box<dyn Error + Send + Sync>> {
    Ok(Arc::new(CopyGenerator::from_config(config)))
}
