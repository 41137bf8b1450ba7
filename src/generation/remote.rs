use async_trait::async_trait;
use log::{ error, warn };
use reqwest::Client as HttpClient;

use super::{ validate, GenerationError, Generator };
use crate::config::framework;
use crate::models::api::{ GenerateRequest, GenerateResponse };

/// Client for a running `/api/generate` endpoint.
pub struct RemoteGenerator {
    http: HttpClient,
    endpoint: String,
}

impl RemoteGenerator {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self { http: HttpClient::new(), endpoint: endpoint.into() }
    }

    async fn call(&self, request: &GenerateRequest) -> Result<String, Box<dyn std::error::Error + Send + Sync>> {
        let resp = self.http.post(&self.endpoint).json(request).send().await?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(format!("generate endpoint returned {}: {}", status, body).into());
        }
        let parsed: GenerateResponse = resp.json().await?;
        Ok(parsed.content)
    }
}

#[async_trait]
impl Generator for RemoteGenerator {
    async fn generate(&self, request: &GenerateRequest) -> Result<String, GenerationError> {
        validate(request)?;
        match self.call(request).await {
            Ok(content) => Ok(content),
            Err(e) => {
                error!("Remote generation at {} failed: {}", self.endpoint, e);
                let framework_id = framework::legacy_convert(&request.framework);
                warn!("Using fallback copy for {}", framework_id);
                Ok(framework::mock_response(framework_id, &request.prompt))
            }
        }
    }
}
