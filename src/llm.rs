use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use ollama_rs::Ollama;
use ollama_rs::generation::completion::request::GenerationRequest;
use reqwest::header::{AUTHORIZATION, HeaderMap, HeaderValue};
use url::Url;

use crate::config::{ConfigManager, keys};
use crate::error::EngineError;

/// Completion seam for `ai_response` nodes. The engine hands over an
/// assembled prompt and forwards the reply verbatim; prompt engineering
/// lives with the flow author, not here.
#[async_trait]
pub trait LlmClient: Send + Sync {
    async fn complete(&self, prompt: &str) -> Result<String, EngineError>;
}

pub type SharedLlm = Arc<dyn LlmClient>;

/// Ollama-backed client. `OLLAMA_URL` selects the server (port required for
/// non-default deployments), `OLLAMA_KEY` adds a bearer token, `OLLAMA_MODEL`
/// picks the model.
#[derive(Debug, Clone)]
pub struct OllamaClient {
    url: Option<Url>,
    key: Option<String>,
    model: String,
}

impl OllamaClient {
    pub async fn from_config(config: &ConfigManager) -> Self {
        let url = match config.0.get(keys::OLLAMA_URL).await {
            Some(raw) => Url::parse(&raw).ok(),
            None => None,
        };
        let key = config.0.get(keys::OLLAMA_KEY).await;
        let model = config
            .0
            .get(keys::OLLAMA_MODEL)
            .await
            .unwrap_or_else(|| "llama3:latest".to_string());
        Self { url, key, model }
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    fn build_client(&self) -> Result<Ollama, EngineError> {
        let Some(url) = self.url.clone() else {
            return Ok(Ollama::default());
        };
        let Some(port) = url.port() else {
            return Ok(Ollama::default());
        };

        match &self.key {
            Some(key) => {
                let mut headers = HeaderMap::new();
                let value = HeaderValue::from_str(&format!("Bearer {key}"))
                    .map_err(|e| EngineError::Configuration(format!("invalid OLLAMA_KEY: {e}")))?;
                headers.insert(AUTHORIZATION, value);
                let client = reqwest::Client::builder()
                    .default_headers(headers)
                    .timeout(Duration::from_secs(60))
                    .build()
                    .map_err(|e| EngineError::Configuration(format!("llm http client: {e}")))?;
                Ok(Ollama::new_with_client(url, port, client))
            }
            None => Ok(Ollama::new(url, port)),
        }
    }
}

#[async_trait]
impl LlmClient for OllamaClient {
    async fn complete(&self, prompt: &str) -> Result<String, EngineError> {
        let client = self.build_client()?;
        let req = GenerationRequest::new(self.model.clone(), prompt.to_string());
        let resp = client
            .generate(req)
            .await
            .map_err(|e| EngineError::Llm(format!("generation failed: {e}")))?;
        Ok(resp.response.trim().to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MapConfigManager;

    #[tokio::test]
    async fn from_config_reads_model_and_url() {
        let config = ConfigManager(MapConfigManager::with(&[
            (keys::OLLAMA_URL, "http://llm.internal:11434/"),
            (keys::OLLAMA_MODEL, "qwen2:7b"),
        ]));
        let client = OllamaClient::from_config(&config).await;
        assert_eq!(client.model(), "qwen2:7b");
        assert!(client.url.is_some());
    }

    #[tokio::test]
    async fn defaults_without_config() {
        let config = ConfigManager(MapConfigManager::new());
        let client = OllamaClient::from_config(&config).await;
        assert_eq!(client.model(), "llama3:latest");
        assert!(client.url.is_none());
        assert!(client.build_client().is_ok());
    }
}
