pub mod anthropic;
pub mod gemini;
pub mod ollama;
pub mod openai;
pub mod stream;

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, Response};

use crate::error::{ConnectorError, ConnectorResult};
use crate::models::{Message, ProviderConfig, ProviderId};

pub use anthropic::AnthropicConnector;
pub use gemini::GeminiConnector;
pub use ollama::OllamaConnector;
pub use openai::OpenAICompatibleConnector;
pub use stream::ChunkCallback;

/// Upper bound on generated tokens requested from every provider.
pub const DEFAULT_MAX_TOKENS: u32 = 4096;

// Trait defining the interface every vendor adapter implements
#[async_trait]
pub trait ProviderConnector: Send + Sync {
    fn provider(&self) -> ProviderId;

    fn model(&self) -> &str;

    /// Sends the conversation (oldest first) and streams the reply through
    /// `on_chunk`. Returns the concatenation of every non-final fragment.
    async fn send(
        &self,
        history: &[Message],
        system_prompt: Option<&str>,
        on_chunk: &mut ChunkCallback<'_>,
    ) -> ConnectorResult<String>;
}

/// Builds the connector for `config`. Fails with a configuration error when the
/// provider is disabled or needs an API key that was not supplied.
pub fn connector_for(
    config: &ProviderConfig,
    api_key: Option<String>,
    client: Client,
) -> ConnectorResult<Box<dyn ProviderConnector>> {
    let provider = config.provider_id;
    if !config.enabled {
        return Err(ConnectorError::configuration(provider, "provider is disabled in settings"));
    }
    let api_key = api_key.filter(|k| !k.trim().is_empty());
    let key = match (provider.requires_api_key(), api_key) {
        (true, None) => {
            return Err(ConnectorError::configuration(provider, "no API key is set"));
        }
        (_, key) => key.unwrap_or_default(),
    };

    let base_url = config.effective_base_url().to_string();
    let model = config.effective_model().to_string();
    log::debug!("Creating {} connector for model {} at {}", provider, model, base_url);

    let connector: Box<dyn ProviderConnector> = match provider {
        ProviderId::Anthropic => Box::new(AnthropicConnector::new(client, base_url, key, model)),
        ProviderId::OpenAi | ProviderId::Groq | ProviderId::OpenRouter => {
            Box::new(OpenAICompatibleConnector::new(provider, client, base_url, key, model))
        }
        ProviderId::Gemini => Box::new(GeminiConnector::new(client, base_url, key, model)),
        ProviderId::Ollama => Box::new(OllamaConnector::new(client, base_url, model)),
    };
    Ok(connector)
}

/// Sends a request and turns a non-2xx answer into [`ConnectorError::Http`].
pub(crate) async fn send_request(provider: ProviderId, request: RequestBuilder) -> ConnectorResult<Response> {
    let response = request.send().await.map_err(|e| {
        log::error!("Failed to send {} request: {}", provider, e);
        ConnectorError::Transport(e.to_string())
    })?;

    if !response.status().is_success() {
        let status = response.status();
        let body = response
            .text()
            .await
            .unwrap_or_else(|_| "<Failed to read error body>".to_string());
        log::error!("{} request failed with status {}: {}", provider, status, body);
        return Err(ConnectorError::Http {
            status: status.as_u16(),
            body,
        });
    }
    Ok(response)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn enabled(provider: ProviderId, key: Option<&str>) -> (ProviderConfig, Option<String>) {
        let mut config = ProviderConfig::new(provider);
        config.enabled = true;
        (config, key.map(str::to_string))
    }

    #[test]
    fn factory_selects_adapter_by_provider() {
        for provider in ProviderId::ALL {
            let (config, key) = enabled(provider, Some("key"));
            let connector = connector_for(&config, key, Client::new()).unwrap();
            assert_eq!(connector.provider(), provider);
            assert_eq!(connector.model(), provider.default_model());
        }
    }

    #[test]
    fn factory_rejects_disabled_or_keyless_providers() {
        let (mut config, key) = enabled(ProviderId::Anthropic, Some("key"));
        config.enabled = false;
        let err = connector_for(&config, key, Client::new()).err().unwrap();
        assert!(matches!(err, ConnectorError::Configuration { .. }));

        let (config, _) = enabled(ProviderId::OpenAi, None);
        let err = connector_for(&config, Some("  ".into()), Client::new()).err().unwrap();
        assert!(err.to_string().contains("no API key"));

        let (config, key) = enabled(ProviderId::Ollama, None);
        assert!(connector_for(&config, key, Client::new()).is_ok());
    }
}
