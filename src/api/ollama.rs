use async_trait::async_trait;
use reqwest::Client;
use serde::Serialize;

use super::stream::{self, ChunkCallback};
use super::{send_request, ProviderConnector};
use crate::error::ConnectorResult;
use crate::models::{Message, ProviderId};

const DELTA_POINTER: &str = "/message/content";
const DONE_FIELD: &str = "done";

#[derive(Serialize, Debug)]
struct OllamaChatRequest<'a> {
    model: &'a str,
    messages: Vec<OllamaMessage<'a>>,
    stream: bool,
}

#[derive(Serialize, Debug)]
struct OllamaMessage<'a> {
    role: &'static str,
    content: &'a str,
    // Raw base64, no data-URI prefix
    #[serde(skip_serializing_if = "Vec::is_empty")]
    images: Vec<&'a str>,
}

/// Local Ollama `/api/chat`: no auth, newline-delimited JSON responses.
pub struct OllamaConnector {
    client: Client,
    base_url: String,
    model: String,
}

impl OllamaConnector {
    pub fn new(client: Client, base_url: String, model: String) -> Self {
        Self {
            client,
            base_url,
            model,
        }
    }

    fn build_request<'a>(&'a self, history: &'a [Message], system_prompt: Option<&'a str>) -> OllamaChatRequest<'a> {
        let mut messages = Vec::with_capacity(history.len() + 1);
        if let Some(system) = system_prompt.filter(|s| !s.trim().is_empty()) {
            messages.push(OllamaMessage {
                role: "system",
                content: system,
                images: Vec::new(),
            });
        }
        messages.extend(history.iter().map(|msg| OllamaMessage {
            role: msg.role.as_str(),
            content: &msg.text,
            images: msg.image().map(|img| vec![img.data.as_str()]).unwrap_or_default(),
        }));

        OllamaChatRequest {
            model: &self.model,
            messages,
            stream: true,
        }
    }
}

#[async_trait]
impl ProviderConnector for OllamaConnector {
    fn provider(&self) -> ProviderId {
        ProviderId::Ollama
    }

    fn model(&self) -> &str {
        &self.model
    }

    async fn send(
        &self,
        history: &[Message],
        system_prompt: Option<&str>,
        on_chunk: &mut ChunkCallback<'_>,
    ) -> ConnectorResult<String> {
        let body = self.build_request(history, system_prompt);
        let url = format!("{}/api/chat", self.base_url);
        log::info!("Sending STREAM request to Ollama: {} using model: {}", url, self.model);

        let request = self.client.post(&url).json(&body);
        let response = send_request(ProviderId::Ollama, request).await?;
        stream::decode_json_lines(response.bytes_stream(), DELTA_POINTER, DONE_FIELD, on_chunk).await
    }
}
