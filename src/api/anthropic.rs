use async_trait::async_trait;
use reqwest::Client;
use serde::Serialize;

use super::stream::{self, ChunkCallback};
use super::{send_request, ProviderConnector, DEFAULT_MAX_TOKENS};
use crate::error::ConnectorResult;
use crate::models::{Message, ProviderId};

const ANTHROPIC_VERSION: &str = "2023-06-01";
const DELTA_POINTER: &str = "/delta/text";

#[derive(Serialize, Debug)]
struct AnthropicRequest<'a> {
    model: &'a str,
    max_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<&'a str>,
    messages: Vec<AnthropicMessage<'a>>,
    stream: bool,
}

#[derive(Serialize, Debug)]
struct AnthropicMessage<'a> {
    role: &'static str,
    content: Vec<ContentBlock<'a>>,
}

#[derive(Serialize, Debug)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ContentBlock<'a> {
    Image { source: ImageSource<'a> },
    Text { text: &'a str },
}

#[derive(Serialize, Debug)]
struct ImageSource<'a> {
    #[serde(rename = "type")]
    kind: &'static str,
    media_type: &'a str,
    data: &'a str,
}

/// Messages API: `x-api-key` auth, top-level `system`, images as nested
/// base64 `source` blocks.
pub struct AnthropicConnector {
    client: Client,
    base_url: String,
    api_key: String,
    model: String,
}

impl AnthropicConnector {
    pub fn new(client: Client, base_url: String, api_key: String, model: String) -> Self {
        Self {
            client,
            base_url,
            api_key,
            model,
        }
    }

    fn build_request<'a>(&'a self, history: &'a [Message], system_prompt: Option<&'a str>) -> AnthropicRequest<'a> {
        let messages = history
            .iter()
            .filter_map(|msg| {
                let mut content = Vec::new();
                if let Some(image) = msg.image() {
                    content.push(ContentBlock::Image {
                        source: ImageSource {
                            kind: "base64",
                            media_type: &image.mime_type,
                            data: &image.data,
                        },
                    });
                }
                if !msg.text.is_empty() {
                    content.push(ContentBlock::Text { text: &msg.text });
                }
                // The API rejects messages without content blocks
                (!content.is_empty()).then_some(AnthropicMessage {
                    role: msg.role.as_str(),
                    content,
                })
            })
            .collect();

        AnthropicRequest {
            model: &self.model,
            max_tokens: DEFAULT_MAX_TOKENS,
            system: system_prompt.filter(|s| !s.trim().is_empty()),
            messages,
            stream: true,
        }
    }
}

#[async_trait]
impl ProviderConnector for AnthropicConnector {
    fn provider(&self) -> ProviderId {
        ProviderId::Anthropic
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
        let url = format!("{}/v1/messages", self.base_url);
        log::info!("Sending STREAM request to Anthropic: {} using model: {}", url, self.model);

        let request = self
            .client
            .post(&url)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .json(&body);
        let response = send_request(ProviderId::Anthropic, request).await?;
        stream::decode_event_stream(response.bytes_stream(), DELTA_POINTER, on_chunk).await
    }
}
