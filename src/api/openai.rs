use async_trait::async_trait;
use reqwest::Client;
use serde::Serialize;

use super::stream::{self, ChunkCallback};
use super::{send_request, ProviderConnector, DEFAULT_MAX_TOKENS};
use crate::error::ConnectorResult;
use crate::models::{Message, ProviderId};

const DELTA_POINTER: &str = "/choices/0/delta/content";
const OPENROUTER_REFERER: &str = "https://github.com/screenai/screenai";
const OPENROUTER_TITLE: &str = "ScreenAI";

// Request Body with stream=true
#[derive(Serialize, Debug)]
struct OpenAIRequestBody<'a> {
    model: &'a str,
    max_tokens: u32,
    messages: Vec<OpenAIMessage<'a>>,
    stream: bool,
}

#[derive(Serialize, Debug)]
struct OpenAIMessage<'a> {
    role: &'static str,
    content: OpenAIContent<'a>,
}

#[derive(Serialize, Debug)]
#[serde(untagged)]
enum OpenAIContent<'a> {
    Text(&'a str),
    Parts(Vec<OpenAIPart<'a>>),
}

#[derive(Serialize, Debug)]
#[serde(tag = "type", rename_all = "snake_case")]
enum OpenAIPart<'a> {
    Text { text: &'a str },
    ImageUrl { image_url: ImageUrl },
}

#[derive(Serialize, Debug)]
struct ImageUrl {
    url: String,
}

/// Chat-completions dialect shared by OpenAI, Groq and OpenRouter: bearer auth,
/// system prompt injected as the first message, images as data-URI `image_url` parts.
pub struct OpenAICompatibleConnector {
    provider: ProviderId,
    client: Client,
    base_url: String,
    api_key: String,
    model: String,
}

impl OpenAICompatibleConnector {
    pub fn new(provider: ProviderId, client: Client, base_url: String, api_key: String, model: String) -> Self {
        Self {
            provider,
            client,
            base_url,
            api_key,
            model,
        }
    }

    fn build_request<'a>(&'a self, history: &'a [Message], system_prompt: Option<&'a str>) -> OpenAIRequestBody<'a> {
        let mut messages = Vec::with_capacity(history.len() + 1);
        if let Some(system) = system_prompt.filter(|s| !s.trim().is_empty()) {
            messages.push(OpenAIMessage {
                role: "system",
                content: OpenAIContent::Text(system),
            });
        }
        messages.extend(history.iter().map(|msg| {
            let content = match msg.image() {
                Some(image) => {
                    let mut parts = Vec::with_capacity(2);
                    if !msg.text.is_empty() {
                        parts.push(OpenAIPart::Text { text: &msg.text });
                    }
                    parts.push(OpenAIPart::ImageUrl {
                        image_url: ImageUrl {
                            url: image.to_data_uri(),
                        },
                    });
                    OpenAIContent::Parts(parts)
                }
                None => OpenAIContent::Text(&msg.text),
            };
            OpenAIMessage {
                role: msg.role.as_str(),
                content,
            }
        }));

        OpenAIRequestBody {
            model: &self.model,
            max_tokens: DEFAULT_MAX_TOKENS,
            messages,
            stream: true,
        }
    }
}

#[async_trait]
impl ProviderConnector for OpenAICompatibleConnector {
    fn provider(&self) -> ProviderId {
        self.provider
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
        let url = format!("{}/chat/completions", self.base_url);
        log::info!(
            "Sending STREAM request to {} compatible API: {} using model: {}",
            self.provider,
            url,
            self.model
        );

        let mut request = self.client.post(&url).bearer_auth(&self.api_key).json(&body);
        if self.provider == ProviderId::OpenRouter {
            request = request
                .header("HTTP-Referer", OPENROUTER_REFERER)
                .header("X-Title", OPENROUTER_TITLE);
        }
        let response = send_request(self.provider, request).await?;
        stream::decode_event_stream(response.bytes_stream(), DELTA_POINTER, on_chunk).await
    }
}
