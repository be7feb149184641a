use async_trait::async_trait;
use reqwest::Client;
use serde::Serialize;

use super::stream::{self, ChunkCallback};
use super::{send_request, ProviderConnector, DEFAULT_MAX_TOKENS};
use crate::error::ConnectorResult;
use crate::models::{Message, ProviderId, Role};

// Every text part of the first candidate
const DELTA_POINTER: &str = "/candidates/0/content/parts/*/text";

#[derive(Serialize, Debug)]
#[serde(rename_all = "camelCase")]
struct GenerateContentRequest<'a> {
    contents: Vec<Content<'a>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    system_instruction: Option<SystemInstruction<'a>>,
    generation_config: GenerationConfig,
}

#[derive(Serialize, Debug)]
struct Content<'a> {
    role: &'static str,
    parts: Vec<Part<'a>>,
}

#[derive(Serialize, Debug)]
struct SystemInstruction<'a> {
    parts: Vec<Part<'a>>,
}

#[derive(Serialize, Debug)]
#[serde(untagged)]
enum Part<'a> {
    Text { text: &'a str },
    InlineData { inline_data: InlineData<'a> },
}

#[derive(Serialize, Debug)]
struct InlineData<'a> {
    mime_type: &'a str,
    data: &'a str,
}

#[derive(Serialize, Debug)]
#[serde(rename_all = "camelCase")]
struct GenerationConfig {
    max_output_tokens: u32,
}

/// Gemini `streamGenerateContent` over SSE: API key in the `key` query
/// parameter, assistant turns use the `model` role.
pub struct GeminiConnector {
    client: Client,
    base_url: String,
    api_key: String,
    model: String,
}

impl GeminiConnector {
    pub fn new(client: Client, base_url: String, api_key: String, model: String) -> Self {
        Self {
            client,
            base_url,
            api_key,
            model,
        }
    }

    fn build_request<'a>(&self, history: &'a [Message], system_prompt: Option<&'a str>) -> GenerateContentRequest<'a> {
        let contents = history
            .iter()
            .filter_map(|msg| {
                let mut parts = Vec::new();
                if !msg.text.is_empty() {
                    parts.push(Part::Text { text: &msg.text });
                }
                if let Some(image) = msg.image() {
                    parts.push(Part::InlineData {
                        inline_data: InlineData {
                            mime_type: &image.mime_type,
                            data: &image.data,
                        },
                    });
                }
                let role = match msg.role {
                    Role::User => "user",
                    Role::Assistant => "model",
                };
                (!parts.is_empty()).then_some(Content { role, parts })
            })
            .collect();

        GenerateContentRequest {
            contents,
            system_instruction: system_prompt
                .filter(|s| !s.trim().is_empty())
                .map(|text| SystemInstruction {
                    parts: vec![Part::Text { text }],
                }),
            generation_config: GenerationConfig {
                max_output_tokens: DEFAULT_MAX_TOKENS,
            },
        }
    }
}

#[async_trait]
impl ProviderConnector for GeminiConnector {
    fn provider(&self) -> ProviderId {
        ProviderId::Gemini
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
        let url = format!("{}/v1beta/models/{}:streamGenerateContent", self.base_url, self.model);
        log::info!("Sending STREAM request to Gemini: {} using model: {}", url, self.model);

        let request = self
            .client
            .post(&url)
            .query(&[("alt", "sse"), ("key", self.api_key.as_str())])
            .json(&body);
        let response = send_request(ProviderId::Gemini, request).await?;
        stream::decode_event_stream(response.bytes_stream(), DELTA_POINTER, on_chunk).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::image_data::EncodedImage;
    use crate::models::Screenshot;
    use mockito::{Matcher, Server};
    use serde_json::json;

    fn connector(base_url: String) -> GeminiConnector {
        GeminiConnector::new(Client::new(), base_url, "g-key".into(), "gemini-test".into())
    }

    #[test]
    fn request_uses_inline_data_and_model_role() {
        let shot = Screenshot::new(EncodedImage::from_bytes("image/jpeg", b"jp"), Vec::new());
        let history = vec![
            Message::user("Describe", Some(shot)),
            Message::assistant("A chart.", ProviderId::Gemini, "gemini-test"),
        ];
        let body = serde_json::to_value(connector("http://unused".into()).build_request(&history, Some("Short answers")))
            .unwrap();
        assert_eq!(
            body,
            json!({
                "contents": [
                    {"role": "user", "parts": [
                        {"text": "Describe"},
                        {"inline_data": {"mime_type": "image/jpeg", "data": "anA="}}
                    ]},
                    {"role": "model", "parts": [{"text": "A chart."}]}
                ],
                "systemInstruction": {"parts": [{"text": "Short answers"}]},
                "generationConfig": {"maxOutputTokens": 4096}
            })
        );
    }

    #[tokio::test]
    async fn authenticates_with_query_key_and_ends_on_close() {
        let mut server = Server::new_async().await;
        let sse = concat!(
            "data: {\"candidates\":[{\"content\":{\"parts\":[{\"text\":\"Two \"}],\"role\":\"model\"}}]}\r\n\r\n",
            "data: {\"candidates\":[{\"content\":{\"parts\":[{\"text\":\"cats\"},{\"text\":\" and a dog\"}],\"role\":\"model\"},\"finishReason\":\"STOP\"}]}\r\n\r\n",
        );
        let mock = server
            .mock("POST", "/v1beta/models/gemini-test:streamGenerateContent")
            .match_query(Matcher::AllOf(vec![
                Matcher::UrlEncoded("alt".into(), "sse".into()),
                Matcher::UrlEncoded("key".into(), "g-key".into()),
            ]))
            .with_status(200)
            .with_header("content-type", "text/event-stream")
            .with_body(sse)
            .create_async()
            .await;

        let mut finals = 0;
        let text = connector(server.url())
            .send(&[Message::user("What animals?", None)], None, &mut |_: &str, f: bool| {
                if f {
                    finals += 1;
                }
            })
            .await
            .unwrap();
        mock.assert_async().await;
        assert_eq!(text, "Two cats and a dog");
        assert_eq!(finals, 1);
    }
}
