//! Conversation assembler: runs one outgoing turn from a composed user
//! message to a persisted assistant reply.
//!
//! The user message is stored before any network call, so it survives every
//! failure path. Configuration problems and failed calls are recorded as
//! assistant messages instead of leaving a gap in the conversation.

use serde::Serialize;
use tokio::sync::mpsc::UnboundedSender;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::annotate;
use crate::api::{self, ProviderConnector};
use crate::config;
use crate::error::{ConnectorError, TurnError};
use crate::models::{Conversation, Message, ProviderId, Screenshot};
pub use crate::models::TurnStatus;
use crate::state::AppState;

/// Progress notifications for whoever renders the conversation.
#[derive(Serialize, Clone, Debug)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TurnEvent {
    UserMessageStored {
        conversation_id: Uuid,
        message: Message,
    },
    Chunk {
        conversation_id: Uuid,
        message_id: Uuid,
        delta: String,
        is_first_chunk: bool,
    },
    Finished {
        conversation_id: Uuid,
        message: Message,
    },
    Failed {
        conversation_id: Uuid,
        message: Message,
        error: String,
    },
}

#[derive(Debug)]
pub struct TurnOutcome {
    pub conversation: Conversation,
    pub reply: Message,
    pub status: TurnStatus,
}

/// What the user composed: text, a screenshot, or both.
#[derive(Clone, Debug, Default)]
pub struct OutgoingMessage {
    pub text: String,
    pub screenshot: Option<Screenshot>,
}

impl OutgoingMessage {
    pub fn new(text: impl Into<String>, screenshot: Option<Screenshot>) -> Self {
        Self {
            text: text.into(),
            screenshot,
        }
    }

    fn is_empty(&self) -> bool {
        self.text.trim().is_empty() && self.screenshot.is_none()
    }
}

pub type EventSender = Option<UnboundedSender<TurnEvent>>;

// A closed receiver means the surface was torn down; the turn carries on.
fn emit(events: &EventSender, event: TurnEvent) {
    if let Some(tx) = events {
        if tx.send(event).is_err() {
            log::debug!("Turn event dropped, receiver closed");
        }
    }
}

#[derive(Clone)]
pub struct ConversationAssembler {
    state: AppState,
}

impl ConversationAssembler {
    pub fn new(state: AppState) -> Self {
        Self { state }
    }

    pub fn state(&self) -> &AppState {
        &self.state
    }

    /// Starts a conversation on `provider` (the settings default when `None`)
    /// with that provider's configured model.
    pub async fn create_conversation(
        &self,
        provider: Option<ProviderId>,
        project_id: Option<Uuid>,
    ) -> Result<Conversation, TurnError> {
        let (provider, model) = {
            let settings = self.state.settings.read().await;
            let provider = provider.unwrap_or(settings.default_provider);
            let model = settings
                .provider(provider)
                .map(|c| c.effective_model().to_string())
                .unwrap_or_else(|| provider.default_model().to_string());
            (provider, model)
        };
        self.state
            .storage
            .create_conversation(provider, &model, project_id)
            .await
            .map_err(TurnError::Storage)
    }

    /// Runs a turn on a background task. Dropping the event receiver stops
    /// updates but the call and its persistence still complete.
    pub fn spawn_send(
        &self,
        conversation_id: Uuid,
        outgoing: OutgoingMessage,
        events: EventSender,
    ) -> JoinHandle<Result<TurnOutcome, TurnError>> {
        let assembler = self.clone();
        tokio::spawn(async move { assembler.send(conversation_id, outgoing, events).await })
    }

    /// Sends one user turn and waits for the assistant reply to be stored.
    pub async fn send(
        &self,
        conversation_id: Uuid,
        outgoing: OutgoingMessage,
        events: EventSender,
    ) -> Result<TurnOutcome, TurnError> {
        let _guard = self
            .state
            .try_begin_turn(conversation_id)
            .ok_or(TurnError::Busy(conversation_id))?;

        if outgoing.is_empty() {
            log::warn!("Ignoring empty message for conversation {}", conversation_id);
            return Err(TurnError::EmptyMessage);
        }

        let storage = &self.state.storage;
        let conversation = storage
            .get_conversation(conversation_id)
            .await
            .map_err(TurnError::Storage)?
            .ok_or(TurnError::ConversationNotFound(conversation_id))?;

        // --- Compose and store the user message ---
        let screenshot = outgoing.screenshot.map(prepare_screenshot).transpose()?;
        let user_message = Message::user(outgoing.text, screenshot);
        let conversation = storage
            .append_message(conversation_id, &user_message)
            .await
            .map_err(TurnError::Storage)?;
        log::info!("User message {} saved.", user_message.id);
        emit(
            &events,
            TurnEvent::UserMessageStored {
                conversation_id,
                message: user_message,
            },
        );

        // --- Resolve the provider for this conversation ---
        let provider = conversation.provider;
        let (connector, system_prompt) = {
            let settings = self.state.settings.read().await;
            let connector = match settings.provider(provider) {
                Some(provider_config) => {
                    let mut provider_config = provider_config.clone();
                    if !conversation.model.trim().is_empty() {
                        provider_config.model = conversation.model.clone();
                    }
                    let api_key = config::resolve_api_key(&provider_config);
                    api::connector_for(&provider_config, api_key, self.state.http.clone())
                }
                None => Err(ConnectorError::configuration(provider, "provider has no settings entry")),
            };
            (connector, settings.effective_system_prompt())
        };

        let connector = match connector {
            Ok(connector) => connector,
            Err(e) => {
                log::warn!("Not sending turn for conversation {}: {}", conversation_id, e);
                let text = format!("Cannot send this message: {}. Update the provider settings and try again.", e);
                let reply = Message::assistant(text, provider, conversation.model.clone());
                return self
                    .record_reply(conversation_id, reply, Some(e.to_string()), TurnStatus::NotConfigured, &events)
                    .await;
            }
        };

        // --- Stream the reply ---
        let message_id = Uuid::new_v4();
        log::info!(
            "Starting stream request for conversation {} ({} / {})",
            conversation_id,
            connector.provider(),
            connector.model()
        );
        let result = stream_reply(
            connector.as_ref(),
            &conversation,
            system_prompt.as_deref(),
            message_id,
            &events,
        )
        .await;

        let model = connector.model().to_string();
        match result {
            Ok(text) => {
                log::info!("Stream finished for conversation {} ({} chars)", conversation_id, text.len());
                let mut reply = Message::assistant(text, provider, model);
                reply.id = message_id;
                self.record_reply(conversation_id, reply, None, TurnStatus::Completed, &events)
                    .await
            }
            Err(e) => {
                // Partial text is discarded in favour of one error message
                log::error!("Turn failed for conversation {}: {}", conversation_id, e);
                let mut reply = Message::assistant(format!("Error: {}", e), provider, model);
                reply.id = message_id;
                self.record_reply(conversation_id, reply, Some(e.to_string()), TurnStatus::Failed, &events)
                    .await
            }
        }
    }

    async fn record_reply(
        &self,
        conversation_id: Uuid,
        mut reply: Message,
        error: Option<String>,
        status: TurnStatus,
        events: &EventSender,
    ) -> Result<TurnOutcome, TurnError> {
        reply.status = status;
        let conversation = self
            .state
            .storage
            .append_message(conversation_id, &reply)
            .await
            .map_err(TurnError::Storage)?;

        let event = match error {
            None => TurnEvent::Finished {
                conversation_id,
                message: reply.clone(),
            },
            Some(error) => TurnEvent::Failed {
                conversation_id,
                message: reply.clone(),
                error,
            },
        };
        emit(events, event);

        Ok(TurnOutcome {
            conversation,
            reply,
            status,
        })
    }
}

/// Flattens the shape log onto the raw image unless that already happened.
fn prepare_screenshot(mut screenshot: Screenshot) -> Result<Screenshot, TurnError> {
    if screenshot.flattened_image.is_none() && !screenshot.shapes.is_empty() {
        let flattened = annotate::flatten_onto(&screenshot.raw_image, &screenshot.shapes).map_err(TurnError::Image)?;
        log::debug!("Flattened {} shapes onto screenshot", screenshot.shapes.len());
        screenshot.flattened_image = Some(flattened);
    }
    Ok(screenshot)
}

async fn stream_reply(
    connector: &dyn ProviderConnector,
    conversation: &Conversation,
    system_prompt: Option<&str>,
    message_id: Uuid,
    events: &EventSender,
) -> Result<String, ConnectorError> {
    let conversation_id = conversation.id;
    let mut first_chunk = true;
    let mut on_chunk = |delta: &str, is_final: bool| {
        if is_final {
            return;
        }
        log::debug!("Received chunk for message {}", message_id);
        emit(
            events,
            TurnEvent::Chunk {
                conversation_id,
                message_id,
                delta: delta.to_string(),
                is_first_chunk: first_chunk,
            },
        );
        first_chunk = false;
    };
    let history: Vec<Message> = conversation
        .messages
        .iter()
        .filter(|m| m.belongs_in_history())
        .cloned()
        .collect();
    connector.send(&history, system_prompt, &mut on_chunk).await
}
