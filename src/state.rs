use crate::config::Settings;
use crate::storage::ConversationStore;
use dashmap::DashMap;
use reqwest::Client;
use std::sync::Arc;
use tokio::sync::RwLock;
use uuid::Uuid;

// Core application state shared by the turn loop and the command handlers
#[derive(Clone)] // Allow cloning for background tasks
pub struct AppState {
    pub storage: Arc<dyn ConversationStore>,
    // Read at send time; edits from a settings surface take effect on the next turn
    pub settings: Arc<RwLock<Settings>>,
    pub http: Client,
    // Conversations with a reply currently streaming
    pub in_flight: Arc<DashMap<Uuid, ()>>,
}

impl AppState {
    pub fn new(storage: Arc<dyn ConversationStore>, settings: Settings) -> Self {
        Self::with_client(storage, settings, Client::new())
    }

    pub fn with_client(storage: Arc<dyn ConversationStore>, settings: Settings, http: Client) -> Self {
        Self {
            storage,
            settings: Arc::new(RwLock::new(settings)),
            http,
            in_flight: Arc::new(DashMap::new()),
        }
    }

    /// Marks `conversation_id` busy. Returns `None` if a turn is already
    /// running for it; the guard clears the mark when dropped.
    pub fn try_begin_turn(&self, conversation_id: Uuid) -> Option<TurnGuard> {
        use dashmap::mapref::entry::Entry;
        match self.in_flight.entry(conversation_id) {
            Entry::Occupied(_) => None,
            Entry::Vacant(slot) => {
                slot.insert(());
                Some(TurnGuard {
                    in_flight: Arc::clone(&self.in_flight),
                    conversation_id,
                })
            }
        }
    }

    pub fn is_busy(&self, conversation_id: Uuid) -> bool {
        self.in_flight.contains_key(&conversation_id)
    }
}

pub struct TurnGuard {
    in_flight: Arc<DashMap<Uuid, ()>>,
    conversation_id: Uuid,
}

impl Drop for TurnGuard {
    fn drop(&mut self) {
        self.in_flight.remove(&self.conversation_id);
    }
}
