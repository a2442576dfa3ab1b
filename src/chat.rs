//! Clinical assistant chat with supersede-on-send cancellation.
//!
//! Only the newest outstanding request may append a reply. Sending a message
//! bumps a generation counter; when a response resolves it is applied only
//! if the counter still matches, so a reply to a superseded request is
//! discarded instead of landing out of order in the conversation.

use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, warn};

use crate::gateway::{Gateway, GatewayError};

/// One conversation turn
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: "assistant".to_string(),
            content: content.into(),
        }
    }
}

/// Assistant response returned by the backend
#[derive(Debug, Clone, Deserialize)]
pub struct ChatReply {
    pub content: String,
    #[serde(default)]
    pub tools_used: Vec<String>,
}

/// Conversation snapshot for display
#[derive(Debug, Clone, Default)]
pub struct ChatSnapshot {
    pub messages: Vec<ChatMessage>,
    pub busy: bool,
    pub error: Option<String>,
}

#[derive(Default)]
struct ChatData {
    messages: Vec<ChatMessage>,
    busy: bool,
    error: Option<String>,
    /// Bumped on every send; stale responses compare unequal and are dropped
    generation: u64,
}

pub struct ChatCoordinator {
    gateway: Gateway,
    data: Mutex<ChatData>,
}

impl ChatCoordinator {
    pub fn new(gateway: Gateway) -> Self {
        Self {
            gateway,
            data: Mutex::new(ChatData::default()),
        }
    }

    pub fn snapshot(&self) -> ChatSnapshot {
        let data = self.data.lock().unwrap();
        ChatSnapshot {
            messages: data.messages.clone(),
            busy: data.busy,
            error: data.error.clone(),
        }
    }

    /// Send a message. Any outstanding request is superseded; its eventual
    /// result is discarded.
    pub async fn send(&self, text: impl Into<String>) {
        let (generation, messages) = {
            let mut data = self.data.lock().unwrap();
            data.messages.push(ChatMessage::user(text));
            data.generation = data.generation.wrapping_add(1);
            data.busy = true;
            data.error = None;
            (data.generation, data.messages.clone())
        };

        let outcome = self.gateway.clinical_chat_send(&messages).await;

        let mut data = self.data.lock().unwrap();
        if data.generation != generation {
            debug!("discarding reply to a superseded chat request");
            return;
        }
        data.busy = false;
        match outcome {
            Ok(reply) => {
                data.messages.push(ChatMessage::assistant(reply.content));
            }
            Err(e) => {
                warn!(error = %e, "chat request failed");
                data.error = Some(e.to_string());
            }
        }
    }

    /// Drop the conversation
    pub fn clear(&self) {
        let mut data = self.data.lock().unwrap();
        data.messages.clear();
        data.error = None;
        data.busy = false;
        data.generation = data.generation.wrapping_add(1);
    }
}

impl Gateway {
    pub async fn clinical_chat_send(
        &self,
        messages: &[ChatMessage],
    ) -> Result<ChatReply, GatewayError> {
        self.call("clinical_chat_send", json!({ "messages": messages }))
            .await
    }
}
