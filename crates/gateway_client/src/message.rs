use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// One event delivered by the messaging gateway's webhook.
///
/// `remote_jid` is the provider-side conversation address, e.g.
/// `5511999990000@s.whatsapp.net` for a direct chat. The pair
/// `(connection_id, remote_jid)` identifies a conversation.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct InboundEvent {
    pub connection_id: Uuid,
    pub remote_jid: String,
    pub content: MessageContent,
    pub timestamp: DateTime<Utc>,
}

impl InboundEvent {
    pub fn text(
        connection_id: Uuid,
        remote_jid: impl Into<String>,
        text: impl Into<String>,
    ) -> Self {
        Self {
            connection_id,
            remote_jid: remote_jid.into(),
            content: MessageContent::Text { text: text.into() },
            timestamp: Utc::now(),
        }
    }

    /// The text body, if the event carries one. Media captions count.
    pub fn text_body(&self) -> Option<&str> {
        match &self.content {
            MessageContent::Text { text } => Some(text),
            MessageContent::Media { media } => media.caption.as_deref(),
        }
    }

    /// Phone part of the jid, everything before the `@`.
    pub fn contact_phone(&self) -> &str {
        self.remote_jid
            .split('@')
            .next()
            .unwrap_or(self.remote_jid.as_str())
    }
}

/// One message to push through the gateway.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct OutboundMessage {
    pub connection_id: Uuid,
    pub to: String,
    pub content: MessageContent,
}

impl OutboundMessage {
    pub fn text(connection_id: Uuid, to: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            connection_id,
            to: to.into(),
            content: MessageContent::Text { text: text.into() },
        }
    }

    pub fn media(connection_id: Uuid, to: impl Into<String>, media: MediaPayload) -> Self {
        Self {
            connection_id,
            to: to.into(),
            content: MessageContent::Media { media },
        }
    }

    pub fn text_body(&self) -> Option<&str> {
        match &self.content {
            MessageContent::Text { text } => Some(text),
            MessageContent::Media { media } => media.caption.as_deref(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
pub enum MessageContent {
    Text { text: String },
    Media { media: MediaPayload },
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct MediaPayload {
    pub kind: MediaKind,
    pub url: String,
    pub mime_type: String,
    pub caption: Option<String>,
    pub file_name: Option<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
pub enum MediaKind {
    Image,
    Video,
    Audio,
    Document,
}

/// Returned by the gateway once it has accepted a message.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct DeliveryReceipt {
    pub provider_message_id: String,
    pub timestamp: DateTime<Utc>,
}

impl DeliveryReceipt {
    pub fn new(provider_message_id: impl Into<String>) -> Self {
        Self {
            provider_message_id: provider_message_id.into(),
            timestamp: Utc::now(),
        }
    }
}
