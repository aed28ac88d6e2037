/// Event queue envelopes and their typed payloads
use chrono::{DateTime, TimeZone, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const MESSAGE: &str = "message";
pub const REACTION: &str = "reaction";
pub const USER_TOPIC: &str = "user_topic";
pub const HEARTBEAT: &str = "heartbeat";

/// One entry of a `GET /events` batch, before classification
#[derive(Debug, Clone, PartialEq)]
pub struct RawEnvelope {
    pub id: i64,
    pub event_type: String,
    pub op: Option<String>,
    /// The whole event object, including `id` and `type`
    pub payload: Value,
}

impl RawEnvelope {
    /// Fails only when the envelope has no numeric id to order it by.
    pub fn from_value(payload: Value) -> std::result::Result<Self, String> {
        let id = payload
            .get("id")
            .and_then(Value::as_i64)
            .ok_or_else(|| "missing numeric id".to_string())?;
        // A missing type classifies as malformed
        let event_type = payload
            .get("type")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let op = payload.get("op").and_then(Value::as_str).map(str::to_string);
        Ok(Self {
            id,
            event_type,
            op,
            payload,
        })
    }

    pub fn classify(&self) -> ZulipEvent {
        match self.event_type.as_str() {
            MESSAGE => self.decode(ZulipEvent::Message),
            REACTION => self.decode(ZulipEvent::Reaction),
            USER_TOPIC => self.decode(ZulipEvent::UserTopic),
            HEARTBEAT => ZulipEvent::Heartbeat,
            "" => ZulipEvent::Malformed {
                event_type: String::new(),
                reason: format!("event {} has no type", self.id),
            },
            other => ZulipEvent::Unknown(other.to_string()),
        }
    }

    fn decode<T: DeserializeOwned>(&self, wrap: impl FnOnce(T) -> ZulipEvent) -> ZulipEvent {
        match serde_json::from_value(self.payload.clone()) {
            Ok(value) => wrap(value),
            Err(e) => ZulipEvent::Malformed {
                event_type: self.event_type.clone(),
                reason: e.to_string(),
            },
        }
    }
}

/// Closed set of events the dispatcher understands
#[derive(Debug, Clone, PartialEq)]
pub enum ZulipEvent {
    Message(MessageEvent),
    Reaction(ReactionEvent),
    UserTopic(UserTopicEvent),
    Heartbeat,
    Unknown(String),
    Malformed { event_type: String, reason: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageEvent {
    pub message: MessageData,
    #[serde(default)]
    pub flags: Vec<String>,
    /// Set when the message was sent by this client
    #[serde(default)]
    pub local_message_id: Option<Value>,
}

impl MessageEvent {
    /// Client-side id as text; servers have sent both strings and numbers here
    pub fn local_id(&self) -> Option<String> {
        match self.local_message_id.as_ref()? {
            Value::String(s) => Some(s.clone()),
            Value::Number(n) => Some(n.to_string()),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecipientUser {
    pub id: u64,
    #[serde(default)]
    pub email: String,
    #[serde(default)]
    pub full_name: String,
}

/// Channel name for channel messages, participant list for direct messages
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum DisplayRecipient {
    Channel(String),
    Users(Vec<RecipientUser>),
}

impl Default for DisplayRecipient {
    fn default() -> Self {
        DisplayRecipient::Users(Vec::new())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageData {
    pub id: u64,
    /// Zero for direct and group direct messages
    #[serde(default)]
    pub stream_id: u64,
    #[serde(default)]
    pub subject: String,
    pub sender_id: u64,
    #[serde(default)]
    pub sender_full_name: String,
    #[serde(default)]
    pub sender_email: String,
    #[serde(default)]
    pub recipient_id: u64,
    #[serde(default)]
    pub display_recipient: DisplayRecipient,
    pub timestamp: i64,
    /// Rendered HTML
    #[serde(default)]
    pub content: String,
}

impl MessageData {
    pub fn is_direct(&self) -> bool {
        self.stream_id == 0
    }

    pub fn participant_ids(&self) -> Vec<u64> {
        match &self.display_recipient {
            DisplayRecipient::Users(users) => users.iter().map(|u| u.id).collect(),
            DisplayRecipient::Channel(_) => Vec::new(),
        }
    }

    pub fn topic(&self) -> Option<TopicObservation> {
        TopicObservation::new(self.stream_id, &self.subject)
    }

    pub fn sent_at(&self) -> DateTime<Utc> {
        Utc.timestamp_opt(self.timestamp, 0)
            .single()
            .unwrap_or_else(Utc::now)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReactionEvent {
    pub op: String,
    pub message_id: u64,
    pub user_id: u64,
    #[serde(default)]
    pub emoji_name: String,
    #[serde(default)]
    pub emoji_code: String,
    #[serde(default)]
    pub reaction_type: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserTopicEvent {
    pub stream_id: u64,
    #[serde(default)]
    pub topic_name: String,
    #[serde(default)]
    pub last_updated: i64,
    #[serde(default)]
    pub visibility_policy: Value,
}

impl UserTopicEvent {
    pub fn topic(&self) -> Option<TopicObservation> {
        TopicObservation::new(self.stream_id, &self.topic_name)
    }
}

/// A (channel, topic) pair seen on the wire
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TopicObservation {
    pub stream_id: u64,
    pub name: String,
}

impl TopicObservation {
    fn new(stream_id: u64, name: &str) -> Option<Self> {
        if stream_id == 0 || name.is_empty() {
            return None;
        }
        Some(Self {
            stream_id,
            name: name.to_string(),
        })
    }
}
