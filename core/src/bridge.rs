/// Host-facing types and capabilities
///
/// The core produces [`BridgeEvent`]s and connectivity [`BridgeState`]s and
/// consumes identity lookups. Everything the host provides is a trait so the
/// poll loop and dispatcher can be driven by in-memory fakes in tests.
use crate::error::Result;
use crate::ids::{ChatId, LoginId, MessageId, UserId};
use crate::msgconv::ConvertedMessage;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A resolved native identity on the host side
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostIdentity {
    pub id: String,
    pub uri: String,
}

impl HostIdentity {
    pub fn new(id: impl Into<String>, uri: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            uri: uri.into(),
        }
    }
}

/// Chat plus the login it belongs to, when the chat is not shared between logins
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChatKey {
    pub id: ChatId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub receiver: Option<LoginId>,
}

impl ChatKey {
    pub fn shared(id: ChatId) -> Self {
        Self { id, receiver: None }
    }

    pub fn owned_by(id: ChatId, receiver: LoginId) -> Self {
        Self {
            id,
            receiver: Some(receiver),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventSender {
    pub is_from_me: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender_login: Option<LoginId>,
    pub sender: Option<UserId>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReactionOp {
    Add,
    Remove,
}

/// Events delivered to the host sink
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BridgeEvent {
    /// Synthetic "topic created" notice that anchors the topic's thread
    TopicUpsert {
        chat: ChatKey,
        id: MessageId,
        stream_id: u64,
        name: String,
        content: ConvertedMessage,
    },
    Message {
        chat: ChatKey,
        sender: EventSender,
        id: MessageId,
        timestamp: DateTime<Utc>,
        stream_order: u64,
        transaction_id: Option<String>,
        create_chat: bool,
        content: ConvertedMessage,
    },
    Reaction {
        op: ReactionOp,
        chat: ChatKey,
        target: MessageId,
        sender: EventSender,
        emoji: String,
        emoji_id: String,
    },
}

impl BridgeEvent {
    pub fn chat(&self) -> &ChatKey {
        match self {
            BridgeEvent::TopicUpsert { chat, .. }
            | BridgeEvent::Message { chat, .. }
            | BridgeEvent::Reaction { chat, .. } => chat,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            BridgeEvent::TopicUpsert { .. } => "topic_upsert",
            BridgeEvent::Message { .. } => "message",
            BridgeEvent::Reaction { .. } => "reaction",
        }
    }
}

/// Accepts converted events from the dispatcher
#[async_trait]
pub trait EventSink: Send + Sync {
    async fn queue_remote_event(&self, event: BridgeEvent) -> Result<()>;

    /// Chat of a message the host has already seen, if any
    async fn message_chat(&self, id: &MessageId) -> Result<Option<ChatKey>>;
}

/// Maps remote user ids to native identities. Called in place during HTML
/// conversion, so it must not block for long.
pub trait IdentityResolver: Send + Sync {
    /// Placeholder identity that always exists for a remote user
    fn ghost(&self, user: UserId) -> Result<HostIdentity>;

    /// Native identity of a user who logged into the bridge, if any
    fn login(&self, login: LoginId) -> Result<Option<HostIdentity>>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StateEvent {
    Connecting,
    Connected,
    TransientDisconnect,
    UnknownError,
}

/// Connectivity status of one login
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BridgeState {
    pub state_event: StateEvent,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub info: Option<Value>,
}

impl BridgeState {
    pub fn new(state_event: StateEvent) -> Self {
        Self {
            state_event,
            error: None,
            info: None,
        }
    }

    pub fn with_error(state_event: StateEvent, code: &str, message: impl Into<String>) -> Self {
        Self {
            state_event,
            error: Some(code.to_string()),
            info: Some(serde_json::json!({ "message": message.into() })),
        }
    }
}

pub trait StatusReporter: Send + Sync {
    fn send_state(&self, state: BridgeState);
}
