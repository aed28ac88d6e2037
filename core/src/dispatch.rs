/// Event dispatcher: routes classified envelopes to the host sink
///
/// `handle` returns whether the envelope may be considered consumed. The
/// poll loop only advances its watermark past envelopes that returned true.
use crate::bridge::{
    BridgeEvent, ChatKey, EventSender, EventSink, IdentityResolver, ReactionOp,
};
use crate::html::emoji::unified_to_unicode;
use crate::ids::{ChatId, LoginId, MessageId, UserId};
use crate::msgconv::{self, ConvertedMessage, MediaFetcher};
use crate::poll::EnvelopeHandler;
use crate::zulip::events::{MessageEvent, ReactionEvent, TopicObservation};
use crate::zulip::{MessageData, RawEnvelope, ZulipEvent};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, warn};

const UNICODE_REACTION_TYPES: &[&str] = &["unicode_emoji", "unicode"];

pub struct Dispatcher {
    login: LoginId,
    base_url: String,
    sink: Arc<dyn EventSink>,
    resolver: Arc<dyn IdentityResolver>,
    fetcher: Option<Arc<dyn MediaFetcher>>,
    split_portals: bool,
}

impl Dispatcher {
    pub fn new(
        login: LoginId,
        base_url: impl Into<String>,
        sink: Arc<dyn EventSink>,
        resolver: Arc<dyn IdentityResolver>,
    ) -> Self {
        Self {
            login,
            base_url: base_url.into(),
            sink,
            resolver,
            fetcher: None,
            split_portals: false,
        }
    }

    pub fn with_media_fetcher(mut self, fetcher: Arc<dyn MediaFetcher>) -> Self {
        self.fetcher = Some(fetcher);
        self
    }

    /// Give every login its own copy of channel chats
    pub fn with_split_portals(mut self, split: bool) -> Self {
        self.split_portals = split;
        self
    }

    pub async fn handle(&self, envelope: &RawEnvelope) -> bool {
        match envelope.classify() {
            ZulipEvent::UserTopic(evt) => match evt.topic() {
                Some(topic) => self.upsert_topic(&topic).await,
                None => true,
            },
            ZulipEvent::Message(evt) => self.handle_message(&evt).await,
            ZulipEvent::Reaction(evt) => self.handle_reaction(&evt).await,
            ZulipEvent::Heartbeat => true,
            ZulipEvent::Unknown(event_type) => {
                debug!("Ignoring unsupported event {} of type {}", envelope.id, event_type);
                true
            }
            ZulipEvent::Malformed { event_type, reason } => {
                warn!(
                    "Skipping malformed {} event {}: {}",
                    event_type, envelope.id, reason
                );
                true
            }
        }
    }

    fn channel_key(&self, stream_id: u64) -> ChatKey {
        let id = ChatId::channel(stream_id);
        if self.split_portals {
            ChatKey::owned_by(id, self.login)
        } else {
            ChatKey::shared(id)
        }
    }

    fn chat_key(&self, msg: &MessageData) -> ChatKey {
        if !msg.is_direct() {
            return self.channel_key(msg.stream_id);
        }
        let own = self.login.0;
        let others = msg.participant_ids().into_iter().filter(|id| *id != own);
        ChatKey::owned_by(ChatId::direct(others), self.login)
    }

    fn sender(&self, user_id: u64) -> EventSender {
        EventSender {
            is_from_me: user_id == self.login.0,
            sender_login: Some(LoginId(user_id)),
            sender: Some(UserId(user_id)),
        }
    }

    async fn upsert_topic(&self, topic: &TopicObservation) -> bool {
        let event = BridgeEvent::TopicUpsert {
            chat: self.channel_key(topic.stream_id),
            id: MessageId::topic(&topic.name),
            stream_id: topic.stream_id,
            name: topic.name.clone(),
            content: ConvertedMessage::notice(format!("Topic created: {}", topic.name)),
        };
        self.deliver(event).await
    }

    async fn handle_message(&self, evt: &MessageEvent) -> bool {
        let msg = &evt.message;
        if let Some(topic) = msg.topic() {
            if !self.upsert_topic(&topic).await {
                return false;
            }
        }
        let content = match msgconv::convert_message(
            msg,
            &self.base_url,
            self.resolver.as_ref(),
            self.fetcher.as_deref(),
        )
        .await
        {
            Ok(content) => content,
            Err(e) => {
                warn!("Failed to convert message {}: {}", msg.id, e);
                return false;
            }
        };
        let event = BridgeEvent::Message {
            chat: self.chat_key(msg),
            sender: self.sender(msg.sender_id),
            id: MessageId::Remote(msg.id),
            timestamp: msg.sent_at(),
            stream_order: msg.id,
            transaction_id: evt.local_id(),
            create_chat: true,
            content,
        };
        self.deliver(event).await
    }

    async fn handle_reaction(&self, evt: &ReactionEvent) -> bool {
        let op = match evt.op.as_str() {
            "add" => ReactionOp::Add,
            "remove" => ReactionOp::Remove,
            other => {
                debug!("Ignoring reaction with unknown op {}", other);
                return true;
            }
        };
        let target = MessageId::Remote(evt.message_id);
        let chat = match self.sink.message_chat(&target).await {
            Ok(Some(chat)) => chat,
            Ok(None) => {
                debug!("Reaction target {} not bridged yet", target);
                return true;
            }
            Err(e) => {
                warn!("Failed to look up chat of message {}: {}", target, e);
                return false;
            }
        };
        let event = BridgeEvent::Reaction {
            op,
            chat,
            target,
            sender: self.sender(evt.user_id),
            emoji: reaction_emoji(evt),
            emoji_id: evt.emoji_code.clone(),
        };
        self.deliver(event).await
    }

    async fn deliver(&self, event: BridgeEvent) -> bool {
        let kind = event.kind();
        match self.sink.queue_remote_event(event).await {
            Ok(()) => true,
            Err(e) => {
                warn!("Sink rejected {} event: {}", kind, e);
                false
            }
        }
    }
}

#[async_trait]
impl EnvelopeHandler for Dispatcher {
    async fn handle(&self, envelope: &RawEnvelope) -> bool {
        Dispatcher::handle(self, envelope).await
    }
}

/// Literal unicode for standard emoji, `:name:` for realm emoji
pub fn reaction_emoji(evt: &ReactionEvent) -> String {
    if UNICODE_REACTION_TYPES.contains(&evt.reaction_type.as_str()) {
        let decoded = unified_to_unicode(&evt.emoji_code);
        if !decoded.is_empty() {
            return decoded;
        }
    }
    format!(":{}:", evt.emoji_name)
}
