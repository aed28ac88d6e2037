/// Identifier codec: text forms for Zulip users, logins, messages and chats
///
/// Chat ids are canonical: `stream:<id>` for channels and
/// `dm:<sorted, comma-joined ids>` for direct and group chats.
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

const TOPIC_PREFIX: &str = "topic:";

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum IdError {
    #[error("missing ':' separator in {0:?}")]
    MissingSeparator(String),

    #[error("unknown id prefix {prefix:?} in {input:?}")]
    UnknownPrefix { prefix: String, input: String },

    #[error("invalid number {component:?} in {input:?}")]
    InvalidNumber { component: String, input: String },
}

fn parse_number(component: &str, input: &str) -> Result<u64, IdError> {
    component.parse::<u64>().map_err(|_| IdError::InvalidNumber {
        component: component.to_string(),
        input: input.to_string(),
    })
}

/// Remote user, used for ghosts and message senders
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(pub u64);

/// Remote account that logged into the bridge (same number space as [`UserId`])
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LoginId(pub u64);

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for LoginId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for UserId {
    type Err = IdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        parse_number(s, s).map(UserId)
    }
}

impl FromStr for LoginId {
    type Err = IdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        parse_number(s, s).map(LoginId)
    }
}

/// Message identity: a real remote message, or the synthetic
/// "topic created" notice that anchors a topic thread.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub enum MessageId {
    Remote(u64),
    Topic(String),
}

impl MessageId {
    pub fn topic(name: impl Into<String>) -> Self {
        MessageId::Topic(name.into())
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MessageId::Remote(id) => write!(f, "{}", id),
            MessageId::Topic(name) => write!(f, "{}{}", TOPIC_PREFIX, name),
        }
    }
}

impl FromStr for MessageId {
    type Err = IdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if let Some(name) = s.strip_prefix(TOPIC_PREFIX) {
            return Ok(MessageId::Topic(name.to_string()));
        }
        parse_number(s, s).map(MessageId::Remote)
    }
}

impl From<MessageId> for String {
    fn from(id: MessageId) -> Self {
        id.to_string()
    }
}

impl TryFrom<String> for MessageId {
    type Error = IdError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

/// Sorted, deduplicated participants of a direct chat. Only
/// [`ChatId::direct`] builds one.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Participants(Vec<u64>);

impl Participants {
    pub fn as_slice(&self) -> &[u64] {
        &self.0
    }
}

/// Chat identity
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub enum ChatId {
    Channel(u64),
    Direct(Participants),
}

impl ChatId {
    pub fn channel(stream_id: u64) -> Self {
        ChatId::Channel(stream_id)
    }

    pub fn direct(participants: impl IntoIterator<Item = u64>) -> Self {
        let mut users: Vec<u64> = participants.into_iter().collect();
        users.sort_unstable();
        users.dedup();
        ChatId::Direct(Participants(users))
    }

    pub fn is_direct(&self) -> bool {
        matches!(self, ChatId::Direct(_))
    }
}

impl fmt::Display for ChatId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChatId::Channel(stream_id) => write!(f, "stream:{}", stream_id),
            ChatId::Direct(users) => {
                let joined: Vec<String> = users.as_slice().iter().map(|u| u.to_string()).collect();
                write!(f, "dm:{}", joined.join(","))
            }
        }
    }
}

impl FromStr for ChatId {
    type Err = IdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (prefix, rest) = s
            .split_once(':')
            .ok_or_else(|| IdError::MissingSeparator(s.to_string()))?;
        match prefix {
            "stream" => parse_number(rest, s).map(ChatId::Channel),
            "dm" => {
                // Self-DMs have no other participants
                if rest.is_empty() {
                    return Ok(ChatId::direct([]));
                }
                let users = rest
                    .split(',')
                    .map(|part| parse_number(part, s))
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(ChatId::direct(users))
            }
            other => Err(IdError::UnknownPrefix {
                prefix: other.to_string(),
                input: s.to_string(),
            }),
        }
    }
}

impl From<ChatId> for String {
    fn from(id: ChatId) -> Self {
        id.to_string()
    }
}

impl TryFrom<String> for ChatId {
    type Error = IdError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}
