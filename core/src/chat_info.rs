/// Chat and user metadata for the host
use crate::bridge::EventSender;
use crate::error::Result;
use crate::ids::{ChatId, LoginId, UserId};
use crate::zulip::{Stream, User, ZulipClient};
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

const CAPABILITIES_ID: &str = "fi.mau.zulip.capabilities.2025_10_02";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RoomType {
    Default,
    Dm,
    GroupDm,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChatMember {
    pub sender: EventSender,
    pub membership: &'static str,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MemberList {
    pub is_full: bool,
    pub total_member_count: usize,
    pub members: BTreeMap<u64, ChatMember>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub other_user: Option<UserId>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChatInfo {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub topic: Option<String>,
    pub room_type: RoomType,
    pub members: MemberList,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Avatar {
    pub id: String,
    pub url: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UserInfo {
    pub identifiers: Vec<String>,
    pub name: String,
    pub avatar: Option<Avatar>,
    pub is_bot: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CapLevel {
    FullySupported,
    Unsupported,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RoomCapabilities {
    pub id: String,
    pub thread: CapLevel,
}

fn member(own: LoginId, user_id: u64) -> ChatMember {
    ChatMember {
        sender: EventSender {
            is_from_me: user_id == own.0,
            sender_login: Some(LoginId(user_id)),
            sender: Some(UserId(user_id)),
        },
        membership: "join",
    }
}

fn member_map(own: LoginId, members: &[u64]) -> BTreeMap<u64, ChatMember> {
    members.iter().map(|m| (*m, member(own, *m))).collect()
}

/// `members` excludes the logged-in user, who is added as joined.
pub fn wrap_dm_info(own: LoginId, members: &[u64]) -> ChatInfo {
    let (room_type, other_user) = match members {
        [other] => (RoomType::Dm, Some(UserId(*other))),
        _ => (RoomType::GroupDm, None),
    };
    let mut map = member_map(own, members);
    map.insert(own.0, member(own, own.0));
    ChatInfo {
        name: None,
        topic: None,
        room_type,
        members: MemberList {
            is_full: true,
            total_member_count: members.len(),
            members: map,
            other_user,
        },
    }
}

/// `subscribers` is None when the subscriber list couldn't be fetched.
pub fn wrap_channel_info(own: LoginId, stream: &Stream, subscribers: Option<&[u64]>) -> ChatInfo {
    let members = subscribers.unwrap_or_default();
    ChatInfo {
        name: Some(stream.name.clone()),
        topic: Some(stream.description.clone()),
        room_type: RoomType::Default,
        members: MemberList {
            is_full: subscribers.is_some(),
            total_member_count: members.len(),
            members: member_map(own, members),
            other_user: None,
        },
    }
}

pub fn wrap_user_info(user: &User) -> UserInfo {
    let delivery_email = user.delivery_email.as_deref().unwrap_or_default();
    let identifiers = if delivery_email.is_empty() {
        Vec::new()
    } else {
        vec![format!("mailto:{}", delivery_email)]
    };
    UserInfo {
        identifiers,
        name: user.full_name.clone(),
        avatar: wrap_avatar(user.avatar_version, user.avatar_url.as_deref(), delivery_email),
        is_bot: user.is_bot,
    }
}

fn wrap_avatar(version: u64, url: Option<&str>, email: &str) -> Option<Avatar> {
    let url = match url.filter(|u| !u.is_empty()) {
        Some(url) => url.to_string(),
        None if email.is_empty() => return None,
        None => gravatar_url(email),
    };
    Some(Avatar {
        id: version.to_string(),
        url,
    })
}

pub fn gravatar_url(email: &str) -> String {
    let digest = Sha256::digest(email.as_bytes());
    let hex: String = digest.iter().map(|b| format!("{:02x}", b)).collect();
    format!("https://www.gravatar.com/avatar/{}", hex)
}

pub fn room_capabilities(chat: &ChatId) -> RoomCapabilities {
    if chat.is_direct() {
        RoomCapabilities {
            id: format!("{}+dm", CAPABILITIES_ID),
            thread: CapLevel::Unsupported,
        }
    } else {
        RoomCapabilities {
            id: CAPABILITIES_ID.to_string(),
            thread: CapLevel::FullySupported,
        }
    }
}

pub async fn fetch_chat_info(client: &ZulipClient, own: LoginId, chat: &ChatId) -> Result<ChatInfo> {
    match chat {
        ChatId::Direct(members) => Ok(wrap_dm_info(own, members.as_slice())),
        ChatId::Channel(stream_id) => {
            let stream = client.get_stream(*stream_id).await?;
            let subscribers = client.get_stream_subscribers(*stream_id).await?;
            Ok(wrap_channel_info(own, &stream, Some(subscribers.as_slice())))
        }
    }
}

pub async fn fetch_user_info(client: &ZulipClient, user: UserId) -> Result<UserInfo> {
    Ok(wrap_user_info(&client.get_user(user).await?))
}
