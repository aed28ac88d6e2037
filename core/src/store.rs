/// Bridge state in sled: logins with their queue watermark, and which chat
/// each bridged message landed in
use crate::bridge::ChatKey;
use crate::error::{BridgeError, Result};
use crate::ids::{LoginId, MessageId};
use crate::poll::{QueueState, QueueStateStore};
use crate::zulip::Credentials;
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::{debug, info};

const LOGINS_TREE: &str = "logins";
const MESSAGES_TREE: &str = "messages";

/// Everything persisted for one logged-in account
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoginMetadata {
    pub url: String,
    pub email: String,
    pub token: String,
    #[serde(default)]
    pub full_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub queue_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_event_id: Option<i64>,
    /// Native identity of the person who owns this login
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host_user: Option<String>,
}

impl LoginMetadata {
    pub fn credentials(&self) -> Credentials {
        Credentials {
            url: self.url.clone(),
            email: self.email.clone(),
            token: self.token.clone(),
        }
    }

    pub fn queue_state(&self) -> Option<QueueState> {
        let queue_id = self.queue_id.clone().filter(|q| !q.is_empty())?;
        Some(QueueState {
            queue_id,
            last_event_id: self.last_event_id.unwrap_or(-1),
        })
    }
}

pub struct BridgeStore {
    db: sled::Db,
    logins: sled::Tree,
    messages: sled::Tree,
}

impl BridgeStore {
    pub fn new(data_dir: &Path) -> Result<Self> {
        let db_path = data_dir.join("zulink.db");
        debug!("Opening bridge store at {:?}", db_path);
        let db = sled::open(&db_path)
            .map_err(|e| BridgeError::Storage(format!("Failed to open bridge DB: {}", e)))?;
        let logins = db
            .open_tree(LOGINS_TREE)
            .map_err(|e| BridgeError::Storage(format!("logins tree: {}", e)))?;
        let messages = db
            .open_tree(MESSAGES_TREE)
            .map_err(|e| BridgeError::Storage(format!("messages tree: {}", e)))?;
        info!("Bridge store initialized at {:?}", db_path);
        Ok(Self {
            db,
            logins,
            messages,
        })
    }

    pub fn save_login(&self, login: LoginId, meta: &LoginMetadata) -> Result<()> {
        let val = serde_json::to_vec(meta)?;
        self.logins
            .insert(login.to_string().as_bytes(), val)
            .map_err(|e| BridgeError::Storage(format!("save_login: {}", e)))?;
        Ok(())
    }

    pub fn get_login(&self, login: LoginId) -> Result<Option<LoginMetadata>> {
        match self
            .logins
            .get(login.to_string().as_bytes())
            .map_err(|e| BridgeError::Storage(format!("get_login: {}", e)))?
        {
            Some(val) => Ok(Some(serde_json::from_slice(&val)?)),
            None => Ok(None),
        }
    }

    /// All logins, skipping entries that no longer decode
    pub fn list_logins(&self) -> Result<Vec<(LoginId, LoginMetadata)>> {
        let mut out = Vec::new();
        for entry in self.logins.iter() {
            let (key, val) =
                entry.map_err(|e| BridgeError::Storage(format!("list_logins: {}", e)))?;
            let id = std::str::from_utf8(&key)
                .ok()
                .and_then(|k| k.parse::<LoginId>().ok());
            if let (Some(id), Ok(meta)) = (id, serde_json::from_slice::<LoginMetadata>(&val)) {
                out.push((id, meta));
            }
        }
        Ok(out)
    }

    /// Remove a login and everything recorded for it
    pub fn remove_login(&self, login: LoginId) -> Result<bool> {
        let removed = self
            .logins
            .remove(login.to_string().as_bytes())
            .map_err(|e| BridgeError::Storage(format!("remove_login: {}", e)))?;
        for key in self.messages.scan_prefix(message_prefix(login)).keys() {
            let key = key.map_err(|e| BridgeError::Storage(format!("remove_login: {}", e)))?;
            self.messages
                .remove(key)
                .map_err(|e| BridgeError::Storage(format!("remove_login: {}", e)))?;
        }
        Ok(removed.is_some())
    }

    pub fn record_message(&self, login: LoginId, id: &MessageId, chat: &ChatKey) -> Result<()> {
        let val = serde_json::to_vec(chat)?;
        self.messages
            .insert(message_key(login, id, chat), val)
            .map_err(|e| BridgeError::Storage(format!("record_message: {}", e)))?;
        Ok(())
    }

    pub fn has_message(&self, login: LoginId, id: &MessageId, chat: &ChatKey) -> Result<bool> {
        self.messages
            .contains_key(message_key(login, id, chat))
            .map_err(|e| BridgeError::Storage(format!("has_message: {}", e)))
    }

    /// Chat a remote message was bridged into. Topic placeholders repeat
    /// across chats, so they never resolve here.
    pub fn message_chat(&self, login: LoginId, id: &MessageId) -> Result<Option<ChatKey>> {
        let MessageId::Remote(_) = id else {
            return Ok(None);
        };
        match self
            .messages
            .get(format!("{}{}", message_prefix(login), id))
            .map_err(|e| BridgeError::Storage(format!("message_chat: {}", e)))?
        {
            Some(val) => Ok(Some(serde_json::from_slice(&val)?)),
            None => Ok(None),
        }
    }

    /// Queue state view of one login, for the poll loop
    pub fn queue_state(&self, login: LoginId) -> LoginQueueState {
        LoginQueueState {
            store: self.clone(),
            login,
        }
    }

    pub fn flush(&self) -> Result<()> {
        self.db
            .flush()
            .map_err(|e| BridgeError::Storage(format!("flush: {}", e)))?;
        Ok(())
    }
}

impl Clone for BridgeStore {
    fn clone(&self) -> Self {
        Self {
            db: self.db.clone(),
            logins: self.logins.clone(),
            messages: self.messages.clone(),
        }
    }
}

fn message_prefix(login: LoginId) -> String {
    format!("{}/", login)
}

/// Remote ids are unique per server; topic placeholders only within a chat
fn message_key(login: LoginId, id: &MessageId, chat: &ChatKey) -> String {
    match (id, chat.receiver) {
        (MessageId::Remote(_), _) => format!("{}{}", message_prefix(login), id),
        (MessageId::Topic(_), None) => format!("{}{}/{}", message_prefix(login), chat.id, id),
        (MessageId::Topic(_), Some(receiver)) => {
            format!("{}{}@{}/{}", message_prefix(login), chat.id, receiver, id)
        }
    }
}

pub struct LoginQueueState {
    store: BridgeStore,
    login: LoginId,
}

impl QueueStateStore for LoginQueueState {
    fn load(&self) -> Result<Option<QueueState>> {
        Ok(self
            .store
            .get_login(self.login)?
            .and_then(|meta| meta.queue_state()))
    }

    fn save(&self, state: &QueueState) -> Result<()> {
        let mut meta = self
            .store
            .get_login(self.login)?
            .ok_or_else(|| BridgeError::Storage(format!("unknown login {}", self.login)))?;
        meta.queue_id = Some(state.queue_id.clone());
        meta.last_event_id = Some(state.last_event_id);
        self.store.save_login(self.login, &meta)
    }
}
