/// Reference host used by the `zulink` binary
///
/// Ghosts are synthesized as `@zulip_<id>:<domain>`, the owner of a login is
/// looked up in the store, and every delivered event is written to the log as
/// one JSON line. Topic upserts already seen in a chat are accepted silently.
use crate::bridge::{
    BridgeEvent, BridgeState, ChatKey, EventSink, HostIdentity, IdentityResolver, StatusReporter,
};
use crate::config::Config;
use crate::dispatch::Dispatcher;
use crate::error::Result;
use crate::ids::{LoginId, MessageId, UserId};
use crate::poll::{PollSupervisor, QueueManager};
use crate::store::{BridgeStore, LoginMetadata};
use crate::zulip::ZulipClient;
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, info, warn};

pub struct LocalHost {
    login: LoginId,
    store: BridgeStore,
    ghost_domain: String,
}

impl LocalHost {
    pub fn new(login: LoginId, store: BridgeStore, ghost_domain: impl Into<String>) -> Self {
        Self {
            login,
            store,
            ghost_domain: ghost_domain.into(),
        }
    }

    pub fn ghost_id(&self, user: UserId) -> String {
        format!("@zulip_{}:{}", user, self.ghost_domain)
    }
}

fn identity_uri(id: &str) -> String {
    format!("https://matrix.to/#/{}", id)
}

#[async_trait]
impl EventSink for LocalHost {
    async fn queue_remote_event(&self, event: BridgeEvent) -> Result<()> {
        match &event {
            BridgeEvent::TopicUpsert { id, chat, .. } => {
                if self.store.has_message(self.login, id, chat)? {
                    debug!("Topic {} already bridged in {}", id, chat.id);
                    return Ok(());
                }
                self.store.record_message(self.login, id, chat)?;
            }
            BridgeEvent::Message { id, chat, .. } => {
                self.store.record_message(self.login, id, chat)?;
            }
            BridgeEvent::Reaction { .. } => {}
        }
        let line = serde_json::to_string(&event)?;
        info!(target: "zulink::events", "{}", line);
        Ok(())
    }

    async fn message_chat(&self, id: &MessageId) -> Result<Option<ChatKey>> {
        self.store.message_chat(self.login, id)
    }
}

impl IdentityResolver for LocalHost {
    fn ghost(&self, user: UserId) -> Result<HostIdentity> {
        let id = self.ghost_id(user);
        let uri = identity_uri(&id);
        Ok(HostIdentity::new(id, uri))
    }

    fn login(&self, login: LoginId) -> Result<Option<HostIdentity>> {
        let host_user = self
            .store
            .get_login(login)?
            .and_then(|meta| meta.host_user);
        Ok(host_user.map(|id| {
            let uri = identity_uri(&id);
            HostIdentity::new(id, uri)
        }))
    }
}

impl StatusReporter for LocalHost {
    fn send_state(&self, state: BridgeState) {
        match serde_json::to_string(&state) {
            Ok(line) => info!(target: "zulink::status", "login {}: {}", self.login, line),
            Err(e) => warn!("Failed to encode bridge state: {}", e),
        }
    }
}

/// Wire one stored login to a running poll task.
pub fn spawn_login(
    config: &Config,
    store: &BridgeStore,
    login: LoginId,
    meta: &LoginMetadata,
) -> Result<PollSupervisor> {
    let client = Arc::new(ZulipClient::new(
        meta.credentials(),
        config.http_timeout,
        config.media_timeout,
    )?);
    let host = Arc::new(LocalHost::new(login, store.clone(), &config.ghost_domain));
    let dispatcher = Dispatcher::new(login, &meta.url, host.clone(), host.clone())
        .with_media_fetcher(client.clone())
        .with_split_portals(config.split_portals);
    let manager = QueueManager::new(
        login,
        client,
        Arc::new(dispatcher),
        Arc::new(store.queue_state(login)),
        host,
    )
    .with_retry_interval(config.retry_interval);
    info!("Starting event queue for login {} on {}", login, meta.url);
    Ok(PollSupervisor::spawn(manager))
}
