/// REST client for the parts of the Zulip API the bridge consumes
use crate::error::{BridgeError, Result};
use crate::ids::UserId;
use crate::msgconv::{FetchedMedia, MediaFetcher};
use async_trait::async_trait;
use reqwest::header::{ACCEPT, CONTENT_TYPE};
use reqwest::{Client, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::debug;

const USER_AGENT: &str = concat!("zulink/", env!("CARGO_PKG_VERSION"));
const BAD_EVENT_QUEUE_ID: &str = "BAD_EVENT_QUEUE_ID";
const OCTET_STREAM: &str = "application/octet-stream";

/// Server URL plus basic auth credentials
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    pub url: String,
    pub email: String,
    pub token: String,
}

/// Body of `POST /register`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegisterRequest {
    pub event_types: Vec<&'static str>,
    pub client_capabilities: BTreeMap<&'static str, bool>,
    pub apply_markdown: bool,
    pub client_gravatar: bool,
}

impl RegisterRequest {
    /// Event types and capability flags the bridge registers with
    pub fn standard() -> Self {
        let event_types = vec![
            "alert_words",
            "attachment",
            "message",
            "presence",
            "realm_emoji",
            "realm_user",
            "submessage",
            "typing",
            "update_message",
            "delete_message",
            "reaction",
            "user_topic",
        ];
        let client_capabilities = [
            ("notification_settings_null", true),
            ("bulk_message_deletion", true),
            ("user_avatar_url_field_optional", true),
            ("stream_typing_notifications", true),
            ("user_settings_object", true),
            ("linkifier_url_template", true),
            ("user_list_incomplete", false),
            ("include_deactivated_groups", false),
            ("archived_channels", false),
            ("empty_topic_name", true),
            ("simplified_presence_events", true),
        ]
        .into_iter()
        .collect();
        Self {
            event_types,
            client_capabilities,
            apply_markdown: true,
            client_gravatar: true,
        }
    }

    fn form(&self) -> Result<Vec<(&'static str, String)>> {
        Ok(vec![
            ("event_types", serde_json::to_string(&self.event_types)?),
            (
                "client_capabilities",
                serde_json::to_string(&self.client_capabilities)?,
            ),
            ("apply_markdown", self.apply_markdown.to_string()),
            ("client_gravatar", self.client_gravatar.to_string()),
        ])
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegisterResponse {
    pub queue_id: String,
    pub last_event_id: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub user_id: u64,
    #[serde(default)]
    pub email: String,
    #[serde(default)]
    pub delivery_email: Option<String>,
    #[serde(default)]
    pub full_name: String,
    #[serde(default)]
    pub avatar_url: Option<String>,
    #[serde(default)]
    pub avatar_version: u64,
    #[serde(default)]
    pub is_bot: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Stream {
    pub stream_id: u64,
    pub name: String,
    #[serde(default)]
    pub description: String,
}

#[derive(Deserialize)]
struct EventsResponse {
    #[serde(default)]
    events: Vec<Value>,
}

#[derive(Deserialize)]
struct UserResponse {
    user: User,
}

#[derive(Deserialize)]
struct StreamResponse {
    stream: Stream,
}

#[derive(Deserialize)]
struct SubscribersResponse {
    #[serde(default)]
    subscribers: Vec<u64>,
}

/// The two calls the poll loop needs
#[async_trait]
pub trait EventQueueApi: Send + Sync {
    async fn register(&self, request: &RegisterRequest) -> Result<RegisterResponse>;

    /// Blocks server-side until events newer than `last_event_id` exist.
    async fn get_events(&self, queue_id: &str, last_event_id: i64) -> Result<Vec<Value>>;
}

pub struct ZulipClient {
    http: Client,
    media: Client,
    creds: Credentials,
}

impl ZulipClient {
    /// `http_timeout` must exceed the server's long-poll hold time.
    pub fn new(creds: Credentials, http_timeout: Duration, media_timeout: Duration) -> Result<Self> {
        let http = Client::builder()
            .user_agent(USER_AGENT)
            .timeout(http_timeout)
            .build()?;
        let media = Client::builder()
            .user_agent(USER_AGENT)
            .timeout(media_timeout)
            .build()?;
        Ok(Self { http, media, creds })
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}/api/v1/{}", self.creds.url, path)
    }

    async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        let resp = self
            .http
            .get(self.endpoint(path))
            .basic_auth(&self.creds.email, Some(&self.creds.token))
            .send()
            .await?;
        decode(resp).await
    }

    pub async fn get_user_me(&self) -> Result<User> {
        self.get("users/me").await
    }

    pub async fn get_user(&self, user: UserId) -> Result<User> {
        let resp: UserResponse = self.get(&format!("users/{}", user)).await?;
        Ok(resp.user)
    }

    pub async fn get_stream(&self, stream_id: u64) -> Result<Stream> {
        let resp: StreamResponse = self.get(&format!("streams/{}", stream_id)).await?;
        Ok(resp.stream)
    }

    pub async fn get_stream_subscribers(&self, stream_id: u64) -> Result<Vec<u64>> {
        let resp: SubscribersResponse =
            self.get(&format!("streams/{}/members", stream_id)).await?;
        Ok(resp.subscribers)
    }
}

/// Turns a response into either the typed body or a classified error.
async fn decode<T: DeserializeOwned>(resp: Response) -> Result<T> {
    let status = resp.status();
    let body = resp.bytes().await?;
    let value: Value = match serde_json::from_slice(&body) {
        Ok(value) => value,
        Err(_) if status == StatusCode::UNAUTHORIZED => {
            return Err(BridgeError::Unauthorized(status.to_string()))
        }
        Err(_) if !status.is_success() => {
            return Err(BridgeError::Transport(format!(
                "unexpected status code {}",
                status.as_u16()
            )))
        }
        Err(e) => return Err(e.into()),
    };
    if value.get("result").and_then(Value::as_str) == Some("error") || !status.is_success() {
        return Err(api_error(status, &value));
    }
    Ok(serde_json::from_value(value)?)
}

fn api_error(status: StatusCode, body: &Value) -> BridgeError {
    let code = body
        .get("code")
        .and_then(Value::as_str)
        .unwrap_or("BAD_REQUEST")
        .to_string();
    let msg = body
        .get("msg")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    if status == StatusCode::UNAUTHORIZED {
        return BridgeError::Unauthorized(msg);
    }
    if code == BAD_EVENT_QUEUE_ID {
        return BridgeError::QueueExpired(msg);
    }
    BridgeError::Api { code, msg }
}

#[async_trait]
impl EventQueueApi for ZulipClient {
    async fn register(&self, request: &RegisterRequest) -> Result<RegisterResponse> {
        let resp = self
            .http
            .post(self.endpoint("register"))
            .basic_auth(&self.creds.email, Some(&self.creds.token))
            .form(&request.form()?)
            .send()
            .await?;
        let registered: RegisterResponse = decode(resp).await?;
        debug!(
            "Registered event queue {} at event {}",
            registered.queue_id, registered.last_event_id
        );
        Ok(registered)
    }

    async fn get_events(&self, queue_id: &str, last_event_id: i64) -> Result<Vec<Value>> {
        let resp = self
            .http
            .get(self.endpoint("events"))
            .basic_auth(&self.creds.email, Some(&self.creds.token))
            .query(&[
                ("queue_id", queue_id.to_string()),
                ("last_event_id", last_event_id.to_string()),
            ])
            .send()
            .await?;
        let batch: EventsResponse = decode(resp).await?;
        Ok(batch.events)
    }
}

#[async_trait]
impl MediaFetcher for ZulipClient {
    async fn fetch(&self, url: &str) -> Result<FetchedMedia> {
        let mut req = self.media.get(url).header(ACCEPT, "*/*");
        // Only send credentials to our own server
        if url.starts_with(&self.creds.url) {
            req = req.basic_auth(&self.creds.email, Some(&self.creds.token));
        }
        let resp = req.send().await?;
        let status = resp.status();
        if !status.is_success() {
            return Err(BridgeError::Transport(format!(
                "unexpected status code {}",
                status.as_u16()
            )));
        }
        let mime_type = resp
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .filter(|v| !v.is_empty())
            .unwrap_or(OCTET_STREAM)
            .to_string();
        let data = resp.bytes().await?;
        Ok(FetchedMedia { mime_type, data })
    }
}
