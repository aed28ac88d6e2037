/// API key login flow
use crate::error::{BridgeError, Result};
use crate::ids::LoginId;
use crate::store::{BridgeStore, LoginMetadata};
use crate::zulip::{Credentials, User, ZulipClient};
use std::time::Duration;
use tracing::info;
use url::Url;

const TOKEN_LEN: usize = 32;

/// What the user typed in
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoginInput {
    pub url: String,
    pub email: String,
    pub token: String,
}

impl LoginInput {
    pub fn validate(&self) -> Result<Credentials> {
        let parsed = Url::parse(self.url.trim())
            .map_err(|e| BridgeError::Login(format!("invalid server URL: {}", e)))?;
        if !matches!(parsed.scheme(), "http" | "https") || parsed.host_str().is_none() {
            return Err(BridgeError::Login(format!(
                "server URL must be http(s) with a host: {}",
                self.url
            )));
        }
        let email = self.email.trim();
        if email.is_empty() {
            return Err(BridgeError::Login("email is required".to_string()));
        }
        if !is_valid_token(&self.token) {
            return Err(BridgeError::Login(format!(
                "API key must be {} letters or digits",
                TOKEN_LEN
            )));
        }
        Ok(Credentials {
            url: parsed.as_str().trim_end_matches('/').to_string(),
            email: email.to_string(),
            token: self.token.clone(),
        })
    }
}

fn is_valid_token(token: &str) -> bool {
    token.len() == TOKEN_LEN && token.chars().all(|c| c.is_ascii_alphanumeric())
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoginOutcome {
    pub login: LoginId,
    pub full_name: String,
}

impl LoginOutcome {
    pub fn message(&self) -> String {
        format!("Successfully logged in as {}", self.full_name)
    }
}

/// Check the credentials against the server and persist the login.
pub async fn login(
    store: &BridgeStore,
    input: &LoginInput,
    host_user: Option<String>,
    http_timeout: Duration,
) -> Result<LoginOutcome> {
    let creds = input.validate()?;
    let client = ZulipClient::new(creds.clone(), http_timeout, http_timeout)?;
    let me = client.get_user_me().await?;
    save_login(store, creds, &me, host_user)
}

/// Persist a verified login. Logging in again replaces the old credentials
/// and drops the old event queue.
pub fn save_login(
    store: &BridgeStore,
    creds: Credentials,
    me: &User,
    host_user: Option<String>,
) -> Result<LoginOutcome> {
    let login = LoginId(me.user_id);
    let meta = LoginMetadata {
        url: creds.url,
        email: creds.email,
        token: creds.token,
        full_name: me.full_name.clone(),
        queue_id: None,
        last_event_id: None,
        host_user,
    };
    store.save_login(login, &meta)?;
    info!("Saved login {} ({})", login, me.email);
    Ok(LoginOutcome {
        login,
        full_name: me.full_name.clone(),
    })
}
