/// Configuration management
use crate::error::{BridgeError, Result};
use crate::poll::{DEFAULT_RETRY_INTERVAL, DEFAULT_STOP_TIMEOUT};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Bridge configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// Where the sled database lives
    pub data_dir: PathBuf,

    /// Wait between retries after a failed poll or a rejected event
    pub retry_interval: Duration,

    /// Timeout for API calls, including the long poll itself
    pub http_timeout: Duration,

    /// Timeout for attachment downloads
    pub media_timeout: Duration,

    /// How long shutdown waits for each poll task
    pub stop_timeout: Duration,

    /// Give every login its own copy of channel chats
    pub split_portals: bool,

    /// Server name used for ghost identities
    pub ghost_domain: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from(".zulink"),
            retry_interval: DEFAULT_RETRY_INTERVAL,
            http_timeout: Duration::from_secs(180),
            media_timeout: Duration::from_secs(60),
            stop_timeout: DEFAULT_STOP_TIMEOUT,
            split_portals: false,
            ghost_domain: "localhost".to_string(),
        }
    }
}

fn flag_value<'a>(args: &'a [String], i: usize, flag: &str) -> Result<&'a str> {
    args.get(i + 1)
        .map(String::as_str)
        .ok_or_else(|| BridgeError::Config(format!("{} requires a value", flag)))
}

fn parse_secs(value: &str, flag: &str) -> Result<Duration> {
    value
        .parse::<u64>()
        .map(Duration::from_secs)
        .map_err(|_| BridgeError::Config(format!("{} must be a whole number of seconds", flag)))
}

impl Config {
    /// Parse flags out of the arguments after the program name. Everything
    /// that isn't a flag is returned as a positional, in order.
    pub fn from_args(args: &[String]) -> Result<(Self, Vec<String>)> {
        let (mut config, positionals) = Self::parse_flags(args)?;
        // Env overrides (nice for scripts)
        config.apply_env(|key| std::env::var(key).ok());
        Ok((config, positionals))
    }

    fn parse_flags(args: &[String]) -> Result<(Self, Vec<String>)> {
        let mut config = Self::default();
        let mut positionals = Vec::new();

        let mut i = 0;
        while i < args.len() {
            match args[i].as_str() {
                "--data-dir" => {
                    config.data_dir = PathBuf::from(flag_value(args, i, "--data-dir")?);
                    i += 2;
                }
                "--retry-interval" => {
                    let v = flag_value(args, i, "--retry-interval")?;
                    config.retry_interval = parse_secs(v, "--retry-interval")?;
                    i += 2;
                }
                "--http-timeout" => {
                    let v = flag_value(args, i, "--http-timeout")?;
                    config.http_timeout = parse_secs(v, "--http-timeout")?;
                    i += 2;
                }
                "--media-timeout" => {
                    let v = flag_value(args, i, "--media-timeout")?;
                    config.media_timeout = parse_secs(v, "--media-timeout")?;
                    i += 2;
                }
                "--stop-timeout" => {
                    let v = flag_value(args, i, "--stop-timeout")?;
                    config.stop_timeout = parse_secs(v, "--stop-timeout")?;
                    i += 2;
                }
                "--split-portals" => {
                    config.split_portals = true;
                    i += 1;
                }
                "--ghost-domain" => {
                    config.ghost_domain = flag_value(args, i, "--ghost-domain")?.to_string();
                    i += 2;
                }
                other if other.starts_with("--") => {
                    return Err(BridgeError::Config(format!("Unknown flag {}", other)));
                }
                other => {
                    positionals.push(other.to_string());
                    i += 1;
                }
            }
        }
        Ok((config, positionals))
    }

    fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(dir) = lookup("ZULINK_DATA_DIR").filter(|d| !d.is_empty()) {
            self.data_dir = PathBuf::from(dir);
        }
        if let Some(secs) = lookup("ZULINK_RETRY_SECS").and_then(|s| s.parse::<u64>().ok()) {
            self.retry_interval = Duration::from_secs(secs);
        }
        if let Some(split) = lookup("ZULINK_SPLIT_PORTALS") {
            self.split_portals = matches!(split.as_str(), "1" | "true" | "yes");
        }
        if let Some(domain) = lookup("ZULINK_GHOST_DOMAIN").filter(|d| !d.is_empty()) {
            self.ghost_domain = domain;
        }
    }
}
