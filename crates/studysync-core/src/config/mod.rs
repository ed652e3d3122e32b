//! Engine and backend configuration.
//!
//! `BackendConfig` describes how to reach the remote document API and its
//! realtime feed. `EngineConfig` carries the scheduling knobs and policies.

use std::env;
use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::{Error, Result};
use crate::sync::{ConflictPolicy, PoisonPolicy, RetryPolicy, SyncPolicy};

const ENV_API_URL: &str = "STUDYSYNC_API_URL";
const ENV_REALTIME_URL: &str = "STUDYSYNC_REALTIME_URL";
const ENV_API_KEY: &str = "STUDYSYNC_API_KEY";
const ENV_ACCESS_TOKEN: &str = "STUDYSYNC_ACCESS_TOKEN";
const ENV_SYNC_INTERVAL: &str = "STUDYSYNC_SYNC_INTERVAL_SECS";
const ENV_POISON_POLICY: &str = "STUDYSYNC_POISON_POLICY";
const ENV_CONFLICT_POLICY: &str = "STUDYSYNC_CONFLICT_POLICY";

const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 15;
const DEFAULT_SYNC_INTERVAL_SECS: u64 = 60;
const DEFAULT_CHANNEL_CAPACITY: usize = 64;

/// Trim optional text; blank values count as unset.
pub fn normalize_text_option(value: Option<String>) -> Option<String> {
    value
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

/// Whether `value` is an absolute http(s) url with a host
pub fn is_http_url(value: &str) -> bool {
    Url::parse(value)
        .is_ok_and(|url| matches!(url.scheme(), "http" | "https") && url.has_host())
}

/// Remote backend endpoints and credentials.
///
/// The api key is a public project key; the access token is the signed-in
/// user's bearer token when one is available.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackendConfig {
    pub base_url: String,
    #[serde(default)]
    pub realtime_url: Option<String>,
    pub api_key: String,
    #[serde(default)]
    pub access_token: Option<String>,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

const fn default_request_timeout_secs() -> u64 {
    DEFAULT_REQUEST_TIMEOUT_SECS
}

impl fmt::Debug for BackendConfig {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter
            .debug_struct("BackendConfig")
            .field("base_url", &self.base_url)
            .field("realtime_url", &self.realtime_url)
            .field("api_key", &"[REDACTED]")
            .field(
                "access_token",
                &self.access_token.as_ref().map(|_| "[REDACTED]"),
            )
            .field("request_timeout_secs", &self.request_timeout_secs)
            .finish()
    }
}

impl BackendConfig {
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>) -> Result<Self> {
        let config = Self {
            base_url: normalize_http_url(base_url.into(), ENV_API_URL)?,
            realtime_url: None,
            api_key: api_key.into().trim().to_string(),
            access_token: None,
            request_timeout_secs: DEFAULT_REQUEST_TIMEOUT_SECS,
        };
        config.validate()?;
        Ok(config)
    }

    /// Load backend configuration from environment variables.
    ///
    /// Returns `Ok(None)` when no backend variables are set.
    /// Returns an error when only a partial configuration is provided.
    pub fn from_env() -> Result<Option<Self>> {
        parse_backend(|key| env::var(key).ok())
    }

    pub fn validate(&self) -> Result<()> {
        if !is_http_url(&self.base_url) {
            return Err(Error::InvalidInput(format!(
                "backend base_url must include http:// or https:// (got '{}')",
                self.base_url
            )));
        }
        if self.api_key.trim().is_empty() {
            return Err(Error::InvalidInput("backend api_key must not be empty".into()));
        }
        if let Some(realtime_url) = &self.realtime_url {
            let url = Url::parse(realtime_url).map_err(|error| {
                Error::InvalidInput(format!("invalid realtime_url '{realtime_url}': {error}"))
            })?;
            if !matches!(url.scheme(), "ws" | "wss") {
                return Err(Error::InvalidInput(format!(
                    "realtime_url must use ws:// or wss:// (got '{realtime_url}')"
                )));
            }
        }
        Ok(())
    }

    /// Realtime endpoint base: the configured url, or the api url with a
    /// websocket scheme.
    pub fn realtime_base(&self) -> Result<Url> {
        if let Some(realtime_url) = &self.realtime_url {
            return Url::parse(realtime_url).map_err(|error| {
                Error::InvalidInput(format!("invalid realtime_url '{realtime_url}': {error}"))
            });
        }

        let mut url = Url::parse(&self.base_url).map_err(|error| {
            Error::InvalidInput(format!("invalid base_url '{}': {error}", self.base_url))
        })?;
        let scheme = if url.scheme() == "https" { "wss" } else { "ws" };
        url.set_scheme(scheme).map_err(|()| {
            Error::InvalidInput(format!("cannot derive realtime url from '{}'", self.base_url))
        })?;
        Ok(url)
    }

    pub const fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    /// Bearer token sent with requests: the user token, else the api key
    pub fn bearer_token(&self) -> &str {
        self.access_token.as_deref().unwrap_or(&self.api_key)
    }
}

/// Scheduling and policy settings for the sync engine
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub backend: Option<BackendConfig>,
    /// Periodic drain+diff trigger
    pub sync_interval_secs: u64,
    pub retry: RetryPolicy,
    pub poison_policy: PoisonPolicy,
    pub conflict_policy: ConflictPolicy,
    /// Buffer size of realtime subscriptions
    pub channel_capacity: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            backend: None,
            sync_interval_secs: DEFAULT_SYNC_INTERVAL_SECS,
            retry: RetryPolicy::default(),
            poison_policy: PoisonPolicy::default(),
            conflict_policy: ConflictPolicy::default(),
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
        }
    }
}

impl EngineConfig {
    /// Defaults overlaid with `STUDYSYNC_*` environment variables
    pub fn from_env() -> Result<Self> {
        parse_engine(|key| env::var(key).ok())
    }

    pub const fn sync_interval(&self) -> Duration {
        Duration::from_secs(self.sync_interval_secs)
    }

    pub const fn policy(&self) -> SyncPolicy {
        SyncPolicy {
            poison: self.poison_policy,
            conflict: self.conflict_policy,
        }
    }
}

fn parse_backend(lookup: impl Fn(&str) -> Option<String>) -> Result<Option<BackendConfig>> {
    let base_url = normalize_text_option(lookup(ENV_API_URL));
    let realtime_url = normalize_text_option(lookup(ENV_REALTIME_URL));
    let api_key = normalize_text_option(lookup(ENV_API_KEY));
    let access_token = normalize_text_option(lookup(ENV_ACCESS_TOKEN));

    let any_present = base_url.is_some()
        || realtime_url.is_some()
        || api_key.is_some()
        || access_token.is_some();
    if !any_present {
        return Ok(None);
    }

    let (Some(base_url), Some(api_key)) = (base_url.clone(), api_key.clone()) else {
        let mut missing = Vec::new();
        if base_url.is_none() {
            missing.push(ENV_API_URL);
        }
        if api_key.is_none() {
            missing.push(ENV_API_KEY);
        }
        return Err(Error::InvalidInput(format!(
            "backend configuration is incomplete. Missing: {}",
            missing.join(", ")
        )));
    };

    let config = BackendConfig {
        base_url: normalize_http_url(base_url, ENV_API_URL)?,
        realtime_url: realtime_url.map(|url| url.trim_end_matches('/').to_string()),
        api_key,
        access_token,
        request_timeout_secs: DEFAULT_REQUEST_TIMEOUT_SECS,
    };
    config.validate()?;
    Ok(Some(config))
}

fn parse_engine(lookup: impl Fn(&str) -> Option<String>) -> Result<EngineConfig> {
    let mut config = EngineConfig {
        backend: parse_backend(&lookup)?,
        ..EngineConfig::default()
    };

    if let Some(interval) = normalize_text_option(lookup(ENV_SYNC_INTERVAL)) {
        config.sync_interval_secs = interval.parse().map_err(|_| {
            Error::InvalidInput(format!("{ENV_SYNC_INTERVAL} must be a number of seconds"))
        })?;
    }
    if let Some(policy) = normalize_text_option(lookup(ENV_POISON_POLICY)) {
        config.poison_policy = policy.parse()?;
    }
    if let Some(policy) = normalize_text_option(lookup(ENV_CONFLICT_POLICY)) {
        config.conflict_policy = policy.parse()?;
    }
    Ok(config)
}

fn normalize_http_url(raw: String, field: &str) -> Result<String> {
    let value = normalize_text_option(Some(raw))
        .ok_or_else(|| Error::InvalidInput(format!("{field} must not be empty")))?;
    if is_http_url(&value) {
        Ok(value.trim_end_matches('/').to_string())
    } else {
        Err(Error::InvalidInput(format!(
            "{field} must include http:// or https://"
        )))
    }
}
