//! Persistent CLI profile configuration.

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use studysync_core::config::{is_http_url, normalize_text_option};
use studysync_core::BackendConfig;

const CONFIG_FILE_NAME: &str = "cli-config.json";
const DEFAULT_PROFILE: &str = "default";
pub const LOCAL_USER: &str = "local";

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct CliProfilesConfig {
    #[serde(default = "default_config_version")]
    pub version: u32,
    #[serde(default)]
    pub active_profile: Option<String>,
    #[serde(default)]
    pub profiles: BTreeMap<String, CliProfile>,
}

#[derive(Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct CliProfile {
    #[serde(default)]
    pub api_url: Option<String>,
    #[serde(default)]
    pub realtime_url: Option<String>,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default)]
    pub access_token: Option<String>,
    /// Owner the local replica and the remote partition are scoped to
    #[serde(default)]
    pub user_id: Option<String>,
}

impl fmt::Debug for CliProfile {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter
            .debug_struct("CliProfile")
            .field("api_url", &self.api_url)
            .field("realtime_url", &self.realtime_url)
            .field("api_key", &self.api_key.as_ref().map(|_| "[REDACTED]"))
            .field(
                "access_token",
                &self.access_token.as_ref().map(|_| "[REDACTED]"),
            )
            .field("user_id", &self.user_id)
            .finish()
    }
}

const fn default_config_version() -> u32 {
    1
}

pub fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("studysync")
        .join(CONFIG_FILE_NAME)
}

pub fn normalize_profile_name(value: Option<&str>) -> Option<String> {
    let value = value?.trim();
    if value.is_empty() {
        None
    } else {
        Some(value.to_string())
    }
}

impl CliProfilesConfig {
    pub fn load() -> Result<Self, String> {
        Self::load_from_path(&default_config_path())
    }

    pub fn load_from_path(path: &Path) -> Result<Self, String> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let raw = std::fs::read_to_string(path)
            .map_err(|error| format!("Failed to read config at {}: {}", path.display(), error))?;
        let mut config = serde_json::from_str::<Self>(&raw)
            .map_err(|error| format!("Failed to parse config at {}: {}", path.display(), error))?;
        config.normalize();
        Ok(config)
    }

    pub fn save(&self) -> Result<PathBuf, String> {
        let path = default_config_path();
        self.save_to_path(&path)?;
        Ok(path)
    }

    pub fn save_to_path(&self, path: &Path) -> Result<(), String> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|error| {
                format!(
                    "Failed to create config directory {}: {}",
                    parent.display(),
                    error
                )
            })?;
        }

        let mut normalized = self.clone();
        normalized.normalize();
        let serialized = serde_json::to_string_pretty(&normalized)
            .map_err(|error| format!("Failed to serialize config: {error}"))?;
        std::fs::write(path, serialized)
            .map_err(|error| format!("Failed to write config at {}: {}", path.display(), error))
    }

    /// Explicit name, then `STUDYSYNC_PROFILE`, then the active profile
    pub fn resolve_profile_name(&self, explicit: Option<&str>) -> String {
        let from_env = std::env::var("STUDYSYNC_PROFILE").ok();
        normalize_profile_name(explicit)
            .or_else(|| normalize_profile_name(from_env.as_deref()))
            .or_else(|| normalize_profile_name(self.active_profile.as_deref()))
            .unwrap_or_else(|| DEFAULT_PROFILE.to_string())
    }

    pub fn profile(&self, name: &str) -> Option<&CliProfile> {
        self.profiles.get(name)
    }

    pub fn profile_mut_or_default(&mut self, name: &str) -> &mut CliProfile {
        self.profiles.entry(name.to_string()).or_default()
    }

    fn normalize(&mut self) {
        self.active_profile = normalize_profile_name(self.active_profile.as_deref());
        for profile in self.profiles.values_mut() {
            profile.normalize();
        }
    }
}

impl CliProfile {
    pub fn user_id(&self) -> String {
        normalize_text_option(self.user_id.clone()).unwrap_or_else(|| LOCAL_USER.to_string())
    }

    /// Backend settings, or `None` when the profile has neither url nor key
    pub fn backend(&self) -> Result<Option<BackendConfig>, String> {
        let api_url = normalize_text_option(self.api_url.clone());
        let api_key = normalize_text_option(self.api_key.clone());
        let (api_url, api_key) = match (api_url, api_key) {
            (None, None) => return Ok(None),
            (Some(api_url), Some(api_key)) => (api_url, api_key),
            (None, Some(_)) => return Err("profile is missing api_url".to_string()),
            (Some(_), None) => return Err("profile is missing api_key".to_string()),
        };

        let mut backend = BackendConfig::new(api_url, api_key).map_err(|error| error.to_string())?;
        backend.realtime_url = normalize_text_option(self.realtime_url.clone());
        backend.access_token = normalize_text_option(self.access_token.clone());
        backend.validate().map_err(|error| error.to_string())?;
        Ok(Some(backend))
    }

    pub fn validate(&self) -> Result<(), String> {
        if let Some(url) = normalize_text_option(self.api_url.clone()) {
            if !is_http_url(&url) {
                return Err("api_url must include http:// or https://".to_string());
            }
        }
        if let Some(url) = normalize_text_option(self.realtime_url.clone()) {
            if !(url.starts_with("ws://") || url.starts_with("wss://")) {
                return Err("realtime_url must include ws:// or wss://".to_string());
            }
        }
        Ok(())
    }

    fn normalize(&mut self) {
        self.api_url = normalize_text_option(self.api_url.take())
            .map(|url| url.trim_end_matches('/').to_string());
        self.realtime_url = normalize_text_option(self.realtime_url.take());
        self.api_key = normalize_text_option(self.api_key.take());
        self.access_token = normalize_text_option(self.access_token.take());
        self.user_id = normalize_text_option(self.user_id.take());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_config_path() -> (tempfile::TempDir, PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join(CONFIG_FILE_NAME);
        (dir, path)
    }

    #[test]
    fn normalize_profile_name_rejects_empty() {
        assert_eq!(normalize_profile_name(None), None);
        assert_eq!(normalize_profile_name(Some(" ")), None);
        assert_eq!(normalize_profile_name(Some(" work ")), Some("work".into()));
    }

    #[test]
    fn config_roundtrip_normalizes_profiles() {
        let (_dir, path) = temp_config_path();
        let mut config = CliProfilesConfig {
            version: 1,
            active_profile: Some(" default ".to_string()),
            profiles: BTreeMap::new(),
        };
        config.profiles.insert(
            "default".to_string(),
            CliProfile {
                api_url: Some(" https://api.example.com/ ".to_string()),
                api_key: Some(" anon-key ".to_string()),
                user_id: Some("   ".to_string()),
                ..CliProfile::default()
            },
        );

        config.save_to_path(&path).unwrap();
        let loaded = CliProfilesConfig::load_from_path(&path).unwrap();
        assert_eq!(loaded.active_profile.as_deref(), Some("default"));
        let profile = loaded.profile("default").unwrap();
        assert_eq!(profile.api_url.as_deref(), Some("https://api.example.com"));
        assert_eq!(profile.api_key.as_deref(), Some("anon-key"));
        assert_eq!(profile.user_id, None);
        assert_eq!(profile.user_id(), LOCAL_USER);
    }

    #[test]
    fn missing_config_file_loads_empty() {
        let (_dir, path) = temp_config_path();
        assert_eq!(
            CliProfilesConfig::load_from_path(&path).unwrap(),
            CliProfilesConfig::default()
        );
    }

    #[test]
    fn resolve_profile_name_prefers_explicit_then_active() {
        let config = CliProfilesConfig {
            version: 1,
            active_profile: Some("work".to_string()),
            profiles: BTreeMap::new(),
        };
        assert_eq!(config.resolve_profile_name(Some("mobile")), "mobile");
        if std::env::var("STUDYSYNC_PROFILE").is_err() {
            assert_eq!(config.resolve_profile_name(None), "work");
        }
    }

    #[test]
    fn profile_backend_requires_url_and_key_together() {
        assert!(CliProfile::default().backend().unwrap().is_none());

        let partial = CliProfile {
            api_key: Some("anon".into()),
            ..CliProfile::default()
        };
        assert!(partial.backend().unwrap_err().contains("api_url"));

        let complete = CliProfile {
            api_url: Some("https://api.example.com".into()),
            api_key: Some("anon".into()),
            access_token: Some("token".into()),
            ..CliProfile::default()
        };
        let backend = complete.backend().unwrap().unwrap();
        assert_eq!(backend.bearer_token(), "token");
    }

    #[test]
    fn debug_output_redacts_secrets() {
        let profile = CliProfile {
            api_key: Some("anon-secret".into()),
            access_token: Some("token-secret".into()),
            ..CliProfile::default()
        };
        let debug = format!("{profile:?}");
        assert!(!debug.contains("anon-secret"));
        assert!(!debug.contains("token-secret"));
    }
}
