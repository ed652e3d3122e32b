use std::env;

use serde::Serialize;
use studysync_core::config::normalize_text_option;

use crate::cli::ConfigCommands;
use crate::config_profiles::{CliProfile, CliProfilesConfig};
use crate::error::CliError;

pub fn run_config(command: ConfigCommands, global_profile: Option<&str>) -> Result<(), CliError> {
    match command {
        ConfigCommands::Init {
            api_url,
            realtime_url,
            api_key,
            access_token,
            user_id,
            no_activate,
        } => {
            let mut config = CliProfilesConfig::load().map_err(CliError::Config)?;
            let profile_name = config.resolve_profile_name(global_profile);
            let values = ProfileValues {
                api_url,
                realtime_url,
                api_key,
                access_token,
                user_id,
            };
            apply_profile_init(&mut config, &profile_name, values, |key| env::var(key).ok())?;
            if !no_activate {
                config.active_profile = Some(profile_name.clone());
            }

            let path = config.save().map_err(CliError::Config)?;
            println!("Profile '{}' initialized at {}", profile_name, path.display());

            let missing = config
                .profile(&profile_name)
                .map(missing_fields)
                .unwrap_or_default();
            if missing.is_empty() {
                println!("Profile '{profile_name}' is ready. Run `studysync sync` to reconcile.");
            } else {
                println!(
                    "Profile '{}' works offline only until it has: {}",
                    profile_name,
                    missing.join(", ")
                );
            }
            Ok(())
        }
        ConfigCommands::Show { json } => {
            let config = CliProfilesConfig::load().map_err(CliError::Config)?;
            let profile_name = config.resolve_profile_name(global_profile);
            let view = ProfileView::new(
                &profile_name,
                config.active_profile.as_deref() == Some(profile_name.as_str()),
                &config.profile(&profile_name).cloned().unwrap_or_default(),
            );
            if json {
                println!("{}", serde_json::to_string_pretty(&view)?);
            } else {
                for line in view.lines() {
                    println!("{line}");
                }
            }
            Ok(())
        }
    }
}

/// Values passed to `config init`; unset ones fall back to env, then to the stored profile
#[derive(Debug, Default)]
pub struct ProfileValues {
    pub api_url: Option<String>,
    pub realtime_url: Option<String>,
    pub api_key: Option<String>,
    pub access_token: Option<String>,
    pub user_id: Option<String>,
}

pub fn apply_profile_init(
    config: &mut CliProfilesConfig,
    profile_name: &str,
    values: ProfileValues,
    lookup: impl Fn(&str) -> Option<String>,
) -> Result<(), CliError> {
    let existing = config.profile(profile_name).cloned().unwrap_or_default();
    let merge = |explicit: Option<String>, env_key: &str, stored: Option<String>| {
        normalize_text_option(explicit)
            .or_else(|| normalize_text_option(lookup(env_key)))
            .or_else(|| normalize_text_option(stored))
    };

    let merged = CliProfile {
        api_url: merge(values.api_url, "STUDYSYNC_API_URL", existing.api_url),
        realtime_url: merge(
            values.realtime_url,
            "STUDYSYNC_REALTIME_URL",
            existing.realtime_url,
        ),
        api_key: merge(values.api_key, "STUDYSYNC_API_KEY", existing.api_key),
        access_token: merge(
            values.access_token,
            "STUDYSYNC_ACCESS_TOKEN",
            existing.access_token,
        ),
        user_id: merge(values.user_id, "STUDYSYNC_USER_ID", existing.user_id),
    };
    merged.validate().map_err(CliError::Config)?;
    *config.profile_mut_or_default(profile_name) = merged;
    Ok(())
}

pub fn missing_fields(profile: &CliProfile) -> Vec<&'static str> {
    let mut missing = Vec::new();
    if normalize_text_option(profile.api_url.clone()).is_none() {
        missing.push("api_url");
    }
    if normalize_text_option(profile.api_key.clone()).is_none() {
        missing.push("api_key");
    }
    missing
}

#[derive(Debug, Serialize)]
pub struct ProfileView {
    pub profile: String,
    pub active: bool,
    pub api_url: Option<String>,
    pub realtime_url: Option<String>,
    pub api_key: Option<String>,
    pub access_token: Option<String>,
    pub user_id: String,
}

impl ProfileView {
    pub fn new(name: &str, active: bool, profile: &CliProfile) -> Self {
        let redact = |value: &Option<String>| value.as_ref().map(|_| "[REDACTED]".to_string());
        Self {
            profile: name.to_string(),
            active,
            api_url: profile.api_url.clone(),
            realtime_url: profile.realtime_url.clone(),
            api_key: redact(&profile.api_key),
            access_token: redact(&profile.access_token),
            user_id: profile.user_id(),
        }
    }

    pub fn lines(&self) -> Vec<String> {
        let unset = || "(unset)".to_string();
        vec![
            format!(
                "profile:      {}{}",
                self.profile,
                if self.active { " (active)" } else { "" }
            ),
            format!("api_url:      {}", self.api_url.clone().unwrap_or_else(unset)),
            format!(
                "realtime_url: {}",
                self.realtime_url.clone().unwrap_or_else(unset)
            ),
            format!("api_key:      {}", self.api_key.clone().unwrap_or_else(unset)),
            format!(
                "access_token: {}",
                self.access_token.clone().unwrap_or_else(unset)
            ),
            format!("user_id:      {}", self.user_id),
        ]
    }
}
