//! Study settings model (single-document resource)

use serde::{Deserialize, Serialize};

/// Theme mode options
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ThemeMode {
    /// Light theme
    Light,
    /// Dark theme
    Dark,
    /// Follow system preference
    #[default]
    System,
}

/// Per-user application settings, synced as one document per user
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Theme mode
    pub theme: ThemeMode,
    /// UI language tag (e.g. "en", "ru")
    pub language: String,
    /// First day of the week, 1 = Monday .. 7 = Sunday
    pub week_start: u8,
    /// Default lesson length in minutes
    pub lesson_duration_minutes: u32,
    /// Whether homework reminders are shown
    pub homework_reminders: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            theme: ThemeMode::System,
            language: "en".to_string(),
            week_start: 1,
            lesson_duration_minutes: 45,
            homework_reminders: true,
        }
    }
}
