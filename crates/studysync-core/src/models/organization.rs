//! Organization model (multiple-document resource)

use serde::{Deserialize, Serialize};

/// A school, university or course provider the user studies at
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Organization {
    pub name: String,
    #[serde(default)]
    pub short_name: Option<String>,
    /// The organization shown by default
    #[serde(default)]
    pub is_main: bool,
}

impl Organization {
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            short_name: None,
            is_main: false,
        }
    }
}
