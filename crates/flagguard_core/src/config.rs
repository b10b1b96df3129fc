//! Guard engine configuration.
//!
//! ```yaml
//! client: ui
//! default_page_size: 50
//! max_page_size: 200
//! ```

use serde::{Deserialize, Serialize};

use crate::error::{GuardError, Result};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GuardConfig {
    /// Recorded in every payload's `meta.client`.
    pub client: String,
    pub default_page_size: i64,
    pub max_page_size: i64,
}

impl Default for GuardConfig {
    fn default() -> Self {
        Self {
            client: "ui".to_string(),
            default_page_size: 50,
            max_page_size: 200,
        }
    }
}

impl GuardConfig {
    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml)
            .map_err(|e| GuardError::InvalidInput(format!("guard config: {e}")))
    }

    /// Read `FLAGGUARD_*` variables. Unset or unparsable values keep defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();
        if let Some(client) = lookup("FLAGGUARD_CLIENT").filter(|c| !c.trim().is_empty()) {
            config.client = client;
        }
        if let Some(n) = lookup("FLAGGUARD_DEFAULT_PAGE_SIZE").and_then(|v| v.parse().ok()) {
            config.default_page_size = n;
        }
        if let Some(n) = lookup("FLAGGUARD_MAX_PAGE_SIZE").and_then(|v| v.parse().ok()) {
            config.max_page_size = n;
        }
        config
    }

    /// Effective page size for a caller-supplied limit.
    pub fn page_size(&self, requested: Option<i64>) -> i64 {
        let max = self.max_page_size.max(1);
        match requested {
            Some(n) if n > 0 => n.min(max),
            _ => self.default_page_size.clamp(1, max),
        }
    }
}
