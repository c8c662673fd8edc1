use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Model used when nothing is configured.
pub const DEFAULT_MODEL: &str = "gemini-2.5-flash";

/// Ceiling applied to models missing from the table.
pub const DEFAULT_DAILY_LIMIT: u32 = 1500;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum ResetTimezone {
    #[default]
    Local,
    Utc,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ModelLimits {
    pub daily_limit: u32,
    #[serde(default = "default_reset_time")]
    pub reset_time: String,
    #[serde(default)]
    pub reset_timezone: ResetTimezone,
}

fn default_reset_time() -> String {
    "local midnight".to_string()
}

impl ModelLimits {
    pub fn local_midnight(daily_limit: u32) -> Self {
        Self {
            daily_limit,
            reset_time: default_reset_time(),
            reset_timezone: ResetTimezone::Local,
        }
    }
}

/// Static `model -> limits` mapping, read once at startup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelTable {
    models: BTreeMap<String, ModelLimits>,
}

impl Default for ModelTable {
    fn default() -> Self {
        Self::builtin()
    }
}

impl ModelTable {
    pub fn builtin() -> Self {
        let mut models = BTreeMap::new();
        models.insert(
            "gemini-2.5-flash".to_string(),
            ModelLimits::local_midnight(1500),
        );
        models.insert("gemini-2.5-pro".to_string(), ModelLimits::local_midnight(25));
        models.insert(
            "gemini-1.5-flash".to_string(),
            ModelLimits::local_midnight(1500),
        );
        Self { models }
    }

    /// Entries from `overrides` replace or extend the table.
    pub fn with_overrides(mut self, overrides: &BTreeMap<String, ModelLimits>) -> Self {
        for (name, limits) in overrides {
            self.models.insert(name.clone(), limits.clone());
        }
        self
    }

    pub fn get(&self, model: &str) -> Option<&ModelLimits> {
        self.models.get(model)
    }

    /// Daily limit for `model`, or [`DEFAULT_DAILY_LIMIT`] if unknown.
    pub fn limit_for(&self, model: &str) -> u32 {
        self.get(model)
            .map(|m| m.daily_limit)
            .unwrap_or(DEFAULT_DAILY_LIMIT)
    }

    /// Config for `model`, falling back to the default model's entry.
    pub fn config_for(&self, model: &str) -> ModelLimits {
        self.get(model)
            .or_else(|| self.get(DEFAULT_MODEL))
            .cloned()
            .unwrap_or_else(|| ModelLimits::local_midnight(DEFAULT_DAILY_LIMIT))
    }
}
