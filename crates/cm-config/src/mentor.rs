use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::env;
use std::net::{IpAddr, Ipv4Addr};

use crate::models::{ModelLimits, ModelTable, DEFAULT_MODEL};
use crate::paths::ConfigPaths;

fn default_host() -> IpAddr {
    IpAddr::V4(Ipv4Addr::LOCALHOST)
}

fn default_port() -> u16 {
    9410
}

fn default_server_url() -> String {
    env::var("MENTOR_SERVER_URL").unwrap_or_else(|_| format!("http://127.0.0.1:{}", default_port()))
}

fn default_model() -> String {
    env::var("MENTOR_MODEL").unwrap_or_else(|_| DEFAULT_MODEL.to_string())
}

fn default_metrics_interval_secs() -> u64 {
    60
}

fn default_auto_reset() -> bool {
    true
}

fn default_allowed_origins() -> Vec<String> {
    match env::var("MENTOR_ALLOWED_ORIGINS") {
        Ok(val) => val
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect(),
        Err(_) => Vec::new(),
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MentorConfig {
    #[serde(default = "default_host")]
    pub host: IpAddr,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Base URL of the usage API the tracker syncs with.
    #[serde(default = "default_server_url")]
    pub server_url: String,
    /// Active model identifier.
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(default = "default_metrics_interval_secs")]
    pub metrics_interval_secs: u64,
    /// Reset the daily counter when the tracker sees the local date change.
    #[serde(default = "default_auto_reset")]
    pub auto_reset: bool,
    #[serde(default = "default_allowed_origins")]
    pub allowed_origins: Vec<String>,
    /// Additions to, or replacements for, the built-in model table.
    #[serde(default)]
    pub models: BTreeMap<String, ModelLimits>,
    #[serde(skip)]
    paths: Option<ConfigPaths>,
}

impl Default for MentorConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            server_url: default_server_url(),
            model: default_model(),
            metrics_interval_secs: default_metrics_interval_secs(),
            auto_reset: default_auto_reset(),
            allowed_origins: default_allowed_origins(),
            models: BTreeMap::new(),
            paths: None,
        }
    }
}

impl MentorConfig {
    /// Returns the `ConfigPaths` for this config. If paths haven't been set,
    /// creates the default paths (may fail if `$HOME` is unset).
    pub fn paths(&self) -> anyhow::Result<ConfigPaths> {
        match &self.paths {
            Some(p) => Ok(p.clone()),
            None => ConfigPaths::new(),
        }
    }

    /// Load config from a specific `ConfigPaths`.
    pub fn load_from(paths: &ConfigPaths) -> anyhow::Result<Self> {
        let config_file = paths.config_path();
        let mut config = if config_file.exists() {
            let content = std::fs::read_to_string(&config_file)?;
            toml::from_str::<MentorConfig>(&content)?
        } else {
            Self::default()
        };
        config.paths = Some(paths.clone());
        config.validate()?;
        Ok(config)
    }

    /// Validate config values. Called automatically by `load_from`.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.port == 0 {
            anyhow::bail!("port must not be 0");
        }
        if self.server_url.is_empty() {
            anyhow::bail!("server_url must not be empty");
        }
        if self.model.is_empty() {
            anyhow::bail!("model must not be empty");
        }
        if self.metrics_interval_secs == 0 {
            anyhow::bail!("metrics_interval_secs must be greater than 0");
        }
        if let Some((name, _)) = self.models.iter().find(|(_, m)| m.daily_limit == 0) {
            anyhow::bail!("models.{name}.daily_limit must be greater than 0");
        }
        Ok(())
    }

    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Built-in model table merged with the `[models]` section.
    pub fn model_table(&self) -> ModelTable {
        ModelTable::builtin().with_overrides(&self.models)
    }
}
