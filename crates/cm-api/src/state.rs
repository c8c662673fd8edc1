use cm_config::MentorConfig;
use cm_usage::UsageStore;
use std::sync::Arc;

use crate::auth::{load_or_create_secret, JwtKeys};

#[derive(Clone)]
pub struct AppState {
    pub config: MentorConfig,
    pub store: Arc<UsageStore>,
    pub keys: Arc<JwtKeys>,
    pub version: &'static str,
}

impl AppState {
    /// Open the usage database and signing secret under the config directory.
    pub fn new(config: MentorConfig) -> anyhow::Result<Self> {
        let paths = config.paths()?;
        paths.ensure_config_dir()?;
        let store = Arc::new(UsageStore::open(&paths.database_path())?);
        let secret = load_or_create_secret(&paths)?;
        Ok(Self::with_parts(config, store, JwtKeys::new(&secret)))
    }

    pub fn with_parts(config: MentorConfig, store: Arc<UsageStore>, keys: JwtKeys) -> Self {
        Self {
            config,
            store,
            keys: Arc::new(keys),
            version: env!("CARGO_PKG_VERSION"),
        }
    }
}
