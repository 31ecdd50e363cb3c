use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::aggregator::Aggregator;
use crate::cache::ProfileCache;
use crate::latency::LatencyRecorder;
use crate::revalidate::ProfileService;
use crate::sources::Sources;
use crate::types::Config;

/// Shared services for one process. Everything is built once here and handed
/// out by `Arc`.
pub struct AppState {
    pub config: Config,
    pub cache: Arc<ProfileCache>,
    pub latency: Arc<LatencyRecorder>,
    pub aggregator: Arc<Aggregator>,
    pub profiles: Arc<ProfileService>,
}

impl AppState {
    pub fn new(config: Config, sources: Sources) -> Self {
        let config = config.sanitized();
        let cache = Arc::new(ProfileCache::new(&config.cache));
        let latency = Arc::new(LatencyRecorder::new());
        let contacts = sources.contacts.clone();
        let aggregator = Arc::new(Aggregator::new(sources, &config.fetch, latency.clone()));

        let profiles = Arc::new(ProfileService::new(
            cache.clone(),
            aggregator.clone(),
            contacts,
            latency.clone(),
            config.prefetch.clone(),
        ));

        log::info!(
            "Profile cache ready: ttl {}ms, capacity {}, refresh after {:?}",
            config.cache.ttl_ms,
            cache.capacity(),
            config.cache.refresh_after()
        );

        Self {
            config,
            cache,
            latency,
            aggregator,
            profiles,
        }
    }
}

/// Default config location: ~/.customer360/config.json
pub fn default_config_path() -> Result<PathBuf, String> {
    let home = dirs::home_dir().ok_or("Could not find home directory")?;
    Ok(home.join(".customer360").join("config.json"))
}

/// Load configuration from `path`, or from the default location.
///
/// An explicit path must exist. A missing default file yields defaults.
pub fn load_config(path: Option<&Path>) -> Result<Config, String> {
    let config_path = match path {
        Some(p) => {
            if !p.exists() {
                return Err(format!("Config file not found at {}", p.display()));
            }
            p.to_path_buf()
        }
        None => {
            let p = default_config_path()?;
            if !p.exists() {
                log::debug!("No config at {}, using defaults", p.display());
                return Ok(Config::default());
            }
            p
        }
    };

    let content =
        fs::read_to_string(&config_path).map_err(|e| format!("Failed to read config: {}", e))?;

    let config: Config =
        serde_json::from_str(&content).map_err(|e| format!("Failed to parse config: {}", e))?;

    Ok(config.sanitized())
}
