use std::path::{Path, PathBuf};

use anyhow::Context;
use clap::Parser;
use lib_twin::configs::TwinConfig;
use tracing::info;

const DEFAULT_CONFIG_FILE: &str = "server_twin.json";

#[derive(Parser, Debug, Clone, Default)]
#[command(about = "Printer fleet digital twin: shadows, realtime sessions and diffs", version)]
pub struct Cli {
    #[arg(long, env = "TWIN_CONFIG_PATH", help = "Path to the JSON configuration file.")]
    pub config_path: Option<PathBuf>,

    #[arg(long, env = "TWIN_PROXY_BASE_URL", help = "Base URL of the printer cloud proxy.")]
    pub proxy_base_url: Option<String>,

    #[arg(long, env = "TWIN_PROXY_API_KEY", hide_env_values = true, help = "Bearer token for the proxy.")]
    pub proxy_api_key: Option<String>,

    #[arg(long, env = "TWIN_REDIS_URL", help = "Redis URL for shadows. Empty selects the in-memory store.")]
    pub redis_url: Option<String>,

    #[arg(long, env = "TWIN_REDIS_KEY_PREFIX", help = "Prefix prepended to every Redis key.")]
    pub redis_key_prefix: Option<String>,

    #[arg(long, env = "TWIN_POSTGRES_URL", hide_env_values = true, help = "PostgreSQL URL for the printers table.")]
    pub postgres_url: Option<String>,

    #[arg(long, env = "TWIN_POSTGRES_ENABLED", help = "Persist device rows to PostgreSQL.")]
    pub postgres_enabled: Option<bool>,

    #[arg(long, env = "TWIN_MAX_ACTIVE_SESSIONS", help = "Upper bound of concurrently live realtime sessions.")]
    pub max_active_sessions: Option<usize>,

    #[arg(long, env = "TWIN_POLL_INTERVAL_MS", help = "Delay between realtime polls of one device.")]
    pub poll_interval_ms: Option<u64>,

    #[arg(long, env = "TWIN_FLEET_REFRESH_SECONDS", help = "Seconds between fleet listings.")]
    pub fleet_refresh_seconds: Option<u64>,

    #[arg(long, env = "TWIN_LOG_DIR", help = "Directory for log files.")]
    pub log_dir: Option<PathBuf>,

    #[arg(long, env = "TWIN_LOG_LEVEL", help = "Logging level (trace, debug, info, warn, error).")]
    pub log_level: Option<String>,

    #[arg(long, env = "TWIN_WATCH", value_delimiter = ',', help = "Device ids to watch from startup.")]
    pub watch: Vec<String>,
}

impl Cli {
    /// Overrides `config` with every value given on the command line or in the environment.
    pub fn apply(&self, config: &mut TwinConfig) {
        if let Some(v) = &self.proxy_base_url {
            config.proxy.base_url = v.clone();
        }
        if let Some(v) = &self.proxy_api_key {
            config.proxy.api_key = v.clone();
        }
        if let Some(v) = &self.redis_url {
            config.redis.url = v.clone();
        }
        if let Some(v) = &self.redis_key_prefix {
            config.redis.key_prefix = v.clone();
        }
        if let Some(v) = &self.postgres_url {
            config.postgres.url = v.clone();
        }
        if let Some(v) = self.postgres_enabled {
            config.postgres.enabled = v;
        }
        if let Some(v) = self.max_active_sessions {
            config.realtime.max_active_sessions = v;
        }
        if let Some(v) = self.poll_interval_ms {
            config.realtime.poll_interval_ms = v;
        }
        if let Some(v) = self.fleet_refresh_seconds {
            config.state_sync.fleet_refresh_seconds = v;
        }
        if let Some(v) = &self.log_dir {
            config.logging.log_dir = v.clone();
        }
        if let Some(v) = &self.log_level {
            config.logging.level = v.clone();
        }
    }

    pub fn watch_list(&self) -> Vec<String> {
        let mut ids: Vec<String> = Vec::new();
        for id in self.watch.iter().map(|s| s.trim()).filter(|s| !s.is_empty()) {
            if !ids.iter().any(|known| known == id) {
                ids.push(id.to_string());
            }
        }
        ids
    }
}

/// Defaults, then the JSON file (explicit path must exist, the default one may
/// be missing), then CLI and environment.
pub fn load_config(cli: &Cli) -> anyhow::Result<TwinConfig> {
    let mut config = match &cli.config_path {
        Some(path) => TwinConfig::from_json_file(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None if Path::new(DEFAULT_CONFIG_FILE).exists() => {
            TwinConfig::from_json_file(Path::new(DEFAULT_CONFIG_FILE))?
        }
        None => {
            info!("Config file not found at {}. Using defaults and environment/CLI variables.", DEFAULT_CONFIG_FILE);
            TwinConfig::default()
        }
    };

    cli.apply(&mut config);
    config.validate()?;
    Ok(config)
}
