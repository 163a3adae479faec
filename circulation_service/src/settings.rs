use std::path::PathBuf;

use anyhow::Context;
use config::builder::DefaultState;
use config::ConfigBuilder;
use serde::Deserialize;

use circulation_engine::CirculationPolicy;

const CONFIG_DIR_ENV: &str = "CIRCULATION_CONFIG_DIR";
const CONFIG_FILE: &str = "circulation.toml";
const ENV_PREFIX: &str = "CIRCULATION";

/// Service configuration: optional `circulation.toml` overlaid by
/// `CIRCULATION_*` environment variables, sections split by `__`
/// (e.g. `CIRCULATION_DATABASE__HOSTNAME`).
#[derive(Debug, Clone, Deserialize, Default)]
pub struct Settings {
    #[serde(default)]
    pub server: ServerSettings,
    #[serde(default)]
    pub database: DatabaseSettings,
    #[serde(default)]
    pub policy: CirculationPolicy,
    #[serde(default)]
    pub sweeper: SweeperSettings,
    #[serde(default)]
    pub notifications: NotificationSettings,
    #[serde(default)]
    pub telemetry: TelemetrySettings,
}

impl Settings {
    pub fn load() -> anyhow::Result<Self> {
        let config_dir = match std::env::var(CONFIG_DIR_ENV) {
            Ok(dir) => PathBuf::from(dir),
            Err(_) => std::env::current_dir()
                .context("Failed to resolve current directory")?
                .join("config"),
        };

        let builder = config::Config::builder()
            .add_source(config::File::from(config_dir.join(CONFIG_FILE)).required(false))
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            );
        Self::from_builder(builder)
    }

    fn from_builder(builder: ConfigBuilder<DefaultState>) -> anyhow::Result<Self> {
        builder
            .build()
            .context("Failed to build configuration")?
            .try_deserialize()
            .context("Failed to deserialize configuration")
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerSettings {
    #[serde(default = "ServerSettings::default_host")]
    pub host: String,
    #[serde(default = "ServerSettings::default_port")]
    pub port: u16,
}

impl ServerSettings {
    fn default_host() -> String {
        "0.0.0.0".to_string()
    }

    fn default_port() -> u16 {
        8080
    }
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: Self::default_host(),
            port: Self::default_port(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseSettings {
    /// Keeps everything in process memory, nothing survives a restart
    #[serde(default)]
    pub use_in_memory: bool,
    #[serde(default = "DatabaseSettings::default_hostname")]
    pub hostname: String,
    #[serde(default = "DatabaseSettings::default_credential")]
    pub username: String,
    #[serde(default = "DatabaseSettings::default_credential")]
    pub password: String,
    #[serde(default = "DatabaseSettings::default_pool_size")]
    pub pool_size: usize,
}

impl DatabaseSettings {
    fn default_hostname() -> String {
        "127.0.0.1".to_string()
    }

    fn default_credential() -> String {
        "postgres".to_string()
    }

    fn default_pool_size() -> usize {
        4
    }
}

impl Default for DatabaseSettings {
    fn default() -> Self {
        Self {
            use_in_memory: false,
            hostname: Self::default_hostname(),
            username: Self::default_credential(),
            password: Self::default_credential(),
            pool_size: Self::default_pool_size(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SweeperSettings {
    #[serde(default = "SweeperSettings::default_interval_seconds")]
    pub interval_seconds: u64,
}

impl SweeperSettings {
    fn default_interval_seconds() -> u64 {
        3600
    }

    pub fn interval(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.interval_seconds)
    }
}

impl Default for SweeperSettings {
    fn default() -> Self {
        Self {
            interval_seconds: Self::default_interval_seconds(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct NotificationSettings {
    /// Without a webhook notifications only go to the log
    #[serde(default)]
    pub webhook_url: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TelemetrySettings {
    #[serde(default = "TelemetrySettings::default_service_name")]
    pub service_name: String,
}

impl TelemetrySettings {
    fn default_service_name() -> String {
        "circulation_service".to_string()
    }
}

impl Default for TelemetrySettings {
    fn default() -> Self {
        Self {
            service_name: Self::default_service_name(),
        }
    }
}
