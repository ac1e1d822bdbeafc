use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, warn};

pub const DEFAULT_CONFIG_PATH: &str = "settings.toml";

/// Overrides `delivery.environment` when set to `production` or `test`.
pub const ENVIRONMENT_VAR: &str = "MAILQ_ENV";

/// Added to the send timeout to get the claim lease.
const LEASE_MARGIN_SECS: u64 = 60;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub database: DatabaseConfig,
    pub dispatch: DispatchConfig,
    pub purge: PurgeConfig,
    pub delivery: DeliveryConfig,
    pub transport: TransportConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub url: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: "sqlite:mailq.db?mode=rwc".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatchConfig {
    /// Most tasks handled per batch.
    pub batch_limit: usize,
    /// Attempts a task gets before it is marked exhausted.
    pub max_retries: u32,
    pub send_timeout_secs: u64,
    /// Pause between passes in `run` mode.
    pub interval_secs: u64,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            batch_limit: 10,
            max_retries: 3,
            send_timeout_secs: 60,
            interval_secs: 30,
        }
    }
}

impl DispatchConfig {
    pub fn send_timeout(&self) -> Duration {
        Duration::from_secs(self.send_timeout_secs)
    }

    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    /// How long a claimed task stays hidden from other dispatchers. Always
    /// longer than the send timeout.
    pub fn lease(&self) -> chrono::Duration {
        let secs = self.send_timeout_secs.saturating_add(LEASE_MARGIN_SECS);
        i64::try_from(secs)
            .ok()
            .and_then(chrono::Duration::try_seconds)
            .unwrap_or(chrono::Duration::MAX)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PurgeConfig {
    pub retention_days: i64,
    pub batch_limit: usize,
}

impl Default for PurgeConfig {
    fn default() -> Self {
        Self {
            retention_days: 120,
            batch_limit: 10,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Environment {
    #[default]
    Production,
    Test,
}

/// What happens to a task when the test allow-list removed some "to" addresses.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FilterAction {
    /// Send to whoever is left.
    #[default]
    Drop,
    /// Fail the attempt like a transport error.
    Reject,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DeliveryConfig {
    pub environment: Environment,
    /// Only consulted outside production.
    pub allowed_recipients: Vec<String>,
    pub on_filtered: FilterAction,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportKind {
    #[default]
    Gmail,
    DropDir,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    pub kind: TransportKind,
    /// OAuth client secret for the Gmail transport.
    pub credentials: PathBuf,
    /// Target directory for the drop-dir transport.
    pub drop_dir: PathBuf,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            kind: TransportKind::default(),
            credentials: PathBuf::from("credentials.json"),
            drop_dir: PathBuf::from("outbox"),
        }
    }
}

impl Config {
    /// Reads `path`, falling back to defaults when it is missing or invalid.
    pub fn load(path: impl AsRef<Path>) -> Self {
        use std::fs;
        let path = path.as_ref();
        let mut config = match fs::read_to_string(path) {
            Ok(content) => Self::parse(&content).unwrap_or_else(|e| {
                warn!(path = %path.display(), error = %e, "Invalid config, using defaults");
                Self::default()
            }),
            Err(e) => {
                debug!(path = %path.display(), error = %e, "No config file, using defaults");
                Self::default()
            }
        };

        if let Ok(value) = std::env::var(ENVIRONMENT_VAR) {
            match value.to_ascii_lowercase().as_str() {
                "production" | "prod" => config.delivery.environment = Environment::Production,
                "test" | "testing" => config.delivery.environment = Environment::Test,
                other => warn!(value = other, "Ignoring unknown {}", ENVIRONMENT_VAR),
            }
        }

        config
    }

    pub fn parse(content: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(content)
    }
}
