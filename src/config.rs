//! TOML configuration for the taskledger daemon and CLI.
//!
//! Every section has compiled-in defaults, so an empty file (or no file at
//! all) yields a working configuration.

use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::notify::NotificationTemplate;
use crate::scheduler::DEFAULT_TIMEOUT_MS;

const CONFIG_ENV: &str = "TASKLEDGER_CONFIG";
const SYSTEM_CONFIG_PATH: &str = "/etc/taskledger/taskledger.toml";

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub executor: ExecutorConfig,
    #[serde(default)]
    pub notifications: NotificationConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl AppConfig {
    /// Load configuration from a TOML file at `path`.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;
        let config: Self = toml::from_str(&content)
            .with_context(|| format!("failed to parse config file: {}", path.display()))?;
        info!(path = %path.display(), "loaded configuration");
        Ok(config)
    }

    /// Try to load configuration from, in order:
    /// 1. The path in the `TASKLEDGER_CONFIG` environment variable.
    /// 2. `/etc/taskledger/taskledger.toml`.
    /// 3. Compiled-in defaults.
    pub fn load_or_default() -> Self {
        if let Ok(env_path) = std::env::var(CONFIG_ENV) {
            let path = Path::new(&env_path);
            match Self::load(path) {
                Ok(cfg) => return cfg,
                Err(e) => {
                    warn!(
                        path = %path.display(),
                        error = %e,
                        "TASKLEDGER_CONFIG set but file could not be loaded, trying fallback"
                    );
                }
            }
        }

        let system_path = Path::new(SYSTEM_CONFIG_PATH);
        if system_path.exists() {
            match Self::load(system_path) {
                Ok(cfg) => return cfg,
                Err(e) => {
                    warn!(
                        path = %system_path.display(),
                        error = %e,
                        "system config file exists but could not be loaded, using defaults"
                    );
                }
            }
        }

        debug!("no config file found, using compiled-in defaults");
        Self::default()
    }
}

// ---------------------------------------------------------------------------
// Sections
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1:8080".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub path: String,
    /// Store calls at or above this duration land in the slow-query log.
    pub slow_query_threshold_ms: u64,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: "data/taskledger.db".to_string(),
            slow_query_threshold_ms: 500,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutorConfig {
    /// Deadline for a single dispatch.
    pub timeout_ms: u64,
    /// How often the engine looks for due tasks.
    pub poll_interval_secs: u64,
    /// Timezone for tasks added without one.
    pub default_timezone: String,
    /// Insert the built-in task profiles on startup.
    pub seed_defaults: bool,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            timeout_ms: DEFAULT_TIMEOUT_MS,
            poll_interval_secs: 30,
            default_timezone: "Asia/Jakarta".to_string(),
            seed_defaults: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NotificationConfig {
    /// Operator-notification endpoint. Without it, failures are only logged.
    pub webhook_url: Option<String>,
    pub template_code: String,
    pub recipient_role: String,
}

impl Default for NotificationConfig {
    fn default() -> Self {
        let template = NotificationTemplate::default();
        Self {
            webhook_url: None,
            template_code: template.template_code,
            recipient_role: template.recipient_role,
        }
    }
}

impl NotificationConfig {
    pub fn template(&self) -> NotificationTemplate {
        NotificationTemplate {
            template_code: self.template_code.clone(),
            recipient_role: self.recipient_role.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default filter when `RUST_LOG` is unset.
    pub level: String,
    /// Emit JSON lines instead of human-readable output.
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let cfg = AppConfig::default();
        assert_eq!(cfg.executor.timeout_ms, 300_000);
        assert_eq!(cfg.database.slow_query_threshold_ms, 500);
        assert!(cfg.notifications.webhook_url.is_none());
        assert_eq!(cfg.logging.level, "info");
    }

    #[test]
    fn test_partial_file_keeps_other_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
[executor]
timeout_ms = 60000

[notifications]
webhook_url = "https://ops.example.com/hooks/tasks"
recipient_role = "finance"
"#
        )
        .unwrap();

        let cfg = AppConfig::load(file.path()).unwrap();
        assert_eq!(cfg.executor.timeout_ms, 60_000);
        assert_eq!(cfg.executor.poll_interval_secs, 30);
        assert_eq!(
            cfg.notifications.webhook_url.as_deref(),
            Some("https://ops.example.com/hooks/tasks")
        );
        let template = cfg.notifications.template();
        assert_eq!(template.recipient_role, "finance");
        assert_eq!(template.template_code, "scheduled_task_failed");
        assert_eq!(cfg.server.bind, "127.0.0.1:8080");
    }

    #[test]
    fn test_invalid_toml_is_an_error() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[executor\ntimeout_ms = ").unwrap();
        assert!(AppConfig::load(file.path()).is_err());
    }
}
