//! Daemon configuration.
//!
//! Loaded from an optional TOML file with `serde(default)` throughout, the
//! same layering the teacher's `Configuration::load` uses, plus a small set
//! of environment variable overrides (spec section 6: "data directory is
//! overridable by a single environment variable; a toggle selects container
//! mode vs native process mode").

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

pub const DATA_DIR_ENV: &str = "DEBUG_HOST_DATA_DIR";
pub const MODE_ENV: &str = "DEBUG_HOST_MODE";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunMode {
    Container,
    Native,
}

impl Default for RunMode {
    fn default() -> Self {
        RunMode::Container
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiConfiguration {
    /// Bind host. Always forced to loopback in `resolve`, regardless of
    /// what a config file says — the spec is a hard non-goal on remote bind.
    pub host: String,
    /// MCP-style server port (spec default 2601).
    pub mcp_port: u16,
    /// Auxiliary REST port (spec default 2602).
    pub api_port: u16,
}

impl Default for ApiConfiguration {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            mcp_port: 2601,
            api_port: 2602,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DockerConfiguration {
    /// Docker socket path. Empty string means "probe the OS default".
    pub socket: String,
    pub network_name: String,
}

impl Default for DockerConfiguration {
    fn default() -> Self {
        Self {
            socket: String::new(),
            network_name: "debug-host-network".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LimitsConfiguration {
    pub memory_bytes: i64,
    pub cpu_cores: f64,
}

impl Default for LimitsConfiguration {
    fn default() -> Self {
        Self {
            memory_bytes: 2 * 1024 * 1024 * 1024,
            cpu_cores: 2.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthConfiguration {
    pub check_interval_secs: u64,
}

impl Default for HealthConfiguration {
    fn default() -> Self {
        Self {
            check_interval_secs: 30,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LogsConfiguration {
    pub ring_buffer_capacity: usize,
    pub index_refresh_secs: u64,
}

impl Default for LogsConfiguration {
    fn default() -> Self {
        Self {
            ring_buffer_capacity: 2000,
            index_refresh_secs: 60,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsConfiguration {
    pub fast_interval_secs: u64,
    pub medium_interval_secs: u64,
    pub slow_interval_secs: u64,
    pub aggregation_interval_secs: u64,
    pub retention_sweep_secs: u64,
}

impl Default for MetricsConfiguration {
    fn default() -> Self {
        Self {
            fast_interval_secs: 1,
            medium_interval_secs: 5,
            slow_interval_secs: 30,
            aggregation_interval_secs: 300,
            retention_sweep_secs: 600,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Configuration {
    pub data_directory: PathBuf,
    pub mode: RunMode,
    pub api: ApiConfiguration,
    pub docker: DockerConfiguration,
    pub limits: LimitsConfiguration,
    pub health: HealthConfiguration,
    pub logs: LogsConfiguration,
    pub metrics: MetricsConfiguration,
}

impl Default for Configuration {
    fn default() -> Self {
        Self {
            data_directory: PathBuf::from("./data"),
            mode: RunMode::default(),
            api: ApiConfiguration::default(),
            docker: DockerConfiguration::default(),
            limits: LimitsConfiguration::default(),
            health: HealthConfiguration::default(),
            logs: LogsConfiguration::default(),
            metrics: MetricsConfiguration::default(),
        }
    }
}

impl Configuration {
    /// Load configuration from `path` if present, defaulting otherwise, then
    /// resolve the data directory against the config file's parent and apply
    /// environment variable overrides.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let mut config = if path.exists() {
            let raw = std::fs::read_to_string(path)?;
            toml::from_str(&raw)?
        } else {
            Configuration::default()
        };

        if !config.data_directory.is_absolute() {
            let base = path.parent().unwrap_or_else(|| Path::new("."));
            config.data_directory = base.join(&config.data_directory);
        }

        if let Ok(dir) = std::env::var(DATA_DIR_ENV) {
            config.data_directory = PathBuf::from(dir);
        }
        if let Ok(mode) = std::env::var(MODE_ENV) {
            config.mode = match mode.to_lowercase().as_str() {
                "native" => RunMode::Native,
                _ => RunMode::Container,
            };
        }

        // Loopback-only bind, regardless of what the config file said.
        config.api.host = "127.0.0.1".to_string();

        config.ensure_directories()?;
        Ok(config)
    }

    fn ensure_directories(&self) -> anyhow::Result<()> {
        for sub in ["system", "metrics", "logs", "state"] {
            std::fs::create_dir_all(self.data_directory.join(sub))?;
        }
        Ok(())
    }

    pub fn system_dir(&self) -> PathBuf {
        self.data_directory.join("system")
    }

    pub fn metrics_dir(&self) -> PathBuf {
        self.data_directory.join("metrics")
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.data_directory.join("logs")
    }

    pub fn state_dir(&self) -> PathBuf {
        self.data_directory.join("state")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_loopback_and_spec_ports() {
        let config = Configuration::default();
        assert_eq!(config.api.host, "127.0.0.1");
        assert_eq!(config.api.mcp_port, 2601);
        assert_eq!(config.api.api_port, 2602);
    }

    #[test]
    fn load_missing_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config_path = dir.path().join("config.toml");
        let config = Configuration::load(&config_path).unwrap();
        assert_eq!(config.mode, RunMode::Container);
        assert!(config.system_dir().exists());
    }
}
