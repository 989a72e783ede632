//! Configuration loading

use anyhow::{ensure, Context, Result};
use newsensors_core::LoopConfig;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tracing::info;

/// Main configuration structure
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub aggregator: AggregatorConfig,
    #[serde(default)]
    pub world_model: WorldModelConfig,
    #[serde(default)]
    pub solver: SolverConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregatorConfig {
    #[serde(default = "default_host")]
    pub host: String,
    /// Solver port on the aggregator
    #[serde(default = "default_aggregator_port")]
    pub port: u16,
    /// Physical layer to subscribe to (0 = all)
    #[serde(default)]
    pub physical_layer: u8,
    /// Sample forwarding interval requested from the aggregator (0 = as received)
    #[serde(default)]
    pub update_interval_ms: u64,
}

impl Default for AggregatorConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_aggregator_port(),
            physical_layer: 0,
            update_interval_ms: 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorldModelConfig {
    #[serde(default = "default_host")]
    pub host: String,
    /// Port for writing as a solver
    #[serde(default = "default_solver_port")]
    pub solver_port: u16,
    /// Port for reading as a client
    #[serde(default = "default_client_port")]
    pub client_port: u16,
    /// Origin string attached to everything this solver writes
    #[serde(default = "default_origin")]
    pub origin: String,
}

impl Default for WorldModelConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            solver_port: default_solver_port(),
            client_port: default_client_port(),
            origin: default_origin(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SolverConfig {
    /// Reconciliation interval
    #[serde(default = "default_update_interval")]
    pub update_interval_ms: u64,
    /// Limit for establishing each connection
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_ms: u64,
    /// Prefix for placeholder identifiers (defaults to aggregator host:port)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    /// Sleep between idle loop iterations
    #[serde(default = "default_idle_poll")]
    pub idle_poll_ms: u64,
}

impl Default for SolverConfig {
    fn default() -> Self {
        Self {
            update_interval_ms: default_update_interval(),
            connect_timeout_ms: default_connect_timeout(),
            namespace: None,
            idle_poll_ms: default_idle_poll(),
        }
    }
}

/// Longest accepted reconciliation interval (one week)
pub const MAX_UPDATE_INTERVAL_MS: u64 = 7 * 24 * 60 * 60 * 1000;

fn default_host() -> String {
    "localhost".to_string()
}

fn default_aggregator_port() -> u16 {
    newsensors_grail::DEFAULT_AGGREGATOR_PORT
}

fn default_solver_port() -> u16 {
    newsensors_grail::DEFAULT_SOLVER_PORT
}

fn default_client_port() -> u16 {
    newsensors_grail::DEFAULT_CLIENT_PORT
}

fn default_origin() -> String {
    "new-device-solver".to_string()
}

fn default_update_interval() -> u64 {
    30_000
}

fn default_connect_timeout() -> u64 {
    5_000
}

fn default_idle_poll() -> u64 {
    10
}

impl Config {
    /// Prefix for placeholder identifiers
    pub fn namespace(&self) -> String {
        self.solver
            .namespace
            .clone()
            .unwrap_or_else(|| format!("{}:{}", self.aggregator.host, self.aggregator.port))
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.solver.connect_timeout_ms)
    }

    pub fn update_interval(&self) -> Duration {
        Duration::from_millis(self.solver.update_interval_ms)
    }

    /// Reject values the solver cannot run with
    pub fn validate(&self) -> Result<()> {
        ensure!(
            self.solver.update_interval_ms > 0,
            "solver.update_interval_ms must be greater than zero"
        );
        ensure!(
            self.solver.update_interval_ms <= MAX_UPDATE_INTERVAL_MS,
            "solver.update_interval_ms must be at most {} (got {})",
            MAX_UPDATE_INTERVAL_MS,
            self.solver.update_interval_ms
        );
        ensure!(
            self.solver.connect_timeout_ms > 0,
            "solver.connect_timeout_ms must be greater than zero"
        );
        Ok(())
    }

    pub fn to_loop_config(&self) -> LoopConfig {
        LoopConfig {
            update_interval: self.update_interval(),
            idle_poll: Duration::from_millis(self.solver.idle_poll_ms),
        }
    }
}

/// Load configuration from file
pub fn load_config(path: &Path) -> Result<Config> {
    if path.exists() {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        let config: Config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse {}", path.display()))?;
        config
            .validate()
            .with_context(|| format!("Invalid configuration in {}", path.display()))?;
        info!(path = %path.display(), "Loaded configuration");
        Ok(config)
    } else {
        info!(
            path = %path.display(),
            "Configuration file not found, using defaults"
        );
        Ok(Config::default())
    }
}

/// Save default configuration to file
pub fn save_default_config(path: &Path) -> Result<()> {
    let content = toml::to_string_pretty(&Config::default())?;
    std::fs::write(path, content)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.aggregator.port, 7008);
        assert_eq!(config.world_model.solver_port, 7009);
        assert_eq!(config.world_model.client_port, 7010);
        assert_eq!(config.solver.update_interval_ms, 30_000);
        assert_eq!(config.connect_timeout(), Duration::from_secs(5));
        assert_eq!(config.world_model.origin, "new-device-solver");
        assert_eq!(config.namespace(), "localhost:7008");
    }

    #[test]
    fn test_partial_file() {
        let config: Config = toml::from_str(
            r#"
            [aggregator]
            host = "grail.example.org"

            [solver]
            update_interval_ms = 5000
            namespace = "winlab"
            "#,
        )
        .unwrap();
        assert_eq!(config.aggregator.host, "grail.example.org");
        assert_eq!(config.aggregator.port, 7008);
        assert_eq!(config.world_model.host, "localhost");
        assert_eq!(config.update_interval(), Duration::from_secs(5));
        assert_eq!(config.namespace(), "winlab");
    }

    #[test]
    fn test_missing_file_uses_defaults() {
        let dir = TempDir::new().unwrap();
        let config = load_config(&dir.path().join("absent.toml")).unwrap();
        assert_eq!(config, Config::default());
    }

    #[test]
    fn test_default_file_round_trip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("newsensors.toml");
        save_default_config(&path).unwrap();
        assert_eq!(load_config(&path).unwrap(), Config::default());
    }

    #[test]
    fn test_out_of_range_interval_rejected() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("huge.toml");
        std::fs::write(
            &path,
            format!("[solver]\nupdate_interval_ms = {}\n", MAX_UPDATE_INTERVAL_MS + 1),
        )
        .unwrap();
        assert!(load_config(&path).is_err());

        let mut config = Config::default();
        config.solver.update_interval_ms = 0;
        assert!(config.validate().is_err());
        config.solver.update_interval_ms = MAX_UPDATE_INTERVAL_MS;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_invalid_file_rejected() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("bad.toml");
        std::fs::write(&path, "[solver]\nupdate_interval_ms = \"soon\"\n").unwrap();
        assert!(load_config(&path).is_err());
    }
}
