/// Configuration module for the embedding pool.
///
/// Handles loading, validating, and providing default configuration values.
/// A base file may be overlaid by a per-deployment user file.
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{info, warn};

use crate::error::ServiceError;

// ── Default value functions ──────────────────────────────────────────

fn default_program() -> String {
    "python3.6".to_string()
}

fn default_script() -> Option<String> {
    Some("./europeana_embeddings_cmd.py".to_string())
}

fn default_max_instances() -> usize {
    3
}

fn default_base_port() -> u16 {
    12000
}

fn default_max_records_before_restart() -> usize {
    10_000
}

fn default_exchange_secs() -> u64 {
    60
}

fn default_connect_secs() -> u64 {
    60
}

fn default_connect_retry_millis() -> u64 {
    250
}

fn default_terminate_grace_millis() -> u64 {
    2000
}

fn default_true() -> bool {
    true
}

fn default_prerequisite_command() -> Vec<String> {
    vec!["python3.6".to_string(), "--version".to_string()]
}

fn default_expected_prefix() -> String {
    "Python 3.6".to_string()
}

fn default_max_records_per_request() -> usize {
    500
}

// ── Config structs ───────────────────────────────────────────────────

#[derive(Debug, Deserialize, Serialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub worker: WorkerConfig,

    #[serde(default)]
    pub pool: PoolConfig,

    #[serde(default)]
    pub timeouts: TimeoutConfig,

    #[serde(default)]
    pub prerequisite: PrerequisiteConfig,

    #[serde(default)]
    pub limits: LimitsConfig,
}

/// How a worker process is launched.
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct WorkerConfig {
    /// Working directory of every worker. Required.
    #[serde(default)]
    pub directory: String,

    #[serde(default = "default_program")]
    pub program: String,

    #[serde(default = "default_script")]
    pub script: Option<String>,

    #[serde(default)]
    pub extra_args: Vec<String>,

    #[serde(default)]
    pub verbose: bool,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct PoolConfig {
    #[serde(default = "default_max_instances")]
    pub max_instances: usize,

    /// Port of slot 0; slot `i` listens on `base_port + i`.
    #[serde(default = "default_base_port")]
    pub base_port: u16,

    #[serde(default = "default_max_records_before_restart")]
    pub max_records_before_restart: usize,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct TimeoutConfig {
    #[serde(default = "default_exchange_secs")]
    pub exchange_secs: u64,

    #[serde(default = "default_connect_secs")]
    pub connect_secs: u64,

    #[serde(default = "default_connect_retry_millis")]
    pub connect_retry_millis: u64,

    #[serde(default = "default_terminate_grace_millis")]
    pub terminate_grace_millis: u64,
}

/// Command whose output proves the worker's interpreter is installed.
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct PrerequisiteConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default = "default_prerequisite_command")]
    pub command: Vec<String>,

    #[serde(default = "default_expected_prefix")]
    pub expected_prefix: String,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct LimitsConfig {
    #[serde(default = "default_max_records_per_request")]
    pub max_records_per_request: usize,
}

// ── Default impls ────────────────────────────────────────────────────

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            directory: String::new(),
            program: default_program(),
            script: default_script(),
            extra_args: Vec::new(),
            verbose: false,
        }
    }
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_instances: default_max_instances(),
            base_port: default_base_port(),
            max_records_before_restart: default_max_records_before_restart(),
        }
    }
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            exchange_secs: default_exchange_secs(),
            connect_secs: default_connect_secs(),
            connect_retry_millis: default_connect_retry_millis(),
            terminate_grace_millis: default_terminate_grace_millis(),
        }
    }
}

impl Default for PrerequisiteConfig {
    fn default() -> Self {
        Self {
            enabled: default_true(),
            command: default_prerequisite_command(),
            expected_prefix: default_expected_prefix(),
        }
    }
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_records_per_request: default_max_records_per_request(),
        }
    }
}

impl TimeoutConfig {
    #[must_use]
    pub fn exchange(&self) -> Duration {
        Duration::from_secs(self.exchange_secs)
    }

    #[must_use]
    pub fn connect(&self) -> Duration {
        Duration::from_secs(self.connect_secs)
    }

    #[must_use]
    pub fn connect_retry(&self) -> Duration {
        Duration::from_millis(self.connect_retry_millis)
    }

    #[must_use]
    pub fn terminate_grace(&self) -> Duration {
        Duration::from_millis(self.terminate_grace_millis)
    }
}

// ── Config implementation ────────────────────────────────────────────

impl Config {
    /// Load configuration from a JSON file.
    ///
    /// If `config_path` is empty, defaults to `"config.json"`.
    /// If the file does not exist, returns a default config and optionally
    /// generates a template file.
    pub fn load(config_path: &str) -> Result<Self> {
        let path = if config_path.is_empty() {
            "config.json"
        } else {
            config_path
        };

        if !Path::new(path).exists() {
            info!("{path} not found, using defaults");
            let cfg = Self::default();

            // Generate template only for the default path
            if path == "config.json" {
                match cfg.save(path) {
                    Ok(()) => info!("Generated config template: {path}"),
                    Err(e) => warn!("Failed to generate config template: {e}"),
                }
            }

            return Ok(cfg);
        }

        let data = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config: {path}"))?;

        let mut cfg: Config = match serde_json::from_str(&data) {
            Ok(c) => c,
            Err(e) => {
                warn!("Invalid JSON in {path}: {e}");
                warn!("Using default configuration");
                return Ok(Self::default());
            }
        };

        info!("Loaded configuration from {path}");
        cfg.normalize();
        Ok(cfg)
    }

    /// Load a base file and overlay an optional user file on top of it.
    ///
    /// Objects are merged key by key; any other value in the user file
    /// replaces the base value. Either file may be absent.
    pub fn load_layered(base_path: &Path, user_path: Option<&Path>) -> Result<Self> {
        let mut merged = read_json_if_exists(base_path)?
            .unwrap_or_else(|| Value::Object(serde_json::Map::new()));

        if let Some(user_path) = user_path {
            if let Some(overlay) = read_json_if_exists(user_path)? {
                info!("Applying user configuration from {}", user_path.display());
                merge_json(&mut merged, overlay);
            }
        }

        let mut cfg: Config =
            serde_json::from_value(merged).context("failed to parse layered configuration")?;
        cfg.normalize();
        Ok(cfg)
    }

    /// Save configuration to a JSON file.
    pub fn save(&self, path: &str) -> Result<()> {
        let data = serde_json::to_string_pretty(self).context("failed to marshal config")?;
        std::fs::write(path, data).with_context(|| format!("failed to write config: {path}"))?;
        Ok(())
    }

    fn normalize(&mut self) {
        self.worker.directory = self.worker.directory.trim().to_string();
    }

    /// Validate configuration values.
    pub fn validate(&self) -> crate::error::Result<()> {
        if self.worker.directory.trim().is_empty() {
            return Err(ServiceError::Configuration(
                "Configuration option 'worker.directory' not set!".to_string(),
            ));
        }
        if self.worker.program.trim().is_empty() {
            return Err(ServiceError::Configuration(
                "Configuration option 'worker.program' not set!".to_string(),
            ));
        }
        ensure(self.pool.max_instances > 0, "pool.max_instances must be positive")?;
        ensure(
            self.pool.max_records_before_restart > 0,
            "pool.max_records_before_restart must be positive",
        )?;
        let last_port = u64::from(self.pool.base_port) + self.pool.max_instances as u64 - 1;
        ensure(
            last_port <= u64::from(u16::MAX),
            "pool.base_port + pool.max_instances exceeds the port range",
        )?;
        ensure(self.timeouts.exchange_secs > 0, "timeouts.exchange_secs must be positive")?;
        ensure(
            self.limits.max_records_per_request > 0,
            "limits.max_records_per_request must be positive",
        )?;
        if self.prerequisite.enabled {
            ensure(
                !self.prerequisite.command.is_empty(),
                "prerequisite.command must not be empty",
            )?;
        }
        Ok(())
    }

    /// Port bound by the worker of slot `index`.
    ///
    /// `None` when the port would fall outside the `u16` range.
    #[must_use]
    pub fn slot_port(&self, index: usize) -> Option<u16> {
        u16::try_from(index)
            .ok()
            .and_then(|offset| self.pool.base_port.checked_add(offset))
    }

    /// Log the settings an operator most often needs when diagnosing startup.
    pub fn log_settings(&self) {
        info!("Embedding pool settings:");
        info!("  Worker directory: {}", self.worker.directory);
        info!("  Worker program: {}", self.worker.program);
        info!("  Max instances: {}", self.pool.max_instances);
        let last_port =
            u64::from(self.pool.base_port) + self.pool.max_instances.saturating_sub(1) as u64;
        info!("  Ports: {}-{}", self.pool.base_port, last_port);
        info!(
            "  Restart after records: {}",
            self.pool.max_records_before_restart
        );
        info!("  Exchange timeout: {}s", self.timeouts.exchange_secs);
    }
}

fn ensure(condition: bool, message: &str) -> crate::error::Result<()> {
    if condition {
        Ok(())
    } else {
        Err(ServiceError::Configuration(message.to_string()))
    }
}

// ── Layering helpers ─────────────────────────────────────────────────

fn read_json_if_exists(path: &Path) -> Result<Option<Value>> {
    if !path.exists() {
        return Ok(None);
    }
    let data = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config: {}", path.display()))?;
    let value = serde_json::from_str(&data)
        .with_context(|| format!("invalid JSON in config: {}", path.display()))?;
    Ok(Some(value))
}

fn merge_json(base: &mut Value, overlay: Value) {
    match (base, overlay) {
        (Value::Object(base_map), Value::Object(overlay_map)) => {
            for (key, value) in overlay_map {
                match base_map.get_mut(&key) {
                    Some(existing) => merge_json(existing, value),
                    None => {
                        base_map.insert(key, value);
                    }
                }
            }
        }
        (base, overlay) => *base = overlay,
    }
}

// ── Tests ────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn valid_config() -> Config {
        let mut config = Config::default();
        config.worker.directory = "/opt/embeddings".to_string();
        config
    }

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.pool.max_instances, 3);
        assert_eq!(config.pool.base_port, 12000);
        assert_eq!(config.pool.max_records_before_restart, 10_000);
        assert_eq!(config.worker.program, "python3.6");
        assert_eq!(config.prerequisite.expected_prefix, "Python 3.6");
        assert_eq!(config.limits.max_records_per_request, 500);
        assert_eq!(config.timeouts.exchange(), Duration::from_secs(60));
    }

    #[test]
    fn test_load_from_json() {
        let json = r#"{"worker": {"directory": "/srv/py"}, "pool": {"max_instances": 5}}"#;
        let config: Config = serde_json::from_str(json).unwrap();
        assert_eq!(config.worker.directory, "/srv/py");
        assert_eq!(config.pool.max_instances, 5);
        // Other fields should have defaults
        assert_eq!(config.pool.base_port, 12000);
        assert_eq!(config.worker.program, "python3.6");
    }

    #[test]
    fn test_validate_ok() {
        assert!(valid_config().validate().is_ok());
    }

    #[test]
    fn test_validate_blank_directory() {
        let mut config = valid_config();
        config.worker.directory = "   ".to_string();
        let err = config.validate().unwrap_err();
        assert!(matches!(err, ServiceError::Configuration(_)));
        assert!(err.to_string().contains("worker.directory"));
    }

    #[test]
    fn test_validate_zero_instances() {
        let mut config = valid_config();
        config.pool.max_instances = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_zero_restart_threshold() {
        let mut config = valid_config();
        config.pool.max_records_before_restart = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_port_overflow() {
        let mut config = valid_config();
        config.pool.base_port = 65535;
        config.pool.max_instances = 2;
        assert!(config.validate().is_err());

        config.pool.max_instances = 1;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_slot_ports_are_contiguous() {
        let config = valid_config();
        assert_eq!(config.slot_port(0), Some(12000));
        assert_eq!(config.slot_port(2), Some(12002));
    }

    #[test]
    fn test_slot_port_out_of_range() {
        let mut config = valid_config();
        config.pool.base_port = 65535;
        config.pool.max_instances = 3;
        assert_eq!(config.slot_port(0), Some(65535));
        assert_eq!(config.slot_port(2), None);
        assert_eq!(config.slot_port(usize::MAX), None);

        // Logging an unvalidated config must not panic
        config.log_settings();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_load_trims_directory() {
        let temp = tempfile::tempdir().unwrap();
        let path = temp.path().join("embedding.json");
        std::fs::write(&path, r#"{"worker": {"directory": "  /srv/py  "}}"#).unwrap();

        let config = Config::load(&path.to_string_lossy()).unwrap();
        assert_eq!(config.worker.directory, "/srv/py");
    }

    #[test]
    fn test_load_missing_file_uses_defaults() {
        let temp = tempfile::tempdir().unwrap();
        let path = temp.path().join("absent.json");
        let config = Config::load(&path.to_string_lossy()).unwrap();
        assert_eq!(config.pool.max_instances, 3);
        // Templates are only generated for the default path
        assert!(!path.exists());
    }

    #[test]
    fn test_load_layered_user_overrides_base() {
        let temp = tempfile::tempdir().unwrap();
        let base = temp.path().join("embedding.json");
        let user = temp.path().join("embedding.user.json");
        std::fs::write(
            &base,
            r#"{"worker": {"directory": "/srv/py", "program": "python3.6"}, "pool": {"max_instances": 2, "base_port": 13000}}"#,
        )
        .unwrap();
        std::fs::write(&user, r#"{"pool": {"max_instances": 4}}"#).unwrap();

        let config = Config::load_layered(&base, Some(&user)).unwrap();
        assert_eq!(config.pool.max_instances, 4);
        assert_eq!(config.pool.base_port, 13000);
        assert_eq!(config.worker.directory, "/srv/py");
    }

    #[test]
    fn test_load_layered_without_user_file() {
        let temp = tempfile::tempdir().unwrap();
        let base = temp.path().join("embedding.json");
        std::fs::write(&base, r#"{"worker": {"directory": "/srv/py"}}"#).unwrap();

        let missing = temp.path().join("embedding.user.json");
        let config = Config::load_layered(&base, Some(&missing)).unwrap();
        assert_eq!(config.worker.directory, "/srv/py");
        assert_eq!(config.pool.max_instances, 3);
    }

    #[test]
    fn test_load_layered_rejects_invalid_user_json() {
        let temp = tempfile::tempdir().unwrap();
        let base = temp.path().join("embedding.json");
        let user = temp.path().join("embedding.user.json");
        std::fs::write(&base, "{}").unwrap();
        std::fs::write(&user, "{ not json").unwrap();
        assert!(Config::load_layered(&base, Some(&user)).is_err());
    }

    #[test]
    fn test_serialization_roundtrip() {
        let config = valid_config();
        let json = serde_json::to_string_pretty(&config).unwrap();
        let parsed: Config = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.worker.directory, config.worker.directory);
        assert_eq!(parsed.pool.base_port, config.pool.base_port);
        assert_eq!(parsed.worker.script, config.worker.script);
    }
}
