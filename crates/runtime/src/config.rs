//! Configuration management for the serverless platform
//!
//! The configuration is read once at startup from a YAML file and handed to
//! every component by reference. Nothing reloads it at runtime.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Environment variable that overrides the configuration file location
pub const CONFIG_PATH_ENV: &str = "SERVERLESS_CONFIG";

/// Default configuration file location, relative to the working directory
pub const DEFAULT_CONFIG_PATH: &str = "config/config.yaml";

/// Where a loaded configuration came from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigSource {
    /// Read from this file
    File(PathBuf),
    /// The file did not exist; built-in defaults are in use
    Defaults { missing: PathBuf },
}

impl ConfigSource {
    pub fn log(&self) {
        match self {
            ConfigSource::File(path) => {
                tracing::info!(path = %path.display(), "Loaded configuration")
            }
            ConfigSource::Defaults { missing } => tracing::warn!(
                "Config file {} not found, using defaults",
                missing.display()
            ),
        }
    }
}

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid configuration value for {key}: {reason}")]
    InvalidValue { key: String, reason: String },

    #[error("IO error reading config file {path}: {message}")]
    IoError { path: String, message: String },

    #[error("Configuration parsing error: {message}")]
    ParseError { message: String },
}

/// Process-wide platform configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PlatformConfig {
    /// Address the coordinator listens on and the CLI talks to
    pub server_addr: String,
    /// SQLite database holding function metadata (`:memory:` for an ephemeral registry)
    pub db_path: PathBuf,
    /// Upper bound applied to invocations that do not request their own deadline
    #[serde(with = "humantime_serde")]
    pub default_timeout: Option<Duration>,
    /// How long in-flight invocations may run after a shutdown signal
    #[serde(with = "humantime_serde")]
    pub shutdown_grace: Duration,
    /// Maximum size of incoming request bodies in bytes
    pub max_body_bytes: usize,
    /// Sandbox backend configuration
    pub sandbox: SandboxConfig,
    /// Logging configuration
    pub logging: LoggingConfig,
}

impl Default for PlatformConfig {
    fn default() -> Self {
        Self {
            server_addr: "localhost:8080".to_string(),
            db_path: PathBuf::from("serverless.db"),
            default_timeout: Some(Duration::from_secs(30)),
            shutdown_grace: Duration::from_secs(5),
            max_body_bytes: 1_048_576, // 1 MB
            sandbox: SandboxConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

/// Which sandbox backend executes functions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SandboxBackend {
    /// Docker Engine containers
    Docker,
    /// Local subprocesses (development only, no isolation)
    Process,
}

/// Sandbox configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SandboxConfig {
    pub backend: SandboxBackend,
    /// Command every function image is started with
    pub entry_command: Vec<String>,
    /// Maximum output a function may produce before the invocation fails
    pub max_output_bytes: usize,
    pub docker: DockerConfig,
    pub process: ProcessConfig,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            backend: SandboxBackend::Docker,
            entry_command: vec!["/app/function".to_string()],
            max_output_bytes: 10 * 1024 * 1024, // 10 MB
            docker: DockerConfig::default(),
            process: ProcessConfig::default(),
        }
    }
}

/// Docker Engine connection settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DockerConfig {
    /// Unix socket of the engine; local defaults (`DOCKER_HOST`) when unset
    pub socket: Option<String>,
    /// Timeout for individual engine API requests, in seconds
    pub request_timeout_secs: u64,
}

impl Default for DockerConfig {
    fn default() -> Self {
        Self {
            socket: None,
            request_timeout_secs: 120,
        }
    }
}

/// Subprocess backend settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ProcessConfig {
    /// Working directory for spawned functions
    pub working_directory: Option<PathBuf>,
    /// Extra environment passed to every function process
    pub environment: HashMap<String, String>,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level
    pub level: String,
    /// Log format
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Json,
        }
    }
}

/// Log format options
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Json,
    Pretty,
    Compact,
}

impl PlatformConfig {
    /// Resolve the configuration path from an explicit value, the environment, or the default
    pub fn resolve_path(explicit: Option<&str>) -> PathBuf {
        explicit
            .map(PathBuf::from)
            .or_else(|| std::env::var(CONFIG_PATH_ENV).ok().map(PathBuf::from))
            .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH))
    }

    /// Load configuration, falling back to defaults when the file does not exist
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let (config, source) = Self::load_with_source(path)?;
        source.log();
        Ok(config)
    }

    /// Like [`PlatformConfig::load`], but reports where the configuration came
    /// from instead of logging it, for callers that set up logging from the
    /// configuration itself
    pub fn load_with_source<P: AsRef<Path>>(
        path: P,
    ) -> Result<(Self, ConfigSource), ConfigError> {
        let path = path.as_ref();
        if !path.exists() {
            return Ok((
                Self::default(),
                ConfigSource::Defaults {
                    missing: path.to_path_buf(),
                },
            ));
        }

        let config = Self::from_file(path)?;
        config.validate()?;
        Ok((config, ConfigSource::File(path.to_path_buf())))
    }

    /// Load configuration from file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::IoError {
            path: path.display().to_string(),
            message: e.to_string(),
        })?;

        Self::from_yaml_str(&content)
    }

    /// Parse configuration from YAML text
    pub fn from_yaml_str(content: &str) -> Result<Self, ConfigError> {
        // An empty document is valid and means "all defaults"
        if content.trim().is_empty() {
            return Ok(Self::default());
        }

        serde_yaml::from_str(content).map_err(|e| ConfigError::ParseError {
            message: e.to_string(),
        })
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.server_addr.trim().is_empty() {
            return Err(ConfigError::InvalidValue {
                key: "server_addr".to_string(),
                reason: "Address cannot be empty".to_string(),
            });
        }

        if self.db_path.as_os_str().is_empty() {
            return Err(ConfigError::InvalidValue {
                key: "db_path".to_string(),
                reason: "Database path cannot be empty".to_string(),
            });
        }

        if self.default_timeout == Some(Duration::ZERO) {
            return Err(ConfigError::InvalidValue {
                key: "default_timeout".to_string(),
                reason: "Timeout must be > 0 (use null to disable it)".to_string(),
            });
        }

        if self.max_body_bytes == 0 {
            return Err(ConfigError::InvalidValue {
                key: "max_body_bytes".to_string(),
                reason: "Body limit must be > 0".to_string(),
            });
        }

        if self.sandbox.entry_command.is_empty() {
            return Err(ConfigError::InvalidValue {
                key: "sandbox.entry_command".to_string(),
                reason: "Entry command cannot be empty".to_string(),
            });
        }

        if self.sandbox.max_output_bytes == 0 {
            return Err(ConfigError::InvalidValue {
                key: "sandbox.max_output_bytes".to_string(),
                reason: "Output limit must be > 0".to_string(),
            });
        }

        let valid_levels = ["error", "warn", "info", "debug", "trace"];
        if !valid_levels.contains(&self.logging.level.as_str()) {
            return Err(ConfigError::InvalidValue {
                key: "logging.level".to_string(),
                reason: format!("Must be one of: {}", valid_levels.join(", ")),
            });
        }

        Ok(())
    }

    /// Whether the registry should live in memory only
    pub fn uses_memory_registry(&self) -> bool {
        self.db_path.as_os_str() == ":memory:"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::io::Write;

    #[test]
    fn test_default_config() {
        let config = PlatformConfig::default();
        assert_eq!(config.server_addr, "localhost:8080");
        assert_eq!(config.db_path, PathBuf::from("serverless.db"));
        assert_eq!(config.sandbox.backend, SandboxBackend::Docker);
        assert_eq!(config.sandbox.entry_command, vec!["/app/function"]);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_yaml_keeps_defaults() {
        let config = PlatformConfig::from_yaml_str(
            "server_addr: 0.0.0.0:9000\ndefault_timeout: 2s\nsandbox:\n  backend: process\n",
        )
        .unwrap();

        assert_eq!(config.server_addr, "0.0.0.0:9000");
        assert_eq!(config.default_timeout, Some(Duration::from_secs(2)));
        assert_eq!(config.sandbox.backend, SandboxBackend::Process);
        assert_eq!(config.shutdown_grace, Duration::from_secs(5));
        assert_eq!(config.sandbox.max_output_bytes, 10 * 1024 * 1024);
    }

    #[test]
    fn test_null_timeout_disables_default_deadline() {
        let config = PlatformConfig::from_yaml_str("default_timeout: null\n").unwrap();
        assert_eq!(config.default_timeout, None);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_invalid_yaml_is_a_parse_error() {
        let err = PlatformConfig::from_yaml_str("sandbox: [unterminated").unwrap_err();
        assert!(matches!(err, ConfigError::ParseError { .. }));
    }

    #[test]
    fn test_missing_file_falls_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = PlatformConfig::load(dir.path().join("absent.yaml")).unwrap();
        assert_eq!(config.server_addr, "localhost:8080");
    }

    #[test]
    fn test_load_reports_default_fallback() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("absent.yaml");

        let (config, source) = PlatformConfig::load_with_source(&missing).unwrap();
        assert_eq!(config.server_addr, "localhost:8080");
        assert_eq!(source, ConfigSource::Defaults { missing });
    }

    #[test]
    fn test_load_reports_file_source() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "server_addr: \"0.0.0.0:9000\"").unwrap();

        let (config, source) = PlatformConfig::load_with_source(file.path()).unwrap();
        assert_eq!(config.server_addr, "0.0.0.0:9000");
        assert_eq!(source, ConfigSource::File(file.path().to_path_buf()));
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "db_path: \":memory:\"\nlogging:\n  level: debug\n  format: pretty").unwrap();

        let config = PlatformConfig::load(file.path()).unwrap();
        assert!(config.uses_memory_registry());
        assert_eq!(config.logging.level, "debug");
        assert_eq!(config.logging.format, LogFormat::Pretty);
    }

    #[test]
    fn test_load_rejects_invalid_values() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "sandbox:\n  entry_command: []").unwrap();

        let err = PlatformConfig::load(file.path()).unwrap_err();
        match err {
            ConfigError::InvalidValue { key, .. } => assert_eq!(key, "sandbox.entry_command"),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_validate_rejects_unknown_log_level() {
        let mut config = PlatformConfig::default();
        config.logging.level = "loud".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    #[serial]
    fn test_resolve_path_precedence() {
        std::env::set_var(CONFIG_PATH_ENV, "/etc/serverless/env.yaml");
        assert_eq!(
            PlatformConfig::resolve_path(Some("explicit.yaml")),
            PathBuf::from("explicit.yaml")
        );
        assert_eq!(
            PlatformConfig::resolve_path(None),
            PathBuf::from("/etc/serverless/env.yaml")
        );

        std::env::remove_var(CONFIG_PATH_ENV);
        assert_eq!(
            PlatformConfig::resolve_path(None),
            PathBuf::from(DEFAULT_CONFIG_PATH)
        );
    }
}
