//! Settings
//!
//! Everything tunable lives in one TOML file. Every field has a default, so
//! an empty file (or no file) is a working configuration.
//!
//! ```toml
//! [engine]
//! binary = "bin/xray"
//! readiness_timeout_ms = 3000
//!
//! [ports]
//! socks = 10808
//! http = 10809
//! control = 10085
//! ```

use crate::stats::StatsStore;
use crate::supervisor::EngineCommand;
use crate::system_proxy::DEFAULT_FALLBACK_SERVICE;
use crate::transport::LocalPorts;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::warn;

/// Top-level settings
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub engine: EngineSettings,

    /// Local inbounds; fixed for the lifetime of a manager
    #[serde(default)]
    pub ports: LocalPorts,

    #[serde(default)]
    pub stats: StatsSettings,

    #[serde(default)]
    pub network: NetworkSettings,

    #[serde(default)]
    pub logging: LoggingSettings,
}

/// Proxy engine invocation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineSettings {
    /// Engine executable; relative paths resolve against our own executable
    #[serde(default = "default_binary")]
    pub binary: PathBuf,

    /// Prepended to every engine invocation
    #[serde(default)]
    pub extra_args: Vec<String>,

    /// Engine log level written into its config
    #[serde(default = "default_engine_log_level")]
    pub log_level: String,

    #[serde(default = "default_readiness_timeout")]
    pub readiness_timeout_ms: u64,

    #[serde(default = "default_stop_grace")]
    pub stop_grace_ms: u64,
}

/// Traffic accounting
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatsSettings {
    /// Cumulative record location (defaults to the user data directory)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub record_path: Option<PathBuf>,

    #[serde(default = "default_query_timeout")]
    pub query_timeout_ms: u64,
}

/// Host proxy integration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetworkSettings {
    /// Service to configure when the active one cannot be resolved
    #[serde(default = "default_fallback_service")]
    pub fallback_service: String,

    #[serde(default = "default_command_timeout")]
    pub command_timeout_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoggingSettings {
    /// trace, debug, info, warn or error
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_binary() -> PathBuf {
    if cfg!(windows) {
        PathBuf::from("bin/xray.exe")
    } else {
        PathBuf::from("bin/xray")
    }
}

fn default_engine_log_level() -> String {
    "warning".to_string()
}

fn default_readiness_timeout() -> u64 {
    3000
}

fn default_stop_grace() -> u64 {
    3000
}

fn default_query_timeout() -> u64 {
    2000
}

fn default_fallback_service() -> String {
    DEFAULT_FALLBACK_SERVICE.to_string()
}

fn default_command_timeout() -> u64 {
    5000
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            binary: default_binary(),
            extra_args: Vec::new(),
            log_level: default_engine_log_level(),
            readiness_timeout_ms: default_readiness_timeout(),
            stop_grace_ms: default_stop_grace(),
        }
    }
}

impl Default for StatsSettings {
    fn default() -> Self {
        Self {
            record_path: None,
            query_timeout_ms: default_query_timeout(),
        }
    }
}

impl Default for NetworkSettings {
    fn default() -> Self {
        Self {
            fallback_service: default_fallback_service(),
            command_timeout_ms: default_command_timeout(),
        }
    }
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl Settings {
    /// `<config dir>/veil/config.toml`
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("veil").join("config.toml"))
    }

    /// Load and validate a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, SettingsError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self, SettingsError> {
        let settings: Settings = toml::from_str(content)?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn to_toml(&self) -> Result<String, SettingsError> {
        Ok(toml::to_string_pretty(self)?)
    }

    pub fn to_file<P: AsRef<Path>>(&self, path: P) -> Result<(), SettingsError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, self.to_toml()?)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<(), SettingsError> {
        if self.engine.binary.as_os_str().is_empty() {
            return Err(SettingsError::Invalid("engine.binary is empty".into()));
        }

        if !self.ports.is_valid() {
            return Err(SettingsError::Invalid(format!(
                "ports must be non-zero and distinct (socks {}, http {}, control {})",
                self.ports.socks, self.ports.http, self.ports.control
            )));
        }

        let timeouts = [
            ("engine.readiness_timeout_ms", self.engine.readiness_timeout_ms),
            ("engine.stop_grace_ms", self.engine.stop_grace_ms),
            ("stats.query_timeout_ms", self.stats.query_timeout_ms),
            ("network.command_timeout_ms", self.network.command_timeout_ms),
        ];
        if let Some((name, _)) = timeouts.iter().find(|(_, ms)| *ms == 0) {
            return Err(SettingsError::Invalid(format!("{} must be non-zero", name)));
        }

        Ok(())
    }

    /// Engine binary with relative paths anchored at our executable's directory
    pub fn engine_binary(&self) -> PathBuf {
        let binary = &self.engine.binary;
        if binary.is_absolute() {
            return binary.clone();
        }

        match std::env::current_exe() {
            Ok(exe) => exe
                .parent()
                .map(|dir| dir.join(binary))
                .unwrap_or_else(|| binary.clone()),
            Err(e) => {
                warn!("Cannot locate own executable ({}), using {} as is", e, binary.display());
                binary.clone()
            }
        }
    }

    pub fn engine_command(&self) -> EngineCommand {
        EngineCommand::new(self.engine_binary(), self.engine.extra_args.iter().cloned())
    }

    pub fn stats_record_path(&self) -> PathBuf {
        self.stats
            .record_path
            .clone()
            .or_else(StatsStore::default_path)
            .unwrap_or_else(|| PathBuf::from("veil-traffic.json"))
    }

    pub fn readiness_timeout(&self) -> Duration {
        Duration::from_millis(self.engine.readiness_timeout_ms)
    }

    pub fn stop_grace(&self) -> Duration {
        Duration::from_millis(self.engine.stop_grace_ms)
    }

    pub fn query_timeout(&self) -> Duration {
        Duration::from_millis(self.stats.query_timeout_ms)
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_millis(self.network.command_timeout_ms)
    }
}

/// Settings errors
#[derive(Debug, thiserror::Error)]
pub enum SettingsError {
    #[error("Failed to access settings file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid settings file: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Failed to serialize settings: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("Invalid settings: {0}")]
    Invalid(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_settings() {
        let settings = Settings::default();
        assert_eq!(settings.ports, LocalPorts::default());
        assert_eq!(settings.network.fallback_service, "Wi-Fi");
        assert_eq!(settings.readiness_timeout(), Duration::from_secs(3));
        assert_eq!(settings.query_timeout(), Duration::from_secs(2));
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let settings = Settings::from_toml(
            r#"
            [engine]
            binary = "/opt/xray/xray"
            extra_args = ["-format", "json"]

            [ports]
            socks = 1080
            "#,
        )
        .unwrap();

        assert_eq!(settings.engine.binary, PathBuf::from("/opt/xray/xray"));
        assert_eq!(settings.engine.stop_grace_ms, 3000);
        assert_eq!(settings.ports.socks, 1080);
        assert_eq!(settings.ports.http, 10809);
        assert_eq!(settings.logging.level, "info");

        assert_eq!(Settings::from_toml("").unwrap(), Settings::default());
    }

    #[test]
    fn test_toml_round_trip() {
        let mut settings = Settings::default();
        settings.stats.record_path = Some(PathBuf::from("/var/lib/veil/traffic.json"));
        settings.network.fallback_service = "Ethernet".into();

        let text = settings.to_toml().unwrap();
        assert!(text.contains("[ports]"));
        assert_eq!(Settings::from_toml(&text).unwrap(), settings);
    }

    #[test]
    fn test_validation() {
        let mut settings = Settings::default();

        settings.ports.http = settings.ports.socks;
        assert!(matches!(settings.validate(), Err(SettingsError::Invalid(_))));
        settings.ports = LocalPorts::default();

        settings.stats.query_timeout_ms = 0;
        let err = settings.validate().unwrap_err();
        assert!(err.to_string().contains("stats.query_timeout_ms"));
        settings.stats.query_timeout_ms = 2000;

        settings.engine.binary = PathBuf::new();
        assert!(settings.validate().is_err());

        assert!(matches!(
            Settings::from_toml("[ports]\ncontrol = 0\n"),
            Err(SettingsError::Invalid(_))
        ));
        assert!(matches!(
            Settings::from_toml("[engine\n"),
            Err(SettingsError::Parse(_))
        ));
    }

    #[test]
    fn test_engine_binary_resolution() {
        let mut settings = Settings::default();
        settings.engine.binary = PathBuf::from("/usr/local/bin/xray");
        assert_eq!(settings.engine_binary(), PathBuf::from("/usr/local/bin/xray"));

        settings.engine.binary = PathBuf::from("bin/xray");
        let exe_dir = std::env::current_exe().unwrap().parent().unwrap().to_path_buf();
        assert_eq!(settings.engine_binary(), exe_dir.join("bin/xray"));
    }

    #[test]
    fn test_file_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("veil").join("config.toml");

        let mut settings = Settings::default();
        settings.engine.readiness_timeout_ms = 5000;
        settings.to_file(&path).unwrap();

        assert_eq!(Settings::from_file(&path).unwrap(), settings);
        assert!(matches!(
            Settings::from_file(dir.path().join("missing.toml")),
            Err(SettingsError::Io(_))
        ));
    }

    #[test]
    fn test_stats_record_path_override() {
        let mut settings = Settings::default();
        settings.stats.record_path = Some(PathBuf::from("/tmp/veil/traffic.json"));
        assert_eq!(settings.stats_record_path(), PathBuf::from("/tmp/veil/traffic.json"));
    }
}
