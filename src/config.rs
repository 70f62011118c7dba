//! Pool configuration.
//!
//! Values come from three layers, highest first: command-line flags, the JSON
//! config file (`prefork.json` in the working directory unless `--config`
//! names another), and built-in defaults. Relative paths are resolved
//! against the working directory.

use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::ValueEnum;
use serde::{Deserialize, Serialize};

use crate::error::{PoolError, Result};
use crate::pool::bridge;
use crate::pool::forwarder::OverflowPolicy;
use crate::pool::spawn::CommandLauncher;

/// Config file looked up in the working directory.
pub const DEFAULT_CONFIG_FILE: &str = "prefork.json";

pub const DEFAULT_HOST: &str = "127.0.0.1";
pub const DEFAULT_PORT: u16 = 5500;
pub const DEFAULT_WORKERS: u16 = 8;
pub const DEFAULT_MAX_REQUESTS: u64 = 1000;
pub const DEFAULT_SOCKET_PATH: &str = ".prefork/run/";
pub const DEFAULT_PIDFILE: &str = ".prefork/prefork.pid";
pub const DEFAULT_RELOAD_TIMEOUT_SECS: i64 = 30;
pub const DEFAULT_BRIDGE: &str = "echo";
pub const DEFAULT_QUEUE_CAPACITY: usize = 64;
pub const DEFAULT_QUEUE_TIMEOUT_SECS: u64 = 5;

/// How worker access lines and application logs reach the operator.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, ValueEnum,
)]
#[serde(rename_all = "lowercase")]
pub enum LogTransport {
    /// Sent to the master as `log` messages on the control channel.
    #[default]
    Relay,
    /// Written by the worker's own subscriber to stderr.
    Direct,
}

impl std::fmt::Display for LogTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Relay => write!(f, "relay"),
            Self::Direct => write!(f, "direct"),
        }
    }
}

/// Behaviour when every worker is busy.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, ValueEnum,
)]
#[serde(rename_all = "lowercase")]
pub enum OverflowMode {
    #[default]
    Reject,
    Queue,
}

impl std::fmt::Display for OverflowMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Reject => write!(f, "reject"),
            Self::Queue => write!(f, "queue"),
        }
    }
}

/// One configuration layer. Every field is optional so layers can be merged.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct FileConfig {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub workers: Option<u16>,
    pub debug: Option<bool>,
    pub logging: Option<bool>,
    pub max_requests: Option<u64>,
    pub socket_path: Option<PathBuf>,
    pub pidfile: Option<PathBuf>,
    /// Seconds; negative disables the timeout.
    pub reload_timeout: Option<i64>,
    pub bridge: Option<String>,
    pub static_directory: Option<PathBuf>,
    pub launch_command: Option<String>,
    pub overflow: Option<OverflowMode>,
    pub queue_capacity: Option<usize>,
    /// Seconds.
    pub queue_timeout: Option<u64>,
    pub log_transport: Option<LogTransport>,
}

impl FileConfig {
    /// Read a config file.
    pub fn load(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                PoolError::ConfigNotFound(path.to_path_buf())
            } else {
                PoolError::Io(e)
            }
        })?;
        serde_json::from_str(&contents).map_err(|source| PoolError::ConfigInvalid {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Locate and read the config file for `working_dir`.
    ///
    /// An explicit `path` must exist. The default file is optional.
    pub fn discover(working_dir: &Path, path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::load(&resolve(working_dir, path)),
            None => {
                let default = working_dir.join(DEFAULT_CONFIG_FILE);
                if default.is_file() {
                    Self::load(&default)
                } else {
                    Ok(Self::default())
                }
            }
        }
    }

    /// Fill every unset field of `self` from `lower`.
    pub fn or(self, lower: FileConfig) -> FileConfig {
        FileConfig {
            host: self.host.or(lower.host),
            port: self.port.or(lower.port),
            workers: self.workers.or(lower.workers),
            debug: self.debug.or(lower.debug),
            logging: self.logging.or(lower.logging),
            max_requests: self.max_requests.or(lower.max_requests),
            socket_path: self.socket_path.or(lower.socket_path),
            pidfile: self.pidfile.or(lower.pidfile),
            reload_timeout: self.reload_timeout.or(lower.reload_timeout),
            bridge: self.bridge.or(lower.bridge),
            static_directory: self.static_directory.or(lower.static_directory),
            launch_command: self.launch_command.or(lower.launch_command),
            overflow: self.overflow.or(lower.overflow),
            queue_capacity: self.queue_capacity.or(lower.queue_capacity),
            queue_timeout: self.queue_timeout.or(lower.queue_timeout),
            log_transport: self.log_transport.or(lower.log_transport),
        }
    }
}

/// Fully resolved configuration. Read-only to the pool.
#[derive(Debug, Clone, PartialEq)]
pub struct PoolConfig {
    pub working_dir: PathBuf,
    pub host: String,
    pub port: u16,
    pub workers: u16,
    pub debug: bool,
    pub logging: bool,
    /// Requests before a worker is recycled; 0 means never.
    pub max_requests: u64,
    pub socket_path: PathBuf,
    pub pidfile: PathBuf,
    pub reload_timeout: Option<Duration>,
    pub bridge: String,
    pub static_directory: Option<PathBuf>,
    pub launch_command: Option<String>,
    pub overflow: OverflowMode,
    pub queue_capacity: usize,
    pub queue_timeout: Duration,
    pub log_transport: LogTransport,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self::resolve(PathBuf::from("."), FileConfig::default())
    }
}

impl PoolConfig {
    /// Apply defaults to a merged layer.
    pub fn resolve(working_dir: PathBuf, layer: FileConfig) -> Self {
        let reload_timeout = layer
            .reload_timeout
            .unwrap_or(DEFAULT_RELOAD_TIMEOUT_SECS);
        Self {
            host: layer.host.unwrap_or_else(|| DEFAULT_HOST.to_string()),
            port: layer.port.unwrap_or(DEFAULT_PORT),
            workers: layer.workers.unwrap_or(DEFAULT_WORKERS),
            debug: layer.debug.unwrap_or(false),
            logging: layer.logging.unwrap_or(true),
            max_requests: layer.max_requests.unwrap_or(DEFAULT_MAX_REQUESTS),
            socket_path: resolve(
                &working_dir,
                &layer
                    .socket_path
                    .unwrap_or_else(|| PathBuf::from(DEFAULT_SOCKET_PATH)),
            ),
            pidfile: resolve(
                &working_dir,
                &layer
                    .pidfile
                    .unwrap_or_else(|| PathBuf::from(DEFAULT_PIDFILE)),
            ),
            reload_timeout: u64::try_from(reload_timeout)
                .ok()
                .map(Duration::from_secs),
            bridge: layer.bridge.unwrap_or_else(|| DEFAULT_BRIDGE.to_string()),
            static_directory: layer
                .static_directory
                .map(|dir| resolve(&working_dir, &dir)),
            launch_command: layer.launch_command.filter(|c| !c.trim().is_empty()),
            overflow: layer.overflow.unwrap_or_default(),
            queue_capacity: layer.queue_capacity.unwrap_or(DEFAULT_QUEUE_CAPACITY),
            queue_timeout: Duration::from_secs(
                layer.queue_timeout.unwrap_or(DEFAULT_QUEUE_TIMEOUT_SECS),
            ),
            log_transport: layer.log_transport.unwrap_or_default(),
            working_dir,
        }
    }

    /// Load flags over the config file over defaults, then validate.
    pub fn load(working_dir: &Path, config_file: Option<&Path>, flags: FileConfig) -> Result<Self> {
        let file = FileConfig::discover(working_dir, config_file)?;
        let config = Self::resolve(working_dir.to_path_buf(), flags.or(file));
        config.validate()?;
        Ok(config)
    }

    /// Reject configurations the pool cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.workers == 0 {
            return Err(PoolError::ConfigValue(
                "workers must be at least 1".to_string(),
            ));
        }
        if !bridge::is_known(&self.bridge) {
            return Err(PoolError::UnknownBridge(self.bridge.clone()));
        }
        if self.overflow == OverflowMode::Queue && self.queue_capacity == 0 {
            return Err(PoolError::ConfigValue(
                "queue-capacity must be at least 1 with overflow=queue".to_string(),
            ));
        }
        if let Some(template) = &self.launch_command {
            CommandLauncher::current_exe(&self.working_dir)?.with_template(template)?;
        }
        Ok(())
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn overflow_policy(&self) -> OverflowPolicy {
        match self.overflow {
            OverflowMode::Reject => OverflowPolicy::Reject,
            OverflowMode::Queue => OverflowPolicy::Queue {
                capacity: self.queue_capacity,
                timeout: self.queue_timeout,
            },
        }
    }

    /// Name/value pairs for display.
    pub fn entries(&self) -> Vec<(&'static str, String)> {
        let optional = |p: &Option<PathBuf>| {
            p.as_ref()
                .map(|p| p.display().to_string())
                .unwrap_or_else(|| "-".to_string())
        };
        vec![
            ("working-dir", self.working_dir.display().to_string()),
            ("host", self.host.clone()),
            ("port", self.port.to_string()),
            ("workers", self.workers.to_string()),
            ("debug", self.debug.to_string()),
            ("logging", self.logging.to_string()),
            ("max-requests", self.max_requests.to_string()),
            ("socket-path", self.socket_path.display().to_string()),
            ("pidfile", self.pidfile.display().to_string()),
            (
                "reload-timeout",
                self.reload_timeout
                    .map(|t| format!("{}s", t.as_secs()))
                    .unwrap_or_else(|| "disabled".to_string()),
            ),
            ("bridge", self.bridge.clone()),
            ("static-directory", optional(&self.static_directory)),
            (
                "launch-command",
                self.launch_command.clone().unwrap_or_else(|| "-".to_string()),
            ),
            ("overflow", self.overflow.to_string()),
            ("queue-capacity", self.queue_capacity.to_string()),
            ("queue-timeout", format!("{}s", self.queue_timeout.as_secs())),
            ("log-transport", self.log_transport.to_string()),
        ]
    }
}

fn resolve(base: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base.join(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = PoolConfig::resolve(PathBuf::from("/srv/app"), FileConfig::default());
        assert_eq!(config.listen_addr(), "127.0.0.1:5500");
        assert_eq!(config.workers, 8);
        assert!(!config.debug);
        assert!(config.logging);
        assert_eq!(config.max_requests, 1000);
        assert_eq!(config.socket_path, PathBuf::from("/srv/app/.prefork/run/"));
        assert_eq!(config.pidfile, PathBuf::from("/srv/app/.prefork/prefork.pid"));
        assert_eq!(config.reload_timeout, Some(Duration::from_secs(30)));
        assert_eq!(config.bridge, "echo");
        assert_eq!(config.overflow_policy(), OverflowPolicy::Reject);
        assert_eq!(config.log_transport, LogTransport::Relay);
    }

    #[test]
    fn test_negative_reload_timeout_disables_it() {
        let config = PoolConfig::resolve(
            PathBuf::from("."),
            FileConfig {
                reload_timeout: Some(-1),
                ..FileConfig::default()
            },
        );
        assert_eq!(config.reload_timeout, None);
    }

    #[test]
    fn test_flags_beat_file_beat_defaults() {
        let file = FileConfig {
            port: Some(8080),
            workers: Some(4),
            bridge: Some("static".to_string()),
            ..FileConfig::default()
        };
        let flags = FileConfig {
            workers: Some(2),
            ..FileConfig::default()
        };
        let config = PoolConfig::resolve(PathBuf::from("."), flags.or(file));
        assert_eq!(config.workers, 2);
        assert_eq!(config.port, 8080);
        assert_eq!(config.bridge, "static");
        assert_eq!(config.host, DEFAULT_HOST);
    }

    #[test]
    fn test_file_uses_kebab_case_keys() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join(DEFAULT_CONFIG_FILE),
            r#"{
                "workers": 3,
                "max-requests": 0,
                "socket-path": "/tmp/pf-run",
                "reload-timeout": 5,
                "overflow": "queue",
                "queue-timeout": 2,
                "log-transport": "direct",
                "app-env": "prod"
            }"#,
        )
        .unwrap();

        let config = PoolConfig::load(dir.path(), None, FileConfig::default()).unwrap();
        assert_eq!(config.workers, 3);
        assert_eq!(config.max_requests, 0);
        assert_eq!(config.socket_path, PathBuf::from("/tmp/pf-run"));
        assert_eq!(config.reload_timeout, Some(Duration::from_secs(5)));
        assert_eq!(
            config.overflow_policy(),
            OverflowPolicy::Queue {
                capacity: DEFAULT_QUEUE_CAPACITY,
                timeout: Duration::from_secs(2),
            }
        );
        assert_eq!(config.log_transport, LogTransport::Direct);
    }

    #[test]
    fn test_missing_default_file_is_fine() {
        let dir = tempfile::tempdir().unwrap();
        assert!(PoolConfig::load(dir.path(), None, FileConfig::default()).is_ok());
    }

    #[test]
    fn test_explicit_file_must_exist() {
        let dir = tempfile::tempdir().unwrap();
        let result = PoolConfig::load(
            dir.path(),
            Some(Path::new("nope.json")),
            FileConfig::default(),
        );
        assert!(matches!(result, Err(PoolError::ConfigNotFound(_))));
    }

    #[test]
    fn test_invalid_file() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(DEFAULT_CONFIG_FILE), "{\"workers\": \"many\"}").unwrap();
        let result = PoolConfig::load(dir.path(), None, FileConfig::default());
        assert!(matches!(result, Err(PoolError::ConfigInvalid { .. })));
    }

    #[test]
    fn test_validation() {
        let zero = PoolConfig {
            workers: 0,
            ..PoolConfig::default()
        };
        assert!(matches!(zero.validate(), Err(PoolError::ConfigValue(_))));

        let bad_bridge = PoolConfig {
            bridge: "symfony".to_string(),
            ..PoolConfig::default()
        };
        assert!(matches!(
            bad_bridge.validate(),
            Err(PoolError::UnknownBridge(_))
        ));

        let bad_launcher = PoolConfig {
            launch_command: Some("no-such-launcher-binary {slot}".to_string()),
            ..PoolConfig::default()
        };
        assert!(matches!(
            bad_launcher.validate(),
            Err(PoolError::LaunchCommand(_))
        ));

        assert!(PoolConfig::default().validate().is_ok());
    }

    #[test]
    fn test_entries_cover_every_setting() {
        let entries = PoolConfig::default().entries();
        let names: Vec<&str> = entries.iter().map(|(name, _)| *name).collect();
        assert!(names.contains(&"reload-timeout"));
        assert!(names.contains(&"log-transport"));
        assert_eq!(entries.len(), 17);
    }
}
