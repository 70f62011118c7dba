//! Logging setup for the master and its workers.
//!
//! # Environment Variables
//!
//! - `PREFORK_LOG` - Log filter (overrides RUST_LOG)
//! - `PREFORK_LOG_LEVEL` - Log level: error, warn, info, debug, trace
//! - `PREFORK_LOG_FORMAT` - Output format: pretty, compact, json
//! - `PREFORK_LOG_FILE` - Path to log file (in addition to stderr)
//! - `RUST_LOG` - Standard Rust log filter (fallback)
//!
//! Workers always log compact lines without colors to stderr. The master
//! captures that stream and re-emits each line under its own subscriber.

use std::path::{Path, PathBuf};
use std::str::FromStr;

use tracing::Level;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::fmt::{self, MakeWriter, format::FmtSpan};
use tracing_subscriber::layer::{Layer, Layered, SubscriberExt};
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Registry};

/// Log output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LogFormat {
    /// Multi-field human-readable lines.
    #[default]
    Pretty,
    /// Single-line format.
    Compact,
    /// JSON, one object per line.
    Json,
}

impl FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pretty" | "full" => Ok(Self::Pretty),
            "compact" => Ok(Self::Compact),
            "json" => Ok(Self::Json),
            _ => Err(format!(
                "Unknown log format: '{}'. Valid options: pretty, compact, json",
                s
            )),
        }
    }
}

impl std::fmt::Display for LogFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pretty => write!(f, "pretty"),
            Self::Compact => write!(f, "compact"),
            Self::Json => write!(f, "json"),
        }
    }
}

/// Rotation of the log file.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LogRotation {
    Hourly,
    #[default]
    Daily,
    Never,
}

impl FromStr for LogRotation {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "hourly" => Ok(Self::Hourly),
            "daily" => Ok(Self::Daily),
            "never" => Ok(Self::Never),
            _ => Err(format!(
                "Unknown log rotation: '{}'. Valid options: hourly, daily, never",
                s
            )),
        }
    }
}

impl From<LogRotation> for Rotation {
    fn from(rotation: LogRotation) -> Self {
        match rotation {
            LogRotation::Hourly => Rotation::HOURLY,
            LogRotation::Daily => Rotation::DAILY,
            LogRotation::Never => Rotation::NEVER,
        }
    }
}

/// Logging configuration, built with the `with_*` methods and passed to
/// [`init`].
#[derive(Debug, Clone)]
pub struct LogConfig {
    pub level: Level,
    pub format: LogFormat,
    /// Extra output file (stderr is always written).
    pub file_path: Option<PathBuf>,
    pub rotation: LogRotation,
    /// Emit span close events with timing.
    pub span_events: bool,
    /// Filter directive; takes precedence over `level`.
    pub filter: Option<String>,
    pub show_target: bool,
    /// Colors on stderr.
    pub ansi: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: Level::INFO,
            format: LogFormat::Pretty,
            file_path: None,
            rotation: LogRotation::Daily,
            span_events: false,
            filter: None,
            show_target: true,
            ansi: true,
        }
    }
}

impl LogConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Preset for the master and the client commands.
    pub fn for_master() -> Self {
        Self::default().with_format(LogFormat::Compact)
    }

    /// Preset for worker processes, whose stderr is relayed by the master.
    pub fn for_worker(debug: bool) -> Self {
        Self {
            level: if debug { Level::DEBUG } else { Level::INFO },
            format: LogFormat::Compact,
            show_target: false,
            ansi: false,
            ..Self::default()
        }
    }

    pub fn with_level(mut self, level: Level) -> Self {
        self.level = level;
        self
    }

    pub fn with_format(mut self, format: LogFormat) -> Self {
        self.format = format;
        self
    }

    pub fn with_file(mut self, path: PathBuf) -> Self {
        self.file_path = Some(path);
        self
    }

    pub fn with_rotation(mut self, rotation: LogRotation) -> Self {
        self.rotation = rotation;
        self
    }

    pub fn with_span_events(mut self, enabled: bool) -> Self {
        self.span_events = enabled;
        self
    }

    pub fn with_filter(mut self, filter: String) -> Self {
        self.filter = Some(filter);
        self
    }

    pub fn with_ansi(mut self, ansi: bool) -> Self {
        self.ansi = ansi;
        self
    }

    /// Apply environment variable overrides.
    ///
    /// A filter or level already set from the command line wins over
    /// `PREFORK_LOG`, `RUST_LOG` and `PREFORK_LOG_LEVEL`.
    pub fn with_env_overrides(mut self) -> Self {
        if self.filter.is_none() {
            if let Ok(filter) = std::env::var("PREFORK_LOG") {
                self.filter = Some(filter);
            } else if let Ok(filter) = std::env::var("RUST_LOG") {
                self.filter = Some(filter);
            }
        }

        if self.filter.is_none()
            && let Ok(level) = std::env::var("PREFORK_LOG_LEVEL")
        {
            self.level = parse_level(&level).unwrap_or(self.level);
        }

        if let Ok(format) = std::env::var("PREFORK_LOG_FORMAT")
            && let Ok(format) = format.parse()
        {
            self.format = format;
        }

        if let Ok(path) = std::env::var("PREFORK_LOG_FILE") {
            self.file_path = Some(PathBuf::from(path));
        }

        self
    }

    fn build_filter(&self) -> EnvFilter {
        let fallback = || EnvFilter::new(self.level.to_string().to_lowercase());
        match &self.filter {
            Some(filter) => EnvFilter::try_new(filter).unwrap_or_else(|_| {
                eprintln!("Warning: Invalid log filter '{}', using default", filter);
                fallback()
            }),
            None => fallback(),
        }
    }

    fn span_events(&self) -> FmtSpan {
        if self.span_events {
            FmtSpan::CLOSE
        } else {
            FmtSpan::NONE
        }
    }
}

/// Map `-v`/`-q` counts onto a level. `None` leaves the default alone.
pub fn level_from_verbosity(verbose: u8, quiet: bool) -> Option<Level> {
    if quiet {
        return Some(Level::ERROR);
    }
    match verbose {
        0 => None,
        1 => Some(Level::DEBUG),
        _ => Some(Level::TRACE),
    }
}

/// Parse a log level string.
pub fn parse_level(s: &str) -> Option<Level> {
    match s.to_lowercase().as_str() {
        "error" => Some(Level::ERROR),
        "warn" | "warning" => Some(Level::WARN),
        "info" => Some(Level::INFO),
        "debug" => Some(Level::DEBUG),
        "trace" => Some(Level::TRACE),
        _ => None,
    }
}

type Filtered = Layered<EnvFilter, Registry>;
type BoxedLayer = Box<dyn Layer<Filtered> + Send + Sync>;

fn output_layer<W>(config: &LogConfig, writer: W, ansi: bool) -> BoxedLayer
where
    W: for<'w> MakeWriter<'w> + Send + Sync + 'static,
{
    let layer = fmt::layer()
        .with_writer(writer)
        .with_ansi(ansi)
        .with_target(config.show_target)
        .with_span_events(config.span_events());
    match config.format {
        LogFormat::Json => Box::new(layer.json()),
        LogFormat::Compact => Box::new(layer.compact()),
        LogFormat::Pretty => Box::new(layer),
    }
}

fn file_appender(path: &Path, rotation: LogRotation) -> RollingFileAppender {
    let parent = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or(Path::new("."));
    let file_name = path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("prefork.log");
    RollingFileAppender::new(rotation.into(), parent, file_name)
}

/// Install the global subscriber: stderr, plus the log file if configured.
///
/// Later calls are ignored.
pub fn init(config: LogConfig) {
    let stderr = output_layer(&config, std::io::stderr, config.ansi);
    let file = config
        .file_path
        .as_deref()
        .map(|path| output_layer(&config, file_appender(path, config.rotation), false));

    let _ = tracing_subscriber::registry()
        .with(config.build_filter())
        .with(stderr.and_then(file))
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_format_from_str() {
        assert_eq!("pretty".parse::<LogFormat>().unwrap(), LogFormat::Pretty);
        assert_eq!("full".parse::<LogFormat>().unwrap(), LogFormat::Pretty);
        assert_eq!("Compact".parse::<LogFormat>().unwrap(), LogFormat::Compact);
        assert_eq!("json".parse::<LogFormat>().unwrap(), LogFormat::Json);
        let err = "xml".parse::<LogFormat>().unwrap_err();
        assert!(err.contains("pretty, compact, json"));
    }

    #[test]
    fn test_log_rotation_from_str() {
        assert_eq!("hourly".parse::<LogRotation>().unwrap(), LogRotation::Hourly);
        assert_eq!("NEVER".parse::<LogRotation>().unwrap(), LogRotation::Never);
        assert!("weekly".parse::<LogRotation>().is_err());
    }

    #[test]
    fn test_parse_level() {
        assert_eq!(parse_level("warning"), Some(Level::WARN));
        assert_eq!(parse_level("TRACE"), Some(Level::TRACE));
        assert_eq!(parse_level("loud"), None);
    }

    #[test]
    fn test_verbosity() {
        assert_eq!(level_from_verbosity(0, false), None);
        assert_eq!(level_from_verbosity(1, false), Some(Level::DEBUG));
        assert_eq!(level_from_verbosity(5, false), Some(Level::TRACE));
        assert_eq!(level_from_verbosity(2, true), Some(Level::ERROR));
    }

    #[test]
    fn test_worker_preset() {
        let config = LogConfig::for_worker(true);
        assert_eq!(config.level, Level::DEBUG);
        assert_eq!(config.format, LogFormat::Compact);
        assert!(!config.ansi);
        assert!(!config.show_target);
        assert_eq!(LogConfig::for_worker(false).level, Level::INFO);
    }

    #[test]
    fn test_builder() {
        let config = LogConfig::new()
            .with_level(Level::DEBUG)
            .with_format(LogFormat::Json)
            .with_rotation(LogRotation::Never)
            .with_span_events(true)
            .with_ansi(false)
            .with_filter("prefork=trace".to_string())
            .with_file(PathBuf::from("/tmp/prefork.log"));

        assert_eq!(config.level, Level::DEBUG);
        assert_eq!(config.format, LogFormat::Json);
        assert_eq!(config.rotation, LogRotation::Never);
        assert_eq!(config.span_events(), FmtSpan::CLOSE);
        assert_eq!(config.filter.as_deref(), Some("prefork=trace"));
        assert_eq!(config.file_path, Some(PathBuf::from("/tmp/prefork.log")));
    }

    #[test]
    fn test_cli_filter_beats_env() {
        let config = LogConfig::new()
            .with_filter("error".to_string())
            .with_env_overrides();
        assert_eq!(config.filter.as_deref(), Some("error"));
    }
}
