//! Command-line interface definitions using clap.

use std::path::PathBuf;

use clap::{ArgAction, CommandFactory, Parser, Subcommand};
use clap_complete::Shell;

use crate::config::{FileConfig, LogTransport, OverflowMode, PoolConfig};
use crate::error::Result;
use crate::logging::LogFormat;
use crate::pool::WorkerOptions;
use crate::pool::protocol::Slot;

/// Process-pool load balancer for long-lived application workers.
#[derive(Parser, Debug)]
#[command(name = "prefork")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Enable verbose output (-v for debug, -vv for trace).
    #[arg(short, long, action = ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Suppress all output except errors.
    #[arg(short, long, conflicts_with = "verbose", global = true)]
    pub quiet: bool,

    /// Log format: pretty, compact or json.
    #[arg(long, global = true)]
    pub log_format: Option<LogFormat>,

    /// Also write logs to this file.
    #[arg(long, global = true)]
    pub log_file: Option<PathBuf>,

    /// Disable colored output.
    #[arg(long, env = "NO_COLOR", global = true)]
    pub no_color: bool,

    #[command(subcommand)]
    pub command: Commands,
}

/// Available subcommands.
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Start the master and its worker pool in the foreground.
    Start(StartArgs),

    /// Ask a running master to shut down.
    Stop(ControlArgs),

    /// Show the health and request counters of a running master.
    Status(StatusArgs),

    /// Gracefully restart every worker of a running master.
    Reload(ControlArgs),

    /// Print the resolved configuration.
    Config(StartArgs),

    /// Generate shell completions.
    Completions(CompletionsArgs),

    /// Run a worker process (started by the master).
    #[command(hide = true)]
    Worker(WorkerArgs),
}

/// Arguments for shell completions.
#[derive(Parser, Debug)]
pub struct CompletionsArgs {
    /// Shell to generate completions for.
    #[arg(value_enum)]
    pub shell: Shell,
}

impl CompletionsArgs {
    /// Generate and print completions to stdout.
    pub fn generate(&self) {
        clap_complete::generate(
            self.shell,
            &mut Cli::command(),
            "prefork",
            &mut std::io::stdout(),
        );
    }
}

/// Pool options for `start` and `config`. Unset flags fall back to the
/// config file, then to built-in defaults.
#[derive(Parser, Debug, Default)]
pub struct StartArgs {
    /// Application directory; relative paths are resolved against it.
    #[arg(default_value = ".")]
    pub working_dir: PathBuf,

    /// Config file (default: prefork.json in the working directory).
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Address to listen on.
    #[arg(long)]
    pub host: Option<String>,

    /// Port to listen on.
    #[arg(short, long)]
    pub port: Option<u16>,

    /// Number of worker processes.
    #[arg(short, long)]
    pub workers: Option<u16>,

    /// Debug mode: a failed bootstrap stops the pool instead of respawning.
    #[arg(long)]
    pub debug: bool,

    /// Access logging (true or false).
    #[arg(long, action = ArgAction::Set)]
    pub logging: Option<bool>,

    /// Restart a worker after this many requests (0 disables).
    #[arg(long)]
    pub max_requests: Option<u64>,

    /// Directory for the control and worker sockets.
    #[arg(long)]
    pub socket_path: Option<PathBuf>,

    /// Where to write the master's PID.
    #[arg(long)]
    pub pidfile: Option<PathBuf>,

    /// Seconds to wait for a reload to finish (-1 disables).
    #[arg(long, allow_negative_numbers = true)]
    pub reload_timeout: Option<i64>,

    /// Application bridge: echo or static.
    #[arg(long)]
    pub bridge: Option<String>,

    /// Root directory for the static bridge.
    #[arg(long)]
    pub static_directory: Option<PathBuf>,

    /// Command used to start a worker, with {exe}, {slot}, {host},
    /// {socket_dir}, {bridge} and {cwd} placeholders.
    #[arg(long)]
    pub launch_command: Option<String>,

    /// What to do with a connection when every worker is busy.
    #[arg(long, value_enum)]
    pub overflow: Option<OverflowMode>,

    /// Connections held while every worker is busy (overflow=queue).
    #[arg(long)]
    pub queue_capacity: Option<usize>,

    /// Seconds a queued connection may wait.
    #[arg(long)]
    pub queue_timeout: Option<u64>,

    /// How workers deliver their logs: relay or direct.
    #[arg(long, value_enum)]
    pub log_transport: Option<LogTransport>,
}

impl StartArgs {
    /// The flag layer of the configuration.
    pub fn to_overrides(&self) -> FileConfig {
        FileConfig {
            host: self.host.clone(),
            port: self.port,
            workers: self.workers,
            debug: self.debug.then_some(true),
            logging: self.logging,
            max_requests: self.max_requests,
            socket_path: self.socket_path.clone(),
            pidfile: self.pidfile.clone(),
            reload_timeout: self.reload_timeout,
            bridge: self.bridge.clone(),
            static_directory: self.static_directory.clone(),
            launch_command: self.launch_command.clone(),
            overflow: self.overflow,
            queue_capacity: self.queue_capacity,
            queue_timeout: self.queue_timeout,
            log_transport: self.log_transport,
        }
    }

    /// Resolve and validate the full configuration.
    pub fn load(&self) -> Result<PoolConfig> {
        let working_dir = std::path::absolute(&self.working_dir)?;
        PoolConfig::load(&working_dir, self.config.as_deref(), self.to_overrides())
    }
}

/// Locates a running master.
#[derive(Parser, Debug, Default)]
pub struct ControlArgs {
    /// Application directory of the running master.
    #[arg(default_value = ".")]
    pub working_dir: PathBuf,

    /// Config file (default: prefork.json in the working directory).
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Directory holding the control socket.
    #[arg(long)]
    pub socket_path: Option<PathBuf>,
}

impl ControlArgs {
    /// Resolve the configuration the master was most likely started with.
    pub fn load(&self) -> Result<PoolConfig> {
        let working_dir = std::path::absolute(&self.working_dir)?;
        let file = FileConfig::discover(&working_dir, self.config.as_deref())?;
        let flags = FileConfig {
            socket_path: self.socket_path.clone(),
            ..FileConfig::default()
        };
        Ok(PoolConfig::resolve(working_dir, flags.or(file)))
    }
}

/// Arguments for the status command.
#[derive(Parser, Debug)]
pub struct StatusArgs {
    #[command(flatten)]
    pub control: ControlArgs,

    /// Print the raw status reply as JSON.
    #[arg(long)]
    pub json: bool,
}

/// Arguments passed by the master to a worker process.
#[derive(Parser, Debug)]
pub struct WorkerArgs {
    #[arg(long)]
    pub slot: Slot,

    #[arg(long)]
    pub socket_path: PathBuf,

    #[arg(long, default_value = crate::config::DEFAULT_HOST)]
    pub host: String,

    #[arg(long, default_value = crate::config::DEFAULT_BRIDGE)]
    pub bridge: String,

    #[arg(long)]
    pub static_directory: Option<PathBuf>,

    #[arg(long)]
    pub debug: bool,

    #[arg(long, action = ArgAction::Set, default_value_t = true)]
    pub logging: bool,

    #[arg(long, value_enum, default_value_t = LogTransport::Relay)]
    pub log_transport: LogTransport,
}

impl WorkerArgs {
    pub fn options(&self) -> WorkerOptions {
        WorkerOptions {
            slot: self.slot,
            socket_dir: self.socket_path.clone(),
            host: self.host.clone(),
            bridge: self.bridge.clone(),
            static_directory: self.static_directory.clone(),
            debug: self.debug,
            logging: self.logging,
            log_transport: self.log_transport,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verify_cli() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_start_defaults() {
        let args = Cli::try_parse_from(["prefork", "start"]).unwrap();
        match args.command {
            Commands::Start(start) => {
                assert_eq!(start.working_dir, PathBuf::from("."));
                assert_eq!(start.to_overrides(), FileConfig::default());
            }
            _ => panic!("Expected Start command"),
        }
    }

    #[test]
    fn test_start_flags() {
        let args = Cli::try_parse_from([
            "prefork",
            "start",
            "/srv/app",
            "--workers",
            "4",
            "--port",
            "8080",
            "--debug",
            "--logging",
            "false",
            "--reload-timeout",
            "-1",
            "--overflow",
            "queue",
            "--log-transport",
            "direct",
        ])
        .unwrap();

        match args.command {
            Commands::Start(start) => {
                assert_eq!(start.working_dir, PathBuf::from("/srv/app"));
                let overrides = start.to_overrides();
                assert_eq!(overrides.workers, Some(4));
                assert_eq!(overrides.port, Some(8080));
                assert_eq!(overrides.debug, Some(true));
                assert_eq!(overrides.logging, Some(false));
                assert_eq!(overrides.reload_timeout, Some(-1));
                assert_eq!(overrides.overflow, Some(OverflowMode::Queue));
                assert_eq!(overrides.log_transport, Some(LogTransport::Direct));
            }
            _ => panic!("Expected Start command"),
        }
    }

    #[test]
    fn test_flags_override_config_file() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("prefork.json"),
            r#"{"workers": 3, "port": 9000, "bridge": "static"}"#,
        )
        .unwrap();

        let start = StartArgs {
            working_dir: dir.path().to_path_buf(),
            port: Some(9001),
            ..StartArgs::default()
        };
        let config = start.load().unwrap();
        assert_eq!(config.workers, 3);
        assert_eq!(config.port, 9001);
        assert_eq!(config.bridge, "static");
    }

    #[test]
    fn test_control_args_socket_path() {
        let dir = tempfile::tempdir().unwrap();
        let args = ControlArgs {
            working_dir: dir.path().to_path_buf(),
            socket_path: Some(PathBuf::from("sockets")),
            ..ControlArgs::default()
        };
        let config = args.load().unwrap();
        assert_eq!(config.socket_path, dir.path().join("sockets"));
    }

    #[test]
    fn test_status_json() {
        let args = Cli::try_parse_from(["prefork", "status", "--json", "/srv/app"]).unwrap();
        match args.command {
            Commands::Status(status) => {
                assert!(status.json);
                assert_eq!(status.control.working_dir, PathBuf::from("/srv/app"));
            }
            _ => panic!("Expected Status command"),
        }
    }

    #[test]
    fn test_worker_args() {
        let args = Cli::try_parse_from([
            "prefork",
            "worker",
            "--slot",
            "2",
            "--socket-path",
            "/tmp/run",
            "--logging",
            "false",
        ])
        .unwrap();
        match args.command {
            Commands::Worker(worker) => {
                let options = worker.options();
                assert_eq!(options.slot, 2);
                assert_eq!(options.socket_dir, PathBuf::from("/tmp/run"));
                assert_eq!(options.bridge, "echo");
                assert!(!options.logging);
                assert_eq!(options.log_transport, LogTransport::Relay);
            }
            _ => panic!("Expected Worker command"),
        }
    }

    #[test]
    fn test_global_options() {
        let args =
            Cli::try_parse_from(["prefork", "-vv", "--no-color", "--log-format", "json", "stop"])
                .unwrap();
        assert_eq!(args.verbose, 2);
        assert!(args.no_color);
        assert_eq!(args.log_format, Some(LogFormat::Json));
    }

    #[test]
    fn test_quiet_conflicts_with_verbose() {
        let result = Cli::try_parse_from(["prefork", "-v", "-q", "status"]);
        assert!(result.is_err());
    }
}
