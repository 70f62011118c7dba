//! Worker subprocess spawning.
//!
//! By default a worker is this same executable started with the hidden
//! `worker` subcommand. A launch command template can replace it; the
//! template is split on whitespace and these placeholders are substituted in
//! every word: `{exe}`, `{slot}`, `{host}`, `{socket_dir}`, `{bridge}`,
//! `{cwd}`.

use std::path::{Path, PathBuf};
use std::process::Stdio;

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::sync::oneshot;

use super::master::{Event, EventSender};
use super::proc::{WorkerProcess, supervise};
use super::protocol::Slot;
use super::record::RecordId;
use crate::config::LogTransport;
use crate::error::{PoolError, Result};

/// Everything a launcher needs to start the worker for one slot.
#[derive(Debug, Clone)]
pub struct LaunchSpec {
    pub slot: Slot,
    /// Record the process will belong to; echoed back in `ProcessExited`.
    pub record: RecordId,
    pub host: String,
    pub socket_dir: PathBuf,
    pub bridge: String,
    pub static_directory: Option<PathBuf>,
    pub debug: bool,
    pub logging: bool,
    pub log_transport: LogTransport,
}

/// Starts worker processes.
pub trait Launcher {
    /// Start the worker described by `spec`.
    ///
    /// The returned handle owns the process. Its exit must be reported on
    /// `events` as [`Event::ProcessExited`].
    fn launch(&self, spec: &LaunchSpec, events: &EventSender) -> Result<WorkerProcess>;
}

/// Launches workers as real subprocesses.
#[derive(Debug, Clone)]
pub struct CommandLauncher {
    exe: PathBuf,
    cwd: PathBuf,
    template: Option<Vec<String>>,
}

impl CommandLauncher {
    /// Launch the current executable in worker mode.
    pub fn current_exe(cwd: impl Into<PathBuf>) -> Result<Self> {
        let exe = std::env::current_exe().map_err(|e| {
            PoolError::LaunchCommand(format!("Failed to get current executable: {}", e))
        })?;
        Ok(Self {
            exe,
            cwd: cwd.into(),
            template: None,
        })
    }

    /// Launch workers from a command template. The program must resolve.
    pub fn with_template(mut self, template: &str) -> Result<Self> {
        let words = parse_template(template)?;
        let program = expand(&words[0], &self.placeholders_for_validation());
        resolve_program(&program)?;
        self.template = Some(words);
        Ok(self)
    }

    fn placeholders_for_validation(&self) -> Vec<(&'static str, String)> {
        vec![
            ("{exe}", self.exe.display().to_string()),
            ("{cwd}", self.cwd.display().to_string()),
        ]
    }

    /// Build the argv for `spec`.
    pub fn argv(&self, spec: &LaunchSpec) -> Vec<String> {
        match &self.template {
            Some(words) => {
                let values = [
                    ("{exe}", self.exe.display().to_string()),
                    ("{slot}", spec.slot.to_string()),
                    ("{host}", spec.host.clone()),
                    ("{socket_dir}", spec.socket_dir.display().to_string()),
                    ("{bridge}", spec.bridge.clone()),
                    ("{cwd}", self.cwd.display().to_string()),
                ];
                words.iter().map(|w| expand(w, &values)).collect()
            }
            None => {
                let mut argv = vec![
                    self.exe.display().to_string(),
                    "worker".to_string(),
                    "--slot".to_string(),
                    spec.slot.to_string(),
                    "--socket-path".to_string(),
                    spec.socket_dir.display().to_string(),
                    "--host".to_string(),
                    spec.host.clone(),
                    "--bridge".to_string(),
                    spec.bridge.clone(),
                    "--logging".to_string(),
                    spec.logging.to_string(),
                    "--log-transport".to_string(),
                    spec.log_transport.to_string(),
                ];
                if let Some(dir) = &spec.static_directory {
                    argv.push("--static-directory".to_string());
                    argv.push(dir.display().to_string());
                }
                if spec.debug {
                    argv.push("--debug".to_string());
                }
                argv
            }
        }
    }
}

impl Launcher for CommandLauncher {
    fn launch(&self, spec: &LaunchSpec, events: &EventSender) -> Result<WorkerProcess> {
        let argv = self.argv(spec);
        let (program, args) = argv
            .split_first()
            .ok_or_else(|| PoolError::LaunchCommand("empty command".to_string()))?;

        let mut cmd = Command::new(program);
        cmd.args(args)
            .current_dir(&self.cwd)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            // Keep terminal Ctrl-C away from workers; the master stops them.
            .process_group(0)
            .kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|source| PoolError::Spawn {
            slot: spec.slot,
            source,
        })?;
        let pid = child.id();
        let slot = spec.slot;

        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(relay_output(slot, stdout, OutputStream::Stdout));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(relay_output(slot, stderr, OutputStream::Stderr));
        }

        let (terminate_tx, terminate_rx) = oneshot::channel();
        let events = events.clone();
        let record = spec.record;
        let supervisor = tokio::spawn(async move {
            let reason = supervise(child, terminate_rx).await;
            let _ = events.send(Event::ProcessExited {
                slot,
                record,
                reason,
            });
        });

        tracing::debug!(slot, pid, "Spawned worker process");
        Ok(WorkerProcess::new(pid, terminate_tx, Some(supervisor)))
    }
}

#[derive(Debug, Clone, Copy)]
enum OutputStream {
    Stdout,
    Stderr,
}

/// Forward a worker's output stream to the operator log, line by line.
async fn relay_output<R: AsyncRead + Unpin>(slot: Slot, stream: R, kind: OutputStream) {
    let mut lines = BufReader::new(stream).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) if line.trim().is_empty() => {}
            Ok(Some(line)) => match kind {
                OutputStream::Stdout => tracing::debug!(slot, "{}", line),
                OutputStream::Stderr => tracing::info!(slot, "{}", line),
            },
            Ok(None) => break,
            Err(e) => {
                tracing::debug!(slot, error = %e, "Worker output relay stopped");
                break;
            }
        }
    }
}

fn parse_template(template: &str) -> Result<Vec<String>> {
    let words: Vec<String> = template.split_whitespace().map(str::to_string).collect();
    if words.is_empty() {
        return Err(PoolError::LaunchCommand("empty command".to_string()));
    }
    Ok(words)
}

fn expand(word: &str, values: &[(&'static str, String)]) -> String {
    values
        .iter()
        .fold(word.to_string(), |acc, (key, value)| acc.replace(key, value))
}

/// Find `program` the way the OS would: as a path if it has a separator,
/// otherwise on `PATH`.
pub fn resolve_program(program: &str) -> Result<PathBuf> {
    if program.contains('/') {
        let path = Path::new(program);
        if path.is_file() {
            return Ok(path.to_path_buf());
        }
        return Err(PoolError::LaunchCommand(format!(
            "'{}' does not exist",
            program
        )));
    }

    let path_var = std::env::var_os("PATH").unwrap_or_default();
    std::env::split_paths(&path_var)
        .map(|dir| dir.join(program))
        .find(|candidate| candidate.is_file())
        .ok_or_else(|| PoolError::LaunchCommand(format!("'{}' not found on PATH", program)))
}
