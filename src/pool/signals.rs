//! Crash analysis for worker subprocesses.
//!
//! Classifies how a worker process ended so the operator log says more than
//! "it went away".

use std::os::unix::process::ExitStatusExt;
use std::process::ExitStatus;

use nix::sys::signal::Signal;

/// Reason why a worker process terminated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TerminationReason {
    /// Normal exit with status code.
    Exited(i32),
    /// SIGKILL, from us after a missed grace period or from the OOM killer.
    Killed,
    /// SIGTERM, the usual result of a graceful close.
    Terminated,
    /// Segmentation fault or bus error.
    Crashed(Signal),
    /// Killed by some other signal.
    Signaled(Signal),
    /// The wait itself failed; nothing is known about the exit.
    Unknown(String),
}

impl TerminationReason {
    /// Whether the process ended as a result of being told to.
    pub fn is_requested(&self) -> bool {
        matches!(self, Self::Exited(0) | Self::Terminated | Self::Killed)
    }

    /// Get a human-readable description.
    pub fn description(&self) -> String {
        match self {
            Self::Exited(code) => format!("exited with code {}", code),
            Self::Killed => "killed (SIGKILL)".to_string(),
            Self::Terminated => "terminated (SIGTERM)".to_string(),
            Self::Crashed(sig) => format!("crashed ({:?})", sig),
            Self::Signaled(sig) => format!("killed by signal {:?}", sig),
            Self::Unknown(reason) => format!("unknown ({})", reason),
        }
    }
}

impl std::fmt::Display for TerminationReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.description())
    }
}

/// Analyze an `ExitStatus` to determine the termination reason.
pub fn analyze_exit_status(status: ExitStatus) -> TerminationReason {
    if let Some(code) = status.code() {
        return TerminationReason::Exited(code);
    }

    match status.signal().map(Signal::try_from) {
        Some(Ok(Signal::SIGKILL)) => TerminationReason::Killed,
        Some(Ok(Signal::SIGTERM)) => TerminationReason::Terminated,
        Some(Ok(sig @ (Signal::SIGSEGV | Signal::SIGBUS))) => TerminationReason::Crashed(sig),
        Some(Ok(sig)) => TerminationReason::Signaled(sig),
        Some(Err(_)) | None => TerminationReason::Unknown(format!("{}", status)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_codes() {
        // Raw wait status: exit code lives in the high byte.
        let status = ExitStatus::from_raw(0);
        assert_eq!(analyze_exit_status(status), TerminationReason::Exited(0));

        let status = ExitStatus::from_raw(3 << 8);
        assert_eq!(analyze_exit_status(status), TerminationReason::Exited(3));
    }

    #[test]
    fn test_signals() {
        let status = ExitStatus::from_raw(Signal::SIGKILL as i32);
        assert_eq!(analyze_exit_status(status), TerminationReason::Killed);

        let status = ExitStatus::from_raw(Signal::SIGTERM as i32);
        assert_eq!(analyze_exit_status(status), TerminationReason::Terminated);

        let status = ExitStatus::from_raw(Signal::SIGSEGV as i32);
        assert_eq!(
            analyze_exit_status(status),
            TerminationReason::Crashed(Signal::SIGSEGV)
        );

        let status = ExitStatus::from_raw(Signal::SIGABRT as i32);
        assert_eq!(
            analyze_exit_status(status),
            TerminationReason::Signaled(Signal::SIGABRT)
        );
    }

    #[test]
    fn test_requested_vs_unexpected() {
        assert!(TerminationReason::Exited(0).is_requested());
        assert!(TerminationReason::Terminated.is_requested());
        assert!(TerminationReason::Killed.is_requested());
        assert!(!TerminationReason::Exited(255).is_requested());
        assert!(!TerminationReason::Crashed(Signal::SIGSEGV).is_requested());
    }

    #[test]
    fn test_display() {
        assert_eq!(TerminationReason::Exited(1).to_string(), "exited with code 1");
        assert!(TerminationReason::Crashed(Signal::SIGBUS)
            .to_string()
            .contains("SIGBUS"));
    }
}
