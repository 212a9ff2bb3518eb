//! Worker exit status and stop outcome

use std::fmt;
use std::os::unix::process::ExitStatusExt;
use std::process::ExitStatus;
use std::time::Duration;

use nix::sys::signal::Signal;

/// How the worker process ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerExit {
    /// Exited normally with code
    Exited(i32),
    /// Killed by signal
    Signaled(Signal),
    /// Not known (never started, or the platform could not report it)
    Unknown,
}

impl WorkerExit {
    /// Exit code a wrapping process should use, shell style
    pub fn code(&self) -> Option<i32> {
        match self {
            WorkerExit::Exited(code) => Some(*code),
            WorkerExit::Signaled(signal) => Some(128 + *signal as i32),
            WorkerExit::Unknown => None,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, WorkerExit::Exited(0))
    }
}

impl From<ExitStatus> for WorkerExit {
    fn from(status: ExitStatus) -> Self {
        if let Some(code) = status.code() {
            return WorkerExit::Exited(code);
        }
        match status.signal().map(Signal::try_from) {
            Some(Ok(signal)) => WorkerExit::Signaled(signal),
            _ => WorkerExit::Unknown,
        }
    }
}

impl fmt::Display for WorkerExit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WorkerExit::Exited(code) => write!(f, "exited with code {}", code),
            WorkerExit::Signaled(signal) => write!(f, "killed by {}", signal),
            WorkerExit::Unknown => write!(f, "N/A"),
        }
    }
}

/// Outcome of `Daemon::stop`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StopReport {
    pub exit: WorkerExit,
    /// The grace period ran out and SIGKILL was sent
    pub forced: bool,
    /// Time spent between the termination request and the worker's exit
    pub waited: Duration,
}

impl StopReport {
    pub(crate) fn not_started() -> Self {
        Self {
            exit: WorkerExit::Unknown,
            forced: false,
            waited: Duration::ZERO,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_exit_status() {
        assert_eq!(WorkerExit::from(ExitStatus::from_raw(0)), WorkerExit::Exited(0));
        assert_eq!(WorkerExit::from(ExitStatus::from_raw(3 << 8)), WorkerExit::Exited(3));
        assert_eq!(
            WorkerExit::from(ExitStatus::from_raw(libc::SIGKILL)),
            WorkerExit::Signaled(Signal::SIGKILL)
        );
    }

    #[test]
    fn test_code() {
        assert_eq!(WorkerExit::Exited(2).code(), Some(2));
        assert_eq!(WorkerExit::Signaled(Signal::SIGKILL).code(), Some(137));
        assert_eq!(WorkerExit::Unknown.code(), None);
        assert!(WorkerExit::Exited(0).is_success());
        assert!(!WorkerExit::Signaled(Signal::SIGTERM).is_success());
    }

    #[test]
    fn test_display() {
        assert_eq!(WorkerExit::Exited(0).to_string(), "exited with code 0");
        assert_eq!(WorkerExit::Signaled(Signal::SIGKILL).to_string(), "killed by SIGKILL");
        assert_eq!(WorkerExit::Unknown.to_string(), "N/A");
    }
}
