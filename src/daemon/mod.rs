//! Daemon controller
//!
//! Owns one worker process running the listener loop:
//! 1. `start`: bind, spawn the worker with the socket, probe readiness
//! 2. `stop`: SIGTERM, wait in one-second ticks, SIGKILL once the kill
//!    timeout has elapsed
//!
//! A `Daemon` runs its worker at most once. Construct a new one to run again.

mod probe;
mod process;
mod status;

pub use probe::{probe_target, ProbeConfig, Readiness};
pub use status::{StopReport, WorkerExit};

use std::ffi::OsString;
use std::io;
use std::net::{SocketAddr, TcpListener};
use std::path::PathBuf;
use std::process::ExitStatus;
use std::time::{Duration, Instant};

use nix::errno::Errno;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use tokio::process::Child;

use crate::config::ServeMode;

/// Grace period between SIGTERM and SIGKILL unless configured otherwise
pub const DEFAULT_KILL_TIMEOUT: Duration = Duration::from_secs(10);

/// Liveness is re-checked (and progress logged) at this interval while stopping
const STOP_TICK: Duration = Duration::from_secs(1);

/// Controller configuration
#[derive(Debug, Clone)]
pub struct DaemonConfig {
    /// Executable providing the `serve` subcommand
    pub program: PathBuf,
    pub address: String,
    pub port: u16,
    pub kill_timeout: Duration,
    /// Readiness probe run by `start`, if any
    pub probe: Option<ProbeConfig>,
    pub mode: ServeMode,
    /// Document root passed to the worker
    pub root: Option<PathBuf>,
    /// Extra arguments appended to the worker command line
    pub worker_args: Vec<OsString>,
}

impl DaemonConfig {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            address: "0.0.0.0".to_string(),
            port: 8000,
            kill_timeout: DEFAULT_KILL_TIMEOUT,
            probe: Some(ProbeConfig::default()),
            mode: ServeMode::from_env(),
            root: None,
            worker_args: Vec::new(),
        }
    }

    /// Use the running executable as the worker program
    pub fn current_exe() -> io::Result<Self> {
        Ok(Self::new(std::env::current_exe()?))
    }

    fn bind_address(&self) -> String {
        if self.address.contains(':') && !self.address.starts_with('[') {
            format!("[{}]:{}", self.address, self.port)
        } else {
            format!("{}:{}", self.address, self.port)
        }
    }
}

/// Returned by a successful `start`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Started {
    pub pid: u32,
    pub addr: SocketAddr,
    pub readiness: Readiness,
}

#[derive(Debug)]
struct Worker {
    child: Child,
    pid: u32,
    addr: SocketAddr,
}

#[derive(Debug)]
enum WorkerState {
    Idle,
    Running(Worker),
    Stopped(StopReport),
}

/// Controller for a single worker process
#[derive(Debug)]
pub struct Daemon {
    config: DaemonConfig,
    state: WorkerState,
}

impl Daemon {
    pub fn new(config: DaemonConfig) -> Self {
        Self {
            config,
            state: WorkerState::Idle,
        }
    }

    pub fn config(&self) -> &DaemonConfig {
        &self.config
    }

    /// Start the worker
    ///
    /// A bind failure or a worker that dies during the probe is permanent
    /// (see [`LaunchError::is_permanent`]); a probe that merely runs out of
    /// attempts is reported as [`Readiness::NotReady`].
    pub async fn start(&mut self) -> Result<Started, LaunchError> {
        match self.state {
            WorkerState::Idle => {}
            WorkerState::Running(_) => return Err(LaunchError::AlreadyRunning),
            WorkerState::Stopped(_) => return Err(LaunchError::Spent),
        }

        let bind_addr = self.config.bind_address();
        let listener = TcpListener::bind(&bind_addr).map_err(|source| LaunchError::Bind {
            addr: bind_addr.clone(),
            source,
        })?;
        let addr = listener.local_addr().map_err(|source| LaunchError::Bind {
            addr: bind_addr.clone(),
            source,
        })?;

        let mut child =
            process::spawn_worker(&self.config, &listener).map_err(LaunchError::Spawn)?;
        // The worker holds its own copy now
        drop(listener);

        let pid = child.id().ok_or_else(|| {
            LaunchError::Spawn(io::Error::other("worker exited before reporting its pid"))
        })?;
        log::info!("Server started (pid: {}) on {}", pid, addr);

        let readiness = match self.config.probe {
            Some(probe) => match probe::wait_ready(addr, &probe, &mut child).await {
                Ok(readiness) => readiness,
                Err(e) => {
                    let exit = reap_failed_start(&mut child).await;
                    self.state = WorkerState::Stopped(StopReport {
                        exit,
                        forced: false,
                        waited: Duration::ZERO,
                    });
                    return Err(e);
                }
            },
            None => Readiness::Unchecked,
        };

        self.state = WorkerState::Running(Worker { child, pid, addr });

        Ok(Started {
            pid,
            addr,
            readiness,
        })
    }

    /// Whether the worker is running
    ///
    /// Observing an exit records it, so a later `stop` sends nothing.
    pub fn is_alive(&mut self) -> bool {
        let WorkerState::Running(worker) = &mut self.state else {
            return false;
        };

        let Some(exit) = observed_exit(worker.pid, worker.child.try_wait()) else {
            return true;
        };

        log::info!("Server exited on its own ({})", exit);
        self.state = WorkerState::Stopped(StopReport {
            exit,
            forced: false,
            waited: Duration::ZERO,
        });
        false
    }

    /// Worker pid while running
    pub fn pid(&self) -> Option<u32> {
        match &self.state {
            WorkerState::Running(worker) => Some(worker.pid),
            _ => None,
        }
    }

    /// Bound address while running
    pub fn addr(&self) -> Option<SocketAddr> {
        match &self.state {
            WorkerState::Running(worker) => Some(worker.addr),
            _ => None,
        }
    }

    /// Send `signal` to the running worker
    pub fn signal(&self, signal: Signal) -> nix::Result<()> {
        let pid = self.pid().ok_or(Errno::ESRCH)?;
        log::debug!("Sending {} to worker {}", signal, pid);
        kill(Pid::from_raw(pid as i32), signal)
    }

    /// Stop with the configured kill timeout
    pub async fn stop(&mut self) -> StopReport {
        self.stop_with_timeout(self.config.kill_timeout).await
    }

    /// Stop the worker, forcing it after `timeout`
    ///
    /// Returns immediately, without signalling, if the worker is not alive.
    /// Calling again returns the same report.
    pub async fn stop_with_timeout(&mut self, timeout: Duration) -> StopReport {
        if !self.is_alive() {
            return match &self.state {
                WorkerState::Stopped(report) => *report,
                _ => StopReport::not_started(),
            };
        }

        let WorkerState::Running(mut worker) =
            std::mem::replace(&mut self.state, WorkerState::Idle)
        else {
            return StopReport::not_started();
        };

        let report = terminate(&mut worker, timeout).await;
        log::info!("Server exited with code: {}", report.exit);

        self.state = WorkerState::Stopped(report);
        report
    }
}

impl Drop for Daemon {
    fn drop(&mut self) {
        if let WorkerState::Running(worker) = &mut self.state {
            log::debug!("Controller dropped, killing worker {}", worker.pid);
            let _ = worker.child.start_kill();
        }
    }
}

/// SIGTERM, then tick until exit, escalating to SIGKILL at `timeout`
async fn terminate(worker: &mut Worker, timeout: Duration) -> StopReport {
    let started = Instant::now();

    match kill(Pid::from_raw(worker.pid as i32), Signal::SIGTERM) {
        Ok(()) | Err(Errno::ESRCH) => {}
        Err(e) => log::warn!("Failed to send SIGTERM to {}: {}", worker.pid, e),
    }

    let mut ticks: u32 = 0;
    let mut forced = false;

    let exit = loop {
        let elapsed = STOP_TICK * ticks;
        if ticks == 0 {
            log::info!("waiting for graceful shutdown ...");
        } else if !forced && elapsed >= timeout {
            log::error!("timeout exceeded, killing process!");
            forced = true;
            if let Err(e) = worker.child.start_kill() {
                log::warn!("Failed to kill {}: {}", worker.pid, e);
            }
        } else if !forced {
            log::debug!("... {} seconds left", (timeout - elapsed).as_secs());
        }

        match tokio::time::timeout(STOP_TICK, worker.child.wait()).await {
            Ok(Ok(status)) => break WorkerExit::from(status),
            Ok(Err(e)) => {
                log::warn!("Failed to wait for {}: {}", worker.pid, e);
                break WorkerExit::Unknown;
            }
            Err(_) if forced => {
                log::error!("Worker {} survived SIGKILL for {:?}", worker.pid, STOP_TICK);
                break WorkerExit::Unknown;
            }
            Err(_) => ticks += 1,
        }
    };

    StopReport {
        exit,
        forced,
        waited: started.elapsed(),
    }
}

/// Exit seen by a non-blocking wait, if any
///
/// A failed query counts as still running so `stop` keeps signalling.
fn observed_exit(pid: u32, status: io::Result<Option<ExitStatus>>) -> Option<WorkerExit> {
    match status {
        Ok(status) => status.map(WorkerExit::from),
        Err(e) => {
            log::warn!("Cannot query worker {}, assuming it is alive: {}", pid, e);
            None
        }
    }
}

async fn reap_failed_start(child: &mut Child) -> WorkerExit {
    if let Ok(Some(status)) = child.try_wait() {
        return WorkerExit::from(status);
    }
    let _ = child.start_kill();
    match child.wait().await {
        Ok(status) => WorkerExit::from(status),
        Err(_) => WorkerExit::Unknown,
    }
}

#[derive(Debug, thiserror::Error)]
pub enum LaunchError {
    #[error("Failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: io::Error,
    },

    #[error("Failed to spawn worker: {0}")]
    Spawn(#[source] io::Error),

    #[error("Worker exited during startup ({exit})")]
    WorkerExited { exit: WorkerExit },

    #[error("Readiness probe failed: {0}")]
    Probe(String),

    #[error("Worker already running")]
    AlreadyRunning,

    #[error("Worker already ran; create a new Daemon to start again")]
    Spent,
}

impl LaunchError {
    /// Whether retrying the same `start` is pointless
    pub fn is_permanent(&self) -> bool {
        !matches!(self, LaunchError::Spawn(_) | LaunchError::Probe(_))
    }
}
