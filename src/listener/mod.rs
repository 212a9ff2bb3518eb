//! Signal-safe I/O multiplexing loop
//!
//! Waits on two readiness sources with `poll(2)`:
//! - the read end of a [`SignalBridge`], created per invocation
//! - the readiness fd of a [`Service`] (normally a listening socket)
//!
//! Each listener wake-up services exactly one unit of work; `poll` reports
//! the fd again if more connections are pending. Signal tokens drive the
//! [`ShutdownState`] machine.

mod state;

pub use state::{LoopState, ShutdownState, SignalAction};

use std::os::fd::BorrowedFd;
use std::time::Duration;

use nix::errno::Errno;
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use nix::sys::signal::Signal;

use crate::error::{HandlerError, ResourceError};
use crate::signals::{SignalBridge, SignalToken, DEFAULT_SIGNALS};

/// Something the loop can hand one unit of work to
pub trait Service {
    /// Fd that polls readable when a unit of work is pending
    fn readiness_fd(&self) -> BorrowedFd<'_>;

    /// Perform exactly one accept-and-respond cycle
    fn service_one(&mut self) -> Result<(), HandlerError>;

    /// Periodic housekeeping, called when a poll timeout elapses
    fn idle(&mut self) {}

    /// Release the service's resources
    fn close(self) -> Result<(), ResourceError>
    where
        Self: Sized,
    {
        Ok(())
    }
}

/// Listener loop configuration
#[derive(Debug, Clone)]
pub struct LoopConfig {
    /// Signals routed through the bridge
    pub signals: Vec<Signal>,
    /// Wake up for `Service::idle` at least this often (no effect on shutdown)
    pub poll_timeout: Option<Duration>,
}

impl Default for LoopConfig {
    fn default() -> Self {
        Self {
            signals: DEFAULT_SIGNALS.to_vec(),
            poll_timeout: None,
        }
    }
}

/// Counters collected over one loop invocation
#[derive(Debug, Clone, Default)]
pub struct LoopReport {
    /// Polls that returned with at least one ready source
    pub wakeups: u64,
    /// Units of work serviced successfully
    pub serviced: u64,
    /// Units of work that failed
    pub failures: u64,
    /// Poll timeouts
    pub idle_ticks: u64,
    /// Last token read from the bridge
    pub last_signal: Option<SignalToken>,
}

/// Pause after a failed unit of work on a listener reporting `POLLERR`
const FAULT_BACKOFF: Duration = Duration::from_millis(100);

enum Wake {
    Idle,
    Interrupted,
    Ready { signal: FdState, listener: FdState },
}

/// What `poll` reported for one descriptor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FdState {
    Quiet,
    Readable,
    /// Error condition pending; reported on every poll until cleared
    Faulted,
}

impl FdState {
    fn is_set(self) -> bool {
        self != FdState::Quiet
    }
}

/// Single-threaded multiplexer over the signal bridge and a service
#[derive(Debug, Clone, Default)]
pub struct ListenerLoop {
    config: LoopConfig,
}

impl ListenerLoop {
    pub fn new(config: LoopConfig) -> Self {
        Self { config }
    }

    /// Serve until shutdown is requested by signal, then tear down
    ///
    /// The bridge is closed and `service` released exactly once, whichever
    /// way the loop ends.
    pub fn run<S: Service>(&self, mut service: S) -> Result<LoopReport, ResourceError> {
        let mut bridge = match SignalBridge::create(&self.config.signals) {
            Ok(bridge) => bridge,
            Err(e) => {
                if let Err(close_err) = service.close() {
                    log::warn!("Failed to release service: {}", close_err);
                }
                return Err(e);
            }
        };

        let mut report = LoopReport::default();

        log::debug!("Entering I/O multiplexing loop");
        let outcome = self.multiplex(&mut bridge, &mut service, &mut report);
        log::debug!("Returning from listener loop");

        let closed = bridge.close();
        let released = service.close();

        outcome.and(closed).and(released)?;
        Ok(report)
    }

    fn multiplex<S: Service>(
        &self,
        bridge: &mut SignalBridge,
        service: &mut S,
        report: &mut LoopReport,
    ) -> Result<(), ResourceError> {
        let mut shutdown = ShutdownState::new();
        let timeout = poll_timeout(self.config.poll_timeout);

        loop {
            match wait(bridge, service, timeout)? {
                Wake::Idle => {
                    report.idle_ticks += 1;
                    service.idle();
                }
                // The handler already queued its token
                Wake::Interrupted => {}
                Wake::Ready { signal, listener } => {
                    report.wakeups += 1;

                    if signal.is_set() {
                        if let Some(token) = bridge.read_token()? {
                            report.last_signal = Some(token);
                            if handle_token(&mut shutdown, token) == SignalAction::Shutdown {
                                return Ok(());
                            }
                        }
                    }

                    if listener.is_set() {
                        log::debug!("Request received, passing to handler");
                        match service.service_one() {
                            Ok(()) => report.serviced += 1,
                            Err(e) => {
                                report.failures += 1;
                                log::warn!("Request handling failed: {}", e);
                                if listener == FdState::Faulted {
                                    log::warn!(
                                        "Listener reports an error condition, backing off {:?}",
                                        FAULT_BACKOFF
                                    );
                                    std::thread::sleep(FAULT_BACKOFF);
                                }
                            }
                        }
                    }
                }
            }
        }
    }
}

fn handle_token(shutdown: &mut ShutdownState, token: SignalToken) -> SignalAction {
    log::debug!("Signal {} received", token.name());
    let action = shutdown.on_signal(token);
    match action {
        SignalAction::Warn => {
            log::warn!("Send SIGTERM or press Ctrl-C again for graceful shutdown.");
        }
        SignalAction::Continue => {
            log::debug!("Ignoring {}", token.name());
        }
        SignalAction::Shutdown => {
            log::info!("{} received, shutting down listener", token.name());
        }
    }
    action
}

fn wait<S: Service>(
    bridge: &SignalBridge,
    service: &S,
    timeout: PollTimeout,
) -> Result<Wake, ResourceError> {
    let mut fds = [
        PollFd::new(bridge.read_fd()?, PollFlags::POLLIN),
        PollFd::new(service.readiness_fd(), PollFlags::POLLIN),
    ];

    match poll(&mut fds, timeout) {
        Ok(0) => Ok(Wake::Idle),
        Ok(_) => Ok(Wake::Ready {
            signal: fd_state(fds[0].revents().unwrap_or(PollFlags::empty()))?,
            listener: fd_state(fds[1].revents().unwrap_or(PollFlags::empty()))?,
        }),
        Err(Errno::EINTR) => Ok(Wake::Interrupted),
        Err(e) => Err(ResourceError::Poll(e)),
    }
}

fn fd_state(events: PollFlags) -> Result<FdState, ResourceError> {
    if events.contains(PollFlags::POLLNVAL) {
        return Err(ResourceError::Poll(Errno::EBADF));
    }
    if events.contains(PollFlags::POLLERR) {
        Ok(FdState::Faulted)
    } else if events.intersects(PollFlags::POLLIN | PollFlags::POLLHUP) {
        Ok(FdState::Readable)
    } else {
        Ok(FdState::Quiet)
    }
}

/// Milliseconds rounded up, so a short timeout never becomes a busy spin
fn poll_timeout(timeout: Option<Duration>) -> PollTimeout {
    match timeout {
        Some(d) => {
            let millis = d.as_nanos().div_ceil(1_000_000).clamp(1, u128::from(u16::MAX));
            PollTimeout::from(millis as u16)
        }
        None => PollTimeout::NONE,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::SIGNAL_LOCK;
    use nix::sys::signal::raise;
    use std::net::{TcpListener, TcpStream};
    use std::os::fd::AsFd;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    use crate::config::ServeMode;
    use crate::http::{HttpConfig, HttpService};

    /// Accepts one connection per call and raises signals on a schedule
    struct ScriptedService {
        listener: TcpListener,
        calls: usize,
        idle_calls: usize,
        /// Signal to raise after the n-th call (1-based)
        on_call: Vec<(usize, Signal)>,
        /// Signal to raise after the n-th idle tick (1-based)
        on_idle: Vec<(usize, Signal)>,
        fail_calls: Vec<usize>,
        closed: Arc<AtomicBool>,
    }

    impl ScriptedService {
        fn bind() -> Self {
            let listener = TcpListener::bind("127.0.0.1:0").unwrap();
            listener.set_nonblocking(true).unwrap();
            Self {
                listener,
                calls: 0,
                idle_calls: 0,
                on_call: Vec::new(),
                on_idle: Vec::new(),
                fail_calls: Vec::new(),
                closed: Arc::new(AtomicBool::new(false)),
            }
        }

        fn connect_clients(&self, n: usize) -> Vec<TcpStream> {
            let addr = self.listener.local_addr().unwrap();
            (0..n).map(|_| TcpStream::connect(addr).unwrap()).collect()
        }
    }

    fn fire(schedule: &[(usize, Signal)], n: usize) {
        for (at, signal) in schedule {
            if *at == n {
                raise(*signal).unwrap();
            }
        }
    }

    impl Service for ScriptedService {
        fn readiness_fd(&self) -> BorrowedFd<'_> {
            self.listener.as_fd()
        }

        fn service_one(&mut self) -> Result<(), HandlerError> {
            self.calls += 1;
            let accepted = self.listener.accept();
            fire(&self.on_call, self.calls);
            match accepted {
                Ok(_) if self.fail_calls.contains(&self.calls) => {
                    Err(HandlerError::Other("scripted failure".to_string()))
                }
                Ok(_) => Ok(()),
                Err(e) => Err(HandlerError::Accept(e)),
            }
        }

        fn idle(&mut self) {
            self.idle_calls += 1;
            fire(&self.on_idle, self.idle_calls);
        }

        fn close(self) -> Result<(), ResourceError> {
            self.closed.store(true, Ordering::SeqCst);
            Ok(())
        }
    }

    #[test]
    fn test_single_dispatch_per_readiness() {
        let _lock = SIGNAL_LOCK.lock().unwrap_or_else(|e| e.into_inner());

        let mut service = ScriptedService::bind();
        service.on_call = vec![(5, Signal::SIGTERM)];
        let closed = Arc::clone(&service.closed);
        let _clients = service.connect_clients(5);

        let report = ListenerLoop::default().run(service).unwrap();

        assert_eq!(report.serviced, 5);
        assert_eq!(report.failures, 0);
        // Five listener wake-ups plus the one that carried SIGTERM
        assert!(report.wakeups >= 6, "wakeups = {}", report.wakeups);
        assert_eq!(report.last_signal, Some(SignalToken::Terminate));
        assert!(closed.load(Ordering::SeqCst));
    }

    #[test]
    fn test_handler_failure_does_not_stop_loop() {
        let _lock = SIGNAL_LOCK.lock().unwrap_or_else(|e| e.into_inner());

        let mut service = ScriptedService::bind();
        service.fail_calls = vec![1];
        service.on_call = vec![(2, Signal::SIGTERM)];
        let _clients = service.connect_clients(2);

        let report = ListenerLoop::default().run(service).unwrap();

        assert_eq!(report.failures, 1);
        assert_eq!(report.serviced, 1);
    }

    #[test]
    fn test_first_interrupt_keeps_serving() {
        let _lock = SIGNAL_LOCK.lock().unwrap_or_else(|e| e.into_inner());

        let mut service = ScriptedService::bind();
        service.on_call = vec![(1, Signal::SIGINT), (2, Signal::SIGTERM)];
        let _clients = service.connect_clients(2);

        let report = ListenerLoop::default().run(service).unwrap();

        assert_eq!(report.serviced, 2);
        assert_eq!(report.last_signal, Some(SignalToken::Terminate));
    }

    #[test]
    fn test_two_interrupts_stop_loop() {
        let _lock = SIGNAL_LOCK.lock().unwrap_or_else(|e| e.into_inner());

        let mut service = ScriptedService::bind();
        service.on_idle = vec![(1, Signal::SIGINT), (3, Signal::SIGINT)];
        let config = LoopConfig {
            poll_timeout: Some(Duration::from_millis(10)),
            ..LoopConfig::default()
        };

        let report = ListenerLoop::new(config).run(service).unwrap();

        assert!(report.idle_ticks >= 3);
        assert_eq!(report.serviced, 0);
        assert_eq!(report.last_signal, Some(SignalToken::Interrupt));
    }

    #[test]
    fn test_unrouted_signals_are_ignored() {
        let _lock = SIGNAL_LOCK.lock().unwrap_or_else(|e| e.into_inner());

        let mut service = ScriptedService::bind();
        service.on_idle = vec![(1, Signal::SIGUSR1), (2, Signal::SIGTERM)];
        let config = LoopConfig {
            signals: vec![Signal::SIGINT, Signal::SIGTERM, Signal::SIGUSR1],
            poll_timeout: Some(Duration::from_millis(10)),
        };

        let report = ListenerLoop::new(config).run(service).unwrap();

        assert!(report.idle_ticks >= 2);
        assert_eq!(report.last_signal, Some(SignalToken::Terminate));
    }

    #[test]
    fn test_service_released_when_bridge_unavailable() {
        let _lock = SIGNAL_LOCK.lock().unwrap_or_else(|e| e.into_inner());

        let _held = SignalBridge::create(&[Signal::SIGUSR2]).unwrap();
        let service = ScriptedService::bind();
        let closed = Arc::clone(&service.closed);

        let result = ListenerLoop::default().run(service);

        assert!(matches!(result, Err(ResourceError::BridgeInUse)));
        assert!(closed.load(Ordering::SeqCst));
    }

    /// HTTP service that asks for termination as soon as it goes idle
    struct TerminateWhenIdle(HttpService);

    impl Service for TerminateWhenIdle {
        fn readiness_fd(&self) -> BorrowedFd<'_> {
            self.0.readiness_fd()
        }

        fn service_one(&mut self) -> Result<(), HandlerError> {
            self.0.service_one()
        }

        fn idle(&mut self) {
            raise(Signal::SIGTERM).unwrap();
        }

        fn close(self) -> Result<(), ResourceError> {
            self.0.close()
        }
    }

    fn open_fds() -> usize {
        std::fs::read_dir("/proc/self/fd").unwrap().count()
    }

    #[test]
    fn test_repeated_runs_release_descriptors() {
        let _lock = SIGNAL_LOCK.lock().unwrap_or_else(|e| e.into_inner());

        let config = LoopConfig {
            poll_timeout: Some(Duration::from_millis(1)),
            ..LoopConfig::default()
        };
        let http = HttpConfig {
            mode: ServeMode::Single,
            ..HttpConfig::default()
        };
        let run_once = || {
            let service = HttpService::bind("127.0.0.1:0", http.clone()).unwrap();
            let report = ListenerLoop::new(config.clone())
                .run(TerminateWhenIdle(service))
                .unwrap();
            assert_eq!(report.last_signal, Some(SignalToken::Terminate));
        };

        run_once();
        let baseline = open_fds();

        for _ in 0..100 {
            run_once();
        }
        let after = open_fds();

        // Each leaked run would hold at least the bridge pair and a listener;
        // the slack absorbs sockets of tests running on other threads
        assert!(
            after <= baseline + 16,
            "descriptors grew from {} to {}",
            baseline,
            after
        );
    }

    #[test]
    fn test_fd_state() {
        assert_eq!(fd_state(PollFlags::empty()).unwrap(), FdState::Quiet);
        assert_eq!(fd_state(PollFlags::POLLIN).unwrap(), FdState::Readable);
        assert_eq!(fd_state(PollFlags::POLLHUP).unwrap(), FdState::Readable);
        assert_eq!(
            fd_state(PollFlags::POLLIN | PollFlags::POLLERR).unwrap(),
            FdState::Faulted
        );
        assert!(matches!(
            fd_state(PollFlags::POLLNVAL),
            Err(ResourceError::Poll(Errno::EBADF))
        ));
    }

    #[test]
    fn test_poll_timeout_rounds_up() {
        assert_eq!(poll_timeout(None), PollTimeout::NONE);
        assert_eq!(poll_timeout(Some(Duration::from_micros(10))), PollTimeout::from(1u16));
        assert_eq!(poll_timeout(Some(Duration::ZERO)), PollTimeout::from(1u16));
        assert_eq!(
            poll_timeout(Some(Duration::from_micros(1500))),
            PollTimeout::from(2u16)
        );
        assert_eq!(
            poll_timeout(Some(Duration::from_secs(3600))),
            PollTimeout::from(u16::MAX)
        );
    }
}
