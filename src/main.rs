use std::error::Error;
use std::net::TcpListener;
use std::os::fd::{FromRawFd, OwnedFd, RawFd};
use std::path::PathBuf;
use std::time::Duration;

use clap::{Args as ClapArgs, Parser, Subcommand};
use nix::sys::signal::{signal, SigHandler, Signal};
use tokio::signal::unix::SignalKind;

use sighttpd::daemon::{probe_target, ProbeConfig};
use sighttpd::signals::DEFAULT_SIGNALS;
use sighttpd::{Daemon, DaemonConfig, HttpConfig, HttpService, ListenerLoop, LoopConfig, ServeMode};

#[derive(Parser)]
#[command(name = "sighttpd")]
#[command(about = "Signal-aware HTTP listener and daemon controller")]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the listener loop in the foreground
    Serve(ServeArgs),

    /// Start a worker in the background and stop it on Ctrl-C or SIGTERM
    Run(RunArgs),
}

#[derive(ClapArgs)]
struct ServeArgs {
    /// Address to bind (ignored with --listen-fd)
    #[arg(long, default_value = "0.0.0.0")]
    address: String,

    /// Port to bind (ignored with --listen-fd)
    #[arg(long, short = 'p', default_value_t = 8000)]
    port: u16,

    /// Serve on an already listening socket inherited from the parent
    #[arg(long)]
    listen_fd: Option<RawFd>,

    /// Document root for file requests
    #[arg(long, default_value = ".")]
    root: PathBuf,

    /// single or concurrent (default: single when DEBUG is set)
    #[arg(long)]
    mode: Option<ServeMode>,

    /// Ignore SIGTERM entirely (exercises forced shutdown)
    #[arg(long, hide = true)]
    ignore_sigterm: bool,
}

#[derive(ClapArgs)]
struct RunArgs {
    #[arg(long, default_value = "0.0.0.0")]
    address: String,

    #[arg(long, short = 'p', default_value_t = 8000)]
    port: u16,

    #[arg(long)]
    root: Option<PathBuf>,

    /// Seconds between SIGTERM and SIGKILL when stopping
    #[arg(long, default_value_t = 10)]
    kill_timeout: u64,

    /// HEAD requests sent to check readiness (0 disables the probe)
    #[arg(long, default_value_t = 3)]
    probe_attempts: u32,

    #[arg(long)]
    mode: Option<ServeMode>,
}

fn main() -> Result<(), Box<dyn Error>> {
    sighttpd::config::init_logging();

    let args = Args::parse();

    match args.command {
        Command::Serve(args) => serve(args)?,
        Command::Run(args) => {
            let code = run(args)?;
            if code != 0 {
                std::process::exit(code);
            }
        }
    }

    Ok(())
}

fn serve(args: ServeArgs) -> Result<(), Box<dyn Error>> {
    let listener = match args.listen_fd {
        // SAFETY: the controller passes a listening socket it no longer uses
        Some(fd) => TcpListener::from(unsafe { OwnedFd::from_raw_fd(fd) }),
        None => TcpListener::bind((args.address.as_str(), args.port))?,
    };

    let mut signals = DEFAULT_SIGNALS.to_vec();
    if args.ignore_sigterm {
        // SAFETY: SigIgn installs no handler code
        unsafe { signal(Signal::SIGTERM, SigHandler::SigIgn) }?;
        signals.retain(|s| *s != Signal::SIGTERM);
        log::warn!("Ignoring SIGTERM");
    }

    let config = HttpConfig {
        mode: args.mode.unwrap_or_else(ServeMode::from_env),
        root: args.root,
        ..HttpConfig::default()
    };
    let service = HttpService::new(listener, config)?;

    let report = ListenerLoop::new(LoopConfig {
        signals,
        ..LoopConfig::default()
    })
    .run(service)?;

    log::info!(
        "Shut down after {} request(s), {} failed",
        report.serviced,
        report.failures
    );
    Ok(())
}

/// Returns the worker's exit code
fn run(args: RunArgs) -> Result<i32, Box<dyn Error>> {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;

    runtime.block_on(async move {
        let config = DaemonConfig {
            address: args.address,
            port: args.port,
            kill_timeout: Duration::from_secs(args.kill_timeout),
            probe: (args.probe_attempts > 0).then(|| ProbeConfig {
                attempts: args.probe_attempts,
                ..ProbeConfig::default()
            }),
            mode: args.mode.unwrap_or_else(ServeMode::from_env),
            root: args.root,
            ..DaemonConfig::current_exe()?
        };

        let mut daemon = Daemon::new(config);
        let started = daemon.start().await?;
        log::info!("Listening on http://{}/", probe_target(started.addr));

        let mut sigterm = tokio::signal::unix::signal(SignalKind::terminate())?;

        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                log::info!("Received SIGINT, stopping server");
            }
            _ = sigterm.recv() => {
                log::info!("Received SIGTERM, stopping server");
            }
            _ = watch(&mut daemon) => {
                log::warn!("Server exited unexpectedly");
            }
        }

        let report = daemon.stop().await;
        Ok::<_, Box<dyn Error>>(report.exit.code().unwrap_or(1))
    })
}

/// Resolves once the worker is gone
async fn watch(daemon: &mut Daemon) {
    while daemon.is_alive() {
        tokio::time::sleep(Duration::from_millis(500)).await;
    }
}
