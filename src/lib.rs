//! sighttpd - signal-aware HTTP listener with a daemon controller
//!
//! A small HTTP server whose accept loop multiplexes the listening socket
//! with a self-pipe carrying POSIX signals, so shutdown is decided inside
//! the loop instead of inside a signal handler.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────┐
//! │ controller (sighttpd run)                        │
//! │   Daemon: bind, spawn, probe, SIGTERM → SIGKILL  │
//! └───────────────┬──────────────────────────────────┘
//!                 │ --listen-fd N
//! ┌───────────────▼──────────────────────────────────┐
//! │ worker (sighttpd serve)                          │
//! │   ListenerLoop ── poll ──┬── SignalBridge (pipe) │
//! │                          └── HttpService (TCP)   │
//! └──────────────────────────────────────────────────┘
//! ```

pub mod config;
pub mod daemon;
pub mod error;
pub mod http;
pub mod listener;
pub mod signals;

pub use config::ServeMode;
pub use daemon::{Daemon, DaemonConfig, LaunchError, StopReport, WorkerExit};
pub use error::{HandlerError, ResourceError};
pub use http::{HttpConfig, HttpService};
pub use listener::{ListenerLoop, LoopConfig, LoopReport, Service};
pub use signals::{SignalBridge, SignalToken};
