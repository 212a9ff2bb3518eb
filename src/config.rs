//! Environment-driven configuration and log setup
//!
//! - `DEBUG`: when set (to anything), requests are served one at a time
//! - `HTTPD_LOGLEVEL`: DEBUG, INFO, WARNING, ERROR or CRITICAL (default INFO)
//!
//! `RUST_LOG` still takes precedence over `HTTPD_LOGLEVEL` when present.

use std::io::Write;
use std::str::FromStr;

/// Environment variable selecting single-threaded request service
pub const DEBUG_ENV: &str = "DEBUG";

/// Environment variable holding the log threshold
pub const LOGLEVEL_ENV: &str = "HTTPD_LOGLEVEL";

/// How the HTTP service runs accepted connections
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServeMode {
    /// Serve each connection to completion inside the loop
    Single,
    /// Hand connections to a worker pool
    Concurrent,
}

impl ServeMode {
    /// `Single` when `DEBUG` is set, `Concurrent` otherwise
    pub fn from_env() -> Self {
        Self::from_debug_flag(std::env::var_os(DEBUG_ENV).is_some())
    }

    fn from_debug_flag(debug: bool) -> Self {
        if debug {
            ServeMode::Single
        } else {
            ServeMode::Concurrent
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ServeMode::Single => "single",
            ServeMode::Concurrent => "concurrent",
        }
    }
}

impl FromStr for ServeMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "single" => Ok(ServeMode::Single),
            "concurrent" => Ok(ServeMode::Concurrent),
            other => Err(format!("unknown serve mode '{}'", other)),
        }
    }
}

/// Map an `HTTPD_LOGLEVEL` value to a log filter, defaulting to info
pub fn level_filter(value: Option<&str>) -> log::LevelFilter {
    match value {
        Some("DEBUG") => log::LevelFilter::Debug,
        Some("INFO") => log::LevelFilter::Info,
        Some("WARNING") => log::LevelFilter::Warn,
        Some("ERROR") | Some("CRITICAL") => log::LevelFilter::Error,
        _ => log::LevelFilter::Info,
    }
}

/// Initialize env_logger once per process
///
/// Every line carries the pid so controller and worker output can be told
/// apart on a shared terminal.
pub fn init_logging() {
    let level = std::env::var(LOGLEVEL_ENV).ok();
    let mut builder = env_logger::Builder::new();
    builder.filter_level(level_filter(level.as_deref()));
    builder.parse_env(env_logger::Env::default());
    builder.format(|buf, record| {
        writeln!(
            buf,
            "{} ({}) {:>5} {}: {}",
            buf.timestamp(),
            std::process::id(),
            record.level(),
            record.target(),
            record.args()
        )
    });
    let _ = builder.try_init();
}
