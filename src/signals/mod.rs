//! Signal handling for the listener loop
//!
//! - SIGINT: first one warns, second one shuts down
//! - SIGTERM: shuts down
//!
//! Delivery goes through a [`SignalBridge`], which turns each signal into a
//! one-byte [`SignalToken`] readable from a socket.

mod bridge;
mod token;

pub use bridge::SignalBridge;
pub use token::SignalToken;

use nix::sys::signal::Signal;

/// Signals routed through the bridge unless configured otherwise
pub const DEFAULT_SIGNALS: [Signal; 2] = [Signal::SIGINT, Signal::SIGTERM];
