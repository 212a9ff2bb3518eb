//! Errors shared by the signal bridge, the listener loop and services

use std::io;

/// Failure to create, use or release a loop resource (bridge, poll, listener)
///
/// These are fatal for the loop invocation and propagate to the caller of
/// `ListenerLoop::run`.
#[derive(Debug, thiserror::Error)]
pub enum ResourceError {
    #[error("Failed to create signal bridge channel: {0}")]
    Channel(#[source] io::Error),

    #[error("A signal bridge is already installed in this process")]
    BridgeInUse,

    #[error("Failed to install handler for {signal}: {source}")]
    Handler {
        signal: &'static str,
        #[source]
        source: nix::Error,
    },

    #[error("Failed to restore handler for {signal}: {source}")]
    Restore {
        signal: &'static str,
        #[source]
        source: nix::Error,
    },

    #[error("Signal bridge read failed: {0}")]
    Read(#[source] io::Error),

    #[error("Signal bridge channel closed unexpectedly")]
    ChannelClosed,

    #[error("poll failed: {0}")]
    Poll(#[source] nix::Error),

    #[error("Listener error: {0}")]
    Listener(#[source] io::Error),

    #[error("Runtime setup failed: {0}")]
    Runtime(#[source] io::Error),
}

/// A single unit of work failed
///
/// Logged by the loop and otherwise ignored: one bad request never stops the
/// server.
#[derive(Debug, thiserror::Error)]
pub enum HandlerError {
    #[error("accept failed: {0}")]
    Accept(#[source] io::Error),

    #[error("connection from {peer} failed: {reason}")]
    Connection { peer: String, reason: String },

    #[error("connection from {peer} timed out")]
    Timeout { peer: String },

    #[error("{0}")]
    Other(String),
}
