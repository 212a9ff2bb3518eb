//! Signal tokens carried over the bridge channel
//!
//! A token is the raw signal number squeezed into one byte. Every standard
//! signal number fits, so decoding never loses the identity.

use nix::sys::signal::Signal;

/// Signals the listener loop distinguishes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalToken {
    /// Interrupt (SIGINT, Ctrl+C)
    Interrupt,
    /// Termination request (SIGTERM)
    Terminate,
    /// Any other signal routed through the bridge, by number
    Other(i32),
}

impl SignalToken {
    /// Decode a byte read from the bridge
    pub fn from_byte(byte: u8) -> Self {
        match Signal::try_from(i32::from(byte)) {
            Ok(Signal::SIGINT) => SignalToken::Interrupt,
            Ok(Signal::SIGTERM) => SignalToken::Terminate,
            _ => SignalToken::Other(i32::from(byte)),
        }
    }

    /// Encode for the wire (the inverse of `from_byte`)
    pub fn to_byte(self) -> u8 {
        match self {
            SignalToken::Interrupt => Signal::SIGINT as u8,
            SignalToken::Terminate => Signal::SIGTERM as u8,
            SignalToken::Other(signum) => signum as u8,
        }
    }

    /// Signal name for log output
    pub fn name(&self) -> String {
        match self {
            SignalToken::Interrupt => "SIGINT".to_string(),
            SignalToken::Terminate => "SIGTERM".to_string(),
            SignalToken::Other(signum) => match Signal::try_from(*signum) {
                Ok(sig) => sig.as_str().to_string(),
                Err(_) => format!("signal {}", signum),
            },
        }
    }
}

impl From<Signal> for SignalToken {
    fn from(signal: Signal) -> Self {
        SignalToken::from_byte(signal as i32 as u8)
    }
}
