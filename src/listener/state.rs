//! Shutdown state machine of the listener loop
//!
//! ```text
//!     ┌─────────────────────┐
//!     │ AwaitingFirstSignal │───────────────┐
//!     └─────────┬───────────┘               │
//!               │ SIGINT (warn)             │ SIGTERM
//!     ┌─────────▼────────────┐              │
//!     │ AwaitingSecondSignal │──────────────┤
//!     └──────────────────────┘  SIGINT or   │
//!                               SIGTERM     │
//!                                     ┌─────▼──────┐
//!                                     │ Terminated │
//!                                     └────────────┘
//! ```

use crate::signals::SignalToken;

/// Where the loop stands with respect to shutdown
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopState {
    AwaitingFirstSignal,
    AwaitingSecondSignal,
    Terminated,
}

/// What the loop must do after a token
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalAction {
    /// Keep serving
    Continue,
    /// Keep serving, but tell the operator how to force shutdown
    Warn,
    /// Leave the loop and tear down
    Shutdown,
}

/// Per-invocation shutdown state plus the interrupt counter
#[derive(Debug)]
pub struct ShutdownState {
    state: LoopState,
    interrupts: u32,
}

impl ShutdownState {
    pub fn new() -> Self {
        Self {
            state: LoopState::AwaitingFirstSignal,
            interrupts: 0,
        }
    }

    pub fn state(&self) -> LoopState {
        self.state
    }

    /// Number of SIGINT tokens seen
    pub fn interrupts(&self) -> u32 {
        self.interrupts
    }

    pub fn is_terminated(&self) -> bool {
        self.state == LoopState::Terminated
    }

    /// Apply one token
    ///
    /// Tokens arriving after `Terminated` change nothing.
    pub fn on_signal(&mut self, token: SignalToken) -> SignalAction {
        match (self.state, token) {
            (LoopState::Terminated, _) => SignalAction::Continue,
            (LoopState::AwaitingFirstSignal, SignalToken::Interrupt) => {
                self.interrupts += 1;
                self.state = LoopState::AwaitingSecondSignal;
                SignalAction::Warn
            }
            (LoopState::AwaitingSecondSignal, SignalToken::Interrupt) => {
                self.interrupts += 1;
                self.state = LoopState::Terminated;
                SignalAction::Shutdown
            }
            (_, SignalToken::Terminate) => {
                self.state = LoopState::Terminated;
                SignalAction::Shutdown
            }
            (_, SignalToken::Other(_)) => SignalAction::Continue,
        }
    }
}

impl Default for ShutdownState {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_new() {
        let state = ShutdownState::new();
        assert_eq!(state.state(), LoopState::AwaitingFirstSignal);
        assert_eq!(state.interrupts(), 0);
        assert!(!state.is_terminated());
    }

    #[test]
    fn test_first_interrupt_is_soft() {
        let mut state = ShutdownState::new();
        assert_eq!(state.on_signal(SignalToken::Interrupt), SignalAction::Warn);
        assert_eq!(state.state(), LoopState::AwaitingSecondSignal);
        assert_eq!(state.interrupts(), 1);
    }

    #[test]
    fn test_second_interrupt_is_hard() {
        let mut state = ShutdownState::new();
        state.on_signal(SignalToken::Interrupt);
        assert_eq!(state.on_signal(SignalToken::Interrupt), SignalAction::Shutdown);
        assert!(state.is_terminated());
        assert_eq!(state.interrupts(), 2);
    }

    #[test]
    fn test_terminate_is_always_hard() {
        let mut state = ShutdownState::new();
        assert_eq!(state.on_signal(SignalToken::Terminate), SignalAction::Shutdown);
        assert!(state.is_terminated());

        let mut state = ShutdownState::new();
        state.on_signal(SignalToken::Interrupt);
        assert_eq!(state.on_signal(SignalToken::Terminate), SignalAction::Shutdown);
        assert!(state.is_terminated());
    }

    #[test]
    fn test_other_signals_ignored() {
        let mut state = ShutdownState::new();
        assert_eq!(
            state.on_signal(SignalToken::Other(libc::SIGHUP)),
            SignalAction::Continue
        );
        assert_eq!(state.state(), LoopState::AwaitingFirstSignal);

        state.on_signal(SignalToken::Interrupt);
        assert_eq!(
            state.on_signal(SignalToken::Other(libc::SIGUSR1)),
            SignalAction::Continue
        );
        assert_eq!(state.state(), LoopState::AwaitingSecondSignal);
    }

    #[test]
    fn test_tokens_after_terminated_are_noops() {
        let mut state = ShutdownState::new();
        state.on_signal(SignalToken::Terminate);
        assert_eq!(state.on_signal(SignalToken::Interrupt), SignalAction::Continue);
        assert_eq!(state.on_signal(SignalToken::Terminate), SignalAction::Continue);
        assert_eq!(state.interrupts(), 0);
        assert!(state.is_terminated());
    }
}
