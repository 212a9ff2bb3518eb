//! Self-pipe bridge from asynchronous signal delivery to a pollable fd
//!
//! The installed handler only writes the signal number, as one byte, to the
//! non-blocking write end of a socket pair. All decisions happen in the loop
//! that reads the other end.
//!
//! Overflow: the write end never blocks. When its buffer is full the write
//! fails and the token is dropped, so bursts of signals may coalesce. The
//! kernel coalesces pending signals of the same number anyway; a repeated
//! SIGTERM simply takes the same path again.
//!
//! The handler is process-wide, so only one bridge may be live at a time.

use std::io::{self, Read};
use std::net::Shutdown;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd};
use std::os::unix::net::UnixStream;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};

use nix::errno::Errno;
use nix::sys::signal::{sigaction, SaFlags, SigAction, SigHandler, SigSet, Signal};

use super::SignalToken;
use crate::error::ResourceError;

/// Write end used by the handler, -1 when no bridge is live
static WRITE_FD: AtomicI32 = AtomicI32::new(-1);

/// Set while a bridge owns the handlers
static INSTALLED: AtomicBool = AtomicBool::new(false);

extern "C" fn forward_signal(signum: libc::c_int) {
    let saved = Errno::last_raw();
    let fd = WRITE_FD.load(Ordering::Acquire);
    if fd >= 0 {
        let token = signum as u8;
        // Result ignored: a full or closed channel drops the token
        unsafe {
            libc::write(fd, &token as *const u8 as *const libc::c_void, 1);
        }
    }
    Errno::set_raw(saved);
}

/// Signal-to-fd bridge owned by a single listener loop invocation
#[derive(Debug)]
pub struct SignalBridge {
    reader: Option<UnixStream>,
    writer: Option<UnixStream>,
    /// Dispositions replaced by `create`, restored by `close`
    previous: Vec<(Signal, SigAction)>,
}

impl SignalBridge {
    /// Create the channel and route `signals` into it
    pub fn create(signals: &[Signal]) -> Result<Self, ResourceError> {
        if INSTALLED
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(ResourceError::BridgeInUse);
        }

        let (reader, writer) = match open_channel() {
            Ok(pair) => pair,
            Err(e) => {
                INSTALLED.store(false, Ordering::Release);
                return Err(ResourceError::Channel(e));
            }
        };

        WRITE_FD.store(writer.as_raw_fd(), Ordering::Release);

        let mut bridge = Self {
            reader: Some(reader),
            writer: Some(writer),
            previous: Vec::with_capacity(signals.len()),
        };

        let action = SigAction::new(
            SigHandler::Handler(forward_signal),
            SaFlags::SA_RESTART,
            SigSet::empty(),
        );

        for &signal in signals {
            match unsafe { sigaction(signal, &action) } {
                Ok(old) => bridge.previous.push((signal, old)),
                Err(source) => {
                    // Roll back so no handler outlives the failed bridge
                    let _ = bridge.close();
                    return Err(ResourceError::Handler {
                        signal: signal.as_str(),
                        source,
                    });
                }
            }
            log::debug!("Routing {} through signal bridge", signal);
        }

        Ok(bridge)
    }

    /// Read exactly one token
    ///
    /// Returns `None` if the readiness was spurious and nothing was queued.
    pub fn read_token(&mut self) -> Result<Option<SignalToken>, ResourceError> {
        let reader = self.reader.as_mut().ok_or(ResourceError::ChannelClosed)?;
        let mut byte = [0u8; 1];
        loop {
            match reader.read(&mut byte) {
                Ok(0) => return Err(ResourceError::ChannelClosed),
                Ok(_) => return Ok(Some(SignalToken::from_byte(byte[0]))),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(None),
                Err(e) => return Err(ResourceError::Read(e)),
            }
        }
    }

    /// Read end to register with the multiplexer
    pub fn read_fd(&self) -> Result<BorrowedFd<'_>, ResourceError> {
        self.reader
            .as_ref()
            .map(|r| r.as_fd())
            .ok_or(ResourceError::ChannelClosed)
    }

    /// Whether `close` has already run
    pub fn is_closed(&self) -> bool {
        self.reader.is_none() && self.writer.is_none()
    }

    /// Restore previous handlers and release both endpoints
    ///
    /// Safe to call more than once. Every step runs even if an earlier one
    /// fails; the first failure is reported.
    pub fn close(&mut self) -> Result<(), ResourceError> {
        let mut result = Ok(());

        // Handlers first, so nothing writes to an fd number about to be reused
        while let Some((signal, old)) = self.previous.pop() {
            if let Err(source) = unsafe { sigaction(signal, &old) } {
                log::warn!("Failed to restore {} disposition: {}", signal, source);
                if result.is_ok() {
                    result = Err(ResourceError::Restore {
                        signal: signal.as_str(),
                        source,
                    });
                }
            }
        }

        if let Some(writer) = self.writer.take() {
            let _ = WRITE_FD.compare_exchange(
                writer.as_raw_fd(),
                -1,
                Ordering::AcqRel,
                Ordering::Acquire,
            );
            let _ = writer.shutdown(Shutdown::Both);
            drop(writer);
        }

        if let Some(reader) = self.reader.take() {
            let _ = reader.shutdown(Shutdown::Both);
            drop(reader);
            log::debug!("Signal bridge closed");
            INSTALLED.store(false, Ordering::Release);
        }

        result
    }
}

impl Drop for SignalBridge {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            log::warn!("Signal bridge teardown: {}", e);
        }
    }
}

fn open_channel() -> io::Result<(UnixStream, UnixStream)> {
    let (reader, writer) = UnixStream::pair()?;
    reader.set_nonblocking(true)?;
    writer.set_nonblocking(true)?;
    Ok((reader, writer))
}
