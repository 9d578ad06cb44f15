// Signal module
// Turns SIGINT/SIGTERM into a readable descriptor for the event loop

use anyhow::{Context, Result};
use log::debug;
use nix::sys::signal::{SigSet, Signal};
use nix::sys::signalfd::{SfdFlags, SignalFd};
use std::os::fd::{AsFd, BorrowedFd};

/// Signals that end the overlay
const SHUTDOWN_SIGNALS: [Signal; 2] = [Signal::SIGINT, Signal::SIGTERM];

/// Pending termination request.
///
/// Installing it blocks the shutdown signals for the calling thread, so
/// they are only ever observed by polling this descriptor. The session
/// owns the value; nothing else holds on to it.
pub struct ShutdownSignal {
    fd: SignalFd,
}

impl ShutdownSignal {
    /// Must run before any other thread is spawned
    pub fn install() -> Result<Self> {
        let mut mask = SigSet::empty();
        for signal in SHUTDOWN_SIGNALS {
            mask.add(signal);
        }
        mask.thread_block().context("Failed to block shutdown signals")?;

        let fd = SignalFd::with_flags(&mask, SfdFlags::SFD_NONBLOCK | SfdFlags::SFD_CLOEXEC)
            .context("Failed to create signalfd")?;
        debug!("Shutdown signals routed to signalfd");

        Ok(Self { fd })
    }

    /// Name of a delivered shutdown signal, if any
    pub fn take(&mut self) -> Result<Option<&'static str>> {
        let info = match self.fd.read_signal().context("Failed to read signalfd")? {
            Some(info) => info,
            None => return Ok(None),
        };

        let name = Signal::try_from(info.ssi_signo as i32)
            .map(Signal::as_str)
            .unwrap_or("unknown signal");
        Ok(Some(name))
    }
}

impl AsFd for ShutdownSignal {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.fd.as_fd()
    }
}
