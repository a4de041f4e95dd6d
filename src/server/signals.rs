//! Signal handling for the main loop.
//!
//! The handlers installed by tokio only note the signal and wake up the
//! loop. What to do about a signal is decided by whoever awaits
//! [`SignalWatchers::next`].

use std::io;

use nix::sys::signal::{raise, signal, SigHandler, Signal};
use tokio::signal::unix::{self as unix_signal, SignalKind};
use tracing::{debug, info};

use super::mainloop::MainLoop;

//------------ Control -------------------------------------------------------

/// What the operator asked for.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Control {
    /// Reload zone data.
    Reload,

    /// Shut down because of the given signal.
    Shutdown(Signal),
}

//------------ SignalWatchers ------------------------------------------------

pub struct SignalWatchers {
    term: unix_signal::Signal,
    int: unix_signal::Signal,
    hup: unix_signal::Signal,
}

impl SignalWatchers {
    /// Starts watching for `SIGTERM`, `SIGINT`, and `SIGHUP`.
    pub fn install(main_loop: &MainLoop) -> Result<Self, io::Error> {
        let _guard = main_loop.enter();
        Ok(SignalWatchers {
            term: unix_signal::signal(SignalKind::terminate())?,
            int: unix_signal::signal(SignalKind::interrupt())?,
            hup: unix_signal::signal(SignalKind::hangup())?,
        })
    }

    /// Waits for the next signal.
    pub async fn next(&mut self) -> Control {
        tokio::select! {
            _ = self.term.recv() => Control::Shutdown(Signal::SIGTERM),
            _ = self.int.recv() => Control::Shutdown(Signal::SIGINT),
            _ = self.hup.recv() => Control::Reload,
        }
    }
}

/// Terminates the process with `sig` so the exit status reflects it.
///
/// Returns only if the signal did not terminate the process.
pub fn reraise(sig: Signal) {
    info!("Exiting on signal {sig}");
    // SAFETY: Restoring the default disposition has no handler to run.
    if let Err(err) = unsafe { signal(sig, SigHandler::SigDfl) } {
        debug!("Failed to restore default handler for {sig}: {err}");
        return;
    }
    if let Err(err) = raise(sig) {
        debug!("Failed to raise {sig}: {err}");
    }
}

//============ Testing =======================================================
