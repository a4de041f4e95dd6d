//! Spawning worker threads.
//!
//! Signals are handled by the main thread only. Worker threads are
//! therefore spawned with all signals blocked, and they inherit that mask.

use std::io;
use std::thread;

use nix::sys::signal::{pthread_sigmask, SigSet, SigmaskHow};
use tracing::debug;

use crate::daemon::DaemonError;
use crate::error::Error;

//------------ SignalsBlocked ------------------------------------------------

/// Blocks all signals on the current thread while it lives.
///
/// Dropping it restores the previous mask.
pub struct SignalsBlocked {
    previous: SigSet,
}

impl SignalsBlocked {
    pub fn new() -> Result<Self, Error> {
        let mut previous = SigSet::empty();
        pthread_sigmask(
            SigmaskHow::SIG_SETMASK,
            Some(&SigSet::all()),
            Some(&mut previous),
        )
        .map_err(DaemonError::sys("pthread_sigmask"))?;
        Ok(SignalsBlocked { previous })
    }

    /// Spawns a named thread inheriting the blocked mask.
    pub fn spawn<F>(&self, name: String, f: F) -> Result<(), Error>
    where
        F: FnOnce() + Send + 'static,
    {
        debug!("Starting thread '{name}'");
        thread::Builder::new()
            .name(name)
            .spawn(f)
            .map(drop)
            .map_err(Error::io("spawning thread"))
    }
}

impl Drop for SignalsBlocked {
    fn drop(&mut self) {
        let _ = pthread_sigmask(
            SigmaskHow::SIG_SETMASK,
            Some(&self.previous),
            None,
        );
    }
}

/// Checks that a thread can be spawned and joined.
pub fn check_threads() -> Result<(), Error> {
    thread::Builder::new()
        .name("check".into())
        .spawn(|| ())
        .map_err(Error::io("spawning thread"))?
        .join()
        .map_err(|_| {
            Error::io("joining thread")(io::Error::other("thread panicked"))
        })
}

//============ Testing =======================================================

#[cfg(test)]
mod test {
    use super::*;
    use nix::sys::signal::Signal;
    use std::sync::mpsc;

    fn current_mask() -> SigSet {
        SigSet::thread_get_mask().unwrap()
    }

    #[test]
    fn workers_inherit_blocked_mask() {
        let before = current_mask();
        let (tx, rx) = mpsc::channel();
        {
            let blocked = SignalsBlocked::new().unwrap();
            assert!(current_mask().contains(Signal::SIGTERM));
            blocked
                .spawn("test-worker".into(), move || {
                    tx.send(current_mask().contains(Signal::SIGHUP)).unwrap();
                })
                .unwrap();
        }
        assert!(rx.recv().unwrap());
        assert_eq!(
            current_mask().contains(Signal::SIGTERM),
            before.contains(Signal::SIGTERM)
        );
    }

    #[test]
    fn threads_work() {
        check_threads().unwrap();
    }
}
