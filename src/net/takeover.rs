//! Acquiring the listening sockets from a running predecessor.
//!
//! When a new instance replaces a running one, it first tries to bind all
//! its sockets alongside the predecessor, which works if port sharing is
//! available. If that succeeds, the predecessor is stopped only after the
//! new instance is fully up. If some sockets can’t be bound, the
//! predecessor has to be stopped first and binding retried, this time with
//! failure being fatal.
//!
//! [`acquire_sockets`] runs the first part of the protocol and returns a
//! [`PendingTakeover`] which has to be [finished][PendingTakeover::finish]
//! once the workers are running.

use tracing::info;

use crate::error::Error;

//------------ Takeover ------------------------------------------------------

/// The operations the takeover protocol needs.
pub trait Takeover {
    /// Tries to bind all sockets not yet bound.
    fn bind_all(&mut self) -> Result<(), Error>;

    /// Checks whether all sockets are bound.
    ///
    /// With `soft`, returns whether any socket failed. Otherwise an
    /// unbound socket is an error.
    fn check_all(&mut self, soft: bool) -> Result<bool, Error>;

    /// Stops the predecessor, if there is one, and takes over its pidfile.
    fn replace_predecessor(&mut self) -> Result<(), Error>;
}

//------------ TakeoverPath --------------------------------------------------

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum TakeoverPath {
    /// All sockets were bound while the predecessor was still running.
    Overlap,

    /// The predecessor had to be stopped before all sockets were bound.
    Replaced,
}

//------------ PendingTakeover -----------------------------------------------

/// A takeover that still needs finishing.
#[derive(Debug)]
#[must_use = "the predecessor is only replaced by calling finish"]
pub struct PendingTakeover {
    path: TakeoverPath,
}

impl PendingTakeover {
    pub fn path(&self) -> TakeoverPath {
        self.path
    }

    /// Completes the takeover.
    ///
    /// Must only be called after all workers have started serving.
    pub fn finish(self, takeover: &mut impl Takeover) -> Result<(), Error> {
        match self.path {
            TakeoverPath::Overlap => takeover.replace_predecessor(),
            TakeoverPath::Replaced => Ok(()),
        }
    }
}

//------------ acquire_sockets -----------------------------------------------

/// Binds all sockets, stopping the predecessor first if necessary.
pub fn acquire_sockets(
    takeover: &mut impl Takeover,
) -> Result<PendingTakeover, Error> {
    takeover.bind_all()?;
    if !takeover.check_all(true)? {
        return Ok(PendingTakeover {
            path: TakeoverPath::Overlap,
        });
    }
    info!("Stopping the running instance to acquire remaining sockets");
    takeover.replace_predecessor()?;
    takeover.bind_all()?;
    takeover.check_all(false)?;
    Ok(PendingTakeover {
        path: TakeoverPath::Replaced,
    })
}

//============ Testing =======================================================

#[cfg(test)]
mod test {
    use super::*;
    use crate::daemon::DaemonError;

    #[derive(Debug, Eq, PartialEq)]
    enum Step {
        Bind,
        Check(bool),
        Replace,
    }

    /// Records the calls. Sockets stay unbound until `bind_ok_after` binds
    /// have happened, or forever if that is `None`.
    struct Mock {
        steps: Vec<Step>,
        binds: usize,
        bind_ok_after: Option<usize>,
        replace_fails: bool,
    }

    impl Mock {
        fn new(bind_ok_after: Option<usize>) -> Self {
            Mock {
                steps: Vec::new(),
                binds: 0,
                bind_ok_after,
                replace_fails: false,
            }
        }
    }

    impl Takeover for Mock {
        fn bind_all(&mut self) -> Result<(), Error> {
            self.steps.push(Step::Bind);
            self.binds += 1;
            Ok(())
        }

        fn check_all(&mut self, soft: bool) -> Result<bool, Error> {
            self.steps.push(Step::Check(soft));
            let failed = match self.bind_ok_after {
                Some(count) => self.binds < count,
                None => true,
            };
            if failed && !soft {
                Err(Error::Startup("sockets not bound".into()))
            } else {
                Ok(failed)
            }
        }

        fn replace_predecessor(&mut self) -> Result<(), Error> {
            self.steps.push(Step::Replace);
            if self.replace_fails {
                Err(DaemonError::PredecessorAlive(None).into())
            } else {
                Ok(())
            }
        }
    }

    #[test]
    fn overlap_replaces_after_finish() {
        let mut mock = Mock::new(Some(1));
        let pending = acquire_sockets(&mut mock).unwrap();
        assert_eq!(pending.path(), TakeoverPath::Overlap);
        assert_eq!(mock.steps, [Step::Bind, Step::Check(true)]);

        pending.finish(&mut mock).unwrap();
        assert_eq!(mock.steps.last(), Some(&Step::Replace));
        assert_eq!(mock.steps.len(), 3);
    }

    #[test]
    fn failed_bind_replaces_before_retry() {
        let mut mock = Mock::new(Some(2));
        let pending = acquire_sockets(&mut mock).unwrap();
        assert_eq!(pending.path(), TakeoverPath::Replaced);
        assert_eq!(
            mock.steps,
            [
                Step::Bind,
                Step::Check(true),
                Step::Replace,
                Step::Bind,
                Step::Check(false)
            ]
        );

        pending.finish(&mut mock).unwrap();
        assert_eq!(mock.steps.len(), 5);
    }

    #[test]
    fn failed_retry_is_fatal() {
        let mut mock = Mock::new(None);
        assert!(acquire_sockets(&mut mock).is_err());
        assert_eq!(mock.steps.last(), Some(&Step::Check(false)));
        assert_eq!(
            mock.steps.iter().filter(|step| **step == Step::Replace).count(),
            1
        );
    }

    #[test]
    fn failed_replace_stops_before_retry() {
        let mut mock = Mock::new(Some(2));
        mock.replace_fails = true;
        assert!(acquire_sockets(&mut mock).is_err());
        assert_eq!(
            mock.steps,
            [Step::Bind, Step::Check(true), Step::Replace]
        );
    }
}
