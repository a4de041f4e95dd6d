//! Running as a daemon.
//!
//! This module deals with the process itself: the [`pidfile`] identifying
//! the running instance, forking into the background with a privileged
//! [`helper`] process, and the privilege and resource settings in
//! [`privs`].

pub mod helper;
pub mod pidfile;
pub mod privs;

use std::io;
use std::path::PathBuf;

use nix::errno::Errno;
use nix::unistd::Pid;

pub use self::helper::{fork_with_helper, HelperLink, PrivilegedOp};
pub use self::pidfile::Pidfile;

//============ Error Types ===================================================

#[derive(Debug, thiserror::Error)]
pub enum DaemonError {
    #[error("cannot access pidfile {}: {source}", path.display())]
    Pidfile {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("another instance is already running{}", DisplayPid(.0))]
    AlreadyRunning(Option<Pid>),

    #[error("the running instance{} did not exit in time", DisplayPid(.0))]
    PredecessorAlive(Option<Pid>),

    #[error("no instance is running")]
    NotRunning,

    #[error("{what} failed: {source}")]
    Sys {
        what: &'static str,
        #[source]
        source: Errno,
    },

    #[error("memlock limit of {0} bytes is below the required 1 MiB")]
    Memlock(u64),

    #[error("unknown user '{0}'")]
    UnknownUser(String),

    #[error("lost contact with the privileged helper: {0}")]
    Helper(#[source] io::Error),
}

impl DaemonError {
    pub(crate) fn sys(what: &'static str) -> impl FnOnce(Errno) -> Self {
        move |source| DaemonError::Sys { what, source }
    }
}

struct DisplayPid<'a>(&'a Option<Pid>);

impl<'a> std::fmt::Display for DisplayPid<'a> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.0 {
            Some(pid) => write!(f, " with pid {pid}"),
            None => Ok(()),
        }
    }
}
