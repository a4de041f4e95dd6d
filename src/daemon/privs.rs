//! Privileges, memory locking, and scheduling priority.

use std::path::Path;

use nix::sys::mman::{mlockall, MlockAllFlags};
use nix::sys::resource::{getrlimit, setrlimit, Resource};
use nix::unistd::{
    chdir, chroot, geteuid, setgid, setgroups, setuid, Gid, Uid, User,
};
use tracing::{info, warn};

use super::DaemonError;

/// The smallest memlock limit we can work with.
const MIN_MEMLOCK: u64 = 1024 * 1024;

/// Returns whether the process runs as root.
pub fn is_privileged() -> bool {
    geteuid().is_root()
}

//------------ DropTarget ----------------------------------------------------

/// The identity to switch to after startup.
#[derive(Clone, Debug)]
pub struct DropTarget {
    name: String,
    uid: Uid,
    gid: Gid,
}

impl DropTarget {
    /// Looks up the user `name`.
    pub fn lookup(name: &str) -> Result<Self, DaemonError> {
        let user = User::from_name(name)
            .map_err(DaemonError::sys("getpwnam"))?
            .ok_or_else(|| DaemonError::UnknownUser(name.into()))?;
        Ok(DropTarget {
            name: user.name,
            uid: user.uid,
            gid: user.gid,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Switches to this identity, chrooting into `root` first if given.
    pub fn apply(&self, root: Option<&Path>) -> Result<(), DaemonError> {
        if let Some(root) = root {
            chroot(root).map_err(DaemonError::sys("chroot"))?;
            chdir("/").map_err(DaemonError::sys("chdir"))?;
            info!("Changed root directory to {}", root.display());
        }
        setgroups(&[self.gid]).map_err(DaemonError::sys("setgroups"))?;
        setgid(self.gid).map_err(DaemonError::sys("setgid"))?;
        setuid(self.uid).map_err(DaemonError::sys("setuid"))?;
        info!(
            "Dropped privileges to user {} ({}:{})",
            self.name, self.uid, self.gid
        );
        Ok(())
    }
}

//------------ Memory locking ------------------------------------------------

/// Prepares the memlock rlimit for locking all memory.
///
/// When privileged, both limits are raised to infinity. Otherwise the soft
/// limit is raised to the hard limit, which must be at least 1 MiB.
pub fn memlock_rlimits(privileged: bool) -> Result<(), DaemonError> {
    if privileged {
        let infinity = libc::RLIM_INFINITY;
        return setrlimit(Resource::RLIMIT_MEMLOCK, infinity, infinity)
            .map_err(DaemonError::sys("setrlimit(RLIMIT_MEMLOCK)"));
    }
    let (soft, hard) = getrlimit(Resource::RLIMIT_MEMLOCK)
        .map_err(DaemonError::sys("getrlimit(RLIMIT_MEMLOCK)"))?;
    check_memlock_limit(hard)?;
    if soft < hard {
        setrlimit(Resource::RLIMIT_MEMLOCK, hard, hard)
            .map_err(DaemonError::sys("setrlimit(RLIMIT_MEMLOCK)"))?;
    }
    if hard != libc::RLIM_INFINITY {
        warn!(
            "Memory locking is limited to {hard} bytes, allocations past \
             that will fail"
        );
    }
    Ok(())
}

fn check_memlock_limit(hard: u64) -> Result<(), DaemonError> {
    if hard != libc::RLIM_INFINITY && hard < MIN_MEMLOCK {
        Err(DaemonError::Memlock(hard))
    } else {
        Ok(())
    }
}

/// Locks all current and future memory.
pub fn lock_memory() -> Result<(), DaemonError> {
    mlockall(MlockAllFlags::MCL_CURRENT | MlockAllFlags::MCL_FUTURE)
        .map_err(DaemonError::sys("mlockall"))
}

//------------ set_priority --------------------------------------------------

/// Sets the scheduling priority of the process.
///
/// Failing to do so is only worth a warning.
pub fn set_priority(priority: i32) {
    // SAFETY: Plain system call without pointers.
    let res = unsafe { libc::setpriority(libc::PRIO_PROCESS, 0, priority) };
    if res < 0 {
        warn!(
            "Failed to set scheduling priority to {priority}: {}",
            std::io::Error::last_os_error()
        );
    } else {
        info!("Scheduling priority set to {priority}");
    }
}

//============ Testing =======================================================

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn memlock_minimum() {
        assert!(matches!(
            check_memlock_limit(64 * 1024),
            Err(DaemonError::Memlock(65536))
        ));
        assert!(check_memlock_limit(MIN_MEMLOCK).is_ok());
        assert!(check_memlock_limit(libc::RLIM_INFINITY).is_ok());
    }

    #[test]
    fn unknown_user() {
        assert!(matches!(
            DropTarget::lookup("no-such-user-authd-test"),
            Err(DaemonError::UnknownUser(_))
        ));
    }

    #[test]
    fn root_user_exists() {
        let target = DropTarget::lookup("root").unwrap();
        assert_eq!(target.name(), "root");
        assert!(target.uid.is_root());
    }
}
