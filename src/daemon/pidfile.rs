//! The pidfile and its advisory lock.
//!
//! A running daemon holds an exclusive `flock` on its pidfile for its whole
//! lifetime and keeps its process id in it. Whether an instance is running
//! is decided by the lock, never by the file’s mere existence, so a stale
//! file left behind by a crash is harmless.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant};
use std::{fs, io};

use nix::errno::Errno;
use nix::fcntl::{Flock, FlockArg};
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use tracing::{debug, info};

use super::DaemonError;

/// How long to wait for a running instance to exit.
pub const STOP_TIMEOUT: Duration = Duration::from_secs(15);

const POLL_INTERVAL: Duration = Duration::from_millis(10);

//------------ Pidfile -------------------------------------------------------

/// The pidfile of this process.
///
/// The file is opened early so that it stays reachable after a chroot. The
/// lock is taken only when the process is ready to replace a predecessor.
#[derive(Debug)]
pub struct Pidfile {
    path: PathBuf,
    state: Option<State>,
}

#[derive(Debug)]
enum State {
    Open(File),
    Held(Flock<File>),
}

impl Pidfile {
    /// Opens or creates the pidfile, creating its directory if necessary.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, DaemonError> {
        let path = path.into();
        let err = |source| DaemonError::Pidfile {
            path: path.clone(),
            source,
        };
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir).map_err(err)?;
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .mode(0o644)
            .open(&path)
            .map_err(err)?;
        Ok(Pidfile {
            path,
            state: Some(State::Open(file)),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_held(&self) -> bool {
        matches!(self.state, Some(State::Held(_)))
    }

    /// Takes the lock and records our process id.
    ///
    /// If another instance holds the lock, it is sent `SIGTERM` and waited
    /// for if `replace` is set. Otherwise that is an error.
    pub fn acquire(&mut self, replace: bool) -> Result<(), DaemonError> {
        let file = match self.state.take() {
            Some(State::Open(file)) => file,
            Some(State::Held(lock)) => {
                self.state = Some(State::Held(lock));
                return Ok(());
            }
            None => {
                return Err(DaemonError::Pidfile {
                    path: self.path.clone(),
                    source: io::Error::other("pidfile closed"),
                })
            }
        };

        let mut file = match try_lock(file) {
            Ok(lock) => return self.hold(lock),
            Err(Locked::Busy(file)) => file,
            Err(Locked::Failed(file, errno)) => {
                self.state = Some(State::Open(file));
                return Err(DaemonError::Sys {
                    what: "flock",
                    source: errno,
                });
            }
        };

        let pid = read_pid(&file);
        if !replace {
            self.state = Some(State::Open(file));
            return Err(DaemonError::AlreadyRunning(pid));
        }
        if let Some(pid) = pid {
            info!("Sending SIGTERM to running instance with pid {pid}");
            match kill(pid, Signal::SIGTERM) {
                Ok(()) | Err(Errno::ESRCH) => {}
                Err(errno) => {
                    self.state = Some(State::Open(file));
                    return Err(DaemonError::Sys {
                        what: "kill",
                        source: errno,
                    });
                }
            }
        }

        let deadline = Instant::now() + STOP_TIMEOUT;
        loop {
            thread::sleep(POLL_INTERVAL);
            file = match try_lock(file) {
                Ok(lock) => return self.hold(lock),
                Err(Locked::Busy(file)) => file,
                Err(Locked::Failed(file, errno)) => {
                    self.state = Some(State::Open(file));
                    return Err(DaemonError::Sys {
                        what: "flock",
                        source: errno,
                    });
                }
            };
            if Instant::now() > deadline {
                self.state = Some(State::Open(file));
                return Err(DaemonError::PredecessorAlive(pid));
            }
        }
    }

    fn hold(&mut self, lock: Flock<File>) -> Result<(), DaemonError> {
        let res = write_pid(&lock, Pid::this());
        self.state = Some(State::Held(lock));
        res.map_err(|source| DaemonError::Pidfile {
            path: self.path.clone(),
            source,
        })?;
        debug!("Acquired pidfile {}", self.path.display());
        Ok(())
    }
}

enum Locked {
    Busy(File),
    Failed(File, Errno),
}

fn try_lock(file: File) -> Result<Flock<File>, Locked> {
    match Flock::lock(file, FlockArg::LockExclusiveNonblock) {
        Ok(lock) => Ok(lock),
        Err((file, errno)) if errno == Errno::EWOULDBLOCK => {
            Err(Locked::Busy(file))
        }
        Err((file, errno)) => Err(Locked::Failed(file, errno)),
    }
}

fn write_pid(mut file: &File, pid: Pid) -> io::Result<()> {
    file.set_len(0)?;
    file.seek(SeekFrom::Start(0))?;
    writeln!(file, "{pid}")?;
    file.sync_data()
}

fn read_pid(mut file: &File) -> Option<Pid> {
    let mut text = String::new();
    file.seek(SeekFrom::Start(0)).ok()?;
    file.read_to_string(&mut text).ok()?;
    match text.trim().parse::<i32>() {
        Ok(pid) if pid > 0 => Some(Pid::from_raw(pid)),
        _ => None,
    }
}

//------------ Running instances ---------------------------------------------

/// Returns the process id of the instance holding the pidfile at `path`.
pub fn running_pid(path: &Path) -> Result<Option<Pid>, DaemonError> {
    let file = match File::open(path) {
        Ok(file) => file,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(source) => {
            return Err(DaemonError::Pidfile {
                path: path.into(),
                source,
            })
        }
    };
    match Flock::lock(file, FlockArg::LockSharedNonblock) {
        // Nobody holds the lock. Dropping ours releases it again.
        Ok(_) => Ok(None),
        Err((file, errno)) if errno == Errno::EWOULDBLOCK => {
            let Some(pid) = read_pid(&file) else {
                return Ok(None);
            };
            match kill(pid, None) {
                Ok(()) | Err(Errno::EPERM) => Ok(Some(pid)),
                Err(_) => Ok(None),
            }
        }
        Err((_, errno)) => Err(DaemonError::Sys {
            what: "flock",
            source: errno,
        }),
    }
}

/// Sends `signal` to the running instance, if any.
pub fn signal_running(
    path: &Path,
    signal: Signal,
) -> Result<Option<Pid>, DaemonError> {
    let Some(pid) = running_pid(path)? else {
        return Ok(None);
    };
    kill(pid, signal).map_err(|source| DaemonError::Sys {
        what: "kill",
        source,
    })?;
    Ok(Some(pid))
}

/// Stops the running instance and waits for it to release the pidfile.
///
/// Returns the process id of the stopped instance or `None` if there
/// wasn’t one.
pub fn stop_running(
    path: &Path,
    timeout: Duration,
) -> Result<Option<Pid>, DaemonError> {
    let Some(pid) = signal_running(path, Signal::SIGTERM)? else {
        return Ok(None);
    };
    let deadline = Instant::now() + timeout;
    while running_pid(path)?.is_some() {
        if Instant::now() > deadline {
            return Err(DaemonError::PredecessorAlive(Some(pid)));
        }
        thread::sleep(POLL_INTERVAL * 10);
    }
    Ok(Some(pid))
}

//============ Testing =======================================================
