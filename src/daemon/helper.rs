//! Forking with a privileged helper process.
//!
//! The daemon may drop its privileges before it has bound all its sockets,
//! since binding happens only after an overlapping predecessor has been
//! dealt with. A helper process therefore keeps the original privileges
//! and executes the one privileged operation, binding sockets, whenever
//! the daemon asks for it. The sockets are created before the fork, so the
//! helper binds the very same sockets the daemon serves on.
//!
//! When going to the background, the original process becomes the helper
//! and the daemon is a grandchild in its own session. The helper’s exit
//! status tells the invoking shell whether startup succeeded. In the
//! foreground, the daemon stays the original process and the helper is a
//! child that is reaped once startup completes.
//!
//! Daemon and helper talk through two pipes carrying single bytes.

use std::fs::{File, OpenOptions};
use std::io::{self, Read, Write};
use std::os::fd::AsRawFd;
use std::process;

use nix::sys::wait::waitpid;
use nix::unistd::{fork, pipe, setsid, ForkResult, Pid};
use tracing::debug;

use super::DaemonError;

/// Requests the privileged operation.
const REQ_PCALL: u8 = 1;

/// Tells the helper startup is complete.
const REQ_FINISH: u8 = 2;

/// Acknowledges a finished privileged operation.
const ACK: u8 = 0;

//------------ PrivilegedOp --------------------------------------------------

/// The operation executed with the original privileges.
pub trait PrivilegedOp {
    fn call(&mut self);
}

//------------ HelperLink ----------------------------------------------------

/// The daemon’s end of the connection to the helper.
#[derive(Debug)]
pub struct HelperLink {
    requests: File,
    acks: File,

    /// The helper process if it is our child.
    helper: Option<Pid>,
}

impl HelperLink {
    /// Executes the privileged operation in the helper and waits for it.
    pub fn pcall(&mut self) -> Result<(), DaemonError> {
        self.requests
            .write_all(&[REQ_PCALL])
            .map_err(DaemonError::Helper)?;
        let mut ack = [0u8];
        self.acks.read_exact(&mut ack).map_err(DaemonError::Helper)?;
        if ack[0] != ACK {
            return Err(DaemonError::Helper(io::Error::new(
                io::ErrorKind::InvalidData,
                "unexpected reply",
            )));
        }
        Ok(())
    }

    /// Reports successful startup and lets the helper exit.
    pub fn finish(mut self) -> Result<(), DaemonError> {
        self.requests
            .write_all(&[REQ_FINISH])
            .map_err(DaemonError::Helper)?;
        if let Some(pid) = self.helper {
            waitpid(pid, None).map_err(DaemonError::sys("waitpid"))?;
        }
        debug!("Privileged helper finished");
        Ok(())
    }
}

//------------ fork_with_helper ----------------------------------------------

/// Forks into daemon and helper process.
///
/// Returns in the daemon process only. The helper serves requests for `op`
/// until the daemon finishes or goes away and then exits.
///
/// Must be called while the process has a single thread.
pub fn fork_with_helper(
    mut op: impl PrivilegedOp,
    background: bool,
) -> Result<HelperLink, DaemonError> {
    let (req_read, req_write) = pipe().map_err(DaemonError::sys("pipe"))?;
    let (ack_read, ack_write) = pipe().map_err(DaemonError::sys("pipe"))?;

    // SAFETY: The caller guarantees that there are no other threads.
    let first = unsafe { fork() }.map_err(DaemonError::sys("fork"))?;
    if background {
        if let ForkResult::Parent { child } = first {
            drop((req_write, ack_read));
            // The intermediate child exits right away.
            let _ = waitpid(child, None);
            serve_helper(&mut op, File::from(req_read), File::from(ack_write))
        }
        setsid().map_err(DaemonError::sys("setsid"))?;
        // SAFETY: Still single-threaded.
        let second = unsafe { fork() }.map_err(DaemonError::sys("fork"))?;
        if let ForkResult::Parent { .. } = second {
            // SAFETY: Exits without running any destructors of the state
            // shared with the other processes.
            unsafe { libc::_exit(0) }
        }
        detach_stdio()?;
        drop((req_read, ack_write));
        Ok(HelperLink {
            requests: File::from(req_write),
            acks: File::from(ack_read),
            helper: None,
        })
    } else {
        match first {
            ForkResult::Parent { child } => {
                drop((req_read, ack_write));
                Ok(HelperLink {
                    requests: File::from(req_write),
                    acks: File::from(ack_read),
                    helper: Some(child),
                })
            }
            ForkResult::Child => {
                drop((req_write, ack_read));
                serve_helper(
                    &mut op,
                    File::from(req_read),
                    File::from(ack_write),
                )
            }
        }
    }
}

fn serve_helper(op: &mut impl PrivilegedOp, requests: File, acks: File) -> ! {
    process::exit(serve_requests(op, requests, acks))
}

/// Answers requests until told to finish.
///
/// Returns the exit code for the helper: zero if the daemon finished, one
/// if it went away without.
fn serve_requests(
    op: &mut impl PrivilegedOp,
    mut requests: impl Read,
    mut acks: impl Write,
) -> i32 {
    let mut byte = [0u8];
    loop {
        match requests.read(&mut byte) {
            Ok(0) => return 1,
            Ok(_) => {}
            Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
            Err(_) => return 1,
        }
        match byte[0] {
            REQ_PCALL => {
                op.call();
                if acks.write_all(&[ACK]).is_err() {
                    return 1;
                }
            }
            REQ_FINISH => return 0,
            _ => return 1,
        }
    }
}

/// Points standard input, output, and error to `/dev/null`.
fn detach_stdio() -> Result<(), DaemonError> {
    let null = OpenOptions::new()
        .read(true)
        .write(true)
        .open("/dev/null")
        .map_err(DaemonError::Helper)?;
    for fd in 0..3 {
        // SAFETY: Both descriptors are valid.
        if unsafe { libc::dup2(null.as_raw_fd(), fd) } < 0 {
            return Err(DaemonError::Helper(io::Error::last_os_error()));
        }
    }
    Ok(())
}

//============ Testing =======================================================

#[cfg(test)]
mod test {
    use super::*;
    use std::thread;

    struct Count(usize);

    impl PrivilegedOp for Count {
        fn call(&mut self) {
            self.0 += 1;
        }
    }

    fn link() -> (HelperLink, thread::JoinHandle<(i32, usize)>) {
        let (req_read, req_write) = pipe().unwrap();
        let (ack_read, ack_write) = pipe().unwrap();
        let handle = thread::spawn(move || {
            let mut op = Count(0);
            let code = serve_requests(
                &mut op,
                File::from(req_read),
                File::from(ack_write),
            );
            (code, op.0)
        });
        let link = HelperLink {
            requests: File::from(req_write),
            acks: File::from(ack_read),
            helper: None,
        };
        (link, handle)
    }

    #[test]
    fn pcall_then_finish() {
        let (mut link, handle) = link();
        link.pcall().unwrap();
        link.pcall().unwrap();
        link.finish().unwrap();
        assert_eq!(handle.join().unwrap(), (0, 2));
    }

    #[test]
    fn daemon_going_away_fails_helper() {
        let (mut link, handle) = link();
        link.pcall().unwrap();
        drop(link);
        assert_eq!(handle.join().unwrap(), (1, 1));
    }
}
