//! Running the binary.

use std::fs;
use std::net::{SocketAddr, TcpListener, UdpSocket};
use std::os::unix::process::ExitStatusExt;
use std::path::Path;
use std::process::{Child, Command, Output, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use authd::daemon::Pidfile;
use tempfile::TempDir;

fn authd(root: &Path, args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_authd"))
        .arg("-d")
        .arg(root)
        .args(args)
        .stdin(Stdio::null())
        .output()
        .unwrap()
}

fn code(root: &Path, args: &[&str]) -> i32 {
    authd(root, args).status.code().unwrap()
}

fn free_addr() -> SocketAddr {
    for _ in 0..32 {
        let udp = UdpSocket::bind("127.0.0.1:0").unwrap();
        let addr = udp.local_addr().unwrap();
        if TcpListener::bind(addr).is_ok() {
            return addr;
        }
    }
    panic!("no free port");
}

/// Creates a root directory serving `example.test` on `addr`.
fn setup(addr: SocketAddr) -> TempDir {
    let root = tempfile::tempdir().unwrap();
    let etc = root.path().join("etc");
    fs::create_dir_all(etc.join("zones")).unwrap();
    fs::write(
        etc.join("config.toml"),
        format!("listen = [\"{addr}\"]\nzones_rescan_interval = 0\n"),
    )
    .unwrap();
    fs::write(etc.join("zones/example.test"), "zone data").unwrap();
    root
}

fn spawn(root: &Path, action: &str) -> Child {
    Command::new(env!("CARGO_BIN_EXE_authd"))
        .arg("-f")
        .arg("-d")
        .arg(root)
        .arg(action)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()
        .unwrap()
}

/// Waits until `status` reports the given process as running.
fn wait_running(root: &Path, pid: u32) {
    let deadline = Instant::now() + Duration::from_secs(20);
    loop {
        let output = authd(root, &["status"]);
        let stderr = String::from_utf8_lossy(&output.stderr);
        if output.status.code() == Some(0)
            && stderr.contains(&format!("pid {pid}"))
        {
            return;
        }
        assert!(Instant::now() < deadline, "server did not come up");
        thread::sleep(Duration::from_millis(50));
    }
}

fn wait_exit(child: &mut Child) -> std::process::ExitStatus {
    let deadline = Instant::now() + Duration::from_secs(20);
    loop {
        if let Some(status) = child.try_wait().unwrap() {
            return status;
        }
        assert!(Instant::now() < deadline, "server did not exit");
        thread::sleep(Duration::from_millis(50));
    }
}

/// Sends an A query for `qname` and returns the flags and rcode.
fn query(addr: SocketAddr, qname: &str) -> (u16, u8) {
    let mut msg = vec![0x12, 0x34, 0x01, 0x00, 0, 1, 0, 0, 0, 0, 0, 0];
    for label in qname.split('.') {
        msg.push(label.len() as u8);
        msg.extend_from_slice(label.as_bytes());
    }
    msg.extend_from_slice(&[0, 0, 1, 0, 1]);

    let socket = UdpSocket::bind("127.0.0.1:0").unwrap();
    socket
        .set_read_timeout(Some(Duration::from_secs(2)))
        .unwrap();
    socket.send_to(&msg, addr).unwrap();
    let mut buf = [0u8; 512];
    let (len, _) = socket.recv_from(&mut buf).unwrap();
    assert!(len >= 12);
    assert_eq!(&buf[..2], &[0x12, 0x34]);
    let flags = u16::from_be_bytes([buf[2], buf[3]]);
    (flags, (flags & 0x0F) as u8)
}

#[test]
fn not_running() {
    let root = tempfile::tempdir().unwrap();
    assert_eq!(code(root.path(), &["status"]), 3);
    assert_eq!(code(root.path(), &["stop"]), 0);
    assert_eq!(code(root.path(), &["reload"]), 1);
    assert_eq!(code(root.path(), &["condrestart"]), 0);
    assert_eq!(code(root.path(), &["try-restart"]), 0);
}

#[test]
fn usage_errors() {
    let root = tempfile::tempdir().unwrap();
    assert_eq!(code(root.path(), &["explode"]), 2);
    assert_eq!(code(root.path(), &[]), 2);
    assert_eq!(code(root.path(), &["-x", "status"]), 2);
    assert_eq!(code(root.path(), &["STATUS"]), 3);
}

#[test]
fn status_follows_the_lock() {
    let root = tempfile::tempdir().unwrap();
    let path = root.path().join("run/authd.pid");
    let mut pidfile = Pidfile::open(&path).unwrap();
    assert_eq!(code(root.path(), &["status"]), 3);
    pidfile.acquire(false).unwrap();
    assert_eq!(code(root.path(), &["status"]), 0);
    drop(pidfile);
    assert_eq!(code(root.path(), &["status"]), 3);
}

#[test]
fn check_config() {
    let root = setup(free_addr());
    assert_eq!(code(root.path(), &["check-config"]), 0);
    assert_eq!(code(root.path(), &["checkconf"]), 0);

    // Empty zone files are invalid.
    let zone = root.path().join("etc/zones/broken.test");
    fs::write(&zone, "").unwrap();
    assert_eq!(code(root.path(), &["check-config"]), 1);
    fs::remove_file(&zone).unwrap();

    fs::write(root.path().join("etc/config.toml"), "no_such_key = 1\n")
        .unwrap();
    assert_eq!(code(root.path(), &["check-config"]), 1);
}

#[test]
fn serve_restart_and_stop() {
    let addr = free_addr();
    let root = setup(addr);

    let mut first = spawn(root.path(), "start");
    wait_running(root.path(), first.id());

    let (flags, rcode) = query(addr, "www.example.test");
    assert_eq!(rcode, 0);
    assert_ne!(flags & 0x0400, 0, "AA not set");
    assert_eq!(query(addr, "www.other.test").1, 5);

    // A second start fails while the first one runs.
    assert_eq!(code(root.path(), &["-f", "start"]), 1);
    assert_eq!(code(root.path(), &["reload"]), 0);

    // Restart takes over and stops the first instance.
    let mut second = spawn(root.path(), "restart");
    wait_running(root.path(), second.id());
    assert_eq!(wait_exit(&mut first).signal(), Some(libc::SIGTERM));
    assert_eq!(query(addr, "www.example.test").1, 0);

    // With an instance running, condrestart is a restart.
    let mut third = spawn(root.path(), "condrestart");
    wait_running(root.path(), third.id());
    assert_eq!(wait_exit(&mut second).signal(), Some(libc::SIGTERM));
    assert_eq!(query(addr, "www.example.test").1, 0);

    assert_eq!(code(root.path(), &["stop"]), 0);
    assert_eq!(wait_exit(&mut third).signal(), Some(libc::SIGTERM));
    assert_eq!(code(root.path(), &["status"]), 3);
}

#[test]
fn interrupt_ends_by_signal() {
    let addr = free_addr();
    let root = setup(addr);

    let mut child = spawn(root.path(), "start");
    wait_running(root.path(), child.id());
    assert_eq!(query(addr, "www.example.test").1, 0);

    let pid = libc::pid_t::try_from(child.id()).unwrap();
    assert_eq!(unsafe { libc::kill(pid, libc::SIGINT) }, 0);
    assert_eq!(wait_exit(&mut child).signal(), Some(libc::SIGINT));
    assert_eq!(code(root.path(), &["status"]), 3);
}
