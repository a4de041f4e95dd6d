//! Taking over listening sockets from a predecessor on the same host.

use std::net::{SocketAddr, TcpListener, UdpSocket};

use authd::net::socks::ListenerSet;
use authd::net::takeover::{acquire_sockets, Takeover, TakeoverPath};
use authd::stats::Transport;
use authd::Error;

/// Finds a port free for both UDP and TCP on localhost.
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

/// A new instance with a predecessor holding the same address.
struct Successor {
    sockets: ListenerSet,
    predecessor: Option<ListenerSet>,
    steps: Vec<&'static str>,
}

impl Successor {
    fn new(addr: SocketAddr, predecessor: ListenerSet) -> Self {
        Successor {
            sockets: ListenerSet::with_addrs(&[addr], true, None).unwrap(),
            predecessor: Some(predecessor),
            steps: Vec::new(),
        }
    }

    fn bound(&self) -> bool {
        let listener = &self.sockets.listeners()[0];
        listener.bound_addr(Transport::Udp).is_some()
            && listener.bound_addr(Transport::Tcp).is_some()
    }
}

impl Takeover for Successor {
    fn bind_all(&mut self) -> Result<(), Error> {
        self.steps.push("bind");
        self.sockets.bind_all();
        Ok(())
    }

    fn check_all(&mut self, soft: bool) -> Result<bool, Error> {
        self.steps.push("check");
        Ok(self.sockets.check_all(soft)?)
    }

    fn replace_predecessor(&mut self) -> Result<(), Error> {
        self.steps.push("replace");
        self.predecessor = None;
        Ok(())
    }
}

fn predecessor(addr: SocketAddr, reuseport: bool) -> ListenerSet {
    let set = ListenerSet::with_addrs(&[addr], reuseport, None).unwrap();
    assert_eq!(set.bind_all(), 0);
    set.listeners()[0].tcp_listener(16).unwrap();
    set
}

#[test]
fn shared_port_overlaps_with_predecessor() {
    let addr = free_addr();
    let mut new = Successor::new(addr, predecessor(addr, true));

    let pending = acquire_sockets(&mut new).unwrap();
    assert_eq!(pending.path(), TakeoverPath::Overlap);
    assert!(new.bound());
    assert!(new.predecessor.is_some());
    assert_eq!(new.steps, ["bind", "check"]);

    pending.finish(&mut new).unwrap();
    assert!(new.predecessor.is_none());
    assert_eq!(new.steps, ["bind", "check", "replace"]);
    assert_eq!(
        new.sockets.listeners()[0].bound_addr(Transport::Udp),
        Some(addr)
    );
}

#[test]
fn exclusive_predecessor_is_replaced_first() {
    let addr = free_addr();
    let mut new = Successor::new(addr, predecessor(addr, false));

    let pending = acquire_sockets(&mut new).unwrap();
    assert_eq!(pending.path(), TakeoverPath::Replaced);
    assert!(new.bound());
    assert_eq!(new.steps, ["bind", "check", "replace", "bind", "check"]);

    // There is nothing left to replace.
    pending.finish(&mut new).unwrap();
    assert_eq!(new.steps.len(), 5);
}

#[test]
fn foreign_holder_makes_retry_fatal() {
    let addr = free_addr();
    let mut new = Successor::new(addr, predecessor(addr, false));
    // Somebody other than the predecessor holds the UDP port.
    let squatter = new.predecessor.take().unwrap();

    let err = acquire_sockets(&mut new).unwrap_err();
    assert!(matches!(err, Error::Socket(_)));
    assert_eq!(new.steps, ["bind", "check", "replace", "bind", "check"]);
    drop(squatter);
}
