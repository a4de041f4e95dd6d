//! The listening sockets.
//!
//! Sockets are created early, before the process forks, but bound only
//! later through the privileged helper. A socket’s bound state is
//! determined from its local address, so binding can be retried for just
//! the sockets that failed.

use std::io;
use std::net::{SocketAddr, TcpListener, UdpSocket};

use socket2::{Domain, Protocol, SockAddr, Socket, Type};
use tracing::{debug, warn};

use crate::config::Config;
use crate::stats::Transport;

//------------ Listener ------------------------------------------------------

/// The UDP and TCP socket for one configured address.
#[derive(Debug)]
pub struct Listener {
    addr: SocketAddr,
    udp: Socket,
    tcp: Socket,
}

impl Listener {
    fn new(
        addr: SocketAddr,
        reuseport: bool,
        udp_recv_buffer: Option<usize>,
    ) -> Result<Self, SocketError> {
        let domain = Domain::for_address(addr);
        let udp = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP))
            .map_err(|err| SocketError::create(Transport::Udp, addr, err))?;
        let tcp = Socket::new(domain, Type::STREAM, Some(Protocol::TCP))
            .map_err(|err| SocketError::create(Transport::Tcp, addr, err))?;

        configure(&udp, addr, Transport::Udp, reuseport)
            .map_err(|err| SocketError::create(Transport::Udp, addr, err))?;
        configure(&tcp, addr, Transport::Tcp, reuseport)
            .map_err(|err| SocketError::create(Transport::Tcp, addr, err))?;

        if let Some(size) = udp_recv_buffer {
            if let Err(err) = udp.set_recv_buffer_size(size) {
                warn!(
                    "Cannot set UDP receive buffer of {addr} to {size}: {err}"
                );
            }
        }
        Ok(Listener { addr, udp, tcp })
    }

    /// The configured address.
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Returns the address a socket is bound to, if it is bound.
    pub fn bound_addr(&self, transport: Transport) -> Option<SocketAddr> {
        let addr = self.socket(transport).local_addr().ok()?.as_socket()?;
        (addr.port() != 0).then_some(addr)
    }

    fn socket(&self, transport: Transport) -> &Socket {
        match transport {
            Transport::Udp => &self.udp,
            Transport::Tcp => &self.tcp,
        }
    }

    /// Binds a socket unless it is bound already.
    fn bind(&self, transport: Transport) -> io::Result<()> {
        if self.bound_addr(transport).is_some() {
            return Ok(());
        }
        self.socket(transport).bind(&SockAddr::from(self.addr))
    }

    /// Returns a handle to the UDP socket for a worker.
    pub fn udp_socket(&self) -> io::Result<UdpSocket> {
        Ok(self.udp.try_clone()?.into())
    }

    /// Starts listening and returns a handle to the TCP socket.
    pub fn tcp_listener(&self, backlog: i32) -> io::Result<TcpListener> {
        self.tcp.listen(backlog)?;
        Ok(self.tcp.try_clone()?.into())
    }
}

fn configure(
    socket: &Socket,
    addr: SocketAddr,
    transport: Transport,
    reuseport: bool,
) -> io::Result<()> {
    if addr.is_ipv6() {
        socket.set_only_v6(true)?;
    }
    if transport == Transport::Tcp {
        socket.set_reuse_address(true)?;
    }
    if reuseport {
        socket.set_reuse_port(true)?;
    }
    Ok(())
}

//------------ ListenerSet ---------------------------------------------------

/// All listening sockets of the server.
#[derive(Debug)]
pub struct ListenerSet {
    listeners: Vec<Listener>,
}

impl ListenerSet {
    /// Creates unbound sockets for all configured addresses.
    pub fn create(config: &Config) -> Result<Self, SocketError> {
        Self::with_addrs(
            &config.listen,
            config.reuseport,
            config.udp_recv_buffer,
        )
    }

    pub fn with_addrs(
        addrs: &[SocketAddr],
        reuseport: bool,
        udp_recv_buffer: Option<usize>,
    ) -> Result<Self, SocketError> {
        let listeners = addrs
            .iter()
            .map(|addr| Listener::new(*addr, reuseport, udp_recv_buffer))
            .collect::<Result<_, _>>()?;
        Ok(ListenerSet { listeners })
    }

    pub fn listeners(&self) -> &[Listener] {
        &self.listeners
    }

    /// The number of listener threads needed to serve all sockets.
    pub fn thread_count(&self) -> usize {
        self.listeners.len() * 2
    }

    /// Tries to bind all sockets that aren’t bound yet.
    ///
    /// Failures are only logged. Returns the number of sockets that failed.
    pub fn bind_all(&self) -> usize {
        let mut failed = 0;
        for listener in &self.listeners {
            for transport in [Transport::Udp, Transport::Tcp] {
                match listener.bind(transport) {
                    Ok(()) => {
                        debug!("Bound {transport} socket {}", listener.addr)
                    }
                    Err(err) => {
                        debug!(
                            "Binding {transport} socket {} failed: {err}",
                            listener.addr
                        );
                        failed += 1;
                    }
                }
            }
        }
        failed
    }

    /// Checks that all sockets are bound.
    ///
    /// With `soft`, unbound sockets are reported via the return value,
    /// which is `true` if any socket isn’t bound. Otherwise the first
    /// unbound socket is an error.
    pub fn check_all(&self, soft: bool) -> Result<bool, SocketError> {
        let mut any_failed = false;
        for listener in &self.listeners {
            for transport in [Transport::Udp, Transport::Tcp] {
                if listener.bound_addr(transport).is_some() {
                    continue;
                }
                if !soft {
                    return Err(SocketError::NotBound {
                        transport,
                        addr: listener.addr,
                    });
                }
                warn!(
                    "Could not bind {transport} socket {}, will retry \
                     after stopping the running instance",
                    listener.addr
                );
                any_failed = true;
            }
        }
        Ok(any_failed)
    }
}

//============ Error Types ===================================================

#[derive(Debug, thiserror::Error)]
pub enum SocketError {
    #[error("cannot create {transport} socket for {addr}: {source}")]
    Create {
        transport: Transport,
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    #[error("failed to bind {transport} socket {addr}")]
    NotBound {
        transport: Transport,
        addr: SocketAddr,
    },
}

impl SocketError {
    fn create(
        transport: Transport,
        addr: SocketAddr,
        source: io::Error,
    ) -> Self {
        SocketError::Create {
            transport,
            addr,
            source,
        }
    }
}

//============ Testing =======================================================

#[cfg(test)]
mod test {
    use super::*;

    fn local() -> SocketAddr {
        "127.0.0.1:0".parse().unwrap()
    }

    #[test]
    fn sockets_start_unbound() {
        let set = ListenerSet::with_addrs(&[local()], true, None).unwrap();
        assert_eq!(set.thread_count(), 2);
        assert!(set.listeners()[0].bound_addr(Transport::Udp).is_none());
        assert!(set.check_all(true).unwrap());
        assert!(matches!(
            set.check_all(false),
            Err(SocketError::NotBound { .. })
        ));
    }

    #[test]
    fn bind_all_binds_everything() {
        let set =
            ListenerSet::with_addrs(&[local()], true, Some(65536)).unwrap();
        assert_eq!(set.bind_all(), 0);
        assert!(!set.check_all(false).unwrap());
        let listener = &set.listeners()[0];
        let udp = listener.bound_addr(Transport::Udp).unwrap();
        assert!(udp.ip().is_loopback());
        assert_ne!(udp.port(), 0);

        // Binding again leaves the sockets alone.
        assert_eq!(set.bind_all(), 0);
        assert_eq!(listener.bound_addr(Transport::Udp), Some(udp));
    }

    #[test]
    fn occupied_address_fails_softly() {
        let taken = std::net::UdpSocket::bind(local()).unwrap();
        let addr = taken.local_addr().unwrap();
        let set = ListenerSet::with_addrs(&[addr], false, None).unwrap();
        assert!(set.bind_all() >= 1);
        assert!(set.check_all(true).unwrap());
        assert!(set.check_all(false).is_err());

        drop(taken);
        set.bind_all();
        assert!(!set.check_all(false).unwrap());
    }

    #[test]
    fn worker_handles_share_the_socket() {
        let set = ListenerSet::with_addrs(&[local()], true, None).unwrap();
        set.bind_all();
        let listener = &set.listeners()[0];
        let udp = listener.udp_socket().unwrap();
        assert_eq!(
            udp.local_addr().unwrap(),
            listener.bound_addr(Transport::Udp).unwrap()
        );
        let tcp = listener.tcp_listener(16).unwrap();
        assert_eq!(
            tcp.local_addr().unwrap(),
            listener.bound_addr(Transport::Tcp).unwrap()
        );
    }
}
