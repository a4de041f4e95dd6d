//! Per-worker statistics.
//!
//! Every listener thread publishes a [`WorkerStats`] with the registry
//! before it starts serving. The main thread waits for all of them to
//! arrive before it declares startup complete, and logs totals
//! periodically and at shutdown.

use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tracing::info;

use crate::base::Rcode;

//------------ Transport -----------------------------------------------------

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Transport {
    Udp,
    Tcp,
}

impl fmt::Display for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Transport::Udp => "UDP",
            Transport::Tcp => "TCP",
        })
    }
}

//------------ WorkerStats ---------------------------------------------------

/// The counters of a single listener thread.
#[derive(Debug)]
pub struct WorkerStats {
    transport: Transport,
    addr: SocketAddr,
    noerror: AtomicU64,
    refused: AtomicU64,
    nxdomain: AtomicU64,
    notimp: AtomicU64,
    formerr: AtomicU64,
    servfail: AtomicU64,
    dropped: AtomicU64,
    connections: AtomicU64,
}

impl WorkerStats {
    pub fn new(transport: Transport, addr: SocketAddr) -> Self {
        WorkerStats {
            transport,
            addr,
            noerror: AtomicU64::new(0),
            refused: AtomicU64::new(0),
            nxdomain: AtomicU64::new(0),
            notimp: AtomicU64::new(0),
            formerr: AtomicU64::new(0),
            servfail: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
            connections: AtomicU64::new(0),
        }
    }

    pub fn transport(&self) -> Transport {
        self.transport
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Counts a response with the given rcode.
    pub fn record(&self, rcode: Rcode) {
        let counter = match rcode {
            Rcode::NoError => &self.noerror,
            Rcode::Refused => &self.refused,
            Rcode::NXDomain => &self.nxdomain,
            Rcode::NotImp => &self.notimp,
            Rcode::FormErr => &self.formerr,
            Rcode::ServFail => &self.servfail,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Counts a request that got no response at all.
    pub fn record_dropped(&self) {
        self.dropped.fetch_add(1, Ordering::Relaxed);
    }

    /// Counts an accepted TCP connection.
    pub fn record_connection(&self) {
        self.connections.fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self) -> Totals {
        let load = |counter: &AtomicU64| counter.load(Ordering::Relaxed);
        Totals {
            noerror: load(&self.noerror),
            refused: load(&self.refused),
            nxdomain: load(&self.nxdomain),
            notimp: load(&self.notimp),
            formerr: load(&self.formerr),
            servfail: load(&self.servfail),
            dropped: load(&self.dropped),
            connections: load(&self.connections),
        }
    }
}

//------------ Totals --------------------------------------------------------

/// Counter values summed over a set of workers.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct Totals {
    pub noerror: u64,
    pub refused: u64,
    pub nxdomain: u64,
    pub notimp: u64,
    pub formerr: u64,
    pub servfail: u64,
    pub dropped: u64,
    pub connections: u64,
}

impl Totals {
    /// The number of answered queries.
    pub fn answered(&self) -> u64 {
        self.noerror
            + self.refused
            + self.nxdomain
            + self.notimp
            + self.formerr
            + self.servfail
    }

    fn add(&mut self, other: Totals) {
        self.noerror += other.noerror;
        self.refused += other.refused;
        self.nxdomain += other.nxdomain;
        self.notimp += other.notimp;
        self.formerr += other.formerr;
        self.servfail += other.servfail;
        self.dropped += other.dropped;
        self.connections += other.connections;
    }
}

impl fmt::Display for Totals {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "noerror:{} refused:{} nxdomain:{} notimp:{} formerr:{} \
             servfail:{} dropped:{} tcp_conns:{}",
            self.noerror,
            self.refused,
            self.nxdomain,
            self.notimp,
            self.formerr,
            self.servfail,
            self.dropped,
            self.connections
        )
    }
}

//------------ StatsRegistry -------------------------------------------------

/// The statistics of all listener threads.
#[derive(Debug)]
pub struct StatsRegistry {
    expected: usize,
    workers: Mutex<Vec<Arc<WorkerStats>>>,
    published: Condvar,
    started: Instant,
}

impl StatsRegistry {
    /// Creates a registry waiting for `expected` workers.
    pub fn new(expected: usize) -> Self {
        StatsRegistry {
            expected,
            workers: Mutex::new(Vec::with_capacity(expected)),
            published: Condvar::new(),
            started: Instant::now(),
        }
    }

    /// Adds the statistics of a worker that is about to start serving.
    pub fn publish(&self, stats: WorkerStats) -> Arc<WorkerStats> {
        let stats = Arc::new(stats);
        self.workers.lock().push(stats.clone());
        self.published.notify_all();
        stats
    }

    /// Waits until all expected workers have published their statistics.
    ///
    /// Returns whether they did before `timeout` passed.
    pub fn wait_ready(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut workers = self.workers.lock();
        while workers.len() < self.expected {
            if self.published.wait_until(&mut workers, deadline).timed_out() {
                return workers.len() >= self.expected;
            }
        }
        true
    }

    pub fn published(&self) -> usize {
        self.workers.lock().len()
    }

    pub fn totals(&self) -> Totals {
        let mut res = Totals::default();
        for worker in self.workers.lock().iter() {
            res.add(worker.snapshot());
        }
        res
    }

    pub fn uptime(&self) -> Duration {
        self.started.elapsed()
    }

    pub fn log_uptime(&self) {
        info!("Uptime: {}", FormatUptime(self.uptime()));
    }

    pub fn log_stats(&self) {
        let workers = self.workers.lock().clone();
        for worker in &workers {
            let totals = worker.snapshot();
            if totals.answered() > 0 || totals.dropped > 0 {
                info!(
                    "{} {}: {totals}",
                    worker.transport(),
                    worker.addr()
                );
            }
        }
        info!("Totals: {}", self.totals());
    }
}

//------------ FormatUptime --------------------------------------------------

struct FormatUptime(Duration);

impl fmt::Display for FormatUptime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let secs = self.0.as_secs();
        let (days, secs) = (secs / 86400, secs % 86400);
        let (hours, secs) = (secs / 3600, secs % 3600);
        let (mins, secs) = (secs / 60, secs % 60);
        if days > 0 {
            write!(f, "{days}d ")?;
        }
        write!(f, "{hours:02}:{mins:02}:{secs:02}")
    }
}

//============ Testing =======================================================
