//! An authoritative DNS server.
//!
//! The server answers queries for the zones it is authoritative for from an
//! in-memory zone tree that can be updated while lookups are going on. It
//! can replace a running instance of itself without dropping queries.
//!
//! # Modules
//!
//! * [base] contains domain names and the few IANA values used,
//! * [zonetree] holds the zone data and its lock-free readers,
//! * [zsrc] loads zone data into the tree and keeps it current,
//! * [net] has the listening sockets, the query path, and the socket
//!   takeover protocol,
//! * [daemon] deals with the process itself: pidfile, forking, and
//!   privileges, and
//! * [server] ties all of it together.
//!
//! The binary is a thin wrapper around [`server::run`].

pub mod base;
pub mod config;
pub mod daemon;
pub mod error;
pub mod logging;
pub mod net;
pub mod plugins;
pub mod server;
pub mod stats;
pub mod zonetree;
pub mod zsrc;

pub use self::error::Error;
