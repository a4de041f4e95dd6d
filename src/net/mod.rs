//! Listening sockets and serving queries on them.
//!
//! [`socks`] creates and binds the sockets, [`takeover`] acquires them when
//! a predecessor may still hold the addresses, and [`dnsio`] runs the
//! listener threads.

pub mod dnsio;
pub mod socks;
pub mod takeover;
