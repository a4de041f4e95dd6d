//! Basic DNS data handling.
//!
//! This module provides the domain name type used throughout the crate as
//! the key of the zone tree and the subject of lookups, plus the handful of
//! registered parameters the server front end needs.

pub mod iana;
pub mod name;

pub use self::iana::Rcode;
pub use self::name::{Name, NameError};
