//! Zone related errors.

use crate::base::Name;

//------------ ZoneError -----------------------------------------------------

/// A zone could not be finalized.
#[derive(Debug, thiserror::Error)]
pub enum ZoneError {
    /// The content failed structural validation.
    #[error("invalid zone data: {0}")]
    Invalid(String),

    /// Strict data checking is on and the zone has no serial.
    #[error("zone has neither an SOA serial nor a modification time")]
    NoSerial,
}

//------------ ZoneTreeError -------------------------------------------------

/// The zone tree could not be modified.
#[derive(Debug, thiserror::Error)]
pub enum ZoneTreeError {
    /// The same source already published this version of the zone.
    #[error("zone {apex} from {origin} is unchanged")]
    Unchanged { apex: Name, origin: String },

    /// There is no zone from the given source at the given apex.
    #[error("zone {apex} from {origin} does not exist")]
    NotFound { apex: Name, origin: String },
}
