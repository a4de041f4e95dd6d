//! Parameters registered with IANA that the server front end needs.

//------------ Rcode ---------------------------------------------------------

/// DNS response codes.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum Rcode {
    NoError,
    FormErr,
    ServFail,
    NXDomain,
    NotImp,
    Refused,
}

impl Rcode {
    /// Returns the integer value of the code in the message header.
    pub fn to_int(self) -> u8 {
        match self {
            Rcode::NoError => 0,
            Rcode::FormErr => 1,
            Rcode::ServFail => 2,
            Rcode::NXDomain => 3,
            Rcode::NotImp => 4,
            Rcode::Refused => 5,
        }
    }
}

//------------ Rtype and Class -----------------------------------------------

pub const RTYPE_TXT: u16 = 16;

/// The query type asking for a zone transfer.
pub const RTYPE_AXFR: u16 = 252;

/// The query type asking for all records.
pub const RTYPE_ANY: u16 = 255;

/// The Internet class.
pub const CLASS_IN: u16 = 1;

/// The CHAOS class.
pub const CLASS_CH: u16 = 3;
