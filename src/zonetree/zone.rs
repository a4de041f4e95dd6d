//! Zone records and their lifecycle.
//!
//! A zone enters the tree in two steps. A zone source first creates a
//! [`ZoneBuilder`] for the apex, fills in the content and, optionally, the
//! modification time and serial. It then calls [`ZoneBuilder::finalize`],
//! which fixes the serial and validates the content, producing an
//! immutable [`ZoneRecord`] that can be inserted into a
//! [`ZoneTree`][super::ZoneTree].
//!
//! # Serial precedence
//!
//! During finalization the following rules are applied in order:
//!
//! 1. If the content’s authority record has a non-zero serial, that value
//!    becomes the zone’s serial and the modification time is ignored.
//! 2. Otherwise, if the modification time is non-zero, a serial is derived
//!    from it via [`serial_from_mtime`] and written to both the zone and
//!    its authority record.
//! 3. Otherwise both stay zero.
//!
//! The zone level serial is what gets logged when a zone is loaded.

use core::fmt;

use time::OffsetDateTime;

use crate::base::Name;

use super::answer::Answer;
use super::error::ZoneError;

//------------ ZoneContent ---------------------------------------------------

/// The data of a zone below the apex.
///
/// The record tree of a zone is produced by its zone source and opaque to
/// the zone tree. The tree only needs to reach the serial of the top-level
/// authority record, ask the content to check itself, and let it answer
/// questions once the zone is live.
pub trait ZoneContent: fmt::Debug + Send + Sync + 'static {
    /// Returns the serial of the apex SOA record or zero if unset.
    fn authority_serial(&self) -> u32;

    /// Updates the serial of the apex SOA record.
    fn set_authority_serial(&mut self, serial: u32);

    /// Checks the structure of the content.
    fn validate(&self, apex: &Name) -> Result<(), ZoneError>;

    /// Answers a question for a name within the zone.
    ///
    /// `auth_depth` is the offset into the wire format of `qname` where
    /// the apex starts. The default answer is empty.
    fn answer(&self, qname: &Name, qtype: u16, auth_depth: usize) -> Answer {
        let _ = (qname, qtype, auth_depth);
        Answer::new(crate::base::Rcode::NoError)
    }
}

//------------ ZoneBuilder ---------------------------------------------------

/// A zone that is still being assembled by its source.
#[derive(Debug)]
pub struct ZoneBuilder {
    apex: Name,
    hash: u64,
    source: String,
    mtime: u64,
    serial: u32,
    digest: u64,
    content: Box<dyn ZoneContent>,
}

impl ZoneBuilder {
    /// Creates a new zone with zero mtime and serial.
    pub fn new(
        apex: Name,
        source: impl Into<String>,
        content: impl ZoneContent,
    ) -> Self {
        ZoneBuilder {
            hash: apex.hash64(),
            apex,
            source: source.into(),
            mtime: 0,
            serial: 0,
            digest: 0,
            content: Box::new(content),
        }
    }

    pub fn apex(&self) -> &Name {
        &self.apex
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    /// Sets the effective modification time in seconds since the epoch.
    pub fn set_mtime(&mut self, mtime: u64) {
        self.mtime = mtime
    }

    /// Sets the zone serial.
    ///
    /// The value is overridden by finalization if the content carries an
    /// authority serial or a modification time is set.
    pub fn set_serial(&mut self, serial: u32) {
        self.serial = serial
    }

    /// Sets a fingerprint of the data the content was built from.
    ///
    /// Zones with equal serial and mtime but different digests count as
    /// changed.
    pub fn set_digest(&mut self, digest: u64) {
        self.digest = digest
    }

    pub fn content_mut(&mut self) -> &mut dyn ZoneContent {
        self.content.as_mut()
    }

    /// Fixes the serial, validates the content, and freezes the zone.
    ///
    /// With `strict_data`, a zone that ends up without any serial is
    /// rejected.
    pub fn finalize(
        mut self,
        strict_data: bool,
    ) -> Result<ZoneRecord, ZoneError> {
        let soa_serial = self.content.authority_serial();
        if soa_serial != 0 {
            self.serial = soa_serial;
        } else if self.mtime != 0 {
            self.serial = serial_from_mtime(self.mtime);
            self.content.set_authority_serial(self.serial);
        }
        self.content.validate(&self.apex)?;
        if strict_data && self.serial == 0 {
            return Err(ZoneError::NoSerial);
        }
        Ok(ZoneRecord {
            apex: self.apex,
            hash: self.hash,
            source: self.source,
            mtime: self.mtime,
            serial: self.serial,
            digest: self.digest,
            content: self.content,
        })
    }
}

//------------ ZoneRecord ----------------------------------------------------

/// The finalized data of a single zone.
///
/// A zone record never changes once finalized. It is dropped when the last
/// tree version referencing it has been reclaimed.
#[derive(Debug)]
pub struct ZoneRecord {
    apex: Name,
    hash: u64,
    source: String,
    mtime: u64,
    serial: u32,
    digest: u64,
    content: Box<dyn ZoneContent>,
}

impl ZoneRecord {
    pub fn apex(&self) -> &Name {
        &self.apex
    }

    /// The keyed hash of the apex name.
    pub fn hash(&self) -> u64 {
        self.hash
    }

    /// A description of where the zone came from, e.g., `dir:example.com`.
    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn mtime(&self) -> u64 {
        self.mtime
    }

    pub fn serial(&self) -> u32 {
        self.serial
    }

    pub fn digest(&self) -> u64 {
        self.digest
    }

    pub fn content(&self) -> &dyn ZoneContent {
        self.content.as_ref()
    }

    /// Returns whether `other` carries the same data version.
    pub(super) fn is_unchanged(&self, other: &ZoneRecord) -> bool {
        self.serial == other.serial
            && self.mtime == other.mtime
            && self.digest == other.digest
    }
}

//------------ serial_from_mtime ---------------------------------------------

/// Derives a zone serial from a modification time.
///
/// The serial has the form `YYYYMMDDHH` of the time in UTC. Times the
/// calendar can’t represent fall back to the low 32 bits of the seconds.
pub fn serial_from_mtime(mtime: u64) -> u32 {
    let time = i64::try_from(mtime)
        .ok()
        .and_then(|secs| OffsetDateTime::from_unix_timestamp(secs).ok());
    match time {
        Some(time) => {
            let value = u64::try_from(time.year()).unwrap_or(0) * 1_000_000
                + u64::from(u8::from(time.month())) * 10_000
                + u64::from(time.day()) * 100
                + u64::from(time.hour());
            // Only years past 4294 wrap.
            value as u32
        }
        None => mtime as u32,
    }
}

//============ Testing =======================================================

#[cfg(test)]
pub(crate) mod test {
    use super::*;
    use core::str::FromStr;
    use rstest::rstest;

    /// Content for tests with a settable SOA serial.
    #[derive(Debug, Default)]
    pub struct TestContent {
        pub soa_serial: u32,
        pub broken: bool,
    }

    impl ZoneContent for TestContent {
        fn authority_serial(&self) -> u32 {
            self.soa_serial
        }

        fn set_authority_serial(&mut self, serial: u32) {
            self.soa_serial = serial
        }

        fn validate(&self, apex: &Name) -> Result<(), ZoneError> {
            if self.broken {
                Err(ZoneError::Invalid(format!("{apex}: broken on purpose")))
            } else {
                Ok(())
            }
        }
    }

    pub fn mk_zone(apex: &str, source: &str, mtime: u64) -> ZoneRecord {
        let mut zone = ZoneBuilder::new(
            Name::from_str(apex).unwrap(),
            source,
            TestContent::default(),
        );
        zone.set_mtime(mtime);
        zone.finalize(false).unwrap()
    }

    #[test]
    fn serial_from_known_mtime() {
        // 2023-11-14T22:13:20Z
        assert_eq!(serial_from_mtime(1_700_000_000), 2023111422);
        assert_eq!(serial_from_mtime(0), 1970010100);
    }

    #[rstest]
    #[case::soa_serial_wins(5, 0, 5, 5)]
    #[case::soa_serial_ignores_mtime(5, 1_700_000_000, 5, 5)]
    #[case::mtime_serial(0, 1_700_000_000, 2023111422, 2023111422)]
    #[case::no_serial(0, 0, 0, 0)]
    fn serial_precedence(
        #[case] soa_serial: u32,
        #[case] mtime: u64,
        #[case] zone_serial: u32,
        #[case] content_serial: u32,
    ) {
        let mut zone = ZoneBuilder::new(
            Name::from_str("example.com").unwrap(),
            "test",
            TestContent {
                soa_serial,
                broken: false,
            },
        );
        zone.set_mtime(mtime);
        let zone = zone.finalize(false).unwrap();
        assert_eq!(zone.serial(), zone_serial);
        assert_eq!(zone.content().authority_serial(), content_serial);
    }

    #[test]
    fn explicit_serial_survives_without_soa_or_mtime() {
        let mut zone = ZoneBuilder::new(
            Name::from_str("example.com").unwrap(),
            "test",
            TestContent::default(),
        );
        zone.set_serial(42);
        assert_eq!(zone.finalize(false).unwrap().serial(), 42);
    }

    #[test]
    fn invalid_content_fails_finalize() {
        let zone = ZoneBuilder::new(
            Name::from_str("example.com").unwrap(),
            "test",
            TestContent {
                soa_serial: 1,
                broken: true,
            },
        );
        assert!(matches!(zone.finalize(false), Err(ZoneError::Invalid(_))));
    }

    #[test]
    fn strict_data_requires_serial() {
        let zone = ZoneBuilder::new(
            Name::from_str("example.com").unwrap(),
            "test",
            TestContent::default(),
        );
        assert!(matches!(zone.finalize(true), Err(ZoneError::NoSerial)));
    }

    #[test]
    fn record_keeps_identity() {
        let zone = mk_zone("Example.COM", "dir:example.com", 1);
        assert_eq!(zone.apex().to_string(), "example.com.");
        assert_eq!(zone.source(), "dir:example.com");
        assert_eq!(zone.hash(), zone.apex().hash64());
    }
}
