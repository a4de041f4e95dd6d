//! Domain names.
//!
//! Domain names are a sequence of *labels* which are in turn a sequence of
//! up to 63 octets. In their wire-format representation labels are prefixed
//! with an octet containing the number of octets in the label. The labels
//! in a domain name are nominally arranged backwards: the ‘most
//! significant’ label is the last one, and in an absolute name this last
//! label is the empty *root label*.
//!
//! The zone tree only ever deals with absolute names taken from questions
//! or zone sources, so this module provides a single owned type, [`Name`],
//! which keeps its uncompressed wire format with all ASCII letters folded to
//! lower case. Because of the case folding, labels of two names can be
//! compared and hashed as plain octets.

use core::str::FromStr;
use core::{fmt, hash};
use std::sync::OnceLock;

use bytes::Bytes;
use siphasher::sip::SipHasher13;
use smallvec::SmallVec;

//------------ Limits --------------------------------------------------------

/// The maximum length of a label’s content.
pub const MAX_LABEL_LEN: usize = 63;

/// The maximum length of a domain name in wire format.
pub const MAX_NAME_LEN: usize = 255;

/// Label offsets of a name, from the leftmost label to the root label.
///
/// A name has at most 128 labels, most have fewer than eight.
pub type LabelOffsets = SmallVec<[u8; 16]>;

//------------ Hash keys -----------------------------------------------------

static HASH_KEYS: OnceLock<(u64, u64)> = OnceLock::new();

/// Seeds the process-wide keys used by [`Name::hash64`].
///
/// This should happen once during startup, before any zone is created. If
/// it doesn’t, the keys are seeded lazily on first use.
pub fn init_hash_keys() {
    let _ = hash_keys();
}

fn hash_keys() -> (u64, u64) {
    *HASH_KEYS.get_or_init(|| (rand::random(), rand::random()))
}

//------------ Name ----------------------------------------------------------

/// An owned, absolute, case-folded domain name.
#[derive(Clone, Eq, PartialEq, Ord, PartialOrd)]
pub struct Name {
    wire: Bytes,
}

impl Name {
    /// Returns the root name.
    pub fn root() -> Self {
        Name {
            wire: Bytes::from_static(b"\0"),
        }
    }

    /// Parses an uncompressed name from the beginning of `buf`.
    ///
    /// Returns the name and the number of octets it occupied.
    pub fn from_wire(buf: &[u8]) -> Result<(Self, usize), NameError> {
        let mut pos = 0;
        loop {
            let len = *buf.get(pos).ok_or(NameError::ShortInput)?;
            match len {
                0 => {
                    pos += 1;
                    break;
                }
                1..=0x3F => {}
                0xC0..=0xFF => return Err(NameError::CompressedName),
                _ => return Err(NameError::BadLabelType(len)),
            }
            let end = pos + 1 + usize::from(len);
            if end >= buf.len() {
                return Err(NameError::ShortInput);
            }
            pos = end;
            if pos >= MAX_NAME_LEN {
                return Err(NameError::LongName);
            }
        }
        let mut wire = buf[..pos].to_vec();
        fold_case(&mut wire);
        Ok((
            Name {
                wire: wire.into(),
            },
            pos,
        ))
    }

    /// Returns the wire format of the name.
    pub fn as_wire(&self) -> &[u8] {
        self.wire.as_ref()
    }

    /// Returns the length of the wire format of the name.
    #[allow(clippy::len_without_is_empty)]
    pub fn len(&self) -> usize {
        self.wire.len()
    }

    /// Returns whether this is the root name.
    pub fn is_root(&self) -> bool {
        self.wire.len() == 1
    }

    /// Returns the offsets of all labels, the root label included.
    ///
    /// Offsets run from the leftmost label to the root label, so the
    /// last entry is always `self.len() - 1`.
    pub fn label_offsets(&self) -> LabelOffsets {
        let mut res = LabelOffsets::new();
        let mut pos = 0;
        loop {
            // The wire format never exceeds 255 octets.
            res.push(pos as u8);
            let len = usize::from(self.wire[pos]);
            if len == 0 {
                break;
            }
            pos += len + 1;
        }
        res
    }

    /// Returns the content of the label starting at `offset`.
    ///
    /// `offset` must be one of the values returned by
    /// [`label_offsets`][Self::label_offsets].
    pub fn label_at(&self, offset: usize) -> &[u8] {
        let len = usize::from(self.wire[offset]);
        &self.wire[offset + 1..offset + 1 + len]
    }

    /// Returns an iterator over the labels from the leftmost to the root.
    pub fn iter_labels(&self) -> impl DoubleEndedIterator<Item = &[u8]> {
        self.label_offsets()
            .into_iter()
            .map(move |offset| self.label_at(usize::from(offset)))
    }

    /// Returns the number of labels, the root label included.
    pub fn label_count(&self) -> usize {
        self.label_offsets().len()
    }

    /// Returns whether `self` is equal to or a subdomain of `base`.
    pub fn ends_with(&self, base: &Name) -> bool {
        if base.len() > self.len() {
            return false;
        }
        let start = self.len() - base.len();
        self.label_offsets()
            .iter()
            .any(|&offset| usize::from(offset) == start)
            && self.wire[start..] == base.wire[..]
    }

    /// Returns a keyed hash of the name.
    ///
    /// The keys are per process, so the value must not be persisted.
    pub fn hash64(&self) -> u64 {
        let (k0, k1) = hash_keys();
        let mut hasher = SipHasher13::new_with_keys(k0, k1);
        hash::Hasher::write(&mut hasher, self.as_wire());
        hash::Hasher::finish(&hasher)
    }
}

fn fold_case(wire: &mut [u8]) {
    let mut pos = 0;
    while pos < wire.len() {
        let len = usize::from(wire[pos]);
        wire[pos + 1..pos + 1 + len].make_ascii_lowercase();
        pos += len + 1;
    }
}

//--- FromStr

impl FromStr for Name {
    type Err = NameError;

    /// Parses a name from its presentation format.
    ///
    /// The final dot is optional. Escape sequences `\X` and `\DDD` are
    /// supported.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s == "." {
            return Ok(Name::root());
        }
        if s.is_empty() {
            return Err(NameError::EmptyLabel);
        }
        let mut wire = Vec::with_capacity(s.len() + 2);
        let mut label_start = 0;
        wire.push(0);
        let mut chars = s.bytes();
        let mut trailing_dot = false;
        while let Some(ch) = chars.next() {
            trailing_dot = false;
            let octet = match ch {
                b'.' => {
                    let len = wire.len() - label_start - 1;
                    if len == 0 {
                        return Err(NameError::EmptyLabel);
                    }
                    wire[label_start] = len as u8;
                    label_start = wire.len();
                    wire.push(0);
                    trailing_dot = true;
                    continue;
                }
                b'\\' => parse_escape(&mut chars)?,
                ch => ch,
            };
            wire.push(octet);
            if wire.len() - label_start - 1 > MAX_LABEL_LEN {
                return Err(NameError::LongLabel);
            }
        }
        if !trailing_dot {
            let len = wire.len() - label_start - 1;
            wire[label_start] = len as u8;
            wire.push(0);
        }
        if wire.len() > MAX_NAME_LEN {
            return Err(NameError::LongName);
        }
        fold_case(&mut wire);
        Ok(Name { wire: wire.into() })
    }
}

fn parse_escape(chars: &mut impl Iterator<Item = u8>) -> Result<u8, NameError> {
    let first = chars.next().ok_or(NameError::BadEscape)?;
    if !first.is_ascii_digit() {
        return Ok(first);
    }
    let mut value = u32::from(first - b'0');
    for _ in 0..2 {
        match chars.next() {
            Some(ch) if ch.is_ascii_digit() => {
                value = value * 10 + u32::from(ch - b'0');
            }
            _ => return Err(NameError::BadEscape),
        }
    }
    u8::try_from(value).map_err(|_| NameError::BadEscape)
}

//--- Hash

impl hash::Hash for Name {
    fn hash<H: hash::Hasher>(&self, state: &mut H) {
        self.as_wire().hash(state)
    }
}

//--- Display and Debug

impl fmt::Display for Name {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        if self.is_root() {
            return f.write_str(".");
        }
        for label in self.iter_labels() {
            if label.is_empty() {
                break;
            }
            for &ch in label {
                if ch == b'.' || ch == b'\\' {
                    write!(f, "\\{}", ch as char)?;
                } else if ch.is_ascii_graphic() {
                    write!(f, "{}", ch as char)?;
                } else {
                    write!(f, "\\{:03}", ch)?;
                }
            }
            f.write_str(".")?;
        }
        Ok(())
    }
}

impl fmt::Debug for Name {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Name({})", self)
    }
}

//============ Error Types ===================================================

//------------ NameError -----------------------------------------------------

/// A domain name could not be parsed.
#[derive(Clone, Copy, Debug, Eq, PartialEq, thiserror::Error)]
pub enum NameError {
    #[error("short input")]
    ShortInput,

    #[error("compressed domain name")]
    CompressedName,

    #[error("invalid label type {0:#04x}")]
    BadLabelType(u8),

    #[error("empty label")]
    EmptyLabel,

    #[error("long label")]
    LongLabel,

    #[error("long domain name")]
    LongName,

    #[error("invalid escape sequence")]
    BadEscape,
}

//============ Testing =======================================================
