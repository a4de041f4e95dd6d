//! The concurrent store of the zones we are authoritative for.
//!
//! A [`ZoneTree`] maps domain names to the [`ZoneRecord`] whose apex is
//! their longest suffix. Lookups happen on many worker threads at once
//! through a [`ZoneReader`] each, while a single writer publishes new,
//! changed, or removed zones. Each publish swaps in a new version of the
//! tree and [`reclaim`] frees superseded versions once no reader can
//! observe them anymore.

mod error;
mod tree;
mod zone;

pub mod answer;
pub mod reclaim;

pub use self::answer::Answer;
pub use self::error::{ZoneError, ZoneTreeError};
pub use self::tree::{ReadGuard, ZoneReader, ZoneTree};
pub use self::zone::{serial_from_mtime, ZoneBuilder, ZoneContent, ZoneRecord};
