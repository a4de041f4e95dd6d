//! Epoch-based reclamation of superseded zone tree versions.
//!
//! Readers register once and receive a [`ReaderSlot`]. Around each lookup
//! they mark the slot with the global epoch they observed on entry and
//! clear it again on exit. The writer never frees a version it has swapped
//! out right away. Instead it [`retire`][Epochs::retire]s the version,
//! which advances the global epoch and tags the version with the new
//! value. A retired version may be dropped as soon as every registered
//! slot is either quiescent or marked with an epoch at or after the tag:
//! such a reader entered after the swap and can only have observed the
//! new version.
//!
//! Reclamation is polled, never awaited by readers. The writer calls
//! [`try_reclaim`][Epochs::try_reclaim] after each publish and the zone
//! data thread calls it periodically, so a reader that sits inside a
//! critical section only delays reclamation, never another lookup or the
//! next publish.

use std::any::Any;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::trace;

/// Slot value of a reader outside any critical section.
const QUIESCENT: u64 = 0;

//------------ Epochs --------------------------------------------------------

/// The reclamation domain shared by the writer and all readers of a tree.
pub struct Epochs {
    /// The global epoch. Starts at one so that zero can mark quiescence.
    global: AtomicU64,

    /// All registered reader slots.
    slots: Mutex<Vec<Arc<ReaderSlot>>>,

    /// Retired objects along with the epoch they were retired in.
    retired: Mutex<Vec<Retired>>,
}

struct Retired {
    epoch: u64,
    _object: Box<dyn Any + Send + Sync>,
}

impl Epochs {
    pub fn new() -> Self {
        Epochs {
            global: AtomicU64::new(1),
            slots: Default::default(),
            retired: Default::default(),
        }
    }

    /// Registers a new reader.
    pub fn register(&self) -> Arc<ReaderSlot> {
        let slot = Arc::new(ReaderSlot {
            epoch: AtomicU64::new(QUIESCENT),
        });
        self.slots.lock().push(slot.clone());
        slot
    }

    /// Returns the number of currently registered readers.
    pub fn readers(&self) -> usize {
        self.slots
            .lock()
            .iter()
            .filter(|slot| Arc::strong_count(slot) > 1)
            .count()
    }

    /// Marks `slot` as inside a critical section.
    ///
    /// Must be called before loading the published root. The caller then
    /// has to load the root with sequentially consistent ordering.
    pub(super) fn enter(&self, slot: &ReaderSlot) {
        let epoch = self.global.load(Ordering::SeqCst);
        slot.epoch.store(epoch, Ordering::SeqCst);
    }

    /// Marks `slot` as quiescent again.
    pub(super) fn exit(&self, slot: &ReaderSlot) {
        slot.epoch.store(QUIESCENT, Ordering::Release);
    }

    /// Defers dropping `object` until no reader can still observe it.
    ///
    /// The object must already be unreachable for readers entering from
    /// now on, i.e., the swap that unpublished it must have happened
    /// before this call.
    pub fn retire<T: Any + Send + Sync>(&self, object: T) {
        let epoch = self.global.fetch_add(1, Ordering::SeqCst) + 1;
        trace!("Retiring superseded version in epoch {epoch}");
        self.retired.lock().push(Retired {
            epoch,
            _object: Box::new(object),
        });
    }

    /// Drops all retired objects whose grace period has passed.
    ///
    /// Never blocks on readers. Returns the number of objects that are
    /// still waiting.
    pub fn try_reclaim(&self) -> usize {
        // Objects retired after this load may have been unpublished after
        // the slot scan below and are left alone.
        let bound = self.global.load(Ordering::SeqCst);
        let limit = match self.min_active_epoch() {
            Some(min_active) => bound.min(min_active),
            None => bound,
        };

        let reclaimed: Vec<Retired> = {
            let mut retired = self.retired.lock();
            let (done, pending): (Vec<_>, Vec<_>) = retired
                .drain(..)
                .partition(|item| item.epoch <= limit);
            *retired = pending;
            done
        };
        if !reclaimed.is_empty() {
            trace!("Reclaiming {} retired versions", reclaimed.len());
        }
        // Dropping happens outside the lock so that freeing a large tree
        // doesn’t stall a concurrent retire.
        drop(reclaimed);
        self.retired.lock().len()
    }

    /// Waits until every object retired so far has been dropped.
    ///
    /// This is the only blocking operation of the scheme. It is meant for
    /// shutdown and tests and must not be called from within a critical
    /// section.
    pub fn synchronize(&self) {
        while self.try_reclaim() > 0 {
            thread::sleep(Duration::from_millis(1));
        }
    }

    /// Returns the number of retired objects not yet dropped.
    pub fn pending(&self) -> usize {
        self.retired.lock().len()
    }

    /// Returns the smallest epoch of any reader inside a critical section.
    ///
    /// Also drops slots whose reader has gone away.
    fn min_active_epoch(&self) -> Option<u64> {
        let mut slots = self.slots.lock();
        slots.retain(|slot| Arc::strong_count(slot) > 1);
        slots
            .iter()
            .map(|slot| slot.epoch.load(Ordering::SeqCst))
            .filter(|&epoch| epoch != QUIESCENT)
            .min()
    }
}

impl Default for Epochs {
    fn default() -> Self {
        Self::new()
    }
}

//------------ ReaderSlot ----------------------------------------------------

/// The visible state of one registered reader.
///
/// Padded to a cache line so that readers on different threads don’t
/// contend when marking their slot.
#[repr(align(64))]
pub struct ReaderSlot {
    epoch: AtomicU64,
}

impl ReaderSlot {
    /// Returns whether the reader is currently inside a critical section.
    pub fn is_active(&self) -> bool {
        self.epoch.load(Ordering::Relaxed) != QUIESCENT
    }
}

//============ Testing =======================================================
