//! The known set of zones.
//!
//! The tree is a trie keyed by labels, starting at the root label. Every
//! node may carry the zones published for the name it represents. Nodes
//! are never modified once they are reachable from the published root.
//! Instead, a writer copies the path from the root down to the affected
//! node, shares every untouched subtree with the current version, and then
//! swaps the root pointer. Readers thus see either the complete old or the
//! complete new version.
//!
//! Superseded versions are handed to the tree’s [`Epochs`] and dropped
//! once no reader can observe them anymore.

use core::ptr;
use std::collections::HashMap;
use std::sync::atomic::{AtomicPtr, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, MutexGuard};
use tracing::debug;

use crate::base::Name;

use super::error::ZoneTreeError;
use super::reclaim::{Epochs, ReaderSlot};
use super::zone::ZoneRecord;

//------------ ZoneTree ------------------------------------------------------

/// The hierarchy of zones we are authoritative for.
pub struct ZoneTree {
    /// The published version. Always a pointer from `Arc::into_raw`.
    root: AtomicPtr<Node>,

    /// Reader registration and deferred reclamation.
    epochs: Epochs,

    /// Serializes writers.
    writer: Mutex<()>,
}

impl Default for ZoneTree {
    fn default() -> Self {
        Self::new()
    }
}

impl ZoneTree {
    pub fn new() -> Self {
        let root = Arc::into_raw(Arc::new(Node::default())) as *mut Node;
        ZoneTree {
            root: AtomicPtr::new(root),
            epochs: Epochs::new(),
            writer: Mutex::new(()),
        }
    }

    /// Registers a reader.
    ///
    /// Each thread doing lookups registers once and keeps the reader for
    /// its lifetime.
    pub fn register_reader(self: &Arc<Self>) -> ZoneReader {
        ZoneReader {
            tree: self.clone(),
            slot: self.epochs.register(),
        }
    }

    /// Publishes a zone.
    ///
    /// A zone from the same source for the same apex is replaced unless it
    /// is unchanged, in which case [`ZoneTreeError::Unchanged`] is
    /// returned and nothing is published. If multiple sources provide the
    /// same apex, the zone with the newest modification time is active.
    pub fn insert(&self, zone: ZoneRecord) -> Result<(), ZoneTreeError> {
        let writer = self.writer.lock();
        let apex = zone.apex().clone();
        let labels = path_labels(&apex);
        let serial = zone.serial();
        let zone = Arc::new(zone);
        let new_root = with_zone(self.current(&writer), &labels, zone)?;
        self.publish(new_root, &writer);
        debug!("Published zone {apex} with serial {serial}");
        Ok(())
    }

    /// Unpublishes the zone `apex` provided by `source`.
    pub fn remove(
        &self,
        apex: &Name,
        source: &str,
    ) -> Result<(), ZoneTreeError> {
        let writer = self.writer.lock();
        let labels = path_labels(apex);
        let new_root =
            without_zone(self.current(&writer), &labels, apex, source)?
                .unwrap_or_default();
        self.publish(new_root, &writer);
        debug!("Removed zone {apex} from {source}");
        Ok(())
    }

    /// Returns the active zones of the current version.
    pub fn zones(&self) -> Vec<Arc<ZoneRecord>> {
        let writer = self.writer.lock();
        let mut res = Vec::new();
        let mut stack = vec![self.current(&writer)];
        while let Some(node) = stack.pop() {
            if let Some(zone) = node.active() {
                res.push(zone.clone());
            }
            stack.extend(node.children.values().map(AsRef::as_ref));
        }
        res
    }

    /// Returns the number of apexes with an active zone.
    pub fn len(&self) -> usize {
        self.zones().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drops superseded versions no reader can observe anymore.
    ///
    /// Returns the number of versions still waiting.
    pub fn reclaim(&self) -> usize {
        self.epochs.try_reclaim()
    }

    /// Waits until all superseded versions have been dropped.
    ///
    /// Must not be called while the calling thread holds a [`ReadGuard`].
    pub fn synchronize(&self) {
        self.epochs.synchronize()
    }

    /// Returns the number of registered readers.
    pub fn readers(&self) -> usize {
        self.epochs.readers()
    }

    /// Returns the published version to a writer.
    fn current<'a>(&'a self, _writer: &'a MutexGuard<'_, ()>) -> &'a Node {
        // SAFETY: Only writers retire versions and we hold the writer
        // lock, so the published root stays alive for the borrow.
        unsafe { &*self.root.load(Ordering::Acquire) }
    }

    fn publish(&self, root: Node, _writer: &MutexGuard<'_, ()>) {
        let new = Arc::into_raw(Arc::new(root)) as *mut Node;
        let old = self.root.swap(new, Ordering::SeqCst);
        // SAFETY: `old` was created by `Arc::into_raw` and the tree’s own
        // reference to it ends with the swap.
        let old = unsafe { Arc::from_raw(old) };
        self.epochs.retire(old);
        self.epochs.try_reclaim();
    }
}

impl Drop for ZoneTree {
    fn drop(&mut self) {
        let root = self.root.swap(ptr::null_mut(), Ordering::SeqCst);
        if !root.is_null() {
            // SAFETY: Readers hold an `Arc<ZoneTree>`, so none is left.
            drop(unsafe { Arc::from_raw(root) });
        }
    }
}

/// Returns the labels of `apex` from the root down, root label excluded.
fn path_labels(apex: &Name) -> Vec<&[u8]> {
    apex.iter_labels().rev().skip(1).collect()
}

/// Builds a copy of `node` with `zone` added at the end of `labels`.
fn with_zone(
    node: &Node,
    labels: &[&[u8]],
    zone: Arc<ZoneRecord>,
) -> Result<Node, ZoneTreeError> {
    let mut new = node.clone();
    match labels.split_first() {
        Some((label, rest)) => {
            let child = match node.children.get(*label) {
                Some(child) => with_zone(child, rest, zone)?,
                None => with_zone(&Node::default(), rest, zone)?,
            };
            new.children.insert(Box::from(*label), Arc::new(child));
        }
        None => new.add_record(zone)?,
    }
    Ok(new)
}

/// Builds a copy of `node` without the zone at the end of `labels`.
///
/// Returns `None` if the copy would be empty.
fn without_zone(
    node: &Node,
    labels: &[&[u8]],
    apex: &Name,
    source: &str,
) -> Result<Option<Node>, ZoneTreeError> {
    let not_found = || ZoneTreeError::NotFound {
        apex: apex.clone(),
        origin: source.into(),
    };
    let mut new = node.clone();
    match labels.split_first() {
        Some((label, rest)) => {
            let child = node.children.get(*label).ok_or_else(not_found)?;
            match without_zone(child, rest, apex, source)? {
                Some(child) => {
                    new.children.insert(Box::from(*label), Arc::new(child));
                }
                None => {
                    new.children.remove(*label);
                }
            }
        }
        None => {
            let pos = new
                .records
                .iter()
                .position(|zone| zone.source() == source)
                .ok_or_else(not_found)?;
            new.records.remove(pos);
        }
    }
    Ok(if new.is_empty() { None } else { Some(new) })
}

//------------ ZoneReader ----------------------------------------------------

/// A registered reader of a zone tree.
pub struct ZoneReader {
    tree: Arc<ZoneTree>,
    slot: Arc<ReaderSlot>,
}

impl ZoneReader {
    /// Enters a critical section.
    ///
    /// The returned guard pins the currently published version until it is
    /// dropped. Keep critical sections short: while one is open, no version
    /// superseded since its start can be reclaimed.
    pub fn enter(&mut self) -> ReadGuard<'_> {
        self.tree.epochs.enter(&self.slot);
        let root = self.tree.root.load(Ordering::SeqCst);
        ReadGuard { reader: self, root }
    }

    pub fn tree(&self) -> &Arc<ZoneTree> {
        &self.tree
    }
}

//------------ ReadGuard -----------------------------------------------------

/// A critical section of a [`ZoneReader`].
pub struct ReadGuard<'a> {
    reader: &'a ZoneReader,
    root: *const Node,
}

impl<'a> ReadGuard<'a> {
    fn root(&self) -> &Node {
        // SAFETY: The slot was marked before the root was loaded, so this
        // version isn’t reclaimed before the guard is dropped.
        unsafe { &*self.root }
    }

    /// Finds the zone that contains `qname`.
    ///
    /// Returns the zone whose apex is the longest suffix of `qname` and
    /// the offset into the wire format of `qname` at which the apex
    /// starts.
    pub fn find_zone_for(&self, qname: &Name) -> Option<(&ZoneRecord, usize)> {
        let offsets = qname.label_offsets();
        let mut node = self.root();
        let mut found =
            node.active().map(|zone| (zone.as_ref(), qname.len() - 1));
        for &offset in offsets.iter().rev().skip(1) {
            let offset = usize::from(offset);
            match node.children.get(qname.label_at(offset)) {
                Some(child) => node = child,
                None => break,
            }
            if let Some(zone) = node.active() {
                found = Some((zone.as_ref(), offset));
            }
        }
        found
    }
}

impl<'a> Drop for ReadGuard<'a> {
    fn drop(&mut self) {
        self.reader.tree.epochs.exit(&self.reader.slot);
    }
}

//------------ Node ----------------------------------------------------------

#[derive(Clone, Default)]
struct Node {
    /// The zones for this name, the active one first.
    records: Vec<Arc<ZoneRecord>>,

    children: HashMap<Box<[u8]>, Arc<Node>>,
}

impl Node {
    fn active(&self) -> Option<&Arc<ZoneRecord>> {
        self.records.first()
    }

    fn is_empty(&self) -> bool {
        self.records.is_empty() && self.children.is_empty()
    }

    fn add_record(
        &mut self,
        zone: Arc<ZoneRecord>,
    ) -> Result<(), ZoneTreeError> {
        if let Some(pos) = self
            .records
            .iter()
            .position(|item| item.source() == zone.source())
        {
            if self.records[pos].is_unchanged(&zone) {
                return Err(ZoneTreeError::Unchanged {
                    apex: zone.apex().clone(),
                    origin: zone.source().into(),
                });
            }
            self.records.remove(pos);
        }
        // Stable sort keeps the new zone ahead of older ones with the same
        // modification time.
        self.records.insert(0, zone);
        self.records.sort_by(|a, b| b.mtime().cmp(&a.mtime()));
        Ok(())
    }
}

//============ Testing =======================================================

#[cfg(test)]
mod test {
    use super::*;
    use crate::zonetree::zone::test::{mk_zone, TestContent};
    use crate::zonetree::zone::{ZoneBuilder, ZoneContent};
    use crate::zonetree::ZoneError;
    use core::str::FromStr;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn name(s: &str) -> Name {
        Name::from_str(s).unwrap()
    }

    fn tree_with(zones: &[&str]) -> Arc<ZoneTree> {
        let tree = Arc::new(ZoneTree::new());
        for apex in zones {
            tree.insert(mk_zone(apex, "test", 1)).unwrap();
        }
        tree
    }

    fn lookup(reader: &mut ZoneReader, qname: &str) -> Option<(String, usize)> {
        let guard = reader.enter();
        guard
            .find_zone_for(&name(qname))
            .map(|(zone, depth)| (zone.apex().to_string(), depth))
    }

    #[test]
    fn longest_suffix_match() {
        let tree = tree_with(&["a.example.", "example."]);
        let mut reader = tree.register_reader();

        let qname = name("x.a.example.");
        let apex = name("a.example.");
        assert_eq!(
            lookup(&mut reader, "x.a.example."),
            Some(("a.example.".into(), qname.len() - apex.len()))
        );
        assert_eq!(
            lookup(&mut reader, "y.example."),
            Some(("example.".into(), 2))
        );
        assert_eq!(
            lookup(&mut reader, "example."),
            Some(("example.".into(), 0))
        );
        assert_eq!(
            lookup(&mut reader, "A.Example."),
            Some(("a.example.".into(), 0))
        );
        assert_eq!(lookup(&mut reader, "example.com."), None);
        assert_eq!(lookup(&mut reader, "."), None);
    }

    #[test]
    fn root_zone_matches_everything() {
        let tree = tree_with(&["."]);
        let mut reader = tree.register_reader();
        assert_eq!(lookup(&mut reader, "."), Some((".".into(), 0)));
        assert_eq!(lookup(&mut reader, "www.example."), Some((".".into(), 12)));
    }

    #[test]
    fn deeper_zone_without_parent() {
        let tree = tree_with(&["b.a.example."]);
        let mut reader = tree.register_reader();
        assert_eq!(lookup(&mut reader, "a.example."), None);
        assert_eq!(
            lookup(&mut reader, "c.b.a.example."),
            Some(("b.a.example.".into(), 2))
        );
    }

    #[test]
    fn unchanged_zone_is_rejected() {
        let tree = tree_with(&["example."]);
        assert!(matches!(
            tree.insert(mk_zone("example.", "test", 1)),
            Err(ZoneTreeError::Unchanged { .. })
        ));
        tree.insert(mk_zone("example.", "test", 2)).unwrap();
        let zones = tree.zones();
        assert_eq!(zones.len(), 1);
        assert_eq!(zones[0].mtime(), 2);

        // Same serial and mtime but different data.
        let mut zone = ZoneBuilder::new(
            name("example."),
            "test",
            TestContent::default(),
        );
        zone.set_mtime(2);
        zone.set_digest(7);
        tree.insert(zone.finalize(false).unwrap()).unwrap();
        assert_eq!(tree.zones()[0].digest(), 7);
    }

    #[test]
    fn newest_source_is_active() {
        let tree = Arc::new(ZoneTree::new());
        tree.insert(mk_zone("example.", "one", 20)).unwrap();
        tree.insert(mk_zone("example.", "two", 10)).unwrap();
        assert_eq!(tree.zones()[0].source(), "one");

        tree.insert(mk_zone("example.", "two", 30)).unwrap();
        assert_eq!(tree.zones()[0].source(), "two");

        tree.remove(&name("example."), "two").unwrap();
        assert_eq!(tree.zones()[0].source(), "one");
        assert_eq!(tree.len(), 1);
    }

    #[test]
    fn remove_prunes_and_reports_missing() {
        let tree = tree_with(&["a.example.", "example."]);
        let mut reader = tree.register_reader();
        tree.remove(&name("a.example."), "test").unwrap();
        let qname = name("x.a.example.");
        assert_eq!(
            lookup(&mut reader, "x.a.example."),
            Some(("example.".into(), qname.len() - name("example.").len()))
        );
        assert!(matches!(
            tree.remove(&name("a.example."), "test"),
            Err(ZoneTreeError::NotFound { .. })
        ));
        assert!(matches!(
            tree.remove(&name("example."), "other"),
            Err(ZoneTreeError::NotFound { .. })
        ));
        tree.remove(&name("example."), "test").unwrap();
        assert!(tree.is_empty());
    }

    #[test]
    fn guard_keeps_its_version() {
        let tree = tree_with(&["example."]);
        let mut reader = tree.register_reader();
        let guard = reader.enter();
        tree.insert(mk_zone("a.example.", "test", 1)).unwrap();
        let (zone, _) = guard.find_zone_for(&name("x.a.example.")).unwrap();
        assert_eq!(zone.apex(), &name("example."));
        drop(guard);
        assert_eq!(
            lookup(&mut reader, "x.a.example."),
            Some(("a.example.".into(), 2))
        );
    }

    #[derive(Debug)]
    struct Counted(Arc<AtomicUsize>);

    impl Drop for Counted {
        fn drop(&mut self) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    impl ZoneContent for Counted {
        fn authority_serial(&self) -> u32 {
            0
        }

        fn set_authority_serial(&mut self, _serial: u32) {}

        fn validate(&self, _apex: &Name) -> Result<(), ZoneError> {
            Ok(())
        }
    }

    #[test]
    fn superseded_zone_outlives_guard() {
        let dropped = Arc::new(AtomicUsize::new(0));
        let tree = Arc::new(ZoneTree::new());
        let mut first = ZoneBuilder::new(
            name("example."),
            "test",
            Counted(dropped.clone()),
        );
        first.set_mtime(1);
        tree.insert(first.finalize(false).unwrap()).unwrap();

        let mut reader = tree.register_reader();
        let guard = reader.enter();
        let (old, _) = guard.find_zone_for(&name("example.")).unwrap();

        let mut second = ZoneBuilder::new(
            name("example."),
            "test",
            TestContent::default(),
        );
        second.set_mtime(2);
        tree.insert(second.finalize(false).unwrap()).unwrap();
        assert_eq!(tree.reclaim(), 1);
        assert_eq!(dropped.load(Ordering::SeqCst), 0);
        assert_eq!(old.mtime(), 1);

        drop(guard);
        tree.synchronize();
        assert_eq!(dropped.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn readers_unregister_on_drop() {
        let tree = tree_with(&[]);
        let reader = tree.register_reader();
        assert_eq!(tree.readers(), 1);
        drop(reader);
        assert_eq!(tree.readers(), 0);
    }
}
