//! A zone source serving every file of a directory as a zone.
//!
//! Each regular file whose name is a domain name becomes a zone with that
//! apex. Hidden files and editor leftovers ending in `~` or `.tmp` are
//! ignored. The file’s content is kept as an opaque blob and its
//! modification time provides the zone serial.

use core::hash::Hasher;
use std::collections::HashMap;
use std::fs;
use std::io;
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::{Duration, UNIX_EPOCH};

use bytes::Bytes;
use siphasher::sip::SipHasher13;
use tracing::{debug, error, info, warn};

use crate::base::Name;
use crate::zonetree::{
    ZoneBuilder, ZoneContent, ZoneError, ZoneRecord, ZoneTree, ZoneTreeError,
};

use super::{SourceError, ZoneLoop, ZoneSource};

//------------ DirSource -----------------------------------------------------

pub struct DirSource {
    dir: PathBuf,
    strict_startup: bool,
    strict_data: bool,
    rescan_interval: Duration,

    /// The files currently published, keyed by file name.
    known: HashMap<String, Known>,
}

#[derive(Clone, Debug)]
struct Known {
    apex: Name,
    mtime: u64,
    len: u64,
    inode: u64,
}

/// A zone file found during a scan.
#[derive(Debug)]
struct Found {
    file_name: String,
    path: PathBuf,
    known: Known,
}

impl DirSource {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        DirSource {
            dir: dir.into(),
            strict_startup: true,
            strict_data: false,
            rescan_interval: Duration::ZERO,
            known: HashMap::new(),
        }
    }

    /// Whether a broken zone aborts the initial load.
    pub fn set_strict_startup(&mut self, value: bool) {
        self.strict_startup = value
    }

    /// Whether zones without a serial are rejected.
    pub fn set_strict_data(&mut self, value: bool) {
        self.strict_data = value
    }

    /// How often to rescan the directory. Zero disables periodic rescans.
    pub fn set_rescan_interval(&mut self, value: Duration) {
        self.rescan_interval = value
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn source_name(file_name: &str) -> String {
        format!("dir:{file_name}")
    }

    /// Lists the zone files currently in the directory.
    fn scan(&self) -> Result<Vec<Found>, SourceError> {
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                warn!(
                    "Zone directory {} does not exist, serving no zones",
                    self.dir.display()
                );
                return Ok(Vec::new());
            }
            Err(source) => {
                return Err(SourceError::Io {
                    path: self.dir.clone(),
                    source,
                })
            }
        };

        let mut res = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|source| SourceError::Io {
                path: self.dir.clone(),
                source,
            })?;
            let Ok(file_name) = entry.file_name().into_string() else {
                continue;
            };
            if file_name.starts_with('.')
                || file_name.ends_with('~')
                || file_name.ends_with(".tmp")
            {
                continue;
            }
            let path = entry.path();
            let meta = match fs::metadata(&path) {
                Ok(meta) if meta.is_file() => meta,
                Ok(_) => continue,
                Err(source) => return Err(SourceError::Io { path, source }),
            };
            let apex = match Name::from_str(&file_name) {
                Ok(apex) => apex,
                Err(err) => {
                    debug!("Ignoring {}: {err}", path.display());
                    continue;
                }
            };
            let mtime = meta
                .modified()
                .ok()
                .and_then(|time| time.duration_since(UNIX_EPOCH).ok())
                .map(|time| time.as_secs())
                .unwrap_or(0);
            res.push(Found {
                file_name,
                path,
                known: Known {
                    apex,
                    mtime,
                    len: meta.len(),
                    inode: meta.ino(),
                },
            });
        }
        Ok(res)
    }

    fn load_file(&self, found: &Found) -> Result<ZoneRecord, SourceError> {
        let data =
            fs::read(&found.path).map_err(|source| SourceError::Io {
                path: found.path.clone(),
                source,
            })?;
        let mut hasher = SipHasher13::new();
        hasher.write(&data);
        let digest = hasher.finish();
        let mut zone = ZoneBuilder::new(
            found.known.apex.clone(),
            Self::source_name(&found.file_name),
            ZoneBlob::new(data.into()),
        );
        zone.set_mtime(found.known.mtime);
        zone.set_digest(digest);
        zone.finalize(self.strict_data)
            .map_err(|source| SourceError::Zone {
                apex: found.known.apex.clone(),
                source,
            })
    }

    /// Publishes a loaded zone and remembers the file.
    ///
    /// A file is only remembered once the tree holds its data.
    fn publish(
        &mut self,
        tree: &ZoneTree,
        found: Found,
        zone: ZoneRecord,
    ) -> Result<(), ZoneTreeError> {
        let serial = zone.serial();
        match tree.insert(zone) {
            Ok(()) => {
                info!(
                    "Zone {} loaded from {} with serial {serial}",
                    found.known.apex,
                    found.path.display()
                );
            }
            // The tree already holds this exact data.
            Err(ZoneTreeError::Unchanged { .. }) => {}
            Err(err) => return Err(err),
        }
        self.known.insert(found.file_name, found.known);
        Ok(())
    }

    /// Brings the tree in line with the directory’s current content.
    ///
    /// Broken zones are logged and the previous version stays published.
    pub fn rescan(&mut self, tree: &ZoneTree) {
        let found = match self.scan() {
            Ok(found) => found,
            Err(err) => {
                error!("Rescanning zone directory failed: {err}");
                return;
            }
        };

        let mut gone: Vec<String> = self.known.keys().cloned().collect();
        let (mut changed, mut failed) = (0, 0);
        for item in found {
            gone.retain(|name| *name != item.file_name);
            if let Some(known) = self.known.get(&item.file_name) {
                if known.mtime == item.known.mtime
                    && known.len == item.known.len
                    && known.inode == item.known.inode
                {
                    continue;
                }
            }
            let res = match self.load_file(&item) {
                Ok(zone) => self
                    .publish(tree, item, zone)
                    .map_err(SourceError::from),
                Err(err) => Err(err),
            };
            match res {
                Ok(()) => changed += 1,
                Err(err) => {
                    error!("{err}");
                    failed += 1;
                }
            }
        }

        let removed = gone.len();
        for file_name in gone {
            if let Some(known) = self.known.remove(&file_name) {
                let source = Self::source_name(&file_name);
                match tree.remove(&known.apex, &source) {
                    Ok(()) => info!("Zone {} removed", known.apex),
                    Err(err) => warn!("{err}"),
                }
            }
        }

        if changed > 0 || removed > 0 || failed > 0 {
            info!(
                "Zone directory rescan: {changed} loaded, {removed} removed, \
                 {failed} failed"
            );
        }
    }
}

impl ZoneSource for DirSource {
    fn name(&self) -> &'static str {
        "dir"
    }

    fn load_zones(&mut self, tree: &ZoneTree) -> Result<(), SourceError> {
        for found in self.scan()? {
            match self.load_file(&found) {
                Ok(zone) => self.publish(tree, found, zone)?,
                Err(err) if self.strict_startup => return Err(err),
                Err(err) => error!("{err}, zone skipped"),
            }
        }
        Ok(())
    }

    fn on_reload_signal(&mut self, tree: &ZoneTree) {
        self.rescan(tree)
    }

    fn start_runtime(&mut self, zone_loop: &mut ZoneLoop) {
        if !self.rescan_interval.is_zero() {
            zone_loop.add_timer(self.rescan_interval)
        }
    }

    fn on_timer(&mut self, tree: &ZoneTree) {
        self.rescan(tree)
    }

    fn chrooted(&mut self, new_root: &Path) {
        if let Ok(rel) = self.dir.strip_prefix(new_root) {
            self.dir = Path::new("/").join(rel);
        }
    }
}

//------------ ZoneBlob ------------------------------------------------------

/// The opaque content of a zone file.
#[derive(Clone, Debug)]
pub struct ZoneBlob {
    data: Bytes,
    serial: u32,
}

impl ZoneBlob {
    pub fn new(data: Bytes) -> Self {
        ZoneBlob { data, serial: 0 }
    }

    pub fn data(&self) -> &Bytes {
        &self.data
    }
}

impl ZoneContent for ZoneBlob {
    fn authority_serial(&self) -> u32 {
        self.serial
    }

    fn set_authority_serial(&mut self, serial: u32) {
        self.serial = serial
    }

    fn validate(&self, apex: &Name) -> Result<(), ZoneError> {
        if self.data.is_empty() {
            Err(ZoneError::Invalid(format!("{apex}: zone file is empty")))
        } else {
            Ok(())
        }
    }
}

//============ Testing =======================================================

#[cfg(test)]
mod test {
    use super::*;
    use std::fs::File;
    use std::sync::Arc;

    fn write(dir: &Path, name: &str, content: &str, mtime: u64) {
        let path = dir.join(name);
        fs::write(&path, content).unwrap();
        File::options()
            .write(true)
            .open(&path)
            .unwrap()
            .set_modified(UNIX_EPOCH + Duration::from_secs(mtime))
            .unwrap();
    }

    fn apexes(tree: &ZoneTree) -> Vec<String> {
        let mut res: Vec<_> = tree
            .zones()
            .iter()
            .map(|zone| zone.apex().to_string())
            .collect();
        res.sort();
        res
    }

    #[test]
    fn loads_zone_files() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "example.com", "data", 1_700_000_000);
        write(dir.path(), "Example.NET.", "data", 1_700_000_000);
        write(dir.path(), ".hidden.com", "data", 1);
        write(dir.path(), "backup.com~", "data", 1);
        write(dir.path(), "partial.com.tmp", "data", 1);
        fs::create_dir(dir.path().join("subdir.com")).unwrap();

        let tree = ZoneTree::new();
        let mut source = DirSource::new(dir.path());
        source.load_zones(&tree).unwrap();
        assert_eq!(apexes(&tree), ["example.com.", "example.net."]);

        let zones = tree.zones();
        let zone = zones
            .iter()
            .find(|zone| zone.apex().to_string() == "example.com.")
            .unwrap();
        assert_eq!(zone.source(), "dir:example.com");
        assert_eq!(zone.serial(), 2023111422);
        assert_eq!(zone.mtime(), 1_700_000_000);
    }

    #[test]
    fn strict_startup_rejects_broken_zone() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "example.com", "", 1);
        let tree = ZoneTree::new();

        let mut source = DirSource::new(dir.path());
        assert!(matches!(
            source.load_zones(&tree),
            Err(SourceError::Zone { .. })
        ));

        let mut source = DirSource::new(dir.path());
        source.set_strict_startup(false);
        source.load_zones(&tree).unwrap();
        assert!(tree.is_empty());
    }

    #[test]
    fn strict_data_requires_mtime() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "example.com", "data", 0);
        let tree = ZoneTree::new();
        let mut source = DirSource::new(dir.path());
        source.set_strict_data(true);
        assert!(matches!(
            source.load_zones(&tree),
            Err(SourceError::Zone {
                source: ZoneError::NoSerial,
                ..
            })
        ));
    }

    #[test]
    fn missing_directory_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let tree = ZoneTree::new();
        let mut source = DirSource::new(dir.path().join("nope"));
        source.load_zones(&tree).unwrap();
        assert!(tree.is_empty());
    }

    #[test]
    fn rescan_follows_directory() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "example.com", "data", 100);
        write(dir.path(), "example.net", "data", 100);
        let tree = Arc::new(ZoneTree::new());
        let mut source = DirSource::new(dir.path());
        source.load_zones(&tree).unwrap();

        write(dir.path(), "example.com", "new data", 200);
        fs::remove_file(dir.path().join("example.net")).unwrap();
        write(dir.path(), "example.org", "data", 100);
        source.on_reload_signal(&tree);
        assert_eq!(apexes(&tree), ["example.com.", "example.org."]);
        let zones = tree.zones();
        let com = zones
            .iter()
            .find(|zone| zone.apex().to_string() == "example.com.")
            .unwrap();
        assert_eq!(com.mtime(), 200);

        // A broken update keeps the previous version.
        write(dir.path(), "example.com", "", 300);
        source.rescan(&tree);
        let zones = tree.zones();
        let com = zones
            .iter()
            .find(|zone| zone.apex().to_string() == "example.com.")
            .unwrap();
        assert_eq!(com.mtime(), 200);
    }

    #[test]
    fn rewrite_within_same_second_is_published() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "example.com", "data", 100);
        let tree = ZoneTree::new();
        let mut source = DirSource::new(dir.path());
        source.load_zones(&tree).unwrap();
        let first = tree.zones()[0].clone();

        write(dir.path(), "example.com", "completely new data", 100);
        source.rescan(&tree);
        let second = tree.zones()[0].clone();
        assert!(!Arc::ptr_eq(&first, &second));
        assert_ne!(first.digest(), second.digest());
        assert_eq!(second.mtime(), 100);

        // Nothing changed since, so nothing is published.
        source.rescan(&tree);
        assert!(Arc::ptr_eq(&second, &tree.zones()[0]));
    }

    #[test]
    fn chroot_rebases_directory() {
        let mut source = DirSource::new("/srv/authd/etc/zones");
        source.chrooted(Path::new("/srv/authd"));
        assert_eq!(source.dir(), Path::new("/etc/zones"));

        let mut source = DirSource::new("/elsewhere/zones");
        source.chrooted(Path::new("/srv/authd"));
        assert_eq!(source.dir(), Path::new("/elsewhere/zones"));
    }

    #[test]
    fn rescan_timer_is_registered() {
        let mut zone_loop = ZoneLoop::default();
        let mut source = DirSource::new("/nonexistent");
        source.start_runtime(&mut zone_loop);
        assert_eq!(zone_loop.timer_count(), 0);
        source.set_rescan_interval(Duration::from_secs(30));
        source.start_runtime(&mut zone_loop);
        assert_eq!(zone_loop.timer_count(), 1);
    }
}
