//! Zone sources and the zone data thread.
//!
//! A zone source produces zone records and publishes them into the zone
//! tree. All sources are loaded synchronously during startup. Afterwards
//! they live on the zone data thread, which runs its own single-threaded
//! runtime, forwards reload requests from the main thread, fires the
//! periodic timers sources asked for, and regularly reclaims superseded
//! tree versions.

pub mod dir;

use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info};

use crate::base::Name;
use crate::zonetree::{ZoneError, ZoneTree, ZoneTreeError};

/// The granularity of the zone data thread’s loop.
pub const TICK: Duration = Duration::from_millis(10);

//------------ ZoneSource ----------------------------------------------------

/// A provider of zone data.
pub trait ZoneSource: Send + 'static {
    /// A short name used in log messages, e.g., `dir`.
    fn name(&self) -> &'static str;

    /// Loads all zones and publishes them into `tree`.
    ///
    /// Called once during startup before any worker thread exists. An error
    /// aborts startup.
    fn load_zones(&mut self, tree: &ZoneTree) -> Result<(), SourceError>;

    /// Reacts to a reload request.
    fn on_reload_signal(&mut self, tree: &ZoneTree) {
        let _ = tree;
    }

    /// Registers periodic timers with the zone data loop.
    fn start_runtime(&mut self, zone_loop: &mut ZoneLoop) {
        let _ = zone_loop;
    }

    /// Called whenever one of the source’s timers has expired.
    fn on_timer(&mut self, tree: &ZoneTree) {
        let _ = tree;
    }

    /// Rebases paths after the process has been chrooted to `new_root`.
    fn chrooted(&mut self, new_root: &Path) {
        let _ = new_root;
    }
}

//------------ ZoneLoop ------------------------------------------------------

/// The timers registered by the zone sources.
#[derive(Debug, Default)]
pub struct ZoneLoop {
    timers: Vec<Timer>,
    current: usize,
}

#[derive(Debug)]
struct Timer {
    source: usize,
    interval: Duration,
    next: Instant,
}

impl ZoneLoop {
    /// Asks for `on_timer` to be called every `interval`.
    ///
    /// Intervals shorter than the loop’s tick are rounded up to it.
    pub fn add_timer(&mut self, interval: Duration) {
        let interval = interval.max(TICK);
        self.timers.push(Timer {
            source: self.current,
            interval,
            next: Instant::now() + interval,
        });
    }

    pub fn timer_count(&self) -> usize {
        self.timers.len()
    }

    /// Returns the sources with a timer due at `now` and rearms them.
    fn due(&mut self, now: Instant) -> Vec<usize> {
        let mut res = Vec::new();
        for timer in &mut self.timers {
            if timer.next <= now {
                timer.next = now + timer.interval;
                if !res.contains(&timer.source) {
                    res.push(timer.source);
                }
            }
        }
        res
    }
}

//------------ ZoneCommand ---------------------------------------------------

/// A request from the main thread to the zone data thread.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ZoneCommand {
    /// The operator asked for zone data to be reloaded.
    Reload,
}

//------------ ZoneSources ---------------------------------------------------

/// All configured zone sources along with the tree they publish to.
pub struct ZoneSources {
    tree: Arc<ZoneTree>,
    sources: Vec<Box<dyn ZoneSource>>,
}

impl ZoneSources {
    pub fn new(tree: Arc<ZoneTree>) -> Self {
        ZoneSources {
            tree,
            sources: Vec::new(),
        }
    }

    pub fn add(&mut self, source: impl ZoneSource) {
        self.sources.push(Box::new(source))
    }

    pub fn tree(&self) -> &Arc<ZoneTree> {
        &self.tree
    }

    /// Loads the zones of all sources in order.
    pub fn load_all(&mut self) -> Result<(), SourceError> {
        for source in &mut self.sources {
            debug!("Loading zones from source '{}'", source.name());
            source.load_zones(&self.tree)?;
        }
        info!("Loaded {} zones", self.tree.len());
        Ok(())
    }

    pub fn chrooted(&mut self, new_root: &Path) {
        for source in &mut self.sources {
            source.chrooted(new_root)
        }
    }

    /// Runs the zone data loop on the current thread until `commands` is
    /// closed.
    pub fn run(
        self,
        commands: mpsc::UnboundedReceiver<ZoneCommand>,
    ) -> Result<(), io::Error> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_time()
            .build()?;
        runtime.block_on(self.serve(commands));
        Ok(())
    }

    /// The zone data loop.
    pub async fn serve(
        mut self,
        mut commands: mpsc::UnboundedReceiver<ZoneCommand>,
    ) {
        let mut zone_loop = ZoneLoop::default();
        for (idx, source) in self.sources.iter_mut().enumerate() {
            zone_loop.current = idx;
            source.start_runtime(&mut zone_loop);
        }

        let mut tick = tokio::time::interval(TICK);
        tick.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                biased;

                cmd = commands.recv() => {
                    let Some(cmd) = cmd else {
                        break;
                    };
                    match cmd {
                        ZoneCommand::Reload => {
                            info!("Reloading zone data");
                            for source in &mut self.sources {
                                source.on_reload_signal(&self.tree);
                            }
                        }
                    }
                }

                now = tick.tick() => {
                    for idx in zone_loop.due(now) {
                        if let Some(source) = self.sources.get_mut(idx) {
                            source.on_timer(&self.tree);
                        }
                    }
                    self.tree.reclaim();
                }
            }
        }
        debug!("Zone data loop terminated");
    }
}

//============ Error Types ===================================================

/// A zone source failed to load its zones.
#[derive(Debug, thiserror::Error)]
pub enum SourceError {
    #[error("cannot read {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("zone {apex}: {source}")]
    Zone {
        apex: Name,
        #[source]
        source: ZoneError,
    },

    #[error(transparent)]
    Tree(#[from] ZoneTreeError),
}

//============ Testing =======================================================
