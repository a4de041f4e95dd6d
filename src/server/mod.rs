//! The server process.
//!
//! [`run`] takes the parsed command line and performs the requested
//! action. Starting the server follows a strict sequence. Everything that
//! can fail because of bad configuration or zone data happens before the
//! process forks, so that these errors are reported to the invoking shell
//! directly. After the fork, the sockets are acquired from a possibly
//! running predecessor, the worker threads are started, and only once all
//! of them are serving is the predecessor told to go away.

pub mod mainloop;
pub mod signals;
pub mod threads;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, ValueEnum};
use nix::sys::signal::Signal;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::base::name::init_hash_keys;
use crate::config::{Config, Paths};
use crate::daemon::pidfile::{
    running_pid, signal_running, stop_running, STOP_TIMEOUT,
};
use crate::daemon::privs::{
    is_privileged, lock_memory, memlock_rlimits, set_priority, DropTarget,
};
use crate::daemon::{
    fork_with_helper, DaemonError, HelperLink, Pidfile, PrivilegedOp,
};
use crate::error::Error;
use crate::logging::init_logging;
use crate::net::dnsio::{self, run_tcp, run_udp};
use crate::net::socks::ListenerSet;
use crate::net::takeover::{acquire_sockets, Takeover};
use crate::plugins::Plugins;
use crate::stats::{StatsRegistry, Transport, WorkerStats};
use crate::zonetree::ZoneTree;
use crate::zsrc::dir::DirSource;
use crate::zsrc::{ZoneCommand, ZoneSources};

use self::mainloop::MainLoop;
use self::signals::{reraise, Control, SignalWatchers};
use self::threads::{check_threads, SignalsBlocked};

/// How long to wait for all workers to come up.
const READY_TIMEOUT: Duration = Duration::from_secs(10);

const TCP_BACKLOG: i32 = 128;

//------------ Options -------------------------------------------------------

/// An authoritative DNS server.
#[derive(Debug, Parser)]
#[command(name = "authd", version)]
pub struct Options {
    /// Stay in the foreground.
    #[arg(short = 'f')]
    pub foreground: bool,

    /// Force strict startup, i.e., fail on any broken zone.
    #[arg(short = 's')]
    pub force_strict_startup: bool,

    /// Force strict zone data checks.
    #[arg(short = 'S')]
    pub force_strict_data: bool,

    /// Log debug messages.
    #[arg(short = 'D')]
    pub debug: bool,

    /// The root directory or "system" for the system default paths.
    #[arg(short = 'd', value_name = "ROOTDIR")]
    pub root_dir: Option<PathBuf>,

    /// What to do.
    #[arg(value_enum, ignore_case = true)]
    pub action: Action,
}

//------------ Action --------------------------------------------------------

#[derive(Clone, Copy, Debug, Eq, PartialEq, ValueEnum)]
pub enum Action {
    /// Check configuration and zone data and exit.
    #[value(name = "check-config", alias = "checkconf")]
    CheckConfig,

    /// Start the server.
    Start,

    /// Stop the running server.
    Stop,

    /// Tell the running server to reload its zone data.
    Reload,

    /// Replace the running server or start a new one.
    #[value(alias = "force-reload")]
    Restart,

    /// Replace the running server if there is one.
    #[value(alias = "try-restart")]
    Condrestart,

    /// Report whether the server is running.
    Status,
}

impl Action {
    fn name(self) -> &'static str {
        match self {
            Action::CheckConfig => "check-config",
            Action::Start => "start",
            Action::Stop => "stop",
            Action::Reload => "reload",
            Action::Restart => "restart",
            Action::Condrestart => "condrestart",
            Action::Status => "status",
        }
    }

    /// Whether the action may leave a daemon running in the background.
    fn starts(self) -> bool {
        matches!(self, Action::Start | Action::Restart | Action::Condrestart)
    }
}

/// How the server is started.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum Mode {
    Check,
    Start,
    Replace,
}

//------------ run -----------------------------------------------------------

/// Performs the action and returns the exit status.
pub fn run(options: Options) -> i32 {
    run_with(options, Plugins::new())
}

/// Performs the action with the given plugins.
pub fn run_with(options: Options, plugins: Plugins) -> i32 {
    let paths = Paths::new(options.root_dir.as_deref());
    let daemonizing = options.action.starts() && !options.foreground;
    let logfile = daemonizing.then(|| paths.logfile());
    init_logging(options.debug, logfile.as_deref());
    debug!(
        "authd {} running '{}'",
        env!("CARGO_PKG_VERSION"),
        options.action.name()
    );
    match dispatch(&options, &paths, plugins) {
        Ok(code) => code,
        Err(err) => {
            error!("Fatal: {err}");
            1
        }
    }
}

fn dispatch(
    options: &Options,
    paths: &Paths,
    plugins: Plugins,
) -> Result<i32, Error> {
    let pidfile = paths.pidfile();
    match options.action {
        Action::CheckConfig => start(options, paths, plugins, Mode::Check),
        Action::Start => start(options, paths, plugins, Mode::Start),
        Action::Restart => start(options, paths, plugins, Mode::Replace),
        Action::Condrestart => {
            if running_pid(&pidfile)?.is_none() {
                info!("Not running, nothing to restart");
                return Ok(0);
            }
            start(options, paths, plugins, Mode::Replace)
        }
        Action::Status => match running_pid(&pidfile)? {
            Some(pid) => {
                info!("Running at pid {pid}");
                Ok(0)
            }
            None => {
                info!("Not running");
                Ok(3)
            }
        },
        Action::Stop => {
            match stop_running(&pidfile, STOP_TIMEOUT)? {
                Some(pid) => info!("Stopped instance at pid {pid}"),
                None => info!("Not running"),
            }
            Ok(0)
        }
        Action::Reload => match signal_running(&pidfile, Signal::SIGHUP)? {
            Some(pid) => {
                info!("Sent SIGHUP to instance at pid {pid}");
                Ok(0)
            }
            None => Err(DaemonError::NotRunning.into()),
        },
    }
}

//------------ start ---------------------------------------------------------

fn start(
    options: &Options,
    paths: &Paths,
    mut plugins: Plugins,
    mode: Mode,
) -> Result<i32, Error> {
    if mode != Mode::Check {
        info!("Starting authd {}", env!("CARGO_PKG_VERSION"));
    }
    let privileged = is_privileged();
    init_hash_keys();

    let mut config = Config::load(&paths.config_file())?;
    config.force_strict(
        options.force_strict_startup,
        options.force_strict_data,
    );
    let config = Arc::new(config);

    let drop_target = match config.username.as_deref() {
        Some(name) if privileged => Some(DropTarget::lookup(name)?),
        Some(name) => {
            debug!("Not running as root, ignoring username '{name}'");
            None
        }
        None => None,
    };

    plugins.full_config(config.listen.len() * 2)?;

    let tree = Arc::new(ZoneTree::new());
    let mut sources = ZoneSources::new(tree.clone());
    sources.add(dir_source(&config, paths));
    sources.load_all()?;

    if mode == Mode::Check {
        info!("Configuration and zone data are valid");
        return Ok(0);
    }
    if mode == Mode::Start {
        if let Some(pid) = running_pid(&paths.pidfile())? {
            return Err(DaemonError::AlreadyRunning(Some(pid)).into());
        }
    }

    if config.lock_mem {
        memlock_rlimits(privileged)?;
    }
    check_threads()?;
    let listeners = Arc::new(ListenerSet::create(&config)?);
    let mut pidfile = Pidfile::open(paths.pidfile())?;

    let mut helper =
        fork_with_helper(BindSockets(listeners.clone()), !options.foreground)?;

    // From here on we are the daemon.
    plugins.post_daemonize()?;
    if let Some(priority) = config.priority(privileged) {
        set_priority(priority);
    }
    if config.lock_mem {
        lock_memory()?;
    }
    install_panic_hook();
    dnsio::global_setup(&config);

    plugins.pre_privdrop()?;
    if let Some(target) = &drop_target {
        target.apply(paths.root())?;
        if let Some(root) = paths.root() {
            sources.chrooted(root);
        }
    }

    let mut main_loop =
        MainLoop::new().map_err(Error::io("creating main loop"))?;
    plugins.start_monitors(&mut main_loop)?;
    let mut watchers = SignalWatchers::install(&main_loop)
        .map_err(Error::io("installing signal handlers"))?;
    plugins.pre_run(&mut main_loop)?;

    let mut takeover = DaemonTakeover {
        helper: &mut helper,
        listeners: &listeners,
        pidfile: &mut pidfile,
        replace: mode == Mode::Replace,
    };
    let pending = acquire_sockets(&mut takeover)?;

    let registry = Arc::new(StatsRegistry::new(listeners.thread_count()));
    let (zone_tx, zone_rx) = mpsc::unbounded_channel();
    start_threads(
        &listeners,
        &tree,
        &registry,
        config.tcp_timeout(),
        sources,
        zone_rx,
    )?;
    if let Some(interval) = config.stats_interval() {
        start_stats(&mut main_loop, registry.clone(), interval);
    }
    if !registry.wait_ready(READY_TIMEOUT) {
        return Err(Error::Startup(format!(
            "only {} of {} listener threads came up",
            registry.published(),
            listeners.thread_count()
        )));
    }

    pending.finish(&mut takeover)?;
    helper.finish()?;
    info!(
        "Serving {} zones on {} addresses",
        tree.len(),
        listeners.listeners().len()
    );

    let stop = main_loop.run(async {
        loop {
            match watchers.next().await {
                Control::Reload => {
                    info!("Received SIGHUP");
                    if zone_tx.send(ZoneCommand::Reload).is_err() {
                        warn!("Zone data thread is gone, cannot reload");
                    }
                }
                Control::Shutdown(sig) => break sig,
            }
        }
    });

    drop(watchers);
    registry.log_uptime();
    registry.log_stats();
    drop(main_loop);
    drop(pidfile);
    reraise(stop);
    Ok(0)
}

fn dir_source(config: &Config, paths: &Paths) -> DirSource {
    let mut source = DirSource::new(config.zones_dir(paths));
    source.set_strict_startup(config.zones_strict_startup);
    source.set_strict_data(config.zones_strict_data);
    source.set_rescan_interval(config.rescan_interval());
    source
}

/// Logs panics before the default hook reports them.
///
/// Once in the background, stderr goes nowhere.
fn install_panic_hook() {
    let default = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |info| {
        error!("Fatal: {info}");
        default(info)
    }));
}

/// Starts listener threads and the zone data thread.
fn start_threads(
    listeners: &Arc<ListenerSet>,
    tree: &Arc<ZoneTree>,
    registry: &Arc<StatsRegistry>,
    tcp_timeout: Duration,
    sources: ZoneSources,
    commands: mpsc::UnboundedReceiver<ZoneCommand>,
) -> Result<(), Error> {
    let blocked = SignalsBlocked::new()?;
    for (idx, listener) in listeners.listeners().iter().enumerate() {
        let addr = listener.addr();

        let (set, reader, registry_) =
            (listeners.clone(), tree.register_reader(), registry.clone());
        blocked.spawn(format!("udp {addr}"), move || {
            let res = set.listeners()[idx].udp_socket().and_then(|socket| {
                let stats =
                    registry_.publish(WorkerStats::new(Transport::Udp, addr));
                run_udp(socket, reader, stats)
            });
            if let Err(err) = res {
                error!("UDP listener on {addr} failed: {err}");
            }
        })?;

        let (set, reader, registry_) =
            (listeners.clone(), tree.register_reader(), registry.clone());
        blocked.spawn(format!("tcp {addr}"), move || {
            let res = set.listeners()[idx]
                .tcp_listener(TCP_BACKLOG)
                .and_then(|listener| {
                    let stats = registry_
                        .publish(WorkerStats::new(Transport::Tcp, addr));
                    run_tcp(listener, reader, stats, tcp_timeout)
                });
            if let Err(err) = res {
                error!("TCP listener on {addr} failed: {err}");
            }
        })?;
    }
    blocked.spawn("zones".into(), move || {
        if let Err(err) = sources.run(commands) {
            error!("Zone data thread failed: {err}");
        }
    })?;
    Ok(())
}

/// Logs statistics every `interval`.
fn start_stats(
    main_loop: &mut MainLoop,
    registry: Arc<StatsRegistry>,
    interval: Duration,
) {
    main_loop.spawn("stats", async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            registry.log_uptime();
            registry.log_stats();
        }
    });
}

//------------ BindSockets ---------------------------------------------------

/// Binds the listening sockets with the original privileges.
struct BindSockets(Arc<ListenerSet>);

impl PrivilegedOp for BindSockets {
    fn call(&mut self) {
        let failed = self.0.bind_all();
        if failed > 0 {
            debug!("Failed to bind {failed} sockets");
        }
    }
}

//------------ DaemonTakeover ------------------------------------------------

struct DaemonTakeover<'a> {
    helper: &'a mut HelperLink,
    listeners: &'a ListenerSet,
    pidfile: &'a mut Pidfile,

    /// Whether a running instance may be stopped.
    replace: bool,
}

impl<'a> Takeover for DaemonTakeover<'a> {
    fn bind_all(&mut self) -> Result<(), Error> {
        self.helper.pcall().map_err(Into::into)
    }

    fn check_all(&mut self, soft: bool) -> Result<bool, Error> {
        self.listeners.check_all(soft).map_err(Into::into)
    }

    fn replace_predecessor(&mut self) -> Result<(), Error> {
        self.pidfile.acquire(self.replace).map_err(Into::into)
    }
}

//============ Testing =======================================================
