//! Configuration and filesystem layout.
//!
//! The configuration lives in `config.toml` in the etc directory. The file
//! is optional and every key has a default. It is read exactly once during
//! startup and afterwards shared as an immutable `Arc<Config>`.

use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;
use std::{cmp, fs, io};

use serde::Deserialize;
use tracing::{debug, warn};

//------------ Config --------------------------------------------------------

#[derive(Clone, Debug, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// The addresses to answer queries on, via both UDP and TCP.
    pub listen: Vec<SocketAddr>,

    /// The user to drop privileges to when started as root.
    pub username: Option<String>,

    /// Lock all memory into RAM.
    pub lock_mem: bool,

    /// The scheduling priority. Defaults to -11 when started as root.
    pub priority: Option<i32>,

    /// Ask for `SO_REUSEPORT` so that a successor can bind alongside us.
    pub reuseport: bool,

    /// Idle timeout of TCP connections in seconds.
    pub tcp_timeout: u64,

    /// Size of the UDP receive buffer in bytes.
    pub udp_recv_buffer: Option<usize>,

    /// Interval of the periodic statistics log in seconds. Zero disables.
    pub stats_interval: u64,

    /// The zone directory, relative to the etc directory.
    pub zones_dir: PathBuf,

    /// A broken zone aborts startup.
    pub zones_strict_startup: bool,

    /// Zones without any serial are rejected.
    pub zones_strict_data: bool,

    /// Interval of periodic zone directory rescans in seconds. Zero means
    /// only on reload.
    pub zones_rescan_interval: u64,

    /// The text returned for queries in the CHAOS class.
    pub chaos_response: String,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            listen: vec![
                SocketAddr::new(Ipv4Addr::UNSPECIFIED.into(), 53),
                SocketAddr::new(Ipv6Addr::UNSPECIFIED.into(), 53),
            ],
            username: None,
            lock_mem: false,
            priority: None,
            reuseport: true,
            tcp_timeout: TCP_TIMEOUT.default(),
            udp_recv_buffer: None,
            stats_interval: 0,
            zones_dir: PathBuf::from("zones"),
            zones_strict_startup: true,
            zones_strict_data: false,
            zones_rescan_interval: 0,
            chaos_response: DEFAULT_CHAOS_RESPONSE.into(),
        }
    }
}

pub const DEFAULT_CHAOS_RESPONSE: &str = "authd";

/// Idle timeout of TCP connections in seconds.
const TCP_TIMEOUT: DefMinMax<u64> = DefMinMax::new(5, 1, 60);

/// The scheduling priority. The default applies only when started as root.
const PRIORITY: DefMinMax<i32> = DefMinMax::new(-11, -20, 20);

impl Config {
    /// Loads the configuration file at `path`.
    ///
    /// A missing file results in the default configuration.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = match fs::read_to_string(path) {
            Ok(text) => text,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                debug!(
                    "No config file at {}, using defaults",
                    path.display()
                );
                return Ok(Config::default());
            }
            Err(source) => {
                return Err(ConfigError::Io {
                    path: path.into(),
                    source,
                })
            }
        };
        Self::from_toml(&text).map_err(|err| match err {
            ConfigError::Parse { source, .. } => ConfigError::Parse {
                path: path.into(),
                source,
            },
            err => err,
        })
    }

    /// Parses and validates configuration text.
    pub fn from_toml(text: &str) -> Result<Self, ConfigError> {
        let config: Config =
            toml::from_str(text).map_err(|source| ConfigError::Parse {
                path: PathBuf::new(),
                source,
            })?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.listen.is_empty() {
            return Err(ConfigError::Invalid(
                "listen must contain at least one address".into(),
            ));
        }
        if let Some(priority) = self.priority {
            if PRIORITY.limit(priority) != priority {
                return Err(ConfigError::Invalid(format!(
                    "priority {priority} outside of -20..=20"
                )));
            }
        }
        if let Some(username) = &self.username {
            if username.is_empty() {
                return Err(ConfigError::Invalid(
                    "username must not be empty".into(),
                ));
            }
        }
        if self.chaos_response.is_empty() || self.chaos_response.len() > 255 {
            return Err(ConfigError::Invalid(
                "chaos_response must be 1 to 255 bytes long".into(),
            ));
        }
        if TCP_TIMEOUT.limit(self.tcp_timeout) != self.tcp_timeout {
            warn!(
                "tcp_timeout {} out of range, using {}",
                self.tcp_timeout,
                TCP_TIMEOUT.limit(self.tcp_timeout)
            );
        }
        Ok(())
    }

    /// Applies the strictness flags given on the command line.
    pub fn force_strict(&mut self, startup: bool, data: bool) {
        self.zones_strict_startup |= startup;
        self.zones_strict_data |= data;
    }

    /// Returns the scheduling priority to set, if any.
    pub fn priority(&self, privileged: bool) -> Option<i32> {
        match self.priority {
            Some(priority) => Some(priority),
            None if privileged => Some(PRIORITY.default()),
            None => None,
        }
    }

    pub fn tcp_timeout(&self) -> Duration {
        Duration::from_secs(TCP_TIMEOUT.limit(self.tcp_timeout))
    }

    pub fn stats_interval(&self) -> Option<Duration> {
        match self.stats_interval {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        }
    }

    pub fn rescan_interval(&self) -> Duration {
        Duration::from_secs(self.zones_rescan_interval)
    }

    /// Returns the zone directory for the given layout.
    pub fn zones_dir(&self, paths: &Paths) -> PathBuf {
        paths.etc_dir().join(&self.zones_dir)
    }
}

//------------ Paths ---------------------------------------------------------

/// Where the daemon keeps its files.
#[derive(Clone, Debug)]
pub struct Paths {
    /// The root directory if one was given.
    root: Option<PathBuf>,
    etc: PathBuf,
    run: PathBuf,
}

/// The name of the root directory argument selecting system paths.
pub const SYSTEM_ROOT: &str = "system";

impl Paths {
    /// Creates the layout for the given root directory argument.
    ///
    /// Without an argument or with `system`, the system-wide directories
    /// are used.
    pub fn new(root: Option<&Path>) -> Self {
        match root {
            Some(root) if root != Path::new(SYSTEM_ROOT) => Paths {
                root: Some(root.into()),
                etc: root.join("etc"),
                run: root.join("run"),
            },
            _ => Paths {
                root: None,
                etc: PathBuf::from("/etc/authd"),
                run: PathBuf::from("/run/authd"),
            },
        }
    }

    /// The root directory to chroot into, if any.
    pub fn root(&self) -> Option<&Path> {
        self.root.as_deref()
    }

    pub fn etc_dir(&self) -> &Path {
        &self.etc
    }

    pub fn run_dir(&self) -> &Path {
        &self.run
    }

    pub fn config_file(&self) -> PathBuf {
        self.etc.join("config.toml")
    }

    pub fn pidfile(&self) -> PathBuf {
        self.run.join("authd.pid")
    }

    pub fn logfile(&self) -> PathBuf {
        self.run.join("authd.log")
    }
}

//------------ DefMinMax -----------------------------------------------------

/// The default, minimum, and maximum values for a config variable.
#[derive(Clone, Copy)]
struct DefMinMax<T> {
    def: T,
    min: T,
    max: T,
}

impl<T: Copy + Ord> DefMinMax<T> {
    const fn new(def: T, min: T, max: T) -> Self {
        Self { def, min, max }
    }

    fn default(self) -> T {
        self.def
    }

    /// Trims the given value to fit into the minimum/maximum range.
    fn limit(self, value: T) -> T {
        cmp::max(self.min, cmp::min(self.max, value))
    }
}

//============ Error Types ===================================================

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("cannot read {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("cannot parse {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

//============ Testing =======================================================
