//! The error type for everything that can stop the server.

use std::io;

use crate::config::ConfigError;
use crate::daemon::DaemonError;
use crate::net::socks::SocketError;
use crate::zsrc::SourceError;

/// A fatal error.
///
/// Any of these ends up being logged by the orchestrator which then exits
/// with status 1.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("configuration: {0}")]
    Config(#[from] ConfigError),

    #[error("zone data: {0}")]
    Source(#[from] SourceError),

    #[error(transparent)]
    Socket(#[from] SocketError),

    #[error(transparent)]
    Daemon(#[from] DaemonError),

    #[error("{what}: {source}")]
    Io {
        what: &'static str,
        #[source]
        source: io::Error,
    },

    #[error("{0}")]
    Startup(String),
}

impl Error {
    pub(crate) fn io(what: &'static str) -> impl FnOnce(io::Error) -> Self {
        move |source| Error::Io { what, source }
    }
}
