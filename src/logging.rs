use std::fs::{File, OpenOptions};
use std::path::Path;
use std::sync::Arc;

use tracing::level_filters::LevelFilter;
use tracing::warn;
use tracing_subscriber::fmt::writer::MakeWriterExt;
use tracing_subscriber::EnvFilter;

/// Setup logging of events reported by the server.
///
/// Logs at info level or, with `debug`, at debug level. Use the RUST_LOG
/// environment variable to override the defaults.
///
/// E.g. To enable trace level logging for the zone tree only:
///   RUST_LOG=INFO,authd::zonetree=TRACE
///
/// If `logfile` is given, events are appended to it in addition to
/// stderr. A file that can’t be opened is reported and skipped.
pub fn init_logging(debug: bool, logfile: Option<&Path>) {
    let default = if debug {
        LevelFilter::DEBUG
    } else {
        LevelFilter::INFO
    };
    let filter = EnvFilter::builder()
        .with_default_directive(default.into())
        .from_env_lossy();
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_thread_ids(true);

    let (file, open_err) = match logfile.map(open_logfile) {
        Some(Ok(file)) => (Some(Arc::new(file)), None),
        Some(Err(err)) => (None, Some(err)),
        None => (None, None),
    };
    match file {
        Some(file) => builder
            .with_ansi(false)
            .with_writer(std::io::stderr.and(file))
            .try_init()
            .ok(),
        None => builder.with_writer(std::io::stderr).try_init().ok(),
    };
    if let (Some(path), Some(err)) = (logfile, open_err) {
        warn!("Cannot open log file {}: {err}", path.display());
    }
}

fn open_logfile(path: &Path) -> std::io::Result<File> {
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir)?;
    }
    OpenOptions::new().create(true).append(true).open(path)
}
