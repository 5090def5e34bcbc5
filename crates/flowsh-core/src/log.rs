//! Console and file log sinks with levels that can be changed after start-up.
//!
//! Both sinks sit behind reloadable [`LevelFilter`]s so that a configuration
//! load can retune them. The file sink writes through a shared handle that is
//! swapped when a new log file is configured.

use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{reload, EnvFilter};

use crate::error::{AppError, Result};

pub const TARGET_API: &str = "flowsh::api";
pub const TARGET_CLI: &str = "flowsh::cli";
pub const TARGET_CONFIG: &str = "flowsh::config";
pub const TARGET_PERSISTENCE: &str = "flowsh::persistence";
pub const TARGET_SUBMISSION: &str = "flowsh::submission";
pub const TARGET_RUNTIME: &str = "flowsh::runtime";

type LevelSetter = Box<dyn Fn(LevelFilter) -> std::result::Result<(), reload::Error> + Send + Sync>;

#[derive(Clone, Default)]
struct FileSink {
    file: Arc<Mutex<Option<(PathBuf, File)>>>,
}

impl FileSink {
    fn replace(&self, next: Option<(PathBuf, File)>) {
        let mut guard = self.file.lock().unwrap_or_else(PoisonError::into_inner);
        *guard = next;
    }

    fn path(&self) -> Option<PathBuf> {
        let guard = self.file.lock().unwrap_or_else(PoisonError::into_inner);
        guard.as_ref().map(|(path, _)| path.clone())
    }
}

impl Write for FileSink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut guard = self.file.lock().unwrap_or_else(PoisonError::into_inner);
        match guard.as_mut() {
            Some((_, file)) => file.write(buf),
            None => Ok(buf.len()),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        let mut guard = self.file.lock().unwrap_or_else(PoisonError::into_inner);
        match guard.as_mut() {
            Some((_, file)) => file.flush(),
            None => Ok(()),
        }
    }
}

impl<'a> MakeWriter<'a> for FileSink {
    type Writer = FileSink;

    fn make_writer(&'a self) -> Self::Writer {
        self.clone()
    }
}

/// Handle on the process log sinks.
pub struct AppLog {
    set_console_level: LevelSetter,
    set_file_level: LevelSetter,
    file_sink: FileSink,
    installed: bool,
}

impl std::fmt::Debug for AppLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppLog")
            .field("file_path", &self.file_sink.path())
            .field("installed", &self.installed)
            .finish_non_exhaustive()
    }
}

impl AppLog {
    /// Builds the sinks and tries to install them as the global subscriber.
    ///
    /// When another subscriber is already installed (for example a second
    /// context inside one test binary, or a host with its own tracing setup)
    /// the level setters become no-ops and output goes to that subscriber.
    #[must_use]
    pub fn install(console_level: LevelFilter) -> Self {
        let file_sink = FileSink::default();

        let (console_filter, console_handle) = reload::Layer::new(console_level);
        let (file_filter, file_handle) = reload::Layer::new(LevelFilter::OFF);

        let console_layer = tracing_subscriber::fmt::layer()
            .with_writer(io::stderr)
            .with_target(false)
            .with_filter(console_filter);
        let file_layer = tracing_subscriber::fmt::layer()
            .with_writer(file_sink.clone())
            .with_ansi(false)
            .with_target(true)
            .with_filter(file_filter);

        let installed = tracing_subscriber::registry()
            .with(EnvFilter::try_from_default_env().ok())
            .with(console_layer)
            .with(file_layer)
            .try_init()
            .is_ok();

        Self {
            set_console_level: Box::new(move |level| console_handle.reload(level)),
            set_file_level: Box::new(move |level| file_handle.reload(level)),
            file_sink,
            installed,
        }
    }

    #[must_use]
    pub fn is_installed(&self) -> bool {
        self.installed
    }

    /// # Errors
    /// Returns [`AppError::Configuration`] when the level name is unknown or
    /// the filter cannot be swapped.
    pub fn update_console_level(&self, level: &str) -> Result<()> {
        let level = parse_level(level)?;
        if !self.installed {
            return Ok(());
        }
        (self.set_console_level)(level)
            .map_err(|err| AppError::Configuration(format!("cannot set console level: {err}")))
    }

    /// Opens `path` for appending (creating parent directories) and routes
    /// file log output there at `level`, replacing any previous file sink.
    ///
    /// # Errors
    /// Returns [`AppError::Io`] when the file cannot be opened, or
    /// [`AppError::Configuration`] on an unknown level.
    pub fn add_file_logger(&self, path: &Path, level: &str) -> Result<()> {
        let level = parse_level(level)?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|err| AppError::io(parent, err))?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(|err| AppError::io(path, err))?;
        self.file_sink.replace(Some((path.to_path_buf(), file)));
        if !self.installed {
            return Ok(());
        }
        (self.set_file_level)(level)
            .map_err(|err| AppError::Configuration(format!("cannot set file level: {err}")))
    }

    pub fn remove_file_handlers(&self) {
        self.file_sink.replace(None);
        if self.installed {
            // A stale filter with no sink behind it is harmless.
            let _ = (self.set_file_level)(LevelFilter::OFF);
        }
    }

    #[must_use]
    pub fn file_path(&self) -> Option<PathBuf> {
        self.file_sink.path()
    }
}

/// Maps a configured level name onto a filter. Accepts the usual level names
/// plus `warning`, `critical` and `off`.
///
/// # Errors
/// Returns [`AppError::Configuration`] for unknown names.
pub fn parse_level(value: &str) -> Result<LevelFilter> {
    match value.trim().to_ascii_lowercase().as_str() {
        "trace" => Ok(LevelFilter::TRACE),
        "debug" => Ok(LevelFilter::DEBUG),
        "info" => Ok(LevelFilter::INFO),
        "warn" | "warning" => Ok(LevelFilter::WARN),
        "error" | "critical" => Ok(LevelFilter::ERROR),
        "off" | "none" => Ok(LevelFilter::OFF),
        other => Err(AppError::Configuration(format!(
            "unknown log level {other:?}"
        ))),
    }
}
