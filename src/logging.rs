//! Logging and tracing setup.
//!
//! All human-facing logs go to **stderr**; stdout belongs to the host. When
//! the provider is configured with `debug_log`, debug-level events are also
//! appended (no ANSI colours, never rotated) to that file.
//!
//! # Quick Start
//!
//! ```ignore
//! use hemmer_provider_hsdp::init_logging;
//!
//! fn main() {
//!     // Reads RUST_LOG, defaults to info.
//!     init_logging();
//!     tracing::info!("Starting provider");
//! }
//! ```
//!
//! # Environment Variables
//!
//! - `RUST_LOG`: stderr filter (e.g. `info`, `hemmer_provider_hsdp=debug`)
//!
//! The debug file is not affected by `RUST_LOG`.

use std::io::{self, Write};
use std::path::Path;
use std::sync::{Mutex, OnceLock};

use tracing::Level;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::filter::filter_fn;
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use crate::error::ProviderError;

static DEBUG_SINK: OnceLock<Mutex<Option<RollingFileAppender>>> = OnceLock::new();

fn sink() -> &'static Mutex<Option<RollingFileAppender>> {
    DEBUG_SINK.get_or_init(|| Mutex::new(None))
}

fn debug_log_active() -> bool {
    sink().lock().map(|s| s.is_some()).unwrap_or(false)
}

/// Writer feeding the debug file; discards output while no file is attached.
#[derive(Debug, Clone, Copy, Default)]
pub struct DebugLogWriter;

impl Write for DebugLogWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match sink().lock() {
            Ok(mut guard) => match guard.as_mut() {
                Some(file) => file.write(buf),
                None => Ok(buf.len()),
            },
            Err(_) => Ok(buf.len()),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match sink().lock() {
            Ok(mut guard) => match guard.as_mut() {
                Some(file) => file.flush(),
                None => Ok(()),
            },
            Err(_) => Ok(()),
        }
    }
}

impl<'a> MakeWriter<'a> for DebugLogWriter {
    type Writer = DebugLogWriter;

    fn make_writer(&'a self) -> Self::Writer {
        *self
    }
}

/// Append debug logs to `path` from now on. Replaces any earlier file.
pub fn attach_debug_log(path: impl AsRef<Path>) -> Result<(), ProviderError> {
    let path = path.as_ref();
    let file_name = path
        .file_name()
        .and_then(|f| f.to_str())
        .ok_or_else(|| {
            ProviderError::Configuration(format!("debug_log '{}' is not a file path", path.display()))
        })?;
    let dir = match path.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir,
        _ => Path::new("."),
    };
    let appender = RollingFileAppender::builder()
        .rotation(Rotation::NEVER)
        .filename_prefix(file_name)
        .build(dir)
        .map_err(|e| {
            ProviderError::Configuration(format!("cannot open debug_log '{}': {}", path.display(), e))
        })?;

    let mut guard = sink()
        .lock()
        .map_err(|_| ProviderError::Configuration("debug log sink poisoned".into()))?;
    *guard = Some(appender);
    Ok(())
}

/// Stop writing the debug file.
pub fn detach_debug_log() {
    if let Ok(mut guard) = sink().lock() {
        *guard = None;
    }
}

fn subscriber(
    default_level: &str,
) -> impl tracing::Subscriber + Send + Sync + for<'span> tracing_subscriber::registry::LookupSpan<'span>
{
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    tracing_subscriber::registry()
        .with(
            fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(true)
                .with_thread_ids(false)
                .with_file(false)
                .with_line_number(false)
                .with_filter(filter),
        )
        .with(
            fmt::layer()
                .with_writer(DebugLogWriter)
                .with_ansi(false)
                .with_target(true)
                .with_filter(filter_fn(|meta| {
                    *meta.level() <= Level::DEBUG && debug_log_active()
                })),
        )
}

/// Initialize the default subscriber (`info` unless `RUST_LOG` says otherwise).
///
/// # Panics
///
/// Panics if a global subscriber has already been set.
pub fn init_logging() {
    subscriber("info").init();
}

/// Initialize logging with a custom default level for stderr.
///
/// # Panics
///
/// Panics if a global subscriber has already been set.
pub fn init_logging_with_default(default_level: &str) {
    subscriber(default_level).init();
}

/// Try to initialize logging, returning false if a subscriber was already set.
pub fn try_init_logging() -> bool {
    subscriber("info").try_init().is_ok()
}
