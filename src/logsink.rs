//! Ambient logging and logger collaborator.
//!
//! The original treats logging as an opaque async-capable collaborator
//! (`Log::get_instance()`): the core only calls `info`/`error` style
//! entry points and never inspects the sink's internals. [`Logger`] is
//! that seam; [`TracingLogger`] backs it with `tracing` +
//! `tracing-appender`'s non-blocking writer.

use std::{io, path::Path};

use tracing_subscriber::{fmt::writer::BoxMakeWriter, EnvFilter};

/// The logging collaborator surface the reactor core depends on.
pub trait Logger: Send + Sync {
    fn info(&self, msg: &str);
    fn error(&self, msg: &str);
    /// Best-effort flush; the non-blocking backend flushes its queue on
    /// drop regardless, so this is a hint, not a guarantee.
    fn flush(&self);
}

/// A `tracing`-backed logger. `async_queue_depth` mirrors the original's
/// "async" vs "sync" log modes: a nonzero depth buffers writes off the
/// calling thread (`tracing_appender::non_blocking`); zero writes the
/// file directly on the caller's thread.
///
/// `max_lines_per_file` mirrors the original's line-count-based log
/// rotation. `tracing-appender` rotates by calendar period rather than
/// line count, so this value is accepted for interface parity but does
/// not currently drive rotation; see DESIGN.md.
pub struct TracingLogger {
    _guard: Option<tracing_appender::non_blocking::WorkerGuard>,
}

impl TracingLogger {
    pub fn init(
        path: impl AsRef<Path>,
        _max_lines_per_file: usize,
        async_queue_depth: usize,
    ) -> io::Result<Self> {
        let path = path.as_ref();
        let dir = path.parent().filter(|p| !p.as_os_str().is_empty()).unwrap_or_else(|| Path::new("."));
        let file_name = path
            .file_name()
            .and_then(|s| s.to_str())
            .unwrap_or("reactord.log")
            .to_string();
        std::fs::create_dir_all(dir)?;

        let file_appender = tracing_appender::rolling::never(dir, file_name);
        let (writer, guard) = if async_queue_depth > 0 {
            let (non_blocking, guard) = tracing_appender::non_blocking::NonBlockingBuilder::default()
                .buffered_lines_limit(async_queue_depth)
                .finish(file_appender);
            (BoxMakeWriter::new(non_blocking), Some(guard))
        } else {
            (BoxMakeWriter::new(file_appender), None)
        };

        let _ = tracing_subscriber::fmt()
            .with_writer(writer)
            .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
            .try_init();

        Ok(Self { _guard: guard })
    }
}

impl Logger for TracingLogger {
    fn info(&self, msg: &str) {
        tracing::info!(target: "reactord", "{msg}");
    }

    fn error(&self, msg: &str) {
        tracing::error!(target: "reactord", "{msg}");
    }

    fn flush(&self) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_creates_log_file_and_directory() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("reactord.log");
        let logger = TracingLogger::init(&path, 100_000, 0).unwrap();
        logger.info("started");
        logger.flush();
        assert!(path.exists());
    }
}
