//! Role-tagged dual-sink logging
//!
//! Every line is `[Role] LEVEL message`, written to stderr and mirrored to
//! the configured log file. A per-process lock is held for the whole line,
//! so concurrent threads never interleave partial lines. The level filter
//! runs before formatting; `RUST_LOG` can still override it.

use oss_common::config::{LogConfig, LogLevel};
use oss_common::role::ProcessRole;
use parking_lot::{Mutex, MutexGuard};
use std::fmt;
use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::Path;
use std::sync::Arc;
use tracing::{Dispatch, Event, Level, Subscriber};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::fmt::format::{self, FormatEvent, FormatFields};
use tracing_subscriber::fmt::{FmtContext, MakeWriter};
use tracing_subscriber::registry::LookupSpan;

/// Map a configured level to the tracing filter
pub fn level_filter(level: LogLevel) -> LevelFilter {
    match level {
        LogLevel::Annoy => LevelFilter::TRACE,
        LogLevel::Debug => LevelFilter::DEBUG,
        LogLevel::Info => LevelFilter::INFO,
        LogLevel::Warn => LevelFilter::WARN,
        LogLevel::Error => LevelFilter::ERROR,
    }
}

fn level_label(level: Level) -> &'static str {
    match level {
        Level::TRACE => "ANNOY",
        Level::DEBUG => "DEBUG",
        Level::INFO => "INFO",
        Level::WARN => "WARN",
        Level::ERROR => "ERROR",
    }
}

/// Stderr plus optional file, serialized by one process-local lock
#[derive(Debug, Clone)]
pub struct DualSink {
    file: Arc<Mutex<Option<File>>>,
    console: bool,
}

impl DualSink {
    /// Sink writing to stderr and, when it can be opened, to `file`.
    ///
    /// An unopenable file is reported once on stderr and skipped.
    pub fn new(file: Option<&Path>) -> Self {
        let file = file.and_then(|path| {
            match OpenOptions::new().create(true).append(true).open(path) {
                Ok(handle) => Some(handle),
                Err(err) => {
                    let _ = writeln!(
                        io::stderr(),
                        "Failed to open log file {}: {err}; logging to stderr only",
                        path.display()
                    );
                    None
                }
            }
        });
        Self {
            file: Arc::new(Mutex::new(file)),
            console: true,
        }
    }

    /// Stop mirroring to stderr.
    pub fn without_console(mut self) -> Self {
        self.console = false;
        self
    }

    /// Whether the file sink is active
    pub fn has_file(&self) -> bool {
        self.file.lock().is_some()
    }
}

/// Writer for one event; holds the sink lock until dropped
pub struct SinkWriter<'a> {
    file: MutexGuard<'a, Option<File>>,
    console: bool,
}

impl Write for SinkWriter<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.console {
            let _ = io::stderr().lock().write_all(buf);
        }
        if let Some(file) = self.file.as_mut() {
            if let Err(err) = file.write_all(buf).and_then(|()| file.flush()) {
                let _ = writeln!(io::stderr(), "Error writing log file: {err}");
            }
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl<'a> MakeWriter<'a> for DualSink {
    type Writer = SinkWriter<'a>;

    fn make_writer(&'a self) -> Self::Writer {
        SinkWriter {
            file: self.file.lock(),
            console: self.console,
        }
    }
}

/// Event formatter producing `[Role] LEVEL message`
#[derive(Debug, Clone, Copy)]
pub struct RoleFormat {
    role: ProcessRole,
}

impl RoleFormat {
    /// Formatter tagging every line with `role`
    pub fn new(role: ProcessRole) -> Self {
        Self { role }
    }
}

impl<S, N> FormatEvent<S, N> for RoleFormat
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        ctx: &FmtContext<'_, S, N>,
        mut writer: format::Writer<'_>,
        event: &Event<'_>,
    ) -> fmt::Result {
        write!(
            writer,
            "[{}] {} ",
            self.role.tag(),
            level_label(*event.metadata().level())
        )?;
        ctx.field_format().format_fields(writer.by_ref(), event)?;
        writeln!(writer)
    }
}

fn env_filter(level: LogLevel) -> EnvFilter {
    EnvFilter::builder()
        .with_default_directive(level_filter(level).into())
        .from_env_lossy()
}

/// Build the logging pipeline for `sink` without installing it.
pub fn dispatch_with_sink(role: ProcessRole, level: LogLevel, sink: DualSink) -> Dispatch {
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(env_filter(level))
        .with_writer(sink)
        .event_format(RoleFormat::new(role))
        .finish();
    Dispatch::new(subscriber)
}

/// Build the logging pipeline described by `config` without installing it.
pub fn dispatch(role: ProcessRole, config: &LogConfig) -> Dispatch {
    let sink = DualSink::new(config.file.as_deref());
    dispatch_with_sink(role, config.level, sink)
}

/// Install the pipeline as the process-wide default.
///
/// Returns `false` if a global subscriber was already set.
pub fn init(role: ProcessRole, config: &LogConfig) -> bool {
    tracing::dispatcher::set_global_default(dispatch(role, config)).is_ok()
}
