//! Console logging backend.
//!
//! The core crates log through the `log` facade only.  This crate is the
//! sink: it installs a `log::Log` implementation that writes one colored
//! `[LEVEL] target: message` line per record to stderr.
//!
//! Writers are serialized by a spin lock so lines from different threads
//! never interleave, but the ORDER of lines from different threads is
//! non-deterministic.

use std::fmt;
use std::io::{IsTerminal, Write};
use std::sync::atomic::{AtomicBool, Ordering};

use log::{LevelFilter, Log, Metadata, Record, SetLoggerError};

/// Log levels
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Level {
    Trace = 0,
    Debug = 1,
    Info = 2,
    Warn = 3,
    Error = 4,
}

impl Level {
    pub fn as_str(&self) -> &'static str {
        match self {
            Level::Trace => "TRACE",
            Level::Debug => "DEBUG",
            Level::Info => " INFO",
            Level::Warn => " WARN",
            Level::Error => "ERROR",
        }
    }

    pub fn color(&self) -> &'static str {
        match self {
            Level::Trace => "\x1b[90m", // Gray
            Level::Debug => "\x1b[36m", // Cyan
            Level::Info => "\x1b[32m",  // Green
            Level::Warn => "\x1b[33m",  // Yellow
            Level::Error => "\x1b[31m", // Red
        }
    }
}

impl From<log::Level> for Level {
    fn from(level: log::Level) -> Self {
        match level {
            log::Level::Trace => Level::Trace,
            log::Level::Debug => Level::Debug,
            log::Level::Info => Level::Info,
            log::Level::Warn => Level::Warn,
            log::Level::Error => Level::Error,
        }
    }
}

/// Format one console line, including the trailing newline.
///
/// With `color` the level tag is wrapped in its ANSI color and reset.
pub fn format_line(level: Level, target: &str, args: fmt::Arguments, color: bool) -> String {
    if color {
        format!("{}[{}]\x1b[0m {}: {}\n", level.color(), level.as_str(), target, args)
    } else {
        format!("[{}] {}: {}\n", level.as_str(), target, args)
    }
}

/// Serializes whole lines on the console.
static CONSOLE: spin::Mutex<()> = spin::Mutex::new(());

struct ConsoleLogger {
    color: AtomicBool,
}

static LOGGER: ConsoleLogger = ConsoleLogger {
    color: AtomicBool::new(false),
};

impl Log for ConsoleLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let line = format_line(
            record.level().into(),
            record.target(),
            *record.args(),
            self.color.load(Ordering::Relaxed),
        );

        let _console = CONSOLE.lock();
        let _ = std::io::stderr().lock().write_all(line.as_bytes());
    }

    fn flush(&self) {
        let _console = CONSOLE.lock();
        let _ = std::io::stderr().lock().flush();
    }
}

/// Install the console logger and set the maximum level.
///
/// Colors are used only when stderr is a terminal.  Fails if another
/// logger has already been installed in this process.
pub fn init(level: LevelFilter) -> Result<(), SetLoggerError> {
    LOGGER
        .color
        .store(std::io::stderr().is_terminal(), Ordering::Relaxed);
    log::set_logger(&LOGGER)?;
    log::set_max_level(level);
    Ok(())
}

/// Like [`init`], but tolerates an already-installed logger.
///
/// Meant for tests, where every test function may try to set it up.
pub fn try_init(level: LevelFilter) {
    if init(level).is_err() {
        log::set_max_level(level);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn levels_are_ordered_by_severity() {
        assert!(Level::Trace < Level::Debug);
        assert!(Level::Warn < Level::Error);
        assert_eq!(Level::from(log::Level::Warn), Level::Warn);
        assert_eq!(Level::from(log::Level::Trace), Level::Trace);
    }

    #[test]
    fn plain_line_has_tag_target_and_newline() {
        let line = format_line(Level::Warn, "dmabuf::fence", format_args!("x = {}", 42), false);
        assert_eq!(line, "[ WARN] dmabuf::fence: x = 42\n");
    }

    #[test]
    fn colored_line_resets_after_tag() {
        let line = format_line(Level::Error, "t", format_args!("boom"), true);
        assert!(line.starts_with("\x1b[31m[ERROR]\x1b[0m "));
        assert!(line.ends_with("t: boom\n"));
    }

    #[test]
    fn try_init_is_idempotent() {
        try_init(LevelFilter::Debug);
        try_init(LevelFilter::Trace);
        assert_eq!(log::max_level(), LevelFilter::Trace);
        log::debug!("[klog] logger installed");
    }
}
