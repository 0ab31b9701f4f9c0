//! File-based logging for foundry builds.
//!
//! Log levels:
//! - ERROR: The build cannot continue, or a resolution fell through to the default model
//! - WARN: Recoverable problems (a task failed a phase, a dangling dependency was tolerated)
//! - INFO: Build lifecycle (start, rounds, summaries)
//! - DEBUG: Per-task phase transitions and pool admission changes
//! - TRACE: Utilization samples and raw response sizes
//!
//! Logs go to `~/.foundry/foundry.log` unless [`init_at`] picks another file.
//! Debug mode can be enabled with `--debug` or `FOUNDRY_DEBUG=1`; `FOUNDRY_LOG`
//! may name an explicit level (`error`, `warn`, `info`, `debug`, `trace`).
//! Nothing is written until one of the `init` functions has run.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::OnceLock;

static LOG_PATH: OnceLock<PathBuf> = OnceLock::new();
static LOG_LEVEL: AtomicU8 = AtomicU8::new(LogLevel::Info as u8);

/// Log levels for filtering messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum LogLevel {
    Error = 0,
    Warn = 1,
    Info = 2,
    Debug = 3,
    Trace = 4,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Error => "ERROR",
            LogLevel::Warn => "WARN",
            LogLevel::Info => "INFO",
            LogLevel::Debug => "DEBUG",
            LogLevel::Trace => "TRACE",
        }
    }

    fn from_u8(v: u8) -> Self {
        match v {
            0 => LogLevel::Error,
            1 => LogLevel::Warn,
            2 => LogLevel::Info,
            3 => LogLevel::Debug,
            _ => LogLevel::Trace,
        }
    }

    /// Parse a level name, case-insensitively.
    pub fn parse(name: &str) -> Option<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "error" => Some(LogLevel::Error),
            "warn" | "warning" => Some(LogLevel::Warn),
            "info" => Some(LogLevel::Info),
            "debug" => Some(LogLevel::Debug),
            "trace" => Some(LogLevel::Trace),
            _ => None,
        }
    }
}

/// Initialize logging to `~/.foundry/foundry.log`.
///
/// `debug` raises the level to DEBUG; `FOUNDRY_DEBUG` and `FOUNDRY_LOG`
/// are consulted as well, with `FOUNDRY_LOG` taking precedence.
pub fn init(debug: bool) {
    let level = level_from_env(debug);
    if let Some(dir) = dirs::home_dir().map(|h| h.join(".foundry")) {
        let _ = std::fs::create_dir_all(&dir);
        init_at(&dir.join("foundry.log"), level);
    } else {
        set_level(level);
    }
}

/// Initialize logging to an explicit file at the given level.
///
/// The file is truncated. Only the first call picks the path.
pub fn init_at(path: &Path, level: LogLevel) {
    set_level(level);
    let _ = std::fs::write(path, "");
    LOG_PATH.set(path.to_path_buf()).ok();
}

fn level_from_env(debug: bool) -> LogLevel {
    if let Some(level) = std::env::var("FOUNDRY_LOG")
        .ok()
        .and_then(|v| LogLevel::parse(&v))
    {
        return level;
    }
    let env_debug = std::env::var("FOUNDRY_DEBUG")
        .map(|v| v == "1" || v.to_lowercase() == "true")
        .unwrap_or(false);
    if debug || env_debug {
        LogLevel::Debug
    } else {
        LogLevel::Info
    }
}

/// Check whether DEBUG messages are being written.
pub fn is_debug() -> bool {
    get_level() >= LogLevel::Debug
}

/// Set the minimum log level for output.
pub fn set_level(level: LogLevel) {
    LOG_LEVEL.store(level as u8, Ordering::SeqCst);
}

/// Get the current log level.
pub fn get_level() -> LogLevel {
    LogLevel::from_u8(LOG_LEVEL.load(Ordering::Relaxed))
}

/// Log a message at the specified level.
pub fn log_at(level: LogLevel, msg: &str) {
    if level > get_level() {
        return;
    }

    if let Some(path) = LOG_PATH.get() {
        if let Ok(mut file) = OpenOptions::new().create(true).append(true).open(path) {
            let timestamp = chrono::Local::now().format("%H:%M:%S%.3f");
            let _ = writeln!(file, "[{}] [{}] {}", timestamp, level.as_str(), msg);
        }
    }
}

pub fn error(msg: &str) {
    log_at(LogLevel::Error, msg);
}

pub fn warn(msg: &str) {
    log_at(LogLevel::Warn, msg);
}

pub fn info(msg: &str) {
    log_at(LogLevel::Info, msg);
}

pub fn debug(msg: &str) {
    log_at(LogLevel::Debug, msg);
}

pub fn trace(msg: &str) {
    log_at(LogLevel::Trace, msg);
}

/// Log at INFO level.
#[macro_export]
macro_rules! flog {
    ($($arg:tt)*) => {
        $crate::log::info(&format!($($arg)*))
    };
}

/// Log at ERROR level.
#[macro_export]
macro_rules! flog_error {
    ($($arg:tt)*) => {
        $crate::log::error(&format!($($arg)*))
    };
}

/// Log at WARN level.
#[macro_export]
macro_rules! flog_warn {
    ($($arg:tt)*) => {
        $crate::log::warn(&format!($($arg)*))
    };
}

/// Log at DEBUG level.
#[macro_export]
macro_rules! flog_debug {
    ($($arg:tt)*) => {
        $crate::log::debug(&format!($($arg)*))
    };
}

/// Log at TRACE level.
#[macro_export]
macro_rules! flog_trace {
    ($($arg:tt)*) => {
        $crate::log::trace(&format!($($arg)*))
    };
}
