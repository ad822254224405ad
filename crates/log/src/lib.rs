//! Logging for the SPV stack: a process-wide level filter, plain or JSON
//! lines on stderr, and display helpers for hashes in log messages.

use std::fmt;
use std::io::{self, Write};
use std::sync::atomic::{AtomicU8, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use serde_json::json;

#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd)]
pub enum Level {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl Level {
    pub fn name(self) -> &'static str {
        match self {
            Self::Error => "error",
            Self::Warn => "warn",
            Self::Info => "info",
            Self::Debug => "debug",
            Self::Trace => "trace",
        }
    }
}

impl std::str::FromStr for Level {
    type Err = ();

    fn from_str(raw: &str) -> Result<Self, ()> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "error" => Ok(Self::Error),
            "warn" | "warning" => Ok(Self::Warn),
            "info" => Ok(Self::Info),
            "debug" => Ok(Self::Debug),
            "trace" => Ok(Self::Trace),
            _ => Err(()),
        }
    }
}

// The whole logger configuration lives in one atomic byte: the low three
// bits hold the level ceiling, the flag bits select output shape.
const LEVEL_MASK: u8 = 0x07;
const JSON_BIT: u8 = 0x08;
const NO_TIME_BIT: u8 = 0x10;

static CONFIG: AtomicU8 = AtomicU8::new(Level::Info as u8);

pub fn configure(level: Level, json: bool, timestamps: bool) {
    let mut bits = level as u8;
    if json {
        bits |= JSON_BIT;
    }
    if !timestamps {
        bits |= NO_TIME_BIT;
    }
    CONFIG.store(bits, Ordering::Relaxed);
}

pub fn set_level(level: Level) {
    let flags = CONFIG.load(Ordering::Relaxed) & !LEVEL_MASK;
    CONFIG.store(flags | level as u8, Ordering::Relaxed);
}

/// Applies `SPVD_LOG`, a comma-separated list like `debug`, `trace,json`,
/// or `info,notime`. Unset leaves the defaults (info, plain, timestamps).
pub fn init_from_env() {
    let Ok(raw) = std::env::var("SPVD_LOG") else {
        return;
    };
    let mut level = Level::Info;
    let mut json = false;
    let mut timestamps = true;
    for part in raw.split(',') {
        if let Ok(parsed) = part.parse::<Level>() {
            level = parsed;
        } else {
            match part.trim().to_ascii_lowercase().as_str() {
                "json" => json = true,
                "notime" => timestamps = false,
                _ => {}
            }
        }
    }
    configure(level, json, timestamps);
}

pub fn enabled(level: Level) -> bool {
    level as u8 <= CONFIG.load(Ordering::Relaxed) & LEVEL_MASK
}

pub fn emit(level: Level, module: &'static str, args: fmt::Arguments<'_>) {
    let config = CONFIG.load(Ordering::Relaxed);
    if level as u8 > config & LEVEL_MASK {
        return;
    }

    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default();
    let mut out = io::stderr().lock();

    if config & JSON_BIT != 0 {
        let line = json!({
            "t": now.as_secs(),
            "ms": now.subsec_millis(),
            "level": level.name(),
            "module": module,
            "msg": args.to_string(),
        });
        let _ = writeln!(out, "{line}");
        return;
    }

    if config & NO_TIME_BIT == 0 {
        let _ = write!(out, "{}.{:03} ", now.as_secs(), now.subsec_millis());
    }
    let _ = writeln!(out, "{} {}: {}", level.name(), module, args);
}

#[macro_export]
macro_rules! log_error {
    ($($arg:tt)*) => {
        $crate::emit($crate::Level::Error, module_path!(), format_args!($($arg)*))
    };
}

#[macro_export]
macro_rules! log_warn {
    ($($arg:tt)*) => {
        $crate::emit($crate::Level::Warn, module_path!(), format_args!($($arg)*))
    };
}

#[macro_export]
macro_rules! log_info {
    ($($arg:tt)*) => {
        $crate::emit($crate::Level::Info, module_path!(), format_args!($($arg)*))
    };
}

#[macro_export]
macro_rules! log_debug {
    ($($arg:tt)*) => {
        $crate::emit($crate::Level::Debug, module_path!(), format_args!($($arg)*))
    };
}

#[macro_export]
macro_rules! log_trace {
    ($($arg:tt)*) => {
        $crate::emit($crate::Level::Trace, module_path!(), format_args!($($arg)*))
    };
}

/// Abbreviated tx or block hash for log lines: eight hex digits from the
/// varying (little-endian leading) end of the hash.
pub struct ShortHash<'a>(pub &'a [u8; 32]);

impl fmt::Display for ShortHash<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in self.0.iter().take(4) {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}
