//! Provide tracing, tailored to this program.
//!
//! At startup, the program should call [`init`] with the [`LogConfig`] read
//! from configuration to install a tracing subscriber (i.e., something that
//! emits events to a log). The same `LogConfig` value is then handed to the
//! components that need to know how verbose to be, rather than having them
//! consult ambient state.
//!
//! The rest of program the can include `use tracing::prelude::*` for convenient
//! access to the `trace!()`, `debug!()`, `info!()`, `warn!()`, and `error!()`
//! macros.

use std::{env, fmt};
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use tracing_subscriber::{
    filter::{EnvFilter, LevelFilter},
    fmt::{format::Writer, time::FormatTime},
    prelude::*,
};

#[cfg(target_os = "linux")]
use std::{io, os::unix::io::AsRawFd};

#[cfg(target_os = "linux")]
use nix::libc;

pub mod prelude {
    #[allow(unused_imports)]
    pub use tracing::{debug, error, info, trace, warn};
}

use prelude::*;

/// Log verbosity.
///
/// - `Error`: errors only
/// - `Info`: connection state, shares, device health, errors
/// - `Debug`: plus job distribution and hardware state
/// - `Trace`: plus raw protocol traffic
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, Serialize, Deserialize,
    strum::Display, strum::EnumString,
)]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Error,
    #[default]
    Info,
    Debug,
    Trace,
}

impl From<LogLevel> for LevelFilter {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Error => LevelFilter::ERROR,
            LogLevel::Info => LevelFilter::INFO,
            LogLevel::Debug => LevelFilter::DEBUG,
            LogLevel::Trace => LevelFilter::TRACE,
        }
    }
}

/// Logging configuration captured once at startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct LogConfig {
    pub level: LogLevel,
}

impl LogConfig {
    pub fn new(level: LogLevel) -> Self {
        Self { level }
    }

    /// Whether raw wire traffic (JSON lines, serial frames) should be logged.
    pub fn raw_traffic(&self) -> bool {
        self.level >= LogLevel::Trace
    }

    /// Whether job distribution and hardware state should be logged.
    pub fn detail(&self) -> bool {
        self.level >= LogLevel::Debug
    }
}

impl FromStr for LogConfig {
    type Err = strum::ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self::new(s.trim().parse()?))
    }
}

/// Check if stderr is connected to systemd journal by validating JOURNAL_STREAM.
///
/// Per systemd documentation, JOURNAL_STREAM holds "device:inode" of the
/// stream; compare against stderr's file descriptor to detect redirection.
#[cfg(target_os = "linux")]
fn stderr_is_journal_stream() -> bool {
    let Ok(journal_stream) = env::var("JOURNAL_STREAM") else {
        return false;
    };

    let Some((dev, ino)) = journal_stream.split_once(':') else {
        return false;
    };
    let (Ok(expected_dev), Ok(expected_ino)) = (dev.parse::<u64>(), ino.parse::<u64>()) else {
        return false;
    };

    let fd = io::stderr().as_raw_fd();
    let mut stat: libc::stat = unsafe { std::mem::zeroed() };
    if unsafe { libc::fstat(fd, &mut stat) } != 0 {
        return false;
    }

    stat.st_dev as u64 == expected_dev && stat.st_ino as u64 == expected_ino
}

/// Initialize logging.
///
/// If running under systemd, use journald; otherwise fall back to stdout.
pub fn init(config: &LogConfig) {
    #[cfg(target_os = "linux")]
    {
        if stderr_is_journal_stream() {
            if let Ok(layer) = tracing_journald::layer() {
                tracing_subscriber::registry()
                    .with(filter(config))
                    .with(layer)
                    .init();
                return;
            }
            use_stdout(config);
            error!("Failed to initialize journald logging, using stdout.");
            return;
        }
    }

    use_stdout(config);
}

// The configured level is the default directive. RUST_LOG may still add
// per-target directives on top, e.g. RUST_LOG=mujina_stratum::chip=trace.
fn filter(config: &LogConfig) -> EnvFilter {
    EnvFilter::builder()
        .with_default_directive(LevelFilter::from(config.level).into())
        .with_env_var("RUST_LOG")
        .from_env_lossy()
}

fn use_stdout(config: &LogConfig) {
    tracing_subscriber::registry()
        .with(filter(config))
        .with(tracing_subscriber::fmt::layer().with_timer(LocalTimer))
        .init();
}

// Provide our own timer that formats timestamps in local time and to the
// nearest second. The default timer was in UTC and formatted timestamps as an
// long, ugly string.
struct LocalTimer;

impl FormatTime for LocalTimer {
    fn format_time(&self, w: &mut Writer<'_>) -> fmt::Result {
        let now = OffsetDateTime::now_local().unwrap_or(OffsetDateTime::now_utc());
        let formatted = now
            .format(time::macros::format_description!("[hour]:[minute]:[second]"))
            .map_err(|_| fmt::Error)?;
        write!(w, "{}", formatted)
    }
}
