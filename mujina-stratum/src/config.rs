//! Configuration for the mujina-stratum daemon.
//!
//! Everything comes from `MUJINA_*` environment variables, read once at
//! startup by [`Config::from_env`]. Any malformed value is a fatal
//! [`Error::Config`]; the daemon refuses to start rather than guess.
//!
//! | Variable | Default |
//! |---|---|
//! | `MUJINA_POOL_URL` | unset: dummy job source |
//! | `MUJINA_POOL_USER` | `mujina-testing` |
//! | `MUJINA_POOL_PASS` | `x` |
//! | `MUJINA_POOL_SUGGEST_DIFFICULTY` | unset |
//! | `MUJINA_LOG_LEVEL` | `info` |
//! | `MUJINA_HARDWARE` | `cpu` (`cpu`, `bm1370`, `none`) |
//! | `MUJINA_SERIAL_PORTS` | `/dev/ttyACM0` |
//! | `MUJINA_CPUMINER_THREADS` | `1` |
//! | `MUJINA_CPUMINER_DUTY` | `50` |
//! | `MUJINA_DUMMY_INTERVAL_SECS` | `30` |
//! | `MUJINA_DUMMY_DIFFICULTY` | `1` |
//! | `MUJINA_STALE_WORK_SECS` | `120` |

use std::env;
use std::fmt::Display;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::stratum_v1::{PoolConfig, PoolUrl};
use crate::tracing::LogConfig;
use crate::types::Difficulty;

const DEFAULT_USER: &str = "mujina-testing";
const DEFAULT_PASS: &str = "x";
const DEFAULT_SERIAL_PORT: &str = "/dev/ttyACM0";
const DEFAULT_CPU_THREADS: usize = 1;
const DEFAULT_CPU_DUTY: u8 = 50;
const DEFAULT_DUMMY_INTERVAL_SECS: u64 = 30;
const DEFAULT_STALE_WORK_SECS: u64 = 120;

/// Which hash threads to run.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, strum::Display,
    strum::EnumString,
)]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
#[serde(rename_all = "lowercase")]
pub enum HardwareKind {
    #[default]
    Cpu,
    Bm1370,
    None,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HardwareConfig {
    pub kind: HardwareKind,

    /// Serial devices, one chip chain each
    pub serial_ports: Vec<String>,

    pub cpu_threads: usize,

    /// Percent of each cycle a CPU thread spends hashing
    pub cpu_duty: u8,
}

/// Settings for the dummy source used when no pool is configured.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DummyConfig {
    pub interval: Duration,
    pub difficulty: Difficulty,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    pub log: LogConfig,

    /// `None` runs the dummy source
    pub pool: Option<PoolConfig>,

    pub dummy: DummyConfig,

    pub hardware: HardwareConfig,

    /// How long workers keep searching the last job after the pool drops
    pub stale_work: Duration,
}

impl Config {
    /// Read the configuration from the process environment.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Read the configuration through `lookup`, which maps a variable name to
    /// its value. Empty values count as unset.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let get = |key: &str| {
            lookup(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };

        let log = match get("MUJINA_LOG_LEVEL") {
            Some(level) => level
                .parse::<LogConfig>()
                .map_err(|e| invalid("MUJINA_LOG_LEVEL", &level, e))?,
            None => LogConfig::default(),
        };

        let pool = match get("MUJINA_POOL_URL") {
            Some(url) => {
                let url: PoolUrl = url.parse().map_err(|e| invalid("MUJINA_POOL_URL", &url, e))?;
                let mut pool = PoolConfig::new(
                    url,
                    get("MUJINA_POOL_USER").unwrap_or_else(|| DEFAULT_USER.into()),
                    get("MUJINA_POOL_PASS").unwrap_or_else(|| DEFAULT_PASS.into()),
                );
                pool.suggest_difficulty = get("MUJINA_POOL_SUGGEST_DIFFICULTY")
                    .map(|v| difficulty("MUJINA_POOL_SUGGEST_DIFFICULTY", &v))
                    .transpose()?;
                Some(pool)
            }
            None => None,
        };

        let kind = parse_or(&get, "MUJINA_HARDWARE", HardwareKind::default())?;
        let serial_ports = get("MUJINA_SERIAL_PORTS")
            .unwrap_or_else(|| DEFAULT_SERIAL_PORT.into())
            .split(',')
            .map(str::trim)
            .filter(|p| !p.is_empty())
            .map(String::from)
            .collect::<Vec<_>>();
        if kind == HardwareKind::Bm1370 && serial_ports.is_empty() {
            return Err(Error::Config("MUJINA_SERIAL_PORTS names no devices".into()));
        }

        let cpu_threads = parse_or(&get, "MUJINA_CPUMINER_THREADS", DEFAULT_CPU_THREADS)?;
        if cpu_threads == 0 {
            return Err(Error::Config("MUJINA_CPUMINER_THREADS must be at least 1".into()));
        }
        let cpu_duty = parse_or(&get, "MUJINA_CPUMINER_DUTY", DEFAULT_CPU_DUTY)?;
        if !(1..=100).contains(&cpu_duty) {
            return Err(Error::Config(format!(
                "MUJINA_CPUMINER_DUTY must be 1 to 100, got {cpu_duty}"
            )));
        }

        let dummy = DummyConfig {
            interval: seconds(&get, "MUJINA_DUMMY_INTERVAL_SECS", DEFAULT_DUMMY_INTERVAL_SECS)?,
            difficulty: match get("MUJINA_DUMMY_DIFFICULTY") {
                Some(v) => difficulty("MUJINA_DUMMY_DIFFICULTY", &v)?,
                None => Difficulty::ONE,
            },
        };

        let stale_work = seconds(&get, "MUJINA_STALE_WORK_SECS", DEFAULT_STALE_WORK_SECS)?;

        Ok(Self {
            log,
            pool,
            dummy,
            hardware: HardwareConfig {
                kind,
                serial_ports,
                cpu_threads,
                cpu_duty,
            },
            stale_work,
        })
    }
}

fn invalid(key: &str, value: &str, err: impl Display) -> Error {
    Error::Config(format!("{key}={value:?}: {err}"))
}

fn parse_or<T>(get: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: Display,
{
    match get(key) {
        Some(v) => v.parse().map_err(|e| invalid(key, &v, e)),
        None => Ok(default),
    }
}

fn seconds(get: &impl Fn(&str) -> Option<String>, key: &str, default: u64) -> Result<Duration> {
    let secs: u64 = parse_or(get, key, default)?;
    if secs == 0 {
        return Err(Error::Config(format!("{key} must be at least 1")));
    }
    Ok(Duration::from_secs(secs))
}

fn difficulty(key: &str, value: &str) -> Result<Difficulty> {
    let raw: f64 = value.parse().map_err(|e| invalid(key, value, e))?;
    Difficulty::new(raw).map_err(|e| invalid(key, value, e))
}
