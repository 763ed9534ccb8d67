use crate::bus::DEFAULT_CHANNEL_PREFIX;
use anyhow::{Context, Result};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// Timing and buffering knobs of a client session.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Deadline for every outbound socket write.
    pub write_wait: Duration,
    /// Read deadline window, refreshed on each pong.
    pub pong_wait: Duration,
    /// Keepalive period. Must be shorter than `pong_wait`.
    pub ping_period: Duration,
    /// Capacity of the per-session outbound channel.
    pub outbound_buffer: usize,
    pub channel_prefix: String,
}

impl SessionConfig {
    pub fn new(write_wait: Duration, pong_wait: Duration) -> Self {
        Self {
            write_wait,
            pong_wait,
            ping_period: pong_wait * 9 / 10,
            ..Self::default()
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        let pong_wait = Duration::from_secs(60);
        Self {
            write_wait: Duration::from_secs(10),
            pong_wait,
            ping_period: pong_wait * 9 / 10,
            outbound_buffer: 256,
            channel_prefix: DEFAULT_CHANNEL_PREFIX.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BusBackend {
    Memory,
    Postgres(String),
}

#[derive(Debug, Clone)]
pub struct Config {
    pub bind: String,
    pub db_path: PathBuf,
    pub bus: BusBackend,
    pub session: SessionConfig,
}

impl Config {
    /// Reads `PARLEY_*` variables, falling back to defaults for unset ones.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let bind = lookup("PARLEY_BIND").unwrap_or_else(|| "0.0.0.0:3000".into());

        let db_path = match lookup("PARLEY_DB_PATH") {
            Some(path) => PathBuf::from(path),
            None => {
                let home_dir = lookup("HOME").unwrap_or_else(|| ".".into());
                PathBuf::from(home_dir).join(".parley").join("parley.db")
            }
        };

        let bus = match lookup("PARLEY_BUS").as_deref() {
            None | Some("") | Some("memory") => BusBackend::Memory,
            Some(url) => BusBackend::Postgres(url.to_string()),
        };

        let write_wait = Duration::from_secs(parse_or(&lookup, "PARLEY_WRITE_WAIT_SECS", 10)?);
        let pong_wait = Duration::from_secs(parse_or(&lookup, "PARLEY_PONG_WAIT_SECS", 60)?);
        anyhow::ensure!(!pong_wait.is_zero(), "PARLEY_PONG_WAIT_SECS must be positive");

        let mut session = SessionConfig::new(write_wait, pong_wait);
        session.outbound_buffer = parse_or(&lookup, "PARLEY_OUTBOUND_BUFFER", 256)?;
        anyhow::ensure!(session.outbound_buffer > 0, "PARLEY_OUTBOUND_BUFFER must be positive");
        if let Some(prefix) = lookup("PARLEY_CHANNEL_PREFIX") {
            session.channel_prefix = prefix;
        }

        Ok(Self {
            bind,
            db_path,
            bus,
            session,
        })
    }
}

fn parse_or<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match lookup(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .with_context(|| format!("Invalid value for {}: {:?}", key, raw)),
        None => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config(vars: &[(&str, &str)]) -> Result<Config> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn defaults_when_nothing_is_set() {
        let config = config(&[("HOME", "/home/u")]).unwrap();
        assert_eq!(config.bind, "0.0.0.0:3000");
        assert_eq!(config.db_path, PathBuf::from("/home/u/.parley/parley.db"));
        assert_eq!(config.bus, BusBackend::Memory);
        assert_eq!(config.session.write_wait, Duration::from_secs(10));
        assert_eq!(config.session.pong_wait, Duration::from_secs(60));
        assert_eq!(config.session.ping_period, Duration::from_secs(54));
        assert_eq!(config.session.outbound_buffer, 256);
        assert_eq!(config.session.channel_prefix, "user:");
    }

    #[test]
    fn overrides_and_postgres_bus() {
        let config = config(&[
            ("PARLEY_BUS", "postgres://localhost/chat"),
            ("PARLEY_PONG_WAIT_SECS", "20"),
            ("PARLEY_OUTBOUND_BUFFER", "8"),
            ("PARLEY_CHANNEL_PREFIX", "chat:"),
        ])
        .unwrap();
        assert_eq!(
            config.bus,
            BusBackend::Postgres("postgres://localhost/chat".into())
        );
        assert_eq!(config.session.ping_period, Duration::from_secs(18));
        assert!(config.session.ping_period < config.session.pong_wait);
        assert_eq!(config.session.outbound_buffer, 8);
        assert_eq!(config.session.channel_prefix, "chat:");
    }

    #[test]
    fn rejects_invalid_numbers() {
        assert!(config(&[("PARLEY_WRITE_WAIT_SECS", "soon")]).is_err());
        assert!(config(&[("PARLEY_PONG_WAIT_SECS", "0")]).is_err());
        assert!(config(&[("PARLEY_OUTBOUND_BUFFER", "0")]).is_err());
    }
}
