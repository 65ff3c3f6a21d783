//! Load node config from file and environment.

use std::collections::BTreeMap;
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use zre_core::liveness::{
    DEFAULT_EXPIRED_TIMEOUT, DEFAULT_HANDSHAKE_TIMEOUT, DEFAULT_EVASIVE_TIMEOUT,
    DEFAULT_PING_INTERVAL, DEFAULT_SILENT_TIMEOUT,
};
use zre_core::{Timeouts, TimeoutsError, DISCOVERY_PORT};

/// Node configuration. File: ~/.config/zre/config.toml or /etc/zre/config.toml.
/// Env overrides: ZRE_NAME, ZRE_DISCOVERY_PORT, ZRE_MAILBOX_PORT,
/// ZRE_BEACON_ADDRESS, ZRE_BEACON_INTERVAL_MS.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Human-readable name announced in Hello (default: short node ID).
    #[serde(default)]
    pub name: Option<String>,
    /// Discovery UDP port (default 5670).
    #[serde(default = "default_discovery_port")]
    pub discovery_port: u16,
    /// Where beacons are sent (default 255.255.255.255).
    #[serde(default = "default_beacon_address")]
    pub beacon_address: Ipv4Addr,
    /// Local address for the beacon socket and mailbox listener.
    #[serde(default = "default_bind_address")]
    pub bind_address: Ipv4Addr,
    /// Mailbox TCP port; 0 picks an ephemeral port.
    #[serde(default)]
    pub mailbox_port: u16,
    #[serde(default = "default_beacon_interval_ms")]
    pub beacon_interval_ms: u64,
    #[serde(default = "default_reap_interval_ms")]
    pub reap_interval_ms: u64,
    #[serde(default = "default_ping_interval_ms")]
    pub ping_interval_ms: u64,
    #[serde(default = "default_evasive_timeout_ms")]
    pub evasive_timeout_ms: u64,
    #[serde(default = "default_silent_timeout_ms")]
    pub silent_timeout_ms: u64,
    #[serde(default = "default_expired_timeout_ms")]
    pub expired_timeout_ms: u64,
    #[serde(default = "default_handshake_timeout_ms")]
    pub handshake_timeout_ms: u64,
    /// Headers announced in Hello.
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
}

fn default_discovery_port() -> u16 {
    DISCOVERY_PORT
}
fn default_beacon_address() -> Ipv4Addr {
    Ipv4Addr::BROADCAST
}
fn default_bind_address() -> Ipv4Addr {
    Ipv4Addr::UNSPECIFIED
}
fn default_beacon_interval_ms() -> u64 {
    1000
}
fn default_reap_interval_ms() -> u64 {
    500
}
fn default_ping_interval_ms() -> u64 {
    DEFAULT_PING_INTERVAL.as_millis() as u64
}
fn default_evasive_timeout_ms() -> u64 {
    DEFAULT_EVASIVE_TIMEOUT.as_millis() as u64
}
fn default_silent_timeout_ms() -> u64 {
    DEFAULT_SILENT_TIMEOUT.as_millis() as u64
}
fn default_expired_timeout_ms() -> u64 {
    DEFAULT_EXPIRED_TIMEOUT.as_millis() as u64
}
fn default_handshake_timeout_ms() -> u64 {
    DEFAULT_HANDSHAKE_TIMEOUT.as_millis() as u64
}

impl Default for Config {
    fn default() -> Self {
        Self {
            name: None,
            discovery_port: default_discovery_port(),
            beacon_address: default_beacon_address(),
            bind_address: default_bind_address(),
            mailbox_port: 0,
            beacon_interval_ms: default_beacon_interval_ms(),
            reap_interval_ms: default_reap_interval_ms(),
            ping_interval_ms: default_ping_interval_ms(),
            evasive_timeout_ms: default_evasive_timeout_ms(),
            silent_timeout_ms: default_silent_timeout_ms(),
            expired_timeout_ms: default_expired_timeout_ms(),
            handshake_timeout_ms: default_handshake_timeout_ms(),
            headers: BTreeMap::new(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("invalid value {value:?} for {var}")]
    Env { var: &'static str, value: String },
    #[error("reap interval must be shorter than the beacon interval")]
    ReapInterval,
    #[error(transparent)]
    Timeouts(#[from] TimeoutsError),
}

impl Config {
    pub fn beacon_interval(&self) -> Duration {
        Duration::from_millis(self.beacon_interval_ms)
    }

    pub fn reap_interval(&self) -> Duration {
        Duration::from_millis(self.reap_interval_ms)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    pub fn timeouts(&self) -> Timeouts {
        Timeouts {
            ping_interval: Duration::from_millis(self.ping_interval_ms),
            evasive: Duration::from_millis(self.evasive_timeout_ms),
            silent: Duration::from_millis(self.silent_timeout_ms),
            expired: Duration::from_millis(self.expired_timeout_ms),
            handshake: self.handshake_timeout(),
        }
    }

    /// Intervals must nest: reap < beacon < evasive < silent < expired.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.reap_interval_ms == 0 || self.reap_interval() >= self.beacon_interval() {
            return Err(ConfigError::ReapInterval);
        }
        self.timeouts().validate(self.beacon_interval())?;
        Ok(())
    }

    /// Apply ZRE_* overrides through `lookup`.
    pub fn apply_env_from<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(s) = lookup("ZRE_NAME") {
            self.name = Some(s);
        }
        if let Some(s) = lookup("ZRE_DISCOVERY_PORT") {
            self.discovery_port = parse_env("ZRE_DISCOVERY_PORT", s)?;
        }
        if let Some(s) = lookup("ZRE_MAILBOX_PORT") {
            self.mailbox_port = parse_env("ZRE_MAILBOX_PORT", s)?;
        }
        if let Some(s) = lookup("ZRE_BEACON_ADDRESS") {
            self.beacon_address = parse_env("ZRE_BEACON_ADDRESS", s)?;
        }
        if let Some(s) = lookup("ZRE_BEACON_INTERVAL_MS") {
            self.beacon_interval_ms = parse_env("ZRE_BEACON_INTERVAL_MS", s)?;
        }
        Ok(())
    }

    pub fn apply_env(&mut self) -> Result<(), ConfigError> {
        self.apply_env_from(|var| std::env::var(var).ok())
    }
}

fn parse_env<T: std::str::FromStr>(var: &'static str, value: String) -> Result<T, ConfigError> {
    value
        .parse::<T>()
        .map_err(|_| ConfigError::Env { var, value })
}

/// Load config: merge default, then the first config file present, then env vars.
pub fn load() -> Result<Config, ConfigError> {
    let mut c = match config_paths().into_iter().find(|p| p.exists()) {
        Some(path) => load_from(&path)?,
        None => Config::default(),
    };
    c.apply_env()?;
    c.validate()?;
    Ok(c)
}

/// Parse one config file. Missing keys take their defaults.
pub fn load_from(path: &Path) -> Result<Config, ConfigError> {
    let s = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    toml::from_str::<Config>(&s).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

fn config_paths() -> Vec<PathBuf> {
    let home = std::env::var_os("HOME").map(PathBuf::from);
    let mut out = Vec::new();
    if let Some(h) = home {
        out.push(h.join(".config/zre/config.toml"));
    }
    out.push(PathBuf::from("/etc/zre/config.toml"));
    out
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::io::Write;

    use super::*;

    #[test]
    fn defaults_validate() {
        let c = Config::default();
        assert_eq!(c.discovery_port, 5670);
        assert_eq!(c.beacon_address, Ipv4Addr::BROADCAST);
        assert_eq!(c.timeouts(), Timeouts::default());
        c.validate().unwrap();
    }

    #[test]
    fn partial_file_keeps_defaults() {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            f,
            "name = \"t1\"\ndiscovery_port = 5999\nbeacon_address = \"127.255.255.255\"\n\n[headers]\nrole = \"sensor\""
        )
        .unwrap();
        let c = load_from(f.path()).unwrap();
        assert_eq!(c.name.as_deref(), Some("t1"));
        assert_eq!(c.discovery_port, 5999);
        assert_eq!(c.beacon_address, Ipv4Addr::new(127, 255, 255, 255));
        assert_eq!(c.beacon_interval_ms, 1000);
        assert_eq!(c.headers.get("role").map(String::as_str), Some("sensor"));
    }

    #[test]
    fn unknown_key_rejected() {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        writeln!(f, "proxy_port = 3128").unwrap();
        assert!(matches!(
            load_from(f.path()),
            Err(ConfigError::Parse { .. })
        ));
    }

    #[test]
    fn missing_file_is_io_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = load_from(&dir.path().join("nope.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::Io { .. }));
    }

    #[test]
    fn env_overrides() {
        let vars: HashMap<&str, &str> = [
            ("ZRE_NAME", "edge"),
            ("ZRE_DISCOVERY_PORT", "6000"),
            ("ZRE_BEACON_ADDRESS", "127.255.255.255"),
            ("ZRE_BEACON_INTERVAL_MS", "200"),
        ]
        .into_iter()
        .collect();
        let mut c = Config::default();
        c.reap_interval_ms = 100;
        c.apply_env_from(|k| vars.get(k).map(|v| v.to_string()))
            .unwrap();
        assert_eq!(c.name.as_deref(), Some("edge"));
        assert_eq!(c.discovery_port, 6000);
        assert_eq!(c.beacon_address, Ipv4Addr::new(127, 255, 255, 255));
        assert_eq!(c.beacon_interval(), Duration::from_millis(200));
        c.validate().unwrap();
    }

    #[test]
    fn bad_env_value_rejected() {
        let mut c = Config::default();
        let err = c
            .apply_env_from(|k| (k == "ZRE_MAILBOX_PORT").then(|| "99999".to_string()))
            .unwrap_err();
        assert!(matches!(err, ConfigError::Env { var: "ZRE_MAILBOX_PORT", .. }));
    }

    #[test]
    fn interval_ordering_enforced() {
        let c = Config {
            reap_interval_ms: 1000,
            ..Config::default()
        };
        assert!(matches!(c.validate(), Err(ConfigError::ReapInterval)));
        let c = Config {
            evasive_timeout_ms: 900,
            ..Config::default()
        };
        assert!(matches!(
            c.validate(),
            Err(ConfigError::Timeouts(TimeoutsError::EvasiveTooShort))
        ));
    }
}
