//! Peer liveness states and the reaper thresholds.

use std::time::Duration;

pub const DEFAULT_PING_INTERVAL: Duration = Duration::from_secs(2);
pub const DEFAULT_EVASIVE_TIMEOUT: Duration = Duration::from_secs(5);
pub const DEFAULT_SILENT_TIMEOUT: Duration = Duration::from_secs(8);
pub const DEFAULT_EXPIRED_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

/// Liveness of a peer as seen from here. `Expired` is terminal: the entry is removed.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Ord, PartialOrd)]
pub enum Liveness {
    Alive,
    Evasive,
    Silent,
    Expired,
}

/// Thresholds measured against a peer's `last_seen`.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct Timeouts {
    pub ping_interval: Duration,
    pub evasive: Duration,
    pub silent: Duration,
    pub expired: Duration,
    pub handshake: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            ping_interval: DEFAULT_PING_INTERVAL,
            evasive: DEFAULT_EVASIVE_TIMEOUT,
            silent: DEFAULT_SILENT_TIMEOUT,
            expired: DEFAULT_EXPIRED_TIMEOUT,
            handshake: DEFAULT_HANDSHAKE_TIMEOUT,
        }
    }
}

impl Timeouts {
    /// Thresholds must grow strictly: beacon interval < evasive < silent < expired.
    pub fn validate(&self, beacon_interval: Duration) -> Result<(), TimeoutsError> {
        if self.evasive <= beacon_interval {
            return Err(TimeoutsError::EvasiveTooShort);
        }
        if self.silent <= self.evasive {
            return Err(TimeoutsError::SilentTooShort);
        }
        if self.expired <= self.silent {
            return Err(TimeoutsError::ExpiredTooShort);
        }
        if self.ping_interval.is_zero() || self.handshake.is_zero() {
            return Err(TimeoutsError::Zero);
        }
        Ok(())
    }

    /// State a peer should be in after `idle` without traffic.
    pub fn classify(&self, idle: Duration) -> Liveness {
        if idle > self.expired {
            Liveness::Expired
        } else if idle > self.silent {
            Liveness::Silent
        } else if idle > self.evasive {
            Liveness::Evasive
        } else {
            Liveness::Alive
        }
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum TimeoutsError {
    #[error("evasive timeout must exceed the beacon interval")]
    EvasiveTooShort,
    #[error("silent timeout must exceed the evasive timeout")]
    SilentTooShort,
    #[error("expired timeout must exceed the silent timeout")]
    ExpiredTooShort,
    #[error("ping interval and handshake timeout must be non-zero")]
    Zero,
}
