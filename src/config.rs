use serde::{Deserialize, Serialize};
use std::time::Duration;

fn default_server_list_path() -> String {
    "servers.json".to_string()
}
fn default_watchdog_timeout_secs() -> u64 {
    20
}
fn default_max_exceptions() -> u32 {
    10
}
fn default_reconnect_delay_secs() -> u64 {
    5
}
fn default_connection_timeout_secs() -> u64 {
    15
}
fn default_assembler_idle_timeout_secs() -> u64 {
    600
}
fn default_assembler_capacity() -> usize {
    1024
}
fn default_queue_capacity() -> usize {
    64
}

/// Client configuration. `email` is the only mandatory field; everything else
/// has a serde default so callers can deserialize a partial document.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ByteBlasterOptions {
    /// Email address embedded in the periodic logon string.
    pub email: String,
    /// Where the in-band server list is persisted across restarts.
    pub server_list_path: String,
    /// Close the session if no bytes arrive for this long.
    pub watchdog_timeout_secs: u64,
    /// Successive decoder resyncs without a valid frame before force-reconnect.
    pub max_exceptions: u32,
    /// Base delay between reconnection attempts.
    pub reconnect_delay_secs: u64,
    /// TCP connect timeout.
    pub connection_timeout_secs: u64,
    /// Drop a pending assembly with no insertions for this long.
    pub assembler_idle_timeout_secs: u64,
    /// Maximum number of live assemblies before least-recently-updated eviction.
    pub assembler_capacity: usize,
    /// Default per-subscriber queue depth for the segment fan-out.
    pub segment_queue_capacity: usize,
    /// Default per-subscriber queue depth for the completed-file fan-out.
    pub file_queue_capacity: usize,
    /// Shuffle the persisted server list once at load to spread load.
    pub shuffle_servers_on_load: bool,
}

impl ByteBlasterOptions {
    pub fn new(email: impl Into<String>) -> Self {
        Self {
            email: email.into(),
            ..Self::default()
        }
    }

    /// Fatal at startup: a client without a usable email must refuse to run.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.email.trim().is_empty() {
            return Err(ConfigError::EmptyEmail);
        }
        if self.assembler_capacity == 0 {
            return Err(ConfigError::ZeroCapacity("assembler_capacity"));
        }
        if self.segment_queue_capacity == 0 {
            return Err(ConfigError::ZeroCapacity("segment_queue_capacity"));
        }
        if self.file_queue_capacity == 0 {
            return Err(ConfigError::ZeroCapacity("file_queue_capacity"));
        }
        Ok(())
    }

    pub fn watchdog_timeout(&self) -> Duration {
        Duration::from_secs(self.watchdog_timeout_secs)
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_secs(self.reconnect_delay_secs)
    }

    pub fn connection_timeout(&self) -> Duration {
        Duration::from_secs(self.connection_timeout_secs)
    }

    pub fn assembler_idle_timeout(&self) -> Duration {
        Duration::from_secs(self.assembler_idle_timeout_secs)
    }
}

impl Default for ByteBlasterOptions {
    fn default() -> Self {
        Self {
            email: String::new(),
            server_list_path: default_server_list_path(),
            watchdog_timeout_secs: default_watchdog_timeout_secs(),
            max_exceptions: default_max_exceptions(),
            reconnect_delay_secs: default_reconnect_delay_secs(),
            connection_timeout_secs: default_connection_timeout_secs(),
            assembler_idle_timeout_secs: default_assembler_idle_timeout_secs(),
            assembler_capacity: default_assembler_capacity(),
            segment_queue_capacity: default_queue_capacity(),
            file_queue_capacity: default_queue_capacity(),
            shuffle_servers_on_load: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigError {
    EmptyEmail,
    ZeroCapacity(&'static str),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::EmptyEmail => write!(f, "email address cannot be empty"),
            Self::ZeroCapacity(field) => write!(f, "{field} must be greater than zero"),
        }
    }
}

impl std::error::Error for ConfigError {}
