use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Time budgets for every network wait, in milliseconds
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct Timeouts {
    /// How long a probed connection status stays fresh
    pub status_cache_ms: u64,
    /// Auto-connect bound used by the status probe
    pub probe_connect_ms: u64,
    /// Bound for the single echo read of the status probe
    pub probe_read_ms: u64,
    /// Auto-connect bound used by the authorization test and by install
    pub connect_ms: u64,
    /// Total wait for the echo token during the authorization test
    pub echo_wait_ms: u64,
    /// Total time allowed for writing the package to the install stream
    pub install_write_ms: u64,
    /// Total wait for the package manager's verdict
    pub install_response_ms: u64,
    /// Cadence of response polling
    pub poll_interval_ms: u64,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            status_cache_ms: 2000,
            probe_connect_ms: 3000,
            probe_read_ms: 1000,
            connect_ms: 10000,
            echo_wait_ms: 5000,
            install_write_ms: 120000,
            install_response_ms: 30000,
            poll_interval_ms: 100,
        }
    }
}

impl Timeouts {
    pub fn status_cache(&self) -> Duration {
        Duration::from_millis(self.status_cache_ms)
    }

    pub fn probe_connect(&self) -> Duration {
        Duration::from_millis(self.probe_connect_ms)
    }

    pub fn probe_read(&self) -> Duration {
        Duration::from_millis(self.probe_read_ms)
    }

    pub fn connect(&self) -> Duration {
        Duration::from_millis(self.connect_ms)
    }

    pub fn echo_wait(&self) -> Duration {
        Duration::from_millis(self.echo_wait_ms)
    }

    pub fn install_write(&self) -> Duration {
        Duration::from_millis(self.install_write_ms)
    }

    pub fn install_response(&self) -> Duration {
        Duration::from_millis(self.install_response_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct Settings {
    /// `adb` binary, a bare name is looked up in `PATH`
    pub adb_path: String,
    /// Port of the `adb` server dedicated to this application
    pub adb_server_port: u16,
    /// Common name put into the generated certificate
    pub device_label: String,
    pub timeouts: Timeouts,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            adb_path: "adb".to_string(),
            adb_server_port: 5038,
            device_label: "selfinstall".to_string(),
            timeouts: Timeouts::default(),
        }
    }
}
