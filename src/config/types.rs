use std::time::Duration;

use serde::{Deserialize, Serialize};

fn default_scan_timeout_secs() -> u64 {
    crate::device::constants::DEFAULT_SCAN_TIMEOUT_SECS
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Config {
    /// Identity of the last successfully connected window, used for
    /// reconnects across restarts.
    #[serde(default)]
    pub last_device: Option<String>,

    /// How long a scan runs before it is stopped automatically. Zero
    /// disables the timeout.
    #[serde(default = "default_scan_timeout_secs")]
    pub scan_timeout_secs: u64,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            last_device: None,
            scan_timeout_secs: default_scan_timeout_secs(),
        }
    }
}

impl Config {
    pub fn scan_timeout(&self) -> Option<Duration> {
        if self.scan_timeout_secs == 0 {
            None
        } else {
            Some(Duration::from_secs(self.scan_timeout_secs))
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn empty_object_gets_defaults() {
        let config: Config = serde_json::from_str("{}").unwrap();
        assert_eq!(config, Config::default());
        assert_eq!(config.scan_timeout(), Some(Duration::from_secs(10)));
    }

    #[test]
    fn zero_timeout_disables_auto_stop() {
        let config: Config = serde_json::from_str(r#"{"scan_timeout_secs": 0}"#).unwrap();
        assert_eq!(config.scan_timeout(), None);
    }

    #[test]
    fn round_trips_last_device() {
        let config = Config {
            last_device: Some("hci0/dev_AA_BB".to_string()),
            scan_timeout_secs: 30,
        };
        let json = serde_json::to_string(&config).unwrap();
        let back: Config = serde_json::from_str(&json).unwrap();
        assert_eq!(back, config);
    }
}
