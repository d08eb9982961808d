use crate::error::{ProxyError, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProxyConfig {
    /// Tunnel endpoint clients send CONNECT requests to
    pub listen_addr: String,

    /// Admin API address; the API is disabled when unset
    pub api_addr: Option<String>,

    /// Endpoint returning `{ "success": bool, "ips": [..] }`
    pub allowlist_url: String,

    pub database_path: String,

    pub flush_interval_secs: u64,
    pub dial_timeout_secs: u64,
    pub lookup_timeout_secs: u64,
    pub bootstrap_timeout_secs: u64,
    pub header_timeout_secs: u64,
    pub max_header_bytes: u64,
    pub relay_buffer_size: usize,

    /// Log level: trace, debug, info, warn, error
    pub log_level: String,

    /// Log directory for daily rolling files; stdout when unset
    pub log_dir: Option<String>,
    pub log_file: String,

    pub console_port: Option<u16>,

    /// Number of Tokio runtime worker threads (defaults to CPU cores)
    pub runtime_threads: Option<usize>,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0:8080".to_string(),
            api_addr: None,
            allowlist_url: "http://localhost:3000/allowedips".to_string(),
            database_path: "data/ipmeter.db".to_string(),
            flush_interval_secs: 3600,
            dial_timeout_secs: 10,
            lookup_timeout_secs: 3,
            bootstrap_timeout_secs: 10,
            header_timeout_secs: 30,
            max_header_bytes: 16 * 1024,
            relay_buffer_size: 32 * 1024,
            log_level: "info".to_string(),
            log_dir: None,
            log_file: "ipmeter-proxy.log".to_string(),
            console_port: None,
            runtime_threads: None,
        }
    }
}

impl ProxyConfig {
    /// Loads the configuration file, falling back to defaults when it does not exist.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let config = if path.exists() {
            let content = fs::read_to_string(path)?;
            toml::from_str(&content).map_err(|e| {
                ProxyError::Configuration(format!("{}: {}", path.display(), e))
            })?
        } else {
            Self::default()
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let non_zero = [
            ("flush_interval_secs", self.flush_interval_secs),
            ("dial_timeout_secs", self.dial_timeout_secs),
            ("lookup_timeout_secs", self.lookup_timeout_secs),
            ("bootstrap_timeout_secs", self.bootstrap_timeout_secs),
            ("header_timeout_secs", self.header_timeout_secs),
            ("max_header_bytes", self.max_header_bytes),
            ("relay_buffer_size", self.relay_buffer_size as u64),
        ];
        for (field, value) in non_zero {
            if value == 0 {
                return Err(ProxyError::Configuration(format!("{field} must be > 0")));
            }
        }
        if let Some(0) = self.runtime_threads {
            return Err(ProxyError::Configuration(
                "runtime_threads must be > 0".to_string(),
            ));
        }
        Ok(())
    }

    pub fn flush_interval(&self) -> Duration {
        Duration::from_secs(self.flush_interval_secs)
    }

    pub fn dial_timeout(&self) -> Duration {
        Duration::from_secs(self.dial_timeout_secs)
    }

    pub fn lookup_timeout(&self) -> Duration {
        Duration::from_secs(self.lookup_timeout_secs)
    }

    pub fn bootstrap_timeout(&self) -> Duration {
        Duration::from_secs(self.bootstrap_timeout_secs)
    }

    pub fn header_timeout(&self) -> Duration {
        Duration::from_secs(self.header_timeout_secs)
    }
}
