//! Configuration sections, one struct per TOML table.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Input device selection and reconnect behavior.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceConfig {
    /// Substrings matched (case-insensitive) against input port names.
    /// The first port matching any keyword wins; with no match the first
    /// available port is used.
    /// Default: ["SAP200", "MEDELI", "MIDI"]
    #[serde(default = "DeviceConfig::default_keywords")]
    pub keywords: Vec<String>,

    /// Delay before reopening the device after a transport failure.
    /// Default: 1000
    #[serde(default = "DeviceConfig::default_retry_ms")]
    pub retry_ms: u64,
}

impl DeviceConfig {
    fn default_keywords() -> Vec<String> {
        vec!["SAP200".to_string(), "MEDELI".to_string(), "MIDI".to_string()]
    }

    fn default_retry_ms() -> u64 {
        1000
    }
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            keywords: Self::default_keywords(),
            retry_ms: Self::default_retry_ms(),
        }
    }
}

/// Normalizer settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NormalizeConfig {
    /// Hold duration (seconds) at or above which a release is a long hold.
    /// Default: 0.6
    #[serde(default = "NormalizeConfig::default_hold_threshold_s")]
    pub hold_threshold_s: f64,
}

impl NormalizeConfig {
    fn default_hold_threshold_s() -> f64 {
        0.6
    }
}

impl Default for NormalizeConfig {
    fn default() -> Self {
        Self {
            hold_threshold_s: Self::default_hold_threshold_s(),
        }
    }
}

/// JSON-lines capture and check-log output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CaptureConfig {
    /// File name prefix for capture files.
    /// Default: midi_capture
    #[serde(default = "CaptureConfig::default_prefix")]
    pub prefix: String,

    /// Directory that receives capture files and check logs.
    /// Default: ./logs
    #[serde(default = "CaptureConfig::default_dir")]
    pub dir: PathBuf,

    /// Capture every message kind instead of only the useful subset.
    #[serde(default)]
    pub capture_all: bool,
}

impl CaptureConfig {
    fn default_prefix() -> String {
        "midi_capture".to_string()
    }

    fn default_dir() -> PathBuf {
        PathBuf::from("logs")
    }
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            prefix: Self::default_prefix(),
            dir: Self::default_dir(),
            capture_all: false,
        }
    }
}

/// Streaming server settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Address to bind.
    /// Default: 0.0.0.0
    #[serde(default = "ServerConfig::default_bind")]
    pub bind: String,

    /// HTTP port for /events and /health.
    /// Default: 8766
    #[serde(default = "ServerConfig::default_port")]
    pub port: u16,

    /// Idle interval before a heartbeat comment is sent to a subscriber.
    /// Default: 15
    #[serde(default = "ServerConfig::default_keep_alive_secs")]
    pub keep_alive_secs: u64,

    /// Pending records buffered per subscriber before drops begin.
    /// Default: 2048
    #[serde(default = "ServerConfig::default_queue_capacity")]
    pub queue_capacity: usize,

    /// Publish every message kind instead of only the useful subset.
    #[serde(default)]
    pub include_all: bool,
}

impl ServerConfig {
    fn default_bind() -> String {
        "0.0.0.0".to_string()
    }

    fn default_port() -> u16 {
        8766
    }

    fn default_keep_alive_secs() -> u64 {
        15
    }

    fn default_queue_capacity() -> usize {
        2048
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: Self::default_bind(),
            port: Self::default_port(),
            keep_alive_secs: Self::default_keep_alive_secs(),
            queue_capacity: Self::default_queue_capacity(),
            include_all: false,
        }
    }
}

/// Logging and trace export.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetryConfig {
    /// Log filter (trace, debug, info, warn, error, or an EnvFilter directive).
    /// Default: info
    #[serde(default = "TelemetryConfig::default_log_level")]
    pub log_level: String,

    /// OTLP gRPC endpoint for span export. Disabled when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub otlp_endpoint: Option<String>,
}

impl TelemetryConfig {
    fn default_log_level() -> String {
        "info".to_string()
    }
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_level: Self::default_log_level(),
            otlp_endpoint: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_device_defaults() {
        let device = DeviceConfig::default();
        assert_eq!(device.keywords, vec!["SAP200", "MEDELI", "MIDI"]);
        assert_eq!(device.retry_ms, 1000);
    }

    #[test]
    fn test_server_defaults() {
        let server = ServerConfig::default();
        assert_eq!(server.port, 8766);
        assert_eq!(server.keep_alive_secs, 15);
        assert_eq!(server.queue_capacity, 2048);
        assert!(!server.include_all);
    }

    #[test]
    fn test_capture_defaults() {
        let capture = CaptureConfig::default();
        assert_eq!(capture.prefix, "midi_capture");
        assert_eq!(capture.dir, PathBuf::from("logs"));
        assert!(!capture.capture_all);
    }
}
