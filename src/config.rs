use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{CoreResult, LoggerError};
use crate::parser::FieldLayout;
use crate::store::DEFAULT_CAPACITY;
use crate::types::PortId;

/// Settings for one acquisition session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AcquisitionConfig {
    pub ports: Vec<PortId>,
    pub baud_rate: u32,
    /// Longest a single blocking read may take; bounds stop latency
    pub read_timeout_ms: u64,
    /// Idle check interval of a paused reader
    pub pause_poll_ms: u64,
    pub capacity: usize,
    /// 0 disables the autosave timer
    pub autosave_secs: u64,
    pub output_dir: PathBuf,
    pub silence_threshold_secs: u64,
    pub layout: FieldLayout,
}

impl Default for AcquisitionConfig {
    fn default() -> Self {
        Self {
            ports: ["COM3", "COM4", "COM5", "COM6"]
                .iter()
                .map(|p| PortId::new(*p))
                .collect(),
            baud_rate: 9600,
            read_timeout_ms: 1000,
            pause_poll_ms: 100,
            capacity: DEFAULT_CAPACITY,
            autosave_secs: 10,
            output_dir: PathBuf::from("."),
            silence_threshold_secs: 5,
            layout: FieldLayout::default(),
        }
    }
}

impl AcquisitionConfig {
    /// Load a JSON config; missing keys keep their defaults
    pub fn from_file(path: &Path) -> CoreResult<Self> {
        let text = fs::read_to_string(path)
            .map_err(|e| LoggerError::Config(format!("cannot read {}: {}", path.display(), e)))?;
        Self::from_json(&text)
    }

    pub fn from_json(text: &str) -> CoreResult<Self> {
        serde_json::from_str(text).map_err(|e| LoggerError::Config(e.to_string()))
    }

    pub fn validate(&self) -> CoreResult<()> {
        if self.ports.is_empty() {
            return Err(LoggerError::Config("no ports configured".to_string()));
        }
        let mut seen = HashSet::new();
        for port in &self.ports {
            if port.as_str().trim().is_empty() {
                return Err(LoggerError::Config("empty port name".to_string()));
            }
            if !seen.insert(port) {
                return Err(LoggerError::Config(format!("port {} listed twice", port)));
            }
        }
        if self.baud_rate == 0 {
            return Err(LoggerError::Config("baud rate must be positive".to_string()));
        }
        if self.capacity == 0 {
            return Err(LoggerError::Config("capacity must be positive".to_string()));
        }
        if self.read_timeout_ms == 0 || self.pause_poll_ms == 0 {
            return Err(LoggerError::Config(
                "read timeout and pause poll must be positive".to_string(),
            ));
        }
        self.layout.validate()
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }

    pub fn pause_poll(&self) -> Duration {
        Duration::from_millis(self.pause_poll_ms)
    }

    pub fn autosave_interval(&self) -> Option<Duration> {
        (self.autosave_secs > 0).then(|| Duration::from_secs(self.autosave_secs))
    }

    pub fn silence_threshold(&self) -> Duration {
        Duration::from_secs(self.silence_threshold_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::FieldIndex;

    #[test]
    fn test_defaults_are_valid() {
        let config = AcquisitionConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.ports.len(), 4);
        assert_eq!(config.capacity, 300);
        assert_eq!(config.autosave_interval(), Some(Duration::from_secs(10)));
    }

    #[test]
    fn test_partial_json_keeps_defaults() {
        let config = AcquisitionConfig::from_json(
            r#"{"ports": ["/dev/ttyUSB0"], "autosave_secs": 0,
                "layout": {"laser": {"from_start": 1}, "imu_x": {"from_end": 3},
                           "imu_y": {"from_end": 1}, "imu_z": {"from_end": 2}}}"#,
        )
        .unwrap();
        assert_eq!(config.ports, vec![PortId::new("/dev/ttyUSB0")]);
        assert_eq!(config.baud_rate, 9600);
        assert_eq!(config.autosave_interval(), None);
        assert_eq!(config.layout.laser, FieldIndex::FromStart(1));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_rejects_bad_settings() {
        let mut config = AcquisitionConfig::default();
        config.ports.push(PortId::new("COM3"));
        assert!(matches!(config.validate(), Err(LoggerError::Config(_))));

        let config = AcquisitionConfig {
            capacity: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = AcquisitionConfig {
            ports: Vec::new(),
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = AcquisitionConfig {
            read_timeout_ms: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_malformed_json() {
        assert!(matches!(
            AcquisitionConfig::from_json("{ports: 3"),
            Err(LoggerError::Config(_))
        ));
    }
}
