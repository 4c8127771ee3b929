use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crate::reader::ReaderState;
use crate::router::PortStats;
use crate::types::{PortId, Sample};

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct PortStatus {
    pub port: PortId,
    pub state: ReaderState,
    pub samples: u64,
    pub rejected: u64,
    pub latest: Option<Sample>,
    pub laser_delta: Option<f64>,
    // Health monitoring
    pub silence_duration_secs: f64,
    pub healthy: bool,
}

impl PortStatus {
    /// A running reader that has been quiet past `threshold` is unhealthy.
    /// Paused and terminal readers are never reported silent.
    pub fn new(stats: PortStats, state: ReaderState, threshold: Duration) -> Self {
        let silent = state == ReaderState::Running && stats.silence > threshold;
        Self {
            port: stats.port,
            state,
            samples: stats.samples,
            rejected: stats.rejected,
            latest: stats.latest,
            laser_delta: stats.laser_delta,
            silence_duration_secs: stats.silence.as_secs_f64(),
            healthy: !silent,
        }
    }
}

/// Snapshot of the whole session, written periodically as JSON
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct LiveStatus {
    pub timestamp: f64,
    pub uptime_seconds: u64,
    pub ports: Vec<PortStatus>,
    pub weights: String,
    pub log_records: usize,
    pub saved_files: Vec<String>,
}

impl LiveStatus {
    pub fn new(uptime: Duration) -> Self {
        Self {
            timestamp: current_timestamp(),
            uptime_seconds: uptime.as_secs(),
            ports: Vec::new(),
            weights: String::new(),
            log_records: 0,
            saved_files: Vec::new(),
        }
    }

    pub fn silent_ports(&self) -> Vec<&PortId> {
        self.ports
            .iter()
            .filter(|p| !p.healthy)
            .map(|p| &p.port)
            .collect()
    }

    /// One-line summary for the console
    pub fn format_status(&self) -> String {
        let ports: Vec<String> = self
            .ports
            .iter()
            .map(|p| {
                let health = if p.healthy {
                    "✓".to_string()
                } else {
                    format!("⚠ (silent {:.1}s)", p.silence_duration_secs)
                };
                let laser = p
                    .latest
                    .map(|s| format!("{:.2}", s.laser))
                    .unwrap_or_else(|| "-".to_string());
                format!(
                    "{} {} {} n={} laser={}",
                    p.port, p.state, health, p.samples, laser
                )
            })
            .collect();
        format!(
            "{} | log={} saved={} | weights {}",
            ports.join(" | "),
            self.log_records,
            self.saved_files.len(),
            self.weights
        )
    }

    pub fn save(&self, path: &Path) -> std::io::Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        fs::write(path, json)?;
        Ok(())
    }
}

pub fn current_timestamp() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs_f64()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stats(port: &str, silence_secs: u64) -> PortStats {
        PortStats {
            port: PortId::new(port),
            samples: 3,
            rejected: 1,
            latest: None,
            laser_delta: None,
            silence: Duration::from_secs(silence_secs),
        }
    }

    #[test]
    fn test_only_running_ports_go_silent() {
        let threshold = Duration::from_secs(5);
        let running = PortStatus::new(stats("A", 9), ReaderState::Running, threshold);
        let paused = PortStatus::new(stats("B", 9), ReaderState::Paused, threshold);
        let fresh = PortStatus::new(stats("C", 1), ReaderState::Running, threshold);
        assert!(!running.healthy);
        assert!(paused.healthy);
        assert!(fresh.healthy);

        let mut status = LiveStatus::new(Duration::from_secs(12));
        status.ports = vec![running, paused, fresh];
        assert_eq!(status.silent_ports(), vec![&PortId::new("A")]);
        assert!(status.format_status().contains("silent 9.0s"));
    }

    #[test]
    fn test_save_writes_json() {
        let path = std::env::temp_dir().join(format!(
            "load_logger_rs_status_{}.json",
            std::process::id()
        ));
        let mut status = LiveStatus::new(Duration::from_secs(3));
        status.ports.push(PortStatus::new(
            stats("COM3", 0),
            ReaderState::Failed("unplugged".to_string()),
            Duration::from_secs(5),
        ));
        status.save(&path).unwrap();

        let text = fs::read_to_string(&path).unwrap();
        let back: LiveStatus = serde_json::from_str(&text).unwrap();
        assert_eq!(back.uptime_seconds, 3);
        assert_eq!(back.ports[0].state, ReaderState::Failed("unplugged".to_string()));
        fs::remove_file(&path).unwrap();
    }
}
