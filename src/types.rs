use serde::{Deserialize, Serialize};
use std::fmt;

/// Stable identifier of a configured serial endpoint (device path or name)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PortId(String);

impl PortId {
    pub fn new(name: impl Into<String>) -> Self {
        PortId(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PortId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PortId {
    fn from(name: &str) -> Self {
        PortId::new(name)
    }
}

/// Laser + IMU values pulled out of one line, before sequencing
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Reading {
    pub laser: f64,
    pub imu_x: f64,
    pub imu_y: f64,
    pub imu_z: f64,
}

/// One accepted, sequenced reading from a port
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    /// Per-port counter starting at 0; x-axis of every series
    pub sequence: u64,
    pub laser: f64,
    pub imu_x: f64,
    pub imu_y: f64,
    pub imu_z: f64,
}

impl Sample {
    pub fn new(sequence: u64, reading: Reading) -> Self {
        Self {
            sequence,
            laser: reading.laser,
            imu_x: reading.imu_x,
            imu_y: reading.imu_y,
            imu_z: reading.imu_z,
        }
    }
}

/// Raw line captured from a port, as handed from a reader to the router
#[derive(Debug, Clone, PartialEq)]
pub struct LineEvent {
    pub port: PortId,
    pub line: String,
}
