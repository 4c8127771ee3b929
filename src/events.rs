use std::path::PathBuf;

use crate::error::LoggerError;
use crate::types::{PortId, Sample};

/// Events held for a slow or absent consumer before new ones are dropped
pub const EVENT_BACKLOG: usize = 1024;

/// Result of routing one accepted line
#[derive(Debug, Clone, PartialEq)]
pub struct AcceptedSample {
    pub port: PortId,
    pub sample: Sample,
    pub laser_delta: f64,
}

/// Notifications from the core to whoever renders it
#[derive(Debug, Clone, PartialEq)]
pub enum CoreEvent {
    /// A line was accepted; series for this port advanced by one point.
    /// Full series copies are pulled with `port_snapshot`.
    Sample(AcceptedSample),

    /// A reader stopped for good; other ports keep running
    ReaderFailed { port: PortId, reason: String },

    /// A flush attempt finished. On failure the in-memory log is untouched.
    Flush {
        file_name: String,
        result: Result<PathBuf, LoggerError>,
    },
}
