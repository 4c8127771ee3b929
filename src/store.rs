use serde::{Deserialize, Serialize};
use std::collections::hash_map::Entry;
use std::collections::{HashMap, VecDeque};
use std::fmt;

use crate::error::{CoreResult, LoggerError};
use crate::types::PortId;

/// Default number of points kept per series
pub const DEFAULT_CAPACITY: usize = 300;

/// Metrics tracked per port
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Metric {
    Laser,
    ImuX,
    ImuY,
    ImuZ,
    /// Frame-to-frame laser change
    LaserDelta,
}

impl Metric {
    pub const ALL: [Metric; 5] = [
        Metric::Laser,
        Metric::ImuX,
        Metric::ImuY,
        Metric::ImuZ,
        Metric::LaserDelta,
    ];

    pub fn label(self) -> &'static str {
        match self {
            Metric::Laser => "Laser",
            Metric::ImuX => "IMU[x]",
            Metric::ImuY => "IMU[y]",
            Metric::ImuZ => "IMU[z]",
            Metric::LaserDelta => "Laser Change",
        }
    }
}

impl fmt::Display for Metric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SeriesPoint {
    pub sequence: u64,
    pub value: f64,
}

impl SeriesPoint {
    pub fn new(sequence: u64, value: f64) -> Self {
        Self { sequence, value }
    }
}

/// Fixed-capacity FIFO of points with strictly increasing sequence numbers
#[derive(Debug, Clone)]
pub struct Series {
    points: VecDeque<SeriesPoint>,
    capacity: usize,
}

impl Series {
    pub fn new(capacity: usize) -> CoreResult<Self> {
        if capacity == 0 {
            return Err(LoggerError::Config(
                "series capacity must be at least 1".to_string(),
            ));
        }
        Ok(Series {
            points: VecDeque::with_capacity(capacity),
            capacity,
        })
    }

    /// Append a point, evicting the oldest one when full
    pub fn push(&mut self, point: SeriesPoint) -> CoreResult<()> {
        if let Some(last) = self.points.back() {
            if point.sequence <= last.sequence {
                return Err(LoggerError::SequenceOrder {
                    last: last.sequence,
                    got: point.sequence,
                });
            }
        }

        if self.points.len() == self.capacity {
            self.points.pop_front();
        }
        self.points.push_back(point);
        Ok(())
    }

    pub fn snapshot(&self) -> Vec<SeriesPoint> {
        self.points.iter().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }
}

/// One series per (metric, port). Not synchronized on its own; the router
/// owns it behind its lock.
#[derive(Debug, Clone)]
pub struct TimeSeriesStore {
    series: HashMap<(Metric, PortId), Series>,
    capacity: usize,
}

impl TimeSeriesStore {
    pub fn new(capacity: usize) -> CoreResult<Self> {
        // same capacity check every series makes
        Series::new(capacity)?;
        Ok(TimeSeriesStore {
            series: HashMap::new(),
            capacity,
        })
    }

    pub fn append(&mut self, metric: Metric, port: &PortId, point: SeriesPoint) -> CoreResult<()> {
        let series = match self.series.entry((metric, port.clone())) {
            Entry::Occupied(entry) => entry.into_mut(),
            Entry::Vacant(entry) => entry.insert(Series::new(self.capacity)?),
        };
        series.push(point)
    }

    /// Point-in-time copy; empty when nothing was appended yet
    pub fn snapshot(&self, metric: Metric, port: &PortId) -> Vec<SeriesPoint> {
        self.series
            .get(&(metric, port.clone()))
            .map(Series::snapshot)
            .unwrap_or_default()
    }

    pub fn len(&self, metric: Metric, port: &PortId) -> usize {
        self.series
            .get(&(metric, port.clone()))
            .map(Series::len)
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn port() -> PortId {
        PortId::new("COM3")
    }

    #[test]
    fn test_fifo_eviction_at_capacity() {
        let mut store = TimeSeriesStore::new(2).unwrap();
        store.append(Metric::Laser, &port(), SeriesPoint::new(0, 10.0)).unwrap();
        store.append(Metric::Laser, &port(), SeriesPoint::new(1, 11.0)).unwrap();
        store.append(Metric::Laser, &port(), SeriesPoint::new(2, 12.0)).unwrap();

        assert_eq!(
            store.snapshot(Metric::Laser, &port()),
            vec![SeriesPoint::new(1, 11.0), SeriesPoint::new(2, 12.0)]
        );
    }

    #[test]
    fn test_length_never_exceeds_capacity() {
        let mut series = Series::new(5).unwrap();
        for seq in 0..50 {
            series.push(SeriesPoint::new(seq, seq as f64)).unwrap();
            assert!(series.len() <= 5);
        }
        let kept: Vec<u64> = series.snapshot().iter().map(|p| p.sequence).collect();
        assert_eq!(kept, vec![45, 46, 47, 48, 49]);
    }

    #[test]
    fn test_series_rejects_zero_capacity() {
        assert!(matches!(Series::new(0), Err(LoggerError::Config(_))));

        let mut series = Series::new(1).unwrap();
        series.push(SeriesPoint::new(0, 1.0)).unwrap();
        series.push(SeriesPoint::new(1, 2.0)).unwrap();
        assert_eq!(series.snapshot(), vec![SeriesPoint::new(1, 2.0)]);
    }

    #[test]
    fn test_rejects_non_increasing_sequence() {
        let mut series = Series::new(3).unwrap();
        series.push(SeriesPoint::new(4, 1.0)).unwrap();
        assert_eq!(
            series.push(SeriesPoint::new(4, 2.0)),
            Err(LoggerError::SequenceOrder { last: 4, got: 4 })
        );
        assert!(series.push(SeriesPoint::new(3, 2.0)).is_err());
        assert_eq!(series.len(), 1);
    }

    #[test]
    fn test_series_are_independent_per_metric_and_port() {
        let mut store = TimeSeriesStore::new(10).unwrap();
        let other = PortId::new("COM4");
        store.append(Metric::Laser, &port(), SeriesPoint::new(0, 1.0)).unwrap();
        store.append(Metric::ImuX, &port(), SeriesPoint::new(0, 2.0)).unwrap();
        store.append(Metric::Laser, &other, SeriesPoint::new(0, 3.0)).unwrap();

        assert_eq!(store.len(Metric::Laser, &port()), 1);
        assert_eq!(store.len(Metric::ImuY, &port()), 0);
        assert_eq!(store.snapshot(Metric::Laser, &other)[0].value, 3.0);
    }

    #[test]
    fn test_snapshot_is_a_copy() {
        let mut store = TimeSeriesStore::new(4).unwrap();
        store.append(Metric::Laser, &port(), SeriesPoint::new(0, 1.0)).unwrap();
        let before = store.snapshot(Metric::Laser, &port());
        store.append(Metric::Laser, &port(), SeriesPoint::new(1, 2.0)).unwrap();
        assert_eq!(before.len(), 1);
    }

    #[test]
    fn test_zero_capacity_rejected() {
        assert!(TimeSeriesStore::new(0).is_err());
    }
}
