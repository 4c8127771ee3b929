use chrono::Local;
use crossbeam::channel::{Receiver, Sender, TrySendError};
use log::{debug, info, warn};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

use crate::error::{CoreResult, LoggerError};
use crate::events::{AcceptedSample, CoreEvent};
use crate::parser::{parse_line, FieldLayout};
use crate::session_log::{session_file_name, write_session_file, LogRecord, SessionLog};
use crate::store::{Metric, SeriesPoint, TimeSeriesStore};
use crate::types::{LineEvent, PortId, Sample};
use crate::weights::SharedWeights;

/// Derived and bookkeeping state of one port
#[derive(Debug, Clone)]
struct PortTrack {
    next_sequence: u64,
    rejected: u64,
    previous_laser: Option<f64>,
    latest: Option<AcceptedSample>,
    created_at: Instant,
    last_sample_at: Option<Instant>,
}

impl PortTrack {
    fn new() -> Self {
        PortTrack {
            next_sequence: 0,
            rejected: 0,
            previous_laser: None,
            latest: None,
            created_at: Instant::now(),
            last_sample_at: None,
        }
    }
}

struct RouterState {
    tracks: HashMap<PortId, PortTrack>,
    store: TimeSeriesStore,
    log: SessionLog,
}

/// Every series of one port, copied under a single lock
#[derive(Debug, Clone, Serialize)]
pub struct PortSnapshot {
    pub port: PortId,
    pub series: BTreeMap<Metric, Vec<SeriesPoint>>,
    pub latest: Option<Sample>,
    pub laser_delta: Option<f64>,
}

/// Counters for the status view
#[derive(Debug, Clone)]
pub struct PortStats {
    pub port: PortId,
    pub samples: u64,
    /// Lines that failed to parse; they never reach a series or the log
    pub rejected: u64,
    pub latest: Option<Sample>,
    pub laser_delta: Option<f64>,
    /// Time since the last accepted sample, or since start when none arrived
    pub silence: Duration,
}

/// Single point where lines from all ports become samples, series points
/// and log records. One accepted line updates all of them under one lock.
pub struct SampleRouter {
    state: Mutex<RouterState>,
    /// Held for the whole of a flush; two flushes in the same second share a file name
    flushing: Mutex<()>,
    layout: FieldLayout,
    weights: SharedWeights,
    events: Option<Sender<CoreEvent>>,
}

impl SampleRouter {
    pub fn new(
        ports: &[PortId],
        capacity: usize,
        layout: FieldLayout,
        weights: SharedWeights,
        events: Option<Sender<CoreEvent>>,
    ) -> CoreResult<Self> {
        layout.validate()?;
        let tracks = ports.iter().map(|p| (p.clone(), PortTrack::new())).collect();
        Ok(SampleRouter {
            state: Mutex::new(RouterState {
                tracks,
                store: TimeSeriesStore::new(capacity)?,
                log: SessionLog::new(),
            }),
            flushing: Mutex::new(()),
            layout,
            weights,
            events,
        })
    }

    fn lock(&self) -> CoreResult<MutexGuard<'_, RouterState>> {
        self.state.lock().map_err(|_| LoggerError::poisoned("router"))
    }

    /// Route one line. `Ok(None)` means the line was rejected and nothing changed.
    pub fn on_line(&self, port: &PortId, raw: &str) -> CoreResult<Option<AcceptedSample>> {
        let parsed = match parse_line(raw) {
            Ok(parsed) => parsed,
            Err(e) => {
                debug!("[{}] dropped {:?}: {}", port, raw, e);
                let mut state = self.lock()?;
                let track = state
                    .tracks
                    .get_mut(port)
                    .ok_or_else(|| LoggerError::UnknownPort(port.to_string()))?;
                track.rejected += 1;
                return Ok(None);
            }
        };
        let reading = self.layout.extract(&parsed);
        let weight_snapshot = self.weights.snapshot()?;

        let accepted = {
            let mut guard = self.lock()?;
            let state = &mut *guard;
            let track = state
                .tracks
                .get_mut(port)
                .ok_or_else(|| LoggerError::UnknownPort(port.to_string()))?;

            let sample = Sample::new(track.next_sequence, reading);
            let laser_delta = track
                .previous_laser
                .map(|previous| sample.laser - previous)
                .unwrap_or(0.0);

            for (metric, value) in [
                (Metric::Laser, sample.laser),
                (Metric::ImuX, sample.imu_x),
                (Metric::ImuY, sample.imu_y),
                (Metric::ImuZ, sample.imu_z),
                (Metric::LaserDelta, laser_delta),
            ] {
                state
                    .store
                    .append(metric, port, SeriesPoint::new(sample.sequence, value))?;
            }

            let accepted = AcceptedSample {
                port: port.clone(),
                sample,
                laser_delta,
            };
            track.next_sequence += 1;
            track.previous_laser = Some(sample.laser);
            track.latest = Some(accepted.clone());
            track.last_sample_at = Some(Instant::now());

            state.log.append(LogRecord {
                weight_snapshot,
                port: port.clone(),
                raw_line: raw.to_string(),
            });
            accepted
        };

        self.emit(CoreEvent::Sample(accepted.clone()));
        Ok(Some(accepted))
    }

    /// Drain lines from every reader until all senders are gone
    pub fn run(&self, lines: Receiver<LineEvent>) {
        for event in lines.iter() {
            if let Err(e) = self.on_line(&event.port, &event.line) {
                warn!("[{}] line not routed: {}", event.port, e);
            }
        }
        debug!("router input closed");
    }

    pub fn snapshot(&self, metric: Metric, port: &PortId) -> CoreResult<Vec<SeriesPoint>> {
        Ok(self.lock()?.store.snapshot(metric, port))
    }

    pub fn port_snapshot(&self, port: &PortId) -> CoreResult<PortSnapshot> {
        let state = self.lock()?;
        let track = state
            .tracks
            .get(port)
            .ok_or_else(|| LoggerError::UnknownPort(port.to_string()))?;
        let series = Metric::ALL
            .iter()
            .map(|metric| (*metric, state.store.snapshot(*metric, port)))
            .collect();
        Ok(PortSnapshot {
            port: port.clone(),
            series,
            latest: track.latest.as_ref().map(|a| a.sample),
            laser_delta: track.latest.as_ref().map(|a| a.laser_delta),
        })
    }

    pub fn latest(&self, port: &PortId) -> CoreResult<Option<AcceptedSample>> {
        let state = self.lock()?;
        let track = state
            .tracks
            .get(port)
            .ok_or_else(|| LoggerError::UnknownPort(port.to_string()))?;
        Ok(track.latest.clone())
    }

    /// Latest accepted sample of every port that has one
    pub fn latest_all(&self) -> CoreResult<Vec<AcceptedSample>> {
        let state = self.lock()?;
        let mut latest: Vec<AcceptedSample> = state
            .tracks
            .values()
            .filter_map(|t| t.latest.clone())
            .collect();
        latest.sort_by(|a, b| a.port.cmp(&b.port));
        Ok(latest)
    }

    pub fn port_stats(&self) -> CoreResult<Vec<PortStats>> {
        let state = self.lock()?;
        let mut stats: Vec<PortStats> = state
            .tracks
            .iter()
            .map(|(port, track)| PortStats {
                port: port.clone(),
                samples: track.next_sequence,
                rejected: track.rejected,
                latest: track.latest.as_ref().map(|a| a.sample),
                laser_delta: track.latest.as_ref().map(|a| a.laser_delta),
                silence: track.last_sample_at.unwrap_or(track.created_at).elapsed(),
            })
            .collect();
        stats.sort_by(|a, b| a.port.cmp(&b.port));
        Ok(stats)
    }

    pub fn log_records(&self) -> CoreResult<Vec<LogRecord>> {
        Ok(self.lock()?.log.records().to_vec())
    }

    pub fn log_len(&self) -> CoreResult<usize> {
        Ok(self.lock()?.log.len())
    }

    pub fn saved_files(&self) -> CoreResult<Vec<String>> {
        Ok(self.lock()?.log.saved_files().to_vec())
    }

    /// Write the whole session log to a new timestamped file in `dir`.
    ///
    /// Records are copied under the lock and written without it, so readers
    /// keep routing while the disk is busy. The outcome is also sent as a
    /// [`CoreEvent::Flush`].
    pub fn flush_log(&self, dir: &Path) -> CoreResult<PathBuf> {
        let _flushing = self
            .flushing
            .lock()
            .map_err(|_| LoggerError::poisoned("flush"))?;
        let records = self.log_records()?;
        let file_name = session_file_name(Local::now());
        let path = dir.join(&file_name);

        let result = write_session_file(&path, &records);
        match &result {
            Ok(()) => {
                self.lock()?.log.record_saved(file_name.clone());
                info!("Saved {} log records to {}", records.len(), path.display());
            }
            Err(e) => warn!("Save to {} failed: {}", path.display(), e),
        }

        let result = result.map(|()| path);
        self.emit(CoreEvent::Flush {
            file_name,
            result: result.clone(),
        });
        result
    }

    fn emit(&self, event: CoreEvent) {
        if let Some(events) = &self.events {
            // a closed receiver only means nobody is listening
            if let Err(TrySendError::Full(dropped)) = events.try_send(event) {
                debug!("event queue full, dropping {:?}", dropped);
            }
        }
    }
}
