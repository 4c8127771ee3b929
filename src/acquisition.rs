use crossbeam::channel::{self, bounded, tick, unbounded, Receiver, Sender};
use log::{debug, info, warn};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::config::AcquisitionConfig;
use crate::error::{CoreResult, LoggerError};
use crate::events::{AcceptedSample, CoreEvent, EVENT_BACKLOG};
use crate::link::LinkOpener;
use crate::reader::{PortReader, ReaderOutputs, ReaderPool, ReaderState};
use crate::router::{PortSnapshot, SampleRouter};
use crate::status::{LiveStatus, PortStatus};
use crate::store::{Metric, SeriesPoint};
use crate::types::PortId;
use crate::weights::{SharedWeights, WeightGrid};

/// Timer thread that flushes the session log on a fixed interval
struct Autosave {
    stop: Sender<()>,
    handle: JoinHandle<()>,
}

impl Autosave {
    fn spawn(router: Arc<SampleRouter>, dir: PathBuf, interval: Duration) -> CoreResult<Self> {
        let (stop, stopped) = channel::bounded::<()>(1);
        let handle = thread::Builder::new()
            .name("autosave".to_string())
            .spawn(move || {
                let ticker = tick(interval);
                loop {
                    channel::select! {
                        recv(ticker) -> _ => {
                            // failures already went out as a Flush event
                            if let Err(e) = router.flush_log(&dir) {
                                debug!("autosave failed: {}", e);
                            }
                        }
                        recv(stopped) -> _ => break,
                    }
                }
            })
            .map_err(|e| LoggerError::Internal(format!("cannot spawn autosave thread: {}", e)))?;
        Ok(Autosave { stop, handle })
    }

    fn shutdown(self) {
        let _ = self.stop.send(());
        if self.handle.join().is_err() {
            warn!("autosave thread panicked");
        }
    }
}

/// A running session: one reader per port, the router, and the autosave timer.
///
/// Every method takes `&self`, so the handle can be shared with whatever
/// issues operator commands.
pub struct Acquisition {
    config: AcquisitionConfig,
    router: Arc<SampleRouter>,
    readers: ReaderPool,
    weights: SharedWeights,
    events: Receiver<CoreEvent>,
    router_thread: Mutex<Option<JoinHandle<()>>>,
    autosave: Mutex<Option<Autosave>>,
    started: Instant,
}

impl Acquisition {
    /// Validate `config`, then start the router, every reader and the
    /// autosave timer. A port that cannot be opened only fails that reader.
    pub fn start(config: AcquisitionConfig, opener: Arc<dyn LinkOpener>) -> CoreResult<Self> {
        config.validate()?;

        let weights = SharedWeights::new();
        let (events_tx, events) = bounded(EVENT_BACKLOG);
        let router = Arc::new(SampleRouter::new(
            &config.ports,
            config.capacity,
            config.layout,
            weights.clone(),
            Some(events_tx.clone()),
        )?);

        let (lines_tx, lines_rx) = unbounded();
        let router_thread = {
            let router = router.clone();
            thread::Builder::new()
                .name("router".to_string())
                .spawn(move || router.run(lines_rx))
                .map_err(|e| LoggerError::Internal(format!("cannot spawn router thread: {}", e)))?
        };

        // the pool hands each reader its own sender; the router stops once all are gone
        let readers = ReaderPool::start(
            &config.ports,
            opener,
            ReaderOutputs {
                lines: lines_tx,
                events: events_tx,
            },
            config.pause_poll(),
        )?;

        let autosave = match config.autosave_interval() {
            Some(interval) => Some(Autosave::spawn(
                router.clone(),
                config.output_dir.clone(),
                interval,
            )?),
            None => None,
        };

        info!(
            "Acquisition started on {} port(s), capacity {}, autosave {}",
            config.ports.len(),
            config.capacity,
            config
                .autosave_interval()
                .map(|i| format!("every {}s", i.as_secs()))
                .unwrap_or_else(|| "off".to_string())
        );

        Ok(Acquisition {
            config,
            router,
            readers,
            weights,
            events,
            router_thread: Mutex::new(Some(router_thread)),
            autosave: Mutex::new(autosave),
            started: Instant::now(),
        })
    }

    pub fn config(&self) -> &AcquisitionConfig {
        &self.config
    }

    /// Sample, reader-failure and flush notifications. At most
    /// `EVENT_BACKLOG` undrained events are kept; newer ones are dropped.
    pub fn events(&self) -> Receiver<CoreEvent> {
        self.events.clone()
    }

    pub fn pause_all(&self) -> usize {
        self.readers.pause_all()
    }

    pub fn resume_all(&self) -> usize {
        self.readers.resume_all()
    }

    pub fn stop_all(&self) -> usize {
        self.readers.stop_all()
    }

    pub fn reset_devices(&self) -> usize {
        self.readers.reset_all()
    }

    pub fn pause(&self, port: &PortId) -> CoreResult<()> {
        self.reader(port)?.pause()
    }

    pub fn resume(&self, port: &PortId) -> CoreResult<()> {
        self.reader(port)?.resume()
    }

    pub fn stop(&self, port: &PortId) -> CoreResult<()> {
        self.reader(port)?.stop()
    }

    fn reader(&self, port: &PortId) -> CoreResult<&PortReader> {
        self.readers
            .get(port)
            .ok_or_else(|| LoggerError::UnknownPort(port.to_string()))
    }

    /// Flush the session log to the configured output directory
    pub fn save(&self) -> CoreResult<PathBuf> {
        self.router.flush_log(&self.config.output_dir)
    }

    pub fn save_to(&self, dir: &Path) -> CoreResult<PathBuf> {
        self.router.flush_log(dir)
    }

    pub fn saved_files(&self) -> CoreResult<Vec<String>> {
        self.router.saved_files()
    }

    pub fn adjust_weight(&self, cell: usize, delta: i64) -> CoreResult<i64> {
        self.weights.adjust(cell, delta)
    }

    pub fn set_weight(&self, cell: usize, value: i64) -> CoreResult<()> {
        self.weights.set(cell, value)
    }

    pub fn reset_weights(&self) -> CoreResult<()> {
        self.weights.reset()
    }

    pub fn weights(&self) -> CoreResult<WeightGrid> {
        self.weights.snapshot()
    }

    pub fn snapshot(&self, metric: Metric, port: &PortId) -> CoreResult<Vec<SeriesPoint>> {
        self.router.snapshot(metric, port)
    }

    pub fn port_snapshot(&self, port: &PortId) -> CoreResult<PortSnapshot> {
        self.router.port_snapshot(port)
    }

    pub fn latest_all(&self) -> CoreResult<Vec<AcceptedSample>> {
        self.router.latest_all()
    }

    pub fn log_len(&self) -> CoreResult<usize> {
        self.router.log_len()
    }

    pub fn reader_states(&self) -> Vec<(PortId, ReaderState)> {
        self.readers.states()
    }

    pub fn live_status(&self) -> CoreResult<LiveStatus> {
        let states = self.readers.states();
        let threshold = self.config.silence_threshold();

        let mut status = LiveStatus::new(self.started.elapsed());
        for stats in self.router.port_stats()? {
            let state = states
                .iter()
                .find(|(port, _)| *port == stats.port)
                .map(|(_, state)| state.clone())
                .unwrap_or(ReaderState::Stopped);
            status.ports.push(PortStatus::new(stats, state, threshold));
        }
        status.weights = self.weights.snapshot()?.to_string();
        status.log_records = self.router.log_len()?;
        status.saved_files = self.router.saved_files()?;

        for port in status.silent_ports() {
            warn!("[{}] no samples for over {}s", port, threshold.as_secs());
        }
        Ok(status)
    }

    /// Stop every reader, the autosave timer and the router. Idempotent.
    pub fn shutdown(&self) {
        let stopped = self.readers.stop_all();
        debug!("stopped {} reader(s)", stopped);

        if let Ok(mut autosave) = self.autosave.lock() {
            if let Some(autosave) = autosave.take() {
                autosave.shutdown();
            }
        }

        // readers are joined, so every line sender is gone and the router drains out
        if let Ok(mut handle) = self.router_thread.lock() {
            if let Some(handle) = handle.take() {
                if handle.join().is_err() {
                    warn!("router thread panicked");
                }
                info!("Acquisition stopped");
            }
        }
    }
}

impl Drop for Acquisition {
    fn drop(&mut self) {
        self.shutdown();
    }
}
