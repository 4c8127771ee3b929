use crossbeam::channel::{Sender, TrySendError};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::mem;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::error::{CoreResult, LoggerError};
use crate::events::CoreEvent;
use crate::link::{LineLink, LinkOpener};
use crate::types::{LineEvent, PortId};

/// Reader lifecycle
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReaderState {
    Starting,
    Running,
    Paused,
    Stopped,
    Failed(String),
}

impl ReaderState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, ReaderState::Stopped | ReaderState::Failed(_))
    }
}

impl fmt::Display for ReaderState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReaderState::Starting => f.write_str("starting"),
            ReaderState::Running => f.write_str("running"),
            ReaderState::Paused => f.write_str("paused"),
            ReaderState::Stopped => f.write_str("stopped"),
            ReaderState::Failed(reason) => write!(f, "failed: {}", reason),
        }
    }
}

struct Control {
    state: ReaderState,
    /// Set by `resume`; the input buffer is cleared before the next read
    flush_pending: bool,
    reset_pending: bool,
}

struct Shared {
    control: Mutex<Control>,
    wake: Condvar,
}

impl Shared {
    fn lock(&self) -> CoreResult<MutexGuard<'_, Control>> {
        self.control
            .lock()
            .map_err(|_| LoggerError::poisoned("reader control"))
    }
}

/// Where a reader delivers lines and failures
#[derive(Clone)]
pub struct ReaderOutputs {
    pub lines: Sender<LineEvent>,
    pub events: Sender<CoreEvent>,
}

/// Owns one serial connection on a dedicated thread
pub struct PortReader {
    port: PortId,
    shared: Arc<Shared>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

enum Step {
    Exit,
    Idle,
    Read { flush: bool, reset: bool },
}

impl PortReader {
    /// Spawn the reader thread. The device is opened on that thread; an open
    /// failure moves the reader to `Failed` and is reported as an event.
    pub fn start(
        port: PortId,
        opener: Arc<dyn LinkOpener>,
        outputs: ReaderOutputs,
        idle_poll: Duration,
    ) -> CoreResult<Self> {
        let shared = Arc::new(Shared {
            control: Mutex::new(Control {
                state: ReaderState::Starting,
                flush_pending: false,
                reset_pending: false,
            }),
            wake: Condvar::new(),
        });

        let thread_port = port.clone();
        let thread_shared = shared.clone();
        let handle = thread::Builder::new()
            .name(format!("reader-{}", port))
            .spawn(move || {
                reader_thread(thread_port, opener, thread_shared, outputs, idle_poll)
            })
            .map_err(|e| LoggerError::Internal(format!("cannot spawn reader thread: {}", e)))?;

        Ok(PortReader {
            port,
            shared,
            handle: Mutex::new(Some(handle)),
        })
    }

    pub fn port(&self) -> &PortId {
        &self.port
    }

    pub fn state(&self) -> CoreResult<ReaderState> {
        Ok(self.shared.lock()?.state.clone())
    }

    /// Stop consuming bytes without closing the device
    pub fn pause(&self) -> CoreResult<()> {
        let mut guard = self.shared.lock()?;
        let control = &mut *guard;
        match control.state {
            ReaderState::Starting | ReaderState::Running => {
                control.state = ReaderState::Paused;
                info!("[{}] paused", self.port);
                Ok(())
            }
            ref other => Err(LoggerError::InvalidTransition(format!(
                "{}: cannot pause while {}",
                self.port, other
            ))),
        }
    }

    /// Resume reading; bytes that arrived while paused are discarded first
    pub fn resume(&self) -> CoreResult<()> {
        let mut guard = self.shared.lock()?;
        let control = &mut *guard;
        match control.state {
            ReaderState::Paused => {
                control.state = ReaderState::Running;
                control.flush_pending = true;
                self.shared.wake.notify_all();
                info!("[{}] resumed", self.port);
                Ok(())
            }
            ref other => Err(LoggerError::InvalidTransition(format!(
                "{}: cannot resume while {}",
                self.port, other
            ))),
        }
    }

    /// Ask the reader thread to pulse the device reset line before its next read
    pub fn reset_device(&self) -> CoreResult<()> {
        let mut control = self.shared.lock()?;
        if control.state.is_terminal() {
            return Err(LoggerError::InvalidTransition(format!(
                "{}: cannot reset while {}",
                self.port, control.state
            )));
        }
        control.reset_pending = true;
        Ok(())
    }

    /// Stop the thread and close the device. Returns within one read timeout
    /// and is safe to call any number of times.
    pub fn stop(&self) -> CoreResult<()> {
        {
            let mut control = self.shared.lock()?;
            if !matches!(control.state, ReaderState::Failed(_)) {
                control.state = ReaderState::Stopped;
            }
            self.shared.wake.notify_all();
        }

        let handle = self
            .handle
            .lock()
            .map_err(|_| LoggerError::poisoned("reader handle"))?
            .take();
        if let Some(handle) = handle {
            handle
                .join()
                .map_err(|_| LoggerError::Internal(format!("reader {} panicked", self.port)))?;
            info!("[{}] stopped", self.port);
        }
        Ok(())
    }
}

impl Drop for PortReader {
    fn drop(&mut self) {
        if let Err(e) = self.stop() {
            warn!("[{}] stop during drop failed: {}", self.port, e);
        }
    }
}

fn reader_thread(
    port: PortId,
    opener: Arc<dyn LinkOpener>,
    shared: Arc<Shared>,
    outputs: ReaderOutputs,
    idle_poll: Duration,
) {
    let link = match opener.open(&port) {
        Ok(link) => link,
        Err(e) => {
            fail(&port, &shared, &outputs, e.to_string());
            return;
        }
    };

    match shared.lock() {
        Ok(mut control) => {
            if control.state == ReaderState::Starting {
                control.state = ReaderState::Running;
            }
        }
        Err(e) => {
            fail(&port, &shared, &outputs, e.to_string());
            return;
        }
    }

    if let Err(reason) = read_loop(&port, link, &shared, &outputs, idle_poll) {
        fail(&port, &shared, &outputs, reason);
    }
}

/// Runs until stopped. The link is dropped (device closed) on return.
fn read_loop(
    port: &PortId,
    mut link: Box<dyn LineLink>,
    shared: &Shared,
    outputs: &ReaderOutputs,
    idle_poll: Duration,
) -> Result<(), String> {
    let mut lines_read = 0u64;
    loop {
        let step = {
            let mut guard = shared.lock().map_err(|e| e.to_string())?;
            if guard.state == ReaderState::Paused {
                guard = shared
                    .wake
                    .wait_timeout(guard, idle_poll)
                    .map_err(|_| "reader control lock poisoned".to_string())?
                    .0;
            }
            let control = &mut *guard;
            match control.state {
                ReaderState::Running => Step::Read {
                    flush: mem::take(&mut control.flush_pending),
                    reset: mem::take(&mut control.reset_pending),
                },
                ReaderState::Paused => Step::Idle,
                _ => Step::Exit,
            }
        };

        let (flush, reset) = match step {
            Step::Exit => return Ok(()),
            Step::Idle => continue,
            Step::Read { flush, reset } => (flush, reset),
        };

        if reset {
            link.pulse_reset()
                .map_err(|e| format!("device reset failed: {}", e))?;
            info!("[{}] device reset", port);
        }
        if flush {
            link.clear_input()
                .map_err(|e| format!("input flush failed: {}", e))?;
            debug!("[{}] input buffer cleared", port);
        }

        let bytes = match link.read_line() {
            Ok(Some(bytes)) => bytes,
            Ok(None) => continue,
            Err(e) => {
                return Err(LoggerError::PortIo {
                    port: port.to_string(),
                    reason: e.to_string(),
                }
                .to_string())
            }
        };

        let text = decode_line(&bytes);
        let line = text.trim();
        if line.is_empty() {
            continue;
        }

        // A pause or resume that happened while this line was being read
        // makes it stale.
        {
            let control = shared.lock().map_err(|e| e.to_string())?;
            if control.state != ReaderState::Running || control.flush_pending {
                debug!("[{}] dropping line read across a pause: {:?}", port, line);
                continue;
            }
        }

        let event = LineEvent {
            port: port.clone(),
            line: line.to_string(),
        };
        if outputs.lines.send(event).is_err() {
            debug!("[{}] router gone, reader exiting", port);
            return Ok(());
        }

        lines_read += 1;
        if lines_read % 1000 == 0 {
            debug!("[{}] {} lines", port, lines_read);
        }
    }
}

/// Decodes a raw line, dropping byte sequences that are not valid UTF-8
fn decode_line(bytes: &[u8]) -> String {
    bytes.utf8_chunks().map(|chunk| chunk.valid()).collect()
}

fn fail(port: &PortId, shared: &Shared, outputs: &ReaderOutputs, reason: String) {
    warn!("[{}] reader failed: {}", port, reason);
    if let Ok(mut control) = shared.control.lock() {
        if control.state == ReaderState::Stopped {
            return;
        }
        control.state = ReaderState::Failed(reason.clone());
    }
    let event = CoreEvent::ReaderFailed {
        port: port.clone(),
        reason,
    };
    if let Err(TrySendError::Full(_)) = outputs.events.try_send(event) {
        debug!("[{}] event queue full, failure event dropped", port);
    }
}

/// All readers of a session, addressed together
pub struct ReaderPool {
    readers: Vec<PortReader>,
}

impl ReaderPool {
    pub fn start(
        ports: &[PortId],
        opener: Arc<dyn LinkOpener>,
        outputs: ReaderOutputs,
        idle_poll: Duration,
    ) -> CoreResult<Self> {
        let mut readers = Vec::with_capacity(ports.len());
        for port in ports {
            readers.push(PortReader::start(
                port.clone(),
                opener.clone(),
                outputs.clone(),
                idle_poll,
            )?);
        }
        Ok(ReaderPool { readers })
    }

    pub fn readers(&self) -> &[PortReader] {
        &self.readers
    }

    pub fn get(&self, port: &PortId) -> Option<&PortReader> {
        self.readers.iter().find(|r| r.port() == port)
    }

    /// Returns how many readers were paused
    pub fn pause_all(&self) -> usize {
        self.apply("pause", PortReader::pause)
    }

    pub fn resume_all(&self) -> usize {
        self.apply("resume", PortReader::resume)
    }

    pub fn reset_all(&self) -> usize {
        self.apply("reset", PortReader::reset_device)
    }

    pub fn stop_all(&self) -> usize {
        self.apply("stop", PortReader::stop)
    }

    pub fn states(&self) -> Vec<(PortId, ReaderState)> {
        self.readers
            .iter()
            .map(|r| {
                let state = r
                    .state()
                    .unwrap_or_else(|e| ReaderState::Failed(e.to_string()));
                (r.port().clone(), state)
            })
            .collect()
    }

    fn apply(&self, what: &str, op: fn(&PortReader) -> CoreResult<()>) -> usize {
        let mut applied = 0;
        for reader in &self.readers {
            match op(reader) {
                Ok(()) => applied += 1,
                Err(e) => debug!("[{}] {} skipped: {}", reader.port(), what, e),
            }
        }
        applied
    }
}
