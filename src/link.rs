use crossbeam::channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use log::{debug, info};
use serialport::{ClearBuffer, DataBits, FlowControl, Parity, SerialPort, StopBits};
use std::collections::HashMap;
use std::io::{self, Read};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use crate::error::{CoreResult, LoggerError};
use crate::types::PortId;

/// Longest partial line kept while waiting for a terminator
const MAX_PENDING: usize = 4096;

/// How long DTR is held low by a device reset
const RESET_PULSE: Duration = Duration::from_millis(100);

/// Time until `deadline`, `None` once it has passed
fn time_left(deadline: Instant) -> Option<Duration> {
    let remaining = deadline.saturating_duration_since(Instant::now());
    (!remaining.is_zero()).then_some(remaining)
}

/// Line-oriented byte source owned by exactly one reader thread.
/// Dropping the link closes the device.
pub trait LineLink: Send {
    /// Next complete line without its `\n`; `Ok(None)` when the read timed out
    fn read_line(&mut self) -> io::Result<Option<Vec<u8>>>;

    /// Discard everything received but not yet returned
    fn clear_input(&mut self) -> io::Result<()>;

    /// Pulse the reset line of the device, if it has one
    fn pulse_reset(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Opens the link for a configured port
pub trait LinkOpener: Send + Sync {
    fn open(&self, port: &PortId) -> CoreResult<Box<dyn LineLink>>;
}

/// Splits buffered bytes on `\n`
#[derive(Debug, Default)]
struct LineBuffer {
    pending: Vec<u8>,
}

impl LineBuffer {
    fn take_line(&mut self) -> Option<Vec<u8>> {
        let end = self.pending.iter().position(|b| *b == b'\n')?;
        let mut line: Vec<u8> = self.pending.drain(..=end).collect();
        line.pop();
        Some(line)
    }

    fn extend(&mut self, bytes: &[u8]) {
        self.pending.extend_from_slice(bytes);
        if self.pending.len() > MAX_PENDING && !self.pending.contains(&b'\n') {
            debug!("Dropping {} bytes without a line terminator", self.pending.len());
            self.pending.clear();
        }
    }

    fn clear(&mut self) {
        self.pending.clear();
    }
}

/// Serial device link (8N1, no flow control)
pub struct SerialLink {
    port: Box<dyn SerialPort>,
    buffer: LineBuffer,
    timeout: Duration,
}

impl SerialLink {
    pub fn open(path: &str, baud_rate: u32, timeout: Duration) -> Result<Self, serialport::Error> {
        let port = serialport::new(path, baud_rate)
            .data_bits(DataBits::Eight)
            .parity(Parity::None)
            .stop_bits(StopBits::One)
            .flow_control(FlowControl::None)
            .timeout(timeout)
            .open()?;

        info!("Opened serial port: {} at {} baud", path, baud_rate);
        Ok(SerialLink {
            port,
            buffer: LineBuffer::default(),
            timeout,
        })
    }
}

impl LineLink for SerialLink {
    fn read_line(&mut self) -> io::Result<Option<Vec<u8>>> {
        let deadline = Instant::now() + self.timeout;
        let mut chunk = [0u8; 256];
        loop {
            if let Some(line) = self.buffer.take_line() {
                return Ok(Some(line));
            }
            let remaining = match time_left(deadline) {
                Some(remaining) => remaining,
                None => return Ok(None),
            };
            // one read_line call never blocks past its own timeout
            self.port.set_timeout(remaining)?;
            match self.port.read(&mut chunk) {
                Ok(0) => return Ok(None),
                Ok(n) => self.buffer.extend(&chunk[..n]),
                Err(e) if e.kind() == io::ErrorKind::TimedOut => return Ok(None),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e),
            }
        }
    }

    fn clear_input(&mut self) -> io::Result<()> {
        self.buffer.clear();
        self.port.clear(ClearBuffer::Input)?;
        Ok(())
    }

    fn pulse_reset(&mut self) -> io::Result<()> {
        self.port.write_data_terminal_ready(false)?;
        thread::sleep(RESET_PULSE);
        self.port.write_data_terminal_ready(true)?;
        Ok(())
    }
}

/// Opens every port as a [`SerialLink`] with the same settings
#[derive(Debug, Clone)]
pub struct SerialOpener {
    pub baud_rate: u32,
    pub read_timeout: Duration,
}

impl LinkOpener for SerialOpener {
    fn open(&self, port: &PortId) -> CoreResult<Box<dyn LineLink>> {
        let link = SerialLink::open(port.as_str(), self.baud_rate, self.read_timeout).map_err(
            |e| LoggerError::PortOpen {
                port: port.to_string(),
                reason: e.to_string(),
            },
        )?;
        Ok(Box::new(link))
    }
}

enum Chunk {
    Bytes(Vec<u8>),
    Fail(String),
}

/// Counters shared between an in-memory link and its feeder
#[derive(Debug, Default)]
struct LinkCounters {
    clears: AtomicUsize,
    resets: AtomicUsize,
    closes: AtomicUsize,
}

/// In-memory link: bytes pushed through a [`LinkFeeder`] play the role of
/// the OS receive buffer. Used for loopback runs and tests.
pub struct ChannelLink {
    rx: Receiver<Chunk>,
    buffer: LineBuffer,
    timeout: Duration,
    counters: Arc<LinkCounters>,
}

/// Sending side of a [`ChannelLink`]
#[derive(Clone)]
pub struct LinkFeeder {
    tx: Sender<Chunk>,
    counters: Arc<LinkCounters>,
}

impl ChannelLink {
    pub fn pair(timeout: Duration) -> (ChannelLink, LinkFeeder) {
        let (tx, rx) = unbounded();
        let counters = Arc::new(LinkCounters::default());
        (
            ChannelLink {
                rx,
                buffer: LineBuffer::default(),
                timeout,
                counters: counters.clone(),
            },
            LinkFeeder { tx, counters },
        )
    }
}

impl LineLink for ChannelLink {
    fn read_line(&mut self) -> io::Result<Option<Vec<u8>>> {
        let deadline = Instant::now() + self.timeout;
        loop {
            if let Some(line) = self.buffer.take_line() {
                return Ok(Some(line));
            }
            let remaining = match time_left(deadline) {
                Some(remaining) => remaining,
                None => return Ok(None),
            };
            match self.rx.recv_timeout(remaining) {
                Ok(Chunk::Bytes(bytes)) => self.buffer.extend(&bytes),
                Ok(Chunk::Fail(reason)) => return Err(io::Error::new(io::ErrorKind::Other, reason)),
                Err(RecvTimeoutError::Timeout) => return Ok(None),
                Err(RecvTimeoutError::Disconnected) => {
                    return Err(io::Error::new(
                        io::ErrorKind::BrokenPipe,
                        "device disconnected",
                    ))
                }
            }
        }
    }

    fn clear_input(&mut self) -> io::Result<()> {
        self.buffer.clear();
        while let Ok(chunk) = self.rx.try_recv() {
            if let Chunk::Fail(reason) = chunk {
                return Err(io::Error::new(io::ErrorKind::Other, reason));
            }
        }
        self.counters.clears.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn pulse_reset(&mut self) -> io::Result<()> {
        self.counters.resets.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

impl Drop for ChannelLink {
    fn drop(&mut self) {
        self.counters.closes.fetch_add(1, Ordering::SeqCst);
    }
}

impl LinkFeeder {
    /// Queue `line` followed by `\n`
    pub fn send_line(&self, line: &str) -> bool {
        let mut bytes = line.as_bytes().to_vec();
        bytes.push(b'\n');
        self.send_bytes(&bytes)
    }

    pub fn send_bytes(&self, bytes: &[u8]) -> bool {
        self.tx.send(Chunk::Bytes(bytes.to_vec())).is_ok()
    }

    /// Make the next read fail with an I/O error
    pub fn inject_error(&self, reason: &str) -> bool {
        self.tx.send(Chunk::Fail(reason.to_string())).is_ok()
    }

    pub fn clears(&self) -> usize {
        self.counters.clears.load(Ordering::SeqCst)
    }

    pub fn resets(&self) -> usize {
        self.counters.resets.load(Ordering::SeqCst)
    }

    pub fn closes(&self) -> usize {
        self.counters.closes.load(Ordering::SeqCst)
    }
}

/// Hands out pre-built [`ChannelLink`]s, each one exactly once
#[derive(Default)]
pub struct ChannelOpener {
    links: Mutex<HashMap<PortId, ChannelLink>>,
}

impl ChannelOpener {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a link for `port` and return its feeder
    pub fn add(&self, port: &PortId, timeout: Duration) -> LinkFeeder {
        let (link, feeder) = ChannelLink::pair(timeout);
        if let Ok(mut links) = self.links.lock() {
            links.insert(port.clone(), link);
        }
        feeder
    }
}

impl LinkOpener for ChannelOpener {
    fn open(&self, port: &PortId) -> CoreResult<Box<dyn LineLink>> {
        let mut links = self
            .links
            .lock()
            .map_err(|_| LoggerError::poisoned("link table"))?;
        match links.remove(port) {
            Some(link) => Ok(Box::new(link)),
            None => Err(LoggerError::PortOpen {
                port: port.to_string(),
                reason: "no such device".to_string(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_line_buffer_splits_on_newline() {
        let mut buffer = LineBuffer::default();
        buffer.extend(b"1,2,");
        assert_eq!(buffer.take_line(), None);
        buffer.extend(b"3,4\r\n5,6");
        assert_eq!(buffer.take_line(), Some(b"1,2,3,4\r".to_vec()));
        assert_eq!(buffer.take_line(), None);
        buffer.extend(b",7,8\n");
        assert_eq!(buffer.take_line(), Some(b"5,6,7,8".to_vec()));
    }

    #[test]
    fn test_line_buffer_drops_runaway_input() {
        let mut buffer = LineBuffer::default();
        buffer.extend(&vec![b'x'; MAX_PENDING + 1]);
        buffer.extend(b"1,2,3,4\n");
        assert_eq!(buffer.take_line(), Some(b"1,2,3,4".to_vec()));
    }

    #[test]
    fn test_channel_link_times_out() {
        let (mut link, _feeder) = ChannelLink::pair(Duration::from_millis(20));
        assert_eq!(link.read_line().unwrap(), None);
    }

    #[test]
    fn test_time_left_shrinks_to_none() {
        let deadline = Instant::now() + Duration::from_millis(200);
        let left = time_left(deadline).unwrap();
        assert!(left <= Duration::from_millis(200));
        assert_eq!(time_left(Instant::now()), None);
        assert_eq!(time_left(Instant::now() - Duration::from_millis(5)), None);
    }

    #[test]
    fn test_trickling_bytes_do_not_extend_the_timeout() {
        let timeout = Duration::from_millis(50);
        let (mut link, feeder) = ChannelLink::pair(timeout);
        let trickle = thread::spawn(move || {
            for _ in 0..30 {
                feeder.send_bytes(b"x");
                thread::sleep(Duration::from_millis(10));
            }
        });

        let started = Instant::now();
        assert_eq!(link.read_line().unwrap(), None);
        assert!(started.elapsed() < timeout * 4);
        trickle.join().unwrap();
    }

    #[test]
    fn test_channel_link_clear_discards_queued_bytes() {
        let (mut link, feeder) = ChannelLink::pair(Duration::from_millis(20));
        feeder.send_line("stale,0,0,0");
        feeder.send_bytes(b"partial");
        link.clear_input().unwrap();
        feeder.send_line("fresh,0,0,0");
        assert_eq!(link.read_line().unwrap(), Some(b"fresh,0,0,0".to_vec()));
        assert_eq!(feeder.clears(), 1);
    }

    #[test]
    fn test_channel_link_reports_failure_and_close() {
        let (mut link, feeder) = ChannelLink::pair(Duration::from_millis(20));
        feeder.inject_error("unplugged");
        assert!(link.read_line().is_err());
        drop(link);
        assert_eq!(feeder.closes(), 1);
    }

    #[test]
    fn test_channel_link_disconnect_is_an_error() {
        let (mut link, feeder) = ChannelLink::pair(Duration::from_millis(20));
        drop(feeder);
        let err = link.read_line().unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::BrokenPipe);
    }

    #[test]
    fn test_channel_opener_hands_out_once() {
        let opener = ChannelOpener::new();
        let port = PortId::new("COM3");
        opener.add(&port, Duration::from_millis(10));
        assert!(opener.open(&port).is_ok());
        assert!(matches!(
            opener.open(&port),
            Err(LoggerError::PortOpen { .. })
        ));
    }
}
