//! Link layer for the MDB serial line.
//!
//! The machine frames its commands STX .. DLE ETX with DLE doubling inside
//! the payload; bare ACK/NAK bytes appear between frames. [`LinkStm`] is the
//! byte-at-a-time receive state machine, [`encode_reply`] the transmit path,
//! and [`LinkWorker`] the thread that couples both to the application state
//! machine. [`ResponseWatchdog`] alerts (and only alerts) when the line goes
//! quiet mid-conversation.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use data_encoding::HEXLOWER;

use crate::alert::{read_log_tail, Alerter};
use crate::mdb::MdbStm;
use crate::serial::ByteIo;

pub const STX: u8 = 0x02;
pub const ETX: u8 = 0x03;
pub const DLE: u8 = 0x10;
pub const ACK: u8 = 0x06;
pub const NAK: u8 = 0x15;

/// Alert when no frame was delivered for this long after the last one.
pub const RESPONSE_TIMEOUT: Duration = Duration::from_secs(5);

/// How many log lines the timeout alert carries.
const ALERT_TAIL_LINES: usize = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FrameState {
    Idle,
    InFrame,
    AfterDle,
}

/// What one inbound byte produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEvent {
    /// Nothing to act on yet.
    Pending,
    /// A complete frame payload.
    Frame(Vec<u8>),
    /// Bare NAK on the wire.
    Nack,
}

/// Receive-side framing state machine. Knows nothing about MDB semantics.
#[derive(Debug)]
pub struct LinkStm {
    state: FrameState,
    rx_buf: Vec<u8>,
}

impl Default for LinkStm {
    fn default() -> Self {
        Self::new()
    }
}

impl LinkStm {
    pub fn new() -> Self {
        Self {
            state: FrameState::Idle,
            rx_buf: Vec::new(),
        }
    }

    /// Advance by one byte.
    pub fn push(&mut self, byte: u8) -> LinkEvent {
        match self.state {
            FrameState::Idle => match byte {
                STX => {
                    self.state = FrameState::InFrame;
                    self.rx_buf.clear();
                    LinkEvent::Pending
                }
                ACK => LinkEvent::Pending,
                NAK => {
                    log::warn!("got NAK");
                    LinkEvent::Nack
                }
                other => {
                    log::warn!("unexpected byte {other:02x} between frames");
                    LinkEvent::Pending
                }
            },
            FrameState::InFrame => {
                if byte == DLE {
                    self.state = FrameState::AfterDle;
                } else {
                    self.rx_buf.push(byte);
                }
                LinkEvent::Pending
            }
            FrameState::AfterDle => match byte {
                ETX => {
                    self.state = FrameState::Idle;
                    let frame = std::mem::take(&mut self.rx_buf);
                    log::debug!("received frame {}", HEXLOWER.encode(&frame));
                    LinkEvent::Frame(frame)
                }
                // DLE escapes itself
                DLE => {
                    self.rx_buf.push(DLE);
                    self.state = FrameState::InFrame;
                    LinkEvent::Pending
                }
                other => {
                    log::warn!("unexpected byte {other:02x} after DLE");
                    self.state = FrameState::InFrame;
                    LinkEvent::Pending
                }
            },
        }
    }
}

/// Serialise a reply payload for the wire: link ACK, STX, payload with every
/// DLE doubled, DLE, ETX.
pub fn encode_reply(payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(payload.len() + 4);
    out.push(ACK);
    out.push(STX);
    for &byte in payload {
        out.push(byte);
        if byte == DLE {
            out.push(DLE);
        }
    }
    out.push(DLE);
    out.push(ETX);
    out
}

#[derive(Debug)]
struct WatchdogState {
    deadline: Option<Instant>,
    fired: bool,
}

#[derive(Debug)]
struct WatchdogShared {
    state: Mutex<WatchdogState>,
    changed: Condvar,
    shutdown: AtomicBool,
}

/// Rearm-on-delivery timer. Fires at most once per arming; firing invokes the
/// alert hook with the tail of the log file and nothing else.
pub struct ResponseWatchdog {
    shared: Arc<WatchdogShared>,
    handle: Option<JoinHandle<()>>,
}

impl std::fmt::Debug for ResponseWatchdog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResponseWatchdog").finish_non_exhaustive()
    }
}

impl ResponseWatchdog {
    pub fn spawn(alerter: Arc<dyn Alerter>, log_path: Option<PathBuf>) -> Self {
        let shared = Arc::new(WatchdogShared {
            state: Mutex::new(WatchdogState {
                deadline: None,
                fired: false,
            }),
            changed: Condvar::new(),
            shutdown: AtomicBool::new(false),
        });
        let worker_shared = Arc::clone(&shared);
        let handle = thread::spawn(move || {
            Self::worker_loop(&worker_shared, &*alerter, log_path.as_deref());
        });
        Self {
            shared,
            handle: Some(handle),
        }
    }

    /// Restart the timeout window. Called after every delivered frame.
    pub fn rearm(&self) {
        let mut state = self.shared.state.lock().expect("watchdog mutex poisoned");
        state.deadline = Some(Instant::now() + RESPONSE_TIMEOUT);
        state.fired = false;
        self.shared.changed.notify_one();
    }

    pub fn stop(&mut self) {
        self.shared.shutdown.store(true, Ordering::SeqCst);
        self.shared.changed.notify_one();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }

    fn worker_loop(
        shared: &WatchdogShared,
        alerter: &dyn Alerter,
        log_path: Option<&std::path::Path>,
    ) {
        let mut state = shared.state.lock().expect("watchdog mutex poisoned");
        loop {
            if shared.shutdown.load(Ordering::SeqCst) {
                break;
            }
            let wait = match state.deadline {
                Some(deadline) if !state.fired => {
                    let now = Instant::now();
                    if now >= deadline {
                        state.fired = true;
                        drop(state);
                        log::warn!(
                            "no frame received within {} seconds",
                            RESPONSE_TIMEOUT.as_secs()
                        );
                        let tail = log_path
                            .map(|p| read_log_tail(p, ALERT_TAIL_LINES))
                            .unwrap_or_default();
                        alerter.alert_response_timeout(&tail);
                        state = shared.state.lock().expect("watchdog mutex poisoned");
                        continue;
                    }
                    deadline - now
                }
                // unarmed, or already fired: sleep until rearmed
                _ => Duration::from_millis(500),
            };
            let (guard, _) = shared
                .changed
                .wait_timeout(state, wait)
                .expect("watchdog mutex poisoned");
            state = guard;
        }
    }
}

/// The MDB-side worker: reads bytes, frames them, runs the application state
/// machine, and writes the framed reply. One frame is always processed to
/// completion before the next byte is read.
pub struct LinkWorker {
    shutdown: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl std::fmt::Debug for LinkWorker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LinkWorker")
            .field("shutdown", &self.shutdown.load(Ordering::SeqCst))
            .finish_non_exhaustive()
    }
}

impl LinkWorker {
    pub fn spawn<S>(stream: S, stm: MdbStm, watchdog: ResponseWatchdog) -> Self
    where
        S: ByteIo + Send + 'static,
    {
        let shutdown = Arc::new(AtomicBool::new(false));
        let shutdown_clone = Arc::clone(&shutdown);
        let handle = thread::spawn(move || {
            Self::worker_loop(stream, stm, watchdog, &shutdown_clone);
        });
        Self {
            shutdown,
            handle: Some(handle),
        }
    }

    fn worker_loop<S: ByteIo>(
        mut stream: S,
        mut stm: MdbStm,
        mut watchdog: ResponseWatchdog,
        shutdown: &AtomicBool,
    ) {
        log::info!("link worker started");
        let mut link = LinkStm::new();
        while !shutdown.load(Ordering::SeqCst) {
            let byte = match stream.read_byte() {
                Ok(Some(byte)) => byte,
                Ok(None) => continue,
                Err(e) => {
                    log::error!("serial read failed on MDB port: {e}");
                    break;
                }
            };
            match link.push(byte) {
                LinkEvent::Pending => {}
                LinkEvent::Nack => stm.received_nack(),
                LinkEvent::Frame(frame) => {
                    let reply = stm.received_data(&frame);
                    let wire = encode_reply(&reply);
                    if let Err(e) = stream.write_bytes(&wire) {
                        log::error!("serial write failed on MDB port: {e}");
                        break;
                    }
                    watchdog.rearm();
                }
            }
        }
        watchdog.stop();
        log::info!("link worker stopped");
    }

    pub fn is_running(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }

    pub fn stop(&mut self) {
        self.shutdown.store(true, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn feed(link: &mut LinkStm, bytes: &[u8]) -> Vec<LinkEvent> {
        bytes
            .iter()
            .map(|&b| link.push(b))
            .filter(|e| *e != LinkEvent::Pending)
            .collect()
    }

    #[test]
    fn frames_a_simple_payload() {
        let mut link = LinkStm::new();
        let events = feed(&mut link, &[STX, 0x00, 0x12, DLE, ETX]);
        assert_eq!(events, vec![LinkEvent::Frame(vec![0x00, 0x12])]);
    }

    #[test]
    fn doubled_dle_is_unescaped() {
        let mut link = LinkStm::new();
        let events = feed(&mut link, &[STX, 0x00, DLE, DLE, 0x01, DLE, ETX]);
        assert_eq!(events, vec![LinkEvent::Frame(vec![0x00, DLE, 0x01])]);
    }

    #[test]
    fn nak_is_reported_and_ack_is_ignored() {
        let mut link = LinkStm::new();
        assert_eq!(link.push(ACK), LinkEvent::Pending);
        assert_eq!(link.push(NAK), LinkEvent::Nack);
    }

    #[test]
    fn garbage_between_frames_is_ignored() {
        let mut link = LinkStm::new();
        let events = feed(&mut link, &[0x55, 0xAA, STX, 0x12, DLE, ETX]);
        assert_eq!(events, vec![LinkEvent::Frame(vec![0x12])]);
    }

    #[test]
    fn garbage_after_dle_stays_in_frame() {
        let mut link = LinkStm::new();
        // the stray byte after DLE is dropped, the frame survives
        let events = feed(&mut link, &[STX, 0x01, DLE, 0x42, 0x02, DLE, ETX]);
        assert_eq!(events, vec![LinkEvent::Frame(vec![0x01, 0x02])]);
    }

    #[test]
    fn encode_wraps_and_doubles_dle() {
        assert_eq!(
            encode_reply(&[0x00, DLE, 0x03]),
            vec![ACK, STX, 0x00, DLE, DLE, 0x03, DLE, ETX]
        );
    }

    #[test]
    fn encode_decode_round_trip() {
        // every payload survives escaping, including DLE runs and ETX bytes
        let payloads: [&[u8]; 4] = [
            &[],
            &[DLE, DLE, DLE],
            &[0x00, 0x03, ETX, STX],
            &[0x01, DLE, ETX, DLE],
        ];
        for payload in payloads {
            let wire = encode_reply(payload);
            let mut link = LinkStm::new();
            let mut frames = Vec::new();
            // skip the leading link ACK, the peer's decoder would too
            for &byte in &wire[1..] {
                if let LinkEvent::Frame(f) = link.push(byte) {
                    frames.push(f);
                }
            }
            assert_eq!(frames, vec![payload.to_vec()]);
        }
    }
}
