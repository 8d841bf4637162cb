//! RFID (legi) reader listener.
//!
//! The reader answers with fixed 14-byte frames once enabled and goes quiet
//! until the enable byte string is written again, so the listener rearms it
//! after every non-empty read. Card ids are the three bytes at offset 10,
//! published as lowercase hex to a single-cell hand-off that the
//! authorization coordinator drains; a scan that arrives while the previous
//! one is still unconsumed replaces it.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use data_encoding::HEXLOWER;

use crate::serial::ByteIo;

/// Reader response frames are always this long.
pub const FRAME_LEN: usize = 14;

/// Leading bytes of a valid card-read frame.
const FRAME_HEADER: [u8; 2] = [0x0D, 0x80];

/// Card id location inside the frame.
const CARD_OFFSET: usize = 10;
const CARD_LEN: usize = 3;

/// One-element scan buffer between the listener and the coordinator.
/// Last writer wins.
#[derive(Debug, Default)]
pub struct CardSlot {
    cell: Mutex<Option<String>>,
    scanned: Condvar,
}

impl CardSlot {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&self, card: String) {
        let mut cell = self.cell.lock().expect("card slot mutex poisoned");
        if let Some(old) = cell.replace(card) {
            log::warn!("dropping unconsumed scan {old}");
        }
        self.scanned.notify_one();
    }

    /// Take the pending scan, waiting up to `timeout` for one to arrive.
    pub fn take(&self, timeout: Duration) -> Option<String> {
        let deadline = Instant::now() + timeout;
        let mut cell = self.cell.lock().expect("card slot mutex poisoned");
        loop {
            if let Some(card) = cell.take() {
                return Some(card);
            }
            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            let (guard, _) = self
                .scanned
                .wait_timeout(cell, deadline - now)
                .expect("card slot mutex poisoned");
            cell = guard;
        }
    }
}

/// Worker thread owning the RFID serial port.
pub struct LegiListener {
    shutdown: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl std::fmt::Debug for LegiListener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LegiListener")
            .field("shutdown", &self.shutdown.load(Ordering::SeqCst))
            .finish_non_exhaustive()
    }
}

impl LegiListener {
    pub fn spawn<S>(stream: S, enable: Vec<u8>, cards: Arc<CardSlot>) -> Self
    where
        S: ByteIo + Send + 'static,
    {
        let shutdown = Arc::new(AtomicBool::new(false));
        let shutdown_clone = Arc::clone(&shutdown);
        let handle = thread::spawn(move || {
            Self::worker_loop(stream, &enable, &cards, &shutdown_clone);
        });
        Self {
            shutdown,
            handle: Some(handle),
        }
    }

    fn worker_loop<S: ByteIo>(
        mut stream: S,
        enable: &[u8],
        cards: &CardSlot,
        shutdown: &AtomicBool,
    ) {
        log::info!("legi listener started");
        if let Err(e) = stream.write_bytes(enable) {
            log::error!("failed to enable RFID reader: {e}");
        }
        while !shutdown.load(Ordering::SeqCst) {
            let mut buf = [0u8; FRAME_LEN];
            let read = match stream.read_frame(&mut buf) {
                Ok(0) => continue,
                Ok(n) => n,
                Err(e) => {
                    log::error!("serial read failed on RFID port: {e}");
                    // one attempt to rearm the reader, then give up the thread
                    if stream.write_bytes(enable).is_err() {
                        break;
                    }
                    continue;
                }
            };

            log::debug!("got input {}", HEXLOWER.encode(&buf[..read]));
            if read == FRAME_LEN && buf[..2] == FRAME_HEADER {
                let card = HEXLOWER.encode(&buf[CARD_OFFSET..CARD_OFFSET + CARD_LEN]);
                log::info!("read legi {card}");
                cards.put(card);
            }
            if let Err(e) = stream.write_bytes(enable) {
                log::warn!("failed to rearm RFID reader: {e}");
            }
        }
        log::info!("legi listener stopped");
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
