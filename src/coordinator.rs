//! Authorization coordinator.
//!
//! The single driver of dispense policy: one loop that waits for a card
//! scan, asks the traffic light and the member organizations whether the
//! card gets a drink, arms the bus state machine for exactly one vend, and
//! reports the outcome to the winning organization. The bus state machine
//! drives protocol; this loop drives policy; the dispense slot is the only
//! hand-off between them.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::eventlog::EventSink;
use crate::legi::CardSlot;
use crate::mdb::DispenseSlot;
use crate::orgs::{Org, TrafficLight};

/// How long an authorized card waits for the machine to carry out the vend.
pub const VEND_WAIT: Duration = Duration::from_secs(2);

/// How often the loop checks its shutdown flag while no scan is pending.
const IDLE_WAIT: Duration = Duration::from_millis(500);

/// Big-endian integer value of the vend item bytes.
fn item_number(bytes: &[u8]) -> u32 {
    bytes
        .iter()
        .fold(0u32, |acc, &b| acc.wrapping_shl(8) | u32::from(b))
}

pub struct Coordinator {
    shutdown: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl std::fmt::Debug for Coordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Coordinator")
            .field("shutdown", &self.shutdown.load(Ordering::SeqCst))
            .finish_non_exhaustive()
    }
}

impl Coordinator {
    pub fn spawn(
        cards: Arc<CardSlot>,
        slot: Arc<DispenseSlot>,
        ampel: Box<dyn TrafficLight>,
        orgs: Vec<Box<dyn Org>>,
        events: Arc<dyn EventSink>,
    ) -> Self {
        let shutdown = Arc::new(AtomicBool::new(false));
        let shutdown_clone = Arc::clone(&shutdown);
        let handle = thread::spawn(move || {
            Self::worker_loop(&cards, &slot, &*ampel, &orgs, &*events, &shutdown_clone);
        });
        Self {
            shutdown,
            handle: Some(handle),
        }
    }

    fn worker_loop(
        cards: &CardSlot,
        slot: &DispenseSlot,
        ampel: &dyn TrafficLight,
        orgs: &[Box<dyn Org>],
        events: &dyn EventSink,
        shutdown: &AtomicBool,
    ) {
        let names: Vec<&str> = orgs.iter().map(|o| o.name()).collect();
        log::info!("authorization coordinator started (orgs: {})", names.join(", "));
        while !shutdown.load(Ordering::SeqCst) {
            let Some(card) = cards.take(IDLE_WAIT) else {
                continue;
            };
            Self::handle_card(&card, slot, ampel, orgs, events);
        }
        log::info!("authorization coordinator stopped");
    }

    fn handle_card(
        card: &str,
        slot: &DispenseSlot,
        ampel: &dyn TrafficLight,
        orgs: &[Box<dyn Org>],
        events: &dyn EventSink,
    ) {
        log::debug!("handling legi {card}");
        if !ampel.get_status() {
            log::info!("ampel denies dispensing for {card}");
            events.log_event("DENIED Ampel", card);
            return;
        }

        let mut authorized: Option<&dyn Org> = None;
        for org in orgs {
            match org.get_status(card) {
                Ok(true) => {
                    log::info!("{card} authorized by {}", org.name());
                    authorized = Some(org.as_ref());
                    break;
                }
                Ok(false) => {}
                Err(e) => {
                    log::warn!("{} status check failed for {card}: {e:#}", org.name());
                }
            }
        }
        let Some(org) = authorized else {
            log::info!("{card} not authorized by any org");
            events.log_event("DENIED", card);
            return;
        };

        let (dispensed, item) = slot.arm_and_wait(VEND_WAIT);
        if !dispensed {
            log::info!("no dispense for {card} (machine denied or timed out)");
            return;
        }
        let item = item_number(item.as_deref().unwrap_or_default());
        events.log_event("DISPENSE", &format!("{}:{card}:{item}", org.name()));
        if let Err(e) = org.report_dispensed(card, item) {
            log::error!(
                "caught error while reporting dispense of {item} for {card} to {}: {e:#}",
                org.name()
            );
        }
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
