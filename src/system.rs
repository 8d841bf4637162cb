//! System lifecycle: wires the serial ports, the state machines, and the
//! worker threads together, and tears them down again.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};

use crate::alert::{Alerter, HttpAlerter, LogAlerter};
use crate::config::{log_file_path, Config};
use crate::coordinator::Coordinator;
use crate::eventlog::{EventSink, FileEventLog};
use crate::legi::{CardSlot, LegiListener};
use crate::link::{LinkWorker, ResponseWatchdog};
use crate::mdb::{DispenseSlot, MdbStm};
use crate::orgs::{self, AmpelProbe};
use crate::serial::SerialStream;

pub struct System {
    config: Config,
    slot: Arc<DispenseSlot>,
    cards: Arc<CardSlot>,
    events: Arc<dyn EventSink>,
    link: Option<LinkWorker>,
    legi: Option<LegiListener>,
    coordinator: Option<Coordinator>,
}

impl std::fmt::Debug for System {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("System")
            .field("running", &self.is_running())
            .finish_non_exhaustive()
    }
}

impl System {
    pub fn new(config: Config) -> Result<Self> {
        let events = Arc::new(FileEventLog::open(&config.log.faillog)?);
        Ok(Self {
            config,
            slot: Arc::new(DispenseSlot::new()),
            cards: Arc::new(CardSlot::new()),
            events,
            link: None,
            legi: None,
            coordinator: None,
        })
    }

    /// Open both serial ports and spawn the three workers.
    pub fn start(&mut self) -> Result<()> {
        if self.is_running() {
            log::warn!("system already running");
            return Ok(());
        }
        log::info!("starting");

        let mdb_stream = SerialStream::open(
            &self.config.mdb.port,
            self.config.mdb.baud,
            Duration::from_millis(self.config.mdb.read_timeout_ms),
        )?;
        let legi_stream = SerialStream::open(
            &self.config.legi.port,
            self.config.legi.baud,
            Duration::from_millis(self.config.legi.read_timeout_ms),
        )?;
        let enable = self.config.legi.enable_bytes()?;

        let alerter: Arc<dyn Alerter> = match &self.config.alert.gateway_url {
            Some(url) => Arc::new(HttpAlerter::new(url.clone())?),
            None => Arc::new(LogAlerter),
        };
        let watchdog = ResponseWatchdog::spawn(alerter, Some(log_file_path()));

        let stm = MdbStm::new(Arc::clone(&self.slot));
        self.link = Some(LinkWorker::spawn(mdb_stream, stm, watchdog));
        self.legi = Some(LegiListener::spawn(
            legi_stream,
            enable,
            Arc::clone(&self.cards),
        ));

        let orgs = orgs::build_registry(&self.config.orgs).context("building org registry")?;
        let ampel = Box::new(AmpelProbe::new(
            &self.config.ampel.host,
            &self.config.ampel.suffix,
        )?);
        self.coordinator = Some(Coordinator::spawn(
            Arc::clone(&self.cards),
            Arc::clone(&self.slot),
            ampel,
            orgs,
            Arc::clone(&self.events),
        ));
        Ok(())
    }

    /// Stop all workers. Blocks until each thread observed its flag, bounded
    /// by the serial read timeouts.
    pub fn stop(&mut self) {
        log::info!("stopping");
        if let Some(mut legi) = self.legi.take() {
            legi.stop();
        }
        if let Some(mut link) = self.link.take() {
            link.stop();
        }
        // A vend interrupted by shutdown reads as not dispensed; without this
        // the coordinator would wait on a hold nobody can settle anymore.
        self.slot.release_if_held();
        if let Some(mut coordinator) = self.coordinator.take() {
            coordinator.stop();
        }
    }

    pub fn is_running(&self) -> bool {
        self.link.as_ref().is_some_and(LinkWorker::is_running)
            || self.legi.as_ref().is_some_and(LegiListener::is_running)
            || self
                .coordinator
                .as_ref()
                .is_some_and(Coordinator::is_running)
    }

    /// One-line status summary for the REPL.
    pub fn status(&self) -> String {
        let worker = |running: Option<bool>| match running {
            Some(true) => "running",
            Some(false) => "dead",
            None => "stopped",
        };
        format!(
            "link: {} ({}), legi: {} ({}), coordinator: {}",
            worker(self.link.as_ref().map(LinkWorker::is_running)),
            self.config.mdb.port,
            worker(self.legi.as_ref().map(LegiListener::is_running)),
            self.config.legi.port,
            worker(self.coordinator.as_ref().map(Coordinator::is_running)),
        )
    }
}
