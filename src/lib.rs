//! Kaffi: on-device controller for an MDB coffee machine that authorizes
//! free dispenses against membership services using RFID student cards.
//!
//! The daemon plays the MDB cashless-peripheral role on one serial line,
//! listens to an RFID reader on a second, and asks per-organization HTTP
//! services whether a scanned card gets a drink. Three worker threads:
//!
//! - [`link::LinkWorker`] frames the MDB byte stream and runs the cashless
//!   state machine ([`mdb::MdbStm`]),
//! - [`legi::LegiListener`] turns reader frames into card scans,
//! - [`coordinator::Coordinator`] turns scans into at most one authorized
//!   vend each, via the [`mdb::DispenseSlot`] rendezvous.

pub mod alert;
pub mod config;
pub mod coordinator;
pub mod eventlog;
pub mod legi;
pub mod link;
pub mod mdb;
pub mod orgs;
pub mod serial;
pub mod system;

pub use config::Config;
pub use mdb::{DispenseSlot, MdbStm};
pub use system::System;
