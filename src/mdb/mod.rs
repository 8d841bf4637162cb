//! MDB cashless-peripheral role: command vocabulary, the application state
//! machine, and the dispense rendezvous shared with the coordinator.

pub mod codes;
pub mod slot;
pub mod stm;

pub use slot::DispenseSlot;
pub use stm::{MdbStm, State};
