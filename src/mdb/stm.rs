//! The cashless-peripheral state machine.
//!
//! Runs entirely on the link worker's thread: `received_data` is called once
//! per inbound frame and returns the reply payload for that frame. The only
//! cross-thread state is the [`DispenseSlot`] shared with the authorization
//! coordinator; the machine observes the armed slot on POLL, takes hold of it
//! on VEND REQUEST, and settles it on every path out of the vend state.

use std::sync::Arc;

use data_encoding::HEXLOWER;

use super::codes::{self, Command};
use super::slot::DispenseSlot;

/// POLLs to absorb in `SessionEnding` before requesting session cancel
/// ourselves. Tunable; the machine normally closes the session first.
pub const CANCEL_COUNTDOWN_POLLS: u32 = 10;

/// Reader configuration reply: feature level 1, currency 0x0001, scale 1,
/// two decimals, one-second max response time, no options.
const READER_CONFIG: [u8; 8] = [
    codes::RES_READER_CONFIG_DATA,
    0x01,
    0x00,
    0x01,
    0x01,
    0x02,
    0x01,
    0x00,
];

const MANUFACTURER_CODE: &[u8; 3] = b"KFI";
const SERIAL_NUMBER: &[u8; 12] = b"000000000001";
const MODEL_NUMBER: &[u8; 12] = b"KAFFI       ";
/// Packed-BCD software version.
const SOFTWARE_VERSION: [u8; 2] = [0x03, 0x00];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Inactive,
    Disabled,
    Enabled,
    SessionIdle,
    Vend,
    SessionEnding,
}

impl std::fmt::Display for State {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            State::Inactive => "inactive",
            State::Disabled => "disabled",
            State::Enabled => "enabled",
            State::SessionIdle => "session_idle",
            State::Vend => "vend",
            State::SessionEnding => "session_ending",
        };
        f.write_str(name)
    }
}

/// MDB cashless peripheral, level 1.
#[derive(Debug)]
pub struct MdbStm {
    state: State,
    send_reset: bool,
    cancel_countdown: u32,
    maxmin_data: Option<Vec<u8>>,
    slot: Arc<DispenseSlot>,
}

impl MdbStm {
    pub fn new(slot: Arc<DispenseSlot>) -> Self {
        Self {
            state: State::Inactive,
            send_reset: true,
            cancel_countdown: 0,
            maxmin_data: None,
            slot,
        }
    }

    pub fn state(&self) -> State {
        self.state
    }

    pub fn slot(&self) -> Arc<DispenseSlot> {
        Arc::clone(&self.slot)
    }

    /// Handle one inbound frame and return the reply payload, always
    /// prefixed with the MDB acknowledge byte.
    pub fn received_data(&mut self, data: &[u8]) -> Vec<u8> {
        let data = match data.first() {
            Some(&codes::ACK) => &data[1..],
            _ => {
                log::warn!("frame does not start with ACK: {}", HEXLOWER.encode(data));
                data
            }
        };

        let cmd = Command::parse(data);
        if cmd == Command::Poll {
            log::debug!("got message {}", HEXLOWER.encode(data));
        } else {
            log::info!("got message {}", HEXLOWER.encode(data));
        }

        let reply = match self.state {
            State::Inactive => self.on_inactive(cmd),
            State::Disabled => self.on_disabled(cmd),
            State::Enabled => self.on_enabled(cmd),
            State::SessionIdle => self.on_session_idle(cmd),
            State::Vend => self.on_vend(cmd),
            State::SessionEnding => self.on_session_ending(cmd),
        };

        let mut out = Vec::with_capacity(reply.len() + 1);
        out.push(codes::ACK);
        out.extend_from_slice(&reply);
        if out.len() > 1 {
            log::info!("sending message {}", HEXLOWER.encode(&out));
        } else {
            log::debug!("sending message {}", HEXLOWER.encode(&out));
        }
        out
    }

    /// Link layer saw a NAK: resynchronise. Any held slot is released, all
    /// transient fields cleared, and the next POLL will report a reset.
    pub fn received_nack(&mut self) {
        log::error!("received NAK in state {}, resetting", self.state);
        self.slot.release_if_held();
        self.maxmin_data = None;
        self.cancel_countdown = 0;
        self.set_state(State::Inactive);
    }

    fn set_state(&mut self, next: State) {
        log::info!("transitioning from {} to {}", self.state, next);
        // entry hooks
        match next {
            State::Inactive => self.send_reset = true,
            State::SessionEnding => self.cancel_countdown = CANCEL_COUNTDOWN_POLLS,
            _ => {}
        }
        self.state = next;
    }

    fn on_inactive(&mut self, cmd: Command<'_>) -> Vec<u8> {
        match cmd {
            Command::Poll => {
                if self.send_reset {
                    self.send_reset = false;
                    codes::RES_RESET.to_vec()
                } else {
                    Vec::new()
                }
            }
            Command::ReaderEnable => {
                self.set_state(State::Enabled);
                Vec::new()
            }
            // re-enter so the entry hook rearms send_reset
            Command::Reset => {
                self.set_state(State::Inactive);
                Vec::new()
            }
            other => self.default_handler(other),
        }
    }

    fn on_disabled(&mut self, cmd: Command<'_>) -> Vec<u8> {
        match cmd {
            Command::Poll => Vec::new(),
            Command::Reset => {
                self.set_state(State::Inactive);
                codes::RES_RESET.to_vec()
            }
            Command::ReaderEnable => {
                self.set_state(State::Enabled);
                Vec::new()
            }
            other => self.default_handler(other),
        }
    }

    fn on_enabled(&mut self, cmd: Command<'_>) -> Vec<u8> {
        match cmd {
            Command::Poll => {
                if self.slot.is_armed() {
                    self.set_state(State::SessionIdle);
                    vec![codes::RES_BEGIN_SESSION, 0xFF, 0xFF]
                } else {
                    Vec::new()
                }
            }
            Command::ReaderDisable => {
                self.set_state(State::Disabled);
                Vec::new()
            }
            // must be answered, but does not affect us
            Command::ReaderCancel => vec![codes::RES_CANCELLED],
            Command::Reset => {
                self.set_state(State::Inactive);
                codes::RES_RESET.to_vec()
            }
            Command::SetupConfigData(_) => {
                // Some machines flood config data after a dispense; answering
                // malfunction makes them issue a reset and recover.
                log::warn!("got setup config data in enabled state, sending malfunction");
                vec![codes::RES_MALFUNCTION]
            }
            other => self.default_handler(other),
        }
    }

    fn on_session_idle(&mut self, cmd: Command<'_>) -> Vec<u8> {
        match cmd {
            Command::Poll => {
                if self.slot.is_armed() {
                    Vec::new()
                } else {
                    // authorization withdrawn, cancel the session
                    self.set_state(State::SessionEnding);
                    vec![codes::RES_SESSION_CANCEL_REQUEST]
                }
            }
            Command::VendRequest(item) => {
                log::info!("vend request item data: {}", HEXLOWER.encode(item));
                if self.slot.try_hold() {
                    // hold persists across frames until the vend settles
                    self.set_state(State::Vend);
                    vec![codes::RES_VEND_APPROVED, 0xFF, 0xFF]
                } else {
                    log::info!("authorization expired before vend request");
                    self.set_state(State::SessionEnding);
                    vec![codes::RES_VEND_DENIED]
                }
            }
            Command::VendCancel => {
                log::warn!("got vend cancel before any vend request");
                vec![codes::RES_VEND_DENIED]
            }
            Command::VendSessionComplete => {
                self.set_state(State::Enabled);
                vec![codes::RES_END_SESSION]
            }
            Command::ReaderCancel => {
                log::warn!("got reader cancel in session");
                self.set_state(State::Enabled);
                vec![codes::RES_CANCELLED]
            }
            Command::Reset => {
                self.set_state(State::Inactive);
                codes::RES_RESET.to_vec()
            }
            other => self.out_of_sequence(other),
        }
    }

    fn on_vend(&mut self, cmd: Command<'_>) -> Vec<u8> {
        match cmd {
            Command::Poll => Vec::new(),
            Command::VendSuccess(item) => {
                log::info!("vend success item data: {}", HEXLOWER.encode(item));
                self.slot.settle(Some(item.to_vec()));
                self.set_state(State::SessionEnding);
                Vec::new()
            }
            Command::VendFailure => {
                log::warn!("got vend failure");
                self.slot.settle(None);
                self.set_state(State::SessionEnding);
                Vec::new()
            }
            Command::VendCancel => {
                log::warn!("got vend cancel during vend");
                self.slot.settle(None);
                self.set_state(State::SessionEnding);
                vec![codes::RES_VEND_DENIED]
            }
            Command::Reset => {
                log::warn!("got reset during vend");
                self.slot.settle(None);
                self.set_state(State::Inactive);
                codes::RES_RESET.to_vec()
            }
            // keep the hold; the machine is expected to reset next
            other => self.out_of_sequence(other),
        }
    }

    fn on_session_ending(&mut self, cmd: Command<'_>) -> Vec<u8> {
        match cmd {
            Command::Poll => {
                if self.cancel_countdown > 0 {
                    self.cancel_countdown -= 1;
                    Vec::new()
                } else {
                    vec![codes::RES_SESSION_CANCEL_REQUEST]
                }
            }
            Command::VendSessionComplete => {
                self.set_state(State::Enabled);
                vec![codes::RES_END_SESSION]
            }
            Command::VendRequest(_) => vec![codes::RES_VEND_DENIED],
            Command::VendCancel => {
                log::warn!("got vend cancel while ending session");
                vec![codes::RES_VEND_DENIED]
            }
            Command::ReaderCancel => {
                log::warn!("got reader cancel while ending session");
                self.set_state(State::Enabled);
                vec![codes::RES_CANCELLED]
            }
            Command::VendSuccess(_) => {
                log::error!("got vend success while ending session");
                Vec::new()
            }
            Command::Reset => {
                self.set_state(State::Inactive);
                codes::RES_RESET.to_vec()
            }
            other => self.out_of_sequence(other),
        }
    }

    /// Commands every state answers the same way.
    fn default_handler(&mut self, cmd: Command<'_>) -> Vec<u8> {
        match cmd {
            Command::SetupConfigData(_) => READER_CONFIG.to_vec(),
            Command::SetupMaxMinPrice(data) => {
                self.maxmin_data = Some(data.to_vec());
                Vec::new()
            }
            Command::ExpansionRequestId => {
                let mut reply = vec![codes::RES_PERIPHERAL_ID];
                reply.extend_from_slice(MANUFACTURER_CODE);
                reply.extend_from_slice(SERIAL_NUMBER);
                reply.extend_from_slice(MODEL_NUMBER);
                reply.extend_from_slice(&SOFTWARE_VERSION);
                reply
            }
            other => self.out_of_sequence(other),
        }
    }

    fn out_of_sequence(&mut self, cmd: Command<'_>) -> Vec<u8> {
        log::error!("out-of-sequence command {cmd:?} in state {}", self.state);
        vec![codes::RES_MALFUNCTION]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Duration;

    const POLL: &[u8] = &[0x00, 0x12];
    const RESET: &[u8] = &[0x00, 0x10];

    fn stm_in(state: State) -> MdbStm {
        let mut stm = MdbStm::new(Arc::new(DispenseSlot::new()));
        stm.state = state;
        stm.send_reset = false;
        stm
    }

    /// Arm the slot from a background thread the way the coordinator does,
    /// and hand back the join handle for the outcome.
    fn arm(stm: &MdbStm) -> thread::JoinHandle<(bool, Option<Vec<u8>>)> {
        let slot = stm.slot();
        let armed = stm.slot();
        let handle = thread::spawn(move || slot.arm_and_wait(Duration::from_secs(2)));
        while !armed.is_armed() {
            thread::sleep(Duration::from_millis(1));
        }
        handle
    }

    #[test]
    fn inactive_reports_reset_exactly_once() {
        let mut stm = MdbStm::new(Arc::new(DispenseSlot::new()));
        assert_eq!(stm.received_data(POLL), vec![0x00, 0x00, 0x00]);
        assert_eq!(stm.received_data(POLL), vec![0x00]);
        // an explicit reset rearms the flag
        assert_eq!(stm.received_data(RESET), vec![0x00]);
        assert_eq!(stm.received_data(POLL), vec![0x00, 0x00, 0x00]);
    }

    #[test]
    fn enable_then_idle_poll_stays_enabled() {
        let mut stm = stm_in(State::Inactive);
        stm.received_data(&[0x00, 0x14, 0x01]);
        assert_eq!(stm.state(), State::Enabled);
        assert_eq!(stm.received_data(POLL), vec![0x00]);
        assert_eq!(stm.state(), State::Enabled);
    }

    #[test]
    fn armed_poll_begins_session() {
        let mut stm = stm_in(State::Enabled);
        let waiter = arm(&stm);
        assert_eq!(stm.received_data(POLL), vec![0x00, 0x03, 0xFF, 0xFF]);
        assert_eq!(stm.state(), State::SessionIdle);
        // settle so the waiter thread finishes
        assert!(stm.slot.try_hold());
        stm.slot.settle(None);
        waiter.join().unwrap();
    }

    #[test]
    fn full_dispense_polled_close() {
        let mut stm = stm_in(State::Enabled);
        let waiter = arm(&stm);

        assert_eq!(stm.received_data(POLL), vec![0x00, 0x03, 0xFF, 0xFF]);
        assert_eq!(
            stm.received_data(&[0x00, 0x13, 0x00, 0x00, 0x01]),
            vec![0x00, 0x05, 0xFF, 0xFF]
        );
        assert_eq!(stm.state(), State::Vend);
        assert_eq!(stm.received_data(&[0x00, 0x13, 0x02, 0x00, 0x01]), vec![0x00]);
        assert_eq!(stm.state(), State::SessionEnding);

        let (dispensed, item) = waiter.join().unwrap();
        assert!(dispensed);
        assert_eq!(item, Some(vec![0x00, 0x01]));

        // countdown absorbs the first polls, then the session is cancelled
        for _ in 0..CANCEL_COUNTDOWN_POLLS {
            assert_eq!(stm.received_data(POLL), vec![0x00]);
        }
        assert_eq!(stm.received_data(POLL), vec![0x00, 0x04]);
        assert_eq!(stm.received_data(&[0x00, 0x13, 0x04]), vec![0x00, 0x07]);
        assert_eq!(stm.state(), State::Enabled);
    }

    #[test]
    fn vend_failure_settles_not_dispensed() {
        let mut stm = stm_in(State::Enabled);
        let waiter = arm(&stm);

        stm.received_data(POLL);
        stm.received_data(&[0x00, 0x13, 0x00, 0x00, 0x01]);
        assert_eq!(stm.received_data(&[0x00, 0x13, 0x03]), vec![0x00]);
        assert_eq!(stm.state(), State::SessionEnding);

        let (dispensed, item) = waiter.join().unwrap();
        assert!(!dispensed);
        assert!(item.is_none());
    }

    #[test]
    fn vend_request_without_authorization_is_denied() {
        let mut stm = stm_in(State::SessionIdle);
        let reply = stm.received_data(&[0x00, 0x13, 0x00, 0x00, 0x01]);
        assert_eq!(reply, vec![0x00, 0x06]);
        assert_eq!(stm.state(), State::SessionEnding);
    }

    #[test]
    fn session_idle_poll_cancels_after_timeout() {
        // coordinator armed, then timed out before the machine polled
        let mut stm = stm_in(State::SessionIdle);
        assert_eq!(stm.received_data(POLL), vec![0x00, 0x04]);
        assert_eq!(stm.state(), State::SessionEnding);
    }

    #[test]
    fn nack_during_vend_releases_and_resets() {
        let mut stm = stm_in(State::Enabled);
        let waiter = arm(&stm);

        stm.received_data(POLL);
        stm.received_data(&[0x00, 0x13, 0x00, 0x00, 0x01]);
        assert_eq!(stm.state(), State::Vend);

        stm.received_nack();
        assert_eq!(stm.state(), State::Inactive);
        let (dispensed, _) = waiter.join().unwrap();
        assert!(!dispensed);

        // next poll reports the reset
        assert_eq!(stm.received_data(POLL), vec![0x00, 0x00, 0x00]);
    }

    #[test]
    fn reset_during_vend_releases_hold() {
        let mut stm = stm_in(State::Enabled);
        let waiter = arm(&stm);

        stm.received_data(POLL);
        stm.received_data(&[0x00, 0x13, 0x00, 0x00, 0x01]);
        assert_eq!(stm.received_data(RESET), vec![0x00, 0x00, 0x00]);
        assert_eq!(stm.state(), State::Inactive);
        let (dispensed, _) = waiter.join().unwrap();
        assert!(!dispensed);
    }

    #[test]
    fn config_data_in_enabled_is_malfunction() {
        let mut stm = stm_in(State::Enabled);
        let reply = stm.received_data(&[0x00, 0x11, 0x00, 0x03, 0x00, 0x00, 0x00]);
        assert_eq!(reply, vec![0x00, 0x0A]);
        assert_eq!(stm.state(), State::Enabled);
    }

    #[test]
    fn config_data_in_inactive_returns_reader_config() {
        let mut stm = stm_in(State::Inactive);
        let reply = stm.received_data(&[0x00, 0x11, 0x00, 0x03, 0x00, 0x00, 0x00]);
        assert_eq!(reply, vec![0x00, 0x01, 0x01, 0x00, 0x01, 0x01, 0x02, 0x01, 0x00]);
    }

    #[test]
    fn maxmin_price_is_stored() {
        let mut stm = stm_in(State::Inactive);
        let reply = stm.received_data(&[0x00, 0x11, 0x01, 0xFF, 0xFF, 0x00, 0x00]);
        assert_eq!(reply, vec![0x00]);
        assert_eq!(stm.maxmin_data, Some(vec![0xFF, 0xFF, 0x00, 0x00]));
    }

    #[test]
    fn peripheral_id_reply_shape() {
        let mut stm = stm_in(State::Disabled);
        let reply = stm.received_data(&[0x00, 0x17, 0x00]);
        // ACK + response code + 3 + 12 + 12 + 2
        assert_eq!(reply.len(), 31);
        assert_eq!(reply[1], 0x09);
        assert_eq!(&reply[2..5], b"KFI");
    }

    #[test]
    fn offset_header_is_accepted() {
        let mut stm = stm_in(State::Enabled);
        // POLL with the alternate address offset
        assert_eq!(stm.received_data(&[0x00, 0x62]), vec![0x00]);
    }

    #[test]
    fn unknown_command_is_malfunction() {
        let mut stm = stm_in(State::Enabled);
        assert_eq!(stm.received_data(&[0x00, 0x42]), vec![0x00, 0x0A]);
    }

    #[test]
    fn vend_success_while_ending_is_ignored() {
        let mut stm = stm_in(State::SessionEnding);
        assert_eq!(stm.received_data(&[0x00, 0x13, 0x02, 0x00, 0x01]), vec![0x00]);
        assert_eq!(stm.state(), State::SessionEnding);
    }
}
