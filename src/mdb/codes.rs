//! MDB level-1 cashless command and response codes.
//!
//! Command headers occupy 0x10..=0x17; the VMC addresses the second cashless
//! slot by offsetting the header byte by 0x50, so matching folds that offset
//! away before comparing. Subcommand bytes are matched exactly.

/// MDB-level acknowledge. Prefixed to every reply payload and stripped from
/// inbound payloads before dispatch.
pub const ACK: u8 = 0x00;

/// Header offset used by the VMC for the alternate cashless address.
pub const HEADER_OFFSET: u8 = 0x50;

pub const CMD_RESET: u8 = 0x10;
pub const CMD_SETUP: u8 = 0x11;
pub const CMD_POLL: u8 = 0x12;
pub const CMD_VEND: u8 = 0x13;
pub const CMD_READER: u8 = 0x14;
pub const CMD_EXPANSION: u8 = 0x17;

pub const SETUP_CONFIG_DATA: u8 = 0x00;
pub const SETUP_MAXMIN_PRICE: u8 = 0x01;

pub const VEND_REQUEST: u8 = 0x00;
pub const VEND_CANCEL: u8 = 0x01;
pub const VEND_SUCCESS: u8 = 0x02;
pub const VEND_FAILURE: u8 = 0x03;
pub const VEND_SESSION_COMPLETE: u8 = 0x04;

pub const READER_DISABLE: u8 = 0x00;
pub const READER_ENABLE: u8 = 0x01;
pub const READER_CANCEL: u8 = 0x02;

pub const EXPANSION_REQUEST_ID: u8 = 0x00;

/// "Just reset" poll reply, two bytes.
pub const RES_RESET: [u8; 2] = [0x00, 0x00];
pub const RES_READER_CONFIG_DATA: u8 = 0x01;
pub const RES_BEGIN_SESSION: u8 = 0x03;
pub const RES_SESSION_CANCEL_REQUEST: u8 = 0x04;
pub const RES_VEND_APPROVED: u8 = 0x05;
pub const RES_VEND_DENIED: u8 = 0x06;
pub const RES_END_SESSION: u8 = 0x07;
pub const RES_CANCELLED: u8 = 0x08;
pub const RES_PERIPHERAL_ID: u8 = 0x09;
pub const RES_MALFUNCTION: u8 = 0x0A;

/// A parsed inbound command. Payload slices borrow from the frame and carry
/// whatever bytes followed the subcommand.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command<'a> {
    Reset,
    SetupConfigData(&'a [u8]),
    SetupMaxMinPrice(&'a [u8]),
    Poll,
    VendRequest(&'a [u8]),
    VendCancel,
    VendSuccess(&'a [u8]),
    VendFailure,
    VendSessionComplete,
    ReaderDisable,
    ReaderEnable,
    ReaderCancel,
    ExpansionRequestId,
    Unknown(&'a [u8]),
}

impl<'a> Command<'a> {
    pub fn parse(data: &'a [u8]) -> Self {
        let Some(&header) = data.first() else {
            return Command::Unknown(data);
        };
        let header = if header >= HEADER_OFFSET {
            header - HEADER_OFFSET
        } else {
            header
        };
        let sub = data.get(1).copied();
        let payload = if data.len() > 2 { &data[2..] } else { &[][..] };

        match (header, sub) {
            (CMD_RESET, _) => Command::Reset,
            (CMD_POLL, _) => Command::Poll,
            (CMD_SETUP, Some(SETUP_CONFIG_DATA)) => Command::SetupConfigData(payload),
            (CMD_SETUP, Some(SETUP_MAXMIN_PRICE)) => Command::SetupMaxMinPrice(payload),
            (CMD_VEND, Some(VEND_REQUEST)) => Command::VendRequest(payload),
            (CMD_VEND, Some(VEND_CANCEL)) => Command::VendCancel,
            (CMD_VEND, Some(VEND_SUCCESS)) => Command::VendSuccess(payload),
            (CMD_VEND, Some(VEND_FAILURE)) => Command::VendFailure,
            (CMD_VEND, Some(VEND_SESSION_COMPLETE)) => Command::VendSessionComplete,
            (CMD_READER, Some(READER_DISABLE)) => Command::ReaderDisable,
            (CMD_READER, Some(READER_ENABLE)) => Command::ReaderEnable,
            (CMD_READER, Some(READER_CANCEL)) => Command::ReaderCancel,
            (CMD_EXPANSION, Some(EXPANSION_REQUEST_ID)) => Command::ExpansionRequestId,
            _ => Command::Unknown(data),
        }
    }
}
