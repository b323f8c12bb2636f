use types::{CentiAmps, PlugState, TwcId};

const READY_TO_LINK: [u8; 2] = [0xFD, 0xE2];
const SECONDARY_HEARTBEAT: [u8; 2] = [0xFD, 0xE0];
const PERIODIC_POLL_DATA: [u8; 2] = [0xFD, 0xEB];
const VIN_START: [u8; 2] = [0xFD, 0xEE];
const VIN_MIDDLE: [u8; 2] = [0xFD, 0xEF];
const VIN_END: [u8; 2] = [0xFD, 0xF1];
const PLUG_STATE: [u8; 2] = [0xFD, 0xB4];
const PRIMARY_LINK_READY_1: [u8; 2] = [0xFC, 0xE1];
const PRIMARY_LINK_READY_2: [u8; 2] = [0xFC, 0xE2];

/// A secondary announcing itself and its hardware current limit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadyToLink {
    pub twc_id: TwcId,
    pub signature: u8,
    pub max_amps: CentiAmps,
    /// Decoded length including the checksum byte; 14 means protocol 1, 16 protocol 2.
    pub frame_len: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SecondaryHeartbeat {
    pub twc_id: TwcId,
    pub primary_id: TwcId,
    pub state: u8,
    pub amps_max: CentiAmps,
    pub amps_actual: CentiAmps,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PollData {
    pub twc_id: TwcId,
    pub kwh: u32,
    pub phase_volts: [u16; 3],
    /// Whole amps per phase (the wire carries double the value).
    pub phase_amps: [u8; 3],
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VinFragment {
    pub twc_id: TwcId,
    /// `None` when the secondary reported an all-zero fragment.
    pub text: Option<String>,
}

/// One inbound message, classified by its leading bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    ReadyToLink(ReadyToLink),
    SecondaryHeartbeat(SecondaryHeartbeat),
    PeriodicPollData(PollData),
    VinStart(VinFragment),
    VinMiddle(VinFragment),
    VinEnd(VinFragment),
    PlugState { twc_id: TwcId, plug_state: PlugState },
    PrimaryAnnounce { twc_id: TwcId },
}

impl Message {
    /// Classify a decoded body (checksum already stripped).
    ///
    /// Kinds are tried in a fixed priority order and the first match wins;
    /// `None` means the body matched no known shape.
    pub fn parse(body: &[u8]) -> Option<Message> {
        parse_ready_to_link(body)
            .or_else(|| parse_secondary_heartbeat(body))
            .or_else(|| parse_poll_data(body))
            .or_else(|| parse_vin(body, VIN_START, 7).map(Message::VinStart))
            .or_else(|| parse_vin(body, VIN_MIDDLE, 7).map(Message::VinMiddle))
            .or_else(|| parse_vin(body, VIN_END, 3).map(Message::VinEnd))
            .or_else(|| parse_plug_state(body))
            .or_else(|| parse_primary_announce(body))
    }

    pub fn twc_id(&self) -> TwcId {
        match self {
            Message::ReadyToLink(msg) => msg.twc_id,
            Message::SecondaryHeartbeat(msg) => msg.twc_id,
            Message::PeriodicPollData(msg) => msg.twc_id,
            Message::VinStart(msg) | Message::VinMiddle(msg) | Message::VinEnd(msg) => msg.twc_id,
            Message::PlugState { twc_id, .. } | Message::PrimaryAnnounce { twc_id } => *twc_id,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Message::ReadyToLink(_) => "ready_to_link",
            Message::SecondaryHeartbeat(_) => "secondary_heartbeat",
            Message::PeriodicPollData(_) => "periodic_poll_data",
            Message::VinStart(_) => "vin_start",
            Message::VinMiddle(_) => "vin_middle",
            Message::VinEnd(_) => "vin_end",
            Message::PlugState { .. } => "plug_state",
            Message::PrimaryAnnounce { .. } => "primary_announce",
        }
    }
}

fn has_prefix(body: &[u8], prefix: [u8; 2], min_len: usize) -> bool {
    body.len() >= min_len && body[..2] == prefix
}

fn twc_id_at(body: &[u8], offset: usize) -> TwcId {
    TwcId([body[offset], body[offset + 1]])
}

fn amps_at(body: &[u8], offset: usize) -> CentiAmps {
    CentiAmps::from_be_bytes([body[offset], body[offset + 1]])
}

fn parse_ready_to_link(body: &[u8]) -> Option<Message> {
    // FD E2 | id(2) | signature | max amps(2) | six zero bytes | ...
    if !has_prefix(body, READY_TO_LINK, 13) || body[7..13].iter().any(|b| *b != 0) {
        return None;
    }
    Some(Message::ReadyToLink(ReadyToLink {
        twc_id: twc_id_at(body, 2),
        signature: body[4],
        max_amps: amps_at(body, 5),
        frame_len: body.len() + 1,
    }))
}

fn parse_secondary_heartbeat(body: &[u8]) -> Option<Message> {
    // FD E0 | id(2) | primary id(2) | state | amps max(2) | amps actual(2) | ...
    if !has_prefix(body, SECONDARY_HEARTBEAT, 13) {
        return None;
    }
    Some(Message::SecondaryHeartbeat(SecondaryHeartbeat {
        twc_id: twc_id_at(body, 2),
        primary_id: twc_id_at(body, 4),
        state: body[6],
        amps_max: amps_at(body, 7),
        amps_actual: amps_at(body, 9),
    }))
}

fn parse_poll_data(body: &[u8]) -> Option<Message> {
    // FD EB | id(2) | kWh(4) | volts(2) x3 | amps x2 (1) x3 | ...
    if !has_prefix(body, PERIODIC_POLL_DATA, 18) {
        return None;
    }
    let volts = |offset: usize| u16::from_be_bytes([body[offset], body[offset + 1]]);
    Some(Message::PeriodicPollData(PollData {
        twc_id: twc_id_at(body, 2),
        kwh: u32::from_be_bytes([body[4], body[5], body[6], body[7]]),
        phase_volts: [volts(8), volts(10), volts(12)],
        phase_amps: [body[14] / 2, body[15] / 2, body[16] / 2],
    }))
}

fn parse_vin(body: &[u8], prefix: [u8; 2], fragment_len: usize) -> Option<VinFragment> {
    if !has_prefix(body, prefix, 4 + fragment_len) {
        return None;
    }
    let fragment = &body[4..4 + fragment_len];
    let text = if fragment.iter().all(|b| *b == 0) {
        None
    } else {
        Some(String::from_utf8_lossy(fragment).into_owned())
    };
    Some(VinFragment {
        twc_id: twc_id_at(body, 2),
        text,
    })
}

fn parse_plug_state(body: &[u8]) -> Option<Message> {
    if !has_prefix(body, PLUG_STATE, 5) {
        return None;
    }
    Some(Message::PlugState {
        twc_id: twc_id_at(body, 2),
        plug_state: PlugState::from_code(body[4]),
    })
}

fn parse_primary_announce(body: &[u8]) -> Option<Message> {
    // FC E1/E2 | id(2) | signature | eight zero bytes | ...
    let is_link_ready = has_prefix(body, PRIMARY_LINK_READY_1, 13)
        || has_prefix(body, PRIMARY_LINK_READY_2, 13);
    if !is_link_ready || body[5..13].iter().any(|b| *b != 0) {
        return None;
    }
    Some(Message::PrimaryAnnounce {
        twc_id: twc_id_at(body, 2),
    })
}
