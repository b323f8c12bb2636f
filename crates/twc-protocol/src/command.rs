use types::{CentiAmps, TwcId};

/// Outbound bodies are zero padded to this length before the checksum.
pub const PADDED_BODY_LEN: usize = 15;

/// Heartbeat command byte telling a protocol 1 secondary to charge at the offered rate.
pub const HEARTBEAT_CHARGE_V1: u8 = 0x05;
/// Heartbeat command byte telling a protocol 2 secondary to charge at the offered rate.
pub const HEARTBEAT_CHARGE_V2: u8 = 0x09;

/// Command byte carried in a charge-rate message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateCommand {
    /// Limit to the given rate (used with zero amps to idle a charger).
    Limit,
    /// Change the charge rate.
    Set,
}

impl RateCommand {
    pub fn code(self) -> u8 {
        match self {
            RateCommand::Limit => 0x05,
            RateCommand::Set => 0x09,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollKind {
    VinStart,
    VinMiddle,
    VinEnd,
    Stats,
    PlugState,
}

impl PollKind {
    fn prefix(self) -> [u8; 2] {
        match self {
            PollKind::VinStart => [0xFB, 0xEE],
            PollKind::VinMiddle => [0xFB, 0xEF],
            PollKind::VinEnd => [0xFB, 0xF1],
            PollKind::Stats => [0xFB, 0xEB],
            PollKind::PlugState => [0xFB, 0xB4],
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            PollKind::VinStart => "vin_start",
            PollKind::VinMiddle => "vin_middle",
            PollKind::VinEnd => "vin_end",
            PollKind::Stats => "stats",
            PollKind::PlugState => "plug_state",
        }
    }
}

/// Messages the primary sends onto the link.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    LinkReady1 {
        primary: TwcId,
        signature: u8,
    },
    LinkReady2 {
        primary: TwcId,
        signature: u8,
    },
    Heartbeat {
        primary: TwcId,
        secondary: TwcId,
        data: [u8; 9],
    },
    ChargeRate {
        primary: TwcId,
        secondary: TwcId,
        command: RateCommand,
        amps: CentiAmps,
    },
    Start {
        primary: TwcId,
        secondary: TwcId,
    },
    Stop {
        primary: TwcId,
        secondary: TwcId,
    },
    Poll {
        primary: TwcId,
        secondary: TwcId,
        kind: PollKind,
    },
}

impl Command {
    /// Message body, padded, without checksum or framing.
    pub fn body(&self) -> Vec<u8> {
        let mut msg = Vec::with_capacity(PADDED_BODY_LEN);
        match self {
            Command::LinkReady1 { primary, signature } => {
                msg.extend_from_slice(&[0xFC, 0xE1]);
                msg.extend_from_slice(primary.as_bytes());
                msg.push(*signature);
            }
            Command::LinkReady2 { primary, signature } => {
                msg.extend_from_slice(&[0xFB, 0xE2]);
                msg.extend_from_slice(primary.as_bytes());
                msg.push(*signature);
            }
            Command::Heartbeat {
                primary,
                secondary,
                data,
            } => {
                msg.extend_from_slice(&[0xFB, 0xE0]);
                msg.extend_from_slice(primary.as_bytes());
                msg.extend_from_slice(secondary.as_bytes());
                msg.extend_from_slice(data);
            }
            Command::ChargeRate {
                primary,
                secondary,
                command,
                amps,
            } => {
                msg.extend_from_slice(&[0xFB, 0xE0]);
                msg.extend_from_slice(primary.as_bytes());
                msg.extend_from_slice(secondary.as_bytes());
                msg.push(command.code());
                msg.extend_from_slice(&amps.to_be_bytes());
            }
            Command::Start { primary, secondary } => {
                msg.extend_from_slice(&[0xFC, 0xB1]);
                msg.extend_from_slice(primary.as_bytes());
                msg.extend_from_slice(secondary.as_bytes());
            }
            Command::Stop { primary, secondary } => {
                msg.extend_from_slice(&[0xFC, 0xB2]);
                msg.extend_from_slice(primary.as_bytes());
                msg.extend_from_slice(secondary.as_bytes());
            }
            Command::Poll {
                primary,
                secondary,
                kind,
            } => {
                msg.extend_from_slice(&kind.prefix());
                msg.extend_from_slice(primary.as_bytes());
                msg.extend_from_slice(secondary.as_bytes());
            }
        }
        if msg.len() < PADDED_BODY_LEN {
            msg.resize(PADDED_BODY_LEN, 0x00);
        }
        msg
    }

    pub fn name(&self) -> &'static str {
        match self {
            Command::LinkReady1 { .. } => "link_ready_1",
            Command::LinkReady2 { .. } => "link_ready_2",
            Command::Heartbeat { .. } => "heartbeat",
            Command::ChargeRate { .. } => "charge_rate",
            Command::Start { .. } => "start",
            Command::Stop { .. } => "stop",
            Command::Poll { .. } => "poll",
        }
    }
}

/// Heartbeat payload offering `amps` to a secondary.
///
/// A zero offer sends an all-zero payload, which secondaries treat as "no
/// change requested".
pub fn heartbeat_data(amps: CentiAmps, protocol_version: u8) -> [u8; 9] {
    let mut data = [0u8; 9];
    if amps.is_zero() {
        return data;
    }
    data[0] = if protocol_version >= 2 {
        HEARTBEAT_CHARGE_V2
    } else {
        HEARTBEAT_CHARGE_V1
    };
    data[1..3].copy_from_slice(&amps.to_be_bytes());
    data
}

#[cfg(test)]
mod tests {
    use super::*;

    const PRIMARY: TwcId = TwcId::new(0x77, 0x77);
    const SECONDARY: TwcId = TwcId::new(0x12, 0x34);

    #[test]
    fn link_ready_is_padded_to_fifteen_bytes() {
        let body = Command::LinkReady1 {
            primary: PRIMARY,
            signature: 0x77,
        }
        .body();
        assert_eq!(body.len(), PADDED_BODY_LEN);
        assert_eq!(&body[..5], &[0xFC, 0xE1, 0x77, 0x77, 0x77]);
        assert!(body[5..].iter().all(|b| *b == 0));
    }

    #[test]
    fn charge_rate_is_big_endian_centiamps() {
        let body = Command::ChargeRate {
            primary: PRIMARY,
            secondary: SECONDARY,
            command: RateCommand::Set,
            amps: CentiAmps::from_amps(6),
        }
        .body();
        assert_eq!(&body[..9], &[0xFB, 0xE0, 0x77, 0x77, 0x12, 0x34, 0x09, 0x02, 0x58]);
    }

    #[test]
    fn heartbeat_data_selects_command_by_protocol() {
        assert_eq!(heartbeat_data(CentiAmps::ZERO, 2), [0u8; 9]);
        let v1 = heartbeat_data(CentiAmps::from_amps(16), 1);
        assert_eq!(&v1[..3], &[0x05, 0x06, 0x40]);
        let v2 = heartbeat_data(CentiAmps::from_amps(16), 2);
        assert_eq!(v2[0], 0x09);
    }
}
