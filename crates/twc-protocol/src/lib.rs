//! Wire format of the wall connector load-sharing bus.
//!
//! Messages travel as `C0 <escaped body + checksum> C0`. [`frame`] handles the
//! byte level, [`message`] classifies what secondaries send us and [`command`]
//! builds what the primary sends.

pub mod command;
pub mod frame;
pub mod message;

pub use command::{heartbeat_data, Command, PollKind, RateCommand, PADDED_BODY_LEN};
pub use frame::{checksum, decode, encode, hex_dump, FrameAccumulator, FrameError};
pub use message::{Message, PollData, ReadyToLink, SecondaryHeartbeat, VinFragment};
