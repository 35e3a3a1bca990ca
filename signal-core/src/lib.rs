//! Shared rendezvous vocabulary for the games connection flow: room codes,
//! descriptors, the stored signaling record, answer polling and the
//! per-participant connection state machine.

pub mod code;
pub mod descriptor;
pub mod message;
pub mod poll;
pub mod record;
pub mod session;

use thiserror::Error;

pub use code::{RoomCode, ALPHABET, CODE_LEN};
pub use descriptor::{Descriptor, MAX_DESCRIPTOR_BYTES};
pub use message::{AppMessage, Seat};
pub use poll::{PollOutcome, PollTracker, PollVerdict, NOT_FOUND_THRESHOLD};
pub use record::{record_key, AnswerWrite, SignalRecord};
pub use session::{Effect, FailureReason, Input, Phase, Rejection, Role, Session, SessionError};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CoreError {
    #[error("room code required")]
    MissingCode,
    #[error("invalid room code: {0}")]
    InvalidCode(String),
    #[error("descriptor required")]
    MissingDescriptor,
    #[error("descriptor too large ({size} bytes, max {max})")]
    DescriptorTooLarge { size: usize, max: usize },
    #[error("room already answered")]
    AlreadyAnswered,
}
