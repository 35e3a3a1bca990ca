use serde::{Deserialize, Serialize};

use crate::{CoreError, Descriptor, RoomCode};

/// Key namespace for signaling records in a shared store.
pub const KEY_PREFIX: &str = "signal:";

pub fn record_key(code: &RoomCode) -> String {
    format!("{KEY_PREFIX}{code}")
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignalRecord {
    pub offer: Descriptor,
    #[serde(default)]
    pub answer: Option<Descriptor>,
    pub created: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnswerWrite {
    Stored,
    /// Same answer submitted again; nothing changed.
    Unchanged,
}

impl SignalRecord {
    pub fn new(offer: Descriptor, created: u64) -> Self {
        Self {
            offer,
            answer: None,
            created,
        }
    }

    /// Single-assignment of the responder's descriptor. A different second
    /// answer is rejected and the stored one is kept.
    pub fn record_answer(&mut self, answer: Descriptor) -> Result<AnswerWrite, CoreError> {
        match &self.answer {
            None => {
                self.answer = Some(answer);
                Ok(AnswerWrite::Stored)
            }
            Some(existing) if *existing == answer => Ok(AnswerWrite::Unchanged),
            Some(_) => Err(CoreError::AlreadyAnswered),
        }
    }

    pub fn age_ms(&self, now_ms: u64) -> u64 {
        now_ms.saturating_sub(self.created)
    }
}
