use crate::Descriptor;

/// Consecutive "not found" replies tolerated before a room counts as expired.
/// Serverless stores can miss a freshly written key for a moment.
pub const NOT_FOUND_THRESHOLD: u32 = 3;

/// Result of one answer poll, as seen by the initiator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollOutcome {
    Waiting,
    Answer(Descriptor),
    NotFound,
    /// Request never produced a protocol answer (network, 5xx).
    Transient,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollVerdict {
    KeepPolling,
    Answered(Descriptor),
    Expired,
}

#[derive(Debug, Clone)]
pub struct PollTracker {
    not_found_streak: u32,
    threshold: u32,
}

impl Default for PollTracker {
    fn default() -> Self {
        Self::new(NOT_FOUND_THRESHOLD)
    }
}

impl PollTracker {
    pub fn new(threshold: u32) -> Self {
        Self {
            not_found_streak: 0,
            threshold: threshold.max(1),
        }
    }

    pub fn not_found_streak(&self) -> u32 {
        self.not_found_streak
    }

    pub fn observe(&mut self, outcome: PollOutcome) -> PollVerdict {
        match outcome {
            PollOutcome::Waiting => {
                self.not_found_streak = 0;
                PollVerdict::KeepPolling
            }
            PollOutcome::Answer(answer) => {
                self.not_found_streak = 0;
                PollVerdict::Answered(answer)
            }
            PollOutcome::NotFound => {
                self.not_found_streak += 1;
                if self.not_found_streak >= self.threshold {
                    PollVerdict::Expired
                } else {
                    PollVerdict::KeepPolling
                }
            }
            // neither evidence of the room existing nor of it being gone
            PollOutcome::Transient => PollVerdict::KeepPolling,
        }
    }
}
