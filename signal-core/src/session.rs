//! Connection establishment as a pure state machine.
//!
//! [`Session::apply`] takes one [`Input`] (a user action, a store reply, a
//! timer, a transport event), moves the phase, and returns the [`Effect`]s
//! the caller has to carry out. Nothing in here performs I/O or keeps time,
//! so every transition can be driven directly from tests.

use rand::Rng;
use thiserror::Error;

use crate::message::{AppMessage, Seat};
use crate::poll::{PollOutcome, PollTracker, PollVerdict};
use crate::{Descriptor, RoomCode};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Initiator,
    Responder,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Phase {
    Idle,
    DescriptorPending,
    Published,
    ExchangeInFlight,
    Negotiating,
    Connected,
    Failed(FailureReason),
    Cancelled,
    Disconnected,
}

impl Phase {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Phase::Failed(_) | Phase::Cancelled | Phase::Disconnected
        )
    }
}

/// Why an attempt ended. The message is what a participant sees before
/// being sent back to choose a role again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum FailureReason {
    #[error("Room not found. Check the code and try again.")]
    RoomNotFound,
    #[error("Room expired. Please start again.")]
    Expired,
    #[error("Connection timed out. Both devices must be online.")]
    Timeout,
    #[error("Too many attempts. Try again later.")]
    RateLimited,
    #[error("No free room codes right now. Try again later.")]
    Capacity,
    #[error("Someone else already joined this room.")]
    RoomTaken,
    #[error("That code or connection data is not valid.")]
    InvalidInput,
    #[error("Signaling service unavailable. Try again later.")]
    Unavailable,
    #[error("Could not set up the connection. Please try again.")]
    ConnectionFailed,
}

/// Terminal store-layer answers, as classified by whoever talks to the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rejection {
    NotFound,
    Conflict,
    RateLimited,
    Capacity,
    InvalidInput,
    Unavailable,
}

impl From<Rejection> for FailureReason {
    fn from(rejection: Rejection) -> Self {
        match rejection {
            Rejection::NotFound => FailureReason::RoomNotFound,
            Rejection::Conflict => FailureReason::RoomTaken,
            Rejection::RateLimited => FailureReason::RateLimited,
            Rejection::Capacity => FailureReason::Capacity,
            Rejection::InvalidInput => FailureReason::InvalidInput,
            Rejection::Unavailable => FailureReason::Unavailable,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Input {
    Host,
    /// Start as responder with a code typed in or taken from a link.
    Join(RoomCode),
    LocalDescriptor(Descriptor),
    LocalDescriptorFailed,
    RoomCreated(RoomCode),
    OfferFetched(Descriptor),
    AnswerSubmitted,
    PollTick,
    Poll(PollOutcome),
    ChannelOpen,
    ChannelClosed,
    NegotiationTimeout,
    /// The link opened but seats could not be settled.
    SeatingFailed(FailureReason),
    Rejected(Rejection),
    Cancel,
}

impl Input {
    pub fn kind(&self) -> &'static str {
        match self {
            Input::Host => "host",
            Input::Join(_) => "join",
            Input::LocalDescriptor(_) => "local-descriptor",
            Input::LocalDescriptorFailed => "local-descriptor-failed",
            Input::RoomCreated(_) => "room-created",
            Input::OfferFetched(_) => "offer-fetched",
            Input::AnswerSubmitted => "answer-submitted",
            Input::PollTick => "poll-tick",
            Input::Poll(_) => "poll",
            Input::ChannelOpen => "channel-open",
            Input::ChannelClosed => "channel-closed",
            Input::NegotiationTimeout => "negotiation-timeout",
            Input::SeatingFailed(_) => "seating-failed",
            Input::Rejected(_) => "rejected",
            Input::Cancel => "cancel",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Effect {
    /// Ask the transport for an offer descriptor.
    CreateOffer,
    PublishOffer(Descriptor),
    ShowCode(RoomCode),
    /// Arm the poll timer once; it fires `Input::PollTick`.
    SchedulePoll,
    FetchAnswer(RoomCode),
    ApplyAnswer(Descriptor),
    FetchOffer(RoomCode),
    /// Apply the remote offer and produce an answer descriptor.
    AcceptOffer(Descriptor),
    SubmitAnswer(RoomCode, Descriptor),
    StartNegotiationTimer,
    StopNegotiationTimer,
    AssignSeats,
    /// Best-effort removal of a room nobody will consume.
    DiscardRoom(RoomCode),
    /// Close the transport and any partially built channel.
    Release,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SessionError {
    #[error("{input} is not valid in phase {phase:?}")]
    Unexpected { phase: Phase, input: &'static str },
    #[error("session already finished ({0:?})")]
    Finished(Phase),
    #[error("only the initiator assigns seats")]
    NotInitiator,
    #[error("session is not connected")]
    NotConnected,
    #[error("seat already assigned")]
    SeatConflict,
    #[error("message received before seat assignment")]
    Untrusted,
}

#[derive(Debug, Clone)]
pub struct Session {
    role: Role,
    phase: Phase,
    code: Option<RoomCode>,
    local: Option<Descriptor>,
    remote: Option<Descriptor>,
    polls: PollTracker,
    poll_in_flight: bool,
    seat: Option<Seat>,
}

impl Session {
    pub fn new(role: Role) -> Self {
        Self::with_tracker(role, PollTracker::default())
    }

    pub fn with_tracker(role: Role, polls: PollTracker) -> Self {
        Self {
            role,
            phase: Phase::Idle,
            code: None,
            local: None,
            remote: None,
            polls,
            poll_in_flight: false,
            seat: None,
        }
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn phase(&self) -> &Phase {
        &self.phase
    }

    pub fn code(&self) -> Option<&RoomCode> {
        self.code.as_ref()
    }

    pub fn local_descriptor(&self) -> Option<&Descriptor> {
        self.local.as_ref()
    }

    pub fn remote_descriptor(&self) -> Option<&Descriptor> {
        self.remote.as_ref()
    }

    pub fn seat(&self) -> Option<Seat> {
        self.seat
    }

    pub fn apply(&mut self, input: Input) -> Result<Vec<Effect>, SessionError> {
        if self.phase.is_terminal() {
            return Err(SessionError::Finished(self.phase.clone()));
        }
        if matches!(input, Input::Cancel) {
            return Ok(self.cancel());
        }

        let kind = input.kind();
        let effects = match (self.role, self.phase.clone(), input) {
            (Role::Initiator, Phase::Idle, Input::Host) => {
                self.phase = Phase::DescriptorPending;
                vec![Effect::CreateOffer]
            }
            (Role::Responder, Phase::Idle, Input::Join(code)) => {
                self.code = Some(code.clone());
                self.phase = Phase::DescriptorPending;
                vec![Effect::FetchOffer(code)]
            }
            (Role::Initiator, Phase::DescriptorPending, Input::LocalDescriptor(offer))
                if self.local.is_none() =>
            {
                self.local = Some(offer.clone());
                vec![Effect::PublishOffer(offer)]
            }
            (Role::Initiator, Phase::DescriptorPending, Input::RoomCreated(code))
                if self.local.is_some() =>
            {
                self.code = Some(code.clone());
                self.phase = Phase::Published;
                vec![Effect::ShowCode(code), Effect::SchedulePoll]
            }
            (Role::Initiator, Phase::Published | Phase::ExchangeInFlight, Input::PollTick)
                if !self.poll_in_flight =>
            {
                let code = self.code.clone().ok_or_else(|| SessionError::Unexpected {
                    phase: self.phase.clone(),
                    input: kind,
                })?;
                self.poll_in_flight = true;
                self.phase = Phase::ExchangeInFlight;
                vec![Effect::FetchAnswer(code)]
            }
            (Role::Initiator, Phase::ExchangeInFlight, Input::Poll(outcome))
                if self.poll_in_flight =>
            {
                self.poll_in_flight = false;
                match self.polls.observe(outcome) {
                    PollVerdict::KeepPolling => vec![Effect::SchedulePoll],
                    PollVerdict::Answered(answer) => {
                        self.remote = Some(answer.clone());
                        self.phase = Phase::Negotiating;
                        vec![Effect::ApplyAnswer(answer), Effect::StartNegotiationTimer]
                    }
                    PollVerdict::Expired => self.fail(FailureReason::Expired),
                }
            }
            (Role::Initiator, Phase::ExchangeInFlight, Input::Rejected(rejection))
                if self.poll_in_flight =>
            {
                self.poll_in_flight = false;
                self.fail(rejection.into())
            }
            (Role::Responder, Phase::DescriptorPending, Input::OfferFetched(offer)) => {
                self.remote = Some(offer.clone());
                self.phase = Phase::Published;
                vec![Effect::AcceptOffer(offer)]
            }
            (Role::Responder, Phase::Published, Input::LocalDescriptor(answer)) => {
                let code = self.code.clone().ok_or_else(|| SessionError::Unexpected {
                    phase: self.phase.clone(),
                    input: kind,
                })?;
                self.local = Some(answer.clone());
                self.phase = Phase::ExchangeInFlight;
                vec![Effect::SubmitAnswer(code, answer)]
            }
            (Role::Responder, Phase::ExchangeInFlight, Input::AnswerSubmitted) => {
                self.phase = Phase::Negotiating;
                vec![Effect::StartNegotiationTimer]
            }
            (_, Phase::DescriptorPending | Phase::Published, Input::Rejected(rejection)) => {
                self.fail(rejection.into())
            }
            (Role::Responder, Phase::ExchangeInFlight, Input::Rejected(rejection)) => {
                self.fail(rejection.into())
            }
            (
                _,
                Phase::DescriptorPending | Phase::Published | Phase::Negotiating,
                Input::LocalDescriptorFailed,
            ) => self.fail(FailureReason::ConnectionFailed),
            (Role::Responder, Phase::ExchangeInFlight, Input::ChannelOpen)
            | (_, Phase::Negotiating, Input::ChannelOpen) => {
                self.phase = Phase::Connected;
                let mut effects = vec![Effect::StopNegotiationTimer];
                if self.role == Role::Initiator {
                    effects.push(Effect::AssignSeats);
                }
                effects
            }
            (_, Phase::Negotiating, Input::NegotiationTimeout) => {
                self.fail(FailureReason::Timeout)
            }
            (_, Phase::ExchangeInFlight | Phase::Negotiating, Input::ChannelClosed) => {
                self.fail(FailureReason::ConnectionFailed)
            }
            (_, Phase::Connected, Input::SeatingFailed(reason)) => self.fail(reason),
            (_, Phase::Connected, Input::ChannelClosed) => {
                self.phase = Phase::Disconnected;
                vec![Effect::Release]
            }
            (_, phase, _) => return Err(SessionError::Unexpected { phase, input: kind }),
        };
        Ok(effects)
    }

    fn fail(&mut self, reason: FailureReason) -> Vec<Effect> {
        self.phase = Phase::Failed(reason);
        vec![Effect::StopNegotiationTimer, Effect::Release]
    }

    fn cancel(&mut self) -> Vec<Effect> {
        if self.phase == Phase::Connected {
            self.phase = Phase::Disconnected;
            return vec![Effect::Release];
        }
        let mut effects = Vec::new();
        if self.role == Role::Initiator
            && matches!(self.phase, Phase::Published | Phase::ExchangeInFlight)
        {
            if let Some(code) = self.code.clone() {
                effects.push(Effect::DiscardRoom(code));
            }
        }
        self.phase = Phase::Cancelled;
        self.poll_in_flight = false;
        effects.push(Effect::StopNegotiationTimer);
        effects.push(Effect::Release);
        effects
    }

    /// Initiator side of seat assignment: keep a random seat, return the
    /// message carrying the other one to the responder.
    pub fn assign_seat<R: Rng + ?Sized>(&mut self, rng: &mut R) -> Result<AppMessage, SessionError> {
        if self.role != Role::Initiator {
            return Err(SessionError::NotInitiator);
        }
        if self.phase != Phase::Connected {
            return Err(SessionError::NotConnected);
        }
        if self.seat.is_some() {
            return Err(SessionError::SeatConflict);
        }
        let mine = Seat::draw(rng);
        self.seat = Some(mine);
        Ok(AppMessage::RoleAssign { role: mine.other() })
    }

    /// Screens an inbound message. Seat assignments are consumed here;
    /// everything else is handed back once the seat is settled.
    pub fn on_message(&mut self, message: AppMessage) -> Result<Option<AppMessage>, SessionError> {
        if self.phase != Phase::Connected {
            return Err(SessionError::NotConnected);
        }
        match message {
            AppMessage::RoleAssign { role } => {
                if self.role == Role::Initiator || self.seat.is_some() {
                    return Err(SessionError::SeatConflict);
                }
                self.seat = Some(role);
                Ok(None)
            }
            _ if self.seat.is_none() => Err(SessionError::Untrusted),
            other => Ok(Some(other)),
        }
    }
}
