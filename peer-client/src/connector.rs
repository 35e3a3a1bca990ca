//! Drives a [`Session`] against a real signaling service and transport.
//!
//! Each attempt runs in its own task. The task feeds the reducer one input at
//! a time, carries out the effects it returns and owns every timer, so a
//! cancelled or dropped attempt cannot be revived by a late poll or timeout.

use std::collections::VecDeque;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use signal_core::{
    AppMessage, Effect, FailureReason, Input, Phase, PollOutcome, Role, RoomCode, Seat, Session,
};
use thiserror::Error;
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, timeout, Instant};
use tracing::{debug, info, warn};

use crate::api::{AnswerPoll, ApiError, SignalingApi};
use crate::channel::MessageChannel;
use crate::transport::{LinkEvent, PeerTransport};

#[derive(Debug, Clone)]
pub struct ConnectorConfig {
    pub poll_interval: Duration,
    /// Budget for the link to open once descriptors are exchanged, and for
    /// the responder to receive its seat afterwards.
    pub negotiation_timeout: Duration,
    /// Bound on the best-effort room removal after a cancel.
    pub discard_timeout: Duration,
}

impl Default for ConnectorConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(3),
            negotiation_timeout: Duration::from_secs(20),
            discard_timeout: Duration::from_secs(2),
        }
    }
}

impl ConnectorConfig {
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_negotiation_timeout(mut self, timeout: Duration) -> Self {
        self.negotiation_timeout = timeout;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ConnectError {
    #[error(transparent)]
    Failed(#[from] FailureReason),
    #[error("connection attempt cancelled")]
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionStatus {
    pub phase: Phase,
    pub code: Option<RoomCode>,
}

#[derive(Clone)]
pub struct Connector {
    api: Arc<dyn SignalingApi>,
    config: ConnectorConfig,
}

impl Connector {
    pub fn new(api: Arc<dyn SignalingApi>) -> Self {
        Self::with_config(api, ConnectorConfig::default())
    }

    pub fn with_config(api: Arc<dyn SignalingApi>, config: ConnectorConfig) -> Self {
        Self { api, config }
    }

    pub fn host(&self, transport: Box<dyn PeerTransport>) -> SessionHandle {
        self.start(Role::Initiator, Input::Host, transport)
    }

    pub fn join(&self, code: RoomCode, transport: Box<dyn PeerTransport>) -> SessionHandle {
        self.start(Role::Responder, Input::Join(code), transport)
    }

    fn start(&self, role: Role, first: Input, transport: Box<dyn PeerTransport>) -> SessionHandle {
        let (status_tx, status_rx) = watch::channel(SessionStatus {
            phase: Phase::Idle,
            code: None,
        });
        let (cancel_tx, cancel_rx) = watch::channel(false);
        let (outcome_tx, outcome_rx) = oneshot::channel();

        let driver = Driver {
            api: self.api.clone(),
            config: self.config.clone(),
            session: Session::new(role),
            transport: Some(transport),
            link_ended: false,
            status: status_tx,
            cancel: cancel_rx,
            poll_at: None,
            deadline: None,
        };
        let task = tokio::spawn(async move {
            let outcome = driver.run(first).await;
            match &outcome {
                Ok(connection) => info!(role = ?role, seat = ?connection.seat(), "peer connected"),
                Err(err) => info!(role = ?role, %err, "connection attempt ended"),
            }
            let _ = outcome_tx.send(outcome);
        });

        SessionHandle {
            status: status_rx,
            cancel: cancel_tx,
            outcome: Some(outcome_rx),
            task,
        }
    }
}

/// A running attempt. Dropping it cancels the attempt.
pub struct SessionHandle {
    status: watch::Receiver<SessionStatus>,
    cancel: watch::Sender<bool>,
    outcome: Option<oneshot::Receiver<Result<Connection, ConnectError>>>,
    task: JoinHandle<()>,
}

impl SessionHandle {
    pub fn status(&self) -> SessionStatus {
        self.status.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<SessionStatus> {
        self.status.clone()
    }

    pub async fn room_code(&mut self) -> Option<RoomCode> {
        let status = self
            .status
            .wait_for(|s| s.code.is_some() || s.phase.is_terminal())
            .await
            .ok()?;
        status.code.clone()
    }

    pub fn cancel(&self) {
        let _ = self.cancel.send(true);
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    pub async fn connected(mut self) -> Result<Connection, ConnectError> {
        let Some(outcome) = self.outcome.take() else {
            return Err(ConnectError::Cancelled);
        };
        outcome.await.unwrap_or(Err(ConnectError::Cancelled))
    }
}

impl Drop for SessionHandle {
    fn drop(&mut self) {
        self.cancel();
    }
}

pub struct Connection {
    session: Session,
    channel: MessageChannel<AppMessage>,
    seat: Seat,
}

impl Connection {
    pub fn role(&self) -> Role {
        self.session.role()
    }

    pub fn seat(&self) -> Seat {
        self.seat
    }

    pub fn room_code(&self) -> Option<&RoomCode> {
        self.session.code()
    }

    pub fn phase(&self) -> &Phase {
        self.session.phase()
    }

    pub fn is_open(&self) -> bool {
        self.channel.is_open()
    }

    pub fn send(&self, message: &AppMessage) -> bool {
        self.channel.send(message)
    }

    /// Next application message. Seat reassignments are dropped.
    pub async fn recv(&mut self) -> Option<AppMessage> {
        loop {
            let Some(message) = self.channel.recv().await else {
                if let Err(err) = self.session.apply(Input::ChannelClosed) {
                    debug!(%err, "close already recorded");
                }
                return None;
            };
            match self.session.on_message(message) {
                Ok(Some(message)) => return Some(message),
                Ok(None) => {}
                Err(err) => warn!(%err, "dropping message"),
            }
        }
    }

    pub fn close(&mut self) {
        if let Err(err) = self.session.apply(Input::Cancel) {
            debug!(%err, "connection already closed");
        }
        self.channel.close();
    }
}

enum Wake {
    Cancel,
    PollDue,
    Deadline,
    Link(Option<LinkEvent>),
}

struct Driver {
    api: Arc<dyn SignalingApi>,
    config: ConnectorConfig,
    session: Session,
    transport: Option<Box<dyn PeerTransport>>,
    link_ended: bool,
    status: watch::Sender<SessionStatus>,
    cancel: watch::Receiver<bool>,
    poll_at: Option<Instant>,
    deadline: Option<Instant>,
}

impl Driver {
    async fn run(mut self, first: Input) -> Result<Connection, ConnectError> {
        let mut inputs = VecDeque::from([first]);
        loop {
            while let Some(input) = inputs.pop_front() {
                let kind = input.kind();
                let effects = match self.session.apply(input) {
                    Ok(effects) => effects,
                    Err(err) => {
                        debug!(%err, "input ignored");
                        continue;
                    }
                };
                debug!(input = kind, phase = ?self.session.phase(), "session transition");
                self.publish();
                for effect in effects {
                    if let Some(next) = self.perform(effect).await {
                        inputs.push_back(next);
                    }
                }
            }

            match self.session.phase().clone() {
                Phase::Connected => return self.establish().await,
                Phase::Failed(reason) => return Err(ConnectError::Failed(reason)),
                Phase::Cancelled | Phase::Disconnected => return Err(ConnectError::Cancelled),
                _ => {}
            }

            if let Some(input) = self.wait().await {
                inputs.push_back(input);
            }
        }
    }

    fn publish(&self) {
        self.status.send_replace(SessionStatus {
            phase: self.session.phase().clone(),
            code: self.session.code().cloned(),
        });
    }

    async fn perform(&mut self, effect: Effect) -> Option<Input> {
        match effect {
            Effect::CreateOffer => {
                let transport = self.transport.as_mut()?;
                let Some(result) = or_cancel(&mut self.cancel, transport.create_offer()).await
                else {
                    return Some(Input::Cancel);
                };
                Some(match result {
                    Ok(offer) => Input::LocalDescriptor(offer),
                    Err(err) => {
                        warn!(%err, "could not create offer");
                        Input::LocalDescriptorFailed
                    }
                })
            }
            Effect::PublishOffer(offer) => {
                let Some(result) = or_cancel(&mut self.cancel, self.api.create(&offer)).await
                else {
                    return Some(Input::Cancel);
                };
                Some(match result {
                    Ok(code) => Input::RoomCreated(code),
                    Err(err) => rejected("publish offer", err),
                })
            }
            Effect::ShowCode(code) => {
                info!(%code, "room ready, waiting for a peer");
                None
            }
            Effect::SchedulePoll => {
                self.poll_at = Some(Instant::now() + self.config.poll_interval);
                None
            }
            Effect::FetchAnswer(code) => {
                let Some(result) = or_cancel(&mut self.cancel, self.api.fetch_answer(&code)).await
                else {
                    return Some(Input::Cancel);
                };
                let outcome = match result {
                    Ok(AnswerPoll::Waiting) => PollOutcome::Waiting,
                    Ok(AnswerPoll::Ready(answer)) => PollOutcome::Answer(answer),
                    Err(ApiError::NotFound) => PollOutcome::NotFound,
                    Err(err) if err.is_transient() => {
                        debug!(%code, %err, "poll failed, retrying");
                        PollOutcome::Transient
                    }
                    Err(err) => return Some(rejected("poll answer", err)),
                };
                Some(Input::Poll(outcome))
            }
            Effect::ApplyAnswer(answer) => {
                let transport = self.transport.as_mut()?;
                let Some(result) = or_cancel(&mut self.cancel, transport.accept_answer(&answer)).await
                else {
                    return Some(Input::Cancel);
                };
                match result {
                    Ok(()) => None,
                    Err(err) => {
                        warn!(%err, "could not apply answer");
                        Some(Input::LocalDescriptorFailed)
                    }
                }
            }
            Effect::FetchOffer(code) => {
                let Some(result) = or_cancel(&mut self.cancel, self.api.fetch_offer(&code)).await
                else {
                    return Some(Input::Cancel);
                };
                Some(match result {
                    Ok(offer) => Input::OfferFetched(offer),
                    Err(err) => rejected("fetch offer", err),
                })
            }
            Effect::AcceptOffer(offer) => {
                let transport = self.transport.as_mut()?;
                let Some(result) = or_cancel(&mut self.cancel, transport.accept_offer(&offer)).await
                else {
                    return Some(Input::Cancel);
                };
                Some(match result {
                    Ok(answer) => Input::LocalDescriptor(answer),
                    Err(err) => {
                        warn!(%err, "could not accept offer");
                        Input::LocalDescriptorFailed
                    }
                })
            }
            Effect::SubmitAnswer(code, answer) => {
                let Some(result) =
                    or_cancel(&mut self.cancel, self.api.submit_answer(&code, &answer)).await
                else {
                    return Some(Input::Cancel);
                };
                Some(match result {
                    Ok(()) => Input::AnswerSubmitted,
                    Err(err) => rejected("submit answer", err),
                })
            }
            Effect::StartNegotiationTimer => {
                self.deadline = Some(Instant::now() + self.config.negotiation_timeout);
                None
            }
            Effect::StopNegotiationTimer => {
                self.deadline = None;
                None
            }
            // seats go out once the message channel exists
            Effect::AssignSeats => None,
            Effect::DiscardRoom(code) => {
                match timeout(self.config.discard_timeout, self.api.expire(&code)).await {
                    Ok(Ok(())) => debug!(%code, "room discarded"),
                    Ok(Err(err)) => debug!(%code, %err, "room discard failed"),
                    Err(_) => debug!(%code, "room discard timed out"),
                }
                None
            }
            Effect::Release => {
                self.poll_at = None;
                self.deadline = None;
                if let Some(mut transport) = self.transport.take() {
                    transport.close();
                }
                None
            }
        }
    }

    async fn wait(&mut self) -> Option<Input> {
        let link = match self.transport.as_mut() {
            Some(transport) if !self.link_ended => Some(transport),
            _ => None,
        };
        let wake = tokio::select! {
            biased;
            _ = cancelled(&mut self.cancel) => Wake::Cancel,
            _ = sleep_opt(self.deadline) => Wake::Deadline,
            _ = sleep_opt(self.poll_at) => Wake::PollDue,
            event = next_link_event(link) => Wake::Link(event),
        };

        match wake {
            Wake::Cancel => Some(Input::Cancel),
            Wake::Deadline => {
                self.deadline = None;
                Some(Input::NegotiationTimeout)
            }
            Wake::PollDue => {
                self.poll_at = None;
                Some(Input::PollTick)
            }
            Wake::Link(Some(LinkEvent::Open)) => Some(Input::ChannelOpen),
            Wake::Link(Some(LinkEvent::Closed)) => Some(Input::ChannelClosed),
            Wake::Link(None) => {
                self.link_ended = true;
                Some(Input::ChannelClosed)
            }
            Wake::Link(Some(LinkEvent::Frame(_))) => {
                warn!("frame arrived before the link opened, dropped");
                None
            }
        }
    }

    /// Connected: wrap the transport and settle seats before handing the
    /// connection out.
    async fn establish(mut self) -> Result<Connection, ConnectError> {
        let Some(transport) = self.transport.take() else {
            return Err(FailureReason::ConnectionFailed.into());
        };
        let mut channel = MessageChannel::<AppMessage>::open(transport);

        let settled = match self.session.role() {
            Role::Initiator => self.send_seat(&channel),
            Role::Responder => self.await_seat(&mut channel).await,
        };
        if let Err(err) = settled {
            channel.close();
            let input = match err {
                ConnectError::Failed(reason) => Input::SeatingFailed(reason),
                ConnectError::Cancelled => Input::Cancel,
            };
            if let Err(err) = self.session.apply(input) {
                debug!(%err, "seating failure not applied");
            }
            self.publish();
            return Err(err);
        }

        let Some(seat) = self.session.seat() else {
            return Err(FailureReason::ConnectionFailed.into());
        };
        debug!(seat = ?seat, "seat settled");
        Ok(Connection {
            session: self.session,
            channel,
            seat,
        })
    }

    fn send_seat(&mut self, channel: &MessageChannel<AppMessage>) -> Result<(), ConnectError> {
        let assignment = self
            .session
            .assign_seat(&mut rand::thread_rng())
            .map_err(|err| {
                warn!(%err, "seat assignment failed");
                ConnectError::Failed(FailureReason::ConnectionFailed)
            })?;
        if !channel.send(&assignment) {
            return Err(FailureReason::ConnectionFailed.into());
        }
        Ok(())
    }

    async fn await_seat(
        &mut self,
        channel: &mut MessageChannel<AppMessage>,
    ) -> Result<(), ConnectError> {
        let deadline = Instant::now() + self.config.negotiation_timeout;
        loop {
            let next = tokio::select! {
                biased;
                _ = cancelled(&mut self.cancel) => return Err(ConnectError::Cancelled),
                _ = sleep_until(deadline) => return Err(FailureReason::Timeout.into()),
                message = channel.recv() => message,
            };
            let Some(message) = next else {
                return Err(FailureReason::ConnectionFailed.into());
            };
            match self.session.on_message(message) {
                Ok(None) if self.session.seat().is_some() => return Ok(()),
                Ok(_) => {}
                Err(err) => warn!(%err, "ignoring message before seat assignment"),
            }
        }
    }
}

fn rejected(step: &'static str, err: ApiError) -> Input {
    warn!(step, %err, "signaling request rejected");
    Input::Rejected(err.rejection())
}

/// Resolves once cancellation is requested or the handle is gone.
async fn cancelled(cancel: &mut watch::Receiver<bool>) {
    loop {
        if *cancel.borrow_and_update() {
            return;
        }
        if cancel.changed().await.is_err() {
            return;
        }
    }
}

async fn or_cancel<F: Future>(cancel: &mut watch::Receiver<bool>, work: F) -> Option<F::Output> {
    tokio::select! {
        biased;
        _ = cancelled(cancel) => None,
        out = work => Some(out),
    }
}

async fn sleep_opt(at: Option<Instant>) {
    match at {
        Some(at) => sleep_until(at).await,
        None => std::future::pending().await,
    }
}

async fn next_link_event(transport: Option<&mut Box<dyn PeerTransport>>) -> Option<LinkEvent> {
    match transport {
        Some(transport) => transport.next_event().await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::tests::{spawn_backend, spawn_flaky_signal};
    use crate::api::HttpSignalingApi;
    use crate::loopback::LoopbackNetwork;
    use backend::rooms::{self, SignalConfig, SignalService};
    use backend::store::MemoryStore;
    use serde_json::json;
    use signal_core::Descriptor;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    fn code() -> RoomCode {
        RoomCode::parse("ab2k").unwrap()
    }

    /// Answers from queues; an empty poll queue means "still waiting".
    #[derive(Default)]
    struct ScriptedApi {
        create: Mutex<Option<Result<RoomCode, ApiError>>>,
        offer: Mutex<Option<Result<Descriptor, ApiError>>>,
        submit: Mutex<Option<Result<(), ApiError>>>,
        submitted: Mutex<Vec<Descriptor>>,
        polls: Mutex<VecDeque<Result<AnswerPoll, ApiError>>>,
        poll_count: AtomicUsize,
        offer_count: AtomicUsize,
        expired: Mutex<Vec<RoomCode>>,
    }

    impl ScriptedApi {
        fn with_polls(polls: Vec<Result<AnswerPoll, ApiError>>) -> Arc<Self> {
            let api = Self::default();
            *api.polls.lock().unwrap() = polls.into();
            Arc::new(api)
        }

        fn polls(&self) -> usize {
            self.poll_count.load(Ordering::SeqCst)
        }

        fn expired(&self) -> Vec<RoomCode> {
            self.expired.lock().unwrap().clone()
        }
    }

    #[async_trait::async_trait]
    impl SignalingApi for ScriptedApi {
        async fn create(&self, _offer: &Descriptor) -> Result<RoomCode, ApiError> {
            self.create.lock().unwrap().clone().unwrap_or_else(|| Ok(code()))
        }

        async fn fetch_offer(&self, _code: &RoomCode) -> Result<Descriptor, ApiError> {
            self.offer_count.fetch_add(1, Ordering::SeqCst);
            self.offer
                .lock()
                .unwrap()
                .clone()
                .unwrap_or(Err(ApiError::NotFound))
        }

        async fn submit_answer(&self, _code: &RoomCode, answer: &Descriptor) -> Result<(), ApiError> {
            self.submitted.lock().unwrap().push(answer.clone());
            self.submit.lock().unwrap().clone().unwrap_or(Ok(()))
        }

        async fn fetch_answer(&self, _code: &RoomCode) -> Result<AnswerPoll, ApiError> {
            self.poll_count.fetch_add(1, Ordering::SeqCst);
            self.polls
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or(Ok(AnswerPoll::Waiting))
        }

        async fn expire(&self, code: &RoomCode) -> Result<(), ApiError> {
            self.expired.lock().unwrap().push(code.clone());
            Ok(())
        }
    }

    /// The signaling service called in-process, without HTTP.
    struct ServiceApi(SignalService);

    fn from_service(err: backend::ApiError) -> ApiError {
        match err {
            backend::ApiError::NotFound => ApiError::NotFound,
            backend::ApiError::AlreadyAnswered => ApiError::Conflict,
            backend::ApiError::RateLimited => ApiError::RateLimited,
            backend::ApiError::Capacity => ApiError::Capacity,
            backend::ApiError::InvalidInput(reason) => ApiError::InvalidInput(reason),
            backend::ApiError::Store(err) => ApiError::Network(err.to_string()),
        }
    }

    #[async_trait::async_trait]
    impl SignalingApi for ServiceApi {
        async fn create(&self, offer: &Descriptor) -> Result<RoomCode, ApiError> {
            self.0.create(offer.clone()).await.map_err(from_service)
        }

        async fn fetch_offer(&self, code: &RoomCode) -> Result<Descriptor, ApiError> {
            self.0.fetch_offer(code).await.map_err(from_service)
        }

        async fn submit_answer(&self, code: &RoomCode, answer: &Descriptor) -> Result<(), ApiError> {
            self.0
                .submit_answer(code, answer.clone())
                .await
                .map_err(from_service)
        }

        async fn fetch_answer(&self, code: &RoomCode) -> Result<AnswerPoll, ApiError> {
            match self.0.fetch_answer(code).await.map_err(from_service)? {
                rooms::AnswerPoll::Waiting => Ok(AnswerPoll::Waiting),
                rooms::AnswerPoll::Answer(answer) => Ok(AnswerPoll::Ready(answer)),
            }
        }

        async fn expire(&self, code: &RoomCode) -> Result<(), ApiError> {
            self.0.expire(code).await.map_err(from_service)
        }
    }

    fn in_process_service() -> SignalService {
        SignalService::new(Arc::new(MemoryStore::new()), SignalConfig::default())
    }

    #[tokio::test(start_paused = true)]
    async fn host_expires_after_three_consecutive_not_found() {
        let api = ScriptedApi::with_polls(vec![
            Ok(AnswerPoll::Waiting),
            Ok(AnswerPoll::Waiting),
            Err(ApiError::NotFound),
            Err(ApiError::NotFound),
            Err(ApiError::NotFound),
        ]);
        let connector = Connector::new(api.clone());
        let network = LoopbackNetwork::new();

        let started = Instant::now();
        let handle = connector.host(Box::new(network.transport()));
        let status = handle.subscribe();
        let outcome = handle.connected().await;

        assert_eq!(outcome.err(), Some(ConnectError::Failed(FailureReason::Expired)));
        assert_eq!(api.polls(), 5);
        // one poll every interval, none in parallel
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_secs(15) && elapsed < Duration::from_secs(16));
        assert_eq!(status.borrow().phase, Phase::Failed(FailureReason::Expired));
        assert_eq!(network.pending_offers(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn waiting_resets_and_transient_errors_are_ignored() {
        let api = ScriptedApi::with_polls(vec![
            Err(ApiError::NotFound),
            Err(ApiError::NotFound),
            Ok(AnswerPoll::Waiting),
            Err(ApiError::NotFound),
            Err(ApiError::Network("connection reset".into())),
            Err(ApiError::Unexpected(502)),
            Err(ApiError::NotFound),
            Err(ApiError::NotFound),
        ]);
        let connector = Connector::new(api.clone());
        let handle = connector.host(Box::new(LoopbackNetwork::new().transport()));

        assert_eq!(
            handle.connected().await.err(),
            Some(ConnectError::Failed(FailureReason::Expired))
        );
        assert_eq!(api.polls(), 8);
    }

    #[tokio::test(start_paused = true)]
    async fn rejected_poll_ends_the_attempt() {
        let api = ScriptedApi::with_polls(vec![Err(ApiError::RateLimited)]);
        let connector = Connector::new(api.clone());
        let handle = connector.host(Box::new(LoopbackNetwork::new().transport()));
        assert_eq!(
            handle.connected().await.err(),
            Some(ConnectError::Failed(FailureReason::RateLimited))
        );
        assert_eq!(api.polls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn create_failures_surface_without_polling() {
        let api = Arc::new(ScriptedApi::default());
        *api.create.lock().unwrap() = Some(Err(ApiError::RateLimited));
        let connector = Connector::new(api.clone());
        let handle = connector.host(Box::new(LoopbackNetwork::new().transport()));
        assert_eq!(
            handle.connected().await.err(),
            Some(ConnectError::Failed(FailureReason::RateLimited))
        );
        assert_eq!(api.polls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn offer_creation_failure() {
        let network = LoopbackNetwork::new();
        network.fail_offers(true);
        let api = Arc::new(ScriptedApi::default());
        let handle = Connector::new(api.clone()).host(Box::new(network.transport()));
        assert_eq!(
            handle.connected().await.err(),
            Some(ConnectError::Failed(FailureReason::ConnectionFailed))
        );
        assert_eq!(api.polls(), 0);
    }

    #[tokio::test]
    async fn unavailable_poll_keeps_polling() {
        let polls = Arc::new(AtomicUsize::new(0));
        let base = spawn_flaky_signal(polls.clone()).await;
        let api = Arc::new(HttpSignalingApi::new(&base).unwrap());
        let config = ConnectorConfig::default().with_poll_interval(Duration::from_millis(20));
        let handle = Connector::with_config(api, config)
            .host(Box::new(LoopbackNetwork::new().transport()));
        let status = handle.subscribe();

        tokio::time::timeout(Duration::from_secs(5), async {
            while polls.load(Ordering::SeqCst) < 3 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
        assert_eq!(status.borrow().phase, Phase::ExchangeInFlight);

        handle.cancel();
        assert_eq!(handle.connected().await.err(), Some(ConnectError::Cancelled));
    }

    #[tokio::test(start_paused = true)]
    async fn unknown_code_fails_without_retry() {
        let api = Arc::new(ScriptedApi::default());
        let connector = Connector::new(api.clone());
        let mut handle = connector.join(code(), Box::new(LoopbackNetwork::new().transport()));

        assert_eq!(handle.room_code().await, Some(code()));
        let err = handle.connected().await.err().unwrap();
        assert_eq!(err, ConnectError::Failed(FailureReason::RoomNotFound));
        assert_eq!(err.to_string(), "Room not found. Check the code and try again.");
        assert_eq!(api.offer_count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn second_answer_is_room_taken() {
        let network = LoopbackNetwork::new();
        let mut host = network.transport();
        let offer = host.create_offer().await.unwrap();

        let api = Arc::new(ScriptedApi::default());
        *api.offer.lock().unwrap() = Some(Ok(offer));
        *api.submit.lock().unwrap() = Some(Err(ApiError::Conflict));
        let handle = Connector::new(api).join(code(), Box::new(network.transport()));
        assert_eq!(
            handle.connected().await.err(),
            Some(ConnectError::Failed(FailureReason::RoomTaken))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn responder_without_a_seat_reports_timeout() {
        let network = LoopbackNetwork::new();
        let mut host = network.transport();
        let offer = host.create_offer().await.unwrap();

        let api = Arc::new(ScriptedApi::default());
        *api.offer.lock().unwrap() = Some(Ok(offer));
        let handle = Connector::new(api.clone()).join(code(), Box::new(network.transport()));
        let mut status = handle.subscribe();
        status
            .wait_for(|s| s.phase == Phase::Negotiating)
            .await
            .unwrap();

        // open the link, but never send role-assign
        let answer = api.submitted.lock().unwrap()[0].clone();
        host.accept_answer(&answer).await.unwrap();

        let timed_out = ConnectError::Failed(FailureReason::Timeout);
        assert_eq!(handle.connected().await.err(), Some(timed_out));
        assert_eq!(status.borrow().phase, Phase::Failed(FailureReason::Timeout));
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_stops_polling_and_discards_the_room() {
        let api = ScriptedApi::with_polls(vec![]);
        let connector = Connector::new(api.clone());
        let mut handle = connector.host(Box::new(LoopbackNetwork::new().transport()));
        let status = handle.subscribe();

        assert_eq!(handle.room_code().await, Some(code()));
        tokio::time::sleep(Duration::from_secs(7)).await;
        handle.cancel();
        assert_eq!(handle.connected().await.err(), Some(ConnectError::Cancelled));

        let polls = api.polls();
        assert_eq!(polls, 2);
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(api.polls(), polls);
        assert_eq!(api.expired(), vec![code()]);
        assert_eq!(status.borrow().phase, Phase::Cancelled);
    }

    #[tokio::test(start_paused = true)]
    async fn dropping_the_handle_cancels() {
        let api = ScriptedApi::with_polls(vec![]);
        let connector = Connector::new(api.clone());
        let mut handle = connector.host(Box::new(LoopbackNetwork::new().transport()));
        let mut status = handle.subscribe();
        handle.room_code().await;
        drop(handle);

        status.wait_for(|s| s.phase.is_terminal()).await.unwrap();
        assert_eq!(status.borrow().phase, Phase::Cancelled);
        assert_eq!(api.expired(), vec![code()]);
    }

    #[tokio::test(start_paused = true)]
    async fn peers_connect_and_exchange_messages_in_process() {
        let service = in_process_service();
        let connector = Connector::new(Arc::new(ServiceApi(service.clone())));
        let network = LoopbackNetwork::new();

        let mut host = connector.host(Box::new(network.transport()));
        let code = host.room_code().await.unwrap();
        let guest = connector.join(code.clone(), Box::new(network.transport()));

        let (host, guest) = tokio::join!(host.connected(), guest.connected());
        let (mut host, mut guest) = (host.unwrap(), guest.unwrap());

        assert_eq!(host.role(), Role::Initiator);
        assert_eq!(guest.role(), Role::Responder);
        assert_eq!(host.seat(), guest.seat().other());
        assert_eq!(host.room_code(), Some(&code));
        // the answer was consumed, so the record is gone
        assert!(matches!(
            service.fetch_offer(&code).await,
            Err(backend::ApiError::NotFound)
        ));

        let state = AppMessage::GameState {
            state: json!({ "board": [null, "X", null], "turn": "O" }),
        };
        assert!(host.send(&state));
        assert_eq!(guest.recv().await, Some(state));

        let select = AppMessage::GameSelect {
            game: Some("tic-tac-toe".into()),
            initial_state: None,
        };
        assert!(guest.send(&select));
        assert_eq!(host.recv().await, Some(select));

        guest.close();
        assert_eq!(host.recv().await, None);
        assert_eq!(host.phase(), &Phase::Disconnected);
        assert!(!host.send(&AppMessage::GameSelect {
            game: None,
            initial_state: None
        }));
    }

    #[tokio::test(start_paused = true)]
    async fn stalled_negotiation_times_out_on_both_sides() {
        let service = in_process_service();
        let config = ConnectorConfig::default().with_negotiation_timeout(Duration::from_secs(20));
        let connector = Connector::with_config(Arc::new(ServiceApi(service)), config);
        let network = LoopbackNetwork::new();
        network.stall_negotiation(true);

        let mut host = connector.host(Box::new(network.transport()));
        let code = host.room_code().await.unwrap();
        let guest = connector.join(code, Box::new(network.transport()));

        let (host, guest) = tokio::join!(host.connected(), guest.connected());
        let timed_out = Some(ConnectError::Failed(FailureReason::Timeout));
        assert_eq!(host.err(), timed_out);
        assert_eq!(guest.err(), timed_out);
    }

    #[tokio::test]
    async fn peers_connect_over_http() {
        let base = spawn_backend(100, 10_000).await;
        let api = Arc::new(HttpSignalingApi::new(&base).unwrap());
        let config = ConnectorConfig::default()
            .with_poll_interval(Duration::from_millis(50))
            .with_negotiation_timeout(Duration::from_secs(5));
        let connector = Connector::with_config(api.clone(), config);
        let network = LoopbackNetwork::new();

        let mut host = connector.host(Box::new(network.transport()));
        let code = host.room_code().await.unwrap();
        let shared = format!("https://gifts.example/games?code={}", code.as_str().to_uppercase());
        let guest = connector.join(
            RoomCode::parse_shared(&shared).unwrap(),
            Box::new(network.transport()),
        );

        let (host, guest) = tokio::join!(host.connected(), guest.connected());
        let (host, mut guest) = (host.unwrap(), guest.unwrap());
        assert_ne!(host.seat(), guest.seat());

        let state = AppMessage::GameState {
            state: json!({ "scores": { "X": 1, "O": 0 } }),
        };
        assert!(host.send(&state));
        assert_eq!(guest.recv().await, Some(state));
        assert_eq!(api.fetch_offer(&code).await, Err(ApiError::NotFound));
    }
}
