//! In-process transport: both peers live in one process and "connect"
//! through a shared [`LoopbackNetwork`]. Descriptors are opaque tokens
//! naming a pending offer, so they travel through the signaling service
//! exactly like real ones.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};

use async_trait::async_trait;
use signal_core::Descriptor;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use uuid::Uuid;

use crate::transport::{FrameSink, LinkEvent, PeerTransport, TransportError};

const OFFER_PREFIX: &str = "loopback-offer:";
const ANSWER_PREFIX: &str = "loopback-answer:";

#[derive(Clone)]
struct Endpoint {
    events: UnboundedSender<LinkEvent>,
    link: Weak<LinkSink>,
}

struct PendingOffer {
    host: Endpoint,
    guest: Option<Endpoint>,
}

#[derive(Default)]
struct NetworkState {
    offers: HashMap<String, PendingOffer>,
    fail_offers: bool,
    stall: bool,
}

#[derive(Clone, Default)]
pub struct LoopbackNetwork {
    state: Arc<Mutex<NetworkState>>,
}

impl LoopbackNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn transport(&self) -> LoopbackTransport {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        LoopbackTransport {
            network: self.clone(),
            events_tx,
            events_rx,
            link: Arc::new(LinkSink::default()),
            offer_id: None,
        }
    }

    /// Makes every following `create_offer` fail.
    pub fn fail_offers(&self, fail: bool) {
        self.lock().fail_offers = fail;
    }

    /// Descriptors still exchange, but no link ever opens.
    pub fn stall_negotiation(&self, stall: bool) {
        self.lock().stall = stall;
    }

    pub fn pending_offers(&self) -> usize {
        self.lock().offers.len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, NetworkState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[derive(Default)]
struct LinkSink {
    open: AtomicBool,
    peer: Mutex<Option<Endpoint>>,
}

impl FrameSink for LinkSink {
    fn send_frame(&self, frame: String) -> bool {
        if !self.open.load(Ordering::SeqCst) {
            return false;
        }
        let peer = self.peer.lock().unwrap_or_else(PoisonError::into_inner);
        match peer.as_ref() {
            Some(peer) => peer.events.send(LinkEvent::Frame(frame)).is_ok(),
            None => false,
        }
    }

    fn close(&self) {
        let was_open = self.open.swap(false, Ordering::SeqCst);
        let peer = self
            .peer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(peer) = peer {
            if let Some(link) = peer.link.upgrade() {
                link.open.store(false, Ordering::SeqCst);
            }
            if was_open {
                let _ = peer.events.send(LinkEvent::Closed);
            }
        }
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }
}

pub struct LoopbackTransport {
    network: LoopbackNetwork,
    events_tx: UnboundedSender<LinkEvent>,
    events_rx: UnboundedReceiver<LinkEvent>,
    link: Arc<LinkSink>,
    offer_id: Option<String>,
}

impl LoopbackTransport {
    fn endpoint(&self) -> Endpoint {
        Endpoint {
            events: self.events_tx.clone(),
            link: Arc::downgrade(&self.link),
        }
    }

    fn set_peer(&self, peer: Endpoint) {
        *self.link.peer.lock().unwrap_or_else(PoisonError::into_inner) = Some(peer);
    }
}

fn token<'a>(descriptor: &'a Descriptor, prefix: &str) -> Result<&'a str, TransportError> {
    descriptor
        .as_str()
        .strip_prefix(prefix)
        .ok_or_else(|| TransportError::InvalidDescriptor(descriptor.as_str().chars().take(32).collect()))
}

fn descriptor(raw: String) -> Result<Descriptor, TransportError> {
    Descriptor::new(raw).map_err(|e| TransportError::InvalidDescriptor(e.to_string()))
}

#[async_trait]
impl PeerTransport for LoopbackTransport {
    async fn create_offer(&mut self) -> Result<Descriptor, TransportError> {
        let id = Uuid::new_v4().to_string();
        {
            let mut state = self.network.lock();
            if state.fail_offers {
                return Err(TransportError::Negotiation("offer creation failed".into()));
            }
            state.offers.insert(
                id.clone(),
                PendingOffer {
                    host: self.endpoint(),
                    guest: None,
                },
            );
        }
        let offer = descriptor(format!("{OFFER_PREFIX}{id}"))?;
        self.offer_id = Some(id);
        Ok(offer)
    }

    async fn accept_offer(&mut self, offer: &Descriptor) -> Result<Descriptor, TransportError> {
        let id = token(offer, OFFER_PREFIX)?.to_string();
        let host = {
            let mut state = self.network.lock();
            let pending = state
                .offers
                .get_mut(&id)
                .ok_or_else(|| TransportError::Negotiation("offer no longer pending".into()))?;
            if pending.guest.is_some() {
                return Err(TransportError::Negotiation("offer already accepted".into()));
            }
            pending.guest = Some(self.endpoint());
            pending.host.clone()
        };
        self.set_peer(host);
        descriptor(format!("{ANSWER_PREFIX}{id}"))
    }

    async fn accept_answer(&mut self, answer: &Descriptor) -> Result<(), TransportError> {
        let id = token(answer, ANSWER_PREFIX)?;
        if self.offer_id.as_deref() != Some(id) {
            return Err(TransportError::InvalidDescriptor(
                "answer does not match our offer".into(),
            ));
        }
        let (guest, stall) = {
            let mut state = self.network.lock();
            let pending = state
                .offers
                .remove(id)
                .ok_or_else(|| TransportError::Negotiation("offer no longer pending".into()))?;
            let guest = pending
                .guest
                .ok_or_else(|| TransportError::Negotiation("offer was never accepted".into()))?;
            (guest, state.stall)
        };
        self.offer_id = None;
        self.set_peer(guest.clone());
        if stall {
            return Ok(());
        }

        let Some(guest_link) = guest.link.upgrade() else {
            return Err(TransportError::Closed);
        };
        guest_link.open.store(true, Ordering::SeqCst);
        self.link.open.store(true, Ordering::SeqCst);
        let _ = guest.events.send(LinkEvent::Open);
        let _ = self.events_tx.send(LinkEvent::Open);
        Ok(())
    }

    async fn next_event(&mut self) -> Option<LinkEvent> {
        self.events_rx.recv().await
    }

    fn sink(&self) -> Arc<dyn FrameSink> {
        self.link.clone()
    }

    fn close(&mut self) {
        if let Some(id) = self.offer_id.take() {
            self.network.lock().offers.remove(&id);
        }
        self.link.close();
        self.events_rx.close();
    }
}

impl Drop for LoopbackTransport {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn connected_pair(network: &LoopbackNetwork) -> (LoopbackTransport, LoopbackTransport) {
        let mut host = network.transport();
        let mut guest = network.transport();
        let offer = host.create_offer().await.unwrap();
        let answer = guest.accept_offer(&offer).await.unwrap();
        host.accept_answer(&answer).await.unwrap();
        (host, guest)
    }

    #[tokio::test]
    async fn pair_opens_and_carries_frames_both_ways() {
        let network = LoopbackNetwork::new();
        let (mut host, mut guest) = connected_pair(&network).await;
        assert_eq!(host.next_event().await, Some(LinkEvent::Open));
        assert_eq!(guest.next_event().await, Some(LinkEvent::Open));

        assert!(host.sink().send_frame("ping".into()));
        assert!(guest.sink().send_frame("pong".into()));
        assert_eq!(guest.next_event().await, Some(LinkEvent::Frame("ping".into())));
        assert_eq!(host.next_event().await, Some(LinkEvent::Frame("pong".into())));
        assert_eq!(network.pending_offers(), 0);
    }

    #[tokio::test]
    async fn closing_one_side_notifies_the_other() {
        let network = LoopbackNetwork::new();
        let (mut host, mut guest) = connected_pair(&network).await;
        host.next_event().await;
        guest.next_event().await;

        let guest_sink = guest.sink();
        host.close();
        assert_eq!(guest.next_event().await, Some(LinkEvent::Closed));
        assert!(!guest_sink.is_open());
        assert!(!guest_sink.send_frame("late".into()));
        assert!(!host.sink().send_frame("late".into()));
    }

    #[tokio::test]
    async fn offer_accepts_only_one_guest() {
        let network = LoopbackNetwork::new();
        let mut host = network.transport();
        let offer = host.create_offer().await.unwrap();
        network.transport().accept_offer(&offer).await.unwrap();
        let err = network.transport().accept_offer(&offer).await.unwrap_err();
        assert!(matches!(err, TransportError::Negotiation(_)));
    }

    #[tokio::test]
    async fn foreign_descriptors_are_rejected() {
        let network = LoopbackNetwork::new();
        let mut guest = network.transport();
        let bogus = Descriptor::new("v=0\r\no=- 1 1 IN IP4 0.0.0.0").unwrap();
        assert!(matches!(
            guest.accept_offer(&bogus).await,
            Err(TransportError::InvalidDescriptor(_))
        ));

        let mut host = network.transport();
        host.create_offer().await.unwrap();
        let stranger = Descriptor::new(format!("{ANSWER_PREFIX}someone-else")).unwrap();
        assert!(matches!(
            host.accept_answer(&stranger).await,
            Err(TransportError::InvalidDescriptor(_))
        ));
    }

    #[tokio::test]
    async fn fault_injection() {
        let network = LoopbackNetwork::new();
        network.fail_offers(true);
        assert!(network.transport().create_offer().await.is_err());
        network.fail_offers(false);

        network.stall_negotiation(true);
        let (host, guest) = connected_pair(&network).await;
        assert!(!host.sink().is_open());
        assert!(!guest.sink().is_open());
    }

    #[tokio::test]
    async fn closing_an_unanswered_offer_forgets_it() {
        let network = LoopbackNetwork::new();
        let mut host = network.transport();
        host.create_offer().await.unwrap();
        assert_eq!(network.pending_offers(), 1);
        drop(host);
        assert_eq!(network.pending_offers(), 0);
    }
}
