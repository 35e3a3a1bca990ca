use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use signal_core::{record_key, AnswerWrite, Descriptor, RoomCode, SignalRecord};
use tracing::{debug, info, warn};

use crate::error::ApiError;
use crate::store::{RendezvousStore, StoreError};

#[derive(Clone, Debug)]
pub struct SignalConfig {
    pub ttl: Duration,
    pub max_code_attempts: u32,
}

impl Default for SignalConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(900),
            max_code_attempts: 10,
        }
    }
}

/// The only place signaling records are encoded or decoded.
#[derive(Clone)]
pub struct RoomRepository {
    store: Arc<dyn RendezvousStore>,
    ttl: Duration,
}

impl RoomRepository {
    pub fn new(store: Arc<dyn RendezvousStore>, ttl: Duration) -> Self {
        Self { store, ttl }
    }

    pub async fn load(&self, code: &RoomCode) -> Result<Option<SignalRecord>, StoreError> {
        match self.store.get(&record_key(code)).await? {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    pub async fn insert_new(
        &self,
        code: &RoomCode,
        record: &SignalRecord,
    ) -> Result<bool, StoreError> {
        let raw = serde_json::to_string(record)?;
        self.store
            .put_if_absent(&record_key(code), raw, self.ttl)
            .await
    }

    pub async fn save(&self, code: &RoomCode, record: &SignalRecord) -> Result<(), StoreError> {
        let raw = serde_json::to_string(record)?;
        self.store.put(&record_key(code), raw, self.ttl).await
    }

    pub async fn remove(&self, code: &RoomCode) -> Result<(), StoreError> {
        self.store.delete(&record_key(code)).await
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AnswerPoll {
    Waiting,
    Answer(Descriptor),
}

/// The rendezvous protocol: create, fetch offer, submit answer, fetch answer,
/// expire.
#[derive(Clone)]
pub struct SignalService {
    rooms: RoomRepository,
    rng: Arc<Mutex<ChaCha8Rng>>,
    config: SignalConfig,
}

impl SignalService {
    pub fn new(store: Arc<dyn RendezvousStore>, config: SignalConfig) -> Self {
        Self::with_rng(store, config, ChaCha8Rng::from_entropy())
    }

    pub fn with_rng(store: Arc<dyn RendezvousStore>, config: SignalConfig, rng: ChaCha8Rng) -> Self {
        Self {
            rooms: RoomRepository::new(store, config.ttl),
            rng: Arc::new(Mutex::new(rng)),
            config,
        }
    }

    fn next_code(&self) -> RoomCode {
        let mut rng = self.rng.lock().unwrap_or_else(PoisonError::into_inner);
        RoomCode::generate(&mut *rng)
    }

    pub async fn create(&self, offer: Descriptor) -> Result<RoomCode, ApiError> {
        let record = SignalRecord::new(offer, now_ms());
        for attempt in 1..=self.config.max_code_attempts {
            let code = self.next_code();
            if self.rooms.insert_new(&code, &record).await? {
                info!(%code, attempt, "room created");
                return Ok(code);
            }
            debug!(%code, attempt, "room code taken, regenerating");
        }
        warn!(
            attempts = self.config.max_code_attempts,
            "gave up allocating a room code"
        );
        Err(ApiError::Capacity)
    }

    pub async fn fetch_offer(&self, code: &RoomCode) -> Result<Descriptor, ApiError> {
        let record = self.rooms.load(code).await?.ok_or(ApiError::NotFound)?;
        debug!(%code, "offer fetched");
        Ok(record.offer)
    }

    pub async fn submit_answer(&self, code: &RoomCode, answer: Descriptor) -> Result<(), ApiError> {
        let mut record = self.rooms.load(code).await?.ok_or(ApiError::NotFound)?;
        match record.record_answer(answer) {
            Ok(AnswerWrite::Stored) => {
                self.rooms.save(code, &record).await?;
                info!(%code, "answer stored");
                Ok(())
            }
            Ok(AnswerWrite::Unchanged) => {
                debug!(%code, "identical answer resubmitted");
                Ok(())
            }
            Err(err) => {
                warn!(%code, "second answer rejected");
                Err(err.into())
            }
        }
    }

    /// One-shot: handing out the answer removes the room.
    pub async fn fetch_answer(&self, code: &RoomCode) -> Result<AnswerPoll, ApiError> {
        let record = self.rooms.load(code).await?.ok_or(ApiError::NotFound)?;
        match record.answer {
            None => Ok(AnswerPoll::Waiting),
            Some(answer) => {
                self.rooms.remove(code).await?;
                info!(%code, "answer consumed, room removed");
                Ok(AnswerPoll::Answer(answer))
            }
        }
    }

    pub async fn expire(&self, code: &RoomCode) -> Result<(), ApiError> {
        self.rooms.remove(code).await?;
        info!(%code, "room expired on request");
        Ok(())
    }
}

pub(crate) fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
