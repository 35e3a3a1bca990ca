use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Response, StatusCode};
use serde::Deserialize;
use serde_json::json;
use signal_core::{Descriptor, Rejection, RoomCode};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ApiError {
    #[error("room not found or expired")]
    NotFound,
    #[error("room already answered")]
    Conflict,
    #[error("rate limited by the signaling service")]
    RateLimited,
    #[error("signaling service has no free room codes")]
    Capacity,
    #[error("request rejected: {0}")]
    InvalidInput(String),
    #[error("network error: {0}")]
    Network(String),
    #[error("unexpected status {0}")]
    Unexpected(u16),
}

impl ApiError {
    /// Worth retrying on the next poll: the request never reached the store
    /// or the server failed on its side.
    pub fn is_transient(&self) -> bool {
        match self {
            ApiError::Network(_) => true,
            ApiError::Unexpected(status) => *status >= 500,
            _ => false,
        }
    }

    pub fn rejection(&self) -> Rejection {
        match self {
            ApiError::NotFound => Rejection::NotFound,
            ApiError::Conflict => Rejection::Conflict,
            ApiError::RateLimited => Rejection::RateLimited,
            ApiError::Capacity => Rejection::Capacity,
            ApiError::InvalidInput(_) => Rejection::InvalidInput,
            ApiError::Network(_) | ApiError::Unexpected(_) => Rejection::Unavailable,
        }
    }
}

impl From<reqwest::Error> for ApiError {
    fn from(err: reqwest::Error) -> Self {
        ApiError::Network(err.to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AnswerPoll {
    Waiting,
    Ready(Descriptor),
}

#[async_trait]
pub trait SignalingApi: Send + Sync {
    async fn create(&self, offer: &Descriptor) -> Result<RoomCode, ApiError>;

    async fn fetch_offer(&self, code: &RoomCode) -> Result<Descriptor, ApiError>;

    async fn submit_answer(&self, code: &RoomCode, answer: &Descriptor) -> Result<(), ApiError>;

    /// A `Ready` answer has already been removed from the store.
    async fn fetch_answer(&self, code: &RoomCode) -> Result<AnswerPoll, ApiError>;

    async fn expire(&self, code: &RoomCode) -> Result<(), ApiError>;
}

#[derive(Deserialize)]
struct CreateReply {
    code: RoomCode,
}

#[derive(Deserialize)]
struct OfferReply {
    offer: Descriptor,
}

#[derive(Deserialize)]
struct AnswerReply {
    answer: Descriptor,
}

#[derive(Deserialize)]
struct ErrorReply {
    error: String,
}

#[derive(Clone)]
pub struct HttpSignalingApi {
    base_url: String,
    http: reqwest::Client,
}

impl HttpSignalingApi {
    /// `base_url` is everything before `/signal`, e.g. `https://host/api`.
    pub fn new(base_url: impl Into<String>) -> Result<Self, ApiError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()?;
        Ok(Self::with_client(base_url, http))
    }

    pub fn with_client(base_url: impl Into<String>, http: reqwest::Client) -> Self {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        Self { base_url, http }
    }

    fn room_url(&self, code: &RoomCode) -> String {
        format!("{}/signal/{}", self.base_url, code)
    }
}

async fn error_for(res: Response) -> ApiError {
    match res.status() {
        StatusCode::NOT_FOUND => ApiError::NotFound,
        StatusCode::CONFLICT => ApiError::Conflict,
        StatusCode::TOO_MANY_REQUESTS => ApiError::RateLimited,
        StatusCode::BAD_REQUEST => {
            let reason = match res.json::<ErrorReply>().await {
                Ok(reply) => reply.error,
                Err(_) => "bad request".to_string(),
            };
            ApiError::InvalidInput(reason)
        }
        other => ApiError::Unexpected(other.as_u16()),
    }
}

#[async_trait]
impl SignalingApi for HttpSignalingApi {
    async fn create(&self, offer: &Descriptor) -> Result<RoomCode, ApiError> {
        let res = self
            .http
            .post(format!("{}/signal", self.base_url))
            .json(&json!({ "descriptor": offer }))
            .send()
            .await?;
        match res.status() {
            StatusCode::CREATED | StatusCode::OK => {}
            // the service answers 503 here when it runs out of codes
            StatusCode::SERVICE_UNAVAILABLE => return Err(ApiError::Capacity),
            _ => return Err(error_for(res).await),
        }
        let reply: CreateReply = res.json().await?;
        Ok(reply.code)
    }

    async fn fetch_offer(&self, code: &RoomCode) -> Result<Descriptor, ApiError> {
        let res = self.http.get(self.room_url(code)).send().await?;
        if res.status() != StatusCode::OK {
            return Err(error_for(res).await);
        }
        let reply: OfferReply = res.json().await?;
        Ok(reply.offer)
    }

    async fn submit_answer(&self, code: &RoomCode, answer: &Descriptor) -> Result<(), ApiError> {
        let res = self
            .http
            .post(self.room_url(code))
            .json(&json!({ "descriptor": answer }))
            .send()
            .await?;
        if res.status() != StatusCode::OK {
            return Err(error_for(res).await);
        }
        Ok(())
    }

    async fn fetch_answer(&self, code: &RoomCode) -> Result<AnswerPoll, ApiError> {
        let res = self
            .http
            .get(self.room_url(code))
            .query(&[("answer", "1")])
            .send()
            .await?;
        match res.status() {
            StatusCode::ACCEPTED => Ok(AnswerPoll::Waiting),
            StatusCode::OK => {
                let reply: AnswerReply = res.json().await?;
                Ok(AnswerPoll::Ready(reply.answer))
            }
            _ => Err(error_for(res).await),
        }
    }

    async fn expire(&self, code: &RoomCode) -> Result<(), ApiError> {
        let res = self.http.delete(self.room_url(code)).send().await?;
        if !res.status().is_success() {
            return Err(error_for(res).await);
        }
        Ok(())
    }
}
