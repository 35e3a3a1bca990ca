pub mod config;
pub mod error;
pub mod limit;
pub mod rooms;
pub mod store;

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::rejection::JsonRejection;
use axum::extract::{ConnectInfo, Path, Query, Request, State};
use axum::http::{HeaderMap, HeaderValue, Method, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::json;
use signal_core::{Descriptor, RoomCode};
use tracing::warn;

use crate::config::ServerConfig;
use crate::limit::{RateLimit, RateLimiter};
use crate::rooms::{now_ms, AnswerPoll, SignalConfig, SignalService};
use crate::store::{MemoryStore, RendezvousStore};

pub use crate::error::ApiError;

#[derive(Clone)]
pub struct AppState {
    signals: SignalService,
    create_limiter: RateLimiter,
    poll_limiter: RateLimiter,
}

impl Default for AppState {
    fn default() -> Self {
        Self::new(Arc::new(MemoryStore::new()), &ServerConfig::default())
    }
}

impl AppState {
    pub fn new(store: Arc<dyn RendezvousStore>, config: &ServerConfig) -> Self {
        Self::with_service(
            SignalService::new(store, config.signal.clone()),
            config.create_limit,
            config.poll_limit,
        )
    }

    pub fn with_service(signals: SignalService, create_limit: RateLimit, poll_limit: RateLimit) -> Self {
        Self {
            signals,
            create_limiter: RateLimiter::new(create_limit),
            poll_limiter: RateLimiter::new(poll_limit),
        }
    }

    pub fn in_memory(store: MemoryStore, signal: SignalConfig) -> Self {
        let config = ServerConfig {
            signal,
            ..ServerConfig::default()
        };
        Self::new(Arc::new(store), &config)
    }

    pub fn signals(&self) -> &SignalService {
        &self.signals
    }

    pub fn sweep_limiters(&self) -> usize {
        self.create_limiter.sweep() + self.poll_limiter.sweep()
    }
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/signal", post(create_room))
        .route(
            "/signal/:code",
            get(get_signal).post(submit_answer).delete(expire_room),
        )
        .route("/health", get(health))
        .layer(middleware::from_fn(cors))
        .with_state(state)
}

async fn cors(request: Request, next: Next) -> Response {
    if request.method() == Method::OPTIONS {
        return (
            StatusCode::NO_CONTENT,
            [
                ("access-control-allow-origin", "*"),
                ("access-control-allow-methods", "GET, POST, DELETE, OPTIONS"),
                ("access-control-allow-headers", "content-type"),
                ("access-control-max-age", "86400"),
            ],
        )
            .into_response();
    }
    let mut response = next.run(request).await;
    response
        .headers_mut()
        .insert("access-control-allow-origin", HeaderValue::from_static("*"));
    response
}

/// First `x-forwarded-for` hop when behind a proxy, else the socket peer.
fn client_id(headers: &HeaderMap, peer: Option<&ConnectInfo<SocketAddr>>) -> String {
    headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .or_else(|| peer.map(|ConnectInfo(addr)| addr.ip().to_string()))
        .unwrap_or_else(|| "anonymous".to_string())
}

fn admit(limiter: &RateLimiter, client: &str, bucket: &'static str) -> Result<(), ApiError> {
    if limiter.try_acquire(client) {
        Ok(())
    } else {
        warn!(client, bucket, "rate limit exceeded");
        Err(ApiError::RateLimited)
    }
}

#[derive(Deserialize)]
struct DescriptorRequest {
    #[serde(default, alias = "sdp")]
    descriptor: Option<String>,
}

impl DescriptorRequest {
    fn into_descriptor(self) -> Result<Descriptor, ApiError> {
        Ok(Descriptor::new(self.descriptor.unwrap_or_default())?)
    }
}

fn json_payload(
    payload: Result<Json<DescriptorRequest>, JsonRejection>,
) -> Result<Descriptor, ApiError> {
    let Json(body) = payload.map_err(|e| ApiError::InvalidInput(e.body_text()))?;
    body.into_descriptor()
}

#[derive(Serialize)]
struct CreateResponse {
    code: RoomCode,
}

#[derive(Deserialize)]
struct SignalQuery {
    answer: Option<String>,
}

async fn create_room(
    State(state): State<AppState>,
    headers: HeaderMap,
    peer: Option<ConnectInfo<SocketAddr>>,
    payload: Result<Json<DescriptorRequest>, JsonRejection>,
) -> Result<Response, ApiError> {
    let client = client_id(&headers, peer.as_ref());
    admit(&state.create_limiter, &client, "create")?;
    let offer = json_payload(payload)?;
    let code = state.signals.create(offer).await?;
    Ok((StatusCode::CREATED, Json(CreateResponse { code })).into_response())
}

async fn get_signal(
    State(state): State<AppState>,
    Path(code): Path<String>,
    Query(query): Query<SignalQuery>,
    headers: HeaderMap,
    peer: Option<ConnectInfo<SocketAddr>>,
) -> Result<Response, ApiError> {
    let client = client_id(&headers, peer.as_ref());
    admit(&state.poll_limiter, &client, "poll")?;
    let code = RoomCode::parse(&code)?;

    if query.answer.is_some() {
        return match state.signals.fetch_answer(&code).await? {
            AnswerPoll::Waiting => {
                Ok((StatusCode::ACCEPTED, Json(json!({ "waiting": true }))).into_response())
            }
            AnswerPoll::Answer(answer) => {
                Ok((StatusCode::OK, Json(json!({ "answer": answer }))).into_response())
            }
        };
    }

    let offer = state.signals.fetch_offer(&code).await?;
    Ok((StatusCode::OK, Json(json!({ "offer": offer }))).into_response())
}

async fn submit_answer(
    State(state): State<AppState>,
    Path(code): Path<String>,
    headers: HeaderMap,
    peer: Option<ConnectInfo<SocketAddr>>,
    payload: Result<Json<DescriptorRequest>, JsonRejection>,
) -> Result<Response, ApiError> {
    let client = client_id(&headers, peer.as_ref());
    admit(&state.poll_limiter, &client, "poll")?;
    let code = RoomCode::parse(&code)?;
    let answer = json_payload(payload)?;
    state.signals.submit_answer(&code, answer).await?;
    Ok((StatusCode::OK, Json(json!({ "success": true }))).into_response())
}

async fn expire_room(
    State(state): State<AppState>,
    Path(code): Path<String>,
    headers: HeaderMap,
    peer: Option<ConnectInfo<SocketAddr>>,
) -> Result<Response, ApiError> {
    let client = client_id(&headers, peer.as_ref());
    admit(&state.poll_limiter, &client, "poll")?;
    let code = RoomCode::parse(&code)?;
    state.signals.expire(&code).await?;
    Ok(StatusCode::NO_CONTENT.into_response())
}

async fn health() -> impl IntoResponse {
    Json(json!({ "ok": true, "time": now_ms() }))
}
