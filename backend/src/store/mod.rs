//! Key-value storage with per-key expiry, shared by everything that needs a
//! rendezvous point. Values are opaque strings; typing happens one layer up
//! in [`crate::rooms::RoomRepository`].

mod memory;
mod upstash;

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

pub use memory::MemoryStore;
pub use upstash::UpstashStore;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("store replied with an error: {0}")]
    Backend(String),
    #[error("stored value is corrupt: {0}")]
    Corrupt(#[from] serde_json::Error),
}

#[async_trait]
pub trait RendezvousStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError>;

    async fn put(&self, key: &str, value: String, ttl: Duration) -> Result<(), StoreError>;

    /// Writes only if no live entry exists. Returns whether it wrote.
    async fn put_if_absent(
        &self,
        key: &str,
        value: String,
        ttl: Duration,
    ) -> Result<bool, StoreError>;

    async fn delete(&self, key: &str) -> Result<(), StoreError>;
}
