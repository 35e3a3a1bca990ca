use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;

use super::{RendezvousStore, StoreError};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Redis behind the Upstash REST API. Each operation is one command array
/// POSTed to the database URL.
#[derive(Clone)]
pub struct UpstashStore {
    base_url: String,
    token: String,
    http: reqwest::Client,
}

#[derive(Deserialize)]
struct Reply {
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<String>,
}

impl UpstashStore {
    pub fn new(base_url: impl Into<String>, token: impl Into<String>) -> Result<Self, StoreError> {
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;
        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token: token.into(),
            http,
        })
    }

    async fn command(&self, args: &[&str]) -> Result<Value, StoreError> {
        let res = self
            .http
            .post(&self.base_url)
            .bearer_auth(&self.token)
            .json(args)
            .send()
            .await
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;
        let status = res.status();
        let reply: Reply = res
            .json()
            .await
            .map_err(|e| StoreError::Unavailable(format!("unreadable reply ({status}): {e}")))?;
        if let Some(error) = reply.error {
            return Err(StoreError::Backend(error));
        }
        if !status.is_success() {
            return Err(StoreError::Backend(format!("status {status}")));
        }
        Ok(reply.result.unwrap_or(Value::Null))
    }
}

fn ttl_secs(ttl: Duration) -> String {
    ttl.as_secs().max(1).to_string()
}

#[async_trait]
impl RendezvousStore for UpstashStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        match self.command(&["GET", key]).await? {
            Value::Null => Ok(None),
            Value::String(s) => Ok(Some(s)),
            // some clients hand back already-decoded JSON
            other => Ok(Some(other.to_string())),
        }
    }

    async fn put(&self, key: &str, value: String, ttl: Duration) -> Result<(), StoreError> {
        let ttl = ttl_secs(ttl);
        self.command(&["SET", key, &value, "EX", &ttl]).await?;
        Ok(())
    }

    async fn put_if_absent(
        &self,
        key: &str,
        value: String,
        ttl: Duration,
    ) -> Result<bool, StoreError> {
        let ttl = ttl_secs(ttl);
        let reply = self
            .command(&["SET", key, &value, "EX", &ttl, "NX"])
            .await?;
        Ok(!reply.is_null())
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        self.command(&["DEL", key]).await?;
        Ok(())
    }
}
