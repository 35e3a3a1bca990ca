use std::env;
use std::net::SocketAddr;
use std::time::Duration;

use thiserror::Error;

use crate::limit::RateLimit;
use crate::rooms::SignalConfig;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{name} must be {expected}, got {value:?}")]
    Invalid {
        name: &'static str,
        expected: &'static str,
        value: String,
    },
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UpstashConfig {
    pub url: String,
    pub token: String,
}

#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub bind_addr: SocketAddr,
    /// `None` selects the in-memory store.
    pub upstash: Option<UpstashConfig>,
    pub signal: SignalConfig,
    pub create_limit: RateLimit,
    pub poll_limit: RateLimit,
    pub sweep_interval: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 3000)),
            upstash: None,
            signal: SignalConfig::default(),
            create_limit: RateLimit::per_minute(20),
            poll_limit: RateLimit::per_minute(60),
            sweep_interval: Duration::from_secs(60),
        }
    }
}

impl ServerConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| env::var(name).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(raw) = lookup("BIND_ADDR") {
            config.bind_addr = raw.parse().map_err(|_| ConfigError::Invalid {
                name: "BIND_ADDR",
                expected: "a socket address",
                value: raw.clone(),
            })?;
        }

        let url = lookup("UPSTASH_REDIS_REST_URL").filter(|v| !v.trim().is_empty());
        let token = lookup("UPSTASH_REDIS_REST_TOKEN").filter(|v| !v.trim().is_empty());
        if let (Some(url), Some(token)) = (url, token) {
            config.upstash = Some(UpstashConfig { url, token });
        }

        if let Some(secs) = parse_u64(&lookup, "SIGNAL_TTL_SECS")? {
            config.signal.ttl = Duration::from_secs(secs);
        }
        if let Some(n) = parse_u64(&lookup, "CREATE_LIMIT_PER_MIN")? {
            config.create_limit = RateLimit::per_minute(n as u32);
        }
        if let Some(n) = parse_u64(&lookup, "POLL_LIMIT_PER_MIN")? {
            config.poll_limit = RateLimit::per_minute(n as u32);
        }
        if let Some(secs) = parse_u64(&lookup, "SWEEP_INTERVAL_SECS")? {
            config.sweep_interval = Duration::from_secs(secs);
        }
        Ok(config)
    }
}

fn parse_u64<F>(lookup: &F, name: &'static str) -> Result<Option<u64>, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    let Some(raw) = lookup(name) else {
        return Ok(None);
    };
    match raw.trim().parse::<u64>() {
        Ok(n) if n > 0 && n <= u32::MAX as u64 => Ok(Some(n)),
        _ => Err(ConfigError::Invalid {
            name,
            expected: "a positive integer",
            value: raw,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| map.get(name).cloned()
    }

    #[test]
    fn defaults_match_observed_values() {
        let config = ServerConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config.bind_addr.port(), 3000);
        assert_eq!(config.upstash, None);
        assert_eq!(config.signal.ttl, Duration::from_secs(900));
        assert_eq!(config.signal.max_code_attempts, 10);
        assert_eq!(config.create_limit, RateLimit::per_minute(20));
        assert_eq!(config.poll_limit, RateLimit::per_minute(60));
    }

    #[test]
    fn upstash_needs_both_url_and_token() {
        let config =
            ServerConfig::from_lookup(lookup(&[("UPSTASH_REDIS_REST_URL", "https://x")])).unwrap();
        assert_eq!(config.upstash, None);

        let config = ServerConfig::from_lookup(lookup(&[
            ("UPSTASH_REDIS_REST_URL", "https://x"),
            ("UPSTASH_REDIS_REST_TOKEN", "t"),
        ]))
        .unwrap();
        assert_eq!(
            config.upstash,
            Some(UpstashConfig {
                url: "https://x".into(),
                token: "t".into()
            })
        );
    }

    #[test]
    fn overrides_and_bad_values() {
        let config = ServerConfig::from_lookup(lookup(&[
            ("BIND_ADDR", "127.0.0.1:8080"),
            ("SIGNAL_TTL_SECS", "300"),
            ("POLL_LIMIT_PER_MIN", "120"),
        ]))
        .unwrap();
        assert_eq!(config.bind_addr.port(), 8080);
        assert_eq!(config.signal.ttl, Duration::from_secs(300));
        assert_eq!(config.poll_limit.max_requests, 120);

        let err = ServerConfig::from_lookup(lookup(&[("SIGNAL_TTL_SECS", "soon")])).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { name: "SIGNAL_TTL_SECS", .. }));
        assert!(ServerConfig::from_lookup(lookup(&[("CREATE_LIMIT_PER_MIN", "0")])).is_err());
    }
}
