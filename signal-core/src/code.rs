use std::fmt;

use rand::Rng;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::CoreError;

/// Characters a room code may contain. Excludes `0`, `1`, `i`, `l` and `o`,
/// which are easy to misread when a code is typed or read aloud.
pub const ALPHABET: &[u8] = b"abcdefghjkmnpqrstuvwxyz23456789";

pub const CODE_LEN: usize = 4;

/// Short shareable key addressing one signaling record.
///
/// Always held in canonical lowercase form; every way of building one goes
/// through [`RoomCode::parse`] or [`RoomCode::generate`].
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RoomCode(String);

impl RoomCode {
    pub fn parse(input: &str) -> Result<Self, CoreError> {
        let normalized = input.trim().to_ascii_lowercase();
        if normalized.is_empty() {
            return Err(CoreError::MissingCode);
        }
        if normalized.len() != CODE_LEN || !normalized.bytes().all(|b| ALPHABET.contains(&b)) {
            return Err(CoreError::InvalidCode(input.trim().to_string()));
        }
        Ok(Self(normalized))
    }

    /// Accepts a bare code or a shared link / QR payload carrying one:
    /// `…?code=ab2k`, `…#ab2k` or `…/join/ab2k`.
    pub fn parse_shared(input: &str) -> Result<Self, CoreError> {
        let trimmed = input.trim();
        if let Some((_, query)) = trimmed.split_once('?') {
            if let Some(value) = query
                .split(['&', '#'])
                .find_map(|pair| pair.strip_prefix("code="))
            {
                return Self::parse(value);
            }
        }
        let tail = trimmed.rsplit(['/', '#']).next().unwrap_or(trimmed);
        Self::parse(tail)
    }

    pub fn generate<R: Rng + ?Sized>(rng: &mut R) -> Self {
        let code = (0..CODE_LEN)
            .map(|_| ALPHABET[rng.gen_range(0..ALPHABET.len())] as char)
            .collect();
        Self(code)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RoomCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl Serialize for RoomCode {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.0)
    }
}

impl<'de> Deserialize<'de> for RoomCode {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        RoomCode::parse(&raw).map_err(serde::de::Error::custom)
    }
}
