use serde::{Deserialize, Deserializer, Serialize};

use crate::CoreError;

/// Upper bound on a serialized descriptor.
pub const MAX_DESCRIPTOR_BYTES: usize = 50 * 1024;

/// Opaque connection parameters produced by one side's transport.
///
/// The signaling layer never looks inside; it only enforces that a
/// descriptor is present and bounded in size.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct Descriptor(String);

impl Descriptor {
    pub fn new(raw: impl Into<String>) -> Result<Self, CoreError> {
        let raw = raw.into();
        if raw.trim().is_empty() {
            return Err(CoreError::MissingDescriptor);
        }
        if raw.len() > MAX_DESCRIPTOR_BYTES {
            return Err(CoreError::DescriptorTooLarge {
                size: raw.len(),
                max: MAX_DESCRIPTOR_BYTES,
            });
        }
        Ok(Self(raw))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_inner(self) -> String {
        self.0
    }
}

impl<'de> Deserialize<'de> for Descriptor {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Descriptor::new(raw).map_err(serde::de::Error::custom)
    }
}
