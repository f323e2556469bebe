//! OriginId: identity of one process (one "tab") on the cross-process channel.
//!
//! Wraps a random u64 but displays as a 16-character hex string, so ids stay
//! short in logs and in the serialized channel messages.

use std::fmt::{self, Display, Formatter};
use std::str::FromStr;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum OriginIdError {
    #[error("Invalid origin ID format: expected 16 hex chars")]
    InvalidFormat,
    #[error("Invalid hex: {0}")]
    InvalidHex(#[from] std::num::ParseIntError),
}

/// Identifier of the process that wrote a cross-process message.
///
/// Receivers compare it against their own to drop self-echoes, and leader
/// election uses it as the tie-breaker between simultaneous claims.
///
/// # Examples
/// ```
/// use replica_core::OriginId;
///
/// let parsed: OriginId = "a1b2c3d4e5f67890".parse().unwrap();
/// assert_eq!(parsed.to_string(), "a1b2c3d4e5f67890");
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct OriginId(u64);

impl OriginId {
    /// Generate a new random origin ID. Never returns zero.
    pub fn generate() -> Self {
        use rand::Rng;
        loop {
            let id: u64 = rand::rng().random();
            if id != 0 {
                return Self(id);
            }
        }
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl Display for OriginId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

impl FromStr for OriginId {
    type Err = OriginIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.len() == 16 && s.chars().all(|c| c.is_ascii_hexdigit()) {
            let id = u64::from_str_radix(&s.to_ascii_lowercase(), 16)?;
            return Ok(Self(id));
        }
        Err(OriginIdError::InvalidFormat)
    }
}

impl From<u64> for OriginId {
    fn from(id: u64) -> Self {
        Self(id)
    }
}

// Serialize as hex string, same form as in logs
impl serde::Serialize for OriginId {
    fn serialize<S: serde::Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&self.to_string())
    }
}

impl<'de> serde::Deserialize<'de> for OriginId {
    fn deserialize<D: serde::Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
        let s = String::deserialize(d)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}
