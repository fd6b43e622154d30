//! Virtual device identity codec
//!
//! A virtual device ID is the physical GPU UUID followed by a separator and a
//! decimal replica index, e.g. `GPU-8a1f...-_-2`. Decoding splits at the last
//! separator and only accepts a purely numeric suffix, so real IDs that happen
//! to contain the separator still round-trip.

use std::fmt;
use std::str::FromStr;

use thiserror::Error;

/// Separator between the real device ID and the replica index
pub const SEPARATOR: &str = "-_-";

/// Errors produced when strictly parsing a virtual ID
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum IdentityError {
    /// No separator in the input
    #[error("virtual device ID {0:?} has no replica suffix")]
    MissingReplica(String),

    /// Suffix after the last separator is not a replica index
    #[error("virtual device ID {0:?} has an invalid replica suffix")]
    InvalidReplica(String),

    /// Real ID component is empty
    #[error("virtual device ID {0:?} has an empty real device ID")]
    EmptyRealId(String),
}

/// Structured (real ID, replica index) pair behind a virtual device ID
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct VirtualId {
    /// Hardware UUID of the physical device
    pub real_id: String,
    /// Replica index in `[0, factor)`
    pub replica: u32,
}

impl VirtualId {
    pub fn new(real_id: impl Into<String>, replica: u32) -> Self {
        Self {
            real_id: real_id.into(),
            replica,
        }
    }
}

impl fmt::Display for VirtualId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}{}", self.real_id, SEPARATOR, self.replica)
    }
}

impl FromStr for VirtualId {
    type Err = IdentityError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (real_id, replica) = s
            .rsplit_once(SEPARATOR)
            .ok_or_else(|| IdentityError::MissingReplica(s.to_string()))?;

        let replica = parse_replica(replica)
            .ok_or_else(|| IdentityError::InvalidReplica(s.to_string()))?;

        if real_id.is_empty() {
            return Err(IdentityError::EmptyRealId(s.to_string()));
        }

        Ok(Self::new(real_id, replica))
    }
}

/// Encode a physical device ID and replica index into a virtual device ID
pub fn encode(real_id: &str, replica: u32) -> String {
    format!("{}{}{}", real_id, SEPARATOR, replica)
}

/// Recover the physical device ID from a virtual device ID.
///
/// The replica index is discarded. An ID without a valid replica suffix is
/// returned unchanged.
pub fn decode(virtual_id: &str) -> &str {
    match virtual_id.rsplit_once(SEPARATOR) {
        Some((real_id, replica)) if parse_replica(replica).is_some() => real_id,
        _ => virtual_id,
    }
}

// `u32::from_str` accepts a leading '+', which `encode` never produces.
fn parse_replica(s: &str) -> Option<u32> {
    if s.is_empty() || !s.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    s.parse().ok()
}
