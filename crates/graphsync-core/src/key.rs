//! Mapping between local node identifiers and shared-map keys.
//!
//! A [`NodeId`] maps to its canonical decimal rendering: ASCII digits, no
//! sign, no leading zeros (except `"0"` itself). The mapping is total on
//! node IDs and [`NodeId::from_key`] inverts it exactly on that image; every
//! other string is rejected, so two distinct keys never name the same node.
//!
//! The collision domain is the replica: IDs are allocated per replica, and
//! two replicas creating nodes concurrently may pick the same ID.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifier of a node in the local graph model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct NodeId(pub u64);

impl NodeId {
    /// The shared-map key for this node.
    #[must_use]
    pub fn to_key(self) -> String {
        self.0.to_string()
    }

    /// Parse a shared-map key back into a node ID.
    ///
    /// # Errors
    ///
    /// Returns an error if `key` is not the canonical rendering of a `u64`.
    pub fn from_key(key: &str) -> Result<Self, KeyError> {
        if key.is_empty() {
            return Err(KeyError::Empty);
        }
        if !key.bytes().all(|b| b.is_ascii_digit()) || (key.len() > 1 && key.starts_with('0')) {
            return Err(KeyError::NotCanonical(key.to_string()));
        }
        key.parse::<u64>()
            .map(NodeId)
            .map_err(|_| KeyError::OutOfRange(key.to_string()))
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Errors from parsing a shared-map key.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum KeyError {
    /// The key was empty
    #[error("empty node key")]
    Empty,
    /// The key is not a canonical decimal integer
    #[error("not a canonical node key: {0:?}")]
    NotCanonical(String),
    /// The key does not fit a node ID
    #[error("node key out of range: {0}")]
    OutOfRange(String),
}
