//! Identifier types used across the connector and the edge protocol.

use crate::define_id;
use crate::IdError;

define_id!(
    /// Identifies a named tunnel. All HA connections of one connector
    /// register against the same tunnel.
    TunnelId,
    "tun"
);

define_id!(
    /// Identity of one running connector process, assigned by the edge when
    /// the first connection registers. Immutable afterwards.
    ConnectorId,
    "ctr"
);

/// Position of an HA connection within a connector (0-based).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ConnIndex(u8);

impl ConnIndex {
    /// Upper bound on HA connections per connector.
    pub const MAX_CONNECTIONS: usize = 16;

    /// Creates an index, rejecting values at or above [`Self::MAX_CONNECTIONS`].
    pub fn new(index: usize) -> Result<Self, IdError> {
        if index >= Self::MAX_CONNECTIONS {
            return Err(IdError::InvalidIndex(format!(
                "{index} exceeds the maximum of {} connections",
                Self::MAX_CONNECTIONS
            )));
        }
        Ok(Self(index as u8))
    }

    /// Returns the index as a `usize`.
    #[must_use]
    pub const fn get(&self) -> usize {
        self.0 as usize
    }

    /// Iterates over the first `count` indexes, clamped to the maximum.
    pub fn range(count: usize) -> impl Iterator<Item = ConnIndex> {
        (0..count.min(Self::MAX_CONNECTIONS)).map(|i| Self(i as u8))
    }
}

impl std::fmt::Display for ConnIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl serde::Serialize for ConnIndex {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_u8(self.0)
    }
}

impl<'de> serde::Deserialize<'de> for ConnIndex {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let raw = u8::deserialize(deserializer)?;
        Self::new(raw as usize).map_err(serde::de::Error::custom)
    }
}
