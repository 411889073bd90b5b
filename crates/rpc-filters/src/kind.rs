//! Filter kinds for subscriptions and polling filters.

use crate::spec::LogFilterSpec;
use alloy::primitives::U64;
use serde::{Deserialize, Serialize};

/// Opaque filter identifier.
///
/// Serialized as a hex quantity string, e.g. `"0x1"`. Clients must treat it
/// as opaque.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FilterId(U64);

impl FilterId {
    /// Get the underlying quantity.
    pub const fn as_u64(&self) -> U64 {
        self.0
    }
}

impl From<U64> for FilterId {
    fn from(id: U64) -> Self {
        Self(id)
    }
}

impl From<u64> for FilterId {
    fn from(id: u64) -> Self {
        Self(U64::from(id))
    }
}

impl core::fmt::Display for FilterId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{:#x}", self.0.to::<u64>())
    }
}

/// The different kinds of filters that can be registered.
///
/// Pending tx filters are representable so that stores and polls handle
/// them exhaustively, but the engine refuses to register them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FilterKind {
    /// New-block filter.
    Block,
    /// Log filter with a user-supplied [`LogFilterSpec`].
    Log(Box<LogFilterSpec>),
    /// Pending transaction filter.
    PendingTx,
}

impl FilterKind {
    /// True if this is a block filter.
    pub const fn is_block(&self) -> bool {
        matches!(self, Self::Block)
    }

    /// True if this is a log filter.
    pub const fn is_log(&self) -> bool {
        matches!(self, Self::Log(_))
    }

    /// Fallible cast to a log filter spec.
    pub fn as_log(&self) -> Option<&LogFilterSpec> {
        match self {
            Self::Log(spec) => Some(spec),
            _ => None,
        }
    }

    /// Short name of the kind, used in logs and metric labels.
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Block => "block",
            Self::Log(_) => "log",
            Self::PendingTx => "pending_tx",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn id_is_a_hex_quantity() {
        let id = FilterId::from(26u64);
        assert_eq!(id.to_string(), "0x1a");
        assert_eq!(serde_json::to_value(id).unwrap(), serde_json::json!("0x1a"));

        let back: FilterId = serde_json::from_value(serde_json::json!("0x1a")).unwrap();
        assert_eq!(back, id);
    }

    #[test]
    fn kind_casts() {
        let log = FilterKind::Log(Box::default());
        assert!(log.is_log());
        assert!(log.as_log().is_some());
        assert_eq!(log.name(), "log");

        assert!(FilterKind::Block.is_block());
        assert!(FilterKind::Block.as_log().is_none());
        assert!(FilterKind::PendingTx.as_log().is_none());
    }
}
