//! Contracts for the chain-state and transaction-pool collaborators.
//!
//! The engine never writes to either collaborator. Both are shared and
//! read-mostly, and are expected to provide their own internal consistency.

use alloy::{
    consensus::Header,
    eips::BlockNumberOrTag,
    primitives::{Address, B256},
    rpc::types::Log,
};
use std::{future::Future, time::Instant};

/// Error from a chain-state or pool query.
#[derive(Debug, thiserror::Error)]
pub enum UpstreamError {
    /// The node has not synchronized far enough to answer.
    #[error("node is not synchronized to block {0}")]
    NotSynchronized(BlockNumberOrTag),
    /// The backend failed.
    #[error("{0}")]
    Backend(Box<dyn core::error::Error + Send + Sync>),
}

impl UpstreamError {
    /// Wrap a backend error.
    pub fn backend(err: impl Into<Box<dyn core::error::Error + Send + Sync>>) -> Self {
        Self::Backend(err.into())
    }
}

/// Block selection for a log query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogRange {
    /// Logs of the block with this hash.
    AtBlockHash(B256),
    /// Logs of the blocks in `from..=to`.
    Blocks {
        /// First block, inclusive.
        from: u64,
        /// Last block, inclusive.
        to: u64,
    },
}

/// A log query issued to [`ChainState::logs`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogQuery {
    /// Blocks to search.
    pub range: LogRange,
    /// Acceptable emitters. Empty matches any address.
    pub addresses: Vec<Address>,
    /// Topic slots. Backends may ignore these; the engine re-applies them.
    pub topics: Vec<Vec<B256>>,
    /// Only return logs from blocks at or above this number. Set on
    /// follow-up polls so that history is not rescanned.
    pub since: Option<u64>,
}

impl LogQuery {
    /// True if a log in block `number` is inside the range and the `since`
    /// bound. Hash ranges are not checked.
    pub fn covers_block(&self, number: u64) -> bool {
        let in_range = match self.range {
            LogRange::AtBlockHash(_) => true,
            LogRange::Blocks { from, to } => (from..=to).contains(&number),
        };
        in_range && self.since.is_none_or(|since| number >= since)
    }
}

/// Read access to canonical chain state.
pub trait ChainState: Send + Sync + 'static {
    /// Number of the most recent durable block.
    fn latest_block_number(&self) -> u64;

    /// Resolve a block tag or number to a concrete block number.
    ///
    /// Fails with [`UpstreamError::NotSynchronized`] if the node cannot yet
    /// answer for the requested tag.
    fn resolve_block_number(
        &self,
        block: BlockNumberOrTag,
    ) -> impl Future<Output = Result<u64, UpstreamError>> + Send;

    /// Hashes of the blocks in `from..=to`, in ascending block order.
    fn block_hashes_in_range(
        &self,
        from: u64,
        to: u64,
    ) -> impl Future<Output = Result<Vec<B256>, UpstreamError>> + Send;

    /// Logs matching the query's range, `since` bound and addresses, in
    /// chain order. Topic predicates are optional for implementors.
    fn logs(&self, query: LogQuery) -> impl Future<Output = Result<Vec<Log>, UpstreamError>> + Send;
}

/// Read access to the pending transaction pool.
pub trait TxPool: Send + Sync + 'static {
    /// Hashes of transactions that entered the pool after `since`.
    fn pending_tx_hashes_since(
        &self,
        since: Instant,
    ) -> impl Future<Output = Result<Vec<B256>, UpstreamError>> + Send;
}

/// A newly ingested, durable block and the logs emitted while executing it.
///
/// Events for a chain arrive in strictly increasing block order, exactly
/// once each.
#[derive(Debug, Clone)]
pub struct NewBlockEvent {
    /// The block header.
    pub header: Header,
    /// The block hash.
    pub hash: B256,
    /// Logs emitted by the block, in execution order.
    pub logs: Vec<Log>,
}

impl NewBlockEvent {
    /// Create an event, computing the block hash from the header. Logs
    /// without block context are stamped with this block's number and hash.
    pub fn new(header: Header, mut logs: Vec<Log>) -> Self {
        let hash = header.hash_slow();
        for log in &mut logs {
            log.block_number.get_or_insert(header.number);
            log.block_hash.get_or_insert(hash);
        }
        Self { header, hash, logs }
    }

    /// The block number.
    pub const fn number(&self) -> u64 {
        self.header.number
    }

    /// The header in RPC form, without transactions or receipts.
    pub fn rpc_header(&self) -> alloy::rpc::types::Header {
        alloy::rpc::types::Header {
            hash: self.hash,
            inner: self.header.clone(),
            total_difficulty: None,
            size: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn query_coverage() {
        let mut query = LogQuery {
            range: LogRange::Blocks { from: 3, to: 8 },
            addresses: vec![],
            topics: vec![],
            since: None,
        };
        assert!(!query.covers_block(2));
        assert!(query.covers_block(3));
        assert!(query.covers_block(8));
        assert!(!query.covers_block(9));

        query.since = Some(5);
        assert!(!query.covers_block(4));
        assert!(query.covers_block(5));

        query.range = LogRange::AtBlockHash(B256::ZERO);
        assert!(query.covers_block(100));
        assert!(!query.covers_block(1));
    }

    #[test]
    fn event_hash_matches_header() {
        let header = Header { number: 5, ..Default::default() };
        let event = NewBlockEvent::new(header.clone(), vec![]);
        assert_eq!(event.hash, header.hash_slow());
        assert_eq!(event.number(), 5);
        assert_eq!(event.rpc_header().hash, event.hash);
    }
}
