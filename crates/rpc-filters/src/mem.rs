//! In-memory [`ChainState`] and [`TxPool`] implementations.
//!
//! These keep every block and log in memory and are suited to tests and
//! local development.

use crate::chain::{ChainState, LogQuery, LogRange, NewBlockEvent, TxPool, UpstreamError};
use alloy::{eips::BlockNumberOrTag, primitives::B256, rpc::types::Log};
use std::{
    collections::BTreeMap,
    sync::{
        Arc, RwLock,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    time::Instant,
};

#[derive(Debug)]
struct MemBlock {
    hash: B256,
    logs: Vec<Log>,
}

/// In-memory chain state, fed by [`MemChainState::append`].
///
/// `latest` follows the highest appended block. `safe` and `finalized`
/// start at zero and move only through [`MemChainState::set_checkpoints`].
/// Symbolic tags other than `earliest` do not resolve until the first
/// block is appended. Explicit numbers above the latest block do not
/// resolve either.
#[derive(Debug, Clone, Default)]
pub struct MemChainState {
    blocks: Arc<RwLock<BTreeMap<u64, MemBlock>>>,
    latest: Arc<AtomicU64>,
    safe: Arc<AtomicU64>,
    finalized: Arc<AtomicU64>,
    offline: Arc<AtomicBool>,
}

impl MemChainState {
    /// Create an empty chain.
    pub fn new() -> Self {
        Self::default()
    }

    /// Move the `safe` and `finalized` tags.
    pub fn set_checkpoints(&self, safe: u64, finalized: u64) {
        self.finalized.store(finalized, Ordering::Release);
        self.safe.store(safe, Ordering::Release);
    }

    /// Store a block and its logs, and advance `latest` to it.
    ///
    /// Logs without block context are stamped with the block's number and
    /// hash.
    pub fn append(&self, event: &NewBlockEvent) {
        let number = event.number();
        let logs = event
            .logs
            .iter()
            .cloned()
            .map(|mut log| {
                log.block_number.get_or_insert(number);
                log.block_hash.get_or_insert(event.hash);
                log
            })
            .collect();

        self.blocks
            .write()
            .expect("chain lock poisoned")
            .insert(number, MemBlock { hash: event.hash, logs });
        self.latest.store(number, Ordering::Release);
    }

    /// Make every query fail with a backend error until set back to
    /// `false`. Tag resolution and [`ChainState::latest_block_number`] are
    /// unaffected.
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::Release);
    }

    fn check_online(&self) -> Result<(), UpstreamError> {
        if self.offline.load(Ordering::Acquire) {
            return Err(UpstreamError::backend("chain state offline"));
        }
        Ok(())
    }

    fn is_empty(&self) -> bool {
        self.blocks.read().expect("chain lock poisoned").is_empty()
    }
}

impl ChainState for MemChainState {
    fn latest_block_number(&self) -> u64 {
        self.latest.load(Ordering::Acquire)
    }

    async fn resolve_block_number(&self, block: BlockNumberOrTag) -> Result<u64, UpstreamError> {
        let latest = self.latest_block_number();
        match block {
            BlockNumberOrTag::Earliest => Ok(0),
            BlockNumberOrTag::Number(n) if n <= latest => Ok(n),
            BlockNumberOrTag::Number(_) => Err(UpstreamError::NotSynchronized(block)),
            _ if self.is_empty() => Err(UpstreamError::NotSynchronized(block)),
            BlockNumberOrTag::Latest | BlockNumberOrTag::Pending => Ok(latest),
            BlockNumberOrTag::Safe => Ok(self.safe.load(Ordering::Acquire)),
            BlockNumberOrTag::Finalized => Ok(self.finalized.load(Ordering::Acquire)),
        }
    }

    async fn block_hashes_in_range(&self, from: u64, to: u64) -> Result<Vec<B256>, UpstreamError> {
        self.check_online()?;
        if from > to {
            return Ok(Vec::new());
        }
        let blocks = self.blocks.read().expect("chain lock poisoned");
        Ok(blocks.range(from..=to).map(|(_, block)| block.hash).collect())
    }

    async fn logs(&self, query: LogQuery) -> Result<Vec<Log>, UpstreamError> {
        self.check_online()?;
        let blocks = self.blocks.read().expect("chain lock poisoned");

        let selected: Vec<(u64, &MemBlock)> = match query.range {
            LogRange::AtBlockHash(hash) => {
                blocks.iter().filter(|(_, b)| b.hash == hash).map(|(n, b)| (*n, b)).collect()
            }
            LogRange::Blocks { from, to } if from <= to => {
                blocks.range(from..=to).map(|(n, b)| (*n, b)).collect()
            }
            LogRange::Blocks { .. } => Vec::new(),
        };

        Ok(selected
            .into_iter()
            .filter(|(number, _)| query.covers_block(*number))
            .flat_map(|(_, block)| block.logs.iter())
            .filter(|log| query.addresses.is_empty() || query.addresses.contains(&log.inner.address))
            .cloned()
            .collect())
    }
}

/// In-memory pending transaction pool.
#[derive(Debug, Clone, Default)]
pub struct MemTxPool {
    txs: Arc<RwLock<Vec<(Instant, B256)>>>,
}

impl MemTxPool {
    /// Create an empty pool.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a transaction entering the pool now.
    pub fn add(&self, hash: B256) {
        self.txs.write().expect("pool lock poisoned").push((Instant::now(), hash));
    }
}

impl TxPool for MemTxPool {
    async fn pending_tx_hashes_since(&self, since: Instant) -> Result<Vec<B256>, UpstreamError> {
        let txs = self.txs.read().expect("pool lock poisoned");
        Ok(txs.iter().filter(|(at, _)| *at >= since).map(|(_, hash)| *hash).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy::{
        consensus::Header,
        primitives::{Address, Bytes, LogData},
    };
    use std::time::Duration;

    fn log(address: Address) -> Log {
        Log {
            inner: alloy::primitives::Log {
                address,
                data: LogData::new_unchecked(vec![], Bytes::new()),
            },
            block_hash: None,
            block_number: None,
            block_timestamp: None,
            transaction_hash: None,
            transaction_index: None,
            log_index: None,
            removed: false,
        }
    }

    fn block(number: u64, logs: Vec<Log>) -> NewBlockEvent {
        NewBlockEvent::new(Header { number, ..Default::default() }, logs)
    }

    #[tokio::test]
    async fn tags_require_blocks() {
        let chain = MemChainState::new();
        assert!(matches!(
            chain.resolve_block_number(BlockNumberOrTag::Latest).await,
            Err(UpstreamError::NotSynchronized(BlockNumberOrTag::Latest))
        ));
        assert_eq!(chain.resolve_block_number(BlockNumberOrTag::Earliest).await.unwrap(), 0);

        chain.append(&block(1, vec![]));
        chain.set_checkpoints(1, 0);
        assert_eq!(chain.resolve_block_number(BlockNumberOrTag::Latest).await.unwrap(), 1);
        assert_eq!(chain.resolve_block_number(BlockNumberOrTag::Finalized).await.unwrap(), 0);
        assert!(chain.resolve_block_number(BlockNumberOrTag::Number(2)).await.is_err());
    }

    #[tokio::test]
    async fn logs_are_stamped_and_ranged() {
        let chain = MemChainState::new();
        let a = Address::repeat_byte(0xaa);
        let b = Address::repeat_byte(0xbb);
        let first = block(1, vec![log(a), log(b)]);
        let second = block(2, vec![log(a)]);
        chain.append(&first);
        chain.append(&second);

        let query = LogQuery {
            range: LogRange::Blocks { from: 0, to: 2 },
            addresses: vec![a],
            topics: vec![],
            since: None,
        };
        let logs = chain.logs(query.clone()).await.unwrap();
        assert_eq!(logs.len(), 2);
        assert_eq!(logs[0].block_number, Some(1));
        assert_eq!(logs[0].block_hash, Some(first.hash));
        assert_eq!(logs[1].block_number, Some(2));

        let logs = chain.logs(LogQuery { since: Some(2), ..query.clone() }).await.unwrap();
        assert_eq!(logs.len(), 1);

        let logs = chain
            .logs(LogQuery { range: LogRange::AtBlockHash(first.hash), addresses: vec![], ..query })
            .await
            .unwrap();
        assert_eq!(logs.len(), 2);

        assert_eq!(chain.block_hashes_in_range(1, 5).await.unwrap(), vec![first.hash, second.hash]);
    }

    #[tokio::test]
    async fn offline_queries_fail() {
        let chain = MemChainState::new();
        chain.append(&block(1, vec![]));
        chain.set_offline(true);
        assert!(chain.block_hashes_in_range(0, 1).await.is_err());
        chain.set_offline(false);
        assert!(chain.block_hashes_in_range(0, 1).await.is_ok());
    }

    #[tokio::test]
    async fn pool_since() {
        let pool = MemTxPool::new();
        let before = Instant::now();
        pool.add(B256::repeat_byte(1));
        assert_eq!(pool.pending_tx_hashes_since(before).await.unwrap(), vec![B256::repeat_byte(1)]);
        let later = Instant::now() + Duration::from_millis(5);
        assert!(pool.pending_tx_hashes_since(later).await.unwrap().is_empty());
    }
}
