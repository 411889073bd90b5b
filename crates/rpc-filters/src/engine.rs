//! The filter engine.

use crate::{
    chain::{ChainState, LogQuery, LogRange, NewBlockEvent, TxPool},
    config::FilterConfig,
    connection::{ConnectionId, SubscriptionSink},
    cursor::PollCursor,
    error::FilterError,
    fanout::{Fanout, FanoutReport},
    kind::{FilterId, FilterKind},
    metrics,
    spec::LogFilterSpec,
    store::{FilterStore, MemFilterStore},
};
use alloy::{eips::BlockNumberOrTag, primitives::B256, rpc::types::Log};
use serde::Serialize;
use std::{sync::Arc, time::Instant};
use tokio::{
    sync::broadcast::{self, error::RecvError},
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, instrument, trace, warn};

/// Output of [`FilterEngine::poll_changes`].
///
/// An empty list is the "no changes" signal. It serializes as `[]`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum FilterChanges {
    /// New block hashes, in ascending block order.
    Blocks(Vec<B256>),
    /// New matching logs, in chain order.
    Logs(Vec<Log>),
    /// New pending transaction hashes.
    PendingTransactions(Vec<B256>),
}

impl FilterChanges {
    /// True if nothing changed since the last poll.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of items.
    pub fn len(&self) -> usize {
        match self {
            Self::Blocks(hashes) | Self::PendingTransactions(hashes) => hashes.len(),
            Self::Logs(logs) => logs.len(),
        }
    }

    /// Fallible cast to block hashes.
    pub fn as_blocks(&self) -> Option<&[B256]> {
        match self {
            Self::Blocks(hashes) => Some(hashes),
            _ => None,
        }
    }

    /// Fallible cast to logs.
    pub fn as_logs(&self) -> Option<&[Log]> {
        match self {
            Self::Logs(logs) => Some(logs),
            _ => None,
        }
    }
}

/// Inner state of the [`FilterEngine`].
struct EngineInner<C, P> {
    chain: C,
    pool: P,
    store: Arc<dyn FilterStore>,
    fanout: Fanout,
    config: FilterConfig,
}

/// Filter and subscription engine.
///
/// Owns no connections and no chain data. Filters live in a
/// [`FilterStore`], chain data is read through [`ChainState`] and
/// [`TxPool`], and push notifications leave through a
/// [`SubscriptionSink`].
///
/// Cloning is cheap. All clones share the same state.
pub struct FilterEngine<C, P> {
    inner: Arc<EngineInner<C, P>>,
}

impl<C, P> Clone for FilterEngine<C, P> {
    fn clone(&self) -> Self {
        Self { inner: Arc::clone(&self.inner) }
    }
}

impl<C, P> core::fmt::Debug for FilterEngine<C, P> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("FilterEngine")
            .field("store", &self.inner.store)
            .field("config", &self.inner.config)
            .finish_non_exhaustive()
    }
}

impl<C, P> FilterEngine<C, P>
where
    C: ChainState,
    P: TxPool,
{
    /// Create an engine over the given collaborators.
    pub fn new(
        chain: C,
        pool: P,
        store: Arc<dyn FilterStore>,
        sink: Arc<dyn SubscriptionSink>,
        config: FilterConfig,
    ) -> Self {
        let fanout = Fanout::new(Arc::clone(&store), sink, config.fanout_workers);
        Self { inner: Arc::new(EngineInner { chain, pool, store, fanout, config }) }
    }

    /// Create an engine backed by a [`MemFilterStore`], and start its
    /// stale-filter cleaner with the configured interval and TTL.
    pub fn in_memory(
        chain: C,
        pool: P,
        sink: Arc<dyn SubscriptionSink>,
        config: FilterConfig,
    ) -> Self {
        let store = MemFilterStore::new();
        store.spawn_cleaner(config.stale_filter_clean_interval, config.stale_filter_ttl);
        Self::new(chain, pool, Arc::new(store), sink, config)
    }

    /// The chain-state collaborator.
    pub fn chain(&self) -> &C {
        &self.inner.chain
    }

    /// The transaction pool collaborator.
    pub fn pool(&self) -> &P {
        &self.inner.pool
    }

    /// The filter store.
    pub fn store(&self) -> &Arc<dyn FilterStore> {
        &self.inner.store
    }

    /// The engine configuration.
    pub fn config(&self) -> &FilterConfig {
        &self.inner.config
    }

    fn install(
        &self,
        kind: FilterKind,
        connection: Option<ConnectionId>,
    ) -> Result<FilterId, FilterError> {
        let name = kind.name();
        let cursor = PollCursor::new(self.inner.chain.latest_block_number());
        let id = self.inner.store.create(kind, connection, cursor)?;
        metrics::inc_filters_installed(name);
        debug!(%id, kind = name, ?connection, "installed filter");
        Ok(id)
    }

    /// Register a new-block filter, optionally bound to a push connection.
    pub fn register_block_filter(
        &self,
        connection: Option<ConnectionId>,
    ) -> Result<FilterId, FilterError> {
        self.install(FilterKind::Block, connection)
    }

    /// Register a log filter, optionally bound to a push connection.
    ///
    /// Fails with [`FilterError::InvalidFilterPayload`] if the filter is
    /// structurally unusable.
    pub fn register_log_filter(
        &self,
        connection: Option<ConnectionId>,
        spec: LogFilterSpec,
    ) -> Result<FilterId, FilterError> {
        spec.validate()?;
        self.install(FilterKind::Log(Box::new(spec)), connection)
    }

    /// Pending transaction filters are not supported. Always fails with
    /// [`FilterError::Unsupported`].
    pub const fn register_pending_tx_filter(
        &self,
        _connection: Option<ConnectionId>,
    ) -> Result<FilterId, FilterError> {
        Err(FilterError::Unsupported("pending transaction filters"))
    }

    /// Remove a filter. Returns `false` if it did not exist.
    pub fn unregister(&self, id: FilterId) -> Result<bool, FilterError> {
        let removed = self.inner.store.delete(id)?;
        if removed {
            metrics::inc_filters_uninstalled(1);
            debug!(%id, "uninstalled filter");
        }
        Ok(removed)
    }

    /// Remove every filter bound to `connection`. Called by the transport
    /// when the connection closes. Returns the number of filters removed.
    pub fn uninstall_by_connection(&self, connection: ConnectionId) -> usize {
        match self.inner.store.delete_by_connection(connection) {
            Ok(removed) => {
                metrics::inc_filters_uninstalled(removed);
                debug!(%connection, removed, "uninstalled filters for closed connection");
                removed
            }
            Err(err) => {
                error!(%connection, %err, "failed to uninstall filters for closed connection");
                0
            }
        }
    }

    /// Remove poll-mode filters not polled within the configured TTL.
    pub fn clean_stale_filters(&self) -> Result<usize, FilterError> {
        let removed = self.inner.store.clean_stale(self.inner.config.stale_filter_ttl)?;
        if removed > 0 {
            metrics::record_stale_removed(removed);
            debug!(removed, "removed stale filters");
        }
        Ok(removed)
    }

    /// Return everything the filter has not yet returned, and advance its
    /// cursor.
    ///
    /// The cursor only advances if every query succeeded. Concurrent polls
    /// of the same filter are serialized.
    #[instrument(skip_all, fields(%id))]
    pub async fn poll_changes(&self, id: FilterId) -> Result<FilterChanges, FilterError> {
        let entry = self.inner.store.get(id)?.ok_or(FilterError::NotFound(id))?;
        let mut cursor = entry.cursor().lock().await;

        // Captured before querying. Anything newer is left for the next poll.
        let latest = self.inner.chain.latest_block_number();
        let started = Instant::now();

        let res = match entry.kind() {
            FilterKind::Block => self.block_changes(&cursor, latest).await,
            FilterKind::Log(spec) => self.log_changes(spec, &cursor, latest).await,
            FilterKind::PendingTx => self
                .inner
                .pool
                .pending_tx_hashes_since(cursor.last_poll())
                .await
                .map(FilterChanges::PendingTransactions)
                .map_err(Into::into),
        };

        match res {
            Ok(changes) => {
                cursor.mark_polled(latest, started);
                metrics::inc_polls(entry.kind().name());
                trace!(cursor = %*cursor, changes = changes.len(), "polled filter");
                Ok(changes)
            }
            Err(err) => {
                metrics::inc_poll_failures();
                debug!(%err, cursor = %*cursor, "filter poll failed, cursor not advanced");
                Err(err)
            }
        }
    }

    async fn block_changes(
        &self,
        cursor: &PollCursor,
        latest: u64,
    ) -> Result<FilterChanges, FilterError> {
        let from = cursor.next_block();
        if from > latest {
            return Ok(FilterChanges::Blocks(Vec::new()));
        }
        let hashes = self.inner.chain.block_hashes_in_range(from, latest).await?;
        Ok(FilterChanges::Blocks(hashes))
    }

    async fn log_changes(
        &self,
        spec: &LogFilterSpec,
        cursor: &PollCursor,
        latest: u64,
    ) -> Result<FilterChanges, FilterError> {
        let since = cursor.next_block();
        if since > latest {
            return Ok(FilterChanges::Logs(Vec::new()));
        }
        let logs = match spec.block_hash {
            Some(hash) => self.query_logs(spec, LogRange::AtBlockHash(hash), Some(since)).await?,
            None => {
                let (from, to) = self.resolve_range(spec, latest).await?;
                let from = from.max(since);
                if from > to {
                    return Ok(FilterChanges::Logs(Vec::new()));
                }
                self.query_logs(spec, LogRange::Blocks { from, to }, Some(since)).await?
            }
        };
        Ok(FilterChanges::Logs(logs))
    }

    /// Return every log matching the filter within its stored range. Does
    /// not read or advance the poll cursor.
    ///
    /// Fails with [`FilterError::KindMismatch`] if the filter is not a log
    /// filter, and with [`FilterError::RangeTooLarge`] if the resolved range
    /// is wider than [`FilterConfig::max_blocks_per_filter`].
    #[instrument(skip_all, fields(%id))]
    pub async fn poll_logs(&self, id: FilterId) -> Result<Vec<Log>, FilterError> {
        let entry = self.inner.store.get(id)?.ok_or(FilterError::NotFound(id))?;
        let spec =
            entry.kind().as_log().ok_or(FilterError::KindMismatch { id, expected: "log" })?;

        let range = match spec.block_hash {
            Some(hash) => LogRange::AtBlockHash(hash),
            None => {
                let latest = self.inner.chain.latest_block_number();
                let (from, to) = self.resolve_range(spec, latest).await?;
                if from > to {
                    return Ok(Vec::new());
                }
                let max = self.inner.config.max_blocks_per_filter;
                if to - from >= max {
                    return Err(FilterError::RangeTooLarge { max });
                }
                LogRange::Blocks { from, to }
            }
        };
        self.query_logs(spec, range, None).await
    }

    /// Resolve the filter's block range, defaulting to `0..=latest`. The
    /// upper bound is clamped to `latest`.
    async fn resolve_range(
        &self,
        spec: &LogFilterSpec,
        latest: u64,
    ) -> Result<(u64, u64), FilterError> {
        let from = self.resolve_bound(spec.from_block, 0).await?;
        let to = self.resolve_bound(spec.to_block, latest).await?;
        Ok((from, to.min(latest)))
    }

    async fn resolve_bound(
        &self,
        block: Option<BlockNumberOrTag>,
        default: u64,
    ) -> Result<u64, FilterError> {
        match block {
            None => Ok(default),
            Some(BlockNumberOrTag::Number(number)) => Ok(number),
            Some(tag) => Ok(self.inner.chain.resolve_block_number(tag).await?),
        }
    }

    /// Query logs and apply the full filter. The chain-state backend is
    /// not required to support topic predicates.
    async fn query_logs(
        &self,
        spec: &LogFilterSpec,
        range: LogRange,
        since: Option<u64>,
    ) -> Result<Vec<Log>, FilterError> {
        let query = LogQuery {
            range,
            addresses: spec.addresses.clone(),
            topics: spec.topics.clone(),
            since,
        };
        let mut logs = self.inner.chain.logs(query).await?;
        logs.retain(|log| spec.matches(log));
        Ok(logs)
    }

    /// Distribute a newly ingested block to every push-mode filter.
    ///
    /// Never fails. Delivery problems are logged and summarized in the
    /// returned report.
    pub async fn on_new_block(&self, event: NewBlockEvent) -> FanoutReport {
        self.inner.fanout.run(&self.inner.chain, Arc::new(event)).await
    }

    /// Spawn a task that calls [`Self::on_new_block`] for every event
    /// received on `blocks`.
    ///
    /// The task exits when the channel closes or `cancel` is triggered. A
    /// lagged receiver logs the number of missed events and carries on.
    pub fn spawn_listener(
        &self,
        mut blocks: broadcast::Receiver<NewBlockEvent>,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let this = self.clone();
        tokio::spawn(async move {
            loop {
                let res = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => {
                        debug!("filter listener cancelled");
                        break;
                    }
                    res = blocks.recv() => res,
                };
                match res {
                    Ok(event) => {
                        this.on_new_block(event).await;
                    }
                    Err(RecvError::Lagged(missed)) => {
                        warn!(missed, "filter listener lagged, push notifications skipped");
                    }
                    Err(RecvError::Closed) => {
                        debug!("block event channel closed, filter listener exiting");
                        break;
                    }
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn changes_serialize_as_plain_arrays() {
        let empty = FilterChanges::Logs(vec![]);
        assert!(empty.is_empty());
        assert_eq!(serde_json::to_value(&empty).unwrap(), serde_json::json!([]));

        let blocks = FilterChanges::Blocks(vec![B256::ZERO]);
        assert_eq!(blocks.len(), 1);
        assert_eq!(blocks.as_blocks(), Some(&[B256::ZERO][..]));
        assert!(blocks.as_logs().is_none());
        assert_eq!(serde_json::to_value(&blocks).unwrap(), serde_json::json!([B256::ZERO]));
    }
}
