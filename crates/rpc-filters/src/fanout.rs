//! Push-mode notification fan-out.
//!
//! One [`NewBlockEvent`] produces two independent notification classes,
//! which run concurrently:
//! - head notifications, sent to every block filter bound to a connection.
//! - log notifications, sent to every log filter bound to a connection
//!   whose range admits the block, one per matching log, in log order.
//!
//! Each class is partitioned over a bounded worker pool by [`parallelize`].
//! Failures are logged and counted. They never reach the caller.

use crate::{
    chain::{ChainState, NewBlockEvent},
    connection::{ConnectionId, SubscriptionSink},
    kind::FilterId,
    metrics,
    parallel::{ParallelOutcome, parallelize},
    spec::LogFilterSpec,
    store::{FilterEntry, FilterStore},
};
use alloy::{eips::BlockNumberOrTag, primitives::B256};
use serde::Serialize;
use serde_json::value::RawValue;
use std::{
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::Instant,
};
use tracing::{debug, error, instrument, trace, warn};

/// Summary of one block's fan-out.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FanoutReport {
    /// The block that was fanned out.
    pub block_number: u64,
    /// Block filters considered.
    pub head_filters: usize,
    /// Log filters considered.
    pub log_filters: usize,
    /// Log filters rejected by the pre-filter skip test.
    pub skipped_log_filters: usize,
    /// Notifications enqueued.
    pub enqueued: usize,
    /// Notifications the sink refused.
    pub dropped: usize,
    /// Worker chunks that panicked.
    pub panicked_chunks: usize,
}

impl FanoutReport {
    /// True if nothing was dropped and no worker panicked.
    pub const fn is_clean(&self) -> bool {
        self.dropped == 0 && self.panicked_chunks == 0
    }
}

/// `eth_subscription` notification envelope.
#[derive(Serialize)]
struct Notification<'a, T: ?Sized> {
    jsonrpc: &'static str,
    method: &'static str,
    params: NotificationParams<'a, T>,
}

#[derive(Serialize)]
struct NotificationParams<'a, T: ?Sized> {
    subscription: FilterId,
    result: &'a T,
}

impl<'a, T: Serialize + ?Sized> Notification<'a, T> {
    const fn new(subscription: FilterId, result: &'a T) -> Self {
        Self {
            jsonrpc: "2.0",
            method: "eth_subscription",
            params: NotificationParams { subscription, result },
        }
    }
}

/// Counters shared by the workers of one fan-out.
#[derive(Debug, Default)]
struct Tally {
    enqueued: AtomicUsize,
    dropped: AtomicUsize,
    skipped: AtomicUsize,
}

impl Tally {
    fn deliver<T: Serialize + ?Sized>(
        &self,
        sink: &dyn SubscriptionSink,
        id: FilterId,
        connection: ConnectionId,
        result: &T,
    ) {
        let payload = match serde_json::to_string(&Notification::new(id, result)) {
            Ok(payload) => payload,
            Err(err) => {
                error!(%id, %err, "failed to serialize notification");
                self.dropped.fetch_add(1, Ordering::Relaxed);
                return;
            }
        };
        match sink.enqueue(connection, payload) {
            Ok(()) => {
                self.enqueued.fetch_add(1, Ordering::Relaxed);
            }
            Err(err) => {
                trace!(%id, %connection, %err, "notification dropped");
                metrics::inc_notifications_dropped(err);
                self.dropped.fetch_add(1, Ordering::Relaxed);
            }
        }
    }
}

/// Symbolic block tags resolved once for an event.
#[derive(Debug, Default)]
struct ResolvedTags(Vec<(BlockNumberOrTag, u64)>);

impl ResolvedTags {
    /// Resolve every symbolic bound used by `filters`. Tags that fail to
    /// resolve are logged and left out.
    async fn resolve<C: ChainState>(chain: &C, filters: &[Arc<FilterEntry>]) -> Self {
        let mut tags: Vec<BlockNumberOrTag> = filters
            .iter()
            .filter_map(|entry| entry.kind().as_log())
            .flat_map(|spec| [spec.from_block, spec.to_block])
            .flatten()
            .filter(|tag| !tag.is_number())
            .collect();
        tags.sort_by_key(|tag| tag.to_string());
        tags.dedup();

        let mut resolved = Vec::with_capacity(tags.len());
        for tag in tags {
            match chain.resolve_block_number(tag).await {
                Ok(number) => resolved.push((tag, number)),
                Err(err) => warn!(%tag, %err, "unable to resolve block tag for log fan-out"),
            }
        }
        Self(resolved)
    }

    fn get(&self, block: BlockNumberOrTag) -> Option<u64> {
        match block {
            BlockNumberOrTag::Number(number) => Some(number),
            tag => self.0.iter().find(|(t, _)| *t == tag).map(|(_, n)| *n),
        }
    }

    /// True if the filter cannot match anything in block `number` with
    /// hash `hash`. A bound that could not be resolved skips the filter.
    fn should_skip(&self, spec: &LogFilterSpec, hash: B256, number: u64) -> bool {
        if spec.block_hash.is_some_and(|h| h != hash) {
            return true;
        }
        if let Some(from) = spec.from_block {
            match self.get(from) {
                Some(from) if from > number => return true,
                None => return true,
                _ => {}
            }
        }
        if let Some(to) = spec.to_block {
            match self.get(to) {
                Some(to) if to < number => return true,
                None => return true,
                _ => {}
            }
        }
        false
    }
}

/// Distributes new-block notifications to push-mode filters.
#[derive(Clone)]
pub(crate) struct Fanout {
    store: Arc<dyn FilterStore>,
    sink: Arc<dyn SubscriptionSink>,
    workers: usize,
}

impl core::fmt::Debug for Fanout {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Fanout").field("workers", &self.workers).finish_non_exhaustive()
    }
}

impl Fanout {
    pub(crate) const fn new(
        store: Arc<dyn FilterStore>,
        sink: Arc<dyn SubscriptionSink>,
        workers: usize,
    ) -> Self {
        Self { store, sink, workers }
    }

    /// Notify every push-mode filter of `event`.
    #[instrument(skip_all, fields(number = event.number(), hash = %event.hash))]
    pub(crate) async fn run<C: ChainState>(
        &self,
        chain: &C,
        event: Arc<NewBlockEvent>,
    ) -> FanoutReport {
        let start = Instant::now();
        let tally = Arc::new(Tally::default());

        let block_filters = self.store.all_block_filters_with_connection().unwrap_or_else(|err| {
            error!(%err, "unable to enumerate block subscriptions");
            Vec::new()
        });
        let log_filters = self.store.all_log_filters_with_connection().unwrap_or_else(|err| {
            error!(%err, "unable to enumerate log subscriptions");
            Vec::new()
        });
        let tags = ResolvedTags::resolve(chain, &log_filters).await;

        let mut report = FanoutReport {
            block_number: event.number(),
            head_filters: block_filters.len(),
            log_filters: log_filters.len(),
            ..Default::default()
        };

        let (heads, logs) = tokio::join!(
            self.notify_heads(&event, block_filters, Arc::clone(&tally)),
            self.notify_logs(Arc::clone(&event), log_filters, tags, Arc::clone(&tally)),
        );

        report.panicked_chunks = heads.panicked.len() + logs.panicked.len();
        report.enqueued = tally.enqueued.load(Ordering::Relaxed);
        report.dropped = tally.dropped.load(Ordering::Relaxed);
        report.skipped_log_filters = tally.skipped.load(Ordering::Relaxed);

        metrics::inc_notifications_sent(report.enqueued);
        if report.panicked_chunks > 0 {
            metrics::inc_fanout_panics(report.panicked_chunks);
        }
        metrics::record_fanout_time(&start);

        debug!(
            head_filters = report.head_filters,
            log_filters = report.log_filters,
            skipped = report.skipped_log_filters,
            enqueued = report.enqueued,
            dropped = report.dropped,
            panicked_chunks = report.panicked_chunks,
            elapsed_ms = start.elapsed().as_millis() as u64,
            "fan-out complete"
        );
        report
    }

    async fn notify_heads(
        &self,
        event: &NewBlockEvent,
        filters: Vec<Arc<FilterEntry>>,
        tally: Arc<Tally>,
    ) -> ParallelOutcome {
        if filters.is_empty() {
            return ParallelOutcome::default();
        }

        // Serialized once, embedded verbatim in every envelope.
        let header: Arc<RawValue> = match serde_json::value::to_raw_value(&event.rpc_header()) {
            Ok(raw) => raw.into(),
            Err(err) => {
                error!(%err, "failed to serialize block header");
                return ParallelOutcome::default();
            }
        };

        let sink = Arc::clone(&self.sink);
        parallelize(self.workers, filters, move |chunk| {
            for entry in chunk {
                let Some(connection) = entry.connection() else { continue };
                tally.deliver(sink.as_ref(), entry.id(), connection, &*header);
            }
        })
        .await
    }

    async fn notify_logs(
        &self,
        event: Arc<NewBlockEvent>,
        filters: Vec<Arc<FilterEntry>>,
        tags: ResolvedTags,
        tally: Arc<Tally>,
    ) -> ParallelOutcome {
        if filters.is_empty() || event.logs.is_empty() {
            return ParallelOutcome::default();
        }

        let sink = Arc::clone(&self.sink);
        parallelize(self.workers, filters, move |chunk| {
            for entry in chunk {
                let (Some(connection), Some(spec)) = (entry.connection(), entry.kind().as_log())
                else {
                    continue;
                };
                if tags.should_skip(spec, event.hash, event.number()) {
                    trace!(id = %entry.id(), "log filter skipped for block");
                    tally.skipped.fetch_add(1, Ordering::Relaxed);
                    continue;
                }
                for log in event.logs.iter().filter(|log| spec.matches(log)) {
                    tally.deliver(sink.as_ref(), entry.id(), connection, log);
                }
            }
        })
        .await
    }
}
