//! Metrics to track
//!
//! - Counters:
//!   - Filters installed, labeled by kind
//!   - Filters uninstalled
//!   - Stale poll-mode filters removed
//!   - Polls served, labeled by kind
//!   - Polls failed
//!   - Push notifications enqueued
//!   - Push notifications dropped, labeled by reason
//!   - Fan-out worker panics
//! - Histograms:
//!   - Fan-out time per block

use crate::connection::EnqueueError;
use metrics::{Counter, Histogram, counter, describe_counter, describe_histogram, histogram};
use std::sync::LazyLock;

const FILTERS_INSTALLED: &str = "signet.rpc.filters.installed";
const FILTERS_INSTALLED_HELP: &str = "Number of filters installed, labeled by kind";

const FILTERS_UNINSTALLED: &str = "signet.rpc.filters.uninstalled";
const FILTERS_UNINSTALLED_HELP: &str =
    "Number of filters uninstalled, explicitly or by connection teardown";

const STALE_REMOVED: &str = "signet.rpc.filters.stale_removed";
const STALE_REMOVED_HELP: &str = "Number of poll-mode filters removed for not being polled";

const POLLS: &str = "signet.rpc.filters.polls";
const POLLS_HELP: &str = "Number of successful filter polls, labeled by kind";

const POLL_FAILURES: &str = "signet.rpc.filters.poll_failures";
const POLL_FAILURES_HELP: &str = "Number of filter polls that failed after lookup";

const NOTIFICATIONS_SENT: &str = "signet.rpc.filters.notifications.enqueued";
const NOTIFICATIONS_SENT_HELP: &str = "Number of push notifications enqueued";

const NOTIFICATIONS_DROPPED: &str = "signet.rpc.filters.notifications.dropped";
const NOTIFICATIONS_DROPPED_HELP: &str =
    "Number of push notifications that could not be enqueued, labeled by reason";

const FANOUT_PANICS: &str = "signet.rpc.filters.fanout.panics";
const FANOUT_PANICS_HELP: &str = "Number of fan-out chunks that panicked";

const FANOUT_TIME: &str = "signet.rpc.filters.fanout.time";
const FANOUT_TIME_HELP: &str = "Time taken to fan out a single block, in milliseconds.";

static DESCRIBE: LazyLock<()> = LazyLock::new(|| {
    describe_counter!(FILTERS_INSTALLED, FILTERS_INSTALLED_HELP);
    describe_counter!(FILTERS_UNINSTALLED, FILTERS_UNINSTALLED_HELP);
    describe_counter!(STALE_REMOVED, STALE_REMOVED_HELP);
    describe_counter!(POLLS, POLLS_HELP);
    describe_counter!(POLL_FAILURES, POLL_FAILURES_HELP);
    describe_counter!(NOTIFICATIONS_SENT, NOTIFICATIONS_SENT_HELP);
    describe_counter!(NOTIFICATIONS_DROPPED, NOTIFICATIONS_DROPPED_HELP);
    describe_counter!(FANOUT_PANICS, FANOUT_PANICS_HELP);

    describe_histogram!(FANOUT_TIME, FANOUT_TIME_HELP);
});

fn filters_installed(kind: &'static str) -> Counter {
    LazyLock::force(&DESCRIBE);
    counter!(FILTERS_INSTALLED, "kind" => kind)
}

pub(crate) fn inc_filters_installed(kind: &'static str) {
    filters_installed(kind).increment(1);
}

fn filters_uninstalled() -> Counter {
    LazyLock::force(&DESCRIBE);
    counter!(FILTERS_UNINSTALLED)
}

pub(crate) fn inc_filters_uninstalled(value: usize) {
    filters_uninstalled().increment(value as u64);
}

fn stale_removed() -> Counter {
    LazyLock::force(&DESCRIBE);
    counter!(STALE_REMOVED)
}

pub(crate) fn record_stale_removed(value: usize) {
    stale_removed().increment(value as u64);
}

fn polls(kind: &'static str) -> Counter {
    LazyLock::force(&DESCRIBE);
    counter!(POLLS, "kind" => kind)
}

pub(crate) fn inc_polls(kind: &'static str) {
    polls(kind).increment(1);
}

fn poll_failures() -> Counter {
    LazyLock::force(&DESCRIBE);
    counter!(POLL_FAILURES)
}

pub(crate) fn inc_poll_failures() {
    poll_failures().increment(1);
}

fn notifications_sent() -> Counter {
    LazyLock::force(&DESCRIBE);
    counter!(NOTIFICATIONS_SENT)
}

pub(crate) fn inc_notifications_sent(value: usize) {
    notifications_sent().increment(value as u64);
}

fn notifications_dropped(reason: &'static str) -> Counter {
    LazyLock::force(&DESCRIBE);
    counter!(NOTIFICATIONS_DROPPED, "reason" => reason)
}

pub(crate) fn inc_notifications_dropped(err: EnqueueError) {
    let reason = match err {
        EnqueueError::Full => "full",
        EnqueueError::Closed => "closed",
    };
    notifications_dropped(reason).increment(1);
}

fn fanout_panics() -> Counter {
    LazyLock::force(&DESCRIBE);
    counter!(FANOUT_PANICS)
}

pub(crate) fn inc_fanout_panics(value: usize) {
    fanout_panics().increment(value as u64);
}

fn fanout_time() -> Histogram {
    LazyLock::force(&DESCRIBE);
    histogram!(FANOUT_TIME)
}

pub(crate) fn record_fanout_time(started_at: &std::time::Instant) {
    fanout_time().record(started_at.elapsed().as_millis() as f64);
}
