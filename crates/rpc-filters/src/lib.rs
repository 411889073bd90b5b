#![doc = include_str!("../README.md")]
#![warn(
    missing_copy_implementations,
    missing_debug_implementations,
    missing_docs,
    unreachable_pub,
    clippy::missing_const_for_fn,
    rustdoc::all
)]
#![cfg_attr(not(test), warn(unused_crate_dependencies))]
#![deny(unused_must_use, rust_2018_idioms)]
#![cfg_attr(docsrs, feature(doc_cfg, doc_auto_cfg))]

mod chain;
pub use chain::{ChainState, LogQuery, LogRange, NewBlockEvent, TxPool, UpstreamError};

mod config;
pub use config::FilterConfig;

mod connection;
pub use connection::{ConnectionId, ConnectionRegistry, EnqueueError, SubscriptionSink};

mod cursor;
pub use cursor::PollCursor;

mod engine;
pub use engine::{FilterChanges, FilterEngine};

mod error;
pub use error::{ErrorPayload, FilterError, InvalidFilter, StoreError};

mod fanout;
pub use fanout::FanoutReport;

mod kind;
pub use kind::{FilterId, FilterKind};

pub mod mem;

mod metrics;

mod parallel;
pub use parallel::{ParallelOutcome, parallelize};

mod rpc;
pub use rpc::FilterRpc;

mod spec;
pub use spec::{LogFilterSpec, MAX_TOPICS};

mod store;
pub use store::{FilterEntry, FilterStore, MemFilterStore, MemFilterStoreInner};
