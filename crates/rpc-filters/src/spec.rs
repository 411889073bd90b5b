//! Log filter specification and log matching.

use crate::error::InvalidFilter;
use alloy::{
    eips::BlockNumberOrTag,
    primitives::{Address, B256},
    rpc::types::Log,
};
use serde::Deserialize;

/// Maximum number of topic slots on a log.
pub const MAX_TOPICS: usize = 4;

/// A log filter, as registered by `eth_newFilter` or `eth_subscribe("logs")`.
///
/// # Topic Matching
///
/// Each topic slot is independently filtered:
/// - an empty slot matches any value at that position.
/// - `vec![a, b]` matches if the topic at that position equals `a` **or**
///   `b` (OR within a slot).
///
/// Slots are combined with AND. Positions beyond the last defined slot are
/// unconstrained.
///
/// # Wire format
///
/// Deserializes from the standard Ethereum JSON shape: `address` may be a
/// single address or an array, and each `topics` entry may be `null`, a
/// single topic, or an array of topics.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(from = "RawLogFilter")]
pub struct LogFilterSpec {
    /// First block of the range, inclusive.
    pub from_block: Option<BlockNumberOrTag>,
    /// Last block of the range, inclusive.
    pub to_block: Option<BlockNumberOrTag>,
    /// Restrict to a single block. Exclusive with the range fields.
    pub block_hash: Option<B256>,
    /// Acceptable emitters. Empty matches any address.
    pub addresses: Vec<Address>,
    /// Topic slots.
    pub topics: Vec<Vec<B256>>,
}

impl LogFilterSpec {
    /// Create a filter that matches every log.
    pub const fn new() -> Self {
        Self {
            from_block: None,
            to_block: None,
            block_hash: None,
            addresses: Vec::new(),
            topics: Vec::new(),
        }
    }

    /// Set the start of the block range.
    pub fn from_block(mut self, block: BlockNumberOrTag) -> Self {
        self.from_block = Some(block);
        self
    }

    /// Set the end of the block range.
    pub fn to_block(mut self, block: BlockNumberOrTag) -> Self {
        self.to_block = Some(block);
        self
    }

    /// Restrict the filter to the block with this hash.
    pub fn at_block_hash(mut self, hash: B256) -> Self {
        self.block_hash = Some(hash);
        self
    }

    /// Add an acceptable emitter.
    pub fn address(mut self, address: Address) -> Self {
        self.addresses.push(address);
        self
    }

    /// Set the acceptable values of a topic slot, growing the slot list
    /// with wildcards as needed.
    pub fn topic(mut self, slot: usize, values: impl IntoIterator<Item = B256>) -> Self {
        if self.topics.len() <= slot {
            self.topics.resize(slot + 1, Vec::new());
        }
        self.topics[slot] = values.into_iter().collect();
        self
    }

    /// Decode a filter from its JSON representation.
    pub fn from_json(value: serde_json::Value) -> Result<Self, InvalidFilter> {
        serde_json::from_value(value).map_err(|e| InvalidFilter::Malformed(e.to_string()))
    }

    /// Check that the filter is structurally usable.
    pub fn validate(&self) -> Result<(), InvalidFilter> {
        if self.block_hash.is_some() && (self.from_block.is_some() || self.to_block.is_some()) {
            return Err(InvalidFilter::BlockHashWithRange);
        }
        if self.topics.len() > MAX_TOPICS {
            return Err(InvalidFilter::TooManyTopics(self.topics.len()));
        }
        if let (Some(BlockNumberOrTag::Number(from)), Some(BlockNumberOrTag::Number(to))) =
            (self.from_block, self.to_block)
        {
            if from > to {
                return Err(InvalidFilter::InvertedRange { from, to });
            }
        }
        Ok(())
    }

    /// True if the log's emitter is acceptable.
    pub fn matches_address(&self, address: Address) -> bool {
        self.addresses.is_empty() || self.addresses.contains(&address)
    }

    /// True if every defined topic slot accepts the log's topic at that
    /// position.
    pub fn matches_topics(&self, topics: &[B256]) -> bool {
        self.topics.iter().take(MAX_TOPICS).enumerate().all(|(i, acceptable)| {
            acceptable.is_empty() || topics.get(i).is_some_and(|topic| acceptable.contains(topic))
        })
    }

    /// True if the log passes both the address and topic checks. Block
    /// range is **not** checked.
    pub fn matches(&self, log: &Log) -> bool {
        self.matches_address(log.inner.address) && self.matches_topics(log.inner.data.topics())
    }
}

/// Either a single value or a list of values.
#[derive(Deserialize)]
#[serde(untagged)]
enum OneOrMany<T> {
    One(T),
    Many(Vec<T>),
}

impl<T> From<OneOrMany<T>> for Vec<T> {
    fn from(value: OneOrMany<T>) -> Self {
        match value {
            OneOrMany::One(item) => vec![item],
            OneOrMany::Many(items) => items,
        }
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawLogFilter {
    #[serde(default)]
    from_block: Option<BlockNumberOrTag>,
    #[serde(default)]
    to_block: Option<BlockNumberOrTag>,
    #[serde(default)]
    block_hash: Option<B256>,
    #[serde(default)]
    address: Option<OneOrMany<Address>>,
    #[serde(default)]
    topics: Option<Vec<Option<OneOrMany<B256>>>>,
}

impl From<RawLogFilter> for LogFilterSpec {
    fn from(raw: RawLogFilter) -> Self {
        Self {
            from_block: raw.from_block,
            to_block: raw.to_block,
            block_hash: raw.block_hash,
            addresses: raw.address.map(Into::into).unwrap_or_default(),
            topics: raw
                .topics
                .unwrap_or_default()
                .into_iter()
                .map(|slot| slot.map(Into::into).unwrap_or_default())
                .collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy::primitives::{Bytes, LogData, address};
    use serde_json::json;

    const AA: Address = address!("0xaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa");
    const BB: Address = address!("0xbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbb");

    fn topic(byte: u8) -> B256 {
        B256::repeat_byte(byte)
    }

    fn log(address: Address, topics: Vec<B256>) -> Log {
        Log {
            inner: alloy::primitives::Log {
                address,
                data: LogData::new_unchecked(topics, Bytes::new()),
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

    #[test]
    fn empty_filter_matches_everything() {
        let spec = LogFilterSpec::new();
        assert!(spec.matches(&log(AA, vec![])));
        assert!(spec.matches(&log(BB, vec![topic(1), topic(2), topic(3), topic(4)])));
    }

    #[test]
    fn address_membership() {
        let spec = LogFilterSpec::new().address(AA);
        assert!(spec.matches(&log(AA, vec![topic(1)])));
        assert!(!spec.matches(&log(BB, vec![topic(1)])));

        let spec = spec.address(BB);
        assert!(spec.matches(&log(BB, vec![])));
    }

    #[test]
    fn wildcard_slot_then_constrained_slot() {
        let spec = LogFilterSpec::new().topic(1, [topic(0xcc)]);
        assert_eq!(spec.topics, vec![vec![], vec![topic(0xcc)]]);

        assert!(spec.matches(&log(AA, vec![topic(1), topic(0xcc)])));
        assert!(spec.matches(&log(AA, vec![topic(2), topic(0xcc), topic(3)])));
        assert!(!spec.matches(&log(AA, vec![topic(1), topic(2)])));
        // The log has no topic in the constrained slot.
        assert!(!spec.matches(&log(AA, vec![topic(0xcc)])));
    }

    #[test]
    fn or_within_slot_and_across_slots() {
        let spec = LogFilterSpec::new().topic(0, [topic(1), topic(2)]).topic(1, [topic(9)]);
        assert!(spec.matches(&log(AA, vec![topic(1), topic(9)])));
        assert!(spec.matches(&log(AA, vec![topic(2), topic(9)])));
        assert!(!spec.matches(&log(AA, vec![topic(3), topic(9)])));
        assert!(!spec.matches(&log(AA, vec![topic(1), topic(8)])));
    }

    #[test]
    fn undefined_slots_are_unconstrained() {
        let spec = LogFilterSpec::new().topic(0, [topic(1)]);
        assert!(spec.matches(&log(AA, vec![topic(1), topic(2), topic(3), topic(4)])));
    }

    #[test]
    fn deserialize_ethereum_shape() {
        let spec = LogFilterSpec::from_json(json!({
            "fromBlock": "0x1",
            "toBlock": "latest",
            "address": format!("{AA:?}"),
            "topics": [null, format!("{:?}", topic(0xcc)), [format!("{:?}", topic(1)), format!("{:?}", topic(2))]],
        }))
        .unwrap();

        assert_eq!(spec.from_block, Some(BlockNumberOrTag::Number(1)));
        assert_eq!(spec.to_block, Some(BlockNumberOrTag::Latest));
        assert_eq!(spec.addresses, vec![AA]);
        assert_eq!(spec.topics, vec![vec![], vec![topic(0xcc)], vec![topic(1), topic(2)]]);

        let spec =
            LogFilterSpec::from_json(json!({ "address": [format!("{AA:?}"), format!("{BB:?}")] }))
                .unwrap();
        assert_eq!(spec.addresses, vec![AA, BB]);
        assert!(spec.topics.is_empty());
    }

    #[test]
    fn malformed_topic_is_rejected() {
        let err = LogFilterSpec::from_json(json!({ "topics": ["0x1234"] })).unwrap_err();
        assert!(matches!(err, InvalidFilter::Malformed(_)));
    }

    #[test]
    fn validation() {
        assert!(LogFilterSpec::new().validate().is_ok());

        let spec = LogFilterSpec::new().at_block_hash(topic(5)).from_block(BlockNumberOrTag::Latest);
        assert_eq!(spec.validate(), Err(InvalidFilter::BlockHashWithRange));

        let spec = LogFilterSpec::new().topic(4, [topic(1)]);
        assert_eq!(spec.validate(), Err(InvalidFilter::TooManyTopics(5)));

        let spec = LogFilterSpec::new()
            .from_block(BlockNumberOrTag::Number(10))
            .to_block(BlockNumberOrTag::Number(2));
        assert_eq!(spec.validate(), Err(InvalidFilter::InvertedRange { from: 10, to: 2 }));

        let spec =
            LogFilterSpec::new().from_block(BlockNumberOrTag::Number(10)).to_block(BlockNumberOrTag::Latest);
        assert!(spec.validate().is_ok());
    }
}
