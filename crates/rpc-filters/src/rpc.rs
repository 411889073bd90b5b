//! JSON-RPC method surface over the [`FilterEngine`].

use crate::{
    chain::{ChainState, TxPool},
    connection::ConnectionId,
    engine::FilterEngine,
    error::{ErrorPayload, FilterError},
    kind::FilterId,
    spec::LogFilterSpec,
};
use serde::{Serialize, de::DeserializeOwned};
use serde_json::Value;
use tracing::{debug, trace};

/// Subscription names accepted by `eth_subscribe`.
const NEW_HEADS: &str = "newHeads";
const LOGS: &str = "logs";
const NEW_PENDING_TRANSACTIONS: &str = "newPendingTransactions";
const PENDING_TRANSACTIONS: &str = "pendingTransactions";
const SYNCING: &str = "syncing";

/// Dispatches the filter-related `eth_` methods to a [`FilterEngine`].
///
/// Params are positional, as a JSON array. Method names are accepted with
/// or without the `eth_` prefix. Results and errors follow the standard
/// Ethereum JSON-RPC shapes:
///
/// | Method | Result |
/// | --- | --- |
/// | `newBlockFilter` | filter ID |
/// | `newFilter` | filter ID |
/// | `newPendingTransactionFilter` | always an error |
/// | `getFilterChanges` | array, empty if nothing changed |
/// | `getFilterLogs` | array of logs, or `null` for unknown or non-log filters |
/// | `uninstallFilter` | `true` if removed, `false` if unknown |
/// | `subscribe` | subscription ID, requires a connection |
/// | `unsubscribe` | as `uninstallFilter` |
#[derive(Debug)]
pub struct FilterRpc<C, P> {
    engine: FilterEngine<C, P>,
}

impl<C, P> Clone for FilterRpc<C, P> {
    fn clone(&self) -> Self {
        Self { engine: self.engine.clone() }
    }
}

impl<C, P> FilterRpc<C, P>
where
    C: ChainState,
    P: TxPool,
{
    /// Wrap an engine.
    pub const fn new(engine: FilterEngine<C, P>) -> Self {
        Self { engine }
    }

    /// The wrapped engine.
    pub const fn engine(&self) -> &FilterEngine<C, P> {
        &self.engine
    }

    /// Handle one call. `connection` is the push connection the request
    /// arrived on, if any.
    pub async fn call(
        &self,
        method: &str,
        params: Value,
        connection: Option<ConnectionId>,
    ) -> Result<Value, ErrorPayload> {
        trace!(method, ?connection, "filter rpc call");
        self.dispatch(method, params, connection).await.map_err(|err| {
            debug!(method, %err, "filter rpc call failed");
            err.into()
        })
    }

    async fn dispatch(
        &self,
        method: &str,
        params: Value,
        connection: Option<ConnectionId>,
    ) -> Result<Value, FilterError> {
        let params = Params::new(params)?;
        match method.strip_prefix("eth_").unwrap_or(method) {
            "newBlockFilter" => to_json(self.engine.register_block_filter(None)?),
            "newFilter" => {
                let spec = LogFilterSpec::from_json(params.required(0)?)?;
                to_json(self.engine.register_log_filter(None, spec)?)
            }
            "newPendingTransactionFilter" => to_json(self.engine.register_pending_tx_filter(None)?),
            "getFilterChanges" => to_json(self.engine.poll_changes(params.filter_id(0)?).await?),
            "getFilterLogs" => {
                let logs = match params.filter_id(0) {
                    Ok(id) => self.engine.poll_logs(id).await,
                    Err(err) => Err(err),
                };
                match logs {
                    Ok(logs) => to_json(logs),
                    Err(err) if err.is_not_found() => Ok(Value::Null),
                    Err(FilterError::KindMismatch { .. }) => Ok(Value::Null),
                    Err(err) => Err(err),
                }
            }
            "uninstallFilter" | "unsubscribe" => match params.filter_id(0) {
                Ok(id) => to_json(self.engine.unregister(id)?),
                Err(err) if err.is_not_found() => to_json(false),
                Err(err) => Err(err),
            },
            "subscribe" => {
                let connection = connection
                    .ok_or(FilterError::Unsupported("subscriptions without a connection"))?;
                let name: String = params.parse(0)?;
                to_json(self.subscribe(connection, &name, params.optional(1))?)
            }
            other => Err(FilterError::MethodNotFound(other.to_owned())),
        }
    }

    fn subscribe(
        &self,
        connection: ConnectionId,
        name: &str,
        spec: Option<Value>,
    ) -> Result<FilterId, FilterError> {
        match name {
            NEW_HEADS => self.engine.register_block_filter(Some(connection)),
            LOGS => {
                let spec = spec.map(LogFilterSpec::from_json).transpose()?.unwrap_or_default();
                self.engine.register_log_filter(Some(connection), spec)
            }
            NEW_PENDING_TRANSACTIONS | PENDING_TRANSACTIONS => {
                self.engine.register_pending_tx_filter(Some(connection))
            }
            SYNCING => Err(FilterError::Unsupported("syncing subscriptions")),
            _ => Err(FilterError::InvalidParams(format!("invalid filter name: {name}"))),
        }
    }
}

/// Positional request params.
#[derive(Debug)]
struct Params(Vec<Value>);

impl Params {
    fn new(params: Value) -> Result<Self, FilterError> {
        match params {
            Value::Null => Ok(Self(Vec::new())),
            Value::Array(params) => Ok(Self(params)),
            _ => Err(FilterError::InvalidParams("expected positional params".to_owned())),
        }
    }

    /// Param at `idx`, absent or `null` as `None`.
    fn optional(&self, idx: usize) -> Option<Value> {
        self.0.get(idx).filter(|v| !v.is_null()).cloned()
    }

    fn required(&self, idx: usize) -> Result<Value, FilterError> {
        self.optional(idx).ok_or_else(|| FilterError::InvalidParams(format!("missing param {idx}")))
    }

    fn parse<T: DeserializeOwned>(&self, idx: usize) -> Result<T, FilterError> {
        serde_json::from_value(self.required(idx)?)
            .map_err(|e| FilterError::InvalidParams(format!("param {idx}: {e}")))
    }

    /// Filter ID at `idx`. Any string is accepted. One that does not decode
    /// to a [`FilterId`] was never issued, and yields
    /// [`FilterError::UnknownId`].
    fn filter_id(&self, idx: usize) -> Result<FilterId, FilterError> {
        let raw: String = self.parse(idx)?;
        serde_json::from_value(Value::String(raw.clone())).map_err(|_| FilterError::UnknownId(raw))
    }
}

fn to_json<T: Serialize>(value: T) -> Result<Value, FilterError> {
    serde_json::to_value(value).map_err(FilterError::Serialization)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn params_shapes() {
        let params = Params::new(json!(["0x1", null])).unwrap();
        assert_eq!(params.parse::<FilterId>(0).unwrap(), FilterId::from(1u64));
        assert!(params.optional(1).is_none());
        assert!(params.optional(2).is_none());
        assert!(matches!(params.required(1), Err(FilterError::InvalidParams(_))));
        assert!(matches!(params.parse::<FilterId>(1), Err(FilterError::InvalidParams(_))));
        assert_eq!(params.filter_id(0).unwrap(), FilterId::from(1u64));

        let params = Params::new(json!(["nope", "0xdeadbeefdeadbeefdeadbeef", 7])).unwrap();
        assert!(matches!(params.filter_id(0), Err(FilterError::UnknownId(id)) if id == "nope"));
        assert!(matches!(params.filter_id(1), Err(FilterError::UnknownId(_))));
        assert!(matches!(params.filter_id(2), Err(FilterError::InvalidParams(_))));

        assert!(Params::new(Value::Null).unwrap().0.is_empty());
        assert!(matches!(Params::new(json!({})), Err(FilterError::InvalidParams(_))));
    }
}
