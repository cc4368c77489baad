//! # Ledger Access
//!
//! The boundary between the core and whatever client talks to the chain. The core never
//! speaks JSON-RPC itself; it consumes an [`EventSource`] for historical and live contract
//! logs, and voting-machine bindings (see [`crate::voting_machine::VotingMachineContract`])
//! for contract calls.
//!
//! ## Overview
//! - [`RawEvent`]: one decoded contract log with its named arguments.
//! - [`LogDelivery`]: what a source hands back, either a single event or a list of them.
//! - [`LogQuery`]: event name, contract address, argument filter and block range.
//! - [`EventSource`]: the trait every ledger client implements.
//! - [`TxReceipt`]: the receipt summary carried on the transaction bus.

use std::collections::BTreeMap;

use alloy::dyn_abi::DynSolValue;
use alloy::primitives::{Address, B256, U256};
use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::Serialize;
use snafu::Snafu;

use crate::error::{Error, Result};
use crate::filter::{ArgFilter, FetchOptions};

/// Named arguments of a decoded event.
///
/// Values keep their ABI shape so filters can compare them without string conversions.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct EventArgs(BTreeMap<String, DynSolValue>);

impl EventArgs {
    /// Creates an empty argument set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds an argument, returning the updated set.
    pub fn with(mut self, name: impl Into<String>, value: DynSolValue) -> Self {
        self.0.insert(name.into(), value);
        self
    }

    /// Inserts or replaces an argument.
    pub fn insert(&mut self, name: impl Into<String>, value: DynSolValue) {
        self.0.insert(name.into(), value);
    }

    /// Returns the raw value of an argument.
    pub fn get(&self, name: &str) -> Option<&DynSolValue> {
        self.0.get(name)
    }

    /// Iterates over arguments in name order.
    pub fn iter(&self) -> impl Iterator<Item = (&String, &DynSolValue)> {
        self.0.iter()
    }

    fn require(&self, name: &str) -> Result<&DynSolValue> {
        self.0.get(name).ok_or_else(|| Error::MissingEventArg {
            arg: name.to_string(),
        })
    }

    /// Reads an `address` argument.
    pub fn address(&self, name: &str) -> Result<Address> {
        self.require(name)?
            .as_address()
            .ok_or_else(|| Error::EventArgType {
                arg: name.to_string(),
                expected: "address",
            })
    }

    /// Reads a `bytes32` argument.
    pub fn b256(&self, name: &str) -> Result<B256> {
        match self.require(name)? {
            DynSolValue::FixedBytes(word, 32) => Ok(*word),
            _ => Err(Error::EventArgType {
                arg: name.to_string(),
                expected: "bytes32",
            }),
        }
    }

    /// Reads an unsigned integer argument of any width.
    pub fn uint(&self, name: &str) -> Result<U256> {
        self.require(name)?
            .as_uint()
            .map(|(value, _)| value)
            .ok_or_else(|| Error::EventArgType {
                arg: name.to_string(),
                expected: "uint",
            })
    }

    /// Reads a `bool` argument.
    pub fn bool(&self, name: &str) -> Result<bool> {
        self.require(name)?
            .as_bool()
            .ok_or_else(|| Error::EventArgType {
                arg: name.to_string(),
                expected: "bool",
            })
    }
}

impl FromIterator<(String, DynSolValue)> for EventArgs {
    fn from_iter<I: IntoIterator<Item = (String, DynSolValue)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

/// A contract log as delivered by the ledger-access layer.
///
/// A transaction may emit several events, so `transaction_hash` alone does not identify a
/// log; `log_index` does within its block.
#[derive(Clone, Debug, PartialEq)]
pub struct RawEvent {
    /// Name of the event type, e.g. `NewProposal`.
    pub event: String,
    /// Address of the emitting contract.
    pub address: Address,
    /// Hash of the transaction that emitted the log.
    pub transaction_hash: B256,
    /// Position of the log in its block, when known.
    pub log_index: Option<u64>,
    /// Block that included the transaction, when known.
    pub block_number: Option<u64>,
    /// Decoded named arguments.
    pub args: EventArgs,
}

/// The shape in which a source hands back logs.
///
/// Some clients deliver a bare log for single-result callbacks; the fetchers normalize both
/// variants into a list before anything else happens.
#[derive(Clone, Debug, PartialEq)]
pub enum LogDelivery {
    /// A single log.
    One(RawEvent),
    /// Any number of logs, in ledger order.
    Many(Vec<RawEvent>),
}

impl LogDelivery {
    /// Normalizes the delivery into a list.
    pub fn into_vec(self) -> Vec<RawEvent> {
        match self {
            LogDelivery::One(event) => vec![event],
            LogDelivery::Many(events) => events,
        }
    }
}

impl From<RawEvent> for LogDelivery {
    fn from(event: RawEvent) -> Self {
        LogDelivery::One(event)
    }
}

impl From<Vec<RawEvent>> for LogDelivery {
    fn from(events: Vec<RawEvent>) -> Self {
        LogDelivery::Many(events)
    }
}

/// A fully resolved log query handed to an [`EventSource`].
#[derive(Clone, Debug, PartialEq)]
pub struct LogQuery {
    /// Event name.
    pub event: String,
    /// Contract whose logs are queried.
    pub address: Address,
    /// Argument filter after the base filter was merged in.
    pub filter: ArgFilter,
    /// Block range for one-shot queries. Live subscriptions start at the chain head.
    pub range: FetchOptions,
}

/// Stream of live deliveries returned by [`EventSource::watch_logs`].
pub type LogStream = BoxStream<'static, Result<LogDelivery, LedgerError>>;

/// Provides contract logs to the fetchers.
///
/// Implementations may push the argument filter down to the node; the fetchers re-check it
/// either way, so an implementation that ignores it is still correct.
#[async_trait]
pub trait EventSource: Send + Sync {
    /// Returns all logs matching `query` within its block range.
    async fn get_logs(&self, query: &LogQuery) -> Result<LogDelivery, LedgerError>;

    /// Opens a live subscription for logs matching `query`.
    ///
    /// Each stream item is one batch as reported by the underlying client.
    async fn watch_logs(&self, query: &LogQuery) -> Result<LogStream, LedgerError>;
}

/// Summary of a mined transaction.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct TxReceipt {
    /// Transaction hash.
    pub transaction_hash: B256,
    /// Block that included the transaction.
    pub block_number: Option<u64>,
    /// Whether execution succeeded.
    pub success: bool,
}

impl From<&alloy::rpc::types::TransactionReceipt> for TxReceipt {
    fn from(receipt: &alloy::rpc::types::TransactionReceipt) -> Self {
        Self {
            transaction_hash: receipt.transaction_hash,
            block_number: receipt.block_number,
            success: receipt.status(),
        }
    }
}

/// Errors raised by ledger-access implementations.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum LedgerError {
    /// The JSON-RPC transport failed.
    #[snafu(display("Transport error: {source}"))]
    Transport {
        /// The underlying transport error.
        source: alloy::transports::TransportError,
    },

    /// A contract call or transaction submission failed.
    #[snafu(display("Contract call '{method}' failed: {source}"))]
    ContractCall {
        /// The contract method that was invoked.
        method: &'static str,
        /// The underlying contract error.
        source: alloy::contract::Error,
    },

    /// A submitted transaction could not be confirmed.
    #[snafu(display("Waiting for transaction '{method}' failed: {source}"))]
    PendingTransaction {
        /// The contract method that was invoked.
        method: &'static str,
        /// The underlying pending transaction error.
        source: alloy::providers::PendingTransactionError,
    },

    /// An event signature could not be parsed.
    #[snafu(display("Invalid event signature '{signature}': {source}"))]
    EventSignature {
        /// The signature that failed to parse.
        signature: String,
        /// The underlying parser error.
        source: alloy::json_abi::parser::Error,
    },

    /// A log did not decode against the expected event.
    #[snafu(display("Failed to decode '{event}' log: {source}"))]
    DecodeLog {
        /// Event name.
        event: String,
        /// The underlying ABI error.
        source: alloy::dyn_abi::Error,
    },

    /// A query named an event the source has no ABI description for.
    #[snafu(display("No ABI registered for event '{event}'"))]
    UnknownEvent {
        /// Event name.
        event: String,
    },

    /// A log or receipt lacked a field the core relies on.
    #[snafu(display("Ledger response is missing '{field}'"))]
    MissingField {
        /// Name of the missing field.
        field: &'static str,
    },

    /// Failure reported by a non-alloy provider.
    #[snafu(display("Provider error: {message}"))]
    Provider {
        /// Description of the failure.
        message: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(hash: u8) -> RawEvent {
        RawEvent {
            event: "NewProposal".to_string(),
            address: Address::ZERO,
            transaction_hash: B256::repeat_byte(hash),
            log_index: Some(0),
            block_number: Some(1),
            args: EventArgs::new(),
        }
    }

    #[test]
    fn scalar_delivery_becomes_single_item_list() {
        assert_eq!(LogDelivery::from(event(1)).into_vec(), vec![event(1)]);
        assert!(LogDelivery::Many(vec![]).into_vec().is_empty());
    }

    #[test]
    fn typed_accessors_validate_shape() {
        let id = B256::repeat_byte(7);
        let args = EventArgs::new()
            .with("_proposalId", DynSolValue::FixedBytes(id, 32))
            .with("_numOfChoices", DynSolValue::Uint(U256::from(2), 256))
            .with("_avatar", DynSolValue::Address(Address::repeat_byte(1)));

        assert_eq!(args.b256("_proposalId").unwrap(), id);
        assert_eq!(args.uint("_numOfChoices").unwrap(), U256::from(2));
        assert_eq!(args.address("_avatar").unwrap(), Address::repeat_byte(1));

        assert!(matches!(
            args.address("_proposalId"),
            Err(Error::EventArgType { .. })
        ));
        assert!(matches!(
            args.bool("_missing"),
            Err(Error::MissingEventArg { .. })
        ));
    }
}
