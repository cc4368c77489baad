//! Ledger access over an alloy provider.
//!
//! [`AlloyEventSource`] decodes contract logs by JSON-ABI event description, so one source
//! serves any event whose signature it was given. [`AlloyVotingMachine`] binds the
//! `IntVoteInterface` contract with `sol!`.

#![allow(missing_docs)]

use std::collections::HashMap;

use alloy::dyn_abi::{DynSolValue, EventExt};
use alloy::json_abi::Event;
use alloy::network::Ethereum;
use alloy::primitives::{Address, B256, U256};
use alloy::providers::{PendingTransactionBuilder, Provider};
use alloy::rpc::types::{Filter, Log, TransactionReceipt};
use alloy::sol;
use async_trait::async_trait;
use futures::StreamExt;
use log::debug;
use snafu::{OptionExt, ResultExt};

use crate::filter::FetchOptions;
use crate::ledger::{
    ContractCallSnafu,
    DecodeLogSnafu,
    EventArgs,
    EventSignatureSnafu,
    EventSource,
    LedgerError,
    LogDelivery,
    LogQuery,
    LogStream,
    MissingFieldSnafu,
    PendingTransactionSnafu,
    RawEvent,
    TransportSnafu,
    TxReceipt,
    UnknownEventSnafu,
};
use crate::voting_machine::{ProposedTx, VotingMachineContract};

sol! {
    /// Voting machine interface shared by the `IntVoteInterface` implementations.
    #[sol(rpc)]
    interface IntVoteInterface {
        event NewProposal(bytes32 indexed _proposalId, address indexed _avatar, uint256 _numOfChoices, address _proposer, bytes32 _paramsHash);
        event ExecuteProposal(bytes32 indexed _proposalId, address indexed _avatar, uint256 _decision, uint256 _totalReputation);
        event VoteProposal(bytes32 indexed _proposalId, address indexed _avatar, address indexed _voter, uint256 _vote, uint256 _reputation);
        event CancelProposal(bytes32 indexed _proposalId, address indexed _avatar);
        event CancelVoting(bytes32 indexed _proposalId, address indexed _avatar, address indexed _voter);

        function propose(uint256 _numOfChoices, bytes32 _proposalParameters, address _avatar, address _executable) external returns (bytes32);
        function cancelProposal(bytes32 _proposalId) external returns (bool);
        function ownerVote(bytes32 _proposalId, uint256 _vote, address _voter) external returns (bool);
        function vote(bytes32 _proposalId, uint256 _vote) external returns (bool);
        function voteWithSpecifiedAmounts(bytes32 _proposalId, uint256 _vote, uint256 _rep, uint256 _token) external returns (bool);
        function cancelVote(bytes32 _proposalId) external;
        function execute(bytes32 _proposalId) external returns (bool);
        function getNumberOfChoices(bytes32 _proposalId) external view returns (uint256);
        function isVotable(bytes32 _proposalId) external view returns (bool);
        function voteStatus(bytes32 _proposalId, uint256 _choice) external view returns (uint256);
        function isAbstainAllow() external pure returns (bool);
        function getAllowedRangeOfChoices() external pure returns (uint256 min, uint256 max);
    }
}

/// Human-readable signatures of the `IntVoteInterface` events.
pub const INT_VOTE_EVENT_SIGNATURES: [&str; 5] = [
    "event NewProposal(bytes32 indexed _proposalId, address indexed _avatar, uint256 _numOfChoices, address _proposer, bytes32 _paramsHash)",
    "event ExecuteProposal(bytes32 indexed _proposalId, address indexed _avatar, uint256 _decision, uint256 _totalReputation)",
    "event VoteProposal(bytes32 indexed _proposalId, address indexed _avatar, address indexed _voter, uint256 _vote, uint256 _reputation)",
    "event CancelProposal(bytes32 indexed _proposalId, address indexed _avatar)",
    "event CancelVoting(bytes32 indexed _proposalId, address indexed _avatar, address indexed _voter)",
];

/// Builds the node-side filter for `query`.
///
/// Argument filters on indexed parameters are pushed down as topics when every value fits in
/// a topic word. Everything else is left to the fetchers.
fn log_filter(event: &Event, query: &LogQuery, range: Option<FetchOptions>) -> Filter {
    let mut filter = Filter::new()
        .address(query.address)
        .event_signature(event.selector());
    if let Some(range) = range {
        filter = filter.from_block(range.from_block).to_block(range.to_block);
    }

    let indexed = event.inputs.iter().filter(|param| param.indexed);
    for (position, param) in indexed.enumerate() {
        let Some(values) = query.filter.get(&param.name) else {
            continue;
        };
        let Some(words) = values
            .iter()
            .map(DynSolValue::as_word)
            .collect::<Option<Vec<B256>>>()
        else {
            continue;
        };
        filter = match position {
            0 => filter.topic1(words),
            1 => filter.topic2(words),
            2 => filter.topic3(words),
            _ => filter,
        };
    }
    filter
}

/// Decodes one log against `event`.
fn to_raw_event(event: &Event, log: &Log) -> Result<RawEvent, LedgerError> {
    let decoded = event
        .decode_log(&log.inner.data, true)
        .context(DecodeLogSnafu {
            event: event.name.clone(),
        })?;
    let mut indexed = decoded.indexed.into_iter();
    let mut body = decoded.body.into_iter();

    let args: EventArgs = event
        .inputs
        .iter()
        .filter_map(|param| {
            let value = if param.indexed {
                indexed.next()
            } else {
                body.next()
            };
            value.map(|value| (param.name.clone(), value))
        })
        .collect();

    Ok(RawEvent {
        event: event.name.clone(),
        address: log.address(),
        transaction_hash: log.transaction_hash.context(MissingFieldSnafu {
            field: "transaction_hash",
        })?,
        log_index: log.log_index,
        block_number: log.block_number,
        args,
    })
}

/// Decodes `logs`, skipping those removed by a reorg.
fn decode_logs(event: &Event, logs: &[Log]) -> Result<LogDelivery, LedgerError> {
    logs.iter()
        .filter(|log| {
            if log.removed {
                debug!("Skipping reorged {} log in tx {:?}", event.name, log.transaction_hash);
            }
            !log.removed
        })
        .map(|log| to_raw_event(event, log))
        .collect::<Result<Vec<_>, _>>()
        .map(LogDelivery::Many)
}

/// [`EventSource`] backed by an alloy provider.
#[derive(Clone, Debug)]
pub struct AlloyEventSource<P> {
    provider: P,
    events: HashMap<String, Event>,
}

impl<P: Provider + 'static> AlloyEventSource<P> {
    /// Creates a source that knows no events yet.
    pub fn new(provider: P) -> Self {
        Self {
            provider,
            events: HashMap::new(),
        }
    }

    /// Registers an event by its human-readable signature.
    pub fn with_event(mut self, signature: &str) -> Result<Self, LedgerError> {
        let event = Event::parse(signature).context(EventSignatureSnafu { signature })?;
        self.events.insert(event.name.clone(), event);
        Ok(self)
    }

    /// Registers every `IntVoteInterface` event.
    pub fn with_int_vote_events(self) -> Result<Self, LedgerError> {
        INT_VOTE_EVENT_SIGNATURES
            .iter()
            .try_fold(self, |source, signature| source.with_event(signature))
    }

    fn event(&self, name: &str) -> Result<&Event, LedgerError> {
        self.events.get(name).context(UnknownEventSnafu { event: name })
    }
}

#[async_trait]
impl<P: Provider + 'static> EventSource for AlloyEventSource<P> {
    async fn get_logs(&self, query: &LogQuery) -> Result<LogDelivery, LedgerError> {
        let event = self.event(&query.event)?;
        let filter = log_filter(event, query, Some(query.range));
        let logs = self
            .provider
            .get_logs(&filter)
            .await
            .context(TransportSnafu)?;
        debug!("Fetched {} {} logs from {}", logs.len(), event.name, query.address);
        decode_logs(event, &logs)
    }

    async fn watch_logs(&self, query: &LogQuery) -> Result<LogStream, LedgerError> {
        let event = self.event(&query.event)?.clone();
        let filter = log_filter(&event, query, None);
        let poller = self
            .provider
            .watch_logs(&filter)
            .await
            .context(TransportSnafu)?;

        Ok(poller
            .into_stream()
            .map(move |logs| decode_logs(&event, &logs))
            .boxed())
    }
}

/// Waits for a sent transaction to be mined.
async fn confirm(
    method: &'static str,
    sent: Result<PendingTransactionBuilder<Ethereum>, alloy::contract::Error>,
) -> Result<TransactionReceipt, LedgerError> {
    sent.context(ContractCallSnafu { method })?
        .get_receipt()
        .await
        .context(PendingTransactionSnafu { method })
}

/// [`VotingMachineContract`] over an alloy provider.
#[derive(Clone, Debug)]
pub struct AlloyVotingMachine<P> {
    contract: IntVoteInterface::IntVoteInterfaceInstance<(), P>,
}

impl<P: Provider + Clone> AlloyVotingMachine<P> {
    /// Binds the voting machine at `address`.
    pub fn new(address: Address, provider: P) -> Self {
        Self {
            contract: IntVoteInterface::new(address, provider),
        }
    }
}

#[async_trait]
impl<P: Provider + Clone + 'static> VotingMachineContract for AlloyVotingMachine<P> {
    fn address(&self) -> Address {
        *self.contract.address()
    }

    async fn propose(
        &self,
        number_of_choices: U256,
        parameters_hash: B256,
        avatar: Address,
        executable: Address,
    ) -> Result<ProposedTx, LedgerError> {
        let sent = self
            .contract
            .propose(number_of_choices, parameters_hash, avatar, executable)
            .send()
            .await;
        let receipt = confirm("propose", sent).await?;

        let proposal_id = receipt
            .inner
            .logs()
            .iter()
            .filter(|log| log.address() == self.address())
            .find_map(|log| log.log_decode::<IntVoteInterface::NewProposal>().ok())
            .map(|log| log.inner.data._proposalId)
            .context(MissingFieldSnafu {
                field: "NewProposal",
            })?;

        Ok(ProposedTx {
            proposal_id,
            receipt: TxReceipt::from(&receipt),
        })
    }

    async fn vote(&self, proposal_id: B256, choice: U256) -> Result<TxReceipt, LedgerError> {
        let sent = self.contract.vote(proposal_id, choice).send().await;
        Ok(TxReceipt::from(&confirm("vote", sent).await?))
    }

    async fn owner_vote(
        &self,
        proposal_id: B256,
        choice: U256,
        voter: Address,
    ) -> Result<TxReceipt, LedgerError> {
        let sent = self
            .contract
            .ownerVote(proposal_id, choice, voter)
            .send()
            .await;
        Ok(TxReceipt::from(&confirm("ownerVote", sent).await?))
    }

    async fn vote_with_specified_amounts(
        &self,
        proposal_id: B256,
        choice: U256,
        reputation: U256,
        tokens: U256,
    ) -> Result<TxReceipt, LedgerError> {
        let sent = self
            .contract
            .voteWithSpecifiedAmounts(proposal_id, choice, reputation, tokens)
            .send()
            .await;
        Ok(TxReceipt::from(
            &confirm("voteWithSpecifiedAmounts", sent).await?,
        ))
    }

    async fn cancel_proposal(&self, proposal_id: B256) -> Result<TxReceipt, LedgerError> {
        let sent = self.contract.cancelProposal(proposal_id).send().await;
        Ok(TxReceipt::from(&confirm("cancelProposal", sent).await?))
    }

    async fn cancel_vote(&self, proposal_id: B256) -> Result<TxReceipt, LedgerError> {
        let sent = self.contract.cancelVote(proposal_id).send().await;
        Ok(TxReceipt::from(&confirm("cancelVote", sent).await?))
    }

    async fn execute(&self, proposal_id: B256) -> Result<TxReceipt, LedgerError> {
        let sent = self.contract.execute(proposal_id).send().await;
        Ok(TxReceipt::from(&confirm("execute", sent).await?))
    }

    async fn number_of_choices(&self, proposal_id: B256) -> Result<U256, LedgerError> {
        let choices = self
            .contract
            .getNumberOfChoices(proposal_id)
            .call()
            .await
            .context(ContractCallSnafu {
                method: "getNumberOfChoices",
            })?;
        Ok(choices._0)
    }

    async fn is_votable(&self, proposal_id: B256) -> Result<bool, LedgerError> {
        let votable = self
            .contract
            .isVotable(proposal_id)
            .call()
            .await
            .context(ContractCallSnafu {
                method: "isVotable",
            })?;
        Ok(votable._0)
    }

    async fn vote_status(&self, proposal_id: B256, choice: U256) -> Result<U256, LedgerError> {
        let status = self
            .contract
            .voteStatus(proposal_id, choice)
            .call()
            .await
            .context(ContractCallSnafu {
                method: "voteStatus",
            })?;
        Ok(status._0)
    }

    async fn is_abstain_allow(&self) -> Result<bool, LedgerError> {
        let allowed = self
            .contract
            .isAbstainAllow()
            .call()
            .await
            .context(ContractCallSnafu {
                method: "isAbstainAllow",
            })?;
        Ok(allowed._0)
    }

    async fn allowed_range_of_choices(&self) -> Result<(U256, U256), LedgerError> {
        let range = self
            .contract
            .getAllowedRangeOfChoices()
            .call()
            .await
            .context(ContractCallSnafu {
                method: "getAllowedRangeOfChoices",
            })?;
        Ok((range.min, range.max))
    }
}

#[cfg(test)]
mod tests {
    use alloy::primitives::LogData;
    use alloy::rpc::types::Topic;
    use alloy::sol_types::SolEvent;

    use super::*;
    use crate::filter::ArgFilter;

    fn new_proposal() -> Event {
        Event::parse(INT_VOTE_EVENT_SIGNATURES[0]).unwrap()
    }

    fn rpc_log(data: LogData) -> Log {
        Log {
            inner: alloy::primitives::Log {
                address: Address::repeat_byte(0x42),
                data,
            },
            block_hash: None,
            block_number: Some(12),
            block_timestamp: None,
            transaction_hash: Some(B256::repeat_byte(7)),
            transaction_index: None,
            log_index: Some(3),
            removed: false,
        }
    }

    #[test]
    fn signatures_match_binding() {
        for (signature, selector) in INT_VOTE_EVENT_SIGNATURES.iter().zip([
            IntVoteInterface::NewProposal::SIGNATURE_HASH,
            IntVoteInterface::ExecuteProposal::SIGNATURE_HASH,
            IntVoteInterface::VoteProposal::SIGNATURE_HASH,
            IntVoteInterface::CancelProposal::SIGNATURE_HASH,
            IntVoteInterface::CancelVoting::SIGNATURE_HASH,
        ]) {
            assert_eq!(Event::parse(signature).unwrap().selector(), selector);
        }
    }

    #[test]
    fn logs_decode_into_named_args() {
        let emitted = IntVoteInterface::NewProposal {
            _proposalId: B256::repeat_byte(1),
            _avatar: Address::repeat_byte(2),
            _numOfChoices: U256::from(2),
            _proposer: Address::repeat_byte(3),
            _paramsHash: B256::repeat_byte(4),
        };
        let log = rpc_log(emitted.encode_log_data());

        let event = to_raw_event(&new_proposal(), &log).unwrap();
        assert_eq!(event.event, "NewProposal");
        assert_eq!(event.address, Address::repeat_byte(0x42));
        assert_eq!(event.transaction_hash, B256::repeat_byte(7));
        assert_eq!(event.log_index, Some(3));
        assert_eq!(event.args.b256("_proposalId").unwrap(), B256::repeat_byte(1));
        assert_eq!(event.args.address("_avatar").unwrap(), Address::repeat_byte(2));
        assert_eq!(event.args.uint("_numOfChoices").unwrap(), U256::from(2));
        assert_eq!(event.args.address("_proposer").unwrap(), Address::repeat_byte(3));
        assert_eq!(event.args.b256("_paramsHash").unwrap(), B256::repeat_byte(4));
    }

    #[test]
    fn log_without_transaction_hash_is_rejected() {
        let emitted = IntVoteInterface::CancelProposal {
            _proposalId: B256::repeat_byte(1),
            _avatar: Address::repeat_byte(2),
        };
        let mut log = rpc_log(emitted.encode_log_data());
        log.transaction_hash = None;

        let event = Event::parse(INT_VOTE_EVENT_SIGNATURES[3]).unwrap();
        assert!(matches!(
            to_raw_event(&event, &log),
            Err(LedgerError::MissingField { .. })
        ));
    }

    #[test]
    fn reorged_logs_are_skipped() {
        let emitted = IntVoteInterface::CancelProposal {
            _proposalId: B256::repeat_byte(1),
            _avatar: Address::repeat_byte(2),
        };
        let live = rpc_log(emitted.encode_log_data());
        let mut reorged = live.clone();
        reorged.removed = true;
        reorged.transaction_hash = Some(B256::repeat_byte(8));

        let event = Event::parse(INT_VOTE_EVENT_SIGNATURES[3]).unwrap();
        let events = decode_logs(&event, &[reorged, live]).unwrap().into_vec();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].transaction_hash, B256::repeat_byte(7));
    }

    #[test]
    fn indexed_filters_become_topics() {
        let avatar = Address::repeat_byte(2);
        let query = LogQuery {
            event: "NewProposal".to_string(),
            address: Address::repeat_byte(0x42),
            filter: ArgFilter::new()
                .equals("_avatar", DynSolValue::Address(avatar))
                .equals("_proposer", DynSolValue::Address(Address::repeat_byte(3))),
            range: FetchOptions::from_block(100),
        };

        let filter = log_filter(&new_proposal(), &query, Some(query.range));
        assert_eq!(filter.topics[1], Topic::default());
        assert_eq!(filter.topics[2], Topic::from(avatar.into_word()));
        assert_eq!(filter.topics[3], Topic::default());
        assert_eq!(filter.get_from_block(), Some(100));
    }
}
