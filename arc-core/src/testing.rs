//! In-memory ledger for tests.
//!
//! [`MemoryEventSource`] replays scripted `get_logs` responses and forwards live deliveries
//! pushed with [`MemoryEventSource::emit`]. [`MemoryVotingMachine`] keeps proposal state and
//! vote tallies in memory and records every call it receives.

use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard};

use alloy::dyn_abi::DynSolValue;
use alloy::primitives::{Address, B256, U256};
use async_stream::stream;
use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::ledger::{
    EventArgs,
    EventSource,
    LedgerError,
    LogDelivery,
    LogQuery,
    LogStream,
    RawEvent,
    TxReceipt,
};
use crate::voting_machine::{ProposedTx, VotingMachineContract};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

type Delivery = Result<LogDelivery, LedgerError>;

/// Builds a log of `event` from transaction `0x{tx}{tx}..` at `log_index`, without arguments.
pub fn raw_event(event: &str, tx: u8, log_index: u64) -> RawEvent {
    RawEvent {
        event: event.to_string(),
        address: Address::repeat_byte(0xaa),
        transaction_hash: B256::repeat_byte(tx),
        log_index: Some(log_index),
        block_number: Some(u64::from(tx)),
        args: EventArgs::new(),
    }
}

/// Builds a `NewProposal` log for `proposal_id` under `avatar`.
pub fn new_proposal_event(tx: u8, proposal_id: B256, avatar: Address, choices: u64) -> RawEvent {
    let mut event = raw_event("NewProposal", tx, 0);
    event.args = EventArgs::new()
        .with("_proposalId", DynSolValue::FixedBytes(proposal_id, 32))
        .with("_avatar", DynSolValue::Address(avatar))
        .with("_numOfChoices", DynSolValue::Uint(U256::from(choices), 256))
        .with("_proposer", DynSolValue::Address(Address::repeat_byte(0x11)))
        .with("_paramsHash", DynSolValue::FixedBytes(B256::ZERO, 32));
    event
}

/// Scripted [`EventSource`].
#[derive(Debug)]
pub struct MemoryEventSource {
    history: Mutex<VecDeque<Delivery>>,
    live_tx: mpsc::UnboundedSender<Delivery>,
    live_rx: Mutex<Option<mpsc::UnboundedReceiver<Delivery>>>,
    queries: Mutex<Vec<LogQuery>>,
}

impl Default for MemoryEventSource {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryEventSource {
    /// Creates a source with no history and an idle live channel.
    pub fn new() -> Self {
        let (live_tx, live_rx) = mpsc::unbounded_channel();
        Self {
            history: Mutex::new(VecDeque::new()),
            live_tx,
            live_rx: Mutex::new(Some(live_rx)),
            queries: Mutex::new(Vec::new()),
        }
    }

    /// Queues the response of the next `get_logs` call.
    pub fn push_history(&self, delivery: impl Into<LogDelivery>) {
        lock(&self.history).push_back(Ok(delivery.into()));
    }

    /// Makes the next `get_logs` call fail.
    pub fn push_history_error(&self, message: &str) {
        lock(&self.history).push_back(Err(LedgerError::Provider {
            message: message.to_string(),
        }));
    }

    /// Pushes a live batch to the watcher.
    pub fn emit(&self, delivery: impl Into<LogDelivery>) {
        let _ = self.live_tx.send(Ok(delivery.into()));
    }

    /// Pushes a live error to the watcher.
    pub fn emit_error(&self, message: &str) {
        let _ = self.live_tx.send(Err(LedgerError::Provider {
            message: message.to_string(),
        }));
    }

    /// Every query received so far, in order.
    pub fn queries(&self) -> Vec<LogQuery> {
        lock(&self.queries).clone()
    }
}

#[async_trait]
impl EventSource for MemoryEventSource {
    async fn get_logs(&self, query: &LogQuery) -> Result<LogDelivery, LedgerError> {
        lock(&self.queries).push(query.clone());
        lock(&self.history)
            .pop_front()
            .unwrap_or_else(|| Ok(LogDelivery::Many(Vec::new())))
    }

    async fn watch_logs(&self, query: &LogQuery) -> Result<LogStream, LedgerError> {
        lock(&self.queries).push(query.clone());
        let mut rx = lock(&self.live_rx).take().ok_or_else(|| LedgerError::Provider {
            message: "memory source supports a single live subscription".to_string(),
        })?;

        Ok(Box::pin(stream! {
            while let Some(delivery) = rx.recv().await {
                yield delivery;
            }
        }))
    }
}

/// State of one proposal in a [`MemoryVotingMachine`].
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct MemoryProposal {
    /// Number of choices, abstain excluded.
    pub number_of_choices: u64,
    /// Whether voting is open.
    pub votable: bool,
    /// Reputation cast per choice.
    pub votes: HashMap<U256, U256>,
}

#[derive(Debug, Default)]
struct MachineState {
    proposals: HashMap<B256, MemoryProposal>,
    calls: Vec<String>,
    next_tx: u64,
    failing_reads: bool,
}

impl MachineState {
    fn receipt(&mut self) -> TxReceipt {
        self.next_tx += 1;
        TxReceipt {
            transaction_hash: B256::left_padding_from(&self.next_tx.to_be_bytes()),
            block_number: Some(self.next_tx),
            success: true,
        }
    }

    fn read(&mut self, call: String) -> Result<(), LedgerError> {
        self.calls.push(call);
        if self.failing_reads {
            return Err(LedgerError::Provider {
                message: "read failed".to_string(),
            });
        }
        Ok(())
    }

    fn proposal(&mut self, proposal_id: B256) -> Result<&mut MemoryProposal, LedgerError> {
        self.proposals
            .get_mut(&proposal_id)
            .ok_or_else(|| LedgerError::Provider {
                message: format!("unknown proposal {proposal_id}"),
            })
    }
}

/// In-memory [`VotingMachineContract`].
#[derive(Debug)]
pub struct MemoryVotingMachine {
    address: Address,
    abstain_allowed: bool,
    state: Mutex<MachineState>,
}

impl MemoryVotingMachine {
    /// Creates a machine at `address` that does not allow abstaining.
    pub fn new(address: Address) -> Self {
        Self {
            address,
            abstain_allowed: false,
            state: Mutex::new(MachineState::default()),
        }
    }

    /// Sets whether abstaining (choice 0) is tracked.
    pub fn with_abstain(mut self, allowed: bool) -> Self {
        self.abstain_allowed = allowed;
        self
    }

    /// Registers a proposal.
    pub fn add_proposal(&self, proposal_id: B256, number_of_choices: u64, votable: bool) {
        lock(&self.state).proposals.insert(
            proposal_id,
            MemoryProposal {
                number_of_choices,
                votable,
                votes: HashMap::new(),
            },
        );
    }

    /// Returns a proposal's current state.
    pub fn proposal(&self, proposal_id: B256) -> Option<MemoryProposal> {
        lock(&self.state).proposals.get(&proposal_id).cloned()
    }

    /// Makes every subsequent read call fail.
    pub fn fail_reads(&self) {
        lock(&self.state).failing_reads = true;
    }

    /// Names of the calls received so far, in order.
    pub fn calls(&self) -> Vec<String> {
        lock(&self.state).calls.clone()
    }

    fn cast(
        &self,
        call: &str,
        proposal_id: B256,
        choice: U256,
        amount: U256,
    ) -> Result<TxReceipt, LedgerError> {
        let mut state = lock(&self.state);
        state.calls.push(call.to_string());
        let proposal = state.proposal(proposal_id)?;
        *proposal.votes.entry(choice).or_default() += amount;
        Ok(state.receipt())
    }
}

#[async_trait]
impl VotingMachineContract for MemoryVotingMachine {
    fn address(&self) -> Address {
        self.address
    }

    async fn propose(
        &self,
        number_of_choices: U256,
        _parameters_hash: B256,
        _avatar: Address,
        _executable: Address,
    ) -> Result<ProposedTx, LedgerError> {
        let mut state = lock(&self.state);
        state.calls.push("propose".to_string());
        let receipt = state.receipt();
        let proposal_id = receipt.transaction_hash;
        state.proposals.insert(
            proposal_id,
            MemoryProposal {
                number_of_choices: number_of_choices.saturating_to(),
                votable: true,
                votes: HashMap::new(),
            },
        );
        Ok(ProposedTx {
            proposal_id,
            receipt,
        })
    }

    async fn vote(&self, proposal_id: B256, choice: U256) -> Result<TxReceipt, LedgerError> {
        self.cast("vote", proposal_id, choice, U256::from(1))
    }

    async fn owner_vote(
        &self,
        proposal_id: B256,
        choice: U256,
        _voter: Address,
    ) -> Result<TxReceipt, LedgerError> {
        self.cast("ownerVote", proposal_id, choice, U256::from(1))
    }

    async fn vote_with_specified_amounts(
        &self,
        proposal_id: B256,
        choice: U256,
        reputation: U256,
        _tokens: U256,
    ) -> Result<TxReceipt, LedgerError> {
        self.cast("voteWithSpecifiedAmounts", proposal_id, choice, reputation)
    }

    async fn cancel_proposal(&self, proposal_id: B256) -> Result<TxReceipt, LedgerError> {
        let mut state = lock(&self.state);
        state.calls.push("cancelProposal".to_string());
        state.proposal(proposal_id)?.votable = false;
        Ok(state.receipt())
    }

    async fn cancel_vote(&self, proposal_id: B256) -> Result<TxReceipt, LedgerError> {
        let mut state = lock(&self.state);
        state.calls.push("cancelVote".to_string());
        state.proposal(proposal_id)?.votes.clear();
        Ok(state.receipt())
    }

    async fn execute(&self, proposal_id: B256) -> Result<TxReceipt, LedgerError> {
        let mut state = lock(&self.state);
        state.calls.push("execute".to_string());
        state.proposal(proposal_id)?.votable = false;
        Ok(state.receipt())
    }

    async fn number_of_choices(&self, proposal_id: B256) -> Result<U256, LedgerError> {
        let mut state = lock(&self.state);
        state.read(format!("getNumberOfChoices({proposal_id})"))?;
        let choices = state
            .proposals
            .get(&proposal_id)
            .map_or(0, |p| p.number_of_choices);
        Ok(U256::from(choices))
    }

    async fn is_votable(&self, proposal_id: B256) -> Result<bool, LedgerError> {
        let mut state = lock(&self.state);
        state.read(format!("isVotable({proposal_id})"))?;
        Ok(state.proposals.get(&proposal_id).is_some_and(|p| p.votable))
    }

    async fn vote_status(&self, proposal_id: B256, choice: U256) -> Result<U256, LedgerError> {
        let mut state = lock(&self.state);
        state.read(format!("voteStatus({proposal_id},{choice})"))?;
        Ok(state
            .proposals
            .get(&proposal_id)
            .and_then(|p| p.votes.get(&choice).copied())
            .unwrap_or_default())
    }

    async fn is_abstain_allow(&self) -> Result<bool, LedgerError> {
        lock(&self.state).read("isAbstainAllow".to_string())?;
        Ok(self.abstain_allowed)
    }

    async fn allowed_range_of_choices(&self) -> Result<(U256, U256), LedgerError> {
        lock(&self.state).read("getAllowedRangeOfChoices".to_string())?;
        let min = if self.abstain_allowed { 0 } else { 1 };
        Ok((U256::from(min), U256::from(10)))
    }
}
