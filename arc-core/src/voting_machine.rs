//! # Voting Machine Facade
//!
//! Voting machines differ in their staking and quorum rules but share one proposal
//! lifecycle. [`VotingMachineContract`] is the narrow capability set a binding must provide;
//! [`VotingMachineFacade`] validates arguments in front of it, tracks transactions on an
//! optional [`TxBus`] and derives the composite queries (vote status across all choices).
//!
//! Facades are cheap wrappers. [`VotingMachineFacadeFactory::create`] may be called for the
//! same address any number of times.

use std::fmt;
use std::future::Future;
use std::sync::Arc;

use alloy::primitives::{Address, B256, U256};
use async_trait::async_trait;
use futures::future::try_join_all;
use log::debug;
use serde_json::json;

use crate::error::{Error, Result};
use crate::event_fetcher::EventFetcherFactory;
use crate::ledger::{EventSource, LedgerError, TxReceipt};
use crate::tx_bus::{TxBus, TX_TOPIC_ROOT};

/// Contract name used in the facade's transaction topics.
pub const VOTING_MACHINE_TOPIC: &str = "IntVoteInterface";

/// Most choices [`VotingMachineFacade::current_vote_status`] reads, whatever the machine allows.
pub const MAX_ENUMERATED_CHOICES: u64 = 256;

/// Outcome of a `propose` transaction.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ProposedTx {
    /// Id assigned by the voting machine.
    pub proposal_id: B256,
    /// The mined transaction.
    pub receipt: TxReceipt,
}

/// Calls a voting-machine binding must support.
#[async_trait]
pub trait VotingMachineContract: Send + Sync {
    /// Address of the bound contract.
    fn address(&self) -> Address;

    /// Registers a proposal with `number_of_choices` choices.
    async fn propose(
        &self,
        number_of_choices: U256,
        parameters_hash: B256,
        avatar: Address,
        executable: Address,
    ) -> Result<ProposedTx, LedgerError>;

    /// Votes with the sender's full reputation.
    async fn vote(&self, proposal_id: B256, choice: U256) -> Result<TxReceipt, LedgerError>;

    /// Votes on behalf of `voter`. Only the proposal owner may do this.
    async fn owner_vote(
        &self,
        proposal_id: B256,
        choice: U256,
        voter: Address,
    ) -> Result<TxReceipt, LedgerError>;

    /// Votes with an explicit amount of reputation and tokens.
    async fn vote_with_specified_amounts(
        &self,
        proposal_id: B256,
        choice: U256,
        reputation: U256,
        tokens: U256,
    ) -> Result<TxReceipt, LedgerError>;

    /// Cancels a proposal.
    async fn cancel_proposal(&self, proposal_id: B256) -> Result<TxReceipt, LedgerError>;

    /// Withdraws the sender's vote.
    async fn cancel_vote(&self, proposal_id: B256) -> Result<TxReceipt, LedgerError>;

    /// Executes a proposal whose decision is reached.
    async fn execute(&self, proposal_id: B256) -> Result<TxReceipt, LedgerError>;

    /// Number of choices of a proposal, abstain excluded.
    async fn number_of_choices(&self, proposal_id: B256) -> Result<U256, LedgerError>;

    /// Whether a proposal still accepts votes.
    async fn is_votable(&self, proposal_id: B256) -> Result<bool, LedgerError>;

    /// Reputation currently cast for `choice`.
    async fn vote_status(&self, proposal_id: B256, choice: U256) -> Result<U256, LedgerError>;

    /// Whether the machine tracks abstain votes (choice 0).
    async fn is_abstain_allow(&self) -> Result<bool, LedgerError>;

    /// Smallest and largest number of choices a proposal may have.
    async fn allowed_range_of_choices(&self) -> Result<(U256, U256), LedgerError>;
}

/// A validated vote choice. `0` is abstain.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct VoteChoice(u32);

impl VoteChoice {
    /// The abstain choice.
    pub const ABSTAIN: VoteChoice = VoteChoice(0);

    /// The choice as a plain integer.
    pub fn get(self) -> u32 {
        self.0
    }

    fn to_u256(self) -> U256 {
        U256::from(self.0)
    }
}

impl From<u32> for VoteChoice {
    fn from(choice: u32) -> Self {
        Self(choice)
    }
}

impl TryFrom<i64> for VoteChoice {
    type Error = Error;

    fn try_from(choice: i64) -> Result<Self> {
        u32::try_from(choice)
            .map(Self)
            .map_err(|_| Error::InvalidChoice { choice })
    }
}

impl fmt::Display for VoteChoice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

fn require_id(proposal_id: B256) -> Result<B256> {
    if proposal_id.is_zero() {
        return Err(Error::MissingArgument { name: "proposal_id" });
    }
    Ok(proposal_id)
}

fn require_address(address: Address, name: &'static str) -> Result<Address> {
    if address.is_zero() {
        return Err(Error::MissingArgument { name });
    }
    Ok(address)
}

/// Uniform front for one voting-machine contract.
#[derive(Clone)]
pub struct VotingMachineFacade {
    contract: Arc<dyn VotingMachineContract>,
    events: Arc<dyn EventSource>,
    bus: Option<TxBus>,
}

impl fmt::Debug for VotingMachineFacade {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VotingMachineFacade")
            .field("address", &self.contract.address())
            .field("bus", &self.bus)
            .finish_non_exhaustive()
    }
}

impl VotingMachineFacade {
    /// Wraps a bound contract. `events` serves the facade's event fetchers.
    pub fn new(contract: Arc<dyn VotingMachineContract>, events: Arc<dyn EventSource>) -> Self {
        Self {
            contract,
            events,
            bus: None,
        }
    }

    /// Publishes every transaction of this facade on `bus`.
    pub fn with_bus(mut self, bus: TxBus) -> Self {
        self.bus = Some(bus);
        self
    }

    /// Address of the voting machine.
    pub fn address(&self) -> Address {
        self.contract.address()
    }

    /// Event factory for `event` emitted by this voting machine.
    pub fn event_factory(&self, event: &str) -> EventFetcherFactory {
        EventFetcherFactory::new(Arc::clone(&self.events), self.address(), event)
    }

    /// Binds the facade to one proposal.
    pub fn for_proposal(&self, proposal_id: B256) -> Result<ProposalVoting> {
        Ok(ProposalVoting {
            facade: self.clone(),
            proposal_id: require_id(proposal_id)?,
        })
    }

    /// Runs one transaction, announcing it on the bus when one is configured.
    ///
    /// Callers validate before this runs. The kick-off goes out before `send` is awaited, so a
    /// failed submission leaves a kick-off with no transaction envelope after it.
    async fn tracked<T, F>(
        &self,
        method: &'static str,
        options: serde_json::Value,
        send: F,
        receipt_of: fn(&T) -> &TxReceipt,
    ) -> Result<T>
    where
        F: Future<Output = Result<T, LedgerError>>,
    {
        let context = self.bus.as_ref().map(|bus| {
            let topic = format!("{TX_TOPIC_ROOT}.{VOTING_MACHINE_TOPIC}.{method}");
            bus.begin(topic, options, 1, false)
        });

        let outcome = send.await?;
        let receipt = receipt_of(&outcome);
        debug!(
            "{method} on {} mined in tx {}",
            self.address(),
            receipt.transaction_hash
        );
        if let Some(context) = context {
            context.publish_tx(receipt.clone());
        }
        Ok(outcome)
    }

    /// Fails unless `choice` is within the proposal's choices.
    async fn check_choice(&self, proposal_id: B256, choice: VoteChoice) -> Result<()> {
        let max = self.number_of_choices(proposal_id).await?;
        if u64::from(choice.get()) > max {
            return Err(Error::ChoiceOutOfRange {
                choice: choice.get(),
                max,
            });
        }
        Ok(())
    }

    /// Registers a new proposal.
    pub async fn propose(
        &self,
        number_of_choices: u64,
        parameters_hash: B256,
        avatar: Address,
        executable: Address,
    ) -> Result<ProposedTx> {
        if number_of_choices == 0 {
            return Err(Error::MissingArgument {
                name: "number_of_choices",
            });
        }
        let avatar = require_address(avatar, "avatar")?;
        let executable = require_address(executable, "executable")?;

        let options = json!({
            "numOfChoices": number_of_choices,
            "paramsHash": parameters_hash,
            "avatar": avatar,
            "executable": executable,
        });
        let send = self.contract.propose(
            U256::from(number_of_choices),
            parameters_hash,
            avatar,
            executable,
        );
        self.tracked("propose", options, send, |proposed| &proposed.receipt)
            .await
    }

    /// Votes on a proposal. `choice` must be non-negative and within the proposal's choices.
    pub async fn vote(&self, proposal_id: B256, choice: i64) -> Result<TxReceipt> {
        let proposal_id = require_id(proposal_id)?;
        let choice = VoteChoice::try_from(choice)?;
        self.check_choice(proposal_id, choice).await?;

        let options = json!({ "proposalId": proposal_id, "vote": choice.get() });
        let send = self.contract.vote(proposal_id, choice.to_u256());
        self.tracked("vote", options, send, |receipt| receipt).await
    }

    /// Votes on behalf of `voter`.
    pub async fn owner_vote(
        &self,
        proposal_id: B256,
        choice: i64,
        voter: Address,
    ) -> Result<TxReceipt> {
        let proposal_id = require_id(proposal_id)?;
        let choice = VoteChoice::try_from(choice)?;
        let voter = require_address(voter, "voter")?;
        self.check_choice(proposal_id, choice).await?;

        let options = json!({ "proposalId": proposal_id, "vote": choice.get(), "voter": voter });
        let send = self.contract.owner_vote(proposal_id, choice.to_u256(), voter);
        self.tracked("ownerVote", options, send, |receipt| receipt)
            .await
    }

    /// Votes with explicit reputation and token amounts.
    pub async fn vote_with_specified_amounts(
        &self,
        proposal_id: B256,
        choice: i64,
        reputation: U256,
        tokens: U256,
    ) -> Result<TxReceipt> {
        let proposal_id = require_id(proposal_id)?;
        let choice = VoteChoice::try_from(choice)?;
        self.check_choice(proposal_id, choice).await?;

        let options = json!({
            "proposalId": proposal_id,
            "vote": choice.get(),
            "reputation": reputation,
            "tokens": tokens,
        });
        let send =
            self.contract
                .vote_with_specified_amounts(proposal_id, choice.to_u256(), reputation, tokens);
        self.tracked("voteWithSpecifiedAmounts", options, send, |receipt| receipt)
            .await
    }

    /// Cancels a proposal.
    pub async fn cancel_proposal(&self, proposal_id: B256) -> Result<TxReceipt> {
        let proposal_id = require_id(proposal_id)?;
        let send = self.contract.cancel_proposal(proposal_id);
        self.tracked(
            "cancelProposal",
            json!({ "proposalId": proposal_id }),
            send,
            |receipt| receipt,
        )
        .await
    }

    /// Withdraws the sender's vote.
    pub async fn cancel_vote(&self, proposal_id: B256) -> Result<TxReceipt> {
        let proposal_id = require_id(proposal_id)?;
        let send = self.contract.cancel_vote(proposal_id);
        self.tracked(
            "cancelVote",
            json!({ "proposalId": proposal_id }),
            send,
            |receipt| receipt,
        )
        .await
    }

    /// Executes a decided proposal.
    pub async fn execute(&self, proposal_id: B256) -> Result<TxReceipt> {
        let proposal_id = require_id(proposal_id)?;
        let send = self.contract.execute(proposal_id);
        self.tracked(
            "execute",
            json!({ "proposalId": proposal_id }),
            send,
            |receipt| receipt,
        )
        .await
    }

    /// Number of choices of a proposal, abstain excluded.
    pub async fn number_of_choices(&self, proposal_id: B256) -> Result<u64> {
        let proposal_id = require_id(proposal_id)?;
        let choices = self.contract.number_of_choices(proposal_id).await?;
        Ok(choices.saturating_to())
    }

    /// Whether a proposal still accepts votes.
    pub async fn is_votable(&self, proposal_id: B256) -> Result<bool> {
        let proposal_id = require_id(proposal_id)?;
        Ok(self.contract.is_votable(proposal_id).await?)
    }

    /// Reputation currently cast for `choice`.
    pub async fn vote_status(&self, proposal_id: B256, choice: i64) -> Result<U256> {
        let proposal_id = require_id(proposal_id)?;
        let choice = VoteChoice::try_from(choice)?;
        Ok(self
            .contract
            .vote_status(proposal_id, choice.to_u256())
            .await?)
    }

    /// Whether abstain votes are tracked.
    pub async fn is_abstain_allow(&self) -> Result<bool> {
        Ok(self.contract.is_abstain_allow().await?)
    }

    /// Smallest and largest number of choices a proposal may have.
    pub async fn allowed_range_of_choices(&self) -> Result<(u64, u64)> {
        let (min, max) = self.contract.allowed_range_of_choices().await?;
        Ok((min.saturating_to(), max.saturating_to()))
    }

    /// Reputation cast for every choice, indexed by choice.
    ///
    /// The result always starts with the abstain entry. When the machine does not track
    /// abstain votes that entry is zero and the machine is not asked for it.
    ///
    /// Fails with [`Error::TooManyChoices`] when the proposal claims more choices than the
    /// machine's allowed range, or than [`MAX_ENUMERATED_CHOICES`].
    pub async fn current_vote_status(&self, proposal_id: B256) -> Result<Vec<U256>> {
        let proposal_id = require_id(proposal_id)?;
        let (choices, abstain, (_, allowed)) = futures::try_join!(
            self.number_of_choices(proposal_id),
            self.is_abstain_allow(),
            self.allowed_range_of_choices()
        )?;
        let max = allowed.min(MAX_ENUMERATED_CHOICES);
        if choices > max {
            return Err(Error::TooManyChoices { choices, max });
        }

        let first = if abstain { 0 } else { 1 };
        let counted = try_join_all((first..=choices).map(|choice| {
            self.contract
                .vote_status(proposal_id, U256::from(choice))
        }))
        .await?;

        let mut status = Vec::with_capacity(counted.len() + 1);
        if !abstain {
            status.push(U256::ZERO);
        }
        status.extend(counted);
        Ok(status)
    }
}

/// Produces the binding of a voting machine at a given address.
pub type ContractBinder = Arc<dyn Fn(Address) -> Arc<dyn VotingMachineContract> + Send + Sync>;

/// Creates facades by voting-machine address.
#[derive(Clone)]
pub struct VotingMachineFacadeFactory {
    binder: ContractBinder,
    events: Arc<dyn EventSource>,
    bus: Option<TxBus>,
}

impl fmt::Debug for VotingMachineFacadeFactory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VotingMachineFacadeFactory")
            .field("bus", &self.bus)
            .finish_non_exhaustive()
    }
}

impl VotingMachineFacadeFactory {
    /// Creates a factory binding contracts with `binder` and reading events from `events`.
    pub fn new<B>(events: Arc<dyn EventSource>, binder: B) -> Self
    where
        B: Fn(Address) -> Arc<dyn VotingMachineContract> + Send + Sync + 'static,
    {
        Self {
            binder: Arc::new(binder),
            events,
            bus: None,
        }
    }

    /// Hands `bus` to every facade created from now on.
    pub fn with_bus(mut self, bus: TxBus) -> Self {
        self.bus = Some(bus);
        self
    }

    /// Returns a facade for the voting machine at `address`.
    pub fn create(&self, address: Address) -> Result<VotingMachineFacade> {
        let address = require_address(address, "voting_machine")?;
        let facade = VotingMachineFacade::new((self.binder)(address), Arc::clone(&self.events));
        Ok(match &self.bus {
            Some(bus) => facade.with_bus(bus.clone()),
            None => facade,
        })
    }
}

/// A facade bound to one proposal.
#[derive(Clone, Debug)]
pub struct ProposalVoting {
    facade: VotingMachineFacade,
    proposal_id: B256,
}

impl ProposalVoting {
    /// The bound proposal.
    pub fn proposal_id(&self) -> B256 {
        self.proposal_id
    }

    /// The underlying facade.
    pub fn facade(&self) -> &VotingMachineFacade {
        &self.facade
    }

    /// See [`VotingMachineFacade::vote`].
    pub async fn vote(&self, choice: i64) -> Result<TxReceipt> {
        self.facade.vote(self.proposal_id, choice).await
    }

    /// See [`VotingMachineFacade::owner_vote`].
    pub async fn owner_vote(&self, choice: i64, voter: Address) -> Result<TxReceipt> {
        self.facade
            .owner_vote(self.proposal_id, choice, voter)
            .await
    }

    /// See [`VotingMachineFacade::vote_with_specified_amounts`].
    pub async fn vote_with_specified_amounts(
        &self,
        choice: i64,
        reputation: U256,
        tokens: U256,
    ) -> Result<TxReceipt> {
        self.facade
            .vote_with_specified_amounts(self.proposal_id, choice, reputation, tokens)
            .await
    }

    /// See [`VotingMachineFacade::cancel_vote`].
    pub async fn cancel_vote(&self) -> Result<TxReceipt> {
        self.facade.cancel_vote(self.proposal_id).await
    }

    /// See [`VotingMachineFacade::cancel_proposal`].
    pub async fn cancel_proposal(&self) -> Result<TxReceipt> {
        self.facade.cancel_proposal(self.proposal_id).await
    }

    /// See [`VotingMachineFacade::execute`].
    pub async fn execute(&self) -> Result<TxReceipt> {
        self.facade.execute(self.proposal_id).await
    }

    /// See [`VotingMachineFacade::is_votable`].
    pub async fn is_votable(&self) -> Result<bool> {
        self.facade.is_votable(self.proposal_id).await
    }

    /// See [`VotingMachineFacade::number_of_choices`].
    pub async fn number_of_choices(&self) -> Result<u64> {
        self.facade.number_of_choices(self.proposal_id).await
    }

    /// See [`VotingMachineFacade::vote_status`].
    pub async fn vote_status(&self, choice: i64) -> Result<U256> {
        self.facade.vote_status(self.proposal_id, choice).await
    }

    /// See [`VotingMachineFacade::current_vote_status`].
    pub async fn current_vote_status(&self) -> Result<Vec<U256>> {
        self.facade.current_vote_status(self.proposal_id).await
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;
    use crate::testing::{MemoryEventSource, MemoryVotingMachine};
    use crate::tx_bus::TxEventEnvelope;

    const MACHINE: u8 = 0x42;

    fn proposal(n: u8) -> B256 {
        B256::repeat_byte(n)
    }

    fn facade(machine: &Arc<MemoryVotingMachine>) -> VotingMachineFacade {
        VotingMachineFacade::new(machine.clone(), Arc::new(MemoryEventSource::new()))
    }

    #[tokio::test]
    async fn abstain_entry_is_present_when_not_tracked() {
        let machine = Arc::new(MemoryVotingMachine::new(Address::repeat_byte(MACHINE)));
        machine.add_proposal(proposal(1), 2, true);
        let facade = facade(&machine);
        facade.vote(proposal(1), 2).await.unwrap();

        let status = facade.current_vote_status(proposal(1)).await.unwrap();
        assert_eq!(status, vec![U256::ZERO, U256::ZERO, U256::from(1)]);
        assert!(!machine.calls().iter().any(|c| c.ends_with(",0)")));
    }

    #[tokio::test]
    async fn abstain_is_read_when_tracked() {
        let machine =
            Arc::new(MemoryVotingMachine::new(Address::repeat_byte(MACHINE)).with_abstain(true));
        machine.add_proposal(proposal(1), 2, true);
        let facade = facade(&machine);
        facade.vote(proposal(1), 0).await.unwrap();

        let status = facade.current_vote_status(proposal(1)).await.unwrap();
        assert_eq!(status, vec![U256::from(1), U256::ZERO, U256::ZERO]);
    }

    #[tokio::test]
    async fn validation_happens_before_dispatch() {
        let machine = Arc::new(MemoryVotingMachine::new(Address::repeat_byte(MACHINE)));
        machine.add_proposal(proposal(1), 2, true);
        let facade = facade(&machine);

        assert!(matches!(
            facade.vote(proposal(1), -1).await,
            Err(Error::InvalidChoice { choice: -1 })
        ));
        assert!(matches!(
            facade.vote(B256::ZERO, 1).await,
            Err(Error::MissingArgument { name: "proposal_id" })
        ));
        assert!(matches!(
            facade.owner_vote(proposal(1), 1, Address::ZERO).await,
            Err(Error::MissingArgument { name: "voter" })
        ));
        assert!(matches!(
            facade
                .propose(2, B256::ZERO, Address::ZERO, Address::repeat_byte(1))
                .await,
            Err(Error::MissingArgument { name: "avatar" })
        ));
        assert!(machine.calls().is_empty());

        assert!(matches!(
            facade.vote(proposal(1), 3).await,
            Err(Error::ChoiceOutOfRange { choice: 3, max: 2 })
        ));
        assert_eq!(machine.calls().len(), 1);
    }

    #[tokio::test]
    async fn implausible_choice_counts_are_not_enumerated() {
        let machine = Arc::new(MemoryVotingMachine::new(Address::repeat_byte(MACHINE)));
        machine.add_proposal(proposal(1), u64::MAX, true);
        machine.add_proposal(proposal(2), 11, true);
        let facade = facade(&machine);

        assert!(matches!(
            facade.current_vote_status(proposal(1)).await,
            Err(Error::TooManyChoices { max: 10, .. })
        ));
        assert!(matches!(
            facade.current_vote_status(proposal(2)).await,
            Err(Error::TooManyChoices { choices: 11, max: 10 })
        ));
        assert!(!machine.calls().iter().any(|c| c.starts_with("voteStatus")));
    }

    #[tokio::test]
    async fn allowed_range_reflects_abstain() {
        let plain = Arc::new(MemoryVotingMachine::new(Address::repeat_byte(MACHINE)));
        assert_eq!(facade(&plain).allowed_range_of_choices().await.unwrap(), (1, 10));

        let abstaining =
            Arc::new(MemoryVotingMachine::new(Address::repeat_byte(MACHINE)).with_abstain(true));
        assert_eq!(facade(&abstaining).allowed_range_of_choices().await.unwrap(), (0, 10));
    }

    #[tokio::test]
    async fn cancellations_reach_the_machine() {
        let machine = Arc::new(MemoryVotingMachine::new(Address::repeat_byte(MACHINE)));
        machine.add_proposal(proposal(1), 2, true);
        let facade = facade(&machine);

        facade.vote(proposal(1), 1).await.unwrap();
        facade.cancel_vote(proposal(1)).await.unwrap();
        assert_eq!(facade.vote_status(proposal(1), 1).await.unwrap(), U256::ZERO);
        assert!(facade.is_votable(proposal(1)).await.unwrap());

        let receipt = facade.cancel_proposal(proposal(1)).await.unwrap();
        assert!(receipt.success);
        assert!(!facade.is_votable(proposal(1)).await.unwrap());

        assert!(matches!(
            facade.cancel_vote(B256::ZERO).await,
            Err(Error::MissingArgument { name: "proposal_id" })
        ));
        assert!(matches!(
            facade.cancel_proposal(B256::ZERO).await,
            Err(Error::MissingArgument { name: "proposal_id" })
        ));
        assert!(matches!(
            facade.cancel_proposal(proposal(9)).await,
            Err(Error::Ledger { .. })
        ));
    }

    #[test]
    fn vote_choice_rejects_negative_and_oversized() {
        assert_eq!(VoteChoice::try_from(3i64).unwrap().get(), 3);
        assert_eq!(VoteChoice::try_from(0i64).unwrap(), VoteChoice::ABSTAIN);
        assert!(VoteChoice::try_from(-2i64).is_err());
        assert!(VoteChoice::try_from(i64::from(u32::MAX) + 1).is_err());
    }

    #[tokio::test]
    async fn transactions_are_announced_on_the_bus() {
        let machine = Arc::new(MemoryVotingMachine::new(Address::repeat_byte(MACHINE)));
        let bus = TxBus::new();
        let seen: Arc<Mutex<Vec<(String, TxEventEnvelope)>>> = Arc::default();
        let sink = seen.clone();
        bus.subscribe(["txReceipts.IntVoteInterface"], move |topic, envelope| {
            sink.lock()
                .unwrap()
                .push((topic.to_string(), envelope.clone()));
        });

        let facade = facade(&machine).with_bus(bus);
        let proposed = facade
            .propose(2, B256::ZERO, Address::repeat_byte(1), Address::repeat_byte(2))
            .await
            .unwrap();
        facade.vote(proposed.proposal_id, 1).await.unwrap();

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 4);
        assert_eq!(seen[0].0, "txReceipts.IntVoteInterface.propose");
        assert!(seen[0].1.is_kickoff());
        assert_eq!(seen[1].1.tx.as_ref(), Some(&proposed.receipt));
        assert_eq!(seen[0].1.invocation_key, seen[1].1.invocation_key);
        assert_eq!(seen[2].0, "txReceipts.IntVoteInterface.vote");
        assert_eq!(seen[3].1.options["vote"], 1);
        assert_ne!(seen[1].1.invocation_key, seen[3].1.invocation_key);
    }

    #[tokio::test]
    async fn factory_creates_independent_lightweight_facades() {
        let machine = Arc::new(MemoryVotingMachine::new(Address::repeat_byte(MACHINE)));
        machine.add_proposal(proposal(7), 3, true);
        let bound = machine.clone();
        let factory =
            VotingMachineFacadeFactory::new(Arc::new(MemoryEventSource::new()), move |_| {
                bound.clone() as Arc<dyn VotingMachineContract>
            });

        let a = factory.create(Address::repeat_byte(MACHINE)).unwrap();
        let b = factory.create(Address::repeat_byte(MACHINE)).unwrap();
        assert_eq!(a.address(), b.address());
        assert!(machine.calls().is_empty());
        assert!(matches!(
            factory.create(Address::ZERO),
            Err(Error::MissingArgument { .. })
        ));

        let voting = a.for_proposal(proposal(7)).unwrap();
        assert_eq!(voting.number_of_choices().await.unwrap(), 3);
        voting
            .vote_with_specified_amounts(2, U256::from(50), U256::ZERO)
            .await
            .unwrap();
        assert_eq!(voting.vote_status(2).await.unwrap(), U256::from(50));
        voting.execute().await.unwrap();
        assert!(!b.is_votable(proposal(7)).await.unwrap());
    }
}
