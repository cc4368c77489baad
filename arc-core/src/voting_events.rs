//! Typed events of the `IntVoteInterface` voting machines.
//!
//! Each event decodes from a [`RawEvent`] through `TryFrom`, and the facade exposes an
//! entity fetcher factory per event, optionally scoped to one avatar.

use alloy::dyn_abi::DynSolValue;
use alloy::primitives::{Address, B256, U256};

use crate::entity_fetcher::{transform, EntityFetcherFactory, Transform};
use crate::error::Error;
use crate::filter::ArgFilter;
use crate::ledger::RawEvent;
use crate::voting_machine::VotingMachineFacade;

/// `NewProposal(bytes32 indexed _proposalId, address indexed _avatar, uint256 _numOfChoices, address _proposer, bytes32 _paramsHash)`
pub const NEW_PROPOSAL: &str = "NewProposal";
/// `ExecuteProposal(bytes32 indexed _proposalId, address indexed _avatar, uint256 _decision, uint256 _totalReputation)`
pub const EXECUTE_PROPOSAL: &str = "ExecuteProposal";
/// `VoteProposal(bytes32 indexed _proposalId, address indexed _avatar, address indexed _voter, uint256 _vote, uint256 _reputation)`
pub const VOTE_PROPOSAL: &str = "VoteProposal";
/// `CancelProposal(bytes32 indexed _proposalId, address indexed _avatar)`
pub const CANCEL_PROPOSAL: &str = "CancelProposal";
/// `CancelVoting(bytes32 indexed _proposalId, address indexed _avatar, address indexed _voter)`
pub const CANCEL_VOTING: &str = "CancelVoting";

/// Argument holding the proposal id in every voting-machine event.
pub const PROPOSAL_ID_ARG: &str = "_proposalId";
/// Argument holding the avatar in every voting-machine event.
pub const AVATAR_ARG: &str = "_avatar";

/// A proposal was registered.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NewProposalEvent {
    /// Proposal id.
    pub proposal_id: B256,
    /// Avatar the proposal belongs to.
    pub avatar: Address,
    /// Number of choices, abstain excluded.
    pub number_of_choices: U256,
    /// Account that proposed.
    pub proposer: Address,
    /// Hash of the voting parameters.
    pub parameters_hash: B256,
}

impl TryFrom<&RawEvent> for NewProposalEvent {
    type Error = Error;

    fn try_from(event: &RawEvent) -> Result<Self, Error> {
        let args = &event.args;
        Ok(Self {
            proposal_id: args.b256(PROPOSAL_ID_ARG)?,
            avatar: args.address(AVATAR_ARG)?,
            number_of_choices: args.uint("_numOfChoices")?,
            proposer: args.address("_proposer")?,
            parameters_hash: args.b256("_paramsHash")?,
        })
    }
}

/// A proposal was executed with `decision`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ExecuteProposalEvent {
    /// Proposal id.
    pub proposal_id: B256,
    /// Avatar the proposal belongs to.
    pub avatar: Address,
    /// Winning choice.
    pub decision: U256,
    /// Total reputation at execution.
    pub total_reputation: U256,
}

impl TryFrom<&RawEvent> for ExecuteProposalEvent {
    type Error = Error;

    fn try_from(event: &RawEvent) -> Result<Self, Error> {
        let args = &event.args;
        Ok(Self {
            proposal_id: args.b256(PROPOSAL_ID_ARG)?,
            avatar: args.address(AVATAR_ARG)?,
            decision: args.uint("_decision")?,
            total_reputation: args.uint("_totalReputation")?,
        })
    }
}

/// A vote was cast.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VoteProposalEvent {
    /// Proposal id.
    pub proposal_id: B256,
    /// Avatar the proposal belongs to.
    pub avatar: Address,
    /// Voting account.
    pub voter: Address,
    /// Chosen option.
    pub vote: U256,
    /// Reputation cast.
    pub reputation: U256,
}

impl TryFrom<&RawEvent> for VoteProposalEvent {
    type Error = Error;

    fn try_from(event: &RawEvent) -> Result<Self, Error> {
        let args = &event.args;
        Ok(Self {
            proposal_id: args.b256(PROPOSAL_ID_ARG)?,
            avatar: args.address(AVATAR_ARG)?,
            voter: args.address("_voter")?,
            vote: args.uint("_vote")?,
            reputation: args.uint("_reputation")?,
        })
    }
}

/// A proposal was cancelled.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CancelProposalEvent {
    /// Proposal id.
    pub proposal_id: B256,
    /// Avatar the proposal belongs to.
    pub avatar: Address,
}

impl TryFrom<&RawEvent> for CancelProposalEvent {
    type Error = Error;

    fn try_from(event: &RawEvent) -> Result<Self, Error> {
        Ok(Self {
            proposal_id: event.args.b256(PROPOSAL_ID_ARG)?,
            avatar: event.args.address(AVATAR_ARG)?,
        })
    }
}

/// A voter withdrew their vote.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CancelVotingEvent {
    /// Proposal id.
    pub proposal_id: B256,
    /// Avatar the proposal belongs to.
    pub avatar: Address,
    /// Voting account.
    pub voter: Address,
}

impl TryFrom<&RawEvent> for CancelVotingEvent {
    type Error = Error;

    fn try_from(event: &RawEvent) -> Result<Self, Error> {
        Ok(Self {
            proposal_id: event.args.b256(PROPOSAL_ID_ARG)?,
            avatar: event.args.address(AVATAR_ARG)?,
            voter: event.args.address("_voter")?,
        })
    }
}

/// Transform decoding every event into `T`.
fn decoding<T>() -> Transform<RawEvent, T>
where
    T: for<'a> TryFrom<&'a RawEvent, Error = Error> + Send + 'static,
{
    transform(|event: RawEvent| std::future::ready(T::try_from(&event).map(Some)))
}

impl VotingMachineFacade {
    fn typed_events<T>(&self, event: &str, avatar: Option<Address>) -> EntityFetcherFactory<T>
    where
        T: for<'a> TryFrom<&'a RawEvent, Error = Error> + Send + 'static,
    {
        let mut events = self.event_factory(event);
        if let Some(avatar) = avatar {
            events = events
                .with_base_filter(ArgFilter::new().equals(AVATAR_ARG, DynSolValue::Address(avatar)));
        }
        EntityFetcherFactory::new(events, decoding())
    }

    /// `NewProposal` events, scoped to `avatar` when given.
    pub fn new_proposal_events(
        &self,
        avatar: Option<Address>,
    ) -> EntityFetcherFactory<NewProposalEvent> {
        self.typed_events(NEW_PROPOSAL, avatar)
    }

    /// `ExecuteProposal` events, scoped to `avatar` when given.
    pub fn execute_proposal_events(
        &self,
        avatar: Option<Address>,
    ) -> EntityFetcherFactory<ExecuteProposalEvent> {
        self.typed_events(EXECUTE_PROPOSAL, avatar)
    }

    /// `VoteProposal` events, scoped to `avatar` when given.
    pub fn vote_proposal_events(
        &self,
        avatar: Option<Address>,
    ) -> EntityFetcherFactory<VoteProposalEvent> {
        self.typed_events(VOTE_PROPOSAL, avatar)
    }

    /// `CancelProposal` events, scoped to `avatar` when given.
    pub fn cancel_proposal_events(
        &self,
        avatar: Option<Address>,
    ) -> EntityFetcherFactory<CancelProposalEvent> {
        self.typed_events(CANCEL_PROPOSAL, avatar)
    }

    /// `CancelVoting` events, scoped to `avatar` when given.
    pub fn cancel_voting_events(
        &self,
        avatar: Option<Address>,
    ) -> EntityFetcherFactory<CancelVotingEvent> {
        self.typed_events(CANCEL_VOTING, avatar)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::filter::FetchOptions;
    use crate::testing::{new_proposal_event, raw_event, MemoryEventSource, MemoryVotingMachine};

    fn facade(source: &Arc<MemoryEventSource>) -> VotingMachineFacade {
        let machine = Arc::new(MemoryVotingMachine::new(Address::repeat_byte(0x42)));
        VotingMachineFacade::new(machine, source.clone())
    }

    #[tokio::test]
    async fn new_proposals_decode_and_scope_to_avatar() {
        let source = Arc::new(MemoryEventSource::new());
        let avatar = Address::repeat_byte(5);
        source.push_history(vec![
            new_proposal_event(1, B256::repeat_byte(1), avatar, 2),
            new_proposal_event(2, B256::repeat_byte(2), Address::repeat_byte(6), 3),
        ]);

        let fetcher = facade(&source)
            .new_proposal_events(Some(avatar))
            .fetcher(ArgFilter::new(), FetchOptions::default());
        let proposals = fetcher.get().await.unwrap();

        assert_eq!(proposals.len(), 1);
        assert_eq!(proposals[0].proposal_id, B256::repeat_byte(1));
        assert_eq!(proposals[0].number_of_choices, U256::from(2));

        let query = &source.queries()[0];
        assert_eq!(query.event, NEW_PROPOSAL);
        assert_eq!(query.address, Address::repeat_byte(0x42));
        assert_eq!(
            query.filter.get(AVATAR_ARG),
            Some(&[DynSolValue::Address(avatar)][..])
        );
    }

    #[tokio::test]
    async fn vote_events_decode() {
        let source = Arc::new(MemoryEventSource::new());
        let mut event = raw_event(VOTE_PROPOSAL, 1, 0);
        event.args = event
            .args
            .with(PROPOSAL_ID_ARG, DynSolValue::FixedBytes(B256::repeat_byte(9), 32))
            .with(AVATAR_ARG, DynSolValue::Address(Address::repeat_byte(5)))
            .with("_voter", DynSolValue::Address(Address::repeat_byte(7)))
            .with("_vote", DynSolValue::Uint(U256::from(1), 256))
            .with("_reputation", DynSolValue::Uint(U256::from(40), 256));
        source.push_history(event);

        let votes = facade(&source)
            .vote_proposal_events(None)
            .fetcher(ArgFilter::new(), FetchOptions::default())
            .get()
            .await
            .unwrap();
        assert_eq!(
            votes,
            vec![VoteProposalEvent {
                proposal_id: B256::repeat_byte(9),
                avatar: Address::repeat_byte(5),
                voter: Address::repeat_byte(7),
                vote: U256::from(1),
                reputation: U256::from(40),
            }]
        );
    }

    #[tokio::test]
    async fn malformed_event_fails_the_batch() {
        let source = Arc::new(MemoryEventSource::new());
        source.push_history(raw_event(CANCEL_VOTING, 1, 0));

        let result = facade(&source)
            .cancel_voting_events(None)
            .fetcher(ArgFilter::new(), FetchOptions::default())
            .get()
            .await;
        assert!(matches!(result, Err(Error::MissingEventArg { .. })));
    }
}
