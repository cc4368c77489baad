//! # Proposal Event Pipeline
//!
//! Schemes repeatedly need "proposal-creation events, maybe only those still open for voting,
//! maybe each with a handle to vote on it". [`ProposalEventPipeline::build`] assembles that as
//! one [`EntityFetcherFactory`].
//!
//! For every event the transform:
//! 1. reads the proposal id from the event,
//! 2. in votable-only mode asks the voting machine whether the proposal is votable, and
//!    excludes it if not (the domain transform is not run),
//! 3. runs the caller's domain transform,
//! 4. when requested, attaches a [`ProposalVoting`] bound to the proposal.
//!
//! Asking for either mode without a voting machine fails when the pipeline is built.

use std::sync::Arc;

use alloy::primitives::B256;
use log::debug;

use crate::entity_fetcher::{transform, EntityFetcherFactory, Transform};
use crate::error::{Error, Result};
use crate::event_fetcher::EventFetcherFactory;
use crate::ledger::RawEvent;
use crate::voting_events::PROPOSAL_ID_ARG;
use crate::voting_machine::{ProposalVoting, VotingMachineFacade};

/// Options of [`ProposalEventPipeline::build`].
///
/// | Field             | Default         | Effect                                          |
/// |-------------------|-----------------|-------------------------------------------------|
/// | `votable_only`    | `false`         | drop proposals that no longer accept votes      |
/// | `attach_voting`   | `false`         | attach a [`ProposalVoting`] to every entity     |
/// | `proposal_id_arg` | `"_proposalId"` | event argument holding the proposal id          |
/// | `voting_machine`  | `None`          | facade consulted by the two options above       |
#[derive(Clone, Debug)]
pub struct PipelineOptions {
    /// Keep only proposals that are still votable.
    pub votable_only: bool,
    /// Attach a proposal-scoped voting handle to every entity.
    pub attach_voting: bool,
    /// Name of the event argument holding the proposal id.
    pub proposal_id_arg: String,
    /// The voting machine of the proposals.
    pub voting_machine: Option<VotingMachineFacade>,
}

impl Default for PipelineOptions {
    fn default() -> Self {
        Self {
            votable_only: false,
            attach_voting: false,
            proposal_id_arg: PROPOSAL_ID_ARG.to_string(),
            voting_machine: None,
        }
    }
}

/// A domain entity produced by the pipeline.
#[derive(Clone, Debug)]
pub struct ProposalEntity<T> {
    /// Id of the proposal the event refers to.
    pub proposal_id: B256,
    /// Output of the domain transform.
    pub entity: T,
    /// Voting handle, when `attach_voting` was set.
    pub voting: Option<ProposalVoting>,
}

/// Per-event work of a built pipeline.
struct Stage<T> {
    proposal_id_arg: String,
    votable_check: Option<VotingMachineFacade>,
    voting: Option<VotingMachineFacade>,
    domain: Transform<RawEvent, T>,
}

impl<T> Stage<T> {
    async fn run(&self, event: RawEvent) -> Result<Option<ProposalEntity<T>>> {
        let proposal_id = event.args.b256(&self.proposal_id_arg)?;

        if let Some(facade) = &self.votable_check {
            if !facade.is_votable(proposal_id).await? {
                debug!("Skipping proposal {proposal_id}: no longer votable");
                return Ok(None);
            }
        }

        let Some(entity) = (self.domain)(event).await? else {
            return Ok(None);
        };
        let voting = self
            .voting
            .as_ref()
            .map(|facade| facade.for_proposal(proposal_id))
            .transpose()?;

        Ok(Some(ProposalEntity {
            proposal_id,
            entity,
            voting,
        }))
    }
}

/// Builder of proposal entity fetchers.
#[derive(Debug)]
pub struct ProposalEventPipeline;

impl ProposalEventPipeline {
    /// Builds an entity factory over `events` that applies `domain` as described in the
    /// module docs.
    pub fn build<T: Send + 'static>(
        events: EventFetcherFactory,
        domain: Transform<RawEvent, T>,
        options: PipelineOptions,
    ) -> Result<EntityFetcherFactory<ProposalEntity<T>>> {
        let PipelineOptions {
            votable_only,
            attach_voting,
            proposal_id_arg,
            voting_machine,
        } = options;

        let required = |enabled: bool, option: &'static str| match (enabled, &voting_machine) {
            (false, _) => Ok(None),
            (true, Some(facade)) => Ok(Some(facade.clone())),
            (true, None) => Err(Error::MissingVotingMachine { option }),
        };
        let stage = Arc::new(Stage {
            votable_check: required(votable_only, "votable_only")?,
            voting: required(attach_voting, "attach_voting")?,
            proposal_id_arg,
            domain,
        });

        Ok(EntityFetcherFactory::new(
            events,
            transform(move |event: RawEvent| {
                let stage = Arc::clone(&stage);
                async move { stage.run(event).await }
            }),
        ))
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use alloy::primitives::{Address, U256};
    use tokio::sync::mpsc;
    use tokio::time::timeout;

    use super::*;
    use crate::filter::{ArgFilter, FetchOptions};
    use crate::testing::{new_proposal_event, MemoryEventSource, MemoryVotingMachine};
    use crate::voting_events::{NewProposalEvent, NEW_PROPOSAL};

    const AVATAR: Address = Address::ZERO;

    fn p(n: u8) -> B256 {
        B256::repeat_byte(n)
    }

    struct Fixture {
        source: Arc<MemoryEventSource>,
        machine: Arc<MemoryVotingMachine>,
        facade: VotingMachineFacade,
    }

    fn fixture() -> Fixture {
        let source = Arc::new(MemoryEventSource::new());
        let machine = Arc::new(MemoryVotingMachine::new(Address::repeat_byte(0x42)));
        let facade = VotingMachineFacade::new(machine.clone(), source.clone());
        Fixture {
            source,
            machine,
            facade,
        }
    }

    fn decoded() -> Transform<RawEvent, NewProposalEvent> {
        transform(|event: RawEvent| async move { NewProposalEvent::try_from(&event).map(Some) })
    }

    fn build(
        fixture: &Fixture,
        options: PipelineOptions,
    ) -> Result<EntityFetcherFactory<ProposalEntity<NewProposalEvent>>> {
        ProposalEventPipeline::build(fixture.facade.event_factory(NEW_PROPOSAL), decoded(), options)
    }

    #[tokio::test]
    async fn votable_only_keeps_open_proposals() {
        let fixture = fixture();
        fixture.machine.add_proposal(p(1), 2, false);
        fixture.machine.add_proposal(p(2), 2, true);
        fixture.source.push_history(vec![
            new_proposal_event(1, p(1), AVATAR, 2),
            new_proposal_event(2, p(2), AVATAR, 2),
        ]);

        let factory = build(
            &fixture,
            PipelineOptions {
                votable_only: true,
                voting_machine: Some(fixture.facade.clone()),
                ..Default::default()
            },
        )
        .unwrap();
        let proposals = factory
            .fetcher(ArgFilter::new(), FetchOptions::default())
            .get()
            .await
            .unwrap();

        assert_eq!(proposals.len(), 1);
        assert_eq!(proposals[0].proposal_id, p(2));
        assert_eq!(proposals[0].entity.number_of_choices, U256::from(2));
        assert!(proposals[0].voting.is_none());
    }

    #[tokio::test]
    async fn attached_voting_acts_on_its_proposal() {
        let fixture = fixture();
        fixture.machine.add_proposal(p(3), 2, true);
        fixture
            .source
            .push_history(new_proposal_event(3, p(3), AVATAR, 2));

        let factory = build(
            &fixture,
            PipelineOptions {
                attach_voting: true,
                voting_machine: Some(fixture.facade.clone()),
                ..Default::default()
            },
        )
        .unwrap();
        let proposals = factory
            .fetcher(ArgFilter::new(), FetchOptions::default())
            .get()
            .await
            .unwrap();

        let voting = proposals[0].voting.as_ref().unwrap();
        assert_eq!(voting.proposal_id(), p(3));
        voting.vote(1).await.unwrap();
        assert_eq!(
            fixture.machine.proposal(p(3)).unwrap().votes[&U256::from(1)],
            U256::from(1)
        );
    }

    #[test]
    fn modes_without_voting_machine_fail_at_build() {
        let fixture = fixture();
        let votable = build(
            &fixture,
            PipelineOptions {
                votable_only: true,
                ..Default::default()
            },
        );
        assert!(matches!(
            votable,
            Err(Error::MissingVotingMachine {
                option: "votable_only"
            })
        ));

        let attach = build(
            &fixture,
            PipelineOptions {
                attach_voting: true,
                ..Default::default()
            },
        );
        assert!(matches!(
            attach,
            Err(Error::MissingVotingMachine {
                option: "attach_voting"
            })
        ));

        assert!(build(&fixture, PipelineOptions::default()).is_ok());
    }

    #[tokio::test]
    async fn votable_lookup_failure_rejects_get() {
        let fixture = fixture();
        fixture.machine.add_proposal(p(1), 2, true);
        fixture.machine.fail_reads();
        fixture
            .source
            .push_history(new_proposal_event(1, p(1), AVATAR, 2));

        let factory = build(
            &fixture,
            PipelineOptions {
                votable_only: true,
                voting_machine: Some(fixture.facade.clone()),
                ..Default::default()
            },
        )
        .unwrap();
        let result = factory
            .fetcher(ArgFilter::new(), FetchOptions::default())
            .get()
            .await;
        assert!(matches!(result, Err(Error::Ledger { .. })));
    }

    #[tokio::test]
    async fn watch_delivers_errors_and_keeps_watching() {
        let fixture = fixture();
        fixture.machine.add_proposal(p(2), 2, true);
        let factory = build(
            &fixture,
            PipelineOptions {
                votable_only: true,
                voting_machine: Some(fixture.facade.clone()),
                ..Default::default()
            },
        )
        .unwrap();

        let (tx, mut rx) = mpsc::unbounded_channel();
        let fetcher = factory
            .watching(ArgFilter::new(), move |batch| {
                let _ = tx.send(batch.map(|ps| ps.len()));
            })
            .unwrap();

        let mut broken = new_proposal_event(1, p(9), AVATAR, 2);
        broken.args = Default::default();
        fixture.source.emit(broken);
        fixture
            .source
            .emit(new_proposal_event(2, p(2), AVATAR, 2));

        let wait = Duration::from_secs(1);
        assert!(matches!(
            timeout(wait, rx.recv()).await.unwrap().unwrap(),
            Err(Error::MissingEventArg { .. })
        ));
        assert_eq!(timeout(wait, rx.recv()).await.unwrap().unwrap().unwrap(), 1);
        fetcher.stop_watching();
    }
}
