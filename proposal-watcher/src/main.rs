//! Proposal watcher
//!
//! Lists the proposals of one voting machine with their vote status, then follows new ones.
use std::sync::Arc;

use alloy::primitives::Address;
use alloy::providers::ProviderBuilder;
use arc_core::alloy_ledger::{AlloyEventSource, AlloyVotingMachine};
use arc_core::entity_fetcher::transform;
use arc_core::filter::{ArgFilter, FetchOptions};
use arc_core::ledger::{EventSource, LedgerError, RawEvent};
use arc_core::proposal_pipeline::{PipelineOptions, ProposalEntity, ProposalEventPipeline};
use arc_core::tx_bus::{TxBus, TX_TOPIC_ROOT};
use arc_core::voting_events::NewProposalEvent;
use arc_core::voting_machine::{VotingMachineContract, VotingMachineFacadeFactory};
use clap::Parser;
use lazy_static::lazy_static;
use log::{error, info, warn};
use snafu::{ResultExt, Snafu};
use url::Url;

lazy_static! {
    /// Process-wide transaction bus handed to every facade.
    static ref TX_BUS: TxBus = TxBus::new();
}

/// Proposal watcher: lists and follows the proposals of a voting machine
#[derive(Debug, Parser)]
#[command(name = "proposal-watcher")]
#[command(version = "0.1.0")]
#[command(about = "Lists and follows the proposals of an IntVoteInterface voting machine", long_about = None)]
pub struct WatcherConfig {
    /// HTTP URL of the Ethereum node
    #[arg(long, env = "WATCHER_RPC_URL", default_value = "http://localhost:8545")]
    pub rpc_url: Url,

    /// Address of the voting machine
    #[arg(long, env = "WATCHER_VOTING_MACHINE")]
    pub voting_machine: Address,

    /// Only report proposals of this avatar
    #[arg(long, env = "WATCHER_AVATAR")]
    pub avatar: Option<Address>,

    /// First block searched for historical proposals
    #[arg(long, env = "WATCHER_FROM_BLOCK", default_value_t = 0)]
    pub from_block: u64,

    /// Skip proposals that no longer accept votes
    #[arg(long, env = "WATCHER_VOTABLE_ONLY", default_value_t = false)]
    pub votable_only: bool,
}

/// Errors that stop the watcher.
#[derive(Debug, Snafu)]
enum WatcherError {
    /// The ledger client could not be set up.
    #[snafu(display("Failed to set up ledger access: {source}"))]
    Ledger {
        /// The ledger error.
        source: LedgerError,
    },

    /// A core operation failed.
    #[snafu(display("Proposal query failed: {source}"))]
    Core {
        /// The core error.
        source: arc_core::Error,
    },

    /// Waiting for the shutdown signal failed.
    #[snafu(display("Failed to listen for shutdown signal: {source}"))]
    Signal {
        /// The I/O error.
        source: std::io::Error,
    },
}

#[tokio::main]
async fn main() -> Result<(), WatcherError> {
    env_logger::init();
    let config = WatcherConfig::parse();
    info!("Watching proposals of voting machine {}", config.voting_machine);

    let receipts = TX_BUS.subscribe([TX_TOPIC_ROOT], |topic, envelope| match &envelope.tx {
        None => info!(
            "{topic}: invocation {} announced {} transaction(s)",
            envelope.invocation_key, envelope.tx_count
        ),
        Some(tx) => info!(
            "{topic}: invocation {} mined {}",
            envelope.invocation_key, tx.transaction_hash
        ),
    });

    let provider = ProviderBuilder::new().on_http(config.rpc_url.clone());
    let source: Arc<dyn EventSource> = Arc::new(
        AlloyEventSource::new(provider.clone())
            .with_int_vote_events()
            .context(LedgerSnafu)?,
    );
    let facades = VotingMachineFacadeFactory::new(source, move |address| {
        Arc::new(AlloyVotingMachine::new(address, provider.clone()))
            as Arc<dyn VotingMachineContract>
    })
    .with_bus(TX_BUS.clone());
    let facade = facades.create(config.voting_machine).context(CoreSnafu)?;

    let events = facade.new_proposal_events(config.avatar).events().clone();
    let proposals = ProposalEventPipeline::build(
        events,
        transform(|event: RawEvent| async move { NewProposalEvent::try_from(&event).map(Some) }),
        PipelineOptions {
            votable_only: config.votable_only,
            attach_voting: true,
            voting_machine: Some(facade),
            ..Default::default()
        },
    )
    .context(CoreSnafu)?;

    let history = proposals
        .fetcher(ArgFilter::new(), FetchOptions::from_block(config.from_block))
        .get()
        .await
        .context(CoreSnafu)?;
    info!("Found {} proposal(s)", history.len());
    for proposal in history {
        report(proposal).await;
    }

    let watcher = proposals
        .watching(ArgFilter::new(), |batch| match batch {
            Ok(batch) => batch.into_iter().for_each(|proposal| {
                tokio::spawn(report(proposal));
            }),
            Err(e) => error!("Failed to process new proposals: {e}"),
        })
        .context(CoreSnafu)?;

    tokio::signal::ctrl_c().await.context(SignalSnafu)?;
    info!("Shutting down");
    watcher.stop_watching();
    receipts.unsubscribe();

    Ok(())
}

/// Logs one proposal and its current vote status.
async fn report(proposal: ProposalEntity<NewProposalEvent>) {
    let event = &proposal.entity;
    info!(
        "Proposal {} of {} by {} with {} choice(s)",
        proposal.proposal_id, event.avatar, event.proposer, event.number_of_choices
    );

    let Some(voting) = &proposal.voting else {
        return;
    };
    match voting.current_vote_status().await {
        Ok(status) => {
            let votes: Vec<String> = status.iter().map(ToString::to_string).collect();
            info!(
                "Proposal {} votes by choice: [{}]",
                proposal.proposal_id,
                votes.join(", ")
            );
        }
        Err(e) => warn!(
            "Failed to read vote status of {}: {e}",
            proposal.proposal_id
        ),
    }
}
