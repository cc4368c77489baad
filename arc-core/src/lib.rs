//! # Arc Core
//!
//! Client-side building blocks for organizations governed through on-chain voting machines.
//!
//! ## Modules
//! - [`event_fetcher`]: deduplicated, filtered contract logs, one-shot or watched.
//! - [`entity_fetcher`]: asynchronous transforms from logs to domain entities.
//! - [`voting_machine`]: one facade over every `IntVoteInterface` voting machine.
//! - [`proposal_pipeline`]: proposal entities filtered by votability and enriched with voting.
//! - [`tx_bus`]: publish/subscribe correlation of multi-transaction operations.
//! - [`alloy_ledger`]: the alloy-backed ledger access used outside of tests.

/// Error module.
///
/// Defines the crate error type with `snafu`. Validation failures are raised before any
/// ledger interaction; everything else wraps a ledger or transform failure.
pub mod error;

/// Ledger access module.
///
/// Defines the decoded log model and the [`ledger::EventSource`] trait implemented by
/// ledger clients.
pub mod ledger;

/// Argument filters and block ranges.
pub mod filter;

/// Watch session plumbing shared by the fetchers.
mod watch;

/// Event fetcher module.
///
/// Turns an event source into fetchers that normalize, filter and deduplicate every batch
/// before it reaches the caller, whether fetched once or watched.
pub mod event_fetcher;

/// Entity fetcher module.
///
/// Maps event batches to domain entities through asynchronous transforms, preserving event
/// order and dropping excluded entries.
pub mod entity_fetcher;

/// Voting machine module.
///
/// Validates arguments and dispatches calls to any voting-machine binding, publishing each
/// transaction on an optional bus.
pub mod voting_machine;

/// Typed voting machine events.
pub mod voting_events;

/// Proposal pipeline module.
pub mod proposal_pipeline;

/// Scheme proposal readers.
pub mod proposal_reader;

/// Transaction correlation bus module.
///
/// Lets producers announce multi-transaction operations and consumers follow them by
/// hierarchical topic.
pub mod tx_bus;

/// Alloy bindings of the ledger access traits.
pub mod alloy_ledger;

/// In-memory ledger for tests.
#[cfg(any(test, feature = "test-utils"))]
pub mod testing;

pub use error::{Error, Result};
