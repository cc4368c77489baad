//! Reading scheme-specific proposal structs.
//!
//! Every scheme stores its proposals in its own struct layout, keyed by avatar and proposal
//! id. A [`ProposalReader`] returns the raw positional fields; [`reader_transform`] turns it
//! into an entity transform that reads the struct for each event and converts it.

use std::sync::Arc;

use alloy::dyn_abi::DynSolValue;
use alloy::primitives::{Address, B256};
use async_trait::async_trait;
use log::debug;

use crate::entity_fetcher::{transform, Transform};
use crate::error::Result;
use crate::ledger::{LedgerError, RawEvent};
use crate::voting_events::{AVATAR_ARG, PROPOSAL_ID_ARG};

/// Reads one scheme's proposal struct.
#[async_trait]
pub trait ProposalReader: Send + Sync {
    /// Returns the struct fields of `proposal_id` under `avatar`, in declaration order.
    async fn read_proposal(
        &self,
        avatar: Address,
        proposal_id: B256,
    ) -> Result<Vec<DynSolValue>, LedgerError>;
}

/// Names of the event arguments a [`reader_transform`] keys on.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReaderArgs {
    /// Argument holding the avatar. Defaults to `_avatar`.
    pub avatar: String,
    /// Argument holding the proposal id. Defaults to `_proposalId`.
    pub proposal_id: String,
}

impl Default for ReaderArgs {
    fn default() -> Self {
        Self {
            avatar: AVATAR_ARG.to_string(),
            proposal_id: PROPOSAL_ID_ARG.to_string(),
        }
    }
}

/// A proposal struct read for one event.
#[derive(Clone, Debug, PartialEq)]
pub struct ProposalRecord {
    /// Avatar of the proposal.
    pub avatar: Address,
    /// Proposal id.
    pub proposal_id: B256,
    /// Raw struct fields.
    pub fields: Vec<DynSolValue>,
    /// The event that referred to the proposal.
    pub event: RawEvent,
}

/// Whether every field holds its zero value.
///
/// Contracts return an all-zero struct for proposals that were deleted or never existed.
pub fn is_unset(fields: &[DynSolValue]) -> bool {
    fields.iter().all(|field| match field {
        DynSolValue::Bool(b) => !b,
        DynSolValue::Int(value, _) => value.is_zero(),
        DynSolValue::Uint(value, _) => value.is_zero(),
        DynSolValue::FixedBytes(word, _) => word.is_zero(),
        DynSolValue::Address(address) => address.is_zero(),
        DynSolValue::Bytes(bytes) => bytes.is_empty(),
        DynSolValue::String(s) => s.is_empty(),
        DynSolValue::Array(items)
        | DynSolValue::FixedArray(items)
        | DynSolValue::Tuple(items) => is_unset(items),
        _ => false,
    })
}

/// Builds a transform that reads the proposal referred to by each event and converts it.
///
/// Unset proposals (see [`is_unset`]) are excluded without calling `convert`, which may
/// exclude further ones by returning `None`.
pub fn reader_transform<T, F>(
    reader: Arc<dyn ProposalReader>,
    args: ReaderArgs,
    convert: F,
) -> Transform<RawEvent, T>
where
    T: Send + 'static,
    F: Fn(ProposalRecord) -> Result<Option<T>> + Send + Sync + 'static,
{
    let args = Arc::new(args);
    let convert = Arc::new(convert);
    transform(move |event: RawEvent| {
        let reader = Arc::clone(&reader);
        let args = Arc::clone(&args);
        let convert = Arc::clone(&convert);
        async move {
            let avatar = event.args.address(&args.avatar)?;
            let proposal_id = event.args.b256(&args.proposal_id)?;
            let fields = reader.read_proposal(avatar, proposal_id).await?;
            if is_unset(&fields) {
                debug!("Proposal {proposal_id} of {avatar} is unset");
                return Ok(None);
            }
            convert(ProposalRecord {
                avatar,
                proposal_id,
                fields,
                event,
            })
        }
    })
}
