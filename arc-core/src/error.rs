use snafu::Snafu;

use crate::ledger::LedgerError;

/// Boxed error returned by caller-supplied transforms.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Errors surfaced by event fetching, voting-machine dispatch and proposal pipelines.
///
/// Validation variants are raised before any ledger interaction. Everything else wraps a
/// failure reported by the ledger or by a caller-supplied transform. Nothing is retried.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum Error {
    /// A required identifier was absent or zero.
    #[snafu(display("Missing required argument '{name}'"))]
    MissingArgument {
        /// Name of the argument.
        name: &'static str,
    },

    /// A vote choice was negative.
    #[snafu(display("Invalid vote choice {choice}: must be a non-negative integer"))]
    InvalidChoice {
        /// The rejected choice.
        choice: i64,
    },

    /// A vote choice exceeded what the machine supports for the proposal.
    #[snafu(display("Vote choice {choice} is outside the allowed range 0..={max}"))]
    ChoiceOutOfRange {
        /// The rejected choice.
        choice: u32,
        /// Highest allowed choice.
        max: u64,
    },

    /// A proposal reported more choices than can be enumerated.
    #[snafu(display("Proposal reports {choices} choices, more than the {max} that can be read"))]
    TooManyChoices {
        /// Number of choices the machine reported.
        choices: u64,
        /// Largest number of choices read.
        max: u64,
    },

    /// Votable filtering or voting enrichment was requested without a voting machine.
    #[snafu(display("Proposal pipeline requires a voting machine for '{option}'"))]
    MissingVotingMachine {
        /// The option that needs it.
        option: &'static str,
    },

    /// An event lacked an argument a transform needs.
    #[snafu(display("Event is missing argument '{arg}'"))]
    MissingEventArg {
        /// Name of the argument.
        arg: String,
    },

    /// An event argument had a different ABI type than expected.
    #[snafu(display("Event argument '{arg}' is not a {expected}"))]
    EventArgType {
        /// Name of the argument.
        arg: String,
        /// Expected ABI type.
        expected: &'static str,
    },

    /// The ledger-access layer failed.
    #[snafu(display("Ledger error: {source}"))]
    Ledger {
        /// The underlying ledger error.
        source: LedgerError,
    },

    /// A caller-supplied transform failed.
    #[snafu(display("Entity transform failed: {source}"))]
    Transform {
        /// The transform's error.
        source: BoxError,
    },

    /// `watch` was called on a fetcher that is already watching.
    #[snafu(display("Fetcher is already watching"))]
    AlreadyWatching,
}

impl Error {
    /// Wraps an arbitrary transform failure.
    pub fn transform(err: impl Into<BoxError>) -> Self {
        Error::Transform { source: err.into() }
    }
}

impl From<LedgerError> for Error {
    fn from(source: LedgerError) -> Self {
        Error::Ledger { source }
    }
}

/// Type alias for results that return a `Result<T, Error>`.
pub type Result<T, E = Error> = std::result::Result<T, E>;
