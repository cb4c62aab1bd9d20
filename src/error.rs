// src/error.rs
use thiserror::Error;

/// Errors surfaced by the forest, tree and storage layers.
///
/// Each call that fails returns one of these; the forest stays usable for
/// subsequent calls except after [`LarchError::JournalReplayFailed`],
/// [`LarchError::CorruptNode`] encountered during commit, or
/// [`LarchError::NodeMissing`] — those poison the forest (see
/// [`crate::forest::Forest`]).
#[derive(Error, Debug)]
pub enum LarchError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("key length {actual} does not match forest key_size {expected}")]
    WrongKeySize { expected: usize, actual: usize },

    #[error("value of {actual} bytes exceeds max_value_size {max}")]
    ValueTooLarge { actual: usize, max: usize },

    #[error("key not found")]
    KeyNotFound,

    #[error("node {0} is missing: refcount says alive but storage has no file")]
    NodeMissing(u64),

    #[error("corrupt node: {0}")]
    CorruptNode(String),

    #[error("format problem: {0}")]
    FormatProblem(String),

    #[error("journal replay failed: {0}")]
    JournalReplayFailed(String),

    #[error("forest is opened read-only")]
    ReadOnly,

    #[error("refcount of node {0} would overflow u16")]
    RefcountOverflow(u64),

    #[error("forest is poisoned after a prior unrecoverable error and must be re-opened")]
    Poisoned,
}

pub type Result<T> = std::result::Result<T, LarchError>;
