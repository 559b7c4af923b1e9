//! Error taxonomy for the solver library.

use thiserror::Error;

/// Errors surfaced to callers of the library.
#[derive(Debug, Error)]
pub enum SolverError {
    /// Out-of-range index or malformed piece data.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// Puzzle parse error or failed piece-count invariants.
    #[error("invalid puzzle: {0}")]
    InvalidPuzzle(String),

    /// Bad magic, unsupported version, or malformed text save.
    #[error("corrupt save: {0}")]
    CorruptSave(String),

    /// File system failure reading or writing a save or stats file.
    #[error("i/o failure: {0}")]
    Io(#[from] std::io::Error),

    /// The work-stealing pool could not be created.
    #[error("thread pool: {0}")]
    Pool(String),
}

/// Internal signal raised when propagation empties a domain.
///
/// Caught at the enclosing branch of the search and mapped to "try the
/// next candidate"; never converted into [`SolverError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Wipeout;

/// Library-wide result alias.
pub type Result<T> = std::result::Result<T, SolverError>;
