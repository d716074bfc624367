use thiserror::Error;

/// Errors raised by the reactor and its adapters.
#[derive(Debug, Error)]
pub enum Error {
    /// Every completion handle was dropped before a result was reported
    #[error("asynchronous operation finished without reporting a result")]
    Abandoned,

    /// The runtime could not be created
    #[error("failed to start the reactor: {0}")]
    Reactor(#[from] std::io::Error),
}

impl Error {
    /// Returns true if this error reveals a broken completion contract
    /// rather than an environment problem
    pub fn is_contract_violation(&self) -> bool {
        matches!(self, Error::Abandoned)
    }
}

/// Result type for reactor operations
pub type Result<T> = std::result::Result<T, Error>;
