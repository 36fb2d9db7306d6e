use thiserror::Error;

/// Misuse of the pool's name registry.
///
/// Both variants signal a caller bug rather than a transient failure; callers
/// that cannot recover should treat them as fatal.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PoolError {
    /// `start_name` was called with a name that is still registered.
    #[error("named daemon already exists: '{0}'")]
    DuplicateName(String),

    /// `stop` was called with a name that is not registered, or whose
    /// daemon is already being stopped.
    #[error("no such named daemon: '{0}'")]
    UnknownName(String),
}
