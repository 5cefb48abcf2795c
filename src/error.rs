use std::fmt;

use crate::auth::{AccountId, AuthError};
use crate::config::ConfigError;
use crate::governance::VoteError;
use crate::ledger::LedgerError;
use crate::registry::RegistryError;
use crate::store::StoreError;

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Canonical error type returned by [`crate::Deployment`].
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Ledger(#[from] LedgerError),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    Vote(#[from] VoteError),

    #[error(transparent)]
    Auth(#[from] AuthError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Store(#[from] StoreError),

    /// The envelope's nonce is not the next one expected for its signer.
    #[error("stale nonce for {account}: expected {expected}, got {got}")]
    StaleNonce {
        account: AccountId,
        expected: u64,
        got: u64,
    },
}

/// The kind of rejection, independent of which component produced it.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    UnknownProject,
    AlreadyVoted,
    InsufficientBalance,
    Unauthorized,
    AlreadyVerified,
    Overflow,
    MalformedInput,
    InvalidSignature,
    StaleNonce,
    InvalidConfig,
    Storage,
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Ledger(LedgerError::Unauthorized { .. }) => ErrorKind::Unauthorized,
            Error::Ledger(LedgerError::InsufficientBalance { .. }) => {
                ErrorKind::InsufficientBalance
            }
            Error::Ledger(LedgerError::Overflow { .. }) => ErrorKind::Overflow,
            Error::Registry(RegistryError::UnknownProject(_)) => ErrorKind::UnknownProject,
            Error::Registry(RegistryError::Unauthorized { .. }) => ErrorKind::Unauthorized,
            Error::Vote(VoteError::UnknownProject(_)) => ErrorKind::UnknownProject,
            Error::Vote(VoteError::AlreadyVoted { .. }) => ErrorKind::AlreadyVoted,
            Error::Vote(VoteError::InsufficientBalance { .. }) => ErrorKind::InsufficientBalance,
            Error::Vote(VoteError::AlreadyVerified(_)) => ErrorKind::AlreadyVerified,
            Error::Auth(AuthError::MalformedAccount(_) | AuthError::MalformedSecret) => {
                ErrorKind::MalformedInput
            }
            Error::Auth(AuthError::MalformedSignature(_) | AuthError::InvalidSignature(_)) => {
                ErrorKind::InvalidSignature
            }
            Error::StaleNonce { .. } => ErrorKind::StaleNonce,
            Error::Config(_) => ErrorKind::InvalidConfig,
            Error::Store(_) => ErrorKind::Storage,
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorKind::UnknownProject => "unknown_project",
            ErrorKind::AlreadyVoted => "already_voted",
            ErrorKind::InsufficientBalance => "insufficient_balance",
            ErrorKind::Unauthorized => "unauthorized",
            ErrorKind::AlreadyVerified => "already_verified",
            ErrorKind::Overflow => "overflow",
            ErrorKind::MalformedInput => "malformed_input",
            ErrorKind::InvalidSignature => "invalid_signature",
            ErrorKind::StaleNonce => "stale_nonce",
            ErrorKind::InvalidConfig => "invalid_config",
            ErrorKind::Storage => "storage",
        };
        f.write_str(name)
    }
}
