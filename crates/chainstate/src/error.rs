use mwd_consensus::{CryptoError, PowError};
use mwd_mmr::MmrError;
use mwd_primitives::ser::DecodeError;
use mwd_storage::StoreError;

/// Outcome of a chain operation. `Invalid` carries the rejection reason so
/// the peer layer can log it next to the ban.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ChainStatus {
    Success,
    AlreadyExists,
    /// Parent not yet seen; the caller should retain the item and retry.
    Orphaned,
    /// Hard rejection; the sending peer should be banned.
    Invalid(&'static str),
    /// Compact block hydration failed; fetch the full block.
    TransactionsMissing,
}

impl ChainStatus {
    pub fn is_success(&self) -> bool {
        matches!(self, ChainStatus::Success)
    }
}

/// Infrastructure failure; aborts the in-flight operation and surfaces to
/// the syncer as a store error.
#[derive(Debug)]
pub enum ChainError {
    Store(StoreError),
    Mmr(MmrError),
    Decode(DecodeError),
    Corrupt(&'static str),
}

impl std::fmt::Display for ChainError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ChainError::Store(err) => write!(f, "{err}"),
            ChainError::Mmr(err) => write!(f, "{err}"),
            ChainError::Decode(err) => write!(f, "{err}"),
            ChainError::Corrupt(message) => write!(f, "{message}"),
        }
    }
}

impl std::error::Error for ChainError {}

impl From<StoreError> for ChainError {
    fn from(err: StoreError) -> Self {
        ChainError::Store(err)
    }
}

impl From<MmrError> for ChainError {
    fn from(err: MmrError) -> Self {
        ChainError::Mmr(err)
    }
}

impl From<DecodeError> for ChainError {
    fn from(err: DecodeError) -> Self {
        ChainError::Decode(err)
    }
}

/// Reasons a block fails to apply to the txhashset.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ApplyError {
    UnknownInput,
    AlreadySpent,
    DuplicateCommitment,
    RootMismatch,
    SizeMismatch,
    Pow(PowError),
    Crypto(CryptoError),
    UnsortedBody,
    LockHeight,
}

impl ApplyError {
    pub fn reason(&self) -> &'static str {
        match self {
            ApplyError::UnknownInput => "input references unknown output",
            ApplyError::AlreadySpent => "input references spent output",
            ApplyError::DuplicateCommitment => "duplicate unspent commitment",
            ApplyError::RootMismatch => "mmr roots disagree with header",
            ApplyError::SizeMismatch => "mmr sizes disagree with header",
            ApplyError::Pow(_) => "invalid proof of work",
            ApplyError::Crypto(_) => "commitment or signature check failed",
            ApplyError::UnsortedBody => "block body not sorted",
            ApplyError::LockHeight => "kernel lock height not reached",
        }
    }
}

impl From<CryptoError> for ApplyError {
    fn from(err: CryptoError) -> Self {
        ApplyError::Crypto(err)
    }
}

impl From<PowError> for ApplyError {
    fn from(err: PowError) -> Self {
        ApplyError::Pow(err)
    }
}
