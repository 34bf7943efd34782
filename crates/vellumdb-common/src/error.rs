//! Error definitions for VellumDB.

use thiserror::Error;

/// Errors reported by the underlying document-file store.
///
/// These mirror the failure codes of the append-only file layer and carry a
/// stable human string (see [`StoreError::as_str`]) which is what every log
/// line uses, so operators can grep for the same text across releases.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreError {
    #[error("error opening file")]
    OpenFile,

    #[error("error reading file")]
    Read,

    #[error("error writing to file")]
    Write,

    #[error("error closing file")]
    FileClose,

    #[error("document not found")]
    DocNotFound,

    #[error("no header in non-empty file")]
    NoHeader,

    #[error("checksum fail")]
    Checksum,

    #[error("database file corrupt")]
    Corrupt,

    #[error("corrupt metadata")]
    MalformedMeta,

    #[error("memory allocation failure")]
    AllocFail,

    #[error("database no longer valid")]
    DbNoLongerValid,

    #[error("invalid arguments")]
    InvalidArguments,
}

impl StoreError {
    /// Stable string form of the code, used verbatim in log output.
    pub fn as_str(&self) -> &'static str {
        match self {
            StoreError::OpenFile => "error opening file",
            StoreError::Read => "error reading file",
            StoreError::Write => "error writing to file",
            StoreError::FileClose => "error closing file",
            StoreError::DocNotFound => "document not found",
            StoreError::NoHeader => "no header in non-empty file",
            StoreError::Checksum => "checksum fail",
            StoreError::Corrupt => "database file corrupt",
            StoreError::MalformedMeta => "corrupt metadata",
            StoreError::AllocFail => "memory allocation failure",
            StoreError::DbNoLongerValid => "database no longer valid",
            StoreError::InvalidArguments => "invalid arguments",
        }
    }
}

/// Result alias for the store layer.
pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Engine-level error kinds surfaced to callers of the persistence engine.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineError {
    /// The requested document does not exist (or is a purged tombstone).
    #[error("key missing")]
    KeyMissing,

    /// Transient failure; the operation may succeed if retried.
    #[error("temporary failure: {0}")]
    TmpFail(StoreError),

    /// Structural corruption detected in the data file.
    #[error("corrupt: {0}")]
    Corrupt(StoreError),

    /// A mutation path was invoked on the read-only sibling.
    #[error("not permitted on a read-only store")]
    NotPermitted,

    /// The key's collection is not present in the persisted manifest.
    #[error("unknown collection")]
    UnknownCollection,

    /// Rollback could not find a header at or below the target seqno.
    #[error("rollback requires restarting from zero")]
    RollbackToZero,

    /// Unrecoverable failure: write error, allocation failure or an
    /// invariant breach.
    #[error("fatal: {0}")]
    Fatal(StoreError),
}

impl EngineError {
    /// Short kind name for stats and log fields.
    pub fn kind(&self) -> &'static str {
        match self {
            EngineError::KeyMissing => "key_missing",
            EngineError::TmpFail(_) => "tmp_fail",
            EngineError::Corrupt(_) => "corrupt",
            EngineError::NotPermitted => "not_permitted",
            EngineError::UnknownCollection => "unknown_collection",
            EngineError::RollbackToZero => "rollback_to_zero",
            EngineError::Fatal(_) => "fatal",
        }
    }

    /// The underlying store code, when one caused this error.
    pub fn store_code(&self) -> Option<StoreError> {
        match self {
            EngineError::TmpFail(e) | EngineError::Corrupt(e) | EngineError::Fatal(e) => Some(*e),
            _ => None,
        }
    }
}

/// Map an underlying store code to the engine taxonomy.
///
/// Open/close/read problems are retryable, structural damage is `Corrupt`,
/// write and allocation failures are fatal. Malformed metadata maps to
/// `TmpFail`: the record may be repaired by a later write of the same key.
impl From<StoreError> for EngineError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::OpenFile
            | StoreError::Read
            | StoreError::FileClose
            | StoreError::MalformedMeta
            | StoreError::DbNoLongerValid => EngineError::TmpFail(err),
            StoreError::Checksum | StoreError::Corrupt | StoreError::NoHeader => {
                EngineError::Corrupt(err)
            }
            StoreError::DocNotFound => EngineError::KeyMissing,
            StoreError::Write | StoreError::AllocFail | StoreError::InvalidArguments => {
                EngineError::Fatal(err)
            }
        }
    }
}

/// Result alias for engine operations.
pub type Result<T> = std::result::Result<T, EngineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn store_codes_map_to_engine_kinds() {
        assert_eq!(
            EngineError::from(StoreError::OpenFile),
            EngineError::TmpFail(StoreError::OpenFile)
        );
        assert_eq!(
            EngineError::from(StoreError::Read),
            EngineError::TmpFail(StoreError::Read)
        );
        assert_eq!(
            EngineError::from(StoreError::Write),
            EngineError::Fatal(StoreError::Write)
        );
        assert_eq!(
            EngineError::from(StoreError::AllocFail),
            EngineError::Fatal(StoreError::AllocFail)
        );
        assert_eq!(EngineError::from(StoreError::DocNotFound), EngineError::KeyMissing);
        assert_eq!(
            EngineError::from(StoreError::MalformedMeta),
            EngineError::TmpFail(StoreError::MalformedMeta)
        );
    }

    #[test]
    fn stable_strings_match_display() {
        for err in [
            StoreError::OpenFile,
            StoreError::Read,
            StoreError::Write,
            StoreError::NoHeader,
            StoreError::MalformedMeta,
        ] {
            assert_eq!(err.to_string(), err.as_str());
        }
    }
}
