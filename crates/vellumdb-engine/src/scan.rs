//! Range-scan contexts.
//!
//! A scan pins a snapshot of the partition file for its whole lifetime: the
//! engine keeps the open [`DocFile`](crate::store::DocFile) in a registry
//! keyed by scan id, and the context handed to the caller owns the
//! callbacks, so no reference cycle forms between the two. Cancellation is
//! observed at batch boundaries through the registry entry's flag.

use std::sync::atomic::AtomicBool;

use crate::item::{DocKey, GetValue};
use crate::store::DocFile;

/// Which documents a scan visits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DocumentFilter {
    AllItems,
    NoDeletes,
}

/// How much of each document a scan materialises.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueFilter {
    KeysOnly,
    MetaOnly,
    /// Bodies as stored on disk, with the compressed datatype bit set when
    /// applicable.
    ValuesCompressed,
    ValuesDecompressed,
}

/// Result of driving a scan.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanStatus {
    /// The snapshot was exhausted.
    Success,
    /// The value callback asked to yield; call `scan` again to resume.
    Again,
    Failed,
}

/// Pre-fetch lookup handed to the cache callback so the caller can
/// short-circuit documents it already holds.
#[derive(Debug, Clone)]
pub struct CacheLookup {
    pub key: DocKey,
    pub seqno: u64,
    pub partition: u16,
}

/// Verdict of the cache callback for one document.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheStatus {
    /// Not cached; fetch and deliver the document.
    Proceed,
    /// Already cached; skip the fetch.
    Skip,
}

/// Verdict of the value callback after receiving a document.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanFlow {
    Continue,
    /// Stop here and report [`ScanStatus::Again`]; the scan resumes after
    /// the last delivered seqno.
    Yield,
}

pub type ScanValueCallback = Box<dyn FnMut(GetValue) -> ScanFlow + Send>;
pub type CacheLookupCallback = Box<dyn FnMut(&CacheLookup) -> CacheStatus + Send>;

/// State of one scan, owned by the caller between `scan` calls.
pub struct ScanContext {
    pub(crate) id: u64,
    pub partition: u16,
    pub start_seqno: u64,
    /// Highest seqno in the pinned snapshot.
    pub max_seqno: u64,
    /// Live documents the snapshot can deliver, for end-of-scan estimation.
    pub documents: u64,
    /// Seqno of the last record delivered (or skipped); 0 before the first
    /// batch.
    pub last_read_seqno: u64,
    pub doc_filter: DocumentFilter,
    pub value_filter: ValueFilter,
    pub(crate) value_cb: ScanValueCallback,
    pub(crate) cache_cb: CacheLookupCallback,
}

impl ScanContext {
    pub fn id(&self) -> u64 {
        self.id
    }
}

impl std::fmt::Debug for ScanContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScanContext")
            .field("id", &self.id)
            .field("partition", &self.partition)
            .field("start_seqno", &self.start_seqno)
            .field("max_seqno", &self.max_seqno)
            .field("last_read_seqno", &self.last_read_seqno)
            .finish_non_exhaustive()
    }
}

/// Registry entry pinning the file handle for the scan's lifetime.
pub(crate) struct ScanHandle {
    pub(crate) file: DocFile,
    pub(crate) cancelled: AtomicBool,
}
