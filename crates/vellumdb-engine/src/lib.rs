//! VellumDB persistence engine.
//!
//! Durable storage for a set of logical partitions, each backed by an
//! append-only single-file document store with transactional batch commits,
//! versioned per-document metadata, collection manifests interleaved in the
//! seqno stream, rollback by header rewinding, and callback-driven
//! compaction.

mod collections;
mod config;
mod engine;
mod fileops;
mod item;
mod meta;
mod revmap;
mod scan;
mod state;
mod store;


// Re-exports
pub use collections::{
    is_upsert, make_system_event_item, process_for_replication, system_event_key,
    FlushAccumulator, Manifest, ProcessStatus, SystemEvent, CREATE_EVENT_KEY,
    DEFAULT_COLLECTION, DELETE_EVENT_KEY, SEPARATOR_CHANGED_KEY,
};
pub use config::EngineConfig;
pub use engine::{
    BgFetch, CompactionContext, FileInfo, PersistenceEngine, RollbackResult,
};
pub use fileops::{BaseFileOps, FileHandle, FileOps, FileStats, SeekHistogram, StatsTap};
pub use item::{
    DocKey, GetValue, Item, KeyNamespace, MutationCallback, MutationOutcome, Operation,
    DATATYPE_COMPRESSED, DATATYPE_RAW,
};
pub use meta::{DocMeta, MetaVersion, FLEX_META_CODE};
pub use revmap::FileRevMap;
pub use scan::{
    CacheLookup, CacheLookupCallback, CacheStatus, DocumentFilter, ScanContext, ScanFlow,
    ScanStatus, ScanValueCallback, ValueFilter,
};
pub use state::{Membership, PartitionState, StatePersist, MANIFEST_DOC, VBSTATE_DOC};
pub use store::{CompactDecision, Control, DocFile, DocInfo, CONTENT_COMPRESSED};

pub use vellumdb_common::{EngineError, Result, StoreError, StoreResult};
