//! Collection system events and the persisted manifest.
//!
//! Collection metadata changes travel in-band as system-event items,
//! interleaved with ordinary mutations in the seqno stream. During a flush
//! each event updates the in-memory manifest; most also persist a marker
//! document, and a subset crosses the replication boundary:
//!
//! | Event                 | Persist manifest | Emit a doc | Replicate |
//! |-----------------------|------------------|------------|-----------|
//! | CreateCollection      | yes              | yes        | yes       |
//! | BeginDeleteCollection | yes              | no         | yes       |
//! | DeleteCollectionSoft  | yes              | yes        | no        |
//! | DeleteCollectionHard  | yes              | yes        | no        |
//! | SeparatorChanged      | yes              | yes        | yes       |

use serde::{Deserialize, Serialize};
use vellumdb_common::{StoreError, StoreResult};

use crate::item::{DocKey, Item, KeyNamespace, Operation};

// Event document keys

/// Key prefix of the collection-creation marker document. Soft and hard
/// deletes tombstone that same document, so they share this prefix.
pub const CREATE_EVENT_KEY: &str = "$collections::create:";

/// Key prefix used by `BeginDeleteCollection` in the replication stream;
/// never persisted as a document.
pub const DELETE_EVENT_KEY: &str = "$collections::delete:";

/// Fixed key of the separator-changed marker document, rewritten in place.
pub const SEPARATOR_CHANGED_KEY: &str = "$collections::separator";

/// Name of the implicit collection.
pub const DEFAULT_COLLECTION: &str = "$default";

// System events

/// The closed set of collection events, encoded in `Item::flags`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum SystemEvent {
    CreateCollection = 0,
    BeginDeleteCollection = 1,
    SeparatorChanged = 2,
    DeleteCollectionHard = 3,
    DeleteCollectionSoft = 4,
}

impl SystemEvent {
    pub fn flags(self) -> u32 {
        self as u32
    }

    pub fn from_flags(flags: u32) -> StoreResult<Self> {
        match flags {
            0 => Ok(SystemEvent::CreateCollection),
            1 => Ok(SystemEvent::BeginDeleteCollection),
            2 => Ok(SystemEvent::SeparatorChanged),
            3 => Ok(SystemEvent::DeleteCollectionHard),
            4 => Ok(SystemEvent::DeleteCollectionSoft),
            _ => Err(StoreError::InvalidArguments),
        }
    }
}

/// Document key for a system event concerning `name`.
pub fn system_event_key(event: SystemEvent, name: &str) -> DocKey {
    let text = match event {
        // Hard and soft deletes tombstone the creation marker, so they
        // address it by its key.
        SystemEvent::CreateCollection
        | SystemEvent::DeleteCollectionHard
        | SystemEvent::DeleteCollectionSoft => format!("{CREATE_EVENT_KEY}{name}"),
        SystemEvent::BeginDeleteCollection => format!("{DELETE_EVENT_KEY}{name}"),
        SystemEvent::SeparatorChanged => SEPARATOR_CHANGED_KEY.to_string(),
    };
    DocKey::new(KeyNamespace::System, text.into_bytes())
}

/// Build a system-event item. The value carries the serialized manifest the
/// event produces, which the engine persists verbatim to the manifest local
/// document if this event wins the batch.
pub fn make_system_event_item(
    event: SystemEvent,
    name: &str,
    partition: u16,
    manifest_json: Vec<u8>,
) -> Item {
    let key = system_event_key(event, name);
    let mut item = Item::new(key, partition, event.flags(), 0, Some(manifest_json));
    item.set_operation(Operation::SystemEvent);
    item
}

// The manifest

/// The persisted collections manifest of one partition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Manifest {
    pub revision: u64,
    pub separator: String,
    pub collections: Vec<String>,
}

impl Default for Manifest {
    fn default() -> Self {
        Self {
            revision: 0,
            separator: "::".to_string(),
            collections: vec![DEFAULT_COLLECTION.to_string()],
        }
    }
}

impl Manifest {
    pub fn decode(bytes: &[u8]) -> StoreResult<Self> {
        serde_json::from_slice(bytes).map_err(|_| StoreError::Corrupt)
    }

    pub fn encode(&self) -> Vec<u8> {
        serde_json::to_vec(self).expect("manifest serializes")
    }

    pub fn contains(&self, name: &str) -> bool {
        self.collections.iter().any(|c| c == name)
    }

    /// The collection a key belongs to, or `None` if no known collection
    /// claims it.
    ///
    /// Collections-namespace keys match a collection when they begin with
    /// `<collection><separator>`. Default-namespace keys belong to the
    /// implicit collection; system keys have no collection.
    pub fn collection_of(&self, key: &DocKey) -> Option<&str> {
        match key.namespace() {
            KeyNamespace::Default => self
                .collections
                .iter()
                .find(|c| c.as_str() == DEFAULT_COLLECTION)
                .map(String::as_str),
            KeyNamespace::System => None,
            KeyNamespace::Collections => {
                let bytes = key.bytes();
                self.collections
                    .iter()
                    .find(|c| {
                        let prefix_len = c.len() + self.separator.len();
                        bytes.len() > prefix_len
                            && bytes.starts_with(c.as_bytes())
                            && bytes[c.len()..prefix_len] == *self.separator.as_bytes()
                    })
                    .map(String::as_str)
            }
        }
    }
}

// Flush-side processing

/// Whether a processed item is flushed or consumed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessStatus {
    /// The item is included in the document batch.
    Continue,
    /// The item only updates the manifest and is not written to the
    /// document stream.
    Skip,
}

/// Accumulates the system events of one flush batch and selects the single
/// manifest-writing event: the one with the largest seqno, last writer
/// winning ties.
#[derive(Default)]
pub struct FlushAccumulator {
    manifest_item: Option<Item>,
}

impl FlushAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one queued item through the flush rules.
    pub fn process(&mut self, item: &Item) -> StoreResult<ProcessStatus> {
        if item.operation() != Operation::SystemEvent {
            return Ok(ProcessStatus::Continue);
        }

        match SystemEvent::from_flags(item.flags())? {
            SystemEvent::CreateCollection
            | SystemEvent::DeleteCollectionHard
            | SystemEvent::DeleteCollectionSoft
            | SystemEvent::SeparatorChanged => {
                self.save_manifest_item(item);
                Ok(ProcessStatus::Continue)
            }
            SystemEvent::BeginDeleteCollection => {
                self.save_manifest_item(item);
                Ok(ProcessStatus::Skip)
            }
        }
    }

    fn save_manifest_item(&mut self, item: &Item) {
        let replace = match &self.manifest_item {
            Some(current) => item.by_seqno() >= current.by_seqno(),
            None => true,
        };
        if replace {
            self.manifest_item = Some(item.clone());
        }
    }

    /// The event whose manifest gets persisted for this batch, if any.
    pub fn manifest_item(&self) -> Option<&Item> {
        self.manifest_item.as_ref()
    }
}

/// Whether flushing `item` writes a live document (upsert) or a tombstone.
///
/// `BeginDeleteCollection` neither upserts nor deletes; the flush must have
/// skipped it, so being asked is a caller error.
pub fn is_upsert(item: &Item) -> StoreResult<bool> {
    if item.operation() != Operation::SystemEvent {
        return Ok(!item.is_deleted());
    }
    match SystemEvent::from_flags(item.flags())? {
        SystemEvent::CreateCollection | SystemEvent::SeparatorChanged => Ok(true),
        SystemEvent::DeleteCollectionHard | SystemEvent::DeleteCollectionSoft => Ok(false),
        SystemEvent::BeginDeleteCollection => Err(StoreError::InvalidArguments),
    }
}

// Replication-side filtering

/// Whether `item` crosses the replication boundary.
///
/// Soft and hard collection deletes are local bookkeeping and never
/// replicate; everything else does, provided the item itself is flagged for
/// replication.
pub fn process_for_replication(item: &Item) -> ProcessStatus {
    if !item.should_replicate() {
        return ProcessStatus::Skip;
    }
    if item.operation() != Operation::SystemEvent {
        return ProcessStatus::Continue;
    }
    match SystemEvent::from_flags(item.flags()) {
        Ok(SystemEvent::CreateCollection)
        | Ok(SystemEvent::BeginDeleteCollection)
        | Ok(SystemEvent::SeparatorChanged) => ProcessStatus::Continue,
        Ok(SystemEvent::DeleteCollectionHard) | Ok(SystemEvent::DeleteCollectionSoft) => {
            ProcessStatus::Skip
        }
        Err(_) => ProcessStatus::Skip,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event_item(event: SystemEvent, name: &str, seqno: u64) -> Item {
        let mut item = make_system_event_item(event, name, 0, b"{}".to_vec());
        item.set_by_seqno(seqno);
        item
    }

    #[test]
    fn delete_events_share_the_create_key() {
        let create = system_event_key(SystemEvent::CreateCollection, "meat");
        let hard = system_event_key(SystemEvent::DeleteCollectionHard, "meat");
        let soft = system_event_key(SystemEvent::DeleteCollectionSoft, "meat");
        assert_eq!(create, hard);
        assert_eq!(create, soft);
        assert_eq!(create.bytes(), b"$collections::create:meat");

        let begin = system_event_key(SystemEvent::BeginDeleteCollection, "meat");
        assert_eq!(begin.bytes(), b"$collections::delete:meat");

        let sep = system_event_key(SystemEvent::SeparatorChanged, "ignored");
        assert_eq!(sep.bytes(), b"$collections::separator");
    }

    #[test]
    fn only_begin_delete_skips_the_flush() {
        let mut acc = FlushAccumulator::new();
        for (event, expected) in [
            (SystemEvent::CreateCollection, ProcessStatus::Continue),
            (SystemEvent::DeleteCollectionHard, ProcessStatus::Continue),
            (SystemEvent::DeleteCollectionSoft, ProcessStatus::Continue),
            (SystemEvent::SeparatorChanged, ProcessStatus::Continue),
            (SystemEvent::BeginDeleteCollection, ProcessStatus::Skip),
        ] {
            let item = event_item(event, "c", 1);
            assert_eq!(acc.process(&item).unwrap(), expected, "{event:?}");
        }
    }

    #[test]
    fn ordinary_items_pass_through_untouched() {
        let mut acc = FlushAccumulator::new();
        let item = Item::new(
            DocKey::new(KeyNamespace::Default, b"k".to_vec()),
            0,
            0,
            0,
            Some(b"v".to_vec()),
        );
        assert_eq!(acc.process(&item).unwrap(), ProcessStatus::Continue);
        assert!(acc.manifest_item().is_none());
    }

    #[test]
    fn highest_seqno_event_writes_the_manifest() {
        let mut acc = FlushAccumulator::new();
        acc.process(&event_item(SystemEvent::CreateCollection, "a", 5)).unwrap();
        acc.process(&event_item(SystemEvent::CreateCollection, "b", 9)).unwrap();
        acc.process(&event_item(SystemEvent::BeginDeleteCollection, "a", 7)).unwrap();

        let winner = acc.manifest_item().unwrap();
        assert_eq!(winner.by_seqno(), 9);
        assert_eq!(winner.key().bytes(), b"$collections::create:b");
    }

    #[test]
    fn is_upsert_follows_the_event_table() {
        assert!(is_upsert(&event_item(SystemEvent::CreateCollection, "c", 1)).unwrap());
        assert!(is_upsert(&event_item(SystemEvent::SeparatorChanged, "c", 1)).unwrap());
        assert!(!is_upsert(&event_item(SystemEvent::DeleteCollectionHard, "c", 1)).unwrap());
        assert!(!is_upsert(&event_item(SystemEvent::DeleteCollectionSoft, "c", 1)).unwrap());
        assert_eq!(
            is_upsert(&event_item(SystemEvent::BeginDeleteCollection, "c", 1)),
            Err(StoreError::InvalidArguments)
        );

        let plain = Item::new(DocKey::new(KeyNamespace::Default, b"k".to_vec()), 0, 0, 0, None);
        assert!(is_upsert(&plain).unwrap());
        assert!(!is_upsert(&plain.into_deletion()).unwrap());
    }

    #[test]
    fn delete_events_do_not_replicate() {
        for (event, expected) in [
            (SystemEvent::CreateCollection, ProcessStatus::Continue),
            (SystemEvent::BeginDeleteCollection, ProcessStatus::Continue),
            (SystemEvent::SeparatorChanged, ProcessStatus::Continue),
            (SystemEvent::DeleteCollectionHard, ProcessStatus::Skip),
            (SystemEvent::DeleteCollectionSoft, ProcessStatus::Skip),
        ] {
            assert_eq!(process_for_replication(&event_item(event, "c", 1)), expected);
        }

        let mut muted = event_item(SystemEvent::CreateCollection, "c", 1);
        muted.set_should_replicate(false);
        assert_eq!(process_for_replication(&muted), ProcessStatus::Skip);
    }

    #[test]
    fn manifest_matches_keys_by_prefix_and_separator() {
        let manifest = Manifest {
            revision: 1,
            separator: "::".to_string(),
            collections: vec!["$default".to_string(), "meat".to_string()],
        };

        let beef = DocKey::new(KeyNamespace::Collections, b"meat::beef".to_vec());
        assert_eq!(manifest.collection_of(&beef), Some("meat"));

        let dairy = DocKey::new(KeyNamespace::Collections, b"dairy::milk".to_vec());
        assert_eq!(manifest.collection_of(&dairy), None);

        // Prefix without the separator does not match.
        let bare = DocKey::new(KeyNamespace::Collections, b"meat".to_vec());
        assert_eq!(manifest.collection_of(&bare), None);

        let legacy = DocKey::new(KeyNamespace::Default, b"anything".to_vec());
        assert_eq!(manifest.collection_of(&legacy), Some("$default"));
    }

    #[test]
    fn manifest_json_shape() {
        let manifest = Manifest {
            revision: 4,
            separator: ":".to_string(),
            collections: vec!["$default".to_string(), "fruit".to_string()],
        };
        let text = String::from_utf8(manifest.encode()).unwrap();
        assert_eq!(
            text,
            r#"{"revision":4,"separator":":","collections":["$default","fruit"]}"#
        );
        assert_eq!(Manifest::decode(text.as_bytes()).unwrap(), manifest);
    }
}
