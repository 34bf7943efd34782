//! Documents queued for persistence and the values read back out.
//!
//! An [`Item`] is the unit handed to the engine by the flusher: a namespaced
//! key, an optional body, and the metadata that ends up in the on-disk
//! `rev_meta` payload. Operations form a closed set; everything downstream
//! matches on them exhaustively.

use vellumdb_common::{StoreError, StoreResult};

// Datatype bits

/// Plain uninterpreted bytes.
pub const DATATYPE_RAW: u8 = 0x00;
/// The body is stored compressed.
pub const DATATYPE_COMPRESSED: u8 = 0x02;

// Key namespaces

/// Namespace tag carried by every key, persisted as a one-byte prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum KeyNamespace {
    /// Legacy keys with no collection affiliation.
    Default = 0,
    /// Keys of the form `<collection><separator><suffix>`.
    Collections = 1,
    /// Internal keys such as collection system events.
    System = 2,
}

impl KeyNamespace {
    pub fn tag(self) -> u8 {
        self as u8
    }

    pub fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            0 => Some(KeyNamespace::Default),
            1 => Some(KeyNamespace::Collections),
            2 => Some(KeyNamespace::System),
            _ => None,
        }
    }
}

// Document keys

/// A namespaced document key.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DocKey {
    namespace: KeyNamespace,
    bytes: Vec<u8>,
}

impl DocKey {
    pub fn new(namespace: KeyNamespace, bytes: impl Into<Vec<u8>>) -> Self {
        Self {
            namespace,
            bytes: bytes.into(),
        }
    }

    pub fn namespace(&self) -> KeyNamespace {
        self.namespace
    }

    /// The raw key bytes, without the namespace tag.
    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// On-disk form: namespace tag byte followed by the raw key.
    pub fn encoded(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(1 + self.bytes.len());
        out.push(self.namespace.tag());
        out.extend_from_slice(&self.bytes);
        out
    }

    /// Decode an on-disk key. An empty buffer or an unknown tag means the
    /// file is structurally damaged.
    pub fn decode(raw: &[u8]) -> StoreResult<Self> {
        let (&tag, rest) = raw.split_first().ok_or(StoreError::Corrupt)?;
        let namespace = KeyNamespace::from_tag(tag).ok_or(StoreError::Corrupt)?;
        Ok(Self {
            namespace,
            bytes: rest.to_vec(),
        })
    }
}

impl std::fmt::Display for DocKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", String::from_utf8_lossy(&self.bytes))
    }
}

// Operations

/// What a queued item does to the document stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Mutation,
    Deletion,
    /// An in-band collections event; `Item::flags` selects the variant.
    SystemEvent,
}

// Items

/// A document mutation queued for persistence, or a value read back out.
#[derive(Debug, Clone)]
pub struct Item {
    key: DocKey,
    value: Option<Vec<u8>>,
    partition: u16,
    cas: u64,
    exptime: u32,
    flags: u32,
    datatype: u8,
    by_seqno: u64,
    operation: Operation,
    should_replicate: bool,
}

impl Item {
    pub fn new(
        key: DocKey,
        partition: u16,
        flags: u32,
        exptime: u32,
        value: Option<Vec<u8>>,
    ) -> Self {
        Self {
            key,
            value,
            partition,
            cas: 0,
            exptime,
            flags,
            datatype: DATATYPE_RAW,
            by_seqno: 0,
            operation: Operation::Mutation,
            should_replicate: true,
        }
    }

    pub fn key(&self) -> &DocKey {
        &self.key
    }

    pub fn value(&self) -> Option<&[u8]> {
        self.value.as_deref()
    }

    pub fn take_value(&mut self) -> Option<Vec<u8>> {
        self.value.take()
    }

    pub fn partition(&self) -> u16 {
        self.partition
    }

    pub fn cas(&self) -> u64 {
        self.cas
    }

    pub fn set_cas(&mut self, cas: u64) {
        self.cas = cas;
    }

    pub fn exptime(&self) -> u32 {
        self.exptime
    }

    pub fn flags(&self) -> u32 {
        self.flags
    }

    pub fn datatype(&self) -> u8 {
        self.datatype
    }

    pub fn set_datatype(&mut self, datatype: u8) {
        self.datatype = datatype;
    }

    pub fn by_seqno(&self) -> u64 {
        self.by_seqno
    }

    pub fn set_by_seqno(&mut self, seqno: u64) {
        self.by_seqno = seqno;
    }

    pub fn operation(&self) -> Operation {
        self.operation
    }

    pub fn set_operation(&mut self, operation: Operation) {
        self.operation = operation;
    }

    pub fn is_deleted(&self) -> bool {
        self.operation == Operation::Deletion
    }

    /// Whether the item is eligible for the replication stream at all.
    pub fn should_replicate(&self) -> bool {
        self.should_replicate
    }

    pub fn set_should_replicate(&mut self, replicate: bool) {
        self.should_replicate = replicate;
    }

    /// Turn the item into a deletion, dropping any body it carried.
    pub fn into_deletion(mut self) -> Self {
        self.operation = Operation::Deletion;
        self.value = None;
        self
    }
}

// Mutation results

/// Outcome reported to a request's completion callback after commit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MutationOutcome {
    /// The key did not exist before; a new document was created.
    Inserted,
    /// An existing document (or tombstone) was replaced.
    Updated,
    /// A deletion found nothing on disk to delete.
    NothingExisted,
    /// The commit failed; nothing was persisted.
    Failed,
}

/// Per-request completion callback, fired once the batch commits (or fails).
pub type MutationCallback = Box<dyn FnMut(&Item, MutationOutcome) + Send>;

// Read results

/// A document returned by the read paths.
#[derive(Debug, Clone)]
pub struct GetValue {
    pub item: Item,
}

impl GetValue {
    pub fn new(item: Item) -> Self {
        Self { item }
    }
}
