//! Append-only single-file document store.
//!
//! One [`DocFile`] backs one partition revision. The file is a sequence of
//! CRC-protected records: document bodies, and headers. A header snapshots
//! the full index state (sequence index, local documents, purge seqno) plus
//! a pointer to the previous header, so committing is an append + fsync,
//! rolling back is walking the header chain, and crash recovery is a forward
//! scan to the last valid header. Anything after that header is an
//! uncommitted tail and is overwritten by the next append.
//!
//! The sequence index holds exactly one entry per key: an update displaces
//! the key's previous entry, so `changes_since` yields only the latest
//! version of each document.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use vellumdb_common::{StoreError, StoreResult};

use crate::fileops::{FileHandle, FileOps};
use crate::item::DocKey;

// Record framing

const RECORD_MAGIC: u32 = u32::from_be_bytes(*b"VLDF");
const RECORD_HEADER_SIZE: usize = 13; // magic + tag + len + crc

const TAG_BODY: u8 = 1;
const TAG_HEADER: u8 = 2;

const STATE_VERSION: u8 = 1;

/// Sentinel `body_pos` for documents without a body (value-less deletions).
const NO_BODY: u64 = u64::MAX;

// Content meta

/// The stored body is lz4-compressed.
pub const CONTENT_COMPRESSED: u8 = 0x80;

// Doc infos

/// Index entry describing one document: everything except the body itself.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DocInfo {
    pub key: DocKey,
    pub seqno: u64,
    /// Opaque metadata payload (the MetaCodec wire form).
    pub rev_meta: Vec<u8>,
    pub deleted: bool,
    pub content_meta: u8,
    /// Uncompressed body size in bytes (0 if no body).
    pub body_size: u32,
    pub(crate) body_pos: u64,
    pub(crate) body_len: u32,
}

impl DocInfo {
    /// An entry ready to be handed to [`DocFile::save_documents`]; seqno and
    /// body placement are assigned by the store.
    pub fn for_save(key: DocKey, rev_meta: Vec<u8>, deleted: bool) -> Self {
        Self {
            key,
            seqno: 0,
            rev_meta,
            deleted,
            content_meta: 0,
            body_size: 0,
            body_pos: NO_BODY,
            body_len: 0,
        }
    }

    pub fn has_body(&self) -> bool {
        self.body_pos != NO_BODY
    }
}

/// Iteration control for the callback-driven read paths.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Control {
    Continue,
    Stop,
}

/// Verdict of a compaction hook for one document.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompactDecision {
    Keep,
    Drop,
}

// In-memory header state

#[derive(Debug, Clone, Default)]
struct FileState {
    update_seq: u64,
    purge_seq: u64,
    /// Position of the header this state was loaded from.
    header_pos: Option<u64>,
    /// Position of the preceding header, if any.
    prev_header_pos: Option<u64>,
    by_seq: BTreeMap<u64, DocInfo>,
    /// Encoded key -> seqno of the key's only entry in `by_seq`.
    by_id: BTreeMap<Vec<u8>, u64>,
    local_docs: BTreeMap<String, Vec<u8>>,
}

// The document file

/// An open partition data file.
pub struct DocFile {
    ops: Arc<dyn FileOps>,
    handle: FileHandle,
    path: PathBuf,
    state: FileState,
    /// Append position; everything at and beyond it is overwritable.
    eof: u64,
}

impl std::fmt::Debug for DocFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DocFile")
            .field("path", &self.path)
            .field("update_seq", &self.state.update_seq)
            .field("eof", &self.eof)
            .finish()
    }
}

impl DocFile {
    /// Open (or, with `create`, create) the file at `path` and recover the
    /// last committed header.
    pub fn open(ops: Arc<dyn FileOps>, path: impl Into<PathBuf>, create: bool) -> StoreResult<Self> {
        let path = path.into();
        let handle = ops.open(&path, create)?;

        let mut file = Self {
            ops,
            handle,
            path,
            state: FileState::default(),
            eof: 0,
        };
        file.recover()?;
        Ok(file)
    }

    /// Forward-scan the file, stopping at the first invalid record, and load
    /// the last valid header found. An empty file yields a fresh state; a
    /// non-empty file with no header at all is unusable.
    fn recover(&mut self) -> StoreResult<()> {
        let file_end = self.ops.goto_eof(&self.handle)?;
        if file_end == 0 {
            return Ok(());
        }

        let mut pos = 0u64;
        let mut last_header: Option<(u64, Vec<u8>)> = None;

        while pos + RECORD_HEADER_SIZE as u64 <= file_end {
            let mut head = [0u8; RECORD_HEADER_SIZE];
            if self.ops.pread(&self.handle, &mut head, pos)? < RECORD_HEADER_SIZE {
                break;
            }
            let magic = u32::from_be_bytes(head[0..4].try_into().expect("sized"));
            if magic != RECORD_MAGIC {
                break;
            }
            let tag = head[4];
            let len = u32::from_le_bytes(head[5..9].try_into().expect("sized")) as usize;
            let crc = u32::from_le_bytes(head[9..13].try_into().expect("sized"));

            let payload_pos = pos + RECORD_HEADER_SIZE as u64;
            if payload_pos + len as u64 > file_end {
                break;
            }
            let mut payload = vec![0u8; len];
            if self.ops.pread(&self.handle, &mut payload, payload_pos)? < len {
                break;
            }
            if crc32fast::hash(&payload) != crc {
                break;
            }

            let next = payload_pos + len as u64;
            if tag == TAG_HEADER {
                last_header = Some((pos, payload));
            }
            pos = next;
        }

        match last_header {
            Some((header_pos, payload)) => {
                self.state = parse_state(&payload, header_pos)?;
                // Abandon any uncommitted tail beyond the last header.
                self.eof = header_pos + RECORD_HEADER_SIZE as u64 + payload.len() as u64;
                Ok(())
            }
            None => Err(StoreError::NoHeader),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Highest assigned sequence number.
    pub fn update_seq(&self) -> u64 {
        self.state.update_seq
    }

    pub fn purge_seq(&self) -> u64 {
        self.state.purge_seq
    }

    /// Raise the purge seqno; compaction records the highest purged
    /// tombstone here.
    pub fn set_purge_seq(&mut self, seq: u64) {
        self.state.purge_seq = seq;
    }

    /// Number of live (non-deleted) documents.
    pub fn doc_count(&self) -> u64 {
        self.state.by_seq.values().filter(|i| !i.deleted).count() as u64
    }

    /// Number of persisted tombstones.
    pub fn deleted_count(&self) -> u64 {
        self.state.by_seq.values().filter(|i| i.deleted).count() as u64
    }

    /// Physical size of the committed portion of the file.
    pub fn file_size(&self) -> u64 {
        self.eof
    }

    /// Bytes attributable to live data: stored bodies plus index entries.
    pub fn space_used(&self) -> u64 {
        self.state
            .by_seq
            .values()
            .map(|i| {
                let body = if i.has_body() {
                    RECORD_HEADER_SIZE as u64 + i.body_len as u64
                } else {
                    0
                };
                body + seq_entry_size(i) as u64
            })
            .sum()
    }

    // Writing

    /// Append a batch of documents, assigning contiguous seqnos strictly
    /// above the current `update_seq`. `docs[n]` is the body for
    /// `infos[n]` (absent for value-less deletions). Durability requires a
    /// subsequent [`DocFile::commit`].
    ///
    /// With `compress`, bodies are stored lz4-compressed when that saves
    /// space, flagged in the entry's `content_meta`.
    pub fn save_documents(
        &mut self,
        docs: &[Option<Vec<u8>>],
        infos: &mut [DocInfo],
        compress: bool,
    ) -> StoreResult<()> {
        if docs.len() != infos.len() {
            return Err(StoreError::InvalidArguments);
        }

        for (doc, info) in docs.iter().zip(infos.iter_mut()) {
            info.seqno = self.state.update_seq + 1;
            self.state.update_seq = info.seqno;

            match doc {
                Some(body) => {
                    info.body_size = body.len() as u32;
                    let stored;
                    let bytes: &[u8] = if compress {
                        stored = lz4_flex::block::compress_prepend_size(body);
                        if stored.len() < body.len() {
                            info.content_meta |= CONTENT_COMPRESSED;
                            &stored
                        } else {
                            info.content_meta &= !CONTENT_COMPRESSED;
                            body
                        }
                    } else {
                        info.content_meta &= !CONTENT_COMPRESSED;
                        body
                    };
                    let (pos, len) = self.append_body(bytes)?;
                    info.body_pos = pos;
                    info.body_len = len;
                }
                None => {
                    info.body_pos = NO_BODY;
                    info.body_len = 0;
                    info.body_size = 0;
                }
            }

            self.index_doc(info.clone());
        }
        Ok(())
    }

    /// Insert an entry, displacing the key's previous seq entry if any.
    fn index_doc(&mut self, info: DocInfo) {
        let encoded = info.key.encoded();
        if let Some(old_seq) = self.state.by_id.insert(encoded, info.seqno) {
            self.state.by_seq.remove(&old_seq);
        }
        self.state.by_seq.insert(info.seqno, info);
    }

    /// Buffer a local document write. Local documents live in the header and
    /// are excluded from the seqno stream; `None` deletes. Durable at the
    /// next commit.
    pub fn save_local(&mut self, name: &str, value: Option<&[u8]>) {
        match value {
            Some(v) => {
                self.state.local_docs.insert(name.to_string(), v.to_vec());
            }
            None => {
                self.state.local_docs.remove(name);
            }
        }
    }

    /// Read a local document from the committed (or pending) state.
    pub fn open_local(&self, name: &str) -> Option<Vec<u8>> {
        self.state.local_docs.get(name).cloned()
    }

    /// Publish the current state by appending a header and syncing.
    pub fn commit(&mut self) -> StoreResult<()> {
        self.commit_with(true)
    }

    /// Append a header; with `sync`, data is synced before the header is
    /// written and again after, so a published header never references
    /// unsynced bodies. Without `sync`, durability is deferred to the next
    /// syncing commit.
    pub fn commit_with(&mut self, sync: bool) -> StoreResult<()> {
        if sync {
            self.ops.sync(&self.handle)?;
        }

        let prev = self.state.header_pos;
        self.state.prev_header_pos = prev;
        let payload = serialize_state(&self.state);
        let pos = self.append_record(TAG_HEADER, &payload)?;
        self.state.header_pos = Some(pos);

        if sync {
            self.ops.sync(&self.handle)?;
        }
        Ok(())
    }

    /// Step back to the previous committed header.
    ///
    /// Only the in-memory view moves; a subsequent [`DocFile::commit`]
    /// republishes the rewound state at the end of the file.
    pub fn rewind_header(&mut self) -> StoreResult<()> {
        let prev = self.state.prev_header_pos.ok_or(StoreError::NoHeader)?;
        let (tag, payload) = self.read_record(prev)?;
        if tag != TAG_HEADER {
            return Err(StoreError::Corrupt);
        }
        self.state = parse_state(&payload, prev)?;
        Ok(())
    }

    // Reading

    /// Look up the latest entry for `key`, tombstones included.
    pub fn docinfo_by_id(&self, key: &DocKey) -> Option<DocInfo> {
        let seq = self.state.by_id.get(&key.encoded())?;
        self.state.by_seq.get(seq).cloned()
    }

    /// Read the body for `info`. With `decompress`, a compressed body is
    /// inflated; otherwise the stored bytes are returned as-is.
    pub fn open_doc_with_docinfo(&self, info: &DocInfo, decompress: bool) -> StoreResult<Vec<u8>> {
        if !info.has_body() {
            return Err(StoreError::DocNotFound);
        }
        let (tag, payload) = self.read_record(info.body_pos)?;
        if tag != TAG_BODY {
            return Err(StoreError::Corrupt);
        }
        if info.content_meta & CONTENT_COMPRESSED != 0 && decompress {
            lz4_flex::block::decompress_size_prepended(&payload).map_err(|_| StoreError::Corrupt)
        } else {
            Ok(payload)
        }
    }

    /// Stored (still-compressed) body bytes, for compaction copies.
    fn read_body_stored(&self, info: &DocInfo) -> StoreResult<Option<Vec<u8>>> {
        if !info.has_body() {
            return Ok(None);
        }
        let (tag, payload) = self.read_record(info.body_pos)?;
        if tag != TAG_BODY {
            return Err(StoreError::Corrupt);
        }
        Ok(Some(payload))
    }

    /// Walk entries with `seqno >= since` in sequence order.
    pub fn changes_since<F>(&self, since: u64, mut f: F) -> StoreResult<()>
    where
        F: FnMut(&DocInfo) -> StoreResult<Control>,
    {
        for info in self.state.by_seq.range(since..).map(|(_, i)| i) {
            if f(info)? == Control::Stop {
                break;
            }
        }
        Ok(())
    }

    /// Count live (non-deleted) entries with `min_seq <= seqno <= max_seq`.
    pub fn changes_count(&self, min_seq: u64, max_seq: u64) -> StoreResult<u64> {
        if min_seq > max_seq {
            return Ok(0);
        }
        Ok(self
            .state
            .by_seq
            .range(min_seq..=max_seq)
            .filter(|(_, i)| !i.deleted)
            .count() as u64)
    }

    /// Walk entries in key order starting at `start_key` (inclusive).
    pub fn all_docs<F>(&self, start_key: Option<&DocKey>, mut f: F) -> StoreResult<()>
    where
        F: FnMut(&DocInfo) -> StoreResult<Control>,
    {
        let start = start_key.map(|k| k.encoded()).unwrap_or_default();
        for (_, seq) in self.state.by_id.range(start..) {
            let info = self.state.by_seq.get(seq).ok_or(StoreError::Corrupt)?;
            if f(info)? == Control::Stop {
                break;
            }
        }
        Ok(())
    }

    // Compaction

    /// Stream live records into a fresh file at `target_path`, consulting
    /// `hook` per entry. Seqnos, local documents, the update seqno and the
    /// purge seqno carry over; the caller commits the returned file.
    pub fn compact_to<F>(
        &self,
        target_path: impl Into<PathBuf>,
        ops: Arc<dyn FileOps>,
        mut hook: F,
    ) -> StoreResult<DocFile>
    where
        F: FnMut(&DocInfo) -> StoreResult<CompactDecision>,
    {
        let mut target = DocFile::open(ops, target_path, true)?;
        if target.eof != 0 || !target.state.by_seq.is_empty() {
            // A leftover compaction product must be removed by the caller
            // before retrying.
            return Err(StoreError::InvalidArguments);
        }

        for info in self.state.by_seq.values() {
            if hook(info)? == CompactDecision::Drop {
                continue;
            }
            let body = self.read_body_stored(info)?;
            target.copy_doc(info.clone(), body)?;
        }

        target.state.update_seq = self.state.update_seq;
        target.state.purge_seq = self.state.purge_seq;
        target.state.local_docs = self.state.local_docs.clone();
        Ok(target)
    }

    /// Append an already-stored document during compaction, preserving its
    /// seqno and content meta.
    fn copy_doc(&mut self, mut info: DocInfo, body: Option<Vec<u8>>) -> StoreResult<()> {
        match body {
            Some(bytes) => {
                let (pos, len) = self.append_body(&bytes)?;
                info.body_pos = pos;
                info.body_len = len;
            }
            None => {
                info.body_pos = NO_BODY;
                info.body_len = 0;
            }
        }
        self.index_doc(info);
        Ok(())
    }

    /// Close the underlying handle.
    pub fn close(self) -> StoreResult<()> {
        self.ops.close(&self.handle)
    }

    // Record I/O

    fn append_body(&mut self, stored: &[u8]) -> StoreResult<(u64, u32)> {
        let pos = self.append_record(TAG_BODY, stored)?;
        Ok((pos, stored.len() as u32))
    }

    fn append_record(&mut self, tag: u8, payload: &[u8]) -> StoreResult<u64> {
        let mut buf = Vec::with_capacity(RECORD_HEADER_SIZE + payload.len());
        buf.extend_from_slice(&RECORD_MAGIC.to_be_bytes());
        buf.push(tag);
        buf.extend_from_slice(&(payload.len() as u32).to_le_bytes());
        buf.extend_from_slice(&crc32fast::hash(payload).to_le_bytes());
        buf.extend_from_slice(payload);

        let pos = self.eof;
        self.ops.pwrite(&self.handle, &buf, pos)?;
        self.eof = pos + buf.len() as u64;
        Ok(pos)
    }

    fn read_record(&self, pos: u64) -> StoreResult<(u8, Vec<u8>)> {
        let mut head = [0u8; RECORD_HEADER_SIZE];
        if self.ops.pread(&self.handle, &mut head, pos)? < RECORD_HEADER_SIZE {
            return Err(StoreError::Read);
        }
        let magic = u32::from_be_bytes(head[0..4].try_into().expect("sized"));
        if magic != RECORD_MAGIC {
            return Err(StoreError::Corrupt);
        }
        let tag = head[4];
        let len = u32::from_le_bytes(head[5..9].try_into().expect("sized")) as usize;
        let crc = u32::from_le_bytes(head[9..13].try_into().expect("sized"));

        let mut payload = vec![0u8; len];
        if self.ops.pread(&self.handle, &mut payload, pos + RECORD_HEADER_SIZE as u64)? < len {
            return Err(StoreError::Read);
        }
        if crc32fast::hash(&payload) != crc {
            return Err(StoreError::Checksum);
        }
        Ok((tag, payload))
    }
}

// Header (de)serialization

fn seq_entry_size(info: &DocInfo) -> usize {
    // seqno + key_len + key + deleted + content_meta + meta_len + meta
    // + body_pos + body_len + body_size
    8 + 2 + (1 + info.key.len()) + 1 + 1 + 2 + info.rev_meta.len() + 8 + 4 + 4
}

fn serialize_state(state: &FileState) -> Vec<u8> {
    let mut out = Vec::with_capacity(64);
    out.push(STATE_VERSION);
    out.extend_from_slice(&state.update_seq.to_le_bytes());
    out.extend_from_slice(&state.purge_seq.to_le_bytes());
    out.extend_from_slice(&state.prev_header_pos.unwrap_or(u64::MAX).to_le_bytes());

    out.extend_from_slice(&(state.local_docs.len() as u32).to_le_bytes());
    for (name, value) in &state.local_docs {
        out.extend_from_slice(&(name.len() as u16).to_le_bytes());
        out.extend_from_slice(name.as_bytes());
        out.extend_from_slice(&(value.len() as u32).to_le_bytes());
        out.extend_from_slice(value);
    }

    out.extend_from_slice(&(state.by_seq.len() as u64).to_le_bytes());
    for info in state.by_seq.values() {
        out.extend_from_slice(&info.seqno.to_le_bytes());
        let key = info.key.encoded();
        out.extend_from_slice(&(key.len() as u16).to_le_bytes());
        out.extend_from_slice(&key);
        out.push(info.deleted as u8);
        out.push(info.content_meta);
        out.extend_from_slice(&(info.rev_meta.len() as u16).to_le_bytes());
        out.extend_from_slice(&info.rev_meta);
        out.extend_from_slice(&info.body_pos.to_le_bytes());
        out.extend_from_slice(&info.body_len.to_le_bytes());
        out.extend_from_slice(&info.body_size.to_le_bytes());
    }
    out
}

struct Cursor<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn take(&mut self, n: usize) -> StoreResult<&'a [u8]> {
        let end = self.pos.checked_add(n).ok_or(StoreError::Corrupt)?;
        if end > self.buf.len() {
            return Err(StoreError::Corrupt);
        }
        let out = &self.buf[self.pos..end];
        self.pos = end;
        Ok(out)
    }

    fn u8(&mut self) -> StoreResult<u8> {
        Ok(self.take(1)?[0])
    }

    fn u16(&mut self) -> StoreResult<u16> {
        Ok(u16::from_le_bytes(self.take(2)?.try_into().expect("sized")))
    }

    fn u32(&mut self) -> StoreResult<u32> {
        Ok(u32::from_le_bytes(self.take(4)?.try_into().expect("sized")))
    }

    fn u64(&mut self) -> StoreResult<u64> {
        Ok(u64::from_le_bytes(self.take(8)?.try_into().expect("sized")))
    }
}

fn parse_state(payload: &[u8], header_pos: u64) -> StoreResult<FileState> {
    let mut c = Cursor { buf: payload, pos: 0 };
    if c.u8()? != STATE_VERSION {
        return Err(StoreError::Corrupt);
    }

    let update_seq = c.u64()?;
    let purge_seq = c.u64()?;
    let prev_raw = c.u64()?;
    let prev_header_pos = (prev_raw != u64::MAX).then_some(prev_raw);

    let n_local = c.u32()?;
    let mut local_docs = BTreeMap::new();
    for _ in 0..n_local {
        let name_len = c.u16()? as usize;
        let name = std::str::from_utf8(c.take(name_len)?)
            .map_err(|_| StoreError::Corrupt)?
            .to_string();
        let val_len = c.u32()? as usize;
        let value = c.take(val_len)?.to_vec();
        local_docs.insert(name, value);
    }

    let n_seq = c.u64()?;
    let mut by_seq = BTreeMap::new();
    let mut by_id = BTreeMap::new();
    for _ in 0..n_seq {
        let seqno = c.u64()?;
        let key_len = c.u16()? as usize;
        let encoded = c.take(key_len)?.to_vec();
        let key = DocKey::decode(&encoded)?;
        let deleted = c.u8()? != 0;
        let content_meta = c.u8()?;
        let meta_len = c.u16()? as usize;
        let rev_meta = c.take(meta_len)?.to_vec();
        let body_pos = c.u64()?;
        let body_len = c.u32()?;
        let body_size = c.u32()?;

        by_id.insert(encoded, seqno);
        by_seq.insert(
            seqno,
            DocInfo {
                key,
                seqno,
                rev_meta,
                deleted,
                content_meta,
                body_size,
                body_pos,
                body_len,
            },
        );
    }

    Ok(FileState {
        update_seq,
        purge_seq,
        header_pos: Some(header_pos),
        prev_header_pos,
        by_seq,
        by_id,
        local_docs,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fileops::BaseFileOps;
    use crate::item::KeyNamespace;
    use std::io::Write;
    use tempfile::tempdir;

    fn ops() -> Arc<dyn FileOps> {
        Arc::new(BaseFileOps)
    }

    fn key(s: &str) -> DocKey {
        DocKey::new(KeyNamespace::Default, s.as_bytes().to_vec())
    }

    fn save_one(file: &mut DocFile, k: &str, body: &[u8]) -> DocInfo {
        let mut infos = vec![DocInfo::for_save(key(k), vec![0u8; 18], false)];
        file.save_documents(&[Some(body.to_vec())], &mut infos, false).unwrap();
        infos.pop().unwrap()
    }

    #[test]
    fn save_commit_reopen_round_trip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("0.1");

        {
            let mut file = DocFile::open(ops(), &path, true).unwrap();
            let info = save_one(&mut file, "alpha", b"one");
            assert_eq!(info.seqno, 1);
            save_one(&mut file, "beta", b"two");
            file.commit().unwrap();
            file.close().unwrap();
        }

        let file = DocFile::open(ops(), &path, false).unwrap();
        assert_eq!(file.update_seq(), 2);
        assert_eq!(file.doc_count(), 2);
        let info = file.docinfo_by_id(&key("alpha")).unwrap();
        assert_eq!(file.open_doc_with_docinfo(&info, true).unwrap(), b"one");
    }

    #[test]
    fn uncommitted_writes_vanish_on_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("0.1");

        {
            let mut file = DocFile::open(ops(), &path, true).unwrap();
            save_one(&mut file, "kept", b"v");
            file.commit().unwrap();
            save_one(&mut file, "lost", b"v");
            // no commit
            file.close().unwrap();
        }

        let file = DocFile::open(ops(), &path, false).unwrap();
        assert_eq!(file.update_seq(), 1);
        assert!(file.docinfo_by_id(&key("kept")).is_some());
        assert!(file.docinfo_by_id(&key("lost")).is_none());
    }

    #[test]
    fn update_displaces_previous_seq_entry() {
        let dir = tempdir().unwrap();
        let mut file = DocFile::open(ops(), dir.path().join("0.1"), true).unwrap();

        save_one(&mut file, "k", b"v1");
        let second = save_one(&mut file, "k", b"v2");
        assert_eq!(second.seqno, 2);
        assert_eq!(file.doc_count(), 1);

        let mut seen = Vec::new();
        file.changes_since(0, |i| {
            seen.push(i.seqno);
            Ok(Control::Continue)
        })
        .unwrap();
        assert_eq!(seen, vec![2]);
    }

    #[test]
    fn local_docs_round_trip_and_delete() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("0.1");

        {
            let mut file = DocFile::open(ops(), &path, true).unwrap();
            file.save_local("_local/vbstate", Some(b"{\"state\":\"active\"}"));
            file.save_local("_local/extra", Some(b"x"));
            file.save_local("_local/extra", None);
            file.commit().unwrap();
            file.close().unwrap();
        }

        let file = DocFile::open(ops(), &path, false).unwrap();
        assert_eq!(
            file.open_local("_local/vbstate").as_deref(),
            Some(b"{\"state\":\"active\"}".as_slice())
        );
        assert!(file.open_local("_local/extra").is_none());
    }

    #[test]
    fn rewind_walks_the_header_chain() {
        let dir = tempdir().unwrap();
        let mut file = DocFile::open(ops(), dir.path().join("0.1"), true).unwrap();

        for (k, v) in [("a", "1"), ("b", "2"), ("c", "3")] {
            save_one(&mut file, k, v.as_bytes());
            file.commit().unwrap();
        }
        assert_eq!(file.update_seq(), 3);

        file.rewind_header().unwrap();
        assert_eq!(file.update_seq(), 2);
        assert!(file.docinfo_by_id(&key("c")).is_none());

        file.rewind_header().unwrap();
        assert_eq!(file.update_seq(), 1);

        // First commit has no predecessor.
        assert_eq!(file.rewind_header(), Err(StoreError::NoHeader));
    }

    #[test]
    fn rewound_state_can_be_republished() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("0.1");

        {
            let mut file = DocFile::open(ops(), &path, true).unwrap();
            save_one(&mut file, "a", b"1");
            file.commit().unwrap();
            save_one(&mut file, "b", b"2");
            file.commit().unwrap();

            file.rewind_header().unwrap();
            file.commit().unwrap();
            file.close().unwrap();
        }

        let file = DocFile::open(ops(), &path, false).unwrap();
        assert_eq!(file.update_seq(), 1);
        assert!(file.docinfo_by_id(&key("b")).is_none());
    }

    #[test]
    fn changes_count_skips_tombstones() {
        let dir = tempdir().unwrap();
        let mut file = DocFile::open(ops(), dir.path().join("0.1"), true).unwrap();

        save_one(&mut file, "live", b"v");
        let mut infos = vec![DocInfo::for_save(key("dead"), vec![0u8; 18], true)];
        file.save_documents(&[None], &mut infos, false).unwrap();

        assert_eq!(file.changes_count(0, u64::MAX).unwrap(), 1);
        assert_eq!(file.changes_count(2, 2).unwrap(), 0);
        assert_eq!(file.changes_count(5, 1).unwrap(), 0);
    }

    #[test]
    fn compressed_bodies_round_trip() {
        let dir = tempdir().unwrap();
        let mut file = DocFile::open(ops(), dir.path().join("0.1"), true).unwrap();

        let body = vec![b'x'; 4096];
        let mut infos = vec![DocInfo::for_save(key("big"), vec![0u8; 18], false)];
        file.save_documents(&[Some(body.clone())], &mut infos, true).unwrap();

        let info = &infos[0];
        assert_ne!(info.content_meta & CONTENT_COMPRESSED, 0);
        assert!(info.body_len < info.body_size);
        assert_eq!(file.open_doc_with_docinfo(info, true).unwrap(), body);

        let stored = file.open_doc_with_docinfo(info, false).unwrap();
        assert!(stored.len() < body.len());
    }

    #[test]
    fn all_docs_walks_in_key_order_from_start() {
        let dir = tempdir().unwrap();
        let mut file = DocFile::open(ops(), dir.path().join("0.1"), true).unwrap();

        for k in ["carrot", "apple", "banana"] {
            save_one(&mut file, k, b"v");
        }

        let mut keys = Vec::new();
        file.all_docs(Some(&key("banana")), |i| {
            keys.push(String::from_utf8_lossy(i.key.bytes()).into_owned());
            Ok(Control::Continue)
        })
        .unwrap();
        assert_eq!(keys, vec!["banana", "carrot"]);
    }

    #[test]
    fn compact_drops_per_hook_and_preserves_seqnos() {
        let dir = tempdir().unwrap();
        let src_path = dir.path().join("0.1");
        let dst_path = dir.path().join("0.2.compact");

        let mut src = DocFile::open(ops(), &src_path, true).unwrap();
        save_one(&mut src, "keep", b"v1");
        save_one(&mut src, "drop", b"v2");
        save_one(&mut src, "also-keep", b"v3");
        src.save_local("_local/vbstate", Some(b"{}"));
        src.commit().unwrap();

        let mut dst = src
            .compact_to(&dst_path, ops(), |info| {
                Ok(if info.key.bytes() == b"drop" {
                    CompactDecision::Drop
                } else {
                    CompactDecision::Keep
                })
            })
            .unwrap();
        dst.commit().unwrap();

        assert_eq!(dst.update_seq(), 3);
        assert_eq!(dst.doc_count(), 2);
        assert!(dst.docinfo_by_id(&key("drop")).is_none());
        let info = dst.docinfo_by_id(&key("also-keep")).unwrap();
        assert_eq!(info.seqno, 3);
        assert_eq!(dst.open_doc_with_docinfo(&info, true).unwrap(), b"v3");
        assert!(dst.open_local("_local/vbstate").is_some());
    }

    #[test]
    fn garbage_tail_is_ignored() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("0.1");

        {
            let mut file = DocFile::open(ops(), &path, true).unwrap();
            save_one(&mut file, "a", b"1");
            file.commit().unwrap();
            file.close().unwrap();
        }

        // Simulate a torn write after the last commit.
        let mut raw = std::fs::OpenOptions::new().append(true).open(&path).unwrap();
        raw.write_all(&[0xAB; 7]).unwrap();
        drop(raw);

        let file = DocFile::open(ops(), &path, false).unwrap();
        assert_eq!(file.update_seq(), 1);
        assert!(file.docinfo_by_id(&key("a")).is_some());
    }

    #[test]
    fn nonempty_file_without_header_is_rejected() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("0.1");
        std::fs::write(&path, b"not a docfile at all").unwrap();

        assert_eq!(DocFile::open(ops(), &path, false).unwrap_err(), StoreError::NoHeader);
    }

    #[test]
    fn missing_file_fails_to_open() {
        let dir = tempdir().unwrap();
        let err = DocFile::open(ops(), dir.path().join("absent.1"), false).unwrap_err();
        assert_eq!(err, StoreError::OpenFile);
    }

    #[test]
    fn batch_seqnos_are_contiguous() {
        let dir = tempdir().unwrap();
        let mut file = DocFile::open(ops(), dir.path().join("0.1"), true).unwrap();

        save_one(&mut file, "seed", b"v");
        file.commit().unwrap();

        let mut infos = vec![
            DocInfo::for_save(key("x"), vec![0u8; 18], false),
            DocInfo::for_save(key("y"), vec![0u8; 18], false),
            DocInfo::for_save(key("z"), vec![0u8; 18], false),
        ];
        let docs = vec![Some(b"1".to_vec()), Some(b"2".to_vec()), Some(b"3".to_vec())];
        file.save_documents(&docs, &mut infos, false).unwrap();

        assert_eq!(infos.iter().map(|i| i.seqno).collect::<Vec<_>>(), vec![2, 3, 4]);
        assert_eq!(file.update_seq(), 4);
    }
}
