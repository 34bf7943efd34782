//! The persistence engine.
//!
//! One engine instance owns the write path for a set of logical partitions,
//! each backed by a single append-only data file named
//! `<dir>/<partition>.<revision>`. A commit drains the pending transaction
//! into the file as one batch: documents and their metadata, the partition
//! state local document, and (when a system event wins the batch) the
//! collections manifest local document, followed by a syncing header append.
//!
//! The read/write instance may have exactly one read-only sibling created
//! with [`PersistenceEngine::make_read_only`]; the pair shares the file
//! revision map, and every mutation entry point on the sibling fails with
//! `NotPermitted`.

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use crossbeam_channel::{unbounded, Receiver, Sender};
use parking_lot::{Mutex, RwLock};
use tracing::{debug, info, warn};
use vellumdb_common::{EngineError, Result, StoreError};

use crate::collections::{self, FlushAccumulator, Manifest, ProcessStatus};
use crate::config::EngineConfig;
use crate::fileops::{BaseFileOps, FileOps, FileStats, StatsTap};
use crate::item::{
    DocKey, GetValue, Item, KeyNamespace, MutationCallback, MutationOutcome, Operation,
    DATATYPE_COMPRESSED,
};
use crate::meta::{DocMeta, MetaVersion};
use crate::revmap::FileRevMap;
use crate::scan::{
    CacheLookup, CacheLookupCallback, CacheStatus, DocumentFilter, ScanContext, ScanFlow,
    ScanHandle, ScanStatus, ScanValueCallback, ValueFilter,
};
use crate::state::{Membership, PartitionState, StatePersist, MANIFEST_DOC, VBSTATE_DOC};
use crate::store::{CompactDecision, Control, DocFile, DocInfo, CONTENT_COMPRESSED};

// Requests and results

struct PendingRequest {
    item: Item,
    callback: Option<MutationCallback>,
}

fn fire_callback(req: &mut PendingRequest, outcome: MutationOutcome) {
    if let Some(cb) = req.callback.as_mut() {
        cb(&req.item, outcome);
    }
}

/// One entry of a multi-get batch; `result` is filled in place.
pub struct BgFetch {
    pub key: DocKey,
    pub meta_only: bool,
    pub result: Option<Result<GetValue>>,
}

impl BgFetch {
    pub fn new(key: DocKey) -> Self {
        Self {
            key,
            meta_only: false,
            result: None,
        }
    }

    pub fn meta_only(key: DocKey) -> Self {
        Self {
            key,
            meta_only: true,
            result: None,
        }
    }
}

/// Parameters and callbacks driving one compaction run.
pub struct CompactionContext {
    pub partition: u16,
    /// Tombstones below this seqno are purged.
    pub purge_before_seq: u64,
    /// Purge every tombstone regardless of seqno.
    pub drop_deletes: bool,
    /// Documents with a non-zero expiry at or below this time are expired.
    pub curr_time: u32,
    /// Fired for each expired document so the caller can persist a deletion.
    pub expiry_cb: Option<Box<dyn FnMut(&DocKey, u64) + Send>>,
    /// Fed every surviving record to rebuild the partition's bloom filter.
    pub bloom_cb: Option<Box<dyn FnMut(&DocKey, bool) + Send>>,
}

impl CompactionContext {
    pub fn new(partition: u16) -> Self {
        Self {
            partition,
            purge_before_seq: 0,
            drop_deletes: false,
            curr_time: 0,
            expiry_cb: None,
            bloom_cb: None,
        }
    }
}

/// Outcome of a successful rollback.
#[derive(Debug, Clone)]
pub struct RollbackResult {
    /// The seqno actually rolled back to (highest header at or below the
    /// requested target).
    pub rollback_seqno: u64,
    pub state: PartitionState,
}

/// Size figures for one partition file.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FileInfo {
    pub file_size: u64,
    pub space_used: u64,
}

// Cached per-partition figures

const DELETE_COUNT_UNKNOWN: u64 = u64::MAX;

struct PartitionCache {
    state: RwLock<Option<PartitionState>>,
    manifest: RwLock<Manifest>,
    doc_count: AtomicU64,
    delete_count: AtomicU64,
    file_size: AtomicU64,
    space_used: AtomicU64,
}

impl PartitionCache {
    fn new() -> Self {
        Self {
            state: RwLock::new(None),
            manifest: RwLock::new(Manifest::default()),
            doc_count: AtomicU64::new(0),
            delete_count: AtomicU64::new(DELETE_COUNT_UNKNOWN),
            file_size: AtomicU64::new(0),
            space_used: AtomicU64::new(0),
        }
    }

    fn refresh_from(&self, file: &DocFile) {
        self.doc_count.store(file.doc_count(), Ordering::Relaxed);
        self.delete_count.store(file.deleted_count(), Ordering::Relaxed);
        self.file_size.store(file.file_size(), Ordering::Relaxed);
        self.space_used.store(file.space_used(), Ordering::Relaxed);
    }

    fn clear(&self) {
        *self.state.write() = None;
        *self.manifest.write() = Manifest::default();
        self.doc_count.store(0, Ordering::Relaxed);
        self.delete_count.store(DELETE_COUNT_UNKNOWN, Ordering::Relaxed);
        self.file_size.store(0, Ordering::Relaxed);
        self.space_used.store(0, Ordering::Relaxed);
    }
}

#[derive(Default)]
struct EngineCounters {
    io_num_write: AtomicU64,
    io_write_bytes: AtomicU64,
    io_num_read: AtomicU64,
    io_read_bytes: AtomicU64,
    num_get_failure: AtomicU64,
}

// The engine

pub struct PersistenceEngine {
    config: EngineConfig,
    read_only: bool,
    rev_map: Arc<FileRevMap>,
    base_ops: Arc<dyn FileOps>,
    /// Tap for normal traffic.
    ops: Arc<StatsTap>,
    /// Tap for compaction traffic.
    compaction_ops: Arc<StatsTap>,
    caches: Vec<PartitionCache>,
    in_transaction: AtomicBool,
    pending: Mutex<Vec<PendingRequest>>,
    pending_deletions: (Sender<PathBuf>, Receiver<PathBuf>),
    scans: Mutex<HashMap<u64, Arc<ScanHandle>>>,
    scan_counter: AtomicU64,
    counters: EngineCounters,
}

impl PersistenceEngine {
    /// Open a read/write engine over `config.dir`, warming partition state,
    /// manifests and counters from whatever files are already there.
    pub fn open(config: EngineConfig) -> Result<Self> {
        Self::open_with_ops(config, Arc::new(BaseFileOps))
    }

    /// As [`PersistenceEngine::open`], with injected base file ops.
    pub fn open_with_ops(config: EngineConfig, base_ops: Arc<dyn FileOps>) -> Result<Self> {
        std::fs::create_dir_all(&config.dir)
            .map_err(|_| EngineError::TmpFail(StoreError::OpenFile))?;

        let caches = (0..config.max_partitions).map(|_| PartitionCache::new()).collect();
        let engine = Self {
            rev_map: Arc::new(FileRevMap::new(config.max_partitions)),
            ops: Arc::new(StatsTap::new(Arc::clone(&base_ops))),
            compaction_ops: Arc::new(StatsTap::new(Arc::clone(&base_ops))),
            base_ops,
            caches,
            read_only: false,
            in_transaction: AtomicBool::new(false),
            pending: Mutex::new(Vec::new()),
            pending_deletions: unbounded(),
            scans: Mutex::new(HashMap::new()),
            scan_counter: AtomicU64::new(0),
            counters: EngineCounters::default(),
            config,
        };
        engine.initialize()?;
        Ok(engine)
    }

    /// Create the read-only sibling. It shares the revision map and sees
    /// every rotation the writer performs; all mutation paths on it fail
    /// with `NotPermitted`.
    pub fn make_read_only(&self) -> Self {
        let mut config = self.config.clone();
        config.stat_prefix = match config.stat_prefix.strip_prefix("rw") {
            Some(rest) => format!("ro{rest}"),
            None => format!("{}_ro", config.stat_prefix),
        };

        Self {
            read_only: true,
            rev_map: Arc::clone(&self.rev_map),
            ops: Arc::new(StatsTap::new(Arc::clone(&self.base_ops))),
            compaction_ops: Arc::new(StatsTap::new(Arc::clone(&self.base_ops))),
            base_ops: Arc::clone(&self.base_ops),
            caches: (0..config.max_partitions).map(|_| PartitionCache::new()).collect(),
            in_transaction: AtomicBool::new(false),
            pending: Mutex::new(Vec::new()),
            pending_deletions: unbounded(),
            scans: Mutex::new(HashMap::new()),
            scan_counter: AtomicU64::new(0),
            counters: EngineCounters::default(),
            config,
        }
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    // Warmup

    /// Scan the data directory: adopt the highest revision per partition,
    /// queue stale revisions and leftover compaction products for deletion,
    /// and load cached state, manifest and counters.
    fn initialize(&self) -> Result<()> {
        let entries = std::fs::read_dir(&self.config.dir)
            .map_err(|_| EngineError::TmpFail(StoreError::OpenFile))?;

        let mut newest: BTreeMap<u16, u64> = BTreeMap::new();
        let mut all_files: Vec<(u16, u64)> = Vec::new();

        for entry in entries.flatten() {
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if name.ends_with(".compact") {
                debug!(file = %name, "removing leftover compaction product");
                self.queue_deletion(entry.path());
                continue;
            }
            let Some((vb, rev)) = parse_file_name(&name) else {
                continue;
            };
            if vb >= self.config.max_partitions {
                warn!(partition = vb, "data file for out-of-range partition ignored");
                continue;
            }
            let highest = newest.entry(vb).or_insert(rev);
            *highest = (*highest).max(rev);
            all_files.push((vb, rev));
        }

        for (vb, rev) in all_files {
            if rev < newest[&vb] {
                self.queue_deletion(self.data_path(vb, rev));
            }
        }

        for (&vb, &rev) in &newest {
            self.rev_map.set(vb, rev);
            if let Err(e) = self.warm_partition(vb, rev) {
                warn!(partition = vb, revision = rev, error = %e, "warmup failed for partition");
            }
        }
        Ok(())
    }

    fn warm_partition(&self, vb: u16, rev: u64) -> Result<()> {
        let file = DocFile::open(self.ops_dyn(), self.data_path(vb, rev), false)
            .map_err(EngineError::from)?;
        let cache = &self.caches[vb as usize];

        if let Some(bytes) = file.open_local(VBSTATE_DOC) {
            match PartitionState::decode(&bytes) {
                Ok(mut state) => {
                    state.high_seqno = file.update_seq();
                    state.purge_seqno = file.purge_seq();
                    *cache.state.write() = Some(state);
                }
                Err(e) => {
                    warn!(partition = vb, error = e.as_str(), "undecodable partition state")
                }
            }
        }

        if let Some(bytes) = file.open_local(MANIFEST_DOC) {
            match Manifest::decode(&bytes) {
                Ok(manifest) => *cache.manifest.write() = manifest,
                Err(e) => {
                    warn!(partition = vb, error = e.as_str(), "undecodable collections manifest")
                }
            }
        }

        cache.refresh_from(&file);
        let _ = file.close();
        Ok(())
    }

    /// Persisted partition states, as loaded at warmup and updated by
    /// commits since.
    pub fn list_persisted_states(&self) -> Vec<(u16, PartitionState)> {
        self.caches
            .iter()
            .enumerate()
            .filter_map(|(vb, c)| c.state.read().clone().map(|s| (vb as u16, s)))
            .collect()
    }

    /// The cached state of one partition, falling back to disk when this
    /// instance has not loaded it yet (the read-only sibling's usual case).
    pub fn read_state(&self, partition: u16) -> Result<Option<PartitionState>> {
        self.check_partition(partition)?;
        if let Some(state) = self.caches[partition as usize].state.read().clone() {
            return Ok(Some(state));
        }

        let rev = self.rev_map.get(partition);
        let file = match DocFile::open(self.ops_dyn(), self.data_path(partition, rev), false) {
            Ok(file) => file,
            Err(StoreError::OpenFile) => return Ok(None),
            Err(e) => {
                warn!(partition, error = e.as_str(), "failed to read partition state");
                return Err(e.into());
            }
        };

        let state = match file.open_local(VBSTATE_DOC) {
            Some(bytes) => {
                let mut state = PartitionState::decode(&bytes).map_err(EngineError::from)?;
                state.high_seqno = file.update_seq();
                state.purge_seqno = file.purge_seq();
                Some(state)
            }
            None => None,
        };
        let _ = file.close();

        if let Some(state) = &state {
            *self.caches[partition as usize].state.write() = Some(state.clone());
        }
        Ok(state)
    }

    // Transactions

    /// Open a transaction. Nested begins are a no-op.
    pub fn begin(&self) -> Result<()> {
        if self.read_only {
            return Err(EngineError::NotPermitted);
        }
        self.in_transaction.store(true, Ordering::SeqCst);
        Ok(())
    }

    /// Queue an insert/update. The callback fires after the batch commits.
    pub fn set(&self, item: Item, callback: Option<MutationCallback>) -> Result<()> {
        self.mutation_guard()?;
        self.check_partition(item.partition())?;
        if item.key().namespace() == KeyNamespace::Collections {
            let known = self.caches[item.partition() as usize]
                .manifest
                .read()
                .collection_of(item.key())
                .is_some()
                || self.pending_manifest_allows(item.partition(), item.key());
            if !known {
                return Err(EngineError::UnknownCollection);
            }
        }
        self.pending.lock().push(PendingRequest { item, callback });
        Ok(())
    }

    /// A system event queued earlier in this transaction may introduce the
    /// key's collection before the batch lands; the latest queued event's
    /// manifest is authoritative for admission.
    fn pending_manifest_allows(&self, partition: u16, key: &DocKey) -> bool {
        let pending = self.pending.lock();
        pending
            .iter()
            .rev()
            .filter(|req| {
                req.item.operation() == Operation::SystemEvent && req.item.partition() == partition
            })
            .find_map(|req| req.item.value().and_then(|json| Manifest::decode(json).ok()))
            .is_some_and(|manifest| manifest.collection_of(key).is_some())
    }

    /// Queue a deletion. A value-less delete persists a full `DocInfo` with
    /// the deleted bit set and no document body.
    pub fn delete(&self, item: Item, callback: Option<MutationCallback>) -> Result<()> {
        self.mutation_guard()?;
        self.check_partition(item.partition())?;
        let mut item = item;
        item.set_operation(Operation::Deletion);
        self.pending.lock().push(PendingRequest { item, callback });
        Ok(())
    }

    fn mutation_guard(&self) -> Result<()> {
        if self.read_only {
            return Err(EngineError::NotPermitted);
        }
        if !self.in_transaction.load(Ordering::SeqCst) {
            // Mutating outside a transaction is an invariant breach, not a
            // retryable condition.
            return Err(EngineError::Fatal(StoreError::InvalidArguments));
        }
        Ok(())
    }

    /// Discard the pending transaction.
    pub fn rollback_txn(&self) -> Result<()> {
        if self.read_only {
            return Err(EngineError::NotPermitted);
        }
        self.pending.lock().clear();
        self.in_transaction.store(false, Ordering::SeqCst);
        Ok(())
    }

    /// Commit the pending transaction as one durable batch.
    ///
    /// `manifest_item` optionally carries an externally-selected system
    /// event whose manifest competes with the batch's own events for the
    /// single manifest write. Idempotent when there is no pending work.
    pub fn commit(&self, manifest_item: Option<&Item>) -> Result<()> {
        if self.read_only {
            return Err(EngineError::NotPermitted);
        }
        if !self.in_transaction.load(Ordering::SeqCst) {
            return Ok(());
        }

        let mut reqs: Vec<PendingRequest> = std::mem::take(&mut *self.pending.lock());
        if reqs.is_empty() && manifest_item.is_none() {
            self.in_transaction.store(false, Ordering::SeqCst);
            return Ok(());
        }

        let partition = reqs
            .first()
            .map(|r| r.item.partition())
            .or_else(|| manifest_item.map(|i| i.partition()))
            .expect("batch is non-empty");

        let result = self
            .check_partition(partition)
            .and_then(|_| self.flush_batch(partition, &mut reqs, manifest_item));

        self.in_transaction.store(false, Ordering::SeqCst);
        if result.is_err() {
            for req in reqs.iter_mut() {
                fire_callback(req, MutationOutcome::Failed);
            }
        }
        result
    }

    /// The commit algorithm: open (with rotation retry), apply collection
    /// manifest precedence, save the batch, write the two local documents,
    /// publish, then fire completions and refresh cached counters.
    fn flush_batch(
        &self,
        partition: u16,
        reqs: &mut [PendingRequest],
        external_manifest: Option<&Item>,
    ) -> Result<()> {
        let mut flush = FlushAccumulator::new();
        if let Some(item) = external_manifest {
            // Competes for the manifest write but never joins the doc batch.
            flush.process(item).map_err(EngineError::from)?;
        }

        let mut included: Vec<usize> = Vec::new();
        let mut skipped: Vec<usize> = Vec::new();
        for (i, req) in reqs.iter().enumerate() {
            match flush.process(&req.item).map_err(EngineError::from)? {
                ProcessStatus::Continue => included.push(i),
                ProcessStatus::Skip => skipped.push(i),
            }
        }

        let mut file = self.open_partition(partition, true)?;

        let mut docs: Vec<Option<Vec<u8>>> = Vec::with_capacity(included.len());
        let mut infos: Vec<DocInfo> = Vec::with_capacity(included.len());
        let mut existed: Vec<bool> = Vec::with_capacity(included.len());
        for &i in &included {
            let item = &reqs[i].item;
            let deleted = !collections::is_upsert(item).map_err(EngineError::from)?;
            let meta = DocMeta::new(item.cas(), item.exptime(), item.flags(), item.datatype());
            existed.push(file.docinfo_by_id(item.key()).is_some());
            docs.push(item.value().map(|v| v.to_vec()));
            infos.push(DocInfo::for_save(
                item.key().clone(),
                meta.encode(MetaVersion::V1),
                deleted,
            ));
        }

        file.save_documents(&docs, &mut infos, self.config.compress_doc_bodies)
            .map_err(|e| {
                warn!(partition, error = e.as_str(), "failed to save document batch");
                EngineError::from(e)
            })?;

        for (n, &i) in included.iter().enumerate() {
            reqs[i].item.set_by_seqno(infos[n].seqno);
        }

        // The partition state snapshot rides along with every commit.
        let mut state = self.caches[partition as usize]
            .state
            .read()
            .clone()
            .unwrap_or_else(|| PartitionState::new(Membership::Active));
        state.high_seqno = file.update_seq();
        state.purge_seqno = file.purge_seq();
        file.save_local(VBSTATE_DOC, Some(&state.encode()));

        // At most one manifest write per commit: the winning event's JSON.
        if let Some(event) = flush.manifest_item() {
            if let Some(json) = event.value() {
                file.save_local(MANIFEST_DOC, Some(json));
                match Manifest::decode(json) {
                    Ok(manifest) => {
                        *self.caches[partition as usize].manifest.write() = manifest;
                    }
                    Err(e) => warn!(
                        partition,
                        error = e.as_str(),
                        "system event carried an undecodable manifest"
                    ),
                }
            }
        }

        file.commit().map_err(|e| {
            warn!(partition, error = e.as_str(), "commit failed");
            EngineError::from(e)
        })?;

        let cache = &self.caches[partition as usize];
        *cache.state.write() = Some(state);
        cache.refresh_from(&file);

        for (n, &i) in included.iter().enumerate() {
            let item = &reqs[i].item;
            self.counters.io_num_write.fetch_add(1, Ordering::Relaxed);
            let bytes = item.key().len()
                + infos[n].rev_meta.len()
                + item.value().map_or(0, |v| v.len());
            self.counters.io_write_bytes.fetch_add(bytes as u64, Ordering::Relaxed);
        }

        let _ = file.close();

        for (n, &i) in included.iter().enumerate() {
            let outcome = match (infos[n].deleted, existed[n]) {
                (true, false) => MutationOutcome::NothingExisted,
                (false, false) => MutationOutcome::Inserted,
                (_, true) => MutationOutcome::Updated,
            };
            fire_callback(&mut reqs[i], outcome);
        }
        // Consumed events updated the manifest; report them as updates.
        for &i in &skipped {
            fire_callback(&mut reqs[i], MutationOutcome::Updated);
        }
        Ok(())
    }

    // Partition state snapshots

    /// Persist a partition-state snapshot. `WithCommit` publishes and syncs
    /// immediately; `WithoutCommit` leaves a dangling (unsynced) commit for
    /// the next mutation batch to harden.
    pub fn snapshot_state(
        &self,
        partition: u16,
        state: &PartitionState,
        persist: StatePersist,
    ) -> Result<bool> {
        if self.read_only {
            return Err(EngineError::NotPermitted);
        }
        self.check_partition(partition)?;

        let mut file = self.open_partition(partition, true)?;
        file.save_local(VBSTATE_DOC, Some(&state.encode()));
        let commit_result = match persist {
            StatePersist::WithCommit => file.commit(),
            StatePersist::WithoutCommit => file.commit_with(false),
        };
        commit_result.map_err(|e| {
            warn!(partition, error = e.as_str(), "failed to persist partition state");
            EngineError::from(e)
        })?;

        let cache = &self.caches[partition as usize];
        *cache.state.write() = Some(state.clone());
        cache.refresh_from(&file);
        let _ = file.close();
        Ok(true)
    }

    /// Reset the partition to an empty file with an active, seqno-0 state.
    /// The old file revision is scheduled for deletion.
    pub fn reset(&self, partition: u16) -> Result<()> {
        if self.read_only {
            return Err(EngineError::NotPermitted);
        }
        self.check_partition(partition)?;

        let old_path = self.data_path(partition, self.rev_map.get(partition));
        let new_rev = self.rev_map.bump(partition);

        let mut state = self.caches[partition as usize]
            .state
            .read()
            .clone()
            .unwrap_or_else(|| PartitionState::new(Membership::Active));
        state.state = Membership::Active;
        state.high_seqno = 0;
        state.purge_seqno = 0;
        state.max_deleted_seqno = 0;
        state.snap_start = 0;
        state.snap_end = 0;

        let mut file = DocFile::open(self.ops_dyn(), self.data_path(partition, new_rev), true)
            .map_err(EngineError::from)?;
        file.save_local(VBSTATE_DOC, Some(&state.encode()));
        file.commit().map_err(EngineError::from)?;

        let cache = &self.caches[partition as usize];
        *cache.state.write() = Some(state);
        cache.refresh_from(&file);
        let _ = file.close();

        self.queue_deletion(old_path);
        Ok(())
    }

    // Partition deletion

    /// Drop the in-memory figures for a partition about to be deleted and
    /// return the file revision that must be unlinked.
    pub fn prepare_to_delete(&self, partition: u16) -> Result<u64> {
        self.check_partition(partition)?;
        self.caches[partition as usize].clear();
        Ok(self.rev_map.get(partition))
    }

    /// Schedule the partition file at `revision` for deletion and move the
    /// partition to a fresh revision. The unlink happens in a later
    /// [`PersistenceEngine::pending_tasks`] pass, once readers have dropped
    /// their handles.
    pub fn del_partition(&self, partition: u16, revision: u64) -> Result<()> {
        if self.read_only {
            return Err(EngineError::NotPermitted);
        }
        self.check_partition(partition)?;
        self.queue_deletion(self.data_path(partition, revision));
        self.rev_map.bump(partition);
        self.caches[partition as usize].clear();
        Ok(())
    }

    /// Bump the partition's file revision.
    pub fn increment_revision(&self, partition: u16) -> Result<u64> {
        self.check_partition(partition)?;
        Ok(self.rev_map.bump(partition))
    }

    /// Drain the deferred-unlink queue.
    pub fn pending_tasks(&self) {
        while let Ok(path) = self.pending_deletions.1.try_recv() {
            match std::fs::remove_file(&path) {
                Ok(()) => debug!(path = %path.display(), "unlinked stale file"),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => warn!(path = %path.display(), error = %e, "failed to unlink stale file"),
            }
        }
    }

    fn queue_deletion(&self, path: PathBuf) {
        let _ = self.pending_deletions.0.send(path);
    }

    // Point reads

    /// Fetch the document stored under `key`. Tombstones are only returned
    /// when `fetch_delete` is set; otherwise they read as missing.
    pub fn get(&self, key: &DocKey, partition: u16, fetch_delete: bool) -> Result<GetValue> {
        self.check_partition(partition)?;
        let file = self.open_partition(partition, false).map_err(|e| {
            self.counters.num_get_failure.fetch_add(1, Ordering::Relaxed);
            e
        })?;

        let result = self.get_checked(&file, key, partition, fetch_delete);
        let _ = file.close();
        if result.is_err() {
            self.counters.num_get_failure.fetch_add(1, Ordering::Relaxed);
        }
        result
    }

    fn get_checked(
        &self,
        file: &DocFile,
        key: &DocKey,
        partition: u16,
        fetch_delete: bool,
    ) -> Result<GetValue> {
        if key.namespace() == KeyNamespace::Collections {
            // The writer trusts its cache; the read-only sibling consults
            // the manifest persisted in the file it just opened.
            let allowed = if self.read_only {
                file.open_local(MANIFEST_DOC)
                    .and_then(|b| Manifest::decode(&b).ok())
                    .unwrap_or_default()
                    .collection_of(key)
                    .is_some()
            } else {
                self.caches[partition as usize]
                    .manifest
                    .read()
                    .collection_of(key)
                    .is_some()
            };
            if !allowed {
                return Err(EngineError::UnknownCollection);
            }
        }
        self.get_with_header(file, key, partition, fetch_delete, false)
    }

    /// Point get against an already-open file handle.
    pub fn get_with_header(
        &self,
        file: &DocFile,
        key: &DocKey,
        partition: u16,
        fetch_delete: bool,
        meta_only: bool,
    ) -> Result<GetValue> {
        let info = file.docinfo_by_id(key).ok_or(EngineError::KeyMissing)?;
        self.fetch_doc(file, &info, partition, fetch_delete, meta_only)
    }

    fn fetch_doc(
        &self,
        file: &DocFile,
        info: &DocInfo,
        partition: u16,
        fetch_delete: bool,
        meta_only: bool,
    ) -> Result<GetValue> {
        let meta = DocMeta::decode(&info.rev_meta).map_err(|e| {
            warn!(partition, key = %info.key, error = e.as_str(), "unreadable document metadata");
            EngineError::from(e)
        })?;

        if info.deleted && !fetch_delete {
            return Err(EngineError::KeyMissing);
        }

        let value = if meta_only || !info.has_body() {
            None
        } else {
            Some(file.open_doc_with_docinfo(info, true).map_err(|e| {
                warn!(partition, key = %info.key, error = e.as_str(), "failed to read document");
                EngineError::from(e)
            })?)
        };

        self.counters.io_num_read.fetch_add(1, Ordering::Relaxed);
        let bytes = info.key.len() + value.as_ref().map_or(0, |v| v.len());
        self.counters.io_read_bytes.fetch_add(bytes as u64, Ordering::Relaxed);

        let mut item = Item::new(info.key.clone(), partition, meta.flags(), meta.exptime(), value);
        item.set_cas(meta.cas());
        item.set_datatype(meta.datatype());
        item.set_by_seqno(info.seqno);
        if info.deleted {
            item.set_operation(Operation::Deletion);
        }
        Ok(GetValue::new(item))
    }

    /// Batch fetch. Each entry's `result` is filled in place; deleted
    /// documents are returned (callers asked for them by key). One
    /// underlying read error fails every still-unfetched entry.
    pub fn get_multi(&self, partition: u16, fetches: &mut [BgFetch]) -> Result<()> {
        self.check_partition(partition)?;
        let file = match self.open_partition(partition, false) {
            Ok(file) => file,
            Err(e) => {
                let unfetched = fetches.iter().filter(|f| f.result.is_none()).count();
                self.counters
                    .num_get_failure
                    .fetch_add(unfetched as u64, Ordering::Relaxed);
                for fetch in fetches.iter_mut().filter(|f| f.result.is_none()) {
                    fetch.result = Some(Err(e));
                }
                return Err(e);
            }
        };

        for idx in 0..fetches.len() {
            let fetch_result = match file.docinfo_by_id(&fetches[idx].key) {
                None => Err(EngineError::KeyMissing),
                Some(info) => self.fetch_doc(&file, &info, partition, true, fetches[idx].meta_only),
            };

            match fetch_result {
                Err(e) if is_read_failure(&e) => {
                    let unfetched = fetches[idx..].iter().filter(|f| f.result.is_none()).count();
                    warn!(
                        partition,
                        error = e.kind(),
                        unfetched,
                        "multi-get aborted by read error"
                    );
                    self.counters
                        .num_get_failure
                        .fetch_add(unfetched as u64, Ordering::Relaxed);
                    for fetch in fetches[idx..].iter_mut().filter(|f| f.result.is_none()) {
                        fetch.result = Some(Err(e));
                    }
                    break;
                }
                Err(e) => {
                    self.counters.num_get_failure.fetch_add(1, Ordering::Relaxed);
                    fetches[idx].result = Some(Err(e));
                }
                Ok(value) => fetches[idx].result = Some(Ok(value)),
            }
        }

        let _ = file.close();
        Ok(())
    }

    // Counts and file info

    /// Total live documents in the partition. The writer serves this from
    /// the counter its commits maintain; the read-only sibling recomputes
    /// from the file.
    pub fn item_count(&self, partition: u16) -> Result<u64> {
        self.check_partition(partition)?;
        if !self.read_only {
            return Ok(self.caches[partition as usize].doc_count.load(Ordering::Relaxed));
        }
        let file = self.open_partition(partition, false)?;
        let count = file.doc_count();
        let _ = file.close();
        Ok(count)
    }

    /// Live documents with seqnos in `[min_seq, max_seq]`. Failures carry
    /// the underlying store code; callers rely on that distinguishability.
    pub fn num_items(&self, partition: u16, min_seq: u64, max_seq: u64) -> Result<u64> {
        self.check_partition(partition)?;
        let file = self.open_partition(partition, false)?;
        let result = file.changes_count(min_seq, max_seq).map_err(|e| {
            warn!(partition, error = e.as_str(), "changes_count failed");
            EngineError::from(e)
        });
        let _ = file.close();
        result
    }

    /// Persisted tombstones in the partition, cached after first read.
    pub fn num_persisted_deletes(&self, partition: u16) -> Result<u64> {
        self.check_partition(partition)?;
        let cached = self.caches[partition as usize].delete_count.load(Ordering::Relaxed);
        if cached != DELETE_COUNT_UNKNOWN {
            return Ok(cached);
        }
        let file = self.open_partition(partition, false)?;
        let count = file.deleted_count();
        self.caches[partition as usize].delete_count.store(count, Ordering::Relaxed);
        let _ = file.close();
        Ok(count)
    }

    /// Size figures of the partition file; a partition with no file yet
    /// reports missing.
    pub fn file_info(&self, partition: u16) -> Result<FileInfo> {
        self.check_partition(partition)?;
        let file = match self.open_partition(partition, false) {
            Ok(file) => file,
            Err(EngineError::TmpFail(StoreError::OpenFile)) => return Err(EngineError::KeyMissing),
            Err(e) => return Err(e),
        };
        let info = FileInfo {
            file_size: file.file_size(),
            space_used: file.space_used(),
        };
        let _ = file.close();
        Ok(info)
    }

    /// Aggregate size figures across every partition, from the cached
    /// counters.
    pub fn aggregate_file_info(&self) -> FileInfo {
        let mut total = FileInfo::default();
        for cache in &self.caches {
            total.file_size += cache.file_size.load(Ordering::Relaxed);
            total.space_used += cache.space_used.load(Ordering::Relaxed);
        }
        total
    }

    // All-keys enumeration

    /// Stream up to `count` live keys at or after `start_key`, in key
    /// order.
    pub fn get_all_keys(
        &self,
        partition: u16,
        start_key: &DocKey,
        count: u32,
        cb: &mut dyn FnMut(&DocKey),
    ) -> Result<()> {
        self.check_partition(partition)?;
        if count == 0 {
            return Ok(());
        }
        let file = self.open_partition(partition, false)?;
        let mut remaining = count;
        let walk = file.all_docs(Some(start_key), |info| {
            if info.deleted {
                return Ok(Control::Continue);
            }
            cb(&info.key);
            remaining -= 1;
            Ok(if remaining == 0 { Control::Stop } else { Control::Continue })
        });
        let _ = file.close();
        walk.map_err(EngineError::from)
    }

    // Range scans

    /// Open a scan over the partition's current snapshot. The file handle
    /// is pinned in the scan registry until [`PersistenceEngine::destroy_scan`].
    pub fn init_scan(
        &self,
        value_cb: ScanValueCallback,
        cache_cb: CacheLookupCallback,
        partition: u16,
        start_seqno: u64,
        doc_filter: DocumentFilter,
        value_filter: ValueFilter,
    ) -> Result<ScanContext> {
        self.check_partition(partition)?;
        let file = self.open_partition(partition, false)?;
        let max_seqno = file.update_seq();
        let documents = file
            .changes_count(start_seqno, max_seqno)
            .map_err(EngineError::from)?;

        let id = self.scan_counter.fetch_add(1, Ordering::Relaxed) + 1;
        self.scans.lock().insert(
            id,
            Arc::new(ScanHandle {
                file,
                cancelled: AtomicBool::new(false),
            }),
        );

        Ok(ScanContext {
            id,
            partition,
            start_seqno,
            max_seqno,
            documents,
            last_read_seqno: 0,
            doc_filter,
            value_filter,
            value_cb,
            cache_cb,
        })
    }

    /// Drive the scan forward. Resumes after the last delivered seqno, so a
    /// `Yield` from the value callback maps to `Again` here and the next
    /// call continues where this one stopped.
    pub fn scan(&self, ctx: &mut ScanContext) -> ScanStatus {
        let handle = match self.scans.lock().get(&ctx.id) {
            Some(handle) => Arc::clone(handle),
            None => return ScanStatus::Failed,
        };

        let start = if ctx.last_read_seqno == 0 {
            ctx.start_seqno
        } else {
            ctx.last_read_seqno + 1
        };

        let mut status = ScanStatus::Success;
        let walk = handle.file.changes_since(start, |info| {
            if handle.cancelled.load(Ordering::Relaxed) {
                status = ScanStatus::Failed;
                return Ok(Control::Stop);
            }
            if ctx.doc_filter == DocumentFilter::NoDeletes && info.deleted {
                ctx.last_read_seqno = info.seqno;
                return Ok(Control::Continue);
            }

            let lookup = CacheLookup {
                key: info.key.clone(),
                seqno: info.seqno,
                partition: ctx.partition,
            };
            if (ctx.cache_cb)(&lookup) == CacheStatus::Skip {
                ctx.last_read_seqno = info.seqno;
                return Ok(Control::Continue);
            }

            let value = self.scan_fetch(&handle.file, info, ctx.partition, ctx.value_filter)?;
            ctx.last_read_seqno = info.seqno;
            match (ctx.value_cb)(value) {
                ScanFlow::Continue => Ok(Control::Continue),
                ScanFlow::Yield => {
                    status = ScanStatus::Again;
                    Ok(Control::Stop)
                }
            }
        });

        match walk {
            Ok(()) => status,
            Err(e) => {
                warn!(partition = ctx.partition, error = e.as_str(), "scan failed");
                ScanStatus::Failed
            }
        }
    }

    fn scan_fetch(
        &self,
        file: &DocFile,
        info: &DocInfo,
        partition: u16,
        value_filter: ValueFilter,
    ) -> vellumdb_common::StoreResult<GetValue> {
        let meta = DocMeta::decode(&info.rev_meta)?;

        let (value, datatype) = match value_filter {
            ValueFilter::KeysOnly | ValueFilter::MetaOnly => (None, meta.datatype()),
            ValueFilter::ValuesCompressed if info.has_body() => {
                let stored = file.open_doc_with_docinfo(info, false)?;
                let datatype = if info.content_meta & CONTENT_COMPRESSED != 0 {
                    meta.datatype() | DATATYPE_COMPRESSED
                } else {
                    meta.datatype()
                };
                (Some(stored), datatype)
            }
            ValueFilter::ValuesDecompressed if info.has_body() => {
                let body = file.open_doc_with_docinfo(info, true)?;
                (Some(body), meta.datatype() & !DATATYPE_COMPRESSED)
            }
            _ => (None, meta.datatype()),
        };

        let mut item = Item::new(info.key.clone(), partition, meta.flags(), meta.exptime(), value);
        item.set_cas(meta.cas());
        item.set_datatype(datatype);
        item.set_by_seqno(info.seqno);
        if info.deleted {
            item.set_operation(Operation::Deletion);
        }
        Ok(GetValue::new(item))
    }

    /// Tear down a scan: flags in-flight batches to stop and unpins the
    /// file handle (closed when the last reference drops).
    pub fn destroy_scan(&self, id: u64) {
        if let Some(handle) = self.scans.lock().remove(&id) {
            handle.cancelled.store(true, Ordering::Relaxed);
        }
    }

    // Rollback

    /// Roll the partition back to the newest header at or below
    /// `target_seqno`. Every document changed after the target is reported
    /// through `cb` with its rewound value (`None` when the key did not
    /// exist there) so the caller can un-apply in-memory state. The rewound
    /// header is republished with a fresh state snapshot.
    pub fn rollback(
        &self,
        partition: u16,
        target_seqno: u64,
        cb: &mut dyn FnMut(&DocKey, Option<Item>),
    ) -> Result<RollbackResult> {
        if self.read_only {
            return Err(EngineError::NotPermitted);
        }
        self.check_partition(partition)?;

        let latest = self.open_partition(partition, false)?;
        let mut rewound = self.open_partition(partition, false)?;

        while rewound.update_seq() > target_seqno {
            match rewound.rewind_header() {
                Ok(()) => {}
                Err(StoreError::NoHeader) => {
                    let _ = latest.close();
                    let _ = rewound.close();
                    return Err(EngineError::RollbackToZero);
                }
                Err(StoreError::AllocFail) => {
                    // Fatal rather than retried, to rule out endless
                    // rewinding under memory pressure.
                    let _ = latest.close();
                    let _ = rewound.close();
                    return Err(EngineError::Fatal(StoreError::AllocFail));
                }
                Err(e) => {
                    warn!(partition, error = e.as_str(), "rollback aborted");
                    let _ = latest.close();
                    let _ = rewound.close();
                    return Err(e.into());
                }
            }
        }
        let rollback_seqno = rewound.update_seq();

        let mut changed: Vec<DocInfo> = Vec::new();
        latest
            .changes_since(target_seqno + 1, |info| {
                changed.push(info.clone());
                Ok(Control::Continue)
            })
            .map_err(EngineError::from)?;
        let _ = latest.close();

        for info in &changed {
            match rewound.docinfo_by_id(&info.key) {
                Some(old) => {
                    let value = self.fetch_doc(&rewound, &old, partition, true, false).map_err(
                        |e| {
                            warn!(partition, error = e.kind(), "rollback read failed");
                            e
                        },
                    )?;
                    cb(&info.key, Some(value.item));
                }
                None => cb(&info.key, None),
            }
        }

        let mut state = self.caches[partition as usize]
            .state
            .read()
            .clone()
            .unwrap_or_else(|| PartitionState::new(Membership::Active));
        state.high_seqno = rollback_seqno;
        state.purge_seqno = rewound.purge_seq();
        state.snap_start = rollback_seqno;
        state.snap_end = rollback_seqno;
        rewound.save_local(VBSTATE_DOC, Some(&state.encode()));
        rewound.commit().map_err(EngineError::from)?;

        let cache = &self.caches[partition as usize];
        *cache.state.write() = Some(state.clone());
        cache.refresh_from(&rewound);
        let _ = rewound.close();

        Ok(RollbackResult {
            rollback_seqno,
            state,
        })
    }

    // Compaction

    /// Compact the partition into a sibling file at the next revision,
    /// expiring documents and purging tombstones per `ctx`, then atomically
    /// swap it in. Failures leave the source file authoritative and report
    /// `false`.
    pub fn compact(&self, ctx: &mut CompactionContext) -> Result<bool> {
        if self.read_only {
            return Err(EngineError::NotPermitted);
        }
        let partition = ctx.partition;
        self.check_partition(partition)?;

        let rev = self.rev_map.get(partition);
        let new_rev = rev + 1;
        let compaction_ops: Arc<dyn FileOps> = Arc::clone(&self.compaction_ops) as Arc<dyn FileOps>;

        let source = match DocFile::open(
            Arc::clone(&compaction_ops),
            self.data_path(partition, rev),
            false,
        ) {
            Ok(file) => file,
            Err(e) => {
                warn!(partition, revision = rev, error = e.as_str(), "compaction cannot open source");
                return Ok(false);
            }
        };

        let compact_path = self.compact_path(partition, new_rev);
        // A product left behind by an earlier failed attempt.
        let _ = std::fs::remove_file(&compact_path);

        let mut max_purged = 0u64;
        let compacted = source.compact_to(&compact_path, compaction_ops, |info| {
            let meta = DocMeta::decode(&info.rev_meta)?;
            if !info.deleted && meta.exptime() != 0 && meta.exptime() <= ctx.curr_time {
                if let Some(expiry) = ctx.expiry_cb.as_mut() {
                    expiry(&info.key, info.seqno);
                }
                return Ok(CompactDecision::Drop);
            }
            if info.deleted && (ctx.drop_deletes || info.seqno < ctx.purge_before_seq) {
                max_purged = max_purged.max(info.seqno);
                return Ok(CompactDecision::Drop);
            }
            if let Some(bloom) = ctx.bloom_cb.as_mut() {
                bloom(&info.key, info.deleted);
            }
            Ok(CompactDecision::Keep)
        });

        let mut target = match compacted {
            Ok(target) => target,
            Err(e) => {
                warn!(partition, error = e.as_str(), "compaction failed");
                let _ = source.close();
                let _ = std::fs::remove_file(&compact_path);
                return Ok(false);
            }
        };

        target.set_purge_seq(target.purge_seq().max(max_purged));
        if let Err(e) = target.commit() {
            warn!(partition, error = e.as_str(), "compaction commit failed");
            let _ = target.close();
            let _ = source.close();
            let _ = std::fs::remove_file(&compact_path);
            return Ok(false);
        }

        let purge_seq = target.purge_seq();
        let cache = &self.caches[partition as usize];
        cache.refresh_from(&target);
        let _ = target.close();
        let _ = source.close();

        let final_path = self.data_path(partition, new_rev);
        if let Err(e) = std::fs::rename(&compact_path, &final_path) {
            warn!(partition, error = %e, "failed to swap in compacted file");
            let _ = std::fs::remove_file(&compact_path);
            return Ok(false);
        }

        self.rev_map.set(partition, new_rev);
        self.queue_deletion(self.data_path(partition, rev));

        if let Some(state) = cache.state.write().as_mut() {
            state.purge_seqno = purge_seq;
        }

        info!(partition, revision = new_rev, "compaction swapped in new revision");
        Ok(true)
    }

    // Collections manifest

    /// Full open/write/commit update of the manifest local document from a
    /// system-event item.
    pub fn persist_manifest_item(&self, partition: u16, item: &Item) -> Result<bool> {
        if self.read_only {
            return Err(EngineError::NotPermitted);
        }
        self.check_partition(partition)?;
        let json = item
            .value()
            .ok_or(EngineError::Fatal(StoreError::InvalidArguments))?;

        let mut file = self.open_partition(partition, true)?;
        file.save_local(MANIFEST_DOC, Some(json));
        file.commit().map_err(|e| {
            warn!(partition, error = e.as_str(), "failed to persist collections manifest");
            EngineError::from(e)
        })?;
        let _ = file.close();

        match Manifest::decode(json) {
            Ok(manifest) => *self.caches[partition as usize].manifest.write() = manifest,
            Err(e) => warn!(partition, error = e.as_str(), "persisted manifest does not decode"),
        }
        Ok(true)
    }

    /// The persisted manifest JSON, empty if the partition has none.
    pub fn read_manifest(&self, partition: u16) -> Result<Vec<u8>> {
        self.check_partition(partition)?;
        let file = self.open_partition(partition, false)?;
        let manifest = file.open_local(MANIFEST_DOC).unwrap_or_default();
        let _ = file.close();
        Ok(manifest)
    }

    // Stats

    /// Engine counters keyed by `<prefix>:<name>`.
    pub fn stats(&self) -> BTreeMap<String, String> {
        let ops = self.ops.stats();
        let comp = self.compaction_ops.stats();
        let mut out = BTreeMap::new();
        for (name, value) in [
            ("io_num_read", self.counters.io_num_read.load(Ordering::Relaxed)),
            ("io_num_write", self.counters.io_num_write.load(Ordering::Relaxed)),
            ("io_read_bytes", self.counters.io_read_bytes.load(Ordering::Relaxed)),
            ("io_write_bytes", self.counters.io_write_bytes.load(Ordering::Relaxed)),
            ("num_get_failure", self.counters.num_get_failure.load(Ordering::Relaxed)),
            ("io_total_read_bytes", ops.bytes_read.load(Ordering::Relaxed)),
            ("io_total_write_bytes", ops.bytes_written.load(Ordering::Relaxed)),
            ("io_num_fsync", ops.num_syncs.load(Ordering::Relaxed)),
            ("io_compaction_read_bytes", comp.bytes_read.load(Ordering::Relaxed)),
            ("io_compaction_write_bytes", comp.bytes_written.load(Ordering::Relaxed)),
            ("io_compaction_num_fsync", comp.num_syncs.load(Ordering::Relaxed)),
        ] {
            out.insert(format!("{}:{}", self.config.stat_prefix, name), value.to_string());
        }
        out
    }

    /// Byte-level counters for normal traffic, including the read-seek
    /// histogram.
    pub fn file_stats(&self) -> &FileStats {
        self.ops.stats()
    }

    /// Byte-level counters for compaction traffic.
    pub fn compaction_file_stats(&self) -> &FileStats {
        self.compaction_ops.stats()
    }

    /// Atomically replace the persisted stats sidecar (`stats.json`).
    pub fn snapshot_stats(&self, stats: &BTreeMap<String, String>) -> bool {
        let tmp = self.config.dir.join("stats.json.new");
        let dest = self.config.dir.join("stats.json");
        let bytes = match serde_json::to_vec(stats) {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(error = %e, "failed to serialize stats snapshot");
                return false;
            }
        };
        if let Err(e) = std::fs::write(&tmp, bytes).and_then(|_| std::fs::rename(&tmp, &dest)) {
            warn!(error = %e, "failed to persist stats snapshot");
            return false;
        }
        true
    }

    /// Read back the persisted stats sidecar; empty if none exists.
    pub fn persisted_stats(&self) -> Result<BTreeMap<String, String>> {
        let path = self.config.dir.join("stats.json");
        let bytes = match std::fs::read(&path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(BTreeMap::new()),
            Err(_) => return Err(EngineError::TmpFail(StoreError::Read)),
        };
        serde_json::from_slice(&bytes).map_err(|_| EngineError::Corrupt(StoreError::Corrupt))
    }

    // File management

    fn data_path(&self, partition: u16, revision: u64) -> PathBuf {
        self.config.dir.join(format!("{partition}.{revision}"))
    }

    fn compact_path(&self, partition: u16, revision: u64) -> PathBuf {
        self.config.dir.join(format!("{partition}.{revision}.compact"))
    }

    fn ops_dyn(&self) -> Arc<dyn FileOps> {
        Arc::clone(&self.ops) as Arc<dyn FileOps>
    }

    fn check_partition(&self, partition: u16) -> Result<()> {
        if (partition as usize) < self.caches.len() {
            Ok(())
        } else {
            Err(EngineError::Fatal(StoreError::InvalidArguments))
        }
    }

    /// Open the partition's current data file, retrying with a refreshed
    /// revision when the file was unlinked under us (compaction swap) or
    /// the open failed transiently.
    fn open_partition(&self, partition: u16, create: bool) -> Result<DocFile> {
        let mut rev = self.rev_map.get(partition);
        let mut attempt = 0u32;
        loop {
            match DocFile::open(self.ops_dyn(), self.data_path(partition, rev), create) {
                Ok(file) => {
                    if attempt > 0 {
                        info!(partition, revision = rev, "partition file opened after retry");
                    }
                    return Ok(file);
                }
                Err(StoreError::OpenFile) if attempt < self.config.open_retry_limit => {
                    attempt += 1;
                    match self.check_new_rev(partition) {
                        Some(found) if found != rev => {
                            self.rev_map.set(partition, found);
                            rev = found;
                        }
                        Some(_) => {} // same revision; retry the transient failure
                        None if create => {
                            rev = self.rev_map.bump(partition);
                        }
                        None => {}
                    }
                    debug!(partition, revision = rev, attempt, "retrying partition file open");
                }
                Err(e) => {
                    warn!(partition, revision = rev, error = e.as_str(), "cannot open partition file");
                    return Err(e.into());
                }
            }
        }
    }

    /// Ask the filesystem which revision of the partition is newest,
    /// queueing any stale lower revisions for deletion.
    fn check_new_rev(&self, partition: u16) -> Option<u64> {
        let entries = std::fs::read_dir(&self.config.dir).ok()?;
        let mut revisions: Vec<u64> = Vec::new();
        for entry in entries.flatten() {
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if let Some((vb, rev)) = parse_file_name(&name) {
                if vb == partition {
                    revisions.push(rev);
                }
            }
        }
        let newest = revisions.iter().copied().max()?;
        for rev in revisions {
            if rev < newest {
                self.queue_deletion(self.data_path(partition, rev));
            }
        }
        Some(newest)
    }
}

fn is_read_failure(err: &EngineError) -> bool {
    matches!(
        err,
        EngineError::TmpFail(StoreError::Read) | EngineError::Corrupt(StoreError::Checksum)
    )
}

/// Parse `<partition>.<revision>` data file names.
fn parse_file_name(name: &str) -> Option<(u16, u64)> {
    let (vb, rev) = name.split_once('.')?;
    Some((vb.parse().ok()?, rev.parse().ok()?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;
    use tempfile::tempdir;

    fn engine(dir: &Path) -> PersistenceEngine {
        PersistenceEngine::open(EngineConfig::new(dir, 4)).unwrap()
    }

    fn doc_key(s: &str) -> DocKey {
        DocKey::new(KeyNamespace::Default, s.as_bytes().to_vec())
    }

    #[test]
    fn file_names_parse() {
        assert_eq!(parse_file_name("0.1"), Some((0, 1)));
        assert_eq!(parse_file_name("512.37"), Some((512, 37)));
        assert_eq!(parse_file_name("stats.json"), None);
        assert_eq!(parse_file_name("3.2.compact"), None);
        assert_eq!(parse_file_name("junk"), None);
    }

    #[test]
    fn mutations_require_a_transaction() {
        let dir = tempdir().unwrap();
        let kv = engine(dir.path());
        let item = Item::new(doc_key("k"), 0, 0, 0, Some(b"v".to_vec()));
        assert_eq!(
            kv.set(item, None),
            Err(EngineError::Fatal(StoreError::InvalidArguments))
        );
    }

    #[test]
    fn read_only_sibling_rejects_mutation_paths() {
        let dir = tempdir().unwrap();
        let rw = engine(dir.path());
        let ro = rw.make_read_only();
        assert!(ro.is_read_only());

        let item = Item::new(doc_key("k"), 0, 0, 0, Some(b"v".to_vec()));
        assert_eq!(ro.begin(), Err(EngineError::NotPermitted));
        assert_eq!(ro.set(item.clone(), None), Err(EngineError::NotPermitted));
        assert_eq!(ro.delete(item, None), Err(EngineError::NotPermitted));
        assert_eq!(ro.commit(None), Err(EngineError::NotPermitted));
        assert_eq!(ro.rollback_txn(), Err(EngineError::NotPermitted));
        assert_eq!(ro.reset(0), Err(EngineError::NotPermitted));
        assert_eq!(ro.del_partition(0, 1), Err(EngineError::NotPermitted));
        assert!(matches!(
            ro.rollback(0, 0, &mut |_, _| {}),
            Err(EngineError::NotPermitted)
        ));
        assert_eq!(
            ro.compact(&mut CompactionContext::new(0)),
            Err(EngineError::NotPermitted)
        );
        let event = crate::collections::make_system_event_item(
            crate::collections::SystemEvent::CreateCollection,
            "c",
            0,
            b"{}".to_vec(),
        );
        assert_eq!(ro.persist_manifest_item(0, &event), Err(EngineError::NotPermitted));
    }

    #[test]
    fn commit_without_pending_work_is_idempotent() {
        let dir = tempdir().unwrap();
        let kv = engine(dir.path());
        assert!(kv.commit(None).is_ok());
        kv.begin().unwrap();
        assert!(kv.commit(None).is_ok());
        assert!(kv.commit(None).is_ok());
    }

    #[test]
    fn rollback_txn_discards_pending_requests() {
        let dir = tempdir().unwrap();
        let kv = engine(dir.path());
        kv.begin().unwrap();
        kv.set(Item::new(doc_key("gone"), 0, 0, 0, Some(b"v".to_vec())), None)
            .unwrap();
        kv.rollback_txn().unwrap();

        kv.begin().unwrap();
        kv.set(Item::new(doc_key("kept"), 0, 0, 0, Some(b"v".to_vec())), None)
            .unwrap();
        kv.commit(None).unwrap();

        assert!(kv.get(&doc_key("kept"), 0, false).is_ok());
        assert!(matches!(
            kv.get(&doc_key("gone"), 0, false),
            Err(EngineError::KeyMissing)
        ));
    }

    #[test]
    fn pending_tasks_unlinks_queued_files() {
        let dir = tempdir().unwrap();
        let kv = engine(dir.path());
        let stale = dir.path().join("0.1");
        std::fs::write(&stale, b"x").unwrap();

        kv.queue_deletion(stale.clone());
        assert!(stale.exists());
        kv.pending_tasks();
        assert!(!stale.exists());
    }

    #[test]
    fn partition_ids_are_bounds_checked() {
        let dir = tempdir().unwrap();
        let kv = engine(dir.path());
        assert_eq!(
            kv.item_count(99),
            Err(EngineError::Fatal(StoreError::InvalidArguments))
        );
    }

    #[test]
    fn stats_are_prefixed() {
        let dir = tempdir().unwrap();
        let kv = engine(dir.path());
        let stats = kv.stats();
        assert!(stats.contains_key("rw_0:io_num_write"));
        assert!(stats.contains_key("rw_0:io_total_write_bytes"));
        assert!(stats.contains_key("rw_0:io_compaction_write_bytes"));

        let ro = kv.make_read_only();
        assert!(ro.stats().contains_key("ro_0:io_num_read"));
    }

    #[test]
    fn stats_snapshot_round_trips() {
        let dir = tempdir().unwrap();
        let kv = engine(dir.path());
        let mut stats = BTreeMap::new();
        stats.insert("ep_failover".to_string(), "none".to_string());
        assert!(kv.snapshot_stats(&stats));
        assert_eq!(kv.persisted_stats().unwrap(), stats);
        assert!(!dir.path().join("stats.json.new").exists());
    }

    #[test]
    fn file_info_reports_missing_for_absent_partition() {
        let dir = tempdir().unwrap();
        let kv = engine(dir.path());
        assert_eq!(kv.file_info(2), Err(EngineError::KeyMissing));
    }
}
