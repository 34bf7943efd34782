//! File operations seam and the byte-counting tap wrapped around it.
//!
//! The document store performs all I/O through the [`FileOps`] trait. The
//! engine wires a [`StatsTap`] in front of the base implementation so every
//! byte read or written is accounted for, with separate taps for normal
//! traffic and compaction. The trait is also the seam the error-injection
//! tests use to simulate filesystem failures.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use vellumdb_common::{StoreError, StoreResult};

// File handles

/// An open file, usable from any thread; each positioned operation seeks
/// under the handle lock.
pub struct FileHandle {
    file: Mutex<Option<File>>,
}

impl FileHandle {
    fn new(file: File) -> Self {
        Self {
            file: Mutex::new(Some(file)),
        }
    }
}

impl std::fmt::Debug for FileHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileHandle").finish_non_exhaustive()
    }
}

// The file-ops interface

/// Positioned file I/O as required by the document store.
pub trait FileOps: Send + Sync {
    /// Open (or create) the file at `path`.
    fn open(&self, path: &Path, create: bool) -> StoreResult<FileHandle>;

    /// Read up to `buf.len()` bytes at `offset`; returns the bytes read,
    /// which is short only at end of file.
    fn pread(&self, handle: &FileHandle, buf: &mut [u8], offset: u64) -> StoreResult<usize>;

    /// Write all of `data` at `offset`.
    fn pwrite(&self, handle: &FileHandle, data: &[u8], offset: u64) -> StoreResult<usize>;

    /// Flush file content and metadata to stable storage.
    fn sync(&self, handle: &FileHandle) -> StoreResult<()>;

    /// Current end-of-file offset.
    fn goto_eof(&self, handle: &FileHandle) -> StoreResult<u64>;

    /// Close the handle; later operations on it fail.
    fn close(&self, handle: &FileHandle) -> StoreResult<()>;
}

// Base implementation over std::fs

/// Plain `std::fs` implementation of [`FileOps`].
#[derive(Debug, Default, Clone, Copy)]
pub struct BaseFileOps;

impl FileOps for BaseFileOps {
    fn open(&self, path: &Path, create: bool) -> StoreResult<FileHandle> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(create)
            .truncate(false)
            .open(path)
            .map_err(|_| StoreError::OpenFile)?;
        Ok(FileHandle::new(file))
    }

    fn pread(&self, handle: &FileHandle, buf: &mut [u8], offset: u64) -> StoreResult<usize> {
        let mut guard = handle.file.lock();
        let file = guard.as_mut().ok_or(StoreError::Read)?;
        file.seek(SeekFrom::Start(offset)).map_err(|_| StoreError::Read)?;

        let mut total = 0;
        while total < buf.len() {
            match file.read(&mut buf[total..]) {
                Ok(0) => break,
                Ok(n) => total += n,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(_) => return Err(StoreError::Read),
            }
        }
        Ok(total)
    }

    fn pwrite(&self, handle: &FileHandle, data: &[u8], offset: u64) -> StoreResult<usize> {
        let mut guard = handle.file.lock();
        let file = guard.as_mut().ok_or(StoreError::Write)?;
        file.seek(SeekFrom::Start(offset)).map_err(|_| StoreError::Write)?;
        file.write_all(data).map_err(|_| StoreError::Write)?;
        Ok(data.len())
    }

    fn sync(&self, handle: &FileHandle) -> StoreResult<()> {
        let guard = handle.file.lock();
        let file = guard.as_ref().ok_or(StoreError::Write)?;
        file.sync_all().map_err(|_| StoreError::Write)
    }

    fn goto_eof(&self, handle: &FileHandle) -> StoreResult<u64> {
        let mut guard = handle.file.lock();
        let file = guard.as_mut().ok_or(StoreError::Read)?;
        file.seek(SeekFrom::End(0)).map_err(|_| StoreError::Read)
    }

    fn close(&self, handle: &FileHandle) -> StoreResult<()> {
        match handle.file.lock().take() {
            Some(file) => {
                drop(file);
                Ok(())
            }
            None => Err(StoreError::FileClose),
        }
    }
}

// Read-seek histogram

const SEEK_BUCKETS: usize = 65;

/// Log-bucketed histogram of the byte gap between successive reads.
///
/// Bucket 0 counts sequential reads (gap 0); bucket `n` counts gaps whose
/// bit width is `n`.
pub struct SeekHistogram {
    buckets: [AtomicU64; SEEK_BUCKETS],
}

impl Default for SeekHistogram {
    fn default() -> Self {
        Self {
            buckets: std::array::from_fn(|_| AtomicU64::new(0)),
        }
    }
}

impl SeekHistogram {
    pub fn record(&self, gap: u64) {
        let idx = if gap == 0 {
            0
        } else {
            (64 - gap.leading_zeros()) as usize
        };
        self.buckets[idx].fetch_add(1, Ordering::Relaxed);
    }

    /// Counts per bucket; index is the bit width of the gap.
    pub fn counts(&self) -> Vec<u64> {
        self.buckets.iter().map(|b| b.load(Ordering::Relaxed)).collect()
    }

    pub fn total(&self) -> u64 {
        self.buckets.iter().map(|b| b.load(Ordering::Relaxed)).sum()
    }
}

impl std::fmt::Debug for SeekHistogram {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SeekHistogram").field("total", &self.total()).finish()
    }
}

// Counter block

/// Counters accumulated by a [`StatsTap`]. Read lock-free by the stats path.
#[derive(Debug, Default)]
pub struct FileStats {
    pub num_opens: AtomicU64,
    pub num_closes: AtomicU64,
    pub num_reads: AtomicU64,
    pub num_writes: AtomicU64,
    pub num_syncs: AtomicU64,
    pub bytes_read: AtomicU64,
    pub bytes_written: AtomicU64,
    pub read_seeks: SeekHistogram,
    last_read_end: AtomicU64,
}

impl FileStats {
    fn record_read(&self, offset: u64, len: u64) {
        self.num_reads.fetch_add(1, Ordering::Relaxed);
        self.bytes_read.fetch_add(len, Ordering::Relaxed);

        let last_end = self.last_read_end.swap(offset + len, Ordering::Relaxed);
        let gap = offset.abs_diff(last_end);
        self.read_seeks.record(gap);
    }
}

// The tap

/// [`FileOps`] decorator that counts everything flowing through it.
pub struct StatsTap {
    inner: Arc<dyn FileOps>,
    stats: Arc<FileStats>,
}

impl StatsTap {
    pub fn new(inner: Arc<dyn FileOps>) -> Self {
        Self {
            inner,
            stats: Arc::new(FileStats::default()),
        }
    }

    pub fn stats(&self) -> &FileStats {
        &self.stats
    }
}

impl FileOps for StatsTap {
    fn open(&self, path: &Path, create: bool) -> StoreResult<FileHandle> {
        let handle = self.inner.open(path, create)?;
        self.stats.num_opens.fetch_add(1, Ordering::Relaxed);
        Ok(handle)
    }

    fn pread(&self, handle: &FileHandle, buf: &mut [u8], offset: u64) -> StoreResult<usize> {
        let n = self.inner.pread(handle, buf, offset)?;
        self.stats.record_read(offset, n as u64);
        Ok(n)
    }

    fn pwrite(&self, handle: &FileHandle, data: &[u8], offset: u64) -> StoreResult<usize> {
        let n = self.inner.pwrite(handle, data, offset)?;
        self.stats.num_writes.fetch_add(1, Ordering::Relaxed);
        self.stats.bytes_written.fetch_add(n as u64, Ordering::Relaxed);
        Ok(n)
    }

    fn sync(&self, handle: &FileHandle) -> StoreResult<()> {
        self.inner.sync(handle)?;
        self.stats.num_syncs.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn goto_eof(&self, handle: &FileHandle) -> StoreResult<u64> {
        self.inner.goto_eof(handle)
    }

    fn close(&self, handle: &FileHandle) -> StoreResult<()> {
        self.inner.close(handle)?;
        self.stats.num_closes.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn base_ops_read_write_round_trip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("raw.bin");

        let ops = BaseFileOps;
        let fh = ops.open(&path, true).unwrap();
        ops.pwrite(&fh, b"hello world", 0).unwrap();
        ops.sync(&fh).unwrap();

        let mut buf = [0u8; 5];
        let n = ops.pread(&fh, &mut buf, 6).unwrap();
        assert_eq!(n, 5);
        assert_eq!(&buf, b"world");

        assert_eq!(ops.goto_eof(&fh).unwrap(), 11);
        ops.close(&fh).unwrap();
        assert_eq!(ops.close(&fh), Err(StoreError::FileClose));
        assert_eq!(ops.pread(&fh, &mut buf, 0), Err(StoreError::Read));
    }

    #[test]
    fn open_without_create_fails_on_missing_file() {
        let dir = tempdir().unwrap();
        let err = BaseFileOps.open(&dir.path().join("absent"), false).unwrap_err();
        assert_eq!(err, StoreError::OpenFile);
    }

    #[test]
    fn tap_accumulates_counters() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("tapped.bin");

        let tap = StatsTap::new(Arc::new(BaseFileOps));
        let fh = tap.open(&path, true).unwrap();
        tap.pwrite(&fh, &[0u8; 100], 0).unwrap();
        tap.pwrite(&fh, &[0u8; 28], 100).unwrap();
        tap.sync(&fh).unwrap();

        let mut buf = [0u8; 64];
        tap.pread(&fh, &mut buf, 0).unwrap();
        tap.pread(&fh, &mut buf, 64).unwrap();
        tap.close(&fh).unwrap();

        let st = tap.stats();
        assert_eq!(st.num_opens.load(Ordering::Relaxed), 1);
        assert_eq!(st.num_writes.load(Ordering::Relaxed), 2);
        assert_eq!(st.bytes_written.load(Ordering::Relaxed), 128);
        assert_eq!(st.num_reads.load(Ordering::Relaxed), 2);
        assert_eq!(st.bytes_read.load(Ordering::Relaxed), 128);
        assert_eq!(st.num_syncs.load(Ordering::Relaxed), 1);
        assert_eq!(st.num_closes.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn seek_histogram_buckets_by_bit_width() {
        let hist = SeekHistogram::default();
        hist.record(0);
        hist.record(1); // width 1
        hist.record(2); // width 2
        hist.record(3); // width 2
        hist.record(1024); // width 11

        let counts = hist.counts();
        assert_eq!(counts[0], 1);
        assert_eq!(counts[1], 1);
        assert_eq!(counts[2], 2);
        assert_eq!(counts[11], 1);
        assert_eq!(hist.total(), 5);
    }

    #[test]
    fn sequential_reads_land_in_bucket_zero() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("seq.bin");

        let tap = StatsTap::new(Arc::new(BaseFileOps));
        let fh = tap.open(&path, true).unwrap();
        tap.pwrite(&fh, &[7u8; 96], 0).unwrap();

        let mut buf = [0u8; 32];
        tap.pread(&fh, &mut buf, 0).unwrap();
        tap.pread(&fh, &mut buf, 32).unwrap();
        tap.pread(&fh, &mut buf, 64).unwrap();

        // First read seeks from 0 with gap 0, the rest are sequential.
        assert_eq!(tap.stats().read_seeks.counts()[0], 3);
    }
}
