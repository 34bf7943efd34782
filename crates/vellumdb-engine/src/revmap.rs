//! Per-partition file revision counters.

use std::sync::atomic::{AtomicU64, Ordering};

/// Monotonic file revision per partition.
///
/// The read/write engine owns the map; its read-only sibling shares it by
/// `Arc` and must never mutate it. The size is fixed at construction;
/// resizing at runtime is not supported. Read-modify-write is serialised per
/// partition by the single-writer discipline, so `Relaxed` suffices for the
/// counter itself.
#[derive(Debug)]
pub struct FileRevMap {
    revs: Vec<AtomicU64>,
}

impl FileRevMap {
    /// Create a map for `partitions` partitions, all at revision 1.
    pub fn new(partitions: u16) -> Self {
        let revs = (0..partitions).map(|_| AtomicU64::new(1)).collect();
        Self { revs }
    }

    pub fn len(&self) -> usize {
        self.revs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.revs.is_empty()
    }

    /// Current revision of `partition`.
    ///
    /// Panics if `partition` is outside the range fixed at construction.
    pub fn get(&self, partition: u16) -> u64 {
        self.revs[partition as usize].load(Ordering::Relaxed)
    }

    /// Increment and return the new revision.
    pub fn bump(&self, partition: u16) -> u64 {
        self.revs[partition as usize].fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Overwrite the revision, used when a directory scan discovers the
    /// filesystem disagrees with the in-memory value.
    pub fn set(&self, partition: u16, revision: u64) {
        self.revs[partition as usize].store(revision, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starts_at_one() {
        let map = FileRevMap::new(4);
        assert_eq!(map.len(), 4);
        for vb in 0..4 {
            assert_eq!(map.get(vb), 1);
        }
    }

    #[test]
    fn bump_returns_the_new_value() {
        let map = FileRevMap::new(1);
        assert_eq!(map.bump(0), 2);
        assert_eq!(map.bump(0), 3);
        assert_eq!(map.get(0), 3);
    }

    #[test]
    fn set_overwrites() {
        let map = FileRevMap::new(2);
        map.set(1, 17);
        assert_eq!(map.get(1), 17);
        assert_eq!(map.get(0), 1);
    }
}
