//! Partition state, persisted as the `_local/vbstate` document.

use serde::{Deserialize, Serialize};
use tracing::warn;
use vellumdb_common::{StoreError, StoreResult};

/// Name of the partition-state local document.
pub const VBSTATE_DOC: &str = "_local/vbstate";

/// Name of the collections-manifest local document.
pub const MANIFEST_DOC: &str = "_local/collections_manifest";

/// Cluster membership of a partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Membership {
    Active,
    Replica,
    Pending,
    Dead,
}

/// Snapshot of a partition's durable state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PartitionState {
    pub state: Membership,
    pub checkpoint_id: u64,
    pub max_deleted_seqno: u64,
    pub high_seqno: u64,
    pub purge_seqno: u64,
    pub snap_start: u64,
    pub snap_end: u64,
    pub max_cas: u64,
    #[serde(default = "empty_failover_log")]
    pub failover_log: serde_json::Value,
}

fn empty_failover_log() -> serde_json::Value {
    serde_json::Value::Array(Vec::new())
}

impl PartitionState {
    pub fn new(state: Membership) -> Self {
        Self {
            state,
            checkpoint_id: 0,
            max_deleted_seqno: 0,
            high_seqno: 0,
            purge_seqno: 0,
            snap_start: 0,
            snap_end: 0,
            max_cas: 0,
            failover_log: empty_failover_log(),
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        serde_json::to_vec(self).expect("partition state serializes")
    }

    /// Parse a persisted state document.
    ///
    /// A stored `max_cas` of `u64::MAX` is a legacy sentinel from files
    /// written before the field was validated; it is repaired to 0 on read.
    pub fn decode(bytes: &[u8]) -> StoreResult<Self> {
        let mut state: PartitionState =
            serde_json::from_slice(bytes).map_err(|_| StoreError::Corrupt)?;
        if state.max_cas == u64::MAX {
            warn!("repairing legacy max_cas sentinel (-1) to 0");
            state.max_cas = 0;
        }
        Ok(state)
    }
}

/// How `snapshot_state` persists the local document.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatePersist {
    /// Write the local document and commit (sync) immediately.
    WithCommit,
    /// Write the local document only; durability rides on the next
    /// committing batch.
    WithoutCommit,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn json_round_trip() {
        let mut state = PartitionState::new(Membership::Active);
        state.checkpoint_id = 3;
        state.high_seqno = 42;
        state.max_cas = 12345;
        state.failover_log = serde_json::json!([{"id": 9, "seq": 40}]);

        let back = PartitionState::decode(&state.encode()).unwrap();
        assert_eq!(back, state);
    }

    #[test]
    fn max_cas_sentinel_is_repaired() {
        let mut state = PartitionState::new(Membership::Replica);
        state.max_cas = u64::MAX;

        let back = PartitionState::decode(&state.encode()).unwrap();
        assert_eq!(back.max_cas, 0);
    }

    #[test]
    fn garbage_is_corrupt() {
        assert_eq!(PartitionState::decode(b"{not json"), Err(StoreError::Corrupt));
    }

    #[test]
    fn membership_serializes_lowercase() {
        let state = PartitionState::new(Membership::Dead);
        let text = String::from_utf8(state.encode()).unwrap();
        assert!(text.contains("\"state\":\"dead\""));
    }
}
