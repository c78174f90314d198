//! Operation replication: instead of shipping one value piece per key, a
//! committing transaction can ship its whole write set as one serialized
//! control piece. Replicas apply it under the record locks exactly like a
//! value replication, so the two paths converge on the same state.

use message::MessagePiece;
use serde::{Deserialize, Serialize};
use storage::Database;

use crate::rwkey::RWKey;
use crate::tid;

#[derive(Serialize, Deserialize, Debug)]
pub struct Operation {
    pub commit_wts: u64,
    pub writes: Vec<WriteEntry>,
}

#[derive(Serialize, Deserialize, Debug)]
pub struct WriteEntry {
    pub table_id: usize,
    pub partition_id: usize,
    pub key: u64,
    pub value: String,
}

impl Operation {
    pub fn from_write_set(commit_wts: u64, write_set: &[RWKey]) -> Self {
        Self {
            commit_wts,
            writes: write_set
                .iter()
                .map(|k| WriteEntry {
                    table_id: k.table_id,
                    partition_id: k.partition_id,
                    key: k.key,
                    value: k.value.clone(),
                })
                .collect(),
        }
    }

    pub fn serialize(&self) -> Vec<u8> {
        serde_json::to_vec(self).expect("operation serialization failed")
    }
}

/// Control handler, routed ahead of the per-protocol handler tables.
pub fn operation_replication_handler(piece: &MessagePiece<'_>, db: &Database) {
    let operation: Operation =
        serde_json::from_slice(piece.payload).expect("malformed operation replication payload");
    for write in operation.writes {
        let table = db.find_table(write.table_id, write.partition_id);
        let metadata = table
            .search_metadata(write.key)
            .expect("operation replication of a missing row");
        let last_tid = tid::lock_wait(metadata);
        // stale replications lose against a newer committed version
        if tid::get_wts(last_tid) < operation.commit_wts {
            table.update(write.key, write.value);
            tid::unlock_with_commit(metadata, operation.commit_wts);
        } else {
            tid::unlock(metadata);
        }
    }
}
