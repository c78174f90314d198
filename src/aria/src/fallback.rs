//! Deterministic fallback: conflicted transactions are re-run under record
//! locks granted in ascending tid order. The record space is sharded across
//! `n_lock_manager` workers; each manager walks the sorted list and grants
//! only its shard's locks, so grant order per shard is total in tid and the
//! resulting schedule is the same on every run. Whichever manager grants a
//! transaction's last lock executes it and releases everything.

use engine::tid;
use engine::transaction::Transaction;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use storage::Database;

pub struct FallbackEntry {
    pub tid_offset: usize,
    // (table_id, partition_id, key, written), deduplicated
    keys: Vec<(usize, usize, u64, bool)>,
    granted: AtomicUsize,
    txn: Mutex<Option<Transaction>>,
}

pub fn key_shard(table_id: usize, partition_id: usize, key: u64, n_lock_manager: usize) -> usize {
    (table_id
        .wrapping_add(partition_id.wrapping_mul(31))
        .wrapping_add(key as usize))
        % n_lock_manager
}

impl FallbackEntry {
    pub fn new(txn: Transaction) -> Self {
        let mut keys: Vec<(usize, usize, u64, bool)> = Vec::new();
        for read_key in &txn.read_set {
            if read_key.get_local_index_read_bit() {
                continue;
            }
            let written =
                txn.is_key_in_write_set(read_key.table_id, read_key.partition_id, read_key.key);
            keys.push((read_key.table_id, read_key.partition_id, read_key.key, written));
        }
        for write_key in &txn.write_set {
            if !keys
                .iter()
                .any(|k| k.0 == write_key.table_id && k.1 == write_key.partition_id && k.2 == write_key.key)
            {
                keys.push((write_key.table_id, write_key.partition_id, write_key.key, true));
            }
        }
        Self {
            tid_offset: txn.tid_offset,
            keys,
            granted: AtomicUsize::new(0),
            txn: Mutex::new(Some(txn)),
        }
    }
}

/// One lock manager's pass over the sorted fallback list. Returns the
/// transactions this manager ended up executing (for the caller's
/// counters). `stamp` maps a tid_offset to the commit wts to install.
pub fn run_fallback(
    db: &Database,
    entries: &[FallbackEntry],
    lock_manager_id: usize,
    n_lock_manager: usize,
    stamp: impl Fn(usize) -> u64,
) -> Vec<Transaction> {
    let mut executed = Vec::new();

    for entry in entries {
        let mut my_locks = 0;
        for (table_id, partition_id, key, _written) in &entry.keys {
            if key_shard(*table_id, *partition_id, *key, n_lock_manager) != lock_manager_id {
                continue;
            }
            let table = db.find_table(*table_id, *partition_id);
            let metadata = table
                .search_metadata(*key)
                .expect("fallback lock of a missing row");
            tid::lock_wait(metadata);
            my_locks += 1;
        }
        if my_locks == 0 {
            continue;
        }
        let granted = entry.granted.fetch_add(my_locks, Ordering::AcqRel) + my_locks;
        if granted < entry.keys.len() {
            continue;
        }

        // every lock is held, execute deterministically
        let mut txn = entry
            .txn
            .lock()
            .take()
            .expect("fallback transaction executed twice");
        let commit_wts = stamp(entry.tid_offset);
        txn.commit_wts = commit_wts;

        // reads come fresh from the locked records
        for i in 0..txn.read_set.len() {
            let (table_id, partition_id, key) = {
                let read_key = &txn.read_set[i];
                (read_key.table_id, read_key.partition_id, read_key.key)
            };
            if txn.read_set[i].get_local_index_read_bit() {
                continue;
            }
            let table = db.find_table(table_id, partition_id);
            if let Some(value) = table.search_value(key) {
                txn.read_set[i].value = value;
            }
        }
        for write_key in &txn.write_set {
            let table = db.find_table(write_key.table_id, write_key.partition_id);
            table.update(write_key.key, write_key.value.clone());
        }
        for (table_id, partition_id, key, written) in &entry.keys {
            let table = db.find_table(*table_id, *partition_id);
            let metadata = table
                .search_metadata(*key)
                .expect("fallback release of a missing row");
            if *written {
                tid::unlock_with_commit(metadata, commit_wts);
            } else {
                tid::unlock(metadata);
            }
        }
        executed.push(txn);
    }

    executed
}
