use std::sync::atomic::AtomicU32;

use engine::transaction::Transaction;
use parking_lot::RwLock;

pub mod executor;
pub mod fallback;
pub mod reservation;

use fallback::FallbackEntry;
use reservation::ReservationTable;

/// State shared between the epoch manager and the aria executors.
pub struct AriaState {
    pub status: AtomicU32,
    pub n_complete_workers: AtomicU32,
    pub epoch: AtomicU32,
    pub reservations: ReservationTable,
    /// Conflicted transactions handed to the fallback lock managers; the
    /// manager thread sorts this by tid before the fallback phase opens.
    pub fallback: RwLock<Vec<FallbackEntry>>,
}

impl Default for AriaState {
    fn default() -> Self {
        Self {
            status: AtomicU32::new(engine::ExecutorStatus::Stop as u32),
            n_complete_workers: AtomicU32::new(0),
            epoch: AtomicU32::new(0),
            reservations: ReservationTable::new(),
            fallback: RwLock::new(Vec::new()),
        }
    }
}

impl AriaState {
    pub fn new() -> Self {
        Self::default()
    }
}

/// Commit stamps order every transaction of every epoch on one axis, so a
/// record's wts stays strictly increasing across epochs and across the
/// commit and fallback paths within one epoch.
pub fn commit_stamp(epoch: u32, tid_offset: usize, batch_total: usize) -> u64 {
    epoch as u64 * batch_total as u64 + tid_offset as u64 + 1
}

/// Re-examines the transaction's sets against the reservation table.
/// A conflict exists only against transactions earlier in the epoch
/// (lower tid_offset).
pub fn analyze_conflicts(txn: &mut Transaction, reservations: &ReservationTable, epoch: u32) {
    let offset = txn.tid_offset;

    for write_key in &txn.write_set {
        if let Some(winner) =
            reservations.write_reserver(write_key.table_id, write_key.partition_id, write_key.key, epoch)
        {
            if winner < offset {
                txn.waw = true;
            }
        }
        if let Some(winner) =
            reservations.read_reserver(write_key.table_id, write_key.partition_id, write_key.key, epoch)
        {
            if winner < offset {
                txn.war = true;
            }
        }
    }

    for read_key in &txn.read_set {
        if read_key.get_local_index_read_bit() {
            continue;
        }
        if let Some(winner) =
            reservations.write_reserver(read_key.table_id, read_key.partition_id, read_key.key, epoch)
        {
            if winner < offset {
                txn.raw = true;
            }
        }
    }
}

/// Aria's commit rule: a waw loser never commits in place; a raw conflict
/// aborts unless reordering is on, where reads sort before writes and only
/// the war+raw combination is fatal.
pub fn commit_decision(txn: &Transaction, reordering: bool) -> bool {
    if txn.waw {
        return false;
    }
    if reordering {
        !(txn.war && txn.raw)
    } else {
        !txn.raw
    }
}
