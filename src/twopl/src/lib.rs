use std::sync::Arc;

use common::config::Context;
use engine::partitioner::Partitioner;
use engine::protocol::{sync_messages, MessageHandler, Protocol};
use engine::tid;
use engine::transaction::Transaction;
use message::{factory, Mailbox};
use storage::Database;

pub mod message_handler;

/// No-wait two-phase locking. Every access takes the record's exclusive
/// lock during execution (the metadata word has a single lock bit, so reads
/// lock exclusively too); a held lock aborts the transaction immediately.
/// Commit is a single round: write, replicate, release.
pub struct TwoPL {
    context: Context,
    db: Arc<Database>,
    partitioner: Arc<dyn Partitioner>,
    last_tid: u64,
}

impl TwoPL {
    pub fn new(db: Arc<Database>, context: Context, partitioner: Arc<dyn Partitioner>) -> Self {
        Self {
            context,
            db,
            partitioner,
            last_tid: 0,
        }
    }

    fn generate_tid(&mut self, txn: &Transaction) -> u64 {
        let mut ts = self.last_tid;
        for read_key in &txn.read_set {
            ts = ts.max(tid::get_wts(read_key.tid));
        }
        self.last_tid = ts + 1;
        self.last_tid
    }

    fn write_and_replicate(&mut self, txn: &mut Transaction, mailbox: &mut Mailbox) {
        let commit_wts = txn.commit_wts;

        for i in 0..txn.write_set.len() {
            let (table_id, partition_id, key, value) = {
                let write_key = &txn.write_set[i];
                (
                    write_key.table_id,
                    write_key.partition_id,
                    write_key.key,
                    write_key.value.clone(),
                )
            };
            let table = self.db.find_table(table_id, partition_id);
            let master = self.partitioner.master_coordinator(partition_id);

            if self.partitioner.has_master_partition(partition_id) {
                table.update(key, value.clone());
            } else {
                txn.pending_responses += 1;
                txn.network_size += factory::new_write_message(
                    mailbox.message_to(master),
                    table_id,
                    partition_id,
                    key,
                    &value,
                );
            }

            let mut replicate_count = 0;
            for k in 0..self.partitioner.total_coordinators() {
                if !self.partitioner.is_partition_replicated_on(partition_id, k) {
                    continue;
                }
                if k == master {
                    continue;
                }
                replicate_count += 1;

                if k == txn.coordinator_id {
                    let metadata = table
                        .search_metadata(key)
                        .expect("replication of a missing row");
                    let last_tid = tid::lock_wait(metadata);
                    debug_assert!(tid::get_wts(last_tid) < commit_wts);
                    table.update(key, value.clone());
                    tid::unlock_with_commit(metadata, commit_wts);
                } else {
                    txn.pending_responses += 1;
                    txn.network_size += factory::new_replication_message(
                        mailbox.message_to(k),
                        table_id,
                        partition_id,
                        key,
                        &value,
                        commit_wts,
                    );
                }
            }
            debug_assert_eq!(replicate_count, self.partitioner.replica_num() - 1);
        }

        sync_messages(&self.db, self.handlers(), mailbox, txn, true);
    }

    /// All locks live on the read-set entries (writes share their key's
    /// read entry). Written keys are stamped with the commit tid, read-only
    /// keys are released untouched.
    fn release_locks(&mut self, txn: &mut Transaction, mailbox: &mut Mailbox) {
        let commit_wts = txn.commit_wts;
        for i in 0..txn.read_set.len() {
            if !txn.read_set[i].get_write_lock_bit() {
                continue;
            }
            let (table_id, partition_id, key) = {
                let read_key = &txn.read_set[i];
                (read_key.table_id, read_key.partition_id, read_key.key)
            };
            let written = txn.is_key_in_write_set(table_id, partition_id, key);
            if self.partitioner.has_master_partition(partition_id) {
                let table = self.db.find_table(table_id, partition_id);
                let metadata = table
                    .search_metadata(key)
                    .expect("release of a missing row");
                if written {
                    tid::unlock_with_commit(metadata, commit_wts);
                } else {
                    tid::unlock(metadata);
                }
            } else {
                let coordinator_id = self.partitioner.master_coordinator(partition_id);
                txn.network_size += factory::new_release_lock_message(
                    mailbox.message_to(coordinator_id),
                    table_id,
                    partition_id,
                    key,
                    commit_wts,
                    written,
                );
            }
            txn.read_set[i].clear_write_lock_bit();
        }

        sync_messages(&self.db, self.handlers(), mailbox, txn, false);
    }
}

impl Protocol for TwoPL {
    fn read_request(&mut self, txn: &mut Transaction, key_offset: usize, mailbox: &mut Mailbox) {
        if txn.abort_lock {
            // a previous access already failed, don't pile up locks
            return;
        }
        let (table_id, partition_id, key, local_index) = {
            let read_key = &txn.read_set[key_offset];
            (
                read_key.table_id,
                read_key.partition_id,
                read_key.key,
                read_key.get_local_index_read_bit(),
            )
        };
        if local_index {
            // index reads stay lock-free
            let table = self.db.find_table(table_id, partition_id);
            match table.search_value(key) {
                Some(value) => {
                    let read_key = &mut txn.read_set[key_offset];
                    read_key.value = value;
                    read_key.set_execution_processed_bit();
                }
                None => txn.abort_no_retry = true,
            }
            return;
        }
        if self.partitioner.has_master_partition(partition_id) {
            let table = self.db.find_table(table_id, partition_id);
            let metadata = match table.search_metadata(key) {
                Some(metadata) => metadata,
                None => {
                    txn.abort_no_retry = true;
                    return;
                }
            };
            let (latest_tid, success) = tid::lock(metadata);
            if !success {
                txn.abort_lock = true;
                return;
            }
            let value = table.search_value(key).expect("row vanished under its lock");
            let read_key = &mut txn.read_set[key_offset];
            read_key.set_write_lock_bit();
            read_key.tid = latest_tid;
            read_key.value = value;
            read_key.set_execution_processed_bit();
        } else {
            txn.pending_responses += 1;
            txn.distributed = true;
            let coordinator_id = self.partitioner.master_coordinator(partition_id);
            txn.network_size += factory::new_lock_message(
                mailbox.message_to(coordinator_id),
                table_id,
                partition_id,
                key,
                key_offset as u32,
            );
        }
    }

    fn commit(&mut self, txn: &mut Transaction, mailbox: &mut Mailbox) -> bool {
        debug_assert!(!txn.abort_lock);

        let commit_tid = self.generate_tid(txn);
        txn.commit_rts = commit_tid;
        txn.commit_wts = commit_tid;

        self.write_and_replicate(txn, mailbox);
        self.release_locks(txn, mailbox);

        true
    }

    fn abort(&mut self, txn: &mut Transaction, mailbox: &mut Mailbox) {
        for i in 0..txn.read_set.len() {
            if !txn.read_set[i].get_write_lock_bit() {
                continue;
            }
            let (table_id, partition_id, key) = {
                let read_key = &txn.read_set[i];
                (read_key.table_id, read_key.partition_id, read_key.key)
            };
            if self.partitioner.has_master_partition(partition_id) {
                let table = self.db.find_table(table_id, partition_id);
                let metadata = table.search_metadata(key).expect("abort of a missing row");
                tid::unlock(metadata);
            } else {
                let coordinator_id = self.partitioner.master_coordinator(partition_id);
                txn.network_size += factory::new_abort_message(
                    mailbox.message_to(coordinator_id),
                    table_id,
                    partition_id,
                    key,
                );
            }
            txn.read_set[i].clear_write_lock_bit();
        }

        sync_messages(&self.db, self.handlers(), mailbox, txn, false);
    }

    fn handlers(&self) -> &'static [MessageHandler] {
        &message_handler::HANDLERS
    }
}
