use std::collections::HashSet;
use std::sync::Arc;

use common::config::Context;
use engine::partitioner::Partitioner;
use engine::protocol::{search_record, sync_messages, MessageHandler, Protocol};
use engine::replication::Operation;
use engine::tid;
use engine::transaction::Transaction;
use message::{factory, Mailbox};
use storage::Database;

pub mod message_handler;

/// Silo-style optimistic commit: lock the write set, pick a commit tid,
/// validate the read set, write and replicate, release.
pub struct Silo {
    context: Context,
    db: Arc<Database>,
    partitioner: Arc<dyn Partitioner>,
    last_tid: u64,
}

impl Silo {
    pub fn new(db: Arc<Database>, context: Context, partitioner: Arc<dyn Partitioner>) -> Self {
        Self {
            context,
            db,
            partitioner,
            last_tid: 0,
        }
    }

    /// Locks are taken in write-set order, not key order; a conflicting
    /// interleaving shows up as a failed lock, never a deadlock.
    fn lock_write_set(&mut self, txn: &mut Transaction, mailbox: &mut Mailbox) -> bool {
        for i in 0..txn.write_set.len() {
            let (table_id, partition_id, key) = {
                let write_key = &txn.write_set[i];
                (write_key.table_id, write_key.partition_id, write_key.key)
            };
            if self.partitioner.has_master_partition(partition_id) {
                let table = self.db.find_table(table_id, partition_id);
                let metadata = table.search_metadata(key).expect("lock of a missing row");
                let (latest_tid, success) = tid::lock(metadata);
                if !success {
                    txn.abort_lock = true;
                    break;
                }
                txn.write_set[i].set_write_lock_bit();
                txn.write_set[i].tid = latest_tid;

                // the record must not have moved between the read and the
                // lock, otherwise the update was computed from a stale value
                if let Some(read_index) = txn.get_read_key(table_id, partition_id, key) {
                    let tid_on_read = txn.read_set[read_index].tid;
                    if tid::get_wts(latest_tid) != tid::get_wts(tid_on_read) {
                        txn.abort_lock = true;
                        break;
                    }
                }
            } else {
                txn.pending_responses += 1;
                let coordinator_id = self.partitioner.master_coordinator(partition_id);
                txn.network_size += factory::new_lock_message(
                    mailbox.message_to(coordinator_id),
                    table_id,
                    partition_id,
                    key,
                    i as u32,
                );
            }
        }

        sync_messages(&self.db, self.handlers(), mailbox, txn, true);

        txn.abort_lock
    }

    /// Strictly greater than every tid this transaction saw and every tid
    /// this worker handed out before.
    fn generate_tid(&mut self, txn: &Transaction) -> u64 {
        let mut ts = self.last_tid;
        for read_key in &txn.read_set {
            ts = ts.max(tid::get_wts(read_key.tid));
        }
        for write_key in &txn.write_set {
            ts = ts.max(tid::get_wts(write_key.tid));
        }
        self.last_tid = ts + 1;
        self.last_tid
    }

    fn validate_read_set(&mut self, txn: &mut Transaction, mailbox: &mut Mailbox) -> bool {
        for i in 0..txn.read_set.len() {
            let (table_id, partition_id, key, read_tid, local_index) = {
                let read_key = &txn.read_set[i];
                (
                    read_key.table_id,
                    read_key.partition_id,
                    read_key.key,
                    read_key.tid,
                    read_key.get_local_index_read_bit(),
                )
            };
            if local_index {
                // read only index does not need to validate
                continue;
            }
            if txn.is_key_in_write_set(table_id, partition_id, key) {
                // already validated when the write lock was taken
                continue;
            }
            if self.partitioner.has_master_partition(partition_id) {
                let table = self.db.find_table(table_id, partition_id);
                let metadata = table
                    .search_metadata(key)
                    .expect("validation of a missing row");
                if tid::validate_silo(metadata, read_tid) {
                    txn.read_set[i].set_read_validation_success_bit();
                } else {
                    txn.abort_read_validation = true;
                    break;
                }
            } else {
                txn.pending_responses += 1;
                let coordinator_id = self.partitioner.master_coordinator(partition_id);
                txn.network_size += factory::new_read_validation_message(
                    mailbox.message_to(coordinator_id),
                    table_id,
                    partition_id,
                    key,
                    i as u32,
                    read_tid,
                    txn.commit_wts,
                );
            }
        }

        sync_messages(&self.db, self.handlers(), mailbox, txn, true);

        !txn.abort_read_validation
    }

    fn write_and_replicate(&mut self, txn: &mut Transaction, mailbox: &mut Mailbox) {
        let commit_wts = txn.commit_wts;
        let operation_replication = self.context.operation_replication && !txn.is_read_only();
        let mut operation_targets: HashSet<usize> = HashSet::new();

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

            // write
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

            // value replicate
            let mut replicate_count = 0;
            for k in 0..self.partitioner.total_coordinators() {
                if !self.partitioner.is_partition_replicated_on(partition_id, k) {
                    continue;
                }
                if k == master {
                    // already written
                    continue;
                }
                replicate_count += 1;

                if k == txn.coordinator_id {
                    // local replica
                    let metadata = table
                        .search_metadata(key)
                        .expect("replication of a missing row");
                    let last_tid = tid::lock_wait(metadata);
                    debug_assert!(tid::get_wts(last_tid) < commit_wts);
                    table.update(key, value.clone());
                    tid::unlock_with_commit(metadata, commit_wts);
                } else if operation_replication {
                    // one control piece per target, sent after the loop
                    operation_targets.insert(k);
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

        if operation_replication && !operation_targets.is_empty() {
            let operation = Operation::from_write_set(commit_wts, &txn.write_set);
            let payload = operation.serialize();
            for k in operation_targets {
                // fire and forget, applied by the control handler
                txn.network_size += factory::new_operation_replication_message(
                    mailbox.message_to(k),
                    0,
                    0,
                    &payload,
                );
            }
        }

        sync_messages(&self.db, self.handlers(), mailbox, txn, true);
    }

    fn release_locks(&mut self, txn: &mut Transaction, mailbox: &mut Mailbox) {
        let commit_wts = txn.commit_wts;
        for i in 0..txn.write_set.len() {
            let (table_id, partition_id, key) = {
                let write_key = &txn.write_set[i];
                (write_key.table_id, write_key.partition_id, write_key.key)
            };
            if self.partitioner.has_master_partition(partition_id) {
                let table = self.db.find_table(table_id, partition_id);
                let metadata = table
                    .search_metadata(key)
                    .expect("release of a missing row");
                tid::unlock_with_commit(metadata, commit_wts);
            } else {
                let coordinator_id = self.partitioner.master_coordinator(partition_id);
                txn.network_size += factory::new_release_lock_message(
                    mailbox.message_to(coordinator_id),
                    table_id,
                    partition_id,
                    key,
                    commit_wts,
                    true,
                );
            }
        }

        sync_messages(&self.db, self.handlers(), mailbox, txn, false);
    }
}

impl Protocol for Silo {
    fn read_request(&mut self, txn: &mut Transaction, key_offset: usize, mailbox: &mut Mailbox) {
        let (table_id, partition_id, key, local_index) = {
            let read_key = &txn.read_set[key_offset];
            (
                read_key.table_id,
                read_key.partition_id,
                read_key.key,
                read_key.get_local_index_read_bit(),
            )
        };
        if self.partitioner.has_master_partition(partition_id) || local_index {
            let table = self.db.find_table(table_id, partition_id);
            match search_record(table, key) {
                Some((tid_word, value)) => {
                    let read_key = &mut txn.read_set[key_offset];
                    read_key.tid = tid_word;
                    read_key.value = value;
                    read_key.set_execution_processed_bit();
                }
                None => txn.abort_no_retry = true,
            }
        } else {
            txn.pending_responses += 1;
            txn.distributed = true;
            let coordinator_id = self.partitioner.master_coordinator(partition_id);
            txn.network_size += factory::new_search_message(
                mailbox.message_to(coordinator_id),
                table_id,
                partition_id,
                key,
                key_offset as u32,
            );
        }
    }

    fn commit(&mut self, txn: &mut Transaction, mailbox: &mut Mailbox) -> bool {
        if self.lock_write_set(txn, mailbox) {
            self.abort(txn, mailbox);
            return false;
        }

        let commit_tid = self.generate_tid(txn);
        txn.commit_rts = commit_tid;
        txn.commit_wts = commit_tid;

        if !self.validate_read_set(txn, mailbox) {
            self.abort(txn, mailbox);
            return false;
        }

        self.write_and_replicate(txn, mailbox);
        self.release_locks(txn, mailbox);

        true
    }

    fn abort(&mut self, txn: &mut Transaction, mailbox: &mut Mailbox) {
        for i in 0..txn.write_set.len() {
            if !txn.write_set[i].get_write_lock_bit() {
                continue;
            }
            let (table_id, partition_id, key) = {
                let write_key = &txn.write_set[i];
                (write_key.table_id, write_key.partition_id, write_key.key)
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
            txn.write_set[i].clear_write_lock_bit();
        }

        sync_messages(&self.db, self.handlers(), mailbox, txn, false);
    }

    fn handlers(&self) -> &'static [MessageHandler] {
        &message_handler::HANDLERS
    }
}
