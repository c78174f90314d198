use std::sync::Arc;

use common::config::Context;
use engine::partitioner::Partitioner;
use engine::protocol::{search_record, sync_messages, MessageHandler, Protocol};
use engine::tid;
use engine::transaction::Transaction;
use message::{factory, Mailbox};
use storage::Database;

pub mod message_handler;

/// Scar: Silo's commit sequence with dynamic timestamp ordering. Commit
/// timestamps are split into a read and a write side, and read validation
/// may extend a record's rts in place instead of aborting.
pub struct Scar {
    context: Context,
    db: Arc<Database>,
    partitioner: Arc<dyn Partitioner>,
}

impl Scar {
    pub fn new(db: Arc<Database>, context: Context, partitioner: Arc<dyn Partitioner>) -> Self {
        Self {
            context,
            db,
            partitioner,
        }
    }

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

                // the record moved between the read and the lock
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

    /// commit_rts covers the reads, commit_wts additionally clears every
    /// written record's current rts.
    fn compute_commit_ts(&self, txn: &mut Transaction) {
        let mut ts = 0;
        for read_key in &txn.read_set {
            ts = ts.max(tid::get_wts(read_key.tid));
        }
        txn.commit_rts = ts;
        for write_key in &txn.write_set {
            ts = ts.max(tid::get_rts(write_key.tid) + 1);
        }
        txn.commit_wts = ts;
    }

    fn validate_read_set(&mut self, txn: &mut Transaction, mailbox: &mut Mailbox) -> bool {
        let commit_ts = txn.commit_wts;

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
                debug_assert!(!tid::is_locked(read_tid));
                let mut written_tid = read_tid;
                if tid::validate_read_key(metadata, read_tid, commit_ts, &mut written_tid) {
                    let read_key = &mut txn.read_set[i];
                    read_key.set_read_validation_success_bit();
                    if written_tid != read_tid {
                        // rts was extended under us; remember the new word
                        // so a retry re-reads instead of trusting the cache
                        read_key.set_wts_change_in_read_validation_bit();
                        read_key.tid = written_tid;
                    }
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
                    commit_ts,
                );
            }
        }

        sync_messages(&self.db, self.handlers(), mailbox, txn, true);

        !txn.abort_read_validation
    }

    fn write_and_replicate(&mut self, txn: &mut Transaction, mailbox: &mut Mailbox) {
        // no operation replication in scar
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

impl Protocol for Scar {
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

        self.compute_commit_ts(txn);

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
            // only unlock locked records
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

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam_queue::SegQueue;
    use engine::partitioner::HashReplicatedPartitioner;
    use engine::transaction::Operation as TxnOperation;
    use storage::MemTable;

    fn new_mailbox() -> Mailbox {
        Mailbox::new(0, 0, 1, Arc::new(SegQueue::new()), Arc::new(SegQueue::new()))
    }

    fn single_node() -> (Arc<Database>, Scar) {
        let mut table = MemTable::new(0, 0, 2);
        table.insert(1, "v1".to_string());
        table.insert(2, "v2".to_string());
        let mut db = Database::new();
        db.add_table(vec![Arc::new(table)]);
        let db = Arc::new(db);
        let partitioner = Arc::new(HashReplicatedPartitioner::new(0, 1, 1));
        let scar = Scar::new(db.clone(), Context::default(), partitioner);
        (db, scar)
    }

    fn run(scar: &mut Scar, txn: &mut Transaction, mailbox: &mut Mailbox) {
        txn.execute();
        for i in (0..txn.read_set.len()).rev() {
            if !txn.read_set[i].get_read_request_bit() {
                break;
            }
            txn.read_set[i].clear_read_request_bit();
            scar.read_request(txn, i, mailbox);
        }
        assert_eq!(txn.pending_responses, 0);
    }

    fn stamp(db: &Database, key: u64, wts: u64) {
        let metadata = db.find_table(0, 0).search_metadata(key).unwrap();
        tid::lock(metadata);
        tid::unlock_with_commit(metadata, wts);
    }

    #[test]
    fn commit_timestamps_split_reads_and_writes() {
        let (db, mut scar) = single_node();
        let mut mailbox = new_mailbox();
        stamp(&db, 1, 5);
        stamp(&db, 2, 3);

        let mut txn = Transaction::new(0, 0, 1);
        txn.plan = vec![
            TxnOperation::Read {
                table_id: 0,
                partition_id: 0,
                key: 1,
            },
            TxnOperation::Update {
                table_id: 0,
                partition_id: 0,
                key: 2,
                value: "v2'".to_string(),
            },
        ];
        run(&mut scar, &mut txn, &mut mailbox);
        assert!(scar.commit(&mut txn, &mut mailbox));
        // reads cap at wts 5, the written record's rts 3 pushes wts to 5 as
        // well via max(commit_rts, rts+1)
        assert_eq!(txn.commit_rts, 5);
        assert_eq!(txn.commit_wts, 5);

        let word = db
            .find_table(0, 0)
            .search_metadata(2)
            .unwrap()
            .load(std::sync::atomic::Ordering::Relaxed);
        assert_eq!(tid::get_wts(word), 5);
        assert_eq!(tid::get_rts(word), 5);
    }

    #[test]
    fn validation_extends_rts_and_flags_the_read() {
        let (db, mut scar) = single_node();
        let mut mailbox = new_mailbox();
        stamp(&db, 1, 5); // wts = rts = 5
        stamp(&db, 2, 7);

        // reading key 1 while writing key 2 forces commit_wts = 8 > rts(k1)
        let mut txn = Transaction::new(0, 0, 1);
        txn.plan = vec![
            TxnOperation::Read {
                table_id: 0,
                partition_id: 0,
                key: 1,
            },
            TxnOperation::Update {
                table_id: 0,
                partition_id: 0,
                key: 2,
                value: "v2'".to_string(),
            },
        ];
        run(&mut scar, &mut txn, &mut mailbox);
        assert!(scar.commit(&mut txn, &mut mailbox));
        assert_eq!(txn.commit_wts, 8);

        // key 1 kept its version but its rts stretched to cover the read
        let word = db
            .find_table(0, 0)
            .search_metadata(1)
            .unwrap()
            .load(std::sync::atomic::Ordering::Relaxed);
        assert_eq!(tid::get_wts(word), 5);
        assert_eq!(tid::get_rts(word), 8);
        assert!(txn.read_set[0].get_wts_change_in_read_validation_bit());
        assert_eq!(txn.read_set[0].tid, word);
    }

    #[test]
    fn stale_read_under_a_lock_aborts() {
        let (db, mut scar) = single_node();
        let mut mailbox = new_mailbox();

        let mut txn = Transaction::new(0, 0, 1);
        txn.plan = vec![
            TxnOperation::Read {
                table_id: 0,
                partition_id: 0,
                key: 1,
            },
            TxnOperation::Update {
                table_id: 0,
                partition_id: 0,
                key: 2,
                value: "x".to_string(),
            },
        ];
        run(&mut scar, &mut txn, &mut mailbox);

        // another writer bumps key 1 and key 2 after our read
        stamp(&db, 1, 4);
        stamp(&db, 2, 4);

        assert!(!scar.commit(&mut txn, &mut mailbox));
        // the write key moved, caught at lock time
        assert!(txn.abort_lock);
        let word = db
            .find_table(0, 0)
            .search_metadata(2)
            .unwrap()
            .load(std::sync::atomic::Ordering::Relaxed);
        assert!(!tid::is_locked(word));

        txn.reset();
        run(&mut scar, &mut txn, &mut mailbox);
        assert!(scar.commit(&mut txn, &mut mailbox));
    }
}
