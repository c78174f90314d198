use std::collections::HashSet;
use std::sync::Arc;

use common::config::Context;
use engine::partitioner::Partitioner;
use engine::protocol::{search_record, MessageHandler, Protocol};
use engine::replication::Operation;
use engine::tid;
use engine::transaction::Transaction;
use message::{factory, Mailbox};
use storage::Database;

pub mod executor;
pub mod manager;
pub mod message_handler;

/// The commit path used inside an R-Store phase. The phase partitioner
/// makes every accessed partition a local master, so there is no remote
/// locking and no validation round: the phase barrier already serialises
/// cross-partition work against single-partition work. Replication to the
/// other coordinators is fire-and-forget; they drain it before the next
/// phase begins.
pub struct RStore {
    context: Context,
    db: Arc<Database>,
    partitioner: Arc<dyn Partitioner>,
    last_tid: u64,
}

impl RStore {
    pub fn new(db: Arc<Database>, context: Context, partitioner: Arc<dyn Partitioner>) -> Self {
        Self {
            context,
            db,
            partitioner,
            last_tid: 0,
        }
    }

    fn lock_write_set(&mut self, txn: &mut Transaction) -> bool {
        for i in 0..txn.write_set.len() {
            let (table_id, partition_id, key) = {
                let write_key = &txn.write_set[i];
                (write_key.table_id, write_key.partition_id, write_key.key)
            };
            debug_assert!(self.partitioner.has_master_partition(partition_id));
            let table = self.db.find_table(table_id, partition_id);
            let metadata = table.search_metadata(key).expect("lock of a missing row");
            let (latest_tid, success) = tid::lock(metadata);
            if !success {
                // cross-partition transactions of sibling workers can
                // still collide inside the c-phase
                txn.abort_lock = true;
                break;
            }
            txn.write_set[i].set_write_lock_bit();
            txn.write_set[i].tid = latest_tid;
        }
        txn.abort_lock
    }

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
            table.update(key, value.clone());
            let metadata = table
                .search_metadata(key)
                .expect("release of a missing row");
            tid::unlock_with_commit(metadata, commit_wts);
            txn.write_set[i].clear_write_lock_bit();

            for k in 0..self.partitioner.total_coordinators() {
                if k == txn.coordinator_id {
                    continue;
                }
                if !self.partitioner.is_partition_replicated_on(partition_id, k) {
                    continue;
                }
                if operation_replication {
                    operation_targets.insert(k);
                } else {
                    // fire and forget; the peers drain this before the
                    // next phase starts
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
        }

        if operation_replication && !operation_targets.is_empty() {
            let operation = Operation::from_write_set(commit_wts, &txn.write_set);
            let payload = operation.serialize();
            for k in operation_targets {
                txn.network_size += factory::new_operation_replication_message(
                    mailbox.message_to(k),
                    0,
                    0,
                    &payload,
                );
            }
        }
    }
}

impl Protocol for RStore {
    fn read_request(&mut self, txn: &mut Transaction, key_offset: usize, mailbox: &mut Mailbox) {
        let _ = mailbox;
        let (table_id, partition_id, key) = {
            let read_key = &txn.read_set[key_offset];
            (read_key.table_id, read_key.partition_id, read_key.key)
        };
        debug_assert!(self.partitioner.has_master_partition(partition_id));
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
    }

    fn commit(&mut self, txn: &mut Transaction, mailbox: &mut Mailbox) -> bool {
        if self.lock_write_set(txn) {
            self.abort(txn, mailbox);
            return false;
        }

        let commit_tid = self.generate_tid(txn);
        txn.commit_rts = commit_tid;
        txn.commit_wts = commit_tid;

        self.write_and_replicate(txn, mailbox);
        // replication is flushed on the executor's batch cadence

        true
    }

    fn abort(&mut self, txn: &mut Transaction, mailbox: &mut Mailbox) {
        let _ = mailbox;
        for i in 0..txn.write_set.len() {
            if !txn.write_set[i].get_write_lock_bit() {
                continue;
            }
            let (table_id, partition_id, key) = {
                let write_key = &txn.write_set[i];
                (write_key.table_id, write_key.partition_id, write_key.key)
            };
            let table = self.db.find_table(table_id, partition_id);
            let metadata = table.search_metadata(key).expect("abort of a missing row");
            tid::unlock(metadata);
            txn.write_set[i].clear_write_lock_bit();
        }
    }

    fn handlers(&self) -> &'static [MessageHandler] {
        &message_handler::HANDLERS
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam_queue::SegQueue;
    use engine::partitioner::{RStoreCPartitioner, RStoreSPartitioner};
    use engine::transaction::Operation as TxnOperation;
    use storage::{MemTable, Table};

    fn new_mailbox(coordinator_num: usize) -> Mailbox {
        Mailbox::new(
            0,
            0,
            coordinator_num,
            Arc::new(SegQueue::new()),
            Arc::new(SegQueue::new()),
        )
    }

    fn db_with_partitions(n: usize) -> Arc<Database> {
        let mut partitions: Vec<Arc<dyn Table>> = Vec::new();
        for p in 0..n {
            let mut table = MemTable::new(0, p, 2);
            table.insert(1, "v1".to_string());
            partitions.push(Arc::new(table));
        }
        let mut db = Database::new();
        db.add_table(partitions);
        Arc::new(db)
    }

    #[test]
    fn cross_partition_commit_without_validation() {
        let db = db_with_partitions(2);
        let partitioner = Arc::new(RStoreCPartitioner::new(0, 1));
        let mut protocol = RStore::new(db.clone(), Context::default(), partitioner);
        let mut mailbox = new_mailbox(1);

        let mut txn = Transaction::new(0, 0, 1);
        txn.plan = vec![
            TxnOperation::Update {
                table_id: 0,
                partition_id: 0,
                key: 1,
                value: "p0".to_string(),
            },
            TxnOperation::Update {
                table_id: 0,
                partition_id: 1,
                key: 1,
                value: "p1".to_string(),
            },
        ];
        txn.execute();
        for i in (0..txn.read_set.len()).rev() {
            txn.read_set[i].clear_read_request_bit();
            protocol.read_request(&mut txn, i, &mut mailbox);
        }
        assert!(protocol.commit(&mut txn, &mut mailbox));

        for p in 0..2 {
            let table = db.find_table(0, p);
            let word = table
                .search_metadata(1)
                .unwrap()
                .load(std::sync::atomic::Ordering::Relaxed);
            assert!(!tid::is_locked(word));
            assert_eq!(tid::get_wts(word), 1);
        }
        assert_eq!(db.find_table(0, 0).search_value(1).unwrap(), "p0");
        assert_eq!(db.find_table(0, 1).search_value(1).unwrap(), "p1");
    }

    #[test]
    fn replication_is_fire_and_forget() {
        let db = db_with_partitions(2);
        // two coordinators, this one masters the even partitions
        let partitioner = Arc::new(RStoreSPartitioner::new(0, 2));
        let mut protocol = RStore::new(db.clone(), Context::default(), partitioner);
        let mut mailbox = new_mailbox(2);

        let mut txn = Transaction::new(0, 0, 1);
        txn.plan = vec![TxnOperation::Update {
            table_id: 0,
            partition_id: 0,
            key: 1,
            value: "s".to_string(),
        }];
        txn.execute();
        for i in (0..txn.read_set.len()).rev() {
            txn.read_set[i].clear_read_request_bit();
            protocol.read_request(&mut txn, i, &mut mailbox);
        }
        assert!(protocol.commit(&mut txn, &mut mailbox));
        assert_eq!(txn.pending_responses, 0);

        // one replication piece is batched for the peer
        assert_eq!(mailbox.messages[1].piece_count(), 1);
        mailbox.flush_messages();
        let released = mailbox.out_queue.pop().unwrap();
        let piece = released.iter().next().unwrap();
        assert_eq!(piece.msg_type, message::MessageType::ReplicateRequest);
    }

    #[test]
    fn sibling_conflict_aborts_and_unlocks() {
        let db = db_with_partitions(1);
        let partitioner = Arc::new(RStoreCPartitioner::new(0, 1));
        let mut protocol = RStore::new(db.clone(), Context::default(), partitioner);
        let mut mailbox = new_mailbox(1);

        // another worker holds the record
        let metadata = db.find_table(0, 0).search_metadata(1).unwrap();
        tid::lock(metadata);

        let mut txn = Transaction::new(0, 0, 1);
        txn.plan = vec![TxnOperation::Update {
            table_id: 0,
            partition_id: 0,
            key: 1,
            value: "x".to_string(),
        }];
        txn.execute();
        for i in (0..txn.read_set.len()).rev() {
            txn.read_set[i].clear_read_request_bit();
            protocol.read_request(&mut txn, i, &mut mailbox);
        }
        assert!(!protocol.commit(&mut txn, &mut mailbox));
        assert!(txn.abort_lock);

        tid::unlock(metadata);
        txn.reset();
        txn.execute();
        for i in (0..txn.read_set.len()).rev() {
            txn.read_set[i].clear_read_request_bit();
            protocol.read_request(&mut txn, i, &mut mailbox);
        }
        assert!(protocol.commit(&mut txn, &mut mailbox));
    }
}
