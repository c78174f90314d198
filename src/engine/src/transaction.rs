use std::time::Instant;

use crate::rwkey::RWKey;
use crate::TransactionResult;

/// One step of a workload-authored transaction. The plan is generated once
/// from the deterministic PRNG and replayed verbatim on every retry, which
/// is what makes abort-and-rerun reproduce the same read set.
#[derive(Clone, Debug)]
pub enum Operation {
    Read {
        table_id: usize,
        partition_id: usize,
        key: u64,
    },
    LocalIndexRead {
        table_id: usize,
        partition_id: usize,
        key: u64,
    },
    Update {
        table_id: usize,
        partition_id: usize,
        key: u64,
        value: String,
    },
    /// Workload-requested rollback; reported as abort-no-retry.
    Rollback,
}

/// Exclusive-owned per-worker transaction object. Reused across retries:
/// `reset` clears the sets and flags but keeps the plan and identity.
pub struct Transaction {
    pub coordinator_id: usize,
    pub partition_id: usize,
    pub id: u64,
    // position of this transaction within its epoch batch (aria)
    pub tid_offset: usize,
    pub epoch: u32,
    pub start_time: Instant,

    pub plan: Vec<Operation>,
    pub read_set: Vec<RWKey>,
    pub write_set: Vec<RWKey>,

    pub pending_responses: usize,
    pub network_size: usize,
    pub distributed: bool,

    pub abort_lock: bool,
    pub abort_read_validation: bool,
    pub abort_no_retry: bool,
    pub waw: bool,
    pub war: bool,
    pub raw: bool,

    pub commit_rts: u64,
    pub commit_wts: u64,
}

impl Transaction {
    pub fn new(coordinator_id: usize, partition_id: usize, id: u64) -> Self {
        Self {
            coordinator_id,
            partition_id,
            id,
            tid_offset: 0,
            epoch: 0,
            start_time: Instant::now(),
            plan: Vec::new(),
            read_set: Vec::new(),
            write_set: Vec::new(),
            pending_responses: 0,
            network_size: 0,
            distributed: false,
            abort_lock: false,
            abort_read_validation: false,
            abort_no_retry: false,
            waw: false,
            war: false,
            raw: false,
            commit_rts: 0,
            commit_wts: 0,
        }
    }

    pub fn reset(&mut self) {
        self.read_set.clear();
        self.write_set.clear();
        self.pending_responses = 0;
        self.network_size = 0;
        self.distributed = false;
        self.abort_lock = false;
        self.abort_read_validation = false;
        self.abort_no_retry = false;
        self.waw = false;
        self.war = false;
        self.raw = false;
        self.commit_rts = 0;
        self.commit_wts = 0;
    }

    pub fn search_for_read(&mut self, table_id: usize, partition_id: usize, key: u64) -> usize {
        let mut read_key = RWKey::new(table_id, partition_id, key);
        read_key.set_read_request_bit();
        self.add_to_read_set(read_key)
    }

    pub fn search_for_update(&mut self, table_id: usize, partition_id: usize, key: u64) -> usize {
        let mut read_key = RWKey::new(table_id, partition_id, key);
        read_key.set_read_request_bit();
        self.add_to_read_set(read_key)
    }

    pub fn search_local_index(&mut self, table_id: usize, partition_id: usize, key: u64) -> usize {
        let mut read_key = RWKey::new(table_id, partition_id, key);
        read_key.set_read_request_bit();
        read_key.set_local_index_read_bit();
        self.add_to_read_set(read_key)
    }

    pub fn update(
        &mut self,
        table_id: usize,
        partition_id: usize,
        key: u64,
        value: String,
    ) -> usize {
        let mut write_key = RWKey::new(table_id, partition_id, key);
        write_key.value = value;
        self.add_to_write_set(write_key)
    }

    /// Materialises the plan into the read and write sets. The actual read
    /// resolution (local search or remote request) is driven afterwards by
    /// the executor.
    pub fn execute(&mut self) -> TransactionResult {
        for i in 0..self.plan.len() {
            match self.plan[i].clone() {
                Operation::Read {
                    table_id,
                    partition_id,
                    key,
                } => {
                    self.search_for_read(table_id, partition_id, key);
                }
                Operation::LocalIndexRead {
                    table_id,
                    partition_id,
                    key,
                } => {
                    self.search_local_index(table_id, partition_id, key);
                }
                Operation::Update {
                    table_id,
                    partition_id,
                    key,
                    value,
                } => {
                    self.search_for_update(table_id, partition_id, key);
                    self.update(table_id, partition_id, key, value);
                }
                Operation::Rollback => {
                    self.abort_no_retry = true;
                    return TransactionResult::AbortNoRetry;
                }
            }
        }
        TransactionResult::ReadyToCommit
    }

    pub fn add_to_read_set(&mut self, key: RWKey) -> usize {
        self.read_set.push(key);
        self.read_set.len() - 1
    }

    pub fn add_to_write_set(&mut self, key: RWKey) -> usize {
        self.write_set.push(key);
        self.write_set.len() - 1
    }

    pub fn get_read_key(&self, table_id: usize, partition_id: usize, key: u64) -> Option<usize> {
        self.read_set
            .iter()
            .position(|k| k.table_id == table_id && k.partition_id == partition_id && k.key == key)
    }

    pub fn is_key_in_write_set(&self, table_id: usize, partition_id: usize, key: u64) -> bool {
        self.write_set
            .iter()
            .any(|k| k.table_id == table_id && k.partition_id == partition_id && k.key == key)
    }

    pub fn is_read_only(&self) -> bool {
        self.write_set.is_empty()
    }
}
