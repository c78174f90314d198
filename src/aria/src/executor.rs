use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use common::config::Context;
use common::percentile::Percentile;
use common::random::Random;
use common::worker_seed;
use engine::protocol::search_record;
use engine::tid;
use engine::transaction::Transaction;
use engine::worker::WorkerStats;
use engine::{ExecutorStatus, Workload};
use storage::Database;
use tracing::info;

use crate::fallback::{run_fallback, FallbackEntry};
use crate::{analyze_conflicts, commit_decision, commit_stamp, AriaState};

/// Epoch driver, run by the coordinator main thread: execution phase with
/// reservations, conflict analysis and in-place commits, then the sharded
/// fallback for whatever conflicted.
pub struct AriaManager {
    state: Arc<AriaState>,
    stop_flag: Arc<AtomicBool>,
    n_workers: u32,
}

impl AriaManager {
    pub fn new(state: Arc<AriaState>, stop_flag: Arc<AtomicBool>, n_workers: u32) -> Self {
        Self {
            state,
            stop_flag,
            n_workers,
        }
    }

    fn wait_complete(&self) {
        while self.state.n_complete_workers.load(Ordering::Acquire) < self.n_workers {
            std::thread::yield_now();
        }
    }

    fn enter(&self, status: ExecutorStatus) {
        self.state.n_complete_workers.store(0, Ordering::Release);
        self.state.status.store(status as u32, Ordering::Release);
    }

    pub fn start(&self) {
        info!("aria manager starts");
        loop {
            if self.stop_flag.load(Ordering::Relaxed) {
                self.state
                    .status
                    .store(ExecutorStatus::Exit as u32, Ordering::Release);
                break;
            }

            self.state.epoch.fetch_add(1, Ordering::AcqRel);
            self.state.fallback.write().clear();

            self.enter(ExecutorStatus::AriaRead);
            self.wait_complete();

            self.enter(ExecutorStatus::AriaCommit);
            self.wait_complete();

            // lock managers walk this in ascending tid order
            self.state.fallback.write().sort_by_key(|e| e.tid_offset);

            self.enter(ExecutorStatus::AriaFallback);
            self.wait_complete();
        }
        info!("aria manager exits");
    }
}

/// One aria worker. Batches run in lock step with every other worker on the
/// shared epoch barrier; aborted transactions are recycled into the next
/// epoch instead of retried in place.
pub struct AriaExecutor<W: Workload> {
    pub coordinator_id: usize,
    pub id: usize,
    context: Context,
    db: Arc<Database>,
    state: Arc<AriaState>,
    random: Random,
    workload: W,
    pub stats: Arc<WorkerStats>,
    latency: Percentile,
    recycled: VecDeque<Transaction>,
    batch: Vec<Transaction>,
}

impl<W: Workload> AriaExecutor<W> {
    pub fn new(
        coordinator_id: usize,
        id: usize,
        db: Arc<Database>,
        context: Context,
        state: Arc<AriaState>,
        workload: W,
        stats: Arc<WorkerStats>,
    ) -> Self {
        Self {
            coordinator_id,
            id,
            random: Random::new(worker_seed(coordinator_id, id)),
            db,
            context,
            state,
            workload,
            stats,
            latency: Percentile::new(),
            recycled: VecDeque::new(),
            batch: Vec::new(),
        }
    }

    fn status(&self) -> ExecutorStatus {
        ExecutorStatus::from_u32(self.state.status.load(Ordering::Acquire))
    }

    fn complete(&self) {
        self.state.n_complete_workers.fetch_add(1, Ordering::AcqRel);
    }

    fn batch_total(&self) -> usize {
        self.context.aria_batch_size * self.context.worker_num
    }

    pub fn start(&mut self) {
        info!("aria executor {} starts", self.id);
        loop {
            loop {
                match self.status() {
                    ExecutorStatus::Exit => {
                        self.on_exit();
                        return;
                    }
                    ExecutorStatus::AriaRead => break,
                    _ => std::thread::yield_now(),
                }
            }

            let epoch = self.state.epoch.load(Ordering::Acquire);
            self.read_phase(epoch);
            self.complete();
            while self.status() == ExecutorStatus::AriaRead {
                std::thread::yield_now();
            }

            // status is AriaCommit once every worker finished its reads
            self.commit_phase(epoch);
            self.complete();
            while self.status() == ExecutorStatus::AriaCommit {
                std::thread::yield_now();
            }

            // status is AriaFallback, the list is sorted
            self.fallback_phase(epoch);
            self.complete();
        }
    }

    /// Executes the batch speculatively against the epoch-start state and
    /// records read and write reservations.
    fn read_phase(&mut self, epoch: u32) {
        debug_assert!(self.batch.is_empty());
        for i in 0..self.context.aria_batch_size {
            let mut txn = match self.recycled.pop_front() {
                Some(mut txn) => {
                    txn.reset();
                    txn
                }
                None => {
                    let partition_id = self
                        .random
                        .uniform_dist(0, self.context.partition_num as u64 - 1)
                        as usize;
                    self.workload
                        .next_transaction(&self.context, partition_id, &mut self.random)
                }
            };
            txn.epoch = epoch;
            txn.tid_offset = i * self.context.worker_num + self.id;

            txn.execute();
            for k in (0..txn.read_set.len()).rev() {
                if !txn.read_set[k].get_read_request_bit() {
                    break;
                }
                txn.read_set[k].clear_read_request_bit();
                let (table_id, partition_id, key) = {
                    let read_key = &txn.read_set[k];
                    (read_key.table_id, read_key.partition_id, read_key.key)
                };
                let table = self.db.find_table(table_id, partition_id);
                match search_record(table, key) {
                    Some((tid_word, value)) => {
                        let read_key = &mut txn.read_set[k];
                        read_key.tid = tid_word;
                        read_key.value = value;
                        read_key.set_execution_processed_bit();
                    }
                    None => txn.abort_no_retry = true,
                }
            }

            if !txn.abort_no_retry {
                for read_key in &txn.read_set {
                    if read_key.get_local_index_read_bit() {
                        continue;
                    }
                    self.state.reservations.reserve_read(
                        read_key.table_id,
                        read_key.partition_id,
                        read_key.key,
                        epoch,
                        txn.tid_offset,
                    );
                }
                for write_key in &txn.write_set {
                    self.state.reservations.reserve_write(
                        write_key.table_id,
                        write_key.partition_id,
                        write_key.key,
                        epoch,
                        txn.tid_offset,
                    );
                }
            }
            self.batch.push(txn);
        }
    }

    /// Commits the conflict-free part of the batch in place; the rest goes
    /// to the fallback list or recycles into the next epoch.
    fn commit_phase(&mut self, epoch: u32) {
        let batch_total = self.batch_total();
        for mut txn in std::mem::take(&mut self.batch) {
            if txn.abort_no_retry {
                self.stats.n_abort_no_retry.fetch_add(1, Ordering::Relaxed);
                continue;
            }
            analyze_conflicts(&mut txn, &self.state.reservations, epoch);
            if commit_decision(&txn, self.context.aria_reordering) {
                let commit_wts = commit_stamp(epoch, txn.tid_offset, batch_total);
                txn.commit_wts = commit_wts;
                for write_key in &txn.write_set {
                    let table = self
                        .db
                        .find_table(write_key.table_id, write_key.partition_id);
                    let metadata = table
                        .search_metadata(write_key.key)
                        .expect("commit of a missing row");
                    tid::lock_wait(metadata);
                    table.update(write_key.key, write_key.value.clone());
                    tid::unlock_with_commit(metadata, commit_wts);
                }
                self.stats.n_commit.fetch_add(1, Ordering::Relaxed);
                self.latency.add(txn.start_time.elapsed().as_micros() as u64);
            } else if self.context.aria_fallback {
                self.state.fallback.write().push(FallbackEntry::new(txn));
            } else {
                if txn.waw {
                    self.stats.n_abort_lock.fetch_add(1, Ordering::Relaxed);
                } else {
                    self.stats
                        .n_abort_read_validation
                        .fetch_add(1, Ordering::Relaxed);
                }
                // no retry within the epoch
                self.recycled.push_back(txn);
            }
        }
    }

    fn fallback_phase(&mut self, epoch: u32) {
        if self.id >= self.context.n_lock_manager {
            return;
        }
        let batch_total = self.batch_total();
        let entries = self.state.fallback.read();
        let executed = run_fallback(
            &self.db,
            &entries,
            self.id,
            self.context.n_lock_manager,
            |tid_offset| commit_stamp(epoch, tid_offset, batch_total),
        );
        for txn in executed {
            self.stats.n_commit.fetch_add(1, Ordering::Relaxed);
            self.latency.add(txn.start_time.elapsed().as_micros() as u64);
        }
    }

    fn on_exit(&mut self) {
        info!(
            "aria executor {} exits, latency: {}us (50%) {}us (99%), {} samples",
            self.id,
            self.latency.nth(50.0),
            self.latency.nth(99.0),
            self.latency.size()
        );
    }
}
