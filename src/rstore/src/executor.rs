use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use common::config::Context;
use common::percentile::Percentile;
use common::random::Random;
use common::worker_seed;
use crossbeam_queue::SegQueue;
use engine::partitioner::{Partitioner, RStoreCPartitioner, RStoreSPartitioner};
use engine::protocol::{process_inbound, Protocol};
use engine::transaction::Transaction;
use engine::worker::WorkerStats;
use engine::{ExecutorStatus, TransactionResult, Workload};
use message::{Mailbox, Message};
use storage::Database;
use tracing::info;

use crate::RStore;

/// Phase-driven worker: cross-partition transactions in the c-phase (only
/// coordinator 0 generates work, everyone else drains requests), then
/// single-partition transactions on all coordinators in the s-phase.
/// Committed transactions queue in `q` and drain for latency measurement at
/// the next phase boundary.
pub struct RStoreExecutor<W: Workload> {
    pub coordinator_id: usize,
    pub id: usize,
    context: Context,
    db: Arc<Database>,
    s_partitioner: Arc<RStoreSPartitioner>,
    c_partitioner: Arc<RStoreCPartitioner>,
    random: Random,
    worker_status: Arc<AtomicU32>,
    n_complete_workers: Arc<AtomicU32>,
    n_started_workers: Arc<AtomicU32>,
    workload: W,
    pub stats: Arc<WorkerStats>,
    latency: Percentile,
    mailbox: Mailbox,
    q: VecDeque<Transaction>,
}

impl<W: Workload> RStoreExecutor<W> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        coordinator_id: usize,
        id: usize,
        db: Arc<Database>,
        context: Context,
        worker_status: Arc<AtomicU32>,
        n_complete_workers: Arc<AtomicU32>,
        n_started_workers: Arc<AtomicU32>,
        workload: W,
        stats: Arc<WorkerStats>,
        in_queue: Arc<SegQueue<Message>>,
        out_queue: Arc<SegQueue<Message>>,
    ) -> Self {
        let mailbox = Mailbox::new(
            coordinator_id,
            id,
            context.coordinator_num,
            in_queue,
            out_queue,
        );
        Self {
            coordinator_id,
            id,
            s_partitioner: Arc::new(RStoreSPartitioner::new(
                coordinator_id,
                context.coordinator_num,
            )),
            c_partitioner: Arc::new(RStoreCPartitioner::new(
                coordinator_id,
                context.coordinator_num,
            )),
            random: Random::new(worker_seed(coordinator_id, id)),
            db,
            context,
            worker_status,
            n_complete_workers,
            n_started_workers,
            workload,
            stats,
            latency: Percentile::new(),
            mailbox,
            q: VecDeque::new(),
        }
    }

    fn status(&self) -> ExecutorStatus {
        ExecutorStatus::from_u32(self.worker_status.load(Ordering::Acquire))
    }

    pub fn start(&mut self) {
        info!("rstore executor {} starts", self.id);

        // c-phase to s-phase, to c-phase ...
        loop {
            loop {
                match self.status() {
                    ExecutorStatus::Exit => {
                        // commit transactions from the last s-phase
                        self.commit_transactions();
                        self.on_exit();
                        return;
                    }
                    ExecutorStatus::CPhase => break,
                    _ => std::thread::yield_now(),
                }
            }

            // commit transactions from the last s-phase
            self.commit_transactions();

            if self.coordinator_id == 0 {
                self.n_started_workers.fetch_add(1, Ordering::AcqRel);
                self.run_transactions(ExecutorStatus::CPhase);
                self.n_complete_workers.fetch_add(1, Ordering::AcqRel);
            } else {
                self.n_started_workers.fetch_add(1, Ordering::AcqRel);
                while self.status() != ExecutorStatus::Stop {
                    self.process_request();
                }
                // drain replication once more after all workers stopped
                self.process_request();
                self.n_complete_workers.fetch_add(1, Ordering::AcqRel);
            }

            while self.status() != ExecutorStatus::SPhase {
                std::thread::yield_now();
            }

            // commit transactions from the c-phase
            self.commit_transactions();

            self.n_started_workers.fetch_add(1, Ordering::AcqRel);
            self.run_transactions(ExecutorStatus::SPhase);
            self.n_complete_workers.fetch_add(1, Ordering::AcqRel);

            // once everyone stopped, process the replication requests
            while self.status() != ExecutorStatus::Stop {
                std::thread::yield_now();
            }
            self.process_request();
            self.n_complete_workers.fetch_add(1, Ordering::AcqRel);
        }
    }

    fn commit_transactions(&mut self) {
        while let Some(txn) = self.q.pop_front() {
            self.latency.add(txn.start_time.elapsed().as_micros() as u64);
        }
    }

    fn run_transactions(&mut self, phase: ExecutorStatus) {
        let (partition_id, partitioner, query_num, phase_context): (
            usize,
            Arc<dyn Partitioner>,
            usize,
            Context,
        ) = match phase {
            ExecutorStatus::CPhase => {
                assert_eq!(self.coordinator_id, 0);
                assert_eq!(self.context.partition_num % self.context.worker_num, 0);
                let partition_num_per_thread =
                    self.context.partition_num / self.context.worker_num;
                let partition_id = self.id * partition_num_per_thread
                    + self.random.uniform_dist(0, partition_num_per_thread as u64 - 1) as usize;
                (
                    partition_id,
                    self.c_partitioner.clone(),
                    self.context.c_phase_query_num,
                    self.context.clone(),
                )
            }
            ExecutorStatus::SPhase => {
                let partition_id = self.id * self.context.coordinator_num + self.coordinator_id;
                let mut phase_context = self.context.clone();
                // single-partition work never crosses
                phase_context.cross_ratio = 0;
                (
                    partition_id,
                    self.s_partitioner.clone(),
                    self.context.s_phase_query_num,
                    phase_context,
                )
            }
            _ => unreachable!("run_transactions in status {:?}", phase),
        };

        assert!(partitioner.has_master_partition(partition_id));

        let mut protocol = RStore::new(self.db.clone(), phase_context.clone(), partitioner);
        let mut transaction: Option<Transaction> = None;

        for i in 0..query_num {
            let mut retry_transaction = false;
            loop {
                self.process_request();
                let last_seed = self.random.get_seed();

                let mut txn = if retry_transaction {
                    let mut txn = transaction.take().expect("no transaction to retry");
                    txn.reset();
                    txn
                } else {
                    self.workload
                        .next_transaction(&phase_context, partition_id, &mut self.random)
                };

                let result = txn.execute();
                if result == TransactionResult::ReadyToCommit {
                    for k in (0..txn.read_set.len()).rev() {
                        if !txn.read_set[k].get_read_request_bit() {
                            break;
                        }
                        txn.read_set[k].clear_read_request_bit();
                        protocol.read_request(&mut txn, k, &mut self.mailbox);
                    }
                    if txn.abort_no_retry {
                        self.stats.n_abort_no_retry.fetch_add(1, Ordering::Relaxed);
                        transaction = Some(txn);
                        break;
                    }
                    if protocol.commit(&mut txn, &mut self.mailbox) {
                        self.stats.n_commit.fetch_add(1, Ordering::Relaxed);
                        self.stats
                            .n_network_size
                            .fetch_add(txn.network_size as u64, Ordering::Relaxed);
                        self.q.push_back(txn);
                        break;
                    }
                    self.stats.n_abort_lock.fetch_add(1, Ordering::Relaxed);
                    self.random.set_seed(last_seed);
                    transaction = Some(txn);
                    retry_transaction = true;
                } else {
                    self.stats.n_abort_no_retry.fetch_add(1, Ordering::Relaxed);
                    transaction = Some(txn);
                    break;
                }
            }

            if i % self.context.batch_flush == 0 {
                self.mailbox.flush_messages();
            }
        }
        self.mailbox.flush_messages();
    }

    pub fn process_request(&mut self) -> usize {
        // the drain path has no transaction in flight; rstore handlers
        // never touch one
        process_inbound(
            &self.db,
            &crate::message_handler::HANDLERS,
            &mut self.mailbox,
            None,
        )
    }

    fn on_exit(&mut self) {
        info!(
            "rstore executor {} exits, latency: {}us (50%) {}us (75%) {}us (95%) {}us (99%)",
            self.id,
            self.latency.nth(50.0),
            self.latency.nth(75.0),
            self.latency.nth(95.0),
            self.latency.nth(99.0)
        );
    }
}
